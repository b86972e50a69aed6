//! Source fetcher contracts, page loaders, and the per-board parsers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobsight_core::{RawRecord, Source};
use jobsight_storage::{detect_challenge, FetchError, HttpFetcher, PageArchive};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

mod boards;

pub use boards::{
    absolutize, careerone_fetcher, fetcher_for_source, indeed_fetcher, jora_fetcher, parse_cards,
    parse_prosple, prosple_fetcher, seek_fetcher, slugify, workforce_au_fetcher, CardBoardFetcher,
    CardLayout, ProspleFetcher, CAREERONE_LAYOUT, INDEED_LAYOUT, JORA_LAYOUT, SEEK_LAYOUT,
    WORKFORCE_AU_LAYOUT,
};

pub const CRATE_NAME: &str = "jobsight-adapters";

/// Statuses that mean "no such results page" rather than a failure.
const NOT_FOUND_STATUSES: [u16; 2] = [404, 410];

/// One (query, location) search against a single board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub location: String,
    pub max_pages: u32,
}

/// Everything one board yielded for one search request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchOutcome {
    pub records: Vec<RawRecord>,
    pub pages_loaded: u32,
    pub parse_failures: u32,
    /// Set when the board started refusing us after some pages were read.
    pub blocked: Option<String>,
}

/// A results page whose markup did not match the board's expected layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct LayoutMismatch(pub String);

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{board} unavailable: {reason}")]
    SourceUnavailable { board: Source, reason: String },
    #[error("{board} page {page} did not match the expected layout: {reason}")]
    ParseFailure {
        board: Source,
        page: u32,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedPage {
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

/// Where result pages come from. `Ok(None)` means the page does not exist,
/// which ends pagination without counting as a failure.
#[async_trait]
pub trait PageLoader: Send + Sync {
    async fn load_page(
        &self,
        source: Source,
        page: u32,
        url: &str,
    ) -> Result<Option<LoadedPage>, FetchError>;
}

#[async_trait]
impl PageLoader for HttpFetcher {
    async fn load_page(
        &self,
        source: Source,
        _page: u32,
        url: &str,
    ) -> Result<Option<LoadedPage>, FetchError> {
        match self.fetch_page(source, url).await {
            Ok(page) => Ok(Some(LoadedPage {
                url: page.final_url,
                body: page.body,
                fetched_at: page.fetched_at,
            })),
            Err(FetchError::HttpStatus { status, .. }) if NOT_FOUND_STATUSES.contains(&status) => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

/// Replays saved result pages from `<root>/<source slug>/page<N>.html`.
/// A saved challenge page replays as a block.
#[derive(Debug, Clone)]
pub struct FixtureLoader {
    root: PathBuf,
}

impl FixtureLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn page_path(&self, source: Source, page: u32) -> PathBuf {
        self.root.join(source.slug()).join(format!("page{page}.html"))
    }
}

#[async_trait]
impl PageLoader for FixtureLoader {
    async fn load_page(
        &self,
        source: Source,
        page: u32,
        url: &str,
    ) -> Result<Option<LoadedPage>, FetchError> {
        let path = self.page_path(source, page);
        let body = match tokio::fs::read_to_string(&path).await {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(FetchError::Io {
                    path: path.display().to_string(),
                    source: err,
                })
            }
        };
        if let Some(challenge) = detect_challenge(&body) {
            return Err(FetchError::Blocked {
                url: url.to_string(),
                challenge: challenge.to_string(),
            });
        }
        Ok(Some(LoadedPage {
            url: url.to_string(),
            body,
            fetched_at: Utc::now(),
        }))
    }
}

/// Wraps another loader and keeps a raw copy of every page it serves.
/// Archive failures are logged and never fail the fetch.
pub struct ArchivingLoader {
    inner: Box<dyn PageLoader>,
    archive: PageArchive,
}

impl ArchivingLoader {
    pub fn new(inner: Box<dyn PageLoader>, archive: PageArchive) -> Self {
        Self { inner, archive }
    }
}

#[async_trait]
impl PageLoader for ArchivingLoader {
    async fn load_page(
        &self,
        source: Source,
        page: u32,
        url: &str,
    ) -> Result<Option<LoadedPage>, FetchError> {
        let loaded = self.inner.load_page(source, page, url).await?;
        if let Some(loaded) = &loaded {
            match self
                .archive
                .store_page(loaded.fetched_at, source, &loaded.body)
                .await
            {
                Ok(archived) => debug!(
                    source = source.slug(),
                    page,
                    path = %archived.relative_path.display(),
                    deduplicated = archived.deduplicated,
                    "archived page"
                ),
                Err(err) => warn!(source = source.slug(), page, error = %err, "page archive failed"),
            }
        }
        Ok(loaded)
    }
}

/// A job board: how to address its result pages and how to read them.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn source(&self) -> Source;

    fn page_url(&self, request: &SearchRequest, page: u32) -> String;

    fn parse_page(&self, html: &str) -> Result<Vec<RawRecord>, LayoutMismatch>;

    /// Walk result pages 1..=max_pages until a page is missing or empty.
    ///
    /// A board that refuses the first page is unavailable. A refusal later
    /// on keeps what was already read. Pages that fail to parse are
    /// skipped and counted.
    async fn fetch(
        &self,
        loader: &dyn PageLoader,
        request: &SearchRequest,
        page_delay: Duration,
    ) -> Result<FetchOutcome, AdapterError> {
        let source = self.source();
        let mut outcome = FetchOutcome::default();

        for page in 1..=request.max_pages {
            if page > 1 && !page_delay.is_zero() {
                tokio::time::sleep(page_delay).await;
            }
            let url = self.page_url(request, page);
            let loaded = match loader.load_page(source, page, &url).await {
                Ok(Some(loaded)) => loaded,
                Ok(None) => {
                    debug!(source = source.slug(), page, "no further result pages");
                    break;
                }
                Err(err) if outcome.pages_loaded == 0 => {
                    return Err(AdapterError::SourceUnavailable {
                        board: source,
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    warn!(source = source.slug(), page, error = %err, "stopping pagination");
                    if err.is_unavailable() {
                        outcome.blocked = Some(err.to_string());
                    }
                    break;
                }
            };
            outcome.pages_loaded += 1;

            match self.parse_page(&loaded.body) {
                Ok(records) if records.is_empty() => {
                    debug!(source = source.slug(), page, "empty result page");
                    break;
                }
                Ok(records) => {
                    debug!(source = source.slug(), page, records = records.len(), "parsed page");
                    outcome.records.extend(records);
                }
                Err(mismatch) => {
                    outcome.parse_failures += 1;
                    let err = AdapterError::ParseFailure {
                        board: source,
                        page,
                        reason: mismatch.0,
                    };
                    warn!(error = %err, url = %loaded.url, "skipping page");
                }
            }
        }

        Ok(outcome)
    }
}

/// Fetchers keyed by board. Built-ins cover every [`Source`]; `register`
/// swaps one out, which is how tests inject stubs.
pub struct FetcherRegistry {
    fetchers: BTreeMap<Source, Box<dyn SourceFetcher>>,
}

impl FetcherRegistry {
    pub fn empty() -> Self {
        Self {
            fetchers: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for source in Source::ALL {
            registry.register(fetcher_for_source(source));
        }
        registry
    }

    pub fn register(&mut self, fetcher: Box<dyn SourceFetcher>) -> Option<Box<dyn SourceFetcher>> {
        self.fetchers.insert(fetcher.source(), fetcher)
    }

    pub fn get(&self, source: Source) -> Option<&dyn SourceFetcher> {
        self.fetchers.get(&source).map(|f| f.as_ref())
    }

    pub fn sources(&self) -> impl Iterator<Item = Source> + '_ {
        self.fetchers.keys().copied()
    }
}

impl Default for FetcherRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
