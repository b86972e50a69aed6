//! Merged posting store, raw page archive and HTTP page loading for jobsight.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use chrono::{DateTime, Utc};
use jobsight_core::{Posting, Source};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobsight-storage";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0 Safari/537.36";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` next to `dest` under a unique temp name, then rename over
/// `dest`. Readers see either the old file or the new one, never a partial.
pub async fn write_atomic(dest: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, dest).await
    }
    .await;

    if written.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    written
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("merged store {path} could not be read: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("merged store {path} could not be written: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// The persisted, deduplicated table of postings (one CSV file).
#[derive(Debug, Clone)]
pub struct MergedStore {
    path: PathBuf,
}

impl MergedStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every stored posting. A missing file is an empty store; a file
    /// that exists but does not parse is an error, so callers never
    /// overwrite data they could not read.
    pub async fn load(&self) -> Result<Vec<Posting>, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(StoreError::Unreadable {
                    path: self.path.clone(),
                    source: err.into(),
                })
            }
        };
        decode_postings(&bytes).map_err(|source| StoreError::Unreadable {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the file with `postings`, atomically.
    pub async fn save(&self, postings: &[Posting]) -> Result<(), StoreError> {
        let bytes = encode_postings(postings).map_err(|source| StoreError::WriteFailure {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|err| StoreError::WriteFailure {
                path: self.path.clone(),
                source: err.into(),
            })?;
        debug!(path = %self.path.display(), rows = postings.len(), "merged store saved");
        Ok(())
    }

    /// Modification time and size of the store file, if it exists.
    pub async fn stamp(&self) -> Option<StoreStamp> {
        let meta = fs::metadata(&self.path).await.ok()?;
        Some(StoreStamp {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

/// Identifies one written version of the store file. Size is part of the
/// key because mtime granularity can be coarser than back-to-back saves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStamp {
    pub modified: Option<SystemTime>,
    pub len: u64,
}

pub fn encode_postings(postings: &[Posting]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(jobsight_core::STORE_COLUMNS)
        .context("writing store header")?;
    for posting in postings {
        writer.serialize(posting).context("encoding posting row")?;
    }
    writer.into_inner().context("flushing csv buffer")
}

pub fn decode_postings(bytes: &[u8]) -> anyhow::Result<Vec<Posting>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let mut out = Vec::new();
    for (idx, row) in reader.deserialize::<Posting>().enumerate() {
        out.push(row.with_context(|| format!("decoding store row {}", idx + 1))?);
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw result pages, kept for auditing parser
/// changes against what a board actually served.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source: Source,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(source.slug())
            .join(format!("{content_hash}.html"))
    }

    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        source: Source,
        body: &str,
    ) -> anyhow::Result<ArchivedPage> {
        let bytes = body.as_bytes();
        let content_hash = sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, source, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes)
                .await
                .with_context(|| format!("archiving page {}", absolute_path.display()))?;
        }

        Ok(ArchivedPage {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    Challenge,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::FORBIDDEN {
        RetryDisposition::Challenge
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    // Body and decode errors come from a connection dropped or timed out
    // mid-response.
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Markers of interstitial bot-check pages served in place of results.
const CHALLENGE_MARKERS: &[(&str, &str)] = &[
    ("/cdn-cgi/challenge-platform", "cloudflare challenge"),
    ("cf-chl-", "cloudflare challenge"),
    ("<title>just a moment...</title>", "cloudflare interstitial"),
    ("px-captcha", "perimeterx captcha"),
    ("captcha-delivery.com", "datadome captcha"),
    ("_incapsula_resource", "incapsula block"),
    ("<title>access denied</title>", "access denied page"),
];

/// Name the bot-check a body carries, if any.
pub fn detect_challenge(body: &str) -> Option<&'static str> {
    let lower = body.to_ascii_lowercase();
    CHALLENGE_MARKERS
        .iter()
        .find(|(marker, _)| lower.contains(marker))
        .map(|(_, name)| *name)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Bot checks get at least `challenge_wait` before the next attempt.
    pub fn challenge_delay(&self, attempt_index: usize, challenge_wait: Duration) -> Duration {
        self.delay_for_attempt(attempt_index).max(challenge_wait)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub accept_language: String,
    pub backoff: BackoffPolicy,
    pub challenge_wait: Duration,
    /// Honour HTTP_PROXY / HTTPS_PROXY from the environment.
    pub system_proxy: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(25),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_language: "en-AU,en;q=0.9".to_string(),
            backoff: BackoffPolicy::default(),
            challenge_wait: Duration::from_secs(2),
            system_proxy: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("blocked by {challenge} at {url}")]
    Blocked { url: String, challenge: String },
    #[error("reading page {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// Blocks and exhausted transient failures mean the board is not
    /// serving us right now; anything else is specific to one page.
    pub fn is_unavailable(&self) -> bool {
        match self {
            FetchError::Blocked { .. } | FetchError::Io { .. } => true,
            FetchError::Request(err) => {
                classify_reqwest_error(err) == RetryDisposition::Retryable
            }
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) != RetryDisposition::NonRetryable)
                .unwrap_or(false),
        }
    }
}

/// Browser-like HTTP client with bounded retries for job board pages.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    challenge_wait: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&config.accept_language).context("invalid accept-language")?,
        );

        let mut builder = reqwest::Client::builder();
        if !config.system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
            challenge_wait: config.challenge_wait,
        })
    }

    pub async fn fetch_page(&self, source: Source, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", source = source.slug(), url);
        self.fetch_page_with_retries(url).instrument(span).await
    }

    async fn fetch_page_with_retries(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let max_retries = self.backoff.max_retries;
        let mut attempt = 0usize;

        loop {
            let (disposition, failure) = match self.attempt(url).await {
                Ok(page) => return Ok(page),
                Err(failed) => failed,
            };

            if disposition == RetryDisposition::NonRetryable || attempt >= max_retries {
                return Err(failure);
            }

            let wait = match disposition {
                RetryDisposition::Challenge => {
                    self.backoff.challenge_delay(attempt, self.challenge_wait)
                }
                _ => self.backoff.delay_for_attempt(attempt),
            };
            warn!(attempt, wait_ms = wait.as_millis() as u64, error = %failure, "retrying page fetch");
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    /// One request, body included. Failures carry how the retry loop should
    /// treat them.
    async fn attempt(&self, url: &str) -> Result<FetchedPage, (RetryDisposition, FetchError)> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| (classify_reqwest_error(&err), FetchError::Request(err)))?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp
            .text()
            .await
            .map_err(|err| (classify_reqwest_error(&err), FetchError::Request(err)))?;

        if let Some(name) = detect_challenge(&body) {
            return Err((
                RetryDisposition::Challenge,
                FetchError::Blocked {
                    url: final_url,
                    challenge: name.to_string(),
                },
            ));
        }
        if status.is_success() {
            debug!(status = status.as_u16(), bytes = body.len(), "page fetched");
            return Ok(FetchedPage {
                final_url,
                body,
                fetched_at: Utc::now(),
            });
        }

        let disposition = classify_status(status);
        let failure = if disposition == RetryDisposition::Challenge {
            FetchError::Blocked {
                url: final_url,
                challenge: format!("http {}", status.as_u16()),
            }
        } else {
            FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            }
        };
        Err((disposition, failure))
    }
}
