//! Fetch orchestration: plan, normalize, dedupe, persist, report.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use jobsight_adapters::{
    ArchivingLoader, FetcherRegistry, PageLoader, SearchRequest,
};
use jobsight_core::{collapse_whitespace, infer_role_category, Posting, RawRecord, Source};
use jobsight_storage::{
    sha256_hex, write_atomic, BackoffPolicy, HttpClientConfig, HttpFetcher, MergedStore,
    PageArchive, DEFAULT_USER_AGENT,
};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobsight-sync";

pub const DEFAULT_LOCATION: &str = "Australia";
pub const DEFAULT_MAX_PAGES: u32 = 3;
pub const PLAN_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub store_path: PathBuf,
    /// `None` disables run reports.
    pub reports_dir: Option<PathBuf>,
    /// `None` disables the raw page archive.
    pub archive_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub page_delay: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("data/jobs_merged.csv"),
            reports_dir: Some(PathBuf::from("reports")),
            archive_dir: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 25,
            max_retries: BackoffPolicy::default().max_retries,
            page_delay: Duration::from_millis(1000),
        }
    }
}

impl FetchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let path_var = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        };
        Self {
            store_path: path_var("JOBSIGHT_STORE_PATH").unwrap_or(defaults.store_path),
            reports_dir: match std::env::var("JOBSIGHT_REPORTS_DIR") {
                Ok(v) if matches!(v.trim(), "" | "off" | "none") => None,
                Ok(v) => Some(PathBuf::from(v)),
                Err(_) => defaults.reports_dir,
            },
            archive_dir: path_var("JOBSIGHT_ARCHIVE_DIR"),
            user_agent: std::env::var("JOBSIGHT_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("JOBSIGHT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            max_retries: std::env::var("JOBSIGHT_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            page_delay: std::env::var("JOBSIGHT_PAGE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.page_delay),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        }
    }
}

/// One (source, query) pair the orchestrator will fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub source: Source,
    pub query: String,
    pub location: String,
    pub max_pages: u32,
}

impl PlanEntry {
    pub fn request(&self) -> SearchRequest {
        SearchRequest {
            query: self.query.clone(),
            location: self.location.clone(),
            max_pages: self.max_pages,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchPlan {
    pub entries: Vec<PlanEntry>,
}

#[derive(Debug, Deserialize)]
struct PlanFile {
    version: u32,
    #[serde(default)]
    defaults: PlanDefaults,
    #[serde(default)]
    entries: Vec<PlanFileEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct PlanDefaults {
    location: Option<String>,
    max_pages: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PlanFileEntry {
    source: Source,
    query: String,
    location: Option<String>,
    max_pages: Option<u32>,
}

impl FetchPlan {
    /// Every source against every query, source-major.
    pub fn cross(sources: &[Source], queries: &[String], location: &str, max_pages: u32) -> Self {
        let entries = sources
            .iter()
            .flat_map(|source| {
                queries.iter().map(move |query| PlanEntry {
                    source: *source,
                    query: query.clone(),
                    location: location.to_string(),
                    max_pages,
                })
            })
            .collect();
        Self { entries }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: PlanFile = serde_yaml::from_str(text).context("parsing fetch plan")?;
        ensure!(
            file.version == PLAN_VERSION,
            "unsupported fetch plan version {} (expected {PLAN_VERSION})",
            file.version
        );
        let location = file
            .defaults
            .location
            .unwrap_or_else(|| DEFAULT_LOCATION.to_string());
        let max_pages = file.defaults.max_pages.unwrap_or(DEFAULT_MAX_PAGES);
        let entries = file
            .entries
            .into_iter()
            .map(|e| PlanEntry {
                source: e.source,
                query: e.query,
                location: e.location.unwrap_or_else(|| location.clone()),
                max_pages: e.max_pages.unwrap_or(max_pages),
            })
            .collect::<Vec<_>>();
        if let Some(entry) = entries.iter().find(|e| e.max_pages == 0) {
            bail!("plan entry {}/{} has max_pages 0", entry.source, entry.query);
        }
        Ok(Self { entries })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Keep only entries for the given sources; an empty filter keeps all.
    pub fn restrict_to(mut self, sources: &[Source]) -> Self {
        if !sources.is_empty() {
            self.entries.retain(|e| sources.contains(&e.source));
        }
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("malformed {board} record: {reason}")]
    MalformedRecord { board: Source, reason: String },
}

fn clean(value: Option<&str>) -> Option<String> {
    value.map(collapse_whitespace).filter(|v| !v.is_empty())
}

/// Map a raw card into the store schema. Title and an absolute http(s)
/// url are required; everything else has a default.
pub fn normalize(
    raw: &RawRecord,
    source: Source,
    query: Option<&str>,
    fetched_at: DateTime<Utc>,
) -> Result<Posting, NormalizeError> {
    let malformed = |reason: &str| NormalizeError::MalformedRecord {
        board: source,
        reason: reason.to_string(),
    };

    let title = clean(raw.title.as_deref()).ok_or_else(|| malformed("missing title"))?;
    let url = raw
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| malformed("missing url"))?;
    let parsed = Url::parse(url).map_err(|e| malformed(&format!("invalid url {url:?}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") || !parsed.has_host() {
        return Err(malformed(&format!("url {url:?} is not absolute http(s)")));
    }

    let query = clean(query);
    Ok(Posting {
        source,
        role_category: infer_role_category(query.as_deref(), &title),
        title,
        company: clean(raw.company.as_deref()).unwrap_or_default(),
        location: clean(raw.location.as_deref()).unwrap_or_default(),
        posted_at: clean(raw.posted_at.as_deref()),
        description: clean(raw.description.as_deref()),
        url: parsed.to_string(),
        query,
        fetched_at,
    })
}

/// Content identity of a posting: SHA-256 over normalized
/// `title|company|location`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn fingerprint_part(value: &str) -> String {
    collapse_whitespace(&value.to_lowercase())
}

pub fn fingerprint_of(title: &str, company: &str, location: &str) -> Fingerprint {
    let key = format!(
        "{}|{}|{}",
        fingerprint_part(title),
        fingerprint_part(company),
        fingerprint_part(location)
    );
    Fingerprint(sha256_hex(key.as_bytes()))
}

pub fn fingerprint(posting: &Posting) -> Fingerprint {
    fingerprint_of(&posting.title, &posting.company, &posting.location)
}

/// Fingerprints already accepted into the store or the current run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeenSet {
    fingerprints: HashSet<Fingerprint>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_postings<'a>(postings: impl IntoIterator<Item = &'a Posting>) -> Self {
        Self {
            fingerprints: postings.into_iter().map(fingerprint).collect(),
        }
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.fingerprints.contains(fp)
    }

    /// Returns false when the fingerprint was already present.
    pub fn insert(&mut self, fp: Fingerprint) -> bool {
        self.fingerprints.insert(fp)
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

pub fn is_duplicate(posting: &Posting, seen: &SeenSet) -> bool {
    seen.contains(&fingerprint(posting))
}

/// Keep the first posting per fingerprint. Returns the survivors in input
/// order, the updated seen-set and how many were dropped.
pub fn dedupe(batch: Vec<Posting>, mut seen: SeenSet) -> (Vec<Posting>, SeenSet, usize) {
    let mut dropped = 0usize;
    let mut survivors = Vec::with_capacity(batch.len());
    for posting in batch {
        if seen.insert(fingerprint(&posting)) {
            survivors.push(posting);
        } else {
            dropped += 1;
        }
    }
    (survivors, seen, dropped)
}

/// Per-board counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStats {
    pub pairs: usize,
    pub failed_pairs: usize,
    pub blocked_pairs: usize,
    pub pages: u32,
    pub fetched: usize,
    pub new: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub parse_failures: u32,
}

impl SourceStats {
    /// Every pair for this board failed outright.
    pub fn failed(&self) -> bool {
        self.pairs > 0 && self.failed_pairs == self.pairs
    }

    fn absorb(&mut self, other: &SourceStats) {
        self.pairs += other.pairs;
        self.failed_pairs += other.failed_pairs;
        self.blocked_pairs += other.blocked_pairs;
        self.pages += other.pages;
        self.fetched += other.fetched;
        self.new += other.new;
        self.duplicates += other.duplicates;
        self.malformed += other.malformed;
        self.parse_failures += other.parse_failures;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub store_path: String,
    pub existing_postings: usize,
    pub total_postings: usize,
    pub per_source: BTreeMap<Source, SourceStats>,
    pub failed_sources: usize,
    pub reports_dir: Option<String>,
    pub parquet_manifest: Option<String>,
}

impl FetchRunSummary {
    pub fn totals(&self) -> SourceStats {
        let mut totals = SourceStats::default();
        for stats in self.per_source.values() {
            totals.absorb(stats);
        }
        totals
    }

    pub fn to_markdown(&self) -> String {
        let totals = self.totals();
        let rows = self
            .per_source
            .iter()
            .map(|(source, s)| {
                format!(
                    "| {} | {} | {} | {} | {} | {} | {} | {} |",
                    source.display_name(),
                    s.pairs,
                    s.fetched,
                    s.new,
                    s.duplicates,
                    s.malformed,
                    s.parse_failures,
                    s.failed_pairs
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "# Jobsight Fetch Run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Store: `{}`\n- Postings before: {}\n- Postings after: {}\n- New postings: {}\n- Failed sources: {}\n\n## Sources\n\n| Source | Pairs | Fetched | New | Duplicates | Malformed | Parse failures | Failed pairs |\n|---|---|---|---|---|---|---|---|\n{}\n",
            self.run_id,
            self.started_at,
            self.finished_at,
            self.store_path,
            self.existing_postings,
            self.total_postings,
            totals.new,
            self.failed_sources,
            rows
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Drives every plan entry through its board's fetcher, then merges the
/// survivors into the store in one atomic write.
pub struct FetchPipeline {
    config: FetchConfig,
    registry: FetcherRegistry,
    loader: Box<dyn PageLoader>,
    store: MergedStore,
}

impl FetchPipeline {
    /// Live pipeline over HTTP.
    pub fn new(config: FetchConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self::with_loader(config, Box::new(http)))
    }

    /// Pipeline over any page loader, e.g. fixture replay.
    pub fn with_loader(config: FetchConfig, loader: Box<dyn PageLoader>) -> Self {
        let loader: Box<dyn PageLoader> = match &config.archive_dir {
            Some(dir) => Box::new(ArchivingLoader::new(loader, PageArchive::new(dir.clone()))),
            None => loader,
        };
        Self {
            store: MergedStore::new(config.store_path.clone()),
            registry: FetcherRegistry::builtin(),
            config,
            loader,
        }
    }

    pub fn with_registry(mut self, registry: FetcherRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub async fn run_once(&self, plan: &FetchPlan) -> Result<FetchRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("fetch_run", %run_id, entries = plan.len());
        self.run_inner(run_id, plan).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, plan: &FetchPlan) -> Result<FetchRunSummary> {
        let started_at = Utc::now();
        let mut merged = self.store.load().await?;
        let existing_postings = merged.len();
        let mut seen = SeenSet::from_postings(&merged);
        let mut per_source: BTreeMap<Source, SourceStats> = BTreeMap::new();

        info!(existing = existing_postings, store = %self.store.path().display(), "starting fetch run");

        for entry in &plan.entries {
            let stats = per_source.entry(entry.source).or_default();
            stats.pairs += 1;

            let Some(fetcher) = self.registry.get(entry.source) else {
                warn!(source = entry.source.slug(), "no fetcher registered");
                stats.failed_pairs += 1;
                continue;
            };

            let outcome = match fetcher
                .fetch(self.loader.as_ref(), &entry.request(), self.config.page_delay)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(
                        source = entry.source.slug(),
                        query = %entry.query,
                        error = %err,
                        "skipping source/query pair"
                    );
                    stats.failed_pairs += 1;
                    continue;
                }
            };

            stats.pages += outcome.pages_loaded;
            stats.parse_failures += outcome.parse_failures;
            stats.fetched += outcome.records.len();
            if outcome.blocked.is_some() {
                stats.blocked_pairs += 1;
            }

            let fetched_at = Utc::now();
            let mut batch = Vec::with_capacity(outcome.records.len());
            for raw in &outcome.records {
                match normalize(raw, entry.source, Some(&entry.query), fetched_at) {
                    Ok(posting) => batch.push(posting),
                    Err(err) => {
                        debug!(error = %err, "dropping record");
                        stats.malformed += 1;
                    }
                }
            }

            let (survivors, next_seen, dropped) = dedupe(batch, seen);
            seen = next_seen;
            stats.duplicates += dropped;
            stats.new += survivors.len();
            info!(
                source = entry.source.slug(),
                query = %entry.query,
                fetched = outcome.records.len(),
                new = survivors.len(),
                duplicates = dropped,
                "pair complete"
            );
            merged.extend(survivors);
        }

        self.store.save(&merged).await?;

        let failed_sources = per_source.values().filter(|s| s.failed()).count();
        let mut summary = FetchRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            store_path: self.store.path().display().to_string(),
            existing_postings,
            total_postings: merged.len(),
            per_source,
            failed_sources,
            reports_dir: None,
            parquet_manifest: None,
        };

        if let Some(reports_root) = &self.config.reports_dir {
            match write_run_reports(reports_root, &summary, &merged).await {
                Ok((dir, manifest)) => {
                    summary.reports_dir = Some(dir.display().to_string());
                    summary.parquet_manifest = Some(manifest.display().to_string());
                }
                Err(err) => warn!(error = %format!("{err:#}"), "run report not written"),
            }
        }

        info!(
            total = summary.total_postings,
            new = summary.totals().new,
            failed_sources = summary.failed_sources,
            "fetch run finished"
        );
        Ok(summary)
    }
}

/// Write `reports/<run_id>/` with the json + markdown summary and a
/// parquet snapshot of the store. Returns the run dir and manifest path.
pub async fn write_run_reports(
    reports_root: &Path,
    summary: &FetchRunSummary,
    postings: &[Posting],
) -> Result<(PathBuf, PathBuf)> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    tokio::fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    write_atomic(&run_dir.join("run_summary.json"), &json)
        .await
        .context("writing run_summary.json")?;
    write_atomic(&run_dir.join("run_summary.md"), summary.to_markdown().as_bytes())
        .await
        .context("writing run_summary.md")?;

    let manifest = export_parquet_snapshots(&run_dir, summary, postings).await?;
    Ok((run_dir, manifest))
}

async fn export_parquet_snapshots(
    run_dir: &Path,
    summary: &FetchRunSummary,
    postings: &[Posting],
) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    tokio::fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let postings_path = snapshot_dir.join("postings.parquet");
    let sources_path = snapshot_dir.join("source_stats.parquet");
    write_postings_parquet(&postings_path, postings)?;
    write_source_stats_parquet(&sources_path, &summary.per_source)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("postings", run_dir, &postings_path)?,
            manifest_entry("source_stats", run_dir, &sources_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    write_atomic(&manifest_path, &bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_postings_parquet(path: &Path, postings: &[Posting]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("fingerprint", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("company", DataType::Utf8, false),
        ArrowField::new("location", DataType::Utf8, false),
        ArrowField::new("posted_at", DataType::Utf8, true),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("role_category", DataType::Utf8, false),
        ArrowField::new("query", DataType::Utf8, true),
        ArrowField::new("fetched_at", DataType::Utf8, false),
    ]));

    let fingerprints = StringArray::from(
        postings
            .iter()
            .map(|p| Some(fingerprint(p).to_string()))
            .collect::<Vec<_>>(),
    );
    let sources = StringArray::from(postings.iter().map(|p| Some(p.source.slug())).collect::<Vec<_>>());
    let titles = StringArray::from(postings.iter().map(|p| Some(p.title.as_str())).collect::<Vec<_>>());
    let companies = StringArray::from(postings.iter().map(|p| Some(p.company.as_str())).collect::<Vec<_>>());
    let locations = StringArray::from(postings.iter().map(|p| Some(p.location.as_str())).collect::<Vec<_>>());
    let posted = StringArray::from(postings.iter().map(|p| p.posted_at.as_deref()).collect::<Vec<_>>());
    let urls = StringArray::from(postings.iter().map(|p| Some(p.url.as_str())).collect::<Vec<_>>());
    let roles = StringArray::from(
        postings
            .iter()
            .map(|p| Some(p.role_category.label()))
            .collect::<Vec<_>>(),
    );
    let queries = StringArray::from(postings.iter().map(|p| p.query.as_deref()).collect::<Vec<_>>());
    let fetched_at = StringArray::from(
        postings
            .iter()
            .map(|p| Some(p.fetched_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(fingerprints),
            Arc::new(sources),
            Arc::new(titles),
            Arc::new(companies),
            Arc::new(locations),
            Arc::new(posted),
            Arc::new(urls),
            Arc::new(roles),
            Arc::new(queries),
            Arc::new(fetched_at),
        ],
    )
    .context("building postings record batch")?;
    write_parquet(path, batch)
}

fn write_source_stats_parquet(path: &Path, per_source: &BTreeMap<Source, SourceStats>) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("pairs", DataType::UInt64, false),
        ArrowField::new("failed_pairs", DataType::UInt64, false),
        ArrowField::new("pages", DataType::UInt32, false),
        ArrowField::new("fetched", DataType::UInt64, false),
        ArrowField::new("new", DataType::UInt64, false),
        ArrowField::new("duplicates", DataType::UInt64, false),
        ArrowField::new("malformed", DataType::UInt64, false),
        ArrowField::new("parse_failures", DataType::UInt32, false),
    ]));

    let rows = per_source.iter().collect::<Vec<_>>();
    let count = |f: fn(&SourceStats) -> usize| {
        UInt64Array::from(rows.iter().map(|(_, s)| f(s) as u64).collect::<Vec<_>>())
    };
    let sources = StringArray::from(rows.iter().map(|(src, _)| Some(src.slug())).collect::<Vec<_>>());
    let pages = UInt32Array::from(rows.iter().map(|(_, s)| s.pages).collect::<Vec<_>>());
    let parse_failures = UInt32Array::from(rows.iter().map(|(_, s)| s.parse_failures).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(sources),
            Arc::new(count(|s| s.pairs)),
            Arc::new(count(|s| s.failed_pairs)),
            Arc::new(pages),
            Arc::new(count(|s| s.fetched)),
            Arc::new(count(|s| s.new)),
            Arc::new(count(|s| s.duplicates)),
            Arc::new(count(|s| s.malformed)),
            Arc::new(parse_failures),
        ],
    )
    .context("building source_stats record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobsight_adapters::FixtureLoader;
    use jobsight_core::RoleCategory;
    use jobsight_storage::StoreError;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).single().unwrap()
    }

    fn raw(title: &str, company: &str, location: &str, url: &str) -> RawRecord {
        RawRecord {
            title: Some(title.to_string()),
            company: Some(company.to_string()),
            location: Some(location.to_string()),
            url: Some(url.to_string()),
            ..RawRecord::default()
        }
    }

    fn posting(title: &str, company: &str, location: &str) -> Posting {
        normalize(
            &raw(title, company, location, "https://example.com/job/1"),
            Source::Jora,
            None,
            at(),
        )
        .unwrap()
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture_config(tmp: &Path) -> FetchConfig {
        FetchConfig {
            store_path: tmp.join("data").join("jobs_merged.csv"),
            reports_dir: Some(tmp.join("reports")),
            archive_dir: None,
            page_delay: Duration::ZERO,
            ..FetchConfig::default()
        }
    }

    fn fixture_pipeline(tmp: &Path) -> FetchPipeline {
        FetchPipeline::with_loader(
            fixture_config(tmp),
            Box::new(FixtureLoader::new(workspace_root().join("fixtures"))),
        )
    }

    fn fixture_plan() -> FetchPlan {
        FetchPlan::cross(
            &Source::ALL,
            &["data analyst".to_string(), "software engineer".to_string()],
            "Sydney NSW",
            3,
        )
    }

    #[test]
    fn normalize_collapses_whitespace_and_fills_defaults() {
        let record = RawRecord {
            title: Some("  Senior   Data\nEngineer ".to_string()),
            url: Some(" https://au.jora.com/job/1 ".to_string()),
            ..RawRecord::default()
        };
        let posting = normalize(&record, Source::Jora, Some("data engineer"), at()).unwrap();
        assert_eq!(posting.title, "Senior Data Engineer");
        assert_eq!(posting.company, "");
        assert_eq!(posting.location, "");
        assert_eq!(posting.posted_at, None);
        assert_eq!(posting.url, "https://au.jora.com/job/1");
        assert_eq!(posting.role_category, RoleCategory::DataEngineering);
        assert_eq!(posting.query.as_deref(), Some("data engineer"));
    }

    #[test]
    fn normalize_rejects_missing_title_and_bad_urls() {
        let cases = [
            raw("   ", "Acme", "Perth WA", "https://example.com/1"),
            raw("Analyst", "Acme", "Perth WA", "/job/relative"),
            raw("Analyst", "Acme", "Perth WA", "ftp://example.com/1"),
            raw("Analyst", "Acme", "Perth WA", ""),
        ];
        for case in cases {
            let err = normalize(&case, Source::Careerone, None, at()).unwrap_err();
            assert!(matches!(
                err,
                NormalizeError::MalformedRecord { board: Source::Careerone, .. }
            ));
        }
    }

    #[test]
    fn role_category_falls_back_to_title_then_other() {
        let with_unknown_query = normalize(
            &raw("Cloud Platform Lead", "Acme", "Perth", "https://example.com/1"),
            Source::Seek,
            Some("platform"),
            at(),
        )
        .unwrap();
        assert_eq!(with_unknown_query.role_category, RoleCategory::DevOpsInfrastructure);

        let nothing_matches = normalize(
            &raw("Barista", "Cafe", "Perth", "https://example.com/2"),
            Source::Seek,
            Some("hospitality"),
            at(),
        )
        .unwrap();
        assert_eq!(nothing_matches.role_category, RoleCategory::Other);

        let no_query = normalize(
            &raw("Barista", "Cafe", "Perth", "https://example.com/3"),
            Source::Seek,
            None,
            at(),
        )
        .unwrap();
        assert_eq!(no_query.role_category, RoleCategory::Unspecified);
    }

    #[test]
    fn fingerprint_ignores_case_and_whitespace() {
        let a = posting("Software Engineer", "Acme", "Melbourne VIC");
        let b = posting("software engineer", "ACME", "melbourne vic");
        let c = posting("  Software  Engineer ", "Acme ", "Melbourne   VIC");
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a), fingerprint(&c));
        assert_ne!(fingerprint(&a), fingerprint(&posting("Software Engineer", "Acme", "Sydney NSW")));
        assert_eq!(fingerprint(&a).as_str().len(), 64);
    }

    #[test]
    fn dedupe_keeps_first_occurrence_and_threads_seen_set() {
        let seen = SeenSet::from_postings(&[posting("Data Analyst", "CBA", "Sydney")]);
        let batch = vec![
            posting("data analyst", "cba", "sydney"),
            posting("QA Tester", "Tyro", "Sydney"),
            posting("qa tester", "TYRO", "SYDNEY"),
            posting("DevOps Engineer", "Xero", "Melbourne"),
        ];
        let (survivors, seen, dropped) = dedupe(batch, seen);
        assert_eq!(dropped, 2);
        assert_eq!(
            survivors.iter().map(|p| p.title.as_str()).collect::<Vec<_>>(),
            vec!["QA Tester", "DevOps Engineer"]
        );
        assert_eq!(seen.len(), 3);
        assert!(is_duplicate(&posting("devops engineer", "xero", "melbourne"), &seen));
        assert!(!is_duplicate(&posting("DevOps Engineer", "Xero", "Hobart"), &seen));
    }

    #[test]
    fn cross_plan_is_source_major() {
        let plan = FetchPlan::cross(
            &[Source::Prosple, Source::Jora],
            &["data".to_string(), "qa".to_string()],
            "Australia",
            2,
        );
        let pairs = plan
            .entries
            .iter()
            .map(|e| (e.source, e.query.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            pairs,
            vec![
                (Source::Prosple, "data"),
                (Source::Prosple, "qa"),
                (Source::Jora, "data"),
                (Source::Jora, "qa"),
            ]
        );
        assert!(plan.entries.iter().all(|e| e.max_pages == 2));
    }

    #[test]
    fn yaml_plan_applies_defaults_and_overrides() {
        let plan = FetchPlan::from_yaml_str(
            r#"
version: 1
defaults:
  location: australia
  max_pages: 4
entries:
  - { source: prosple, query: software engineer, max_pages: 8 }
  - { source: workforce_au, query: data analyst, location: remote }
  - { source: seek, query: data-analyst }
"#,
        )
        .unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.entries[0].max_pages, 8);
        assert_eq!(plan.entries[0].location, "australia");
        assert_eq!(plan.entries[1].source, Source::WorkforceAu);
        assert_eq!(plan.entries[1].location, "remote");
        assert_eq!(plan.entries[1].max_pages, 4);

        let only_seek = plan.restrict_to(&[Source::Seek]);
        assert_eq!(only_seek.len(), 1);
        assert!(FetchPlan::from_yaml_str("entries: [}").is_err());
    }

    #[test]
    fn yaml_plan_rejects_unknown_version_and_zero_pages() {
        let future = FetchPlan::from_yaml_str("version: 2\nentries: []\n").unwrap_err();
        assert!(format!("{future:#}").contains("unsupported fetch plan version 2"));

        let zero = FetchPlan::from_yaml_str(
            "version: 1\ndefaults: { max_pages: 0 }\nentries:\n  - { source: jora, query: qa }\n",
        )
        .unwrap_err();
        assert!(format!("{zero:#}").contains("max_pages 0"));
    }

    #[test]
    fn repo_plan_file_parses() {
        let plan = FetchPlan::from_path(&workspace_root().join("queries.yaml")).unwrap();
        assert!(!plan.is_empty());
        assert!(plan.entries.iter().all(|e| e.max_pages >= 1));
    }

    #[tokio::test]
    async fn partial_failure_keeps_other_sources() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = fixture_pipeline(tmp.path());
        let summary = pipeline.run_once(&fixture_plan()).await.unwrap();

        let seek = &summary.per_source[&Source::Seek];
        assert_eq!(seek.failed_pairs, 2);
        assert!(seek.failed());
        assert_eq!(summary.failed_sources, 1);

        assert!(summary.per_source[&Source::Prosple].new > 0);
        assert!(summary.per_source[&Source::Jora].new > 0);
        assert!(summary.total_postings > 0);
        assert_eq!(summary.existing_postings, 0);

        let totals = summary.totals();
        // Careerone's second card has no link and Prosple's third has no title.
        assert!(totals.malformed >= 2);
        // Second query replays the same pages, and Workforce Australia
        // repeats a Prosple listing.
        assert!(totals.duplicates > 0);
        assert_eq!(totals.new, summary.total_postings);
    }

    #[tokio::test]
    async fn rerun_over_same_pages_adds_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = fixture_pipeline(tmp.path());
        let first = pipeline.run_once(&fixture_plan()).await.unwrap();
        let second = pipeline.run_once(&fixture_plan()).await.unwrap();

        assert_eq!(second.existing_postings, first.total_postings);
        assert_eq!(second.total_postings, first.total_postings);
        assert_eq!(second.totals().new, 0);

        let stored = MergedStore::new(tmp.path().join("data/jobs_merged.csv"))
            .load()
            .await
            .unwrap();
        let unique = stored.iter().map(fingerprint).collect::<HashSet<_>>();
        assert_eq!(unique.len(), stored.len());
    }

    #[tokio::test]
    async fn run_writes_reports_and_snapshot_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let summary = fixture_pipeline(tmp.path())
            .run_once(&fixture_plan())
            .await
            .unwrap();

        let run_dir = PathBuf::from(summary.reports_dir.as_deref().expect("reports dir"));
        assert!(run_dir.join("run_summary.json").exists());
        let md = std::fs::read_to_string(run_dir.join("run_summary.md")).unwrap();
        assert!(md.contains("Failed sources: 1"));
        assert!(md.contains("| SEEK |"));

        let manifest: serde_json::Value = serde_json::from_slice(
            &std::fs::read(summary.parquet_manifest.as_deref().expect("manifest")).unwrap(),
        )
        .unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        for file in files {
            let path = run_dir.join(file["path"].as_str().unwrap());
            let bytes = std::fs::read(&path).unwrap();
            assert_eq!(file["sha256"].as_str().unwrap(), sha256_hex(&bytes));
        }
    }

    #[tokio::test]
    async fn unreadable_store_aborts_without_overwriting() {
        let tmp = tempfile::tempdir().unwrap();
        let config = fixture_config(tmp.path());
        std::fs::create_dir_all(config.store_path.parent().unwrap()).unwrap();
        std::fs::write(&config.store_path, "not,a,store\n1,2,3\n").unwrap();

        let err = fixture_pipeline(tmp.path())
            .run_once(&fixture_plan())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Unreadable { .. })
        ));
        assert_eq!(
            std::fs::read_to_string(&config.store_path).unwrap(),
            "not,a,store\n1,2,3\n"
        );
    }

    #[tokio::test]
    async fn report_failure_does_not_fail_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "a file, not a directory").unwrap();
        let config = FetchConfig {
            reports_dir: Some(blocker),
            ..fixture_config(tmp.path())
        };
        let pipeline = FetchPipeline::with_loader(
            config,
            Box::new(FixtureLoader::new(workspace_root().join("fixtures"))),
        );
        let summary = pipeline.run_once(&fixture_plan()).await.unwrap();
        assert!(summary.reports_dir.is_none());
        assert!(summary.parquet_manifest.is_none());

        let stored = MergedStore::new(tmp.path().join("data/jobs_merged.csv"))
            .load()
            .await
            .unwrap();
        assert_eq!(stored.len(), summary.total_postings);
    }

    #[tokio::test]
    async fn archive_dir_keeps_raw_pages() {
        let tmp = tempfile::tempdir().unwrap();
        let config = FetchConfig {
            archive_dir: Some(tmp.path().join("archive")),
            reports_dir: None,
            ..fixture_config(tmp.path())
        };
        let pipeline = FetchPipeline::with_loader(
            config,
            Box::new(FixtureLoader::new(workspace_root().join("fixtures"))),
        );
        let summary = pipeline.run_once(&fixture_plan()).await.unwrap();
        assert!(summary.reports_dir.is_none());
        assert!(tmp.path().join("archive").is_dir());
    }
}
