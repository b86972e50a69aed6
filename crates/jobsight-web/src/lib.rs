//! Axum + Askama dashboard over the merged posting store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use jobsight_analyze::{count_by, rank_skills, top_skills, Breakdown, PostingFilter, SkillAnalyzer};
use jobsight_core::{Posting, RoleCategory, SkillCategory, SkillRecord, Source, UnknownVariant};
use jobsight_storage::{encode_postings, MergedStore, StoreStamp};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "jobsight-web";
pub const DEFAULT_PORT: u16 = 8000;

const DEFAULT_PER_PAGE: usize = 25;
const MAX_PER_PAGE: usize = 200;
const INDEX_TABLE_ROWS: usize = 50;
const INDEX_TOP_SKILLS: usize = 10;

/// Store contents plus each posting's matched skills, valid for one
/// version (mtime and size) of the store file.
#[derive(Debug)]
pub struct StoreSnapshot {
    stamp: Option<StoreStamp>,
    pub postings: Vec<Posting>,
    /// Indices into the analyzer's rule table, parallel to `postings`.
    pub skills: Vec<Vec<usize>>,
    pub loaded_at: DateTime<Utc>,
}

type Row<'a> = (&'a Posting, &'a [usize]);

impl StoreSnapshot {
    fn filtered(&self, filter: &PostingFilter) -> Vec<Row<'_>> {
        self.postings
            .iter()
            .zip(self.skills.iter())
            .filter(|(posting, skills)| filter.matches(posting, skills.len()))
            .map(|(posting, skills)| (posting, skills.as_slice()))
            .collect()
    }
}

pub struct AppState {
    store: MergedStore,
    analyzer: SkillAnalyzer,
    cache: RwLock<Option<Arc<StoreSnapshot>>>,
}

impl AppState {
    pub fn new(store_path: impl Into<PathBuf>, analyzer: SkillAnalyzer) -> Self {
        Self {
            store: MergedStore::new(store_path),
            analyzer,
            cache: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &MergedStore {
        &self.store
    }

    /// The cached snapshot, reloaded when the store file's mtime or size
    /// differs from the one it was built from.
    pub async fn snapshot(&self) -> anyhow::Result<Arc<StoreSnapshot>> {
        let stamp = self.store.stamp().await;
        if let Some(cached) = self.cache.read().await.as_ref() {
            if cached.stamp == stamp {
                return Ok(Arc::clone(cached));
            }
        }

        let mut guard = self.cache.write().await;
        if let Some(cached) = guard.as_ref() {
            if cached.stamp == stamp {
                return Ok(Arc::clone(cached));
            }
        }

        let postings = self
            .store
            .load()
            .await
            .with_context(|| format!("loading {}", self.store.path().display()))?;
        let skills = postings.iter().map(|p| self.skill_indices(p)).collect();
        let snapshot = Arc::new(StoreSnapshot {
            stamp,
            postings,
            skills,
            loaded_at: Utc::now(),
        });
        info!(
            store = %self.store.path().display(),
            postings = snapshot.postings.len(),
            "dashboard store reloaded"
        );
        *guard = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    fn skill_indices(&self, posting: &Posting) -> Vec<usize> {
        let text = posting.searchable_text();
        self.analyzer
            .patterns()
            .rules()
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.is_match(&text))
            .map(|(index, _)| index)
            .collect()
    }

    fn skill_records(&self, rows: &[Row<'_>]) -> Vec<SkillRecord> {
        let rules = self.analyzer.patterns().rules();
        let mut counts = BTreeMap::<usize, usize>::new();
        for (_, skills) in rows {
            for &index in skills.iter() {
                *counts.entry(index).or_default() += 1;
            }
        }
        rank_skills(counts.into_iter().filter_map(|(index, count)| {
            rules.get(index).map(|rule| SkillRecord {
                skill_name: rule.skill.clone(),
                category: rule.category,
                count,
            })
        }))
    }

    fn posting_row(&self, posting: &Posting, skills: &[usize]) -> PostingRow {
        let rules = self.analyzer.patterns().rules();
        PostingRow {
            source: posting.source.display_name().to_string(),
            title: posting.title.clone(),
            company: posting.company.clone(),
            location: posting.location.clone(),
            posted_at: posting.posted_at.clone().unwrap_or_default(),
            role_category: posting.role_category.label().to_string(),
            url: posting.url.clone(),
            skills: skills
                .iter()
                .filter_map(|&index| rules.get(index).map(|rule| rule.skill.clone()))
                .collect(),
        }
    }
}

/// Query parameters shared by every dashboard endpoint. `source` and
/// `role` take comma-separated lists.
#[derive(Debug, Default, Deserialize)]
pub struct DashboardQuery {
    pub source: Option<String>,
    pub role: Option<String>,
    pub location: Option<String>,
    pub min_skills: Option<usize>,
    pub q: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
    pub min_count: Option<usize>,
    pub category: Option<String>,
}

fn split_list(value: &Option<String>) -> impl Iterator<Item = &str> {
    value
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl DashboardQuery {
    pub fn filter(&self) -> Result<PostingFilter, UnknownVariant> {
        Ok(PostingFilter {
            sources: split_list(&self.source)
                .map(|s| s.parse::<Source>())
                .collect::<Result<BTreeSet<_>, _>>()?,
            role_categories: split_list(&self.role)
                .map(|s| s.parse::<RoleCategory>())
                .collect::<Result<BTreeSet<_>, _>>()?,
            location_contains: self.location.clone(),
            min_skill_count: self.min_skills,
            search: self.q.clone(),
        })
    }

    fn skill_category(&self) -> Result<Option<SkillCategory>, UnknownVariant> {
        let Some(wanted) = self.category.as_deref().map(str::trim).filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        SkillCategory::ALL
            .into_iter()
            .find(|c| c.slug().eq_ignore_ascii_case(wanted) || c.label().eq_ignore_ascii_case(wanted))
            .map(Some)
            .ok_or_else(|| UnknownVariant {
                kind: "skill category",
                value: wanted.to_string(),
            })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PostingRow {
    pub source: String,
    pub title: String,
    pub company: String,
    pub location: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub posted_at: String,
    pub role_category: String,
    pub url: String,
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostingsPage {
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
    pub postings: Vec<PostingRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkillsResponse {
    pub total_postings: usize,
    pub min_count: usize,
    pub skills: Vec<SkillRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub total_postings: usize,
    pub distinct_companies: usize,
    pub distinct_locations: usize,
    pub role_types: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

fn distinct_ci<'a>(values: impl Iterator<Item = &'a str>) -> usize {
    values
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect::<BTreeSet<_>>()
        .len()
}

impl Metrics {
    fn compute(rows: &[Row<'_>]) -> Self {
        Self {
            total_postings: rows.len(),
            distinct_companies: distinct_ci(rows.iter().map(|(p, _)| p.company.as_str())),
            distinct_locations: distinct_ci(rows.iter().map(|(p, _)| p.location.as_str())),
            role_types: rows
                .iter()
                .map(|(p, _)| p.role_category)
                .collect::<BTreeSet<_>>()
                .len(),
            last_updated: rows.iter().map(|(p, _)| p.fetched_at).max(),
        }
    }
}

struct SkillPanel {
    label: String,
    skills: Vec<SkillRecord>,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    metrics: Metrics,
    last_updated: String,
    panels: Vec<SkillPanel>,
    postings: Vec<PostingRow>,
    shown: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/postings", get(postings_handler))
        .route("/api/postings.csv", get(postings_csv_handler))
        .route("/api/skills", get(skills_handler))
        .route("/api/metrics", get(metrics_handler))
        .route("/api/charts/sources", get(sources_chart_handler))
        .route("/api/charts/roles", get(roles_chart_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("JOBSIGHT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding dashboard port {port}"))?;
    info!(port, store = %state.store.path().display(), "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Loads the snapshot and applies the query's filters, or produces the
/// error response to return instead.
async fn filtered_snapshot(
    state: &AppState,
    query: &DashboardQuery,
) -> Result<(Arc<StoreSnapshot>, PostingFilter), Response> {
    let filter = query.filter().map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string()))?;
    let snapshot = state.snapshot().await.map_err(|err| {
        warn!(error = %format!("{err:#}"), "dashboard store unavailable");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    })?;
    Ok((snapshot, filter))
}

async fn index_handler(State(state): State<Arc<AppState>>, Query(query): Query<DashboardQuery>) -> Response {
    let filter = match query.filter() {
        Ok(filter) => filter,
        Err(err) => return (StatusCode::BAD_REQUEST, Html(err.to_string())).into_response(),
    };
    match state.snapshot().await {
        Ok(snapshot) => {
            let rows = snapshot.filtered(&filter);
            let metrics = Metrics::compute(&rows);
            let skills = state.skill_records(&rows);
            let panels = SkillCategory::ALL
                .iter()
                .map(|&category| SkillPanel {
                    label: category.label().to_string(),
                    skills: top_skills(&skills, category, INDEX_TOP_SKILLS),
                })
                .collect();
            let postings = rows
                .iter()
                .take(INDEX_TABLE_ROWS)
                .map(|(posting, skills)| state.posting_row(posting, skills))
                .collect::<Vec<_>>();
            let last_updated = metrics
                .last_updated
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "n/a".into());
            render_html(IndexTemplate {
                shown: postings.len(),
                metrics,
                last_updated,
                panels,
                postings,
            })
        }
        Err(err) => server_error(err),
    }
}

async fn postings_handler(State(state): State<Arc<AppState>>, Query(query): Query<DashboardQuery>) -> Response {
    let (snapshot, filter) = match filtered_snapshot(&state, &query).await {
        Ok(loaded) => loaded,
        Err(resp) => return resp,
    };
    let rows = snapshot.filtered(&filter);

    let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let total = rows.len();
    let total_pages = total.max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let postings = rows
        .iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .map(|(posting, skills)| state.posting_row(posting, skills))
        .collect();

    Json(PostingsPage {
        page,
        per_page,
        total,
        total_pages,
        postings,
    })
    .into_response()
}

async fn postings_csv_handler(State(state): State<Arc<AppState>>, Query(query): Query<DashboardQuery>) -> Response {
    let (snapshot, filter) = match filtered_snapshot(&state, &query).await {
        Ok(loaded) => loaded,
        Err(resp) => return resp,
    };
    let postings = snapshot
        .filtered(&filter)
        .into_iter()
        .map(|(posting, _)| posting.clone())
        .collect::<Vec<_>>();
    match encode_postings(&postings) {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"jobs_filtered.csv\""),
            ],
            bytes,
        )
            .into_response(),
        Err(err) => api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
    }
}

async fn skills_handler(State(state): State<Arc<AppState>>, Query(query): Query<DashboardQuery>) -> Response {
    let category = match query.skill_category() {
        Ok(category) => category,
        Err(err) => return api_error(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let (snapshot, filter) = match filtered_snapshot(&state, &query).await {
        Ok(loaded) => loaded,
        Err(resp) => return resp,
    };
    let rows = snapshot.filtered(&filter);
    let min_count = query.min_count.unwrap_or(1).max(1);
    let skills = state
        .skill_records(&rows)
        .into_iter()
        .filter(|r| r.count >= min_count)
        .filter(|r| category.map_or(true, |c| r.category == c))
        .collect();

    Json(SkillsResponse {
        total_postings: rows.len(),
        min_count,
        skills,
    })
    .into_response()
}

async fn metrics_handler(State(state): State<Arc<AppState>>, Query(query): Query<DashboardQuery>) -> Response {
    match filtered_snapshot(&state, &query).await {
        Ok((snapshot, filter)) => Json(Metrics::compute(&snapshot.filtered(&filter))).into_response(),
        Err(resp) => resp,
    }
}

async fn sources_chart_handler(State(state): State<Arc<AppState>>, Query(query): Query<DashboardQuery>) -> Response {
    match filtered_snapshot(&state, &query).await {
        Ok((snapshot, filter)) => {
            let rows = snapshot.filtered(&filter);
            let counts = count_by(rows.iter().map(|(p, _)| *p), |p| p.source.display_name().to_string());
            Json(bar_chart("Postings per Source", &counts, "#0ea5e9")).into_response()
        }
        Err(resp) => resp,
    }
}

async fn roles_chart_handler(State(state): State<Arc<AppState>>, Query(query): Query<DashboardQuery>) -> Response {
    match filtered_snapshot(&state, &query).await {
        Ok((snapshot, filter)) => {
            let rows = snapshot.filtered(&filter);
            let counts = count_by(rows.iter().map(|(p, _)| *p), |p| p.role_category.label().to_string());
            Json(bar_chart("Postings per Role Category", &counts, "#6366f1")).into_response()
        }
        Err(resp) => resp,
    }
}

fn bar_chart(title: &str, counts: &[Breakdown], color: &str) -> serde_json::Value {
    let x = counts.iter().map(|b| b.label.clone()).collect::<Vec<_>>();
    let y = counts.iter().map(|b| b.count as i64).collect::<Vec<_>>();
    serde_json::json!({
        "data": [{
            "type": "bar",
            "x": x,
            "y": y,
            "marker": {"color": color}
        }],
        "layout": {
            "title": title,
            "paper_bgcolor": "#ffffff",
            "plot_bgcolor": "#f8fafc"
        }
    })
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %format!("{err:#}"), "dashboard request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err:#}")),
    )
        .into_response()
}

fn api_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use std::time::{Duration, SystemTime};
    use tower::ServiceExt;

    fn posting(
        source: Source,
        title: &str,
        company: &str,
        location: &str,
        description: &str,
        role_category: RoleCategory,
    ) -> Posting {
        Posting {
            source,
            title: title.to_string(),
            company: company.to_string(),
            location: location.to_string(),
            posted_at: None,
            description: Some(description.to_string()),
            url: format!("https://example.com/{}", title.to_lowercase().replace(' ', "-")),
            role_category,
            query: None,
            fetched_at: Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap(),
        }
    }

    fn sample_postings() -> Vec<Posting> {
        vec![
            posting(
                Source::Prosple,
                "Graduate Data Analyst",
                "Commonwealth Bank",
                "Sydney NSW",
                "SQL, Python and Tableau",
                RoleCategory::DataAnalytics,
            ),
            posting(
                Source::Prosple,
                "Software Engineering Intern",
                "Atlassian",
                "Melbourne VIC",
                "Java and AWS",
                RoleCategory::SoftwareEngineering,
            ),
            posting(
                Source::Seek,
                "Cloud Engineer",
                "Telstra",
                "Sydney NSW",
                "Python, AWS, Terraform and Kubernetes",
                RoleCategory::DevOpsInfrastructure,
            ),
        ]
    }

    async fn state_with(postings: &[Posting]) -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs_merged.csv");
        MergedStore::new(&path).save(postings).await.unwrap();
        (dir, AppState::new(path, SkillAnalyzer::builtin().unwrap()))
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .clone()
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn get_json(app: &Router, uri: &str) -> serde_json::Value {
        let (status, body) = get(app, uri).await;
        assert_eq!(status, StatusCode::OK, "{uri}: {body}");
        serde_json::from_str(&body).unwrap()
    }

    #[tokio::test]
    async fn index_renders_metrics_and_table() {
        let (_dir, state) = state_with(&sample_postings()).await;
        let app = app(state);
        let (status, text) = get(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("jobsight dashboard"));
        assert!(text.contains("Graduate Data Analyst"));
        assert!(text.contains("Terraform"));
    }

    #[tokio::test]
    async fn postings_filter_by_source_and_skill_count() {
        let (_dir, state) = state_with(&sample_postings()).await;
        let app = app(state);
        let json = get_json(&app, "/api/postings?source=prosple&min_skills=3").await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["postings"][0]["title"], "Graduate Data Analyst");
        assert_eq!(json["postings"][0]["skills"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn postings_are_paged() {
        let (_dir, state) = state_with(&sample_postings()).await;
        let app = app(state);
        let json = get_json(&app, "/api/postings?per_page=2&page=2").await;
        assert_eq!(json["total"], 3);
        assert_eq!(json["total_pages"], 2);
        assert_eq!(json["postings"].as_array().unwrap().len(), 1);
        assert_eq!(json["postings"][0]["title"], "Cloud Engineer");
    }

    #[tokio::test]
    async fn unknown_source_is_a_bad_request() {
        let (_dir, state) = state_with(&sample_postings()).await;
        let app = app(state);
        let (status, body) = get(&app, "/api/postings?source=monster").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("monster"));
    }

    #[tokio::test]
    async fn skills_respect_min_count_and_ordering() {
        let (_dir, state) = state_with(&sample_postings()).await;
        let app = app(state);
        let json = get_json(&app, "/api/skills?min_count=2").await;
        let names = json["skills"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["skill_name"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["AWS", "Python"]);

        let cloud = get_json(&app, "/api/skills?category=cloud").await;
        assert!(cloud["skills"]
            .as_array()
            .unwrap()
            .iter()
            .all(|s| s["category"] == "cloud"));
    }

    #[tokio::test]
    async fn metrics_summarize_filtered_set() {
        let (_dir, state) = state_with(&sample_postings()).await;
        let app = app(state);
        let json = get_json(&app, "/api/metrics").await;
        assert_eq!(json["total_postings"], 3);
        assert_eq!(json["distinct_companies"], 3);
        assert_eq!(json["distinct_locations"], 2);
        assert_eq!(json["role_types"], 3);
        assert!(json["last_updated"].as_str().unwrap().starts_with("2026-03-02"));

        let sydney = get_json(&app, "/api/metrics?location=sydney").await;
        assert_eq!(sydney["total_postings"], 2);
    }

    #[tokio::test]
    async fn charts_are_plotly_json() {
        let (_dir, state) = state_with(&sample_postings()).await;
        let app = app(state);
        let resp = app
            .clone()
            .oneshot(axum::http::Request::builder().uri("/api/charts/sources").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");

        let sources = get_json(&app, "/api/charts/sources").await;
        assert_eq!(sources["data"][0]["x"][0], "Prosple");
        assert_eq!(sources["data"][0]["y"][0], 2);

        let roles = get_json(&app, "/api/charts/roles?role=QA%20%26%20Testing").await;
        assert_eq!(roles["data"][0]["x"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn csv_export_contains_filtered_rows() {
        let (_dir, state) = state_with(&sample_postings()).await;
        let app = app(state);
        let (status, body) = get(&app, "/api/postings.csv?q=telstra").await;
        assert_eq!(status, StatusCode::OK);
        let lines = body.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("source,title"));
        assert!(lines[1].contains("Cloud Engineer"));
    }

    #[tokio::test]
    async fn missing_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(dir.path().join("absent.csv"), SkillAnalyzer::builtin().unwrap());
        let app = app(state);
        let json = get_json(&app, "/api/metrics").await;
        assert_eq!(json["total_postings"], 0);
        assert!(json["last_updated"].is_null());
    }

    #[tokio::test]
    async fn snapshot_is_reused_until_store_changes() {
        let postings = sample_postings();
        let (_dir, state) = state_with(&postings[..1]).await;

        let first = state.snapshot().await.unwrap();
        let again = state.snapshot().await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.postings.len(), 1);

        state.store().save(&postings).await.unwrap();
        let file = std::fs::File::options().write(true).open(state.store().path()).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(10)).unwrap();

        let reloaded = state.snapshot().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &reloaded));
        assert_eq!(reloaded.postings.len(), 3);
        assert_eq!(reloaded.skills[2].len(), 4);
    }

    #[tokio::test]
    async fn rewrite_within_one_mtime_tick_still_reloads() {
        let postings = sample_postings();
        let (_dir, state) = state_with(&postings[..1]).await;
        let pinned = SystemTime::UNIX_EPOCH + Duration::from_secs(1_800_000_000);
        let pin = |state: &AppState| {
            let file = std::fs::File::options().write(true).open(state.store().path()).unwrap();
            file.set_modified(pinned).unwrap();
        };

        pin(&state);
        let first = state.snapshot().await.unwrap();
        assert_eq!(first.postings.len(), 1);

        state.store().save(&postings).await.unwrap();
        pin(&state);

        let reloaded = state.snapshot().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &reloaded));
        assert_eq!(reloaded.postings.len(), 3);
    }
}
