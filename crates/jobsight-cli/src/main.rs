use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use jobsight_adapters::FixtureLoader;
use jobsight_analyze::{write_skill_tables, AnalysisReport, SkillAnalyzer, SkillPatterns};
use jobsight_core::Source;
use jobsight_storage::MergedStore;
use jobsight_sync::{FetchConfig, FetchPipeline, FetchPlan, DEFAULT_LOCATION, DEFAULT_MAX_PAGES};
use jobsight_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_PLAN: &str = "queries.yaml";

#[derive(Debug, Parser)]
#[command(name = "jobsight")]
#[command(about = "Australian job-board ETL, skill analysis and dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch postings, deduplicate them and merge them into the store.
    Fetch(FetchArgs),
    /// Print skill frequencies and posting breakdowns for the store.
    Analyze(AnalyzeArgs),
    /// Serve the web dashboard.
    Dashboard(DashboardArgs),
}

#[derive(Debug, Args)]
struct FetchArgs {
    /// Board to fetch (repeatable). All boards in the plan when omitted.
    #[arg(long = "source", value_name = "SOURCE")]
    sources: Vec<Source>,
    /// Search term (repeatable). Builds a board x query plan instead of reading one.
    #[arg(long = "query", value_name = "QUERY")]
    queries: Vec<String>,
    #[arg(long)]
    location: Option<String>,
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    max_pages: Option<u32>,
    #[arg(long, value_name = "PATH", conflicts_with = "queries")]
    plan: Option<PathBuf>,
    /// Replay saved pages from DIR/<board>/page<N>.html instead of the network.
    #[arg(long, value_name = "DIR")]
    fixtures: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    store: Option<PathBuf>,
    /// Run report directory; "off" disables reports.
    #[arg(long, value_name = "DIR")]
    reports_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    #[arg(long, value_name = "PATH")]
    store: Option<PathBuf>,
    /// Write per-category skill tables and analysis.json here.
    #[arg(long, value_name = "DIR")]
    out_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 10)]
    top: usize,
    /// Skill pattern tables; the bundled rules when omitted.
    #[arg(long, value_name = "PATH")]
    rules: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DashboardArgs {
    #[arg(long, value_name = "PATH")]
    store: Option<PathBuf>,
    /// Defaults to JOBSIGHT_WEB_PORT, then 8000.
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, value_name = "PATH")]
    rules: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Fetch(args) => fetch(args).await,
        Commands::Analyze(args) => analyze(args).await,
        Commands::Dashboard(args) => dashboard(args).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "jobsight=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_plan(args: &FetchArgs) -> Result<FetchPlan> {
    let plan = if args.queries.is_empty() {
        let path = args.plan.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_PLAN));
        let mut plan = FetchPlan::from_path(&path)?;
        for entry in &mut plan.entries {
            if let Some(location) = &args.location {
                entry.location = location.clone();
            }
            if let Some(max_pages) = args.max_pages {
                entry.max_pages = max_pages;
            }
        }
        plan
    } else {
        let sources = if args.sources.is_empty() {
            Source::ALL.to_vec()
        } else {
            args.sources.clone()
        };
        FetchPlan::cross(
            &sources,
            &args.queries,
            args.location.as_deref().unwrap_or(DEFAULT_LOCATION),
            args.max_pages.unwrap_or(DEFAULT_MAX_PAGES),
        )
    };

    let plan = plan.restrict_to(&args.sources);
    if plan.is_empty() {
        bail!("fetch plan selects no board/query pairs");
    }
    Ok(plan)
}

fn store_path(flag: Option<PathBuf>) -> PathBuf {
    flag.unwrap_or_else(|| FetchConfig::from_env().store_path)
}

fn load_analyzer(rules: Option<&Path>) -> Result<SkillAnalyzer> {
    let patterns = match rules {
        Some(path) => SkillPatterns::from_path(path)?,
        None => SkillPatterns::builtin()?,
    };
    info!(version = patterns.version(), rules = patterns.rules().len(), "skill patterns loaded");
    Ok(SkillAnalyzer::new(patterns))
}

async fn fetch(args: FetchArgs) -> Result<()> {
    let plan = build_plan(&args)?;
    let mut config = FetchConfig::from_env();
    if let Some(store) = &args.store {
        config.store_path = store.clone();
    }
    if let Some(dir) = &args.reports_dir {
        config.reports_dir = match dir.to_str().map(str::trim) {
            Some("" | "off" | "none") => None,
            _ => Some(dir.clone()),
        };
    }

    let pipeline = match &args.fixtures {
        Some(dir) => {
            info!(dir = %dir.display(), "replaying saved pages");
            config.page_delay = Duration::ZERO;
            FetchPipeline::with_loader(config, Box::new(FixtureLoader::new(dir.clone())))
        }
        None => FetchPipeline::new(config)?,
    };

    let summary = pipeline.run_once(&plan).await?;
    println!("{}", summary.to_markdown());
    if summary.failed_sources > 0 {
        warn!(failed_sources = summary.failed_sources, "some boards yielded nothing");
    }
    Ok(())
}

async fn analyze(args: AnalyzeArgs) -> Result<()> {
    let analyzer = load_analyzer(args.rules.as_deref())?;
    let store = MergedStore::new(store_path(args.store));
    let postings = store
        .load()
        .await
        .with_context(|| format!("reading {}", store.path().display()))?;
    if postings.is_empty() {
        warn!(store = %store.path().display(), "store is empty; run `jobsight fetch` first");
    }

    let report = AnalysisReport::build(&analyzer, &postings, args.top);
    println!("{}", report.render_text(args.top));

    if let Some(dir) = &args.out_dir {
        for path in write_skill_tables(dir, &report, args.top)? {
            println!("wrote {}", path.display());
        }
    }
    Ok(())
}

async fn dashboard(args: DashboardArgs) -> Result<()> {
    let analyzer = load_analyzer(args.rules.as_deref())?;
    let state = AppState::new(store_path(args.store), analyzer);
    jobsight_web::serve(state, args.port.unwrap_or_else(jobsight_web::port_from_env)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch_args(argv: &[&str]) -> FetchArgs {
        let cli = Cli::try_parse_from(["jobsight", "fetch"].iter().chain(argv)).unwrap();
        match cli.command {
            Commands::Fetch(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    fn repo_plan() -> String {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../queries.yaml")
            .display()
            .to_string()
    }

    #[test]
    fn queries_cross_selected_sources() {
        let args = fetch_args(&["--source", "prosple", "--source", "jora", "--query", "data analyst", "--query", "devops"]);
        let plan = build_plan(&args).unwrap();
        assert_eq!(plan.len(), 4);
        assert_eq!(plan.entries[0].source, Source::Prosple);
        assert_eq!(plan.entries[0].location, DEFAULT_LOCATION);
        assert_eq!(plan.entries[3].source, Source::Jora);
        assert_eq!(plan.entries[3].query, "devops");
    }

    #[test]
    fn queries_without_sources_cover_every_board() {
        let args = fetch_args(&["--query", "software", "--max-pages", "2"]);
        let plan = build_plan(&args).unwrap();
        assert_eq!(plan.len(), Source::ALL.len());
        assert!(plan.entries.iter().all(|e| e.max_pages == 2));
    }

    #[test]
    fn plan_file_is_restricted_and_overridden() {
        let plan_path = repo_plan();
        let args = fetch_args(&["--plan", &plan_path, "--source", "seek", "--location", "Perth WA"]);
        let plan = build_plan(&args).unwrap();
        assert_eq!(plan.len(), 2);
        assert!(plan.entries.iter().all(|e| e.source == Source::Seek));
        assert!(plan.entries.iter().all(|e| e.location == "Perth WA" && e.max_pages == 1));
    }

    #[test]
    fn plan_and_query_conflict() {
        let err = Cli::try_parse_from(["jobsight", "fetch", "--plan", "q.yaml", "--query", "qa"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn unknown_source_is_rejected() {
        assert!(Cli::try_parse_from(["jobsight", "fetch", "--source", "monster"]).is_err());
    }

    #[test]
    fn zero_max_pages_is_rejected() {
        let err = Cli::try_parse_from(["jobsight", "fetch", "--query", "qa", "--max-pages", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn dashboard_and_analyze_flags_parse() {
        let cli = Cli::try_parse_from(["jobsight", "dashboard", "--port", "9100", "--store", "x.csv"]).unwrap();
        assert!(matches!(cli.command, Commands::Dashboard(DashboardArgs { port: Some(9100), .. })));

        let cli = Cli::try_parse_from(["jobsight", "analyze", "--top", "5", "--out-dir", "out"]).unwrap();
        match cli.command {
            Commands::Analyze(args) => {
                assert_eq!(args.top, 5);
                assert_eq!(args.out_dir, Some(PathBuf::from("out")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn fixture_fetch_then_analyze() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("jobs.csv");
        let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
        let store_arg = store.display().to_string();
        let fixtures_arg = fixtures.display().to_string();
        let reports = dir.path().join("reports");
        let reports_arg = reports.display().to_string();
        let args = fetch_args(&[
            "--query",
            "data analyst",
            "--fixtures",
            &fixtures_arg,
            "--store",
            &store_arg,
            "--reports-dir",
            &reports_arg,
        ]);
        fetch(args).await.unwrap();
        assert_eq!(std::fs::read_dir(&reports).unwrap().count(), 1);

        let postings = MergedStore::new(&store).load().await.unwrap();
        assert!(!postings.is_empty());
        assert!(postings.iter().all(|p| p.source != Source::Seek));

        let out = dir.path().join("analysis");
        analyze(AnalyzeArgs {
            store: Some(store),
            out_dir: Some(out.clone()),
            top: 5,
            rules: None,
        })
        .await
        .unwrap();
        assert!(out.join("programming_languages.csv").is_file());
    }
}
