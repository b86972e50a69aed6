//! Skill extraction, frequency tables, and the posting filter shared by
//! the CLI report and the dashboard.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use jobsight_core::{CategoryTotal, Posting, RoleCategory, SkillCategory, SkillRecord, Source};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const CRATE_NAME: &str = "jobsight-analyze";

/// The pattern tables shipped in `rules/skills.yaml`.
pub const BUILTIN_SKILLS_YAML: &str = include_str!("../../../rules/skills.yaml");

#[derive(Debug, Deserialize)]
struct SkillRulesFile {
    version: u32,
    #[serde(default)]
    categories: BTreeMap<SkillCategory, Vec<SkillRuleEntry>>,
}

#[derive(Debug, Deserialize)]
struct SkillRuleEntry {
    skill: String,
    patterns: Vec<String>,
}

/// One canonical skill and the compiled alternation of its patterns.
#[derive(Debug, Clone)]
pub struct SkillRule {
    pub skill: String,
    pub category: SkillCategory,
    matcher: Regex,
}

impl SkillRule {
    pub fn new(skill: &str, category: SkillCategory, patterns: &[String]) -> Result<Self> {
        if patterns.iter().all(|p| p.trim().is_empty()) {
            bail!("skill {skill:?} has no patterns");
        }
        let alternation = patterns
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(|p| regex::escape(p).replace(' ', r"\s+"))
            .collect::<Vec<_>>()
            .join("|");
        // A match may not touch a letter or digit on either side, so "r"
        // stays out of "frontend" while "c++" and ".net" still match.
        let source = format!(r"(?i)(?:^|[^\p{{L}}\p{{N}}])(?:{alternation})(?:[^\p{{L}}\p{{N}}]|$)");
        let matcher = Regex::new(&source)
            .with_context(|| format!("compiling patterns for skill {skill:?}"))?;
        Ok(Self {
            skill: skill.to_string(),
            category,
            matcher,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.matcher.is_match(text)
    }
}

/// Versioned, category-tagged pattern tables.
#[derive(Debug, Clone)]
pub struct SkillPatterns {
    version: u32,
    rules: Vec<SkillRule>,
}

impl SkillPatterns {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_SKILLS_YAML).context("loading built-in skill patterns")
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: SkillRulesFile = serde_yaml::from_str(text).context("parsing skill rules")?;
        let mut rules = Vec::new();
        for (category, entries) in file.categories {
            for entry in entries {
                rules.push(SkillRule::new(&entry.skill, category, &entry.patterns)?);
            }
        }
        Ok(Self {
            version: file.version,
            rules,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn rules(&self) -> &[SkillRule] {
        &self.rules
    }

    /// Rules matching `text`, each at most once, in table order.
    pub fn matches<'a>(&'a self, text: &str) -> Vec<&'a SkillRule> {
        self.rules.iter().filter(|rule| rule.is_match(text)).collect()
    }
}

/// Skill extraction over postings.
#[derive(Debug, Clone)]
pub struct SkillAnalyzer {
    patterns: SkillPatterns,
}

impl SkillAnalyzer {
    pub fn new(patterns: SkillPatterns) -> Self {
        Self { patterns }
    }

    pub fn builtin() -> Result<Self> {
        SkillPatterns::builtin().map(Self::new)
    }

    pub fn patterns(&self) -> &SkillPatterns {
        &self.patterns
    }

    /// Distinct skills found in one posting's title and description.
    pub fn posting_skills<'a>(&'a self, posting: &Posting) -> Vec<&'a SkillRule> {
        self.patterns.matches(&posting.searchable_text())
    }

    pub fn skill_count(&self, posting: &Posting) -> usize {
        self.posting_skills(posting).len()
    }

    /// Frequency table over `postings`; a skill counts once per posting.
    pub fn analyze<'p>(&self, postings: impl IntoIterator<Item = &'p Posting>) -> Vec<SkillRecord> {
        let mut counts: BTreeMap<(SkillCategory, &str), usize> = BTreeMap::new();
        for posting in postings {
            for rule in self.posting_skills(posting) {
                *counts.entry((rule.category, rule.skill.as_str())).or_default() += 1;
            }
        }
        rank_skills(counts.into_iter().map(|((category, skill), count)| SkillRecord {
            skill_name: skill.to_string(),
            category,
            count,
        }))
    }
}

/// Descending count; ties by skill name ignoring case, then exact name.
pub fn rank_skills(records: impl IntoIterator<Item = SkillRecord>) -> Vec<SkillRecord> {
    let mut records = records.into_iter().collect::<Vec<_>>();
    records.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.skill_name.to_lowercase().cmp(&b.skill_name.to_lowercase()))
            .then_with(|| a.skill_name.cmp(&b.skill_name))
            .then_with(|| a.category.cmp(&b.category))
    });
    records
}

pub fn top_skills(records: &[SkillRecord], category: SkillCategory, n: usize) -> Vec<SkillRecord> {
    records
        .iter()
        .filter(|r| r.category == category)
        .take(n)
        .cloned()
        .collect()
}

pub fn category_totals(records: &[SkillRecord]) -> Vec<CategoryTotal> {
    SkillCategory::ALL
        .iter()
        .map(|&category| {
            let in_category = records.iter().filter(|r| r.category == category);
            CategoryTotal {
                category,
                mentions: in_category.clone().map(|r| r.count).sum(),
                distinct_skills: in_category.count(),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakdown {
    pub label: String,
    pub count: usize,
}

/// Count postings per key, largest first, ties alphabetical. Blank keys
/// are skipped.
pub fn count_by<'p, F>(postings: impl IntoIterator<Item = &'p Posting>, key: F) -> Vec<Breakdown>
where
    F: Fn(&Posting) -> String,
{
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for posting in postings {
        let label = key(posting);
        if !label.trim().is_empty() {
            *counts.entry(label).or_default() += 1;
        }
    }
    let mut rows = counts
        .into_iter()
        .map(|(label, count)| Breakdown { label, count })
        .collect::<Vec<_>>();
    rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
    rows
}

pub fn source_counts(postings: &[Posting]) -> Vec<Breakdown> {
    count_by(postings, |p| p.source.display_name().to_string())
}

pub fn role_counts(postings: &[Posting]) -> Vec<Breakdown> {
    count_by(postings, |p| p.role_category.label().to_string())
}

pub fn top_companies(postings: &[Posting], n: usize) -> Vec<Breakdown> {
    count_by(postings, |p| p.company.clone()).into_iter().take(n).collect()
}

pub fn top_locations(postings: &[Posting], n: usize) -> Vec<Breakdown> {
    count_by(postings, |p| p.location.clone()).into_iter().take(n).collect()
}

/// Everything the `analyze` command reports.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub patterns_version: u32,
    pub total_postings: usize,
    pub sources: Vec<Breakdown>,
    pub top_companies: Vec<Breakdown>,
    pub top_locations: Vec<Breakdown>,
    pub roles: Vec<Breakdown>,
    pub category_totals: Vec<CategoryTotal>,
    pub skills: Vec<SkillRecord>,
}

impl AnalysisReport {
    pub fn build(analyzer: &SkillAnalyzer, postings: &[Posting], top: usize) -> Self {
        let skills = analyzer.analyze(postings);
        Self {
            patterns_version: analyzer.patterns().version(),
            total_postings: postings.len(),
            sources: source_counts(postings),
            top_companies: top_companies(postings, top),
            top_locations: top_locations(postings, top),
            roles: role_counts(postings),
            category_totals: category_totals(&skills),
            skills,
        }
    }

    /// Plain-text summary for the terminal.
    pub fn render_text(&self, top: usize) -> String {
        let mut out = Vec::new();
        out.push(format!("Total postings: {}", self.total_postings));
        let section = |out: &mut Vec<String>, title: &str, rows: &[Breakdown]| {
            out.push(String::new());
            out.push(format!("{title}:"));
            for (i, row) in rows.iter().take(top).enumerate() {
                out.push(format!("  {:>2}. {:<40} {:>5}", i + 1, row.label, row.count));
            }
        };
        section(&mut out, "By source", &self.sources);
        section(&mut out, "By role", &self.roles);
        section(&mut out, "Top companies", &self.top_companies);
        section(&mut out, "Top locations", &self.top_locations);
        for total in &self.category_totals {
            out.push(String::new());
            out.push(format!(
                "{} ({} mentions, {} skills):",
                total.category.label(),
                total.mentions,
                total.distinct_skills
            ));
            for (i, skill) in top_skills(&self.skills, total.category, top).iter().enumerate() {
                out.push(format!("  {:>2}. {:<24} {:>5}", i + 1, skill.skill_name, skill.count));
            }
        }
        out.join("\n")
    }
}

/// File stem of the per-category skill table.
pub fn skill_table_stem(category: SkillCategory) -> &'static str {
    match category {
        SkillCategory::Language => "programming_languages",
        SkillCategory::Framework => "frameworks",
        SkillCategory::Cloud => "cloud_platforms",
        SkillCategory::Database => "databases",
        SkillCategory::Tool => "tools_technologies",
    }
}

/// Write one `skill,count` CSV per category (top `n` rows each) plus
/// `analysis.json`. Returns the files written.
pub fn write_skill_tables(out_dir: &Path, report: &AnalysisReport, n: usize) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    let mut written = Vec::new();

    for category in SkillCategory::ALL {
        let path = out_dir.join(format!("{}.csv", skill_table_stem(category)));
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("creating {}", path.display()))?;
        writer.write_record(["skill", "count"])?;
        for record in top_skills(&report.skills, category, n) {
            let count = record.count.to_string();
            writer.write_record([record.skill_name.as_str(), count.as_str()])?;
        }
        writer.flush().with_context(|| format!("writing {}", path.display()))?;
        debug!(path = %path.display(), "skill table written");
        written.push(path);
    }

    let json_path = out_dir.join("analysis.json");
    let json = serde_json::to_vec_pretty(report).context("serializing analysis report")?;
    std::fs::write(&json_path, json).with_context(|| format!("writing {}", json_path.display()))?;
    written.push(json_path);
    Ok(written)
}

/// Dashboard filter predicates, combined with AND. Empty sets and `None`
/// accept everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingFilter {
    #[serde(default)]
    pub sources: BTreeSet<Source>,
    #[serde(default)]
    pub role_categories: BTreeSet<RoleCategory>,
    pub location_contains: Option<String>,
    /// Minimum number of distinct skills matched in the posting.
    pub min_skill_count: Option<usize>,
    /// Case-insensitive substring over title, company and location.
    pub search: Option<String>,
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl PostingFilter {
    pub fn needs_skill_counts(&self) -> bool {
        self.min_skill_count.unwrap_or(0) > 0
    }

    /// `skill_count` is the posting's distinct matched skills; callers that
    /// cache it pass the cached value.
    pub fn matches(&self, posting: &Posting, skill_count: usize) -> bool {
        if !self.sources.is_empty() && !self.sources.contains(&posting.source) {
            return false;
        }
        if !self.role_categories.is_empty() && !self.role_categories.contains(&posting.role_category) {
            return false;
        }
        if let Some(location) = non_blank(&self.location_contains) {
            if !contains_ci(&posting.location, location) {
                return false;
            }
        }
        if let Some(min) = self.min_skill_count {
            if skill_count < min {
                return false;
            }
        }
        if let Some(term) = non_blank(&self.search) {
            let hit = [&posting.title, &posting.company, &posting.location]
                .iter()
                .any(|field| contains_ci(field, term));
            if !hit {
                return false;
            }
        }
        true
    }

    pub fn apply<'p>(&self, postings: &'p [Posting], analyzer: &SkillAnalyzer) -> Vec<&'p Posting> {
        postings
            .iter()
            .filter(|p| {
                let count = if self.needs_skill_counts() {
                    analyzer.skill_count(p)
                } else {
                    0
                };
                self.matches(p, count)
            })
            .collect()
    }
}
