//! Core domain model for jobsight: postings, boards, role categories and skill records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "jobsight-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Job board a posting was fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Prosple,
    WorkforceAu,
    Seek,
    Indeed,
    Jora,
    Careerone,
}

impl Source {
    pub const ALL: [Source; 6] = [
        Source::Prosple,
        Source::WorkforceAu,
        Source::Seek,
        Source::Indeed,
        Source::Jora,
        Source::Careerone,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            Source::Prosple => "prosple",
            Source::WorkforceAu => "workforce_au",
            Source::Seek => "seek",
            Source::Indeed => "indeed",
            Source::Jora => "jora",
            Source::Careerone => "careerone",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Source::Prosple => "Prosple",
            Source::WorkforceAu => "Workforce Australia",
            Source::Seek => "SEEK",
            Source::Indeed => "Indeed",
            Source::Jora => "Jora",
            Source::Careerone => "CareerOne",
        }
    }

    /// Origin used to absolutize relative links found on result pages.
    pub fn base_url(self) -> &'static str {
        match self {
            Source::Prosple => "https://au.prosple.com",
            Source::WorkforceAu => "https://www.workforceaustralia.gov.au",
            Source::Seek => "https://www.seek.com.au",
            Source::Indeed => "https://au.indeed.com",
            Source::Jora => "https://au.jora.com",
            Source::Careerone => "https://www.careerone.com.au",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Source {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Source::ALL
            .into_iter()
            .find(|source| {
                source.slug() == wanted
                    || source.display_name().to_ascii_lowercase().replace(' ', "_") == wanted
            })
            .ok_or_else(|| UnknownVariant {
                kind: "source",
                value: s.to_string(),
            })
    }
}

/// Closed classification of a posting's job family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RoleCategory {
    #[serde(rename = "Software Engineering")]
    SoftwareEngineering,
    #[serde(rename = "Data Science & ML")]
    DataScienceMl,
    #[serde(rename = "Data Analytics")]
    DataAnalytics,
    #[serde(rename = "Data Engineering")]
    DataEngineering,
    #[serde(rename = "Business Analysis")]
    BusinessAnalysis,
    #[serde(rename = "DevOps & Infrastructure")]
    DevOpsInfrastructure,
    #[serde(rename = "QA & Testing")]
    QaTesting,
    #[serde(rename = "IT Support")]
    ItSupport,
    #[serde(rename = "Cybersecurity")]
    Cybersecurity,
    #[serde(rename = "Product Management")]
    ProductManagement,
    #[serde(rename = "Project Management")]
    ProjectManagement,
    #[serde(rename = "Other")]
    Other,
    #[serde(rename = "Unspecified")]
    Unspecified,
}

impl RoleCategory {
    pub const ALL: [RoleCategory; 13] = [
        RoleCategory::SoftwareEngineering,
        RoleCategory::DataScienceMl,
        RoleCategory::DataAnalytics,
        RoleCategory::DataEngineering,
        RoleCategory::BusinessAnalysis,
        RoleCategory::DevOpsInfrastructure,
        RoleCategory::QaTesting,
        RoleCategory::ItSupport,
        RoleCategory::Cybersecurity,
        RoleCategory::ProductManagement,
        RoleCategory::ProjectManagement,
        RoleCategory::Other,
        RoleCategory::Unspecified,
    ];

    pub fn label(self) -> &'static str {
        match self {
            RoleCategory::SoftwareEngineering => "Software Engineering",
            RoleCategory::DataScienceMl => "Data Science & ML",
            RoleCategory::DataAnalytics => "Data Analytics",
            RoleCategory::DataEngineering => "Data Engineering",
            RoleCategory::BusinessAnalysis => "Business Analysis",
            RoleCategory::DevOpsInfrastructure => "DevOps & Infrastructure",
            RoleCategory::QaTesting => "QA & Testing",
            RoleCategory::ItSupport => "IT Support",
            RoleCategory::Cybersecurity => "Cybersecurity",
            RoleCategory::ProductManagement => "Product Management",
            RoleCategory::ProjectManagement => "Project Management",
            RoleCategory::Other => "Other",
            RoleCategory::Unspecified => "Unspecified",
        }
    }
}

impl fmt::Display for RoleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for RoleCategory {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        RoleCategory::ALL
            .into_iter()
            .find(|c| c.label().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownVariant {
                kind: "role category",
                value: s.to_string(),
            })
    }
}

/// Search terms the fetch plan uses, mapped to the family they target.
/// Keys are compared after [`normalize_query`].
const QUERY_CATEGORIES: &[(&str, RoleCategory)] = &[
    ("software", RoleCategory::SoftwareEngineering),
    ("software engineer", RoleCategory::SoftwareEngineering),
    ("software developer", RoleCategory::SoftwareEngineering),
    ("software engineering", RoleCategory::SoftwareEngineering),
    ("developer", RoleCategory::SoftwareEngineering),
    ("programming", RoleCategory::SoftwareEngineering),
    ("web developer", RoleCategory::SoftwareEngineering),
    ("frontend", RoleCategory::SoftwareEngineering),
    ("frontend developer", RoleCategory::SoftwareEngineering),
    ("backend", RoleCategory::SoftwareEngineering),
    ("backend developer", RoleCategory::SoftwareEngineering),
    ("full stack", RoleCategory::SoftwareEngineering),
    ("full stack developer", RoleCategory::SoftwareEngineering),
    ("mobile developer", RoleCategory::SoftwareEngineering),
    ("application developer", RoleCategory::SoftwareEngineering),
    ("python", RoleCategory::SoftwareEngineering),
    ("java", RoleCategory::SoftwareEngineering),
    ("javascript", RoleCategory::SoftwareEngineering),
    ("data science", RoleCategory::DataScienceMl),
    ("data scientist", RoleCategory::DataScienceMl),
    ("machine learning", RoleCategory::DataScienceMl),
    ("artificial intelligence", RoleCategory::DataScienceMl),
    ("data", RoleCategory::DataAnalytics),
    ("data analyst", RoleCategory::DataAnalytics),
    ("analytics", RoleCategory::DataAnalytics),
    ("business intelligence", RoleCategory::DataAnalytics),
    ("data engineer", RoleCategory::DataEngineering),
    ("database", RoleCategory::DataEngineering),
    ("database administrator", RoleCategory::DataEngineering),
    ("business analyst", RoleCategory::BusinessAnalysis),
    ("systems analyst", RoleCategory::BusinessAnalysis),
    ("system administrator", RoleCategory::DevOpsInfrastructure),
    ("network", RoleCategory::DevOpsInfrastructure),
    ("network engineer", RoleCategory::DevOpsInfrastructure),
    ("infrastructure", RoleCategory::DevOpsInfrastructure),
    ("devops", RoleCategory::DevOpsInfrastructure),
    ("cloud", RoleCategory::DevOpsInfrastructure),
    ("aws", RoleCategory::DevOpsInfrastructure),
    ("azure", RoleCategory::DevOpsInfrastructure),
    ("qa", RoleCategory::QaTesting),
    ("qa engineer", RoleCategory::QaTesting),
    ("testing", RoleCategory::QaTesting),
    ("test engineer", RoleCategory::QaTesting),
    ("it support", RoleCategory::ItSupport),
    ("technical support", RoleCategory::ItSupport),
    ("help desk", RoleCategory::ItSupport),
    ("cybersecurity", RoleCategory::Cybersecurity),
    ("security", RoleCategory::Cybersecurity),
    ("product manager", RoleCategory::ProductManagement),
    ("project manager", RoleCategory::ProjectManagement),
];

/// Ordered title buckets; the first bucket with a matching term wins.
/// Terms are matched against a space-padded, punctuation-free title, so a
/// leading or trailing space in a term anchors it to a word edge.
const TITLE_RULES: &[(&[&str], RoleCategory)] = &[
    (
        &["data scientist", "machine learning", "ml engineer", " ai "],
        RoleCategory::DataScienceMl,
    ),
    (
        &["data analyst", "business intelligence", "analytics"],
        RoleCategory::DataAnalytics,
    ),
    (
        &["data engineer", "data architect", " etl "],
        RoleCategory::DataEngineering,
    ),
    (
        &["business analyst", "systems analyst", "functional analyst"],
        RoleCategory::BusinessAnalysis,
    ),
    (
        &["software engineer", "software developer", "developer", "engineer", "programmer"],
        RoleCategory::SoftwareEngineering,
    ),
    (
        &["devops", " sre ", "infrastructure", "cloud"],
        RoleCategory::DevOpsInfrastructure,
    ),
    (
        &[" qa ", " test", "quality assurance"],
        RoleCategory::QaTesting,
    ),
    (
        &["support", "help desk", "service desk"],
        RoleCategory::ItSupport,
    ),
    (
        &["security", "infosec"],
        RoleCategory::Cybersecurity,
    ),
    (
        &["product manager", "product owner"],
        RoleCategory::ProductManagement,
    ),
    (
        &["project manager", "program manager", "scrum master"],
        RoleCategory::ProjectManagement,
    ),
];

/// Trim and collapse every run of whitespace into a single space.
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lower-case a search term and fold URL-style separators (`software-engineer`).
pub fn normalize_query(query: &str) -> String {
    collapse_whitespace(&query.to_lowercase().replace(['-', '_', '+'], " "))
}

pub fn categorize_query(query: &str) -> Option<RoleCategory> {
    let key = normalize_query(query);
    QUERY_CATEGORIES
        .iter()
        .find(|(term, _)| *term == key)
        .map(|(_, category)| *category)
}

pub fn categorize_title(title: &str) -> Option<RoleCategory> {
    let cleaned = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>();
    let padded = format!(" {} ", collapse_whitespace(&cleaned));
    TITLE_RULES
        .iter()
        .find(|(terms, _)| terms.iter().any(|term| padded.contains(term)))
        .map(|(_, category)| *category)
}

/// Query lookup first, then the title heuristic. Records that carry no
/// originating query and match nothing are `Unspecified`; everything else
/// falls back to `Other`.
pub fn infer_role_category(query: Option<&str>, title: &str) -> RoleCategory {
    let query = query.map(str::trim).filter(|q| !q.is_empty());
    if let Some(category) = query.and_then(categorize_query) {
        return category;
    }
    if let Some(category) = categorize_title(title) {
        return category;
    }
    if query.is_some() {
        RoleCategory::Other
    } else {
        RoleCategory::Unspecified
    }
}

/// One listing card as extracted from a board's results page, before
/// normalization. Every field is optional; the normalizer decides what is
/// required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub posted_at: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
}

/// Normalized job listing; one row of the merged store.
///
/// Field order is the store's column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub source: Source,
    pub title: String,
    pub company: String,
    pub location: String,
    pub posted_at: Option<String>,
    pub description: Option<String>,
    pub url: String,
    pub role_category: RoleCategory,
    pub query: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

pub const STORE_COLUMNS: [&str; 10] = [
    "source",
    "title",
    "company",
    "location",
    "posted_at",
    "description",
    "url",
    "role_category",
    "query",
    "fetched_at",
];

impl Posting {
    /// Title plus description, the text the skill analyzer scans.
    pub fn searchable_text(&self) -> String {
        match self.description.as_deref() {
            Some(desc) if !desc.trim().is_empty() => format!("{} {}", self.title, desc),
            _ => self.title.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillCategory {
    Language,
    Framework,
    Cloud,
    Database,
    Tool,
}

impl SkillCategory {
    pub const ALL: [SkillCategory; 5] = [
        SkillCategory::Language,
        SkillCategory::Framework,
        SkillCategory::Cloud,
        SkillCategory::Database,
        SkillCategory::Tool,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            SkillCategory::Language => "language",
            SkillCategory::Framework => "framework",
            SkillCategory::Cloud => "cloud",
            SkillCategory::Database => "database",
            SkillCategory::Tool => "tool",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SkillCategory::Language => "Programming Languages",
            SkillCategory::Framework => "Frameworks & Libraries",
            SkillCategory::Cloud => "Cloud & DevOps",
            SkillCategory::Database => "Databases",
            SkillCategory::Tool => "Tools & Technologies",
        }
    }
}

impl fmt::Display for SkillCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Derived skill frequency; regenerable from postings at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillRecord {
    pub skill_name: String,
    pub category: SkillCategory,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTotal {
    pub category: SkillCategory,
    pub mentions: usize,
    pub distinct_skills: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_parses_slug_and_display_name() {
        assert_eq!("prosple".parse::<Source>().unwrap(), Source::Prosple);
        assert_eq!("Prosple".parse::<Source>().unwrap(), Source::Prosple);
        assert_eq!("workforce-au".parse::<Source>().unwrap(), Source::WorkforceAu);
        assert_eq!("Workforce Australia".parse::<Source>().unwrap(), Source::WorkforceAu);
        assert_eq!("CareerOne".parse::<Source>().unwrap(), Source::Careerone);
        assert!("monster".parse::<Source>().is_err());
    }

    #[test]
    fn role_category_round_trips_through_label() {
        for category in RoleCategory::ALL {
            assert_eq!(category.label().parse::<RoleCategory>().unwrap(), category);
        }
    }

    #[test]
    fn query_lookup_tolerates_url_style_terms() {
        assert_eq!(
            categorize_query("software-engineer"),
            Some(RoleCategory::SoftwareEngineering)
        );
        assert_eq!(categorize_query("  Data   Analyst "), Some(RoleCategory::DataAnalytics));
        assert_eq!(categorize_query("technology"), None);
    }

    #[test]
    fn title_heuristic_checks_buckets_in_order() {
        assert_eq!(categorize_title("Senior Data Engineer"), Some(RoleCategory::DataEngineering));
        assert_eq!(categorize_title("Graduate Software Developer"), Some(RoleCategory::SoftwareEngineering));
        assert_eq!(categorize_title("AI Research Lead"), Some(RoleCategory::DataScienceMl));
        assert_eq!(categorize_title("Email Marketing Coordinator"), None);
        assert_eq!(categorize_title("QA Analyst"), Some(RoleCategory::QaTesting));
        assert_eq!(categorize_title("Latest Opportunities Officer"), None);
    }

    #[test]
    fn inference_falls_back_to_other_or_unspecified() {
        assert_eq!(
            infer_role_category(Some("technology"), "Graduate Program"),
            RoleCategory::Other
        );
        assert_eq!(
            infer_role_category(Some("technology"), "Cloud Platform Intern"),
            RoleCategory::DevOpsInfrastructure
        );
        assert_eq!(infer_role_category(None, "Graduate Program"), RoleCategory::Unspecified);
        assert_eq!(infer_role_category(Some("   "), "Graduate Program"), RoleCategory::Unspecified);
        assert_eq!(
            infer_role_category(Some("data analyst"), "Graduate Program"),
            RoleCategory::DataAnalytics
        );
    }

    #[test]
    fn searchable_text_appends_description_when_present() {
        let posting = Posting {
            source: Source::Seek,
            title: "Rust Engineer".into(),
            company: "Acme".into(),
            location: String::new(),
            posted_at: None,
            description: Some("Tokio and AWS".into()),
            url: "https://www.seek.com.au/job/1".into(),
            role_category: RoleCategory::SoftwareEngineering,
            query: None,
            fetched_at: Utc::now(),
        };
        assert_eq!(posting.searchable_text(), "Rust Engineer Tokio and AWS");
    }
}
