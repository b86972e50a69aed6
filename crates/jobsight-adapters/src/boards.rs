//! Result-page parsers and search URLs for each supported job board.

use jobsight_core::{collapse_whitespace, RawRecord, Source};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use url::{form_urlencoded, Url};

use crate::{LayoutMismatch, SearchRequest, SourceFetcher};

type ParseResult = Result<Vec<RawRecord>, LayoutMismatch>;

fn selector(css: &str) -> Result<Selector, LayoutMismatch> {
    Selector::parse(css).map_err(|e| LayoutMismatch(format!("bad selector {css:?}: {e}")))
}

fn text_or_none(value: &str) -> Option<String> {
    let collapsed = collapse_whitespace(value);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(el: ElementRef<'_>) -> Option<String> {
    text_or_none(&el.text().collect::<Vec<_>>().join(" "))
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope.select(sel).find_map(element_text)
}

fn ensure_html(body: &str) -> Result<(), LayoutMismatch> {
    if body.trim().is_empty() || !body.contains('<') {
        return Err(LayoutMismatch("response body is not html".to_string()));
    }
    Ok(())
}

/// Resolve a card link against the board's origin. Fragment-only and
/// script links are not job URLs.
pub fn absolutize(source: Source, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let base = Url::parse(source.base_url()).ok()?;
    base.join(href).ok().map(String::from)
}

/// `Software Engineer` -> `software-engineer`, as SEEK paths expect.
pub fn slugify(term: &str) -> String {
    term.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn with_query(base: &str, pairs: &[(&str, String)]) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        query.append_pair(key, value);
    }
    format!("{base}?{}", query.finish())
}

/// CSS selectors describing one board's result cards.
#[derive(Debug, Clone, Copy)]
pub struct CardLayout {
    /// Card container selectors, tried in order; the first that matches wins.
    pub cards: &'static [&'static str],
    pub link: &'static str,
    pub company: &'static str,
    pub location: &'static str,
    pub posted: Option<&'static str>,
    pub description: Option<&'static str>,
    /// Detail-page anchors used when no card container matches.
    pub fallback_links: Option<&'static str>,
}

pub const WORKFORCE_AU_LAYOUT: CardLayout = CardLayout {
    cards: &[
        "article.job-card, li.job-card, div.job-card",
        "li[data-testid*='job-card']",
    ],
    link: "a[href*='/individuals/jobs/details'], h3 a, h2 a",
    company: "[data-testid='company-name'], .company, .job-company",
    location: "[data-testid='job-location'], .location, .job-location",
    posted: Some("[data-testid='posted-date'], .posted, .time"),
    description: Some("[data-testid='job-summary'], .job-summary"),
    fallback_links: Some("a[href*='/individuals/jobs/details']"),
};

pub const SEEK_LAYOUT: CardLayout = CardLayout {
    cards: &[
        "[data-automation='job-card']",
        "article[data-automation='normalJob']",
    ],
    link: "a[data-automation='jobTitle']",
    company: "[data-automation='jobCompany']",
    location: "[data-automation='jobLocation']",
    posted: Some("[data-automation='jobListingDate']"),
    description: Some("[data-automation='jobShortDescription']"),
    fallback_links: None,
};

pub const INDEED_LAYOUT: CardLayout = CardLayout {
    cards: &[
        "div.job_seen_beacon",
        "div[class*='jobsearch-SerpJobCard'], div[data-jk]",
        "div.result, a.tapItem",
    ],
    link: "a.jcs-JobTitle, h2.jobTitle a, a[data-jk], a[aria-label]",
    company: ".companyName, span[data-testid='company-name'], span.company",
    location: ".companyLocation, div[data-testid='text-location'], div.location",
    posted: Some("span.date, span[data-testid='myJobsStateDate']"),
    description: Some("div.job-snippet"),
    fallback_links: None,
};

pub const JORA_LAYOUT: CardLayout = CardLayout {
    cards: &["article.job-card, div.job-card"],
    link: "a.job-title",
    company: ".job-company",
    location: ".job-location",
    posted: Some(".job-listed-date"),
    description: Some(".job-abstract"),
    fallback_links: Some("a.job-title"),
};

pub const CAREERONE_LAYOUT: CardLayout = CardLayout {
    cards: &["article", "div[data-automation='result']", "div.job"],
    link: "a[href*='/job/'], a[data-automation='job-title'], h2 a, h3 a",
    company: "[data-automation='company-name'], .company, .job-company",
    location: "[data-automation='job-location'], .location, .job-location",
    posted: Some(".posted, .time, [data-automation='job-age']"),
    description: None,
    fallback_links: Some("a[href*='/job/']"),
};

/// Extract one record per card. Cards are emitted even when a field is
/// missing; the normalizer decides which records are usable.
pub fn parse_cards(source: Source, html: &str, layout: &CardLayout) -> ParseResult {
    ensure_html(html)?;
    let document = Html::parse_document(html);
    let link = selector(layout.link)?;
    let any_link = selector("a[href]")?;
    let company = selector(layout.company)?;
    let location = selector(layout.location)?;
    let posted = layout.posted.map(selector).transpose()?;
    let description = layout.description.map(selector).transpose()?;

    for css in layout.cards {
        let card_sel = selector(css)?;
        let cards = document.select(&card_sel).collect::<Vec<_>>();
        if cards.is_empty() {
            continue;
        }
        return Ok(cards
            .into_iter()
            .map(|card| {
                let anchor = if card.value().name() == "a" {
                    Some(card)
                } else {
                    card.select(&link)
                        .next()
                        .or_else(|| card.select(&any_link).next())
                };
                RawRecord {
                    title: anchor.and_then(element_text),
                    company: first_text(card, &company),
                    location: first_text(card, &location),
                    posted_at: posted.as_ref().and_then(|sel| first_text(card, sel)),
                    description: description.as_ref().and_then(|sel| first_text(card, sel)),
                    url: anchor
                        .and_then(|a| a.value().attr("href"))
                        .and_then(|href| absolutize(source, href)),
                }
            })
            .collect());
    }

    let Some(fallback) = layout.fallback_links else {
        return Ok(Vec::new());
    };
    let fallback = selector(fallback)?;
    Ok(document
        .select(&fallback)
        .filter_map(|a| {
            let title = element_text(a)?;
            let url = absolutize(source, a.value().attr("href")?)?;
            Some(RawRecord {
                title: Some(title),
                url: Some(url),
                ..RawRecord::default()
            })
        })
        .collect())
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn prosple_record(opportunity: &JsonValue) -> RawRecord {
    let text_at = |path: &[&str]| json_str(opportunity, path).and_then(text_or_none);
    let company = text_at(&["parentEmployer", "title"])
        .or_else(|| text_at(&["parentEmployer", "advertiserName"]));
    let location = text_at(&["locationDescription"]).or_else(|| {
        let labels = opportunity
            .get("physicalLocations")?
            .as_array()?
            .iter()
            .filter_map(|loc| loc.get("label")?.as_str())
            .filter_map(text_or_none)
            .collect::<Vec<_>>();
        (!labels.is_empty()).then(|| labels.join(", "))
    });
    RawRecord {
        title: text_at(&["title"]),
        company,
        location,
        posted_at: text_at(&["applicationsOpenDate"]),
        description: text_at(&["overview", "summary"]),
        url: json_str(opportunity, &["detailPageURL"])
            .and_then(|href| absolutize(Source::Prosple, href)),
    }
}

/// Prosple renders with Next.js; the server-side payload carries the full
/// result set. Pages without it fall back to detail-page anchors.
pub fn parse_prosple(html: &str) -> ParseResult {
    ensure_html(html)?;
    let document = Html::parse_document(html);
    let script = selector("script#__NEXT_DATA__")?;

    if let Some(node) = document.select(&script).next() {
        let payload = node.text().collect::<String>();
        let data: JsonValue = serde_json::from_str(&payload)
            .map_err(|e| LayoutMismatch(format!("invalid __NEXT_DATA__ payload: {e}")))?;
        if let Some(opportunities) = data
            .pointer("/props/pageProps/initialResult/opportunities")
            .and_then(JsonValue::as_array)
        {
            return Ok(opportunities
                .iter()
                .filter(|o| o.is_object())
                .map(prosple_record)
                .collect());
        }
    }

    let anchors = selector(
        "a[href*='/graduate-jobs/'], a[href*='/internships/'], a[href*='/cadetships/']",
    )?;
    let company = selector(
        "[data-testid='organisation-name'], .organisation-name, .job-card__company, .company",
    )?;
    let location = selector("[data-testid='location'], .job-card__location, .location")?;

    Ok(document
        .select(&anchors)
        .filter_map(|a| {
            let title = element_text(a)?;
            let url = absolutize(Source::Prosple, a.value().attr("href")?)?;
            let card = a
                .ancestors()
                .filter_map(ElementRef::wrap)
                .find(|el| matches!(el.value().name(), "article" | "li" | "div"));
            Some(RawRecord {
                title: Some(title),
                company: card.and_then(|c| first_text(c, &company)),
                location: card.and_then(|c| first_text(c, &location)),
                url: Some(url),
                ..RawRecord::default()
            })
        })
        .collect())
}

#[derive(Debug, Clone, Copy)]
pub struct ProspleFetcher;

impl SourceFetcher for ProspleFetcher {
    fn source(&self) -> Source {
        Source::Prosple
    }

    fn page_url(&self, request: &SearchRequest, page: u32) -> String {
        with_query(
            "https://au.prosple.com/search-jobs",
            &[
                ("keywords", request.query.clone()),
                ("locations", request.location.clone()),
                ("page", page.to_string()),
            ],
        )
    }

    fn parse_page(&self, html: &str) -> ParseResult {
        parse_prosple(html)
    }
}

/// A board whose results are plain HTML cards.
#[derive(Debug, Clone, Copy)]
pub struct CardBoardFetcher {
    source: Source,
    layout: CardLayout,
    search_url: fn(&SearchRequest, u32) -> String,
}

impl SourceFetcher for CardBoardFetcher {
    fn source(&self) -> Source {
        self.source
    }

    fn page_url(&self, request: &SearchRequest, page: u32) -> String {
        (self.search_url)(request, page)
    }

    fn parse_page(&self, html: &str) -> ParseResult {
        parse_cards(self.source, html, &self.layout)
    }
}

fn workforce_au_url(request: &SearchRequest, page: u32) -> String {
    with_query(
        "https://www.workforceaustralia.gov.au/individuals/jobs/search",
        &[
            ("keyword", request.query.clone()),
            ("location", request.location.clone()),
            ("page", page.to_string()),
        ],
    )
}

fn seek_url(request: &SearchRequest, page: u32) -> String {
    let keyword = slugify(&request.query);
    let location = slugify(&request.location);
    if location.is_empty() {
        format!("https://www.seek.com.au/{keyword}-jobs?page={page}")
    } else {
        format!("https://www.seek.com.au/{keyword}-jobs/in-{location}?page={page}")
    }
}

fn indeed_url(request: &SearchRequest, page: u32) -> String {
    with_query(
        "https://au.indeed.com/jobs",
        &[
            ("q", request.query.clone()),
            ("l", request.location.clone()),
            ("start", (page.saturating_sub(1) * 10).to_string()),
            ("radius", "50".to_string()),
        ],
    )
}

fn jora_url(request: &SearchRequest, page: u32) -> String {
    with_query(
        "https://au.jora.com/j",
        &[
            ("keyword", request.query.clone()),
            ("l", request.location.clone()),
            ("p", page.to_string()),
        ],
    )
}

fn careerone_url(request: &SearchRequest, page: u32) -> String {
    with_query(
        "https://www.careerone.com.au/jobs",
        &[
            ("q", request.query.clone()),
            ("l", request.location.clone()),
            ("page", page.to_string()),
        ],
    )
}

pub fn prosple_fetcher() -> impl SourceFetcher {
    ProspleFetcher
}

pub fn workforce_au_fetcher() -> impl SourceFetcher {
    CardBoardFetcher {
        source: Source::WorkforceAu,
        layout: WORKFORCE_AU_LAYOUT,
        search_url: workforce_au_url,
    }
}

pub fn seek_fetcher() -> impl SourceFetcher {
    CardBoardFetcher {
        source: Source::Seek,
        layout: SEEK_LAYOUT,
        search_url: seek_url,
    }
}

pub fn indeed_fetcher() -> impl SourceFetcher {
    CardBoardFetcher {
        source: Source::Indeed,
        layout: INDEED_LAYOUT,
        search_url: indeed_url,
    }
}

pub fn jora_fetcher() -> impl SourceFetcher {
    CardBoardFetcher {
        source: Source::Jora,
        layout: JORA_LAYOUT,
        search_url: jora_url,
    }
}

pub fn careerone_fetcher() -> impl SourceFetcher {
    CardBoardFetcher {
        source: Source::Careerone,
        layout: CAREERONE_LAYOUT,
        search_url: careerone_url,
    }
}

pub fn fetcher_for_source(source: Source) -> Box<dyn SourceFetcher> {
    match source {
        Source::Prosple => Box::new(prosple_fetcher()),
        Source::WorkforceAu => Box::new(workforce_au_fetcher()),
        Source::Seek => Box::new(seek_fetcher()),
        Source::Indeed => Box::new(indeed_fetcher()),
        Source::Jora => Box::new(jora_fetcher()),
        Source::Careerone => Box::new(careerone_fetcher()),
    }
}
