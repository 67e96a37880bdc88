// src/services/frontier.rs

//! Frontier collector.
//!
//! Walks a site's paginated search interface and yields the candidate article
//! URLs found on each page. Pages are fetched lazily, one per `next_page` call.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{CrawlerConfig, SiteConfig, WorkItem};
use crate::utils::http::{PageSource, RetryPolicy, fetch_with_retry};
use crate::utils::resolve_url;

/// One search results page and the new candidates found on it.
#[derive(Debug, Clone)]
pub struct FrontierPage {
    /// 1-based page index
    pub page_index: u32,
    pub catalog_url: String,
    pub candidates: Vec<WorkItem>,
}

/// How many pages a frontier will walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pagination {
    /// Derived from the site's total hit count
    Counted { pages: u32 },
    /// Until a finish marker, an empty page, or the limit
    Unbounded,
}

/// Builds frontiers for configured sites.
pub struct FrontierCollector {
    source: Arc<dyn PageSource>,
    retry: RetryPolicy,
    request_delay: Duration,
}

impl FrontierCollector {
    pub fn new(source: Arc<dyn PageSource>, config: &CrawlerConfig) -> Self {
        Self {
            source,
            retry: RetryPolicy::from_config(config),
            request_delay: Duration::from_millis(config.request_delay_ms),
        }
    }

    /// Start a lazy frontier over `site` for `keywords`, capped at `limit` URLs.
    pub fn collect(&self, site: &SiteConfig, keywords: &[String], limit: usize) -> Frontier {
        let meta_info = serde_json::json!({ "search_terms": keywords }).to_string();
        Frontier {
            source: Arc::clone(&self.source),
            retry: self.retry,
            request_delay: self.request_delay,
            site: site.clone(),
            keywords: keywords.to_vec(),
            meta_info,
            limit,
            next_index: 1,
            pagination: None,
            seen: HashSet::new(),
            emitted: 0,
            fetched: 0,
            done: false,
        }
    }
}

/// Cursor over the search pages of one site and keyword set.
pub struct Frontier {
    source: Arc<dyn PageSource>,
    retry: RetryPolicy,
    request_delay: Duration,
    site: SiteConfig,
    keywords: Vec<String>,
    meta_info: String,
    limit: usize,
    next_index: u32,
    pagination: Option<Pagination>,
    seen: HashSet<String>,
    emitted: usize,
    fetched: usize,
    done: bool,
}

impl Frontier {
    /// Resume from a 1-based page index.
    pub fn starting_at(mut self, page_index: u32) -> Self {
        self.next_index = page_index.max(1);
        self
    }

    /// Candidates yielded so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Search pages requested so far.
    pub fn pages_fetched(&self) -> usize {
        self.fetched
    }

    /// Fetch the next page, or `None` once the frontier is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<FrontierPage>> {
        if self.done || self.emitted >= self.limit {
            self.done = true;
            return Ok(None);
        }
        if let Some(Pagination::Counted { pages }) = self.pagination
            && self.next_index > pages
        {
            self.done = true;
            return Ok(None);
        }

        if self.fetched > 0 && !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }

        let page_index = self.next_index;
        let catalog_url = self.site.page_url(&self.keywords, page_index)?;
        let body = match fetch_with_retry(self.source.as_ref(), &catalog_url, &self.retry).await {
            Ok(body) => body,
            Err(e) => {
                self.done = true;
                return Err(e);
            }
        };
        self.fetched += 1;

        let parsed = parse_page(&self.site, &catalog_url, &body)?;

        if self.pagination.is_none() {
            let pagination = match parsed.total_hits {
                Some(hits) => {
                    let capped = hits.min(self.limit as u64);
                    let per_page = self.site.urls_per_page as u64;
                    Pagination::Counted {
                        pages: capped.div_ceil(per_page) as u32,
                    }
                }
                None => Pagination::Unbounded,
            };
            tracing::info!(
                site = %self.site.name,
                hits = ?parsed.total_hits,
                ?pagination,
                "Frontier pagination resolved"
            );
            self.pagination = Some(pagination);

            if let Pagination::Counted { pages } = pagination
                && page_index > pages
            {
                self.done = true;
                return Ok(None);
            }
        }

        let remaining = self.limit - self.emitted;
        let candidates: Vec<WorkItem> = parsed
            .links
            .into_iter()
            .filter(|link| self.seen.insert(link.clone()))
            .take(remaining)
            .map(|link| {
                let (is_pdf, language) = self.site.classify(&link);
                WorkItem::discovered(
                    link,
                    catalog_url.clone(),
                    is_pdf,
                    language,
                    Some(self.meta_info.clone()),
                )
            })
            .collect();

        if candidates.is_empty() {
            tracing::debug!(site = %self.site.name, page_index, "No new anchors, frontier done");
            self.done = true;
            return Ok(None);
        }
        if parsed.finished {
            self.done = true;
        }

        self.emitted += candidates.len();
        self.next_index += 1;
        tracing::debug!(
            site = %self.site.name,
            page_index,
            found = candidates.len(),
            total = self.emitted,
            "Frontier page collected"
        );

        Ok(Some(FrontierPage {
            page_index,
            catalog_url,
            candidates,
        }))
    }
}

struct ParsedPage {
    total_hits: Option<u64>,
    finished: bool,
    links: Vec<String>,
}

fn selector(raw: &str) -> Result<Selector> {
    Selector::parse(raw).map_err(|e| AppError::selector(raw, format!("{e:?}")))
}

/// Read a hit count ("1 234 results" -> 1234).
///
/// The text must hold exactly one number; digit groups may be separated by
/// spaces or commas. Anything else is treated as malformed.
fn parse_hits(text: &str) -> Option<u64> {
    let re = Regex::new(r"\d{1,3}(?:[ ,\u{a0}]\d{3})+|\d+").ok()?;
    let mut numbers = re.find_iter(text);
    let number = numbers.next()?;
    if numbers.next().is_some() {
        return None;
    }
    let digits: String = number.as_str().chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn parse_page(site: &SiteConfig, page_url: &str, body: &str) -> Result<ParsedPage> {
    let document = Html::parse_document(body);
    let base = Url::parse(page_url)?;

    let total_hits = match &site.total_hits_selector {
        Some(raw) => {
            let sel = selector(raw)?;
            document
                .select(&sel)
                .next()
                .and_then(|el| parse_hits(&el.text().collect::<String>()))
        }
        None => None,
    };

    let finished = match &site.finish_selector {
        Some(raw) => document.select(&selector(raw)?).next().is_some(),
        None => false,
    };

    let anchor = selector(&site.anchor_selector)?;
    let links = document
        .select(&anchor)
        .filter_map(|el| el.value().attr(&site.anchor_attr))
        .map(|href| resolve_url(&base, href.trim()))
        .filter(|link| site.link_filter.accepts(link))
        .collect();

    Ok(ParsedPage {
        total_hits,
        finished,
        links,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LinkFilter;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Serves generated result pages and records every request.
    struct StubSource {
        render: Box<dyn Fn(u32) -> Option<String> + Send + Sync>,
        requests: Mutex<Vec<String>>,
    }

    impl StubSource {
        fn new(render: impl Fn(u32) -> Option<String> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                render: Box::new(render),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PageSource for StubSource {
        async fn fetch(&self, url: &str) -> Result<String> {
            self.requests.lock().unwrap().push(url.to_string());
            let page = Url::parse(url)?
                .query_pairs()
                .find(|(k, _)| k == "page")
                .and_then(|(_, v)| v.parse().ok())
                .unwrap_or(1);
            (self.render)(page).ok_or_else(|| AppError::fetch(url, 1, "unreachable"))
        }
    }

    fn site(per_page: usize, hits_selector: bool) -> SiteConfig {
        SiteConfig {
            name: "stub".into(),
            domains: vec!["search.test".into()],
            search_url: "https://search.test/?q={query}&from={offset}&page={page}".into(),
            term_format: "({term})".into(),
            keyword_join: " OR ".into(),
            encode_query: true,
            urls_per_page: per_page,
            offset_base: 1,
            anchor_selector: "a.result".into(),
            anchor_attr: "href".into(),
            total_hits_selector: hits_selector.then(|| "#TotalHits".to_string()),
            finish_selector: Some("div.no-more".into()),
            link_filter: LinkFilter {
                allow: vec![],
                deny: vec!["format".into()],
            },
            pdf_markers: vec![".pdf".into()],
            language: Some("en".into()),
            language_param: None,
            miner: None,
        }
    }

    fn results(hits: Option<&str>, ids: impl Iterator<Item = usize>, finished: bool) -> String {
        let mut html = String::from("<html><body>");
        if let Some(hits) = hits {
            html.push_str(&format!("<span id=\"TotalHits\">{hits}</span>"));
        }
        for id in ids {
            html.push_str(&format!("<a class=\"result\" href=\"/a/{id}\">Article {id}</a>"));
        }
        if finished {
            html.push_str("<div class=\"no-more\">No more results</div>");
        }
        html.push_str("</body></html>");
        html
    }

    fn collector(source: Arc<StubSource>) -> FrontierCollector {
        let config = CrawlerConfig {
            request_delay_ms: 0,
            fetch_retries: 1,
            backoff_ms: 1,
            ..CrawlerConfig::default()
        };
        FrontierCollector::new(source, &config)
    }

    fn keywords() -> Vec<String> {
        vec!["virus".into(), "covid".into()]
    }

    async fn drain(frontier: &mut Frontier) -> Vec<FrontierPage> {
        let mut pages = Vec::new();
        while let Some(page) = frontier.next_page().await.unwrap() {
            pages.push(page);
        }
        pages
    }

    #[test]
    fn test_parse_hits() {
        assert_eq!(parse_hits("1 234"), Some(1234));
        assert_eq!(parse_hits(" 37 results"), Some(37));
        assert_eq!(parse_hits("none"), None);
        assert_eq!(parse_hits("12,345 articles"), Some(12345));
        assert_eq!(parse_hits("1234"), Some(1234));
    }

    #[test]
    fn test_parse_hits_rejects_several_numbers() {
        assert_eq!(parse_hits("Showing 1-15 of 37"), None);
        assert_eq!(parse_hits("page 2 of 10"), None);
    }

    #[tokio::test]
    async fn test_counted_pages_truncate_last_page() {
        // Every page renders 15 anchors; ids continue across pages.
        let source = StubSource::new(|page| {
            let start = (page as usize - 1) * 15;
            Some(results(Some("37"), start..start + 15, false))
        });
        let mut frontier = collector(source.clone()).collect(&site(15, true), &keywords(), 37);

        let pages = drain(&mut frontier).await;

        assert_eq!(source.request_count(), 3);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[2].candidates.len(), 7);
        assert_eq!(frontier.emitted(), 37);
    }

    #[tokio::test]
    async fn test_single_page_when_limit_fits() {
        let source = StubSource::new(|page| {
            let start = (page as usize - 1) * 25;
            Some(results(Some("1 000"), start..start + 25, false))
        });
        let mut frontier = collector(source.clone()).collect(&site(25, true), &keywords(), 25);

        let pages = drain(&mut frontier).await;

        assert_eq!(source.request_count(), 1);
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].candidates.len(), 25);
        assert_eq!(pages[0].page_index, 1);
    }

    #[tokio::test]
    async fn test_candidates_carry_discovery_fields() {
        let source = StubSource::new(|_| Some(results(Some("2"), 0..2, false)));
        let mut frontier = collector(source).collect(&site(15, true), &keywords(), 100);

        let page = frontier.next_page().await.unwrap().unwrap();
        let item = &page.candidates[0];

        assert_eq!(item.article_url, "https://search.test/a/0");
        assert_eq!(item.catalog_url, page.catalog_url);
        assert_eq!(item.language.as_deref(), Some("en"));
        assert_eq!(
            item.meta_info.as_deref(),
            Some(r#"{"search_terms":["virus","covid"]}"#)
        );
        assert!(frontier.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unbounded_stops_at_finish_marker() {
        let source = StubSource::new(|page| {
            let start = (page as usize - 1) * 10;
            Some(results(None, start..start + 10, page == 3))
        });
        let mut frontier = collector(source.clone()).collect(&site(10, false), &keywords(), 1_000);

        let pages = drain(&mut frontier).await;

        assert_eq!(pages.len(), 3);
        assert_eq!(source.request_count(), 3);
    }

    #[tokio::test]
    async fn test_unbounded_stops_when_no_new_anchors() {
        // Page 2 repeats page 1.
        let source = StubSource::new(|page| Some(results(None, 0..10, page > 5)));
        let mut frontier = collector(source.clone()).collect(&site(10, false), &keywords(), 1_000);

        let pages = drain(&mut frontier).await;

        assert_eq!(pages.len(), 1);
        assert_eq!(source.request_count(), 2);
    }

    #[tokio::test]
    async fn test_malformed_hit_count_falls_back_to_unbounded() {
        let source = StubSource::new(|page| {
            let start = (page as usize - 1) * 5;
            (page <= 2).then(|| results(Some("many"), start..start + 5, page == 2))
        });
        let mut frontier = collector(source).collect(&site(5, true), &keywords(), 100);

        let pages = drain(&mut frontier).await;
        assert_eq!(pages.len(), 2);
    }

    #[tokio::test]
    async fn test_range_hit_text_pages_until_empty() {
        let source = StubSource::new(|page| {
            let start = (page as usize - 1) * 15;
            let ids = if page <= 3 { start..start + 15 } else { 0..0 };
            Some(results(Some("Showing 1-15 of 37"), ids, false))
        });
        let mut frontier = collector(source.clone()).collect(&site(15, true), &keywords(), 1_000);

        let pages = drain(&mut frontier).await;

        assert_eq!(pages.len(), 3);
        assert_eq!(frontier.emitted(), 45);
        assert_eq!(source.request_count(), 4);
    }

    #[tokio::test]
    async fn test_starting_at_resumes() {
        let source = StubSource::new(|page| {
            let start = (page as usize - 1) * 15;
            Some(results(Some("45"), start..start + 15, false))
        });
        let mut frontier = collector(source.clone())
            .collect(&site(15, true), &keywords(), 45)
            .starting_at(3);

        let pages = drain(&mut frontier).await;

        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page_index, 3);
        assert_eq!(pages[0].candidates[0].article_url, "https://search.test/a/30");
    }

    #[tokio::test]
    async fn test_fetch_error_surfaces_after_retries() {
        let source = StubSource::new(|_| None);
        let mut frontier = collector(source.clone()).collect(&site(15, true), &keywords(), 10);

        let err = frontier.next_page().await.unwrap_err();

        assert!(matches!(err, AppError::Fetch { attempts: 2, .. }));
        assert_eq!(source.request_count(), 2);
        assert!(frontier.next_page().await.unwrap().is_none());
    }
}
