//! Per-site search and mining configuration.
//!
//! Every publication site is described by data instead of code: where its
//! search page lives, how keywords are composed, which anchors are articles,
//! and how pagination is signalled.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AppError, Result};

/// Search and mining settings for one publication site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Site name used on the command line (e.g. "scielo")
    pub name: String,

    /// Registrable domains served by this site (e.g. "scielo.br")
    pub domains: Vec<String>,

    /// Search page template.
    ///
    /// Supported placeholders:
    /// - `{query}`: composed keyword query
    /// - `{page}`: 1-based page index, `{page0}`: 0-based page index
    /// - `{offset}`: index of the first result on the page
    /// - `{per_page}`: results per page
    pub search_url: String,

    /// Template applied to each keyword, e.g. `({term})`
    #[serde(default = "defaults::term_format")]
    pub term_format: String,

    /// Boolean separator placed between keywords, e.g. ` OR ` or `+AND+`
    #[serde(default = "defaults::keyword_join")]
    pub keyword_join: String,

    /// Form-urlencode the composed query before substitution
    #[serde(default = "defaults::encode_query")]
    pub encode_query: bool,

    /// Number of results shown per search page
    pub urls_per_page: usize,

    /// Offset of the first result on page 1 (0 or 1 depending on the site)
    #[serde(default)]
    pub offset_base: usize,

    /// CSS selector for article anchors on a search page
    pub anchor_selector: String,

    /// Attribute holding the article link
    #[serde(default = "defaults::anchor_attr")]
    pub anchor_attr: String,

    /// CSS selector for the total hit count, when the site shows one
    #[serde(default)]
    pub total_hits_selector: Option<String>,

    /// CSS selector for the "no more results" marker
    #[serde(default)]
    pub finish_selector: Option<String>,

    /// Allow/deny predicate for article links
    #[serde(default)]
    pub link_filter: LinkFilter,

    /// URL substrings marking a PDF link
    #[serde(default)]
    pub pdf_markers: Vec<String>,

    /// Default language of the site's articles
    #[serde(default)]
    pub language: Option<String>,

    /// Query parameter carrying the article language (e.g. "tlng")
    #[serde(default)]
    pub language_param: Option<String>,

    /// Selectors used by the generic page miner
    #[serde(default)]
    pub miner: Option<MinerSelectors>,
}

impl SiteConfig {
    /// Compose the keyword query, e.g. `(virus) OR (covid)`.
    pub fn search_query(&self, keywords: &[String]) -> String {
        keywords
            .iter()
            .map(|term| self.term_format.replace("{term}", term.trim()))
            .collect::<Vec<_>>()
            .join(&self.keyword_join)
    }

    /// Build the search URL for a 1-based page index.
    ///
    /// Pure: the same inputs always give the same URL.
    pub fn page_url(&self, keywords: &[String], page_index: u32) -> Result<String> {
        if page_index == 0 {
            return Err(AppError::validation("page index is 1-based"));
        }

        let query = self.search_query(keywords);
        let query = if self.encode_query {
            url::form_urlencoded::byte_serialize(query.as_bytes()).collect::<String>()
        } else {
            query
        };
        let page = page_index as usize;
        let offset = self.urls_per_page * (page - 1) + self.offset_base;

        let rendered = self
            .search_url
            .replace("{query}", &query)
            .replace("{page0}", &(page - 1).to_string())
            .replace("{page}", &page.to_string())
            .replace("{offset}", &offset.to_string())
            .replace("{per_page}", &self.urls_per_page.to_string());

        Url::parse(&rendered)?;
        Ok(rendered)
    }

    /// Classify a candidate URL: (is_pdf, language).
    pub fn classify(&self, article_url: &str) -> (bool, Option<String>) {
        let is_pdf = self
            .pdf_markers
            .iter()
            .any(|marker| article_url.contains(marker.as_str()));

        let from_query = self.language_param.as_deref().and_then(|param| {
            Url::parse(article_url).ok().and_then(|url| {
                url.query_pairs()
                    .find(|(key, value)| key == param && !value.is_empty())
                    .map(|(_, value)| value.into_owned())
            })
        });

        (is_pdf, from_query.or_else(|| self.language.clone()))
    }

    /// Whether a host belongs to this site.
    pub fn serves(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        self.domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
    }

    /// Validate values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::validation("site name is empty"));
        }
        if self.domains.is_empty() {
            return Err(AppError::validation(format!(
                "site '{}' has no domains",
                self.name
            )));
        }
        if self.urls_per_page == 0 {
            return Err(AppError::validation(format!(
                "site '{}': urls_per_page must be > 0",
                self.name
            )));
        }
        if !self.search_url.contains("{query}") {
            return Err(AppError::validation(format!(
                "site '{}': search_url has no {{query}} placeholder",
                self.name
            )));
        }
        scraper::Selector::parse(&self.anchor_selector)
            .map_err(|e| AppError::selector(&self.anchor_selector, format!("{e:?}")))?;
        Ok(())
    }
}

/// Allow/deny predicate for anchors found on a search page.
///
/// A link passes when it matches no `deny` substring and, if `allow` is
/// non-empty, at least one `allow` substring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkFilter {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl LinkFilter {
    pub fn accepts(&self, link: &str) -> bool {
        if self.deny.iter().any(|d| link.contains(d.as_str())) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|a| link.contains(a.as_str()))
    }
}

/// CSS selectors for the generic page miner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerSelectors {
    pub title: String,
    pub authors: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub publication_date: Option<String>,
}

mod defaults {
    pub fn term_format() -> String {
        "{term}".into()
    }
    pub fn keyword_join() -> String {
        " OR ".into()
    }
    pub fn encode_query() -> bool {
        true
    }
    pub fn anchor_attr() -> String {
        "href".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scielo_like() -> SiteConfig {
        SiteConfig {
            name: "scielo".into(),
            domains: vec!["scielo.br".into()],
            search_url: "https://search.scielo.org/?q={query}&count={per_page}&from={offset}&page={page}".into(),
            term_format: "({term})".into(),
            keyword_join: " OR ".into(),
            encode_query: true,
            urls_per_page: 15,
            offset_base: 1,
            anchor_selector: "a.showTooltip".into(),
            anchor_attr: "href".into(),
            total_hits_selector: Some("#TotalHits".into()),
            finish_selector: None,
            link_filter: LinkFilter {
                allow: vec!["sci_arttext".into(), "sci_pdf".into()],
                deny: vec![],
            },
            pdf_markers: vec!["sci_pdf".into()],
            language: None,
            language_param: Some("tlng".into()),
            miner: None,
        }
    }

    fn keywords(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_page_url_is_deterministic() {
        let site = scielo_like();
        let words = keywords(&["virus", "covid"]);
        let first = site.page_url(&words, 3).unwrap();

        assert_eq!(first, site.page_url(&words, 3).unwrap());
        assert_eq!(
            first,
            "https://search.scielo.org/?q=%28virus%29+OR+%28covid%29&count=15&from=31&page=3"
        );
    }

    #[test]
    fn test_page_url_rejects_zero_index() {
        assert!(scielo_like().page_url(&keywords(&["x"]), 0).is_err());
    }

    #[test]
    fn test_raw_and_composition() {
        let site = SiteConfig {
            search_url: "http://export.arxiv.org/find/all/1/all:+{query}/0/1/0/all/0/1?skip={offset}&show={per_page}".into(),
            term_format: "{term}".into(),
            keyword_join: "+AND+".into(),
            encode_query: false,
            urls_per_page: 25,
            offset_base: 0,
            ..scielo_like()
        };
        let url = site.page_url(&keywords(&["virus", "lung"]), 2).unwrap();
        assert_eq!(
            url,
            "http://export.arxiv.org/find/all/1/all:+virus+AND+lung/0/1/0/all/0/1?skip=25&show=25"
        );
    }

    #[test]
    fn test_classify_pdf_and_language() {
        let site = scielo_like();
        let (is_pdf, lang) =
            site.classify("https://www.scielo.br/scielo.php?script=sci_pdf&pid=S1&tlng=pt");
        assert!(is_pdf);
        assert_eq!(lang.as_deref(), Some("pt"));

        let (is_pdf, lang) =
            site.classify("https://www.scielo.br/scielo.php?script=sci_arttext&pid=S1");
        assert!(!is_pdf);
        assert_eq!(lang, None);
    }

    #[test]
    fn test_link_filter() {
        let filter = LinkFilter {
            allow: vec![],
            deny: vec!["format".into()],
        };
        assert!(filter.accepts("https://arxiv.org/abs/2101.00001"));
        assert!(!filter.accepts("https://arxiv.org/format/2101.00001"));

        let site = scielo_like();
        assert!(site.link_filter.accepts("https://x/scielo.php?script=sci_arttext"));
        assert!(!site.link_filter.accepts("https://x/about"));
    }

    #[test]
    fn test_serves_subdomains() {
        let site = scielo_like();
        assert!(site.serves("www.scielo.br"));
        assert!(site.serves("SCIELO.BR"));
        assert!(!site.serves("notscielo.br"));
    }

    #[test]
    fn test_validate_requires_query_placeholder() {
        let mut site = scielo_like();
        assert!(site.validate().is_ok());
        site.search_url = "https://search.scielo.org/".into();
        assert!(site.validate().is_err());
    }
}
