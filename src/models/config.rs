//! Application configuration structures.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::SiteConfig;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backing tables and undone query behavior
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// HTTP and frontier fetch behavior
    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Batching window for newly discovered URLs
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Per-worker mining behavior
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Publication site definitions
    #[serde(default = "defaults::sites")]
    pub sites: Vec<SiteConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!(
                path = ?path.as_ref(),
                error = %e,
                "Config load failed, using defaults"
            );
            Self::default()
        })
    }

    /// Find a site by name (case-insensitive).
    pub fn site(&self, name: &str) -> Option<&SiteConfig> {
        self.sites
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.ledger.status_table.trim().is_empty() {
            return Err(AppError::validation("ledger.status_table is empty"));
        }
        if self.ledger.data_table.trim().is_empty() {
            return Err(AppError::validation("ledger.data_table is empty"));
        }
        if self.ledger.status_table == self.ledger.data_table {
            return Err(AppError::validation(
                "ledger.status_table and ledger.data_table must differ",
            ));
        }
        if self.ledger.undone_page_size == 0 {
            return Err(AppError::validation("ledger.undone_page_size must be > 0"));
        }
        if self.crawler.user_agent.trim().is_empty() {
            return Err(AppError::validation("crawler.user_agent is empty"));
        }
        if self.crawler.timeout_secs == 0 {
            return Err(AppError::validation("crawler.timeout_secs must be > 0"));
        }
        if self.dispatcher.window_secs == 0 {
            return Err(AppError::validation("dispatcher.window_secs must be > 0"));
        }
        if self.dispatcher.max_flush_attempts == 0 {
            return Err(AppError::validation(
                "dispatcher.max_flush_attempts must be > 0",
            ));
        }
        if self.worker.mining_timeout_secs == 0 {
            return Err(AppError::validation(
                "worker.mining_timeout_secs must be > 0",
            ));
        }
        if self.worker.max_in_flight != 1 {
            return Err(AppError::validation(
                "worker.max_in_flight must be 1 (one message per worker)",
            ));
        }
        if self.sites.is_empty() {
            return Err(AppError::validation("No sites defined"));
        }

        let mut names = HashSet::new();
        for site in &self.sites {
            site.validate()?;
            if !names.insert(site.name.to_lowercase()) {
                return Err(AppError::validation(format!(
                    "Duplicate site name '{}'",
                    site.name
                )));
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            crawler: CrawlerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            worker: WorkerConfig::default(),
            sites: defaults::sites(),
        }
    }
}

/// Ledger table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Table holding work item rows
    #[serde(default = "defaults::status_table")]
    pub status_table: String,

    /// Table holding mined records
    #[serde(default = "defaults::data_table")]
    pub data_table: String,

    /// Exclude PDF items from the undone query
    #[serde(default = "defaults::skip_pdf")]
    pub skip_pdf: bool,

    /// Maximum rows returned by one undone query
    #[serde(default = "defaults::undone_page_size")]
    pub undone_page_size: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            status_table: defaults::status_table(),
            data_table: defaults::data_table(),
            skip_pdf: defaults::skip_pdf(),
            undone_page_size: defaults::undone_page_size(),
        }
    }
}

/// HTTP client and frontier fetch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Delay between consecutive search page fetches in milliseconds
    #[serde(default = "defaults::request_delay")]
    pub request_delay_ms: u64,

    /// Retries after the first failed fetch
    #[serde(default = "defaults::fetch_retries")]
    pub fetch_retries: u32,

    /// Initial backoff in milliseconds, doubled per retry
    #[serde(default = "defaults::backoff")]
    pub backoff_ms: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            request_delay_ms: defaults::request_delay(),
            fetch_retries: defaults::fetch_retries(),
            backoff_ms: defaults::backoff(),
        }
    }
}

/// Dispatcher batching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Flush pending items at least this often
    #[serde(default = "defaults::window")]
    pub window_secs: u64,

    /// Attempts for the final flush before giving up
    #[serde(default = "defaults::max_flush_attempts")]
    pub max_flush_attempts: u32,

    /// Delay between final flush attempts in milliseconds
    #[serde(default = "defaults::retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            window_secs: defaults::window(),
            max_flush_attempts: defaults::max_flush_attempts(),
            retry_delay_ms: defaults::retry_delay(),
        }
    }
}

/// Worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Fixed worker id; a random `worker-<uuid>` is used when unset
    #[serde(default)]
    pub worker_id: Option<String>,

    /// Upper bound for one mining call
    #[serde(default = "defaults::mining_timeout")]
    pub mining_timeout_secs: u64,

    /// Subscription flow control cap
    #[serde(default = "defaults::max_in_flight")]
    pub max_in_flight: usize,

    /// Pause after each handled message in milliseconds
    #[serde(default = "defaults::worker_delay")]
    pub delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            mining_timeout_secs: defaults::mining_timeout(),
            max_in_flight: defaults::max_in_flight(),
            delay_ms: defaults::worker_delay(),
        }
    }
}

mod defaults {
    use crate::models::{LinkFilter, MinerSelectors, SiteConfig};

    // Ledger defaults
    pub fn status_table() -> String {
        "status".into()
    }
    pub fn data_table() -> String {
        "records".into()
    }
    pub fn skip_pdf() -> bool {
        true
    }
    pub fn undone_page_size() -> usize {
        100_000
    }

    // Crawler defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; article-crawler/0.1)".into()
    }
    pub fn timeout() -> u64 {
        30
    }
    pub fn request_delay() -> u64 {
        1_000
    }
    pub fn fetch_retries() -> u32 {
        3
    }
    pub fn backoff() -> u64 {
        500
    }

    // Dispatcher defaults
    pub fn window() -> u64 {
        60
    }
    pub fn max_flush_attempts() -> u32 {
        5
    }
    pub fn retry_delay() -> u64 {
        2_000
    }

    // Worker defaults
    pub fn mining_timeout() -> u64 {
        120
    }
    pub fn max_in_flight() -> usize {
        1
    }
    pub fn worker_delay() -> u64 {
        0
    }

    /// Selectors over the citation meta tags most publishers emit.
    fn citation_meta() -> MinerSelectors {
        MinerSelectors {
            title: "meta[name=\"citation_title\"]".into(),
            authors: "meta[name=\"citation_author\"]".into(),
            abstract_text: "meta[name=\"citation_abstract\"], meta[name=\"description\"]".into(),
            body: None,
            doi: Some("meta[name=\"citation_doi\"]".into()),
            publication_date: Some(
                "meta[name=\"citation_publication_date\"], meta[name=\"citation_date\"]".into(),
            ),
        }
    }

    fn rxiv(name: &str, domain: &str) -> SiteConfig {
        SiteConfig {
            name: name.into(),
            domains: vec![domain.into()],
            search_url: format!(
                "https://www.{domain}/search/{{query}}%20numresults%3A75%20sort%3Apublication-date%20direction%3Adescending?page={{page0}}"
            ),
            term_format: "{term}".into(),
            keyword_join: " ".into(),
            encode_query: true,
            urls_per_page: 75,
            offset_base: 0,
            anchor_selector: "a.highwire-cite-linked-title".into(),
            anchor_attr: "href".into(),
            total_hits_selector: None,
            finish_selector: None,
            link_filter: LinkFilter::default(),
            pdf_markers: vec![".pdf".into()],
            language: Some("en".into()),
            language_param: None,
            miner: Some(citation_meta()),
        }
    }

    pub fn sites() -> Vec<SiteConfig> {
        vec![
            SiteConfig {
                name: "scielo".into(),
                domains: vec!["scielo.br".into(), "sld.cu".into(), "scielo.org".into()],
                search_url: "https://search.scielo.org/?q={query}&lang=pt&count={per_page}&from={offset}&output=site&sort=&format=summary&fb=&page={page}".into(),
                term_format: "({term})".into(),
                keyword_join: " OR ".into(),
                encode_query: true,
                urls_per_page: 15,
                offset_base: 1,
                anchor_selector: "a.showTooltip".into(),
                anchor_attr: "href".into(),
                total_hits_selector: Some("#TotalHits".into()),
                finish_selector: Some("div.midGlyph.alert".into()),
                link_filter: LinkFilter {
                    allow: vec!["sci_arttext".into(), "sci_pdf".into()],
                    deny: vec![],
                },
                pdf_markers: vec!["sci_pdf".into()],
                language: None,
                language_param: Some("tlng".into()),
                miner: Some(MinerSelectors {
                    title: "p.title".into(),
                    authors: "meta[name=\"citation_author\"]".into(),
                    abstract_text: ".trans-abstract > p:not([class^=sec]), .trans-abstract > div.section".into(),
                    body: Some("#article-body".into()),
                    doi: Some("meta[name=\"citation_doi\"]".into()),
                    publication_date: Some("meta[name=\"citation_publication_date\"]".into()),
                }),
            },
            SiteConfig {
                name: "arxiv".into(),
                domains: vec!["arxiv.org".into()],
                search_url: "http://export.arxiv.org/find/all/1/all:+{query}/0/1/0/all/0/1?skip={offset}&show={per_page}".into(),
                term_format: "{term}".into(),
                keyword_join: "+AND+".into(),
                encode_query: false,
                urls_per_page: 25,
                offset_base: 0,
                anchor_selector: ".list-identifier > a:first-of-type".into(),
                anchor_attr: "href".into(),
                total_hits_selector: None,
                finish_selector: None,
                link_filter: LinkFilter {
                    allow: vec![],
                    deny: vec!["format".into()],
                },
                pdf_markers: vec!["/pdf/".into()],
                language: Some("en".into()),
                language_param: None,
                miner: Some(MinerSelectors {
                    abstract_text: "blockquote.abstract.mathjax".into(),
                    ..citation_meta()
                }),
            },
            rxiv("biorxiv", "biorxiv.org"),
            rxiv("medrxiv", "medrxiv.org"),
            SiteConfig {
                name: "preprints".into(),
                domains: vec!["preprints.org".into()],
                search_url: "https://www.preprints.org/search?search1={query}&field1=article_abstract&field2=authors&clause=AND&search2=&page_num={page}".into(),
                term_format: "{term}".into(),
                keyword_join: " ".into(),
                encode_query: true,
                urls_per_page: 25,
                offset_base: 0,
                anchor_selector: "a#title.title".into(),
                anchor_attr: "href".into(),
                total_hits_selector: None,
                finish_selector: None,
                link_filter: LinkFilter::default(),
                pdf_markers: vec!["/download".into()],
                language: Some("en".into()),
                language_param: None,
                miner: Some(MinerSelectors {
                    abstract_text: "meta[property=\"og:description\"]".into(),
                    ..citation_meta()
                }),
            },
        ]
    }
}
