// src/services/miner.rs

//! Page miners and the domain registry that selects them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use scraper::{ElementRef, Html, Selector};

use crate::error::{AppError, Result};
use crate::models::{MinedRecord, MinerSelectors, SiteConfig};
use crate::utils::host_of;
use crate::utils::http::PageSource;

/// Result of mining one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MineOutcome {
    Mined(MinedRecord),
    /// The page had nothing worth recording
    NoResult,
}

/// Turns a document URL into a structured record.
///
/// Implementations report slow transports as [`AppError::MiningTimeout`] and
/// anything else as [`AppError::Miner`].
#[async_trait]
pub trait PageMiner: Send + Sync {
    async fn mine(&self, url: &str) -> Result<MineOutcome>;
}

/// Domain to miner mapping, matched by most specific host suffix.
#[derive(Default, Clone)]
pub struct MinerRegistry {
    miners: HashMap<String, Arc<dyn PageMiner>>,
}

impl MinerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a miner for a bare domain such as `scielo.br`.
    pub fn register(&mut self, domain: &str, miner: Arc<dyn PageMiner>) -> Result<()> {
        let domain = domain.trim().to_lowercase();
        if domain.is_empty()
            || domain.contains(['/', ':', '?', '#'])
            || domain.chars().any(char::is_whitespace)
        {
            return Err(AppError::config(format!(
                "'{domain}' is not a bare domain"
            )));
        }
        if self.miners.contains_key(&domain) {
            return Err(AppError::config(format!(
                "miner already registered for '{domain}'"
            )));
        }
        self.miners.insert(domain, miner);
        Ok(())
    }

    /// Find the miner for a URL: `www.scielo.br` falls back to `scielo.br`.
    pub fn lookup(&self, url: &str) -> Option<(String, Arc<dyn PageMiner>)> {
        let host = host_of(url)?;
        let mut candidate = host.as_str();
        loop {
            if let Some(miner) = self.miners.get(candidate) {
                return Some((candidate.to_string(), Arc::clone(miner)));
            }
            match candidate.split_once('.') {
                Some((_, rest)) if !rest.is_empty() => candidate = rest,
                _ => return None,
            }
        }
    }

    /// Fail unless every configured site domain has a miner.
    pub fn ensure_covers(&self, sites: &[SiteConfig]) -> Result<()> {
        for site in sites {
            for domain in &site.domains {
                let probe = format!("https://{domain}/");
                if self.lookup(&probe).is_none() {
                    return Err(AppError::config(format!(
                        "no miner registered for domain '{domain}' (site '{}')",
                        site.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Register a [`SelectorMiner`] for every site that carries miner selectors.
    pub fn from_sites(
        sites: &[SiteConfig],
        source: Arc<dyn PageSource>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let mut registry = Self::new();
        for site in sites {
            let Some(selectors) = &site.miner else {
                tracing::debug!(site = %site.name, "Site has no miner selectors");
                continue;
            };
            let miner: Arc<dyn PageMiner> = Arc::new(SelectorMiner::new(
                site,
                selectors.clone(),
                Arc::clone(&source),
                timeout_secs,
            )?);
            for domain in &site.domains {
                registry.register(domain, Arc::clone(&miner))?;
            }
        }
        Ok(registry)
    }

    pub fn domains(&self) -> Vec<&str> {
        let mut domains: Vec<&str> = self.miners.keys().map(String::as_str).collect();
        domains.sort_unstable();
        domains
    }

    pub fn is_empty(&self) -> bool {
        self.miners.is_empty()
    }
}

/// Miner that reads fields with configured CSS selectors.
///
/// `meta` elements contribute their `content` attribute; other elements their
/// whitespace-normalized text.
pub struct SelectorMiner {
    source_name: String,
    language: Option<String>,
    selectors: CompiledSelectors,
    pages: Arc<dyn PageSource>,
    timeout_secs: u64,
}

struct CompiledSelectors {
    title: Selector,
    authors: Selector,
    abstract_text: Selector,
    body: Option<Selector>,
    doi: Option<Selector>,
    publication_date: Option<Selector>,
}

fn compile(raw: &str) -> Result<Selector> {
    Selector::parse(raw).map_err(|e| AppError::selector(raw, format!("{e:?}")))
}

fn compile_opt(raw: &Option<String>) -> Result<Option<Selector>> {
    raw.as_deref().map(compile).transpose()
}

impl SelectorMiner {
    pub fn new(
        site: &SiteConfig,
        selectors: MinerSelectors,
        pages: Arc<dyn PageSource>,
        timeout_secs: u64,
    ) -> Result<Self> {
        Ok(Self {
            source_name: site.name.clone(),
            language: site.language.clone(),
            selectors: CompiledSelectors {
                title: compile(&selectors.title)?,
                authors: compile(&selectors.authors)?,
                abstract_text: compile(&selectors.abstract_text)?,
                body: compile_opt(&selectors.body)?,
                doi: compile_opt(&selectors.doi)?,
                publication_date: compile_opt(&selectors.publication_date)?,
            },
            pages,
            timeout_secs,
        })
    }

    fn extract(&self, url: &str, html: &str) -> MineOutcome {
        let document = Html::parse_document(html);
        let sel = &self.selectors;

        let first = |selector: &Selector| {
            document
                .select(selector)
                .map(element_value)
                .find(|v| !v.is_empty())
        };
        let all = |selector: &Selector, sep: &str| {
            document
                .select(selector)
                .map(element_value)
                .filter(|v| !v.is_empty())
                .collect::<Vec<_>>()
                .join(sep)
        };

        let record = MinedRecord {
            title: first(&sel.title).unwrap_or_default(),
            authors: all(&sel.authors, "; "),
            abstract_text: all(&sel.abstract_text, "\n"),
            body: sel.body.as_ref().map(|s| all(s, "\n")).filter(|b| !b.is_empty()),
            source: self.source_name.clone(),
            link: url.to_string(),
            language: self.language.clone().unwrap_or_default(),
            publication_date: sel
                .publication_date
                .as_ref()
                .and_then(first)
                .and_then(|raw| parse_date(&raw)),
            acquisition_date: Utc::now(),
            doi: sel.doi.as_ref().and_then(first),
            meta_info: None,
        };

        if record.has_content() {
            MineOutcome::Mined(record)
        } else {
            MineOutcome::NoResult
        }
    }
}

#[async_trait]
impl PageMiner for SelectorMiner {
    async fn mine(&self, url: &str) -> Result<MineOutcome> {
        let html = self.pages.fetch(url).await.map_err(|e| match e {
            AppError::Http(ref err) if err.is_timeout() => {
                AppError::mining_timeout(url, self.timeout_secs)
            }
            other => AppError::miner(url, other),
        })?;
        Ok(self.extract(url, &html))
    }
}

fn element_value(el: ElementRef<'_>) -> String {
    let raw = if el.value().name() == "meta" {
        el.value().attr("content").unwrap_or_default().to_string()
    } else {
        el.text().collect::<String>()
    };
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Accepts RFC 3339 and the `YYYY-MM-DD` / `YYYY/MM/DD` forms publishers emit.
fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d", "%Y/%m/%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
