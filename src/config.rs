use std::time::Duration;

use crate::matching::DEFAULT_SIMILARITY_THRESHOLD;
use crate::news::NewsConfig;
use crate::pipeline::PipelineConfig;
use crate::record::Strictness;
use crate::schema::is_product_query;
use crate::urlnorm::{DomainFilter, FilterMode};

/// Hosts dropped by the default deny-list deployment: media and social
/// aggregators that never carry scrapeable product or article pages.
const DEFAULT_FILTER_HOSTS: &str = "pinterest,youtube,facebook,instagram,tiktok,reddit";

const DEFAULT_REQUIRED_FIELDS: &str = "Name,Price,Image";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Process-wide configuration, read once from the environment at startup.
/// Everything request-scoped (accumulator, schema) lives elsewhere.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub google_api_key: String,
    pub gemini_model: String,
    /// Default accumulator target for /search.
    pub target_results: usize,
    pub name_match_threshold: f64,
    pub filter_mode: FilterMode,
    pub filter_hosts: Vec<String>,
    /// Fields a strict-mode product record must fill.
    pub required_fields: Vec<String>,
    pub pacing_min_ms: u64,
    pub pacing_max_ms: u64,
    pub retry_empty_discovery: bool,
    pub fetch_timeout_secs: u64,
    pub article_count: usize,
    pub news_separator: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_addr: env_or("SCOUT_BIND_ADDR", "0.0.0.0:8000"),
            google_api_key: std::env::var("GOOGLE_API_KEY")
                .map_err(|_| ConfigError::Missing("GOOGLE_API_KEY"))?,
            gemini_model: env_or("SCOUT_GEMINI_MODEL", "gemini-1.5-flash"),
            target_results: env_parsed("SCOUT_TARGET_RESULTS", 5)?,
            name_match_threshold: env_parsed(
                "SCOUT_NAME_MATCH_THRESHOLD",
                DEFAULT_SIMILARITY_THRESHOLD,
            )?,
            filter_mode: parse_filter_mode(&env_or("SCOUT_DOMAIN_FILTER_MODE", "deny"))?,
            filter_hosts: parse_list(&env_or("SCOUT_DOMAIN_FILTER_HOSTS", DEFAULT_FILTER_HOSTS)),
            required_fields: parse_list(&env_or(
                "SCOUT_REQUIRED_FIELDS",
                DEFAULT_REQUIRED_FIELDS,
            )),
            pacing_min_ms: env_parsed("SCOUT_PACING_MIN_MS", 1_000)?,
            pacing_max_ms: env_parsed("SCOUT_PACING_MAX_MS", 3_000)?,
            retry_empty_discovery: env_parsed("SCOUT_RETRY_EMPTY_DISCOVERY", true)?,
            fetch_timeout_secs: env_parsed("SCOUT_FETCH_TIMEOUT_SECS", 30)?,
            article_count: env_parsed("SCOUT_ARTICLE_COUNT", 3)?,
            news_separator: env_or("SCOUT_NEWS_SEPARATOR", "Next article."),
        })
    }

    pub fn domain_filter(&self) -> DomainFilter {
        DomainFilter::new(self.filter_mode, self.filter_hosts.clone())
    }

    /// Per-request pipeline settings. Product-like queries get strict
    /// validation and name filtering; everything else runs loose.
    pub fn pipeline_config(&self, query: &str, num_results: Option<usize>) -> PipelineConfig {
        let product = is_product_query(query);
        let target = num_results.unwrap_or(self.target_results).clamp(1, 10);
        PipelineConfig {
            target_count: target,
            search_limit: target.max(5),
            strictness: if product { Strictness::Strict } else { Strictness::Loose },
            required_fields: if product { self.required_fields.clone() } else { Vec::new() },
            filter_by_name: product,
            name_match_threshold: self.name_match_threshold,
            domain_filter: self.domain_filter(),
            pacing_min_ms: self.pacing_min_ms,
            pacing_max_ms: self.pacing_max_ms,
            retry_empty_discovery: self.retry_empty_discovery,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }

    pub fn news_config(&self) -> NewsConfig {
        NewsConfig {
            article_count: self.article_count,
            separator: self.news_separator.clone(),
            pacing_min_ms: self.pacing_min_ms,
            pacing_max_ms: self.pacing_max_ms,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(default),
    }
}

fn parse_filter_mode(raw: &str) -> Result<FilterMode, ConfigError> {
    match raw.to_lowercase().as_str() {
        "allow" => Ok(FilterMode::Allow),
        "deny" => Ok(FilterMode::Deny),
        _ => Err(ConfigError::Invalid {
            key: "SCOUT_DOMAIN_FILTER_MODE",
            value: raw.to_string(),
        }),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
