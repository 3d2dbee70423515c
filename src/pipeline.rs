use std::time::Duration;

use tracing::{debug, info, warn};

use crate::matching::{is_relevant, DEFAULT_SIMILARITY_THRESHOLD};
use crate::providers::{Extractor, FetchOptions, LanguageModel, ProviderError, SearchProvider};
use crate::record::{is_relevant_result, record_passes, Record, Strictness};
use crate::schema::generate_schema;
use crate::urlnorm::{normalize, DomainFilter};

/// Record keys whose values are URLs and must be made absolute against
/// the page they came from.
const URL_KEY_NEEDLES: &[&str] = &["image", "url", "website", "source", "link", "thumbnail"];

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("search discovery failed: {0}")]
    Discovery(#[source] ProviderError),
    #[error("search returned no candidate URLs")]
    NoCandidates,
    #[error("fetch timed out before anything was collected: {0}")]
    FatalTimeout(#[source] ProviderError),
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Stop once this many records are accumulated.
    pub target_count: usize,
    /// How many candidate URLs to request from search.
    pub search_limit: usize,
    pub strictness: Strictness,
    /// Fields a strict-mode record must fill.
    pub required_fields: Vec<String>,
    /// Product mode filters records by name match against the query;
    /// generic mode passes everything through.
    pub filter_by_name: bool,
    pub name_match_threshold: f64,
    pub domain_filter: DomainFilter,
    /// Inter-call pacing bounds in milliseconds. A zero maximum disables
    /// pacing (used by tests).
    pub pacing_min_ms: u64,
    pub pacing_max_ms: u64,
    /// Retry the discovery step exactly once when it comes back empty.
    pub retry_empty_discovery: bool,
    pub fetch_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_count: 5,
            search_limit: 5,
            strictness: Strictness::Loose,
            required_fields: Vec::new(),
            filter_by_name: false,
            name_match_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            domain_filter: DomainFilter::permissive(),
            pacing_min_ms: 1_000,
            pacing_max_ms: 3_000,
            retry_empty_discovery: true,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

// ── Outcome ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SearchOutcome {
    pub records: Vec<Record>,
    /// True when a fatal error stopped the run after something had
    /// already been collected.
    pub partial: bool,
    pub warning: Option<String>,
}

// ── Orchestrator ─────────────────────────────────────────────────────────────

/// Sequential search → extract → validate → normalize → filter loop.
///
/// Per-candidate failures are soft and logged; a fetch timeout aborts the
/// remaining candidates. If anything was accumulated before the abort the
/// partial result is returned with a warning, otherwise the timeout
/// surfaces as an error.
pub struct Pipeline<'a> {
    pub extractor: &'a dyn Extractor,
    pub search: &'a dyn SearchProvider,
    pub llm: &'a dyn LanguageModel,
    pub config: PipelineConfig,
}

impl<'a> Pipeline<'a> {
    pub async fn run(&self, query: &str) -> Result<SearchOutcome, PipelineError> {
        let schema = generate_schema(self.llm, query).await;
        let candidates = self.discover(query).await?;
        info!(query, candidates = candidates.len(), "starting extraction loop");

        let mut records: Vec<Record> = Vec::new();
        let mut paced_once = false;

        for url in &candidates {
            if records.len() >= self.config.target_count {
                break;
            }
            if !self.config.domain_filter.is_in_scope(url) {
                debug!(url = %url, "candidate out of scope, skipping");
                continue;
            }
            if paced_once {
                self.pace().await;
            }
            paced_once = true;

            let outcome = match self.extractor.run(url, &schema).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_timeout() => {
                    warn!(url = %url, error = %e, "fetch timeout, aborting remaining candidates");
                    if records.is_empty() {
                        return Err(PipelineError::FatalTimeout(e));
                    }
                    return Ok(SearchOutcome {
                        records,
                        partial: true,
                        warning: Some(format!(
                            "fetch timed out on {}; returning partial results",
                            url
                        )),
                    });
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "extraction failed, skipping candidate");
                    continue;
                }
            };

            if !is_relevant_result(&outcome, self.config.strictness, &self.config.required_fields)
            {
                info!(url = %url, "skipping irrelevant result");
                continue;
            }

            for mut record in outcome.into_records() {
                self.normalize_url_fields(&mut record, url);
                if !record_passes(&record, self.config.strictness, &self.config.required_fields) {
                    continue;
                }
                if self.config.filter_by_name
                    && !is_relevant(query, &record, self.config.name_match_threshold)
                {
                    debug!(url = %url, "record name does not match query, dropping");
                    continue;
                }
                records.push(record);
                if records.len() >= self.config.target_count {
                    break;
                }
            }
        }

        Ok(SearchOutcome { records, partial: false, warning: None })
    }

    /// Candidate discovery, retried once on an empty first batch when
    /// configured. Discovery failures are always fatal.
    async fn discover(&self, query: &str) -> Result<Vec<String>, PipelineError> {
        let opts = FetchOptions::new(self.config.fetch_timeout);
        let first = self
            .search
            .search(query, self.config.search_limit, &opts)
            .await
            .map_err(PipelineError::Discovery)?;
        if !first.is_empty() {
            return Ok(first);
        }
        if !self.config.retry_empty_discovery {
            return Err(PipelineError::NoCandidates);
        }

        info!(query, "empty search result, retrying discovery once");
        self.pace().await;
        let opts = FetchOptions::new(self.config.fetch_timeout);
        let second = self
            .search
            .search(query, self.config.search_limit, &opts)
            .await
            .map_err(PipelineError::Discovery)?;
        if second.is_empty() {
            return Err(PipelineError::NoCandidates);
        }
        Ok(second)
    }

    /// Make every URL-valued field absolute against the candidate page it
    /// was scraped from.
    fn normalize_url_fields(&self, record: &mut Record, candidate_url: &str) {
        for (key, value) in record.0.iter_mut() {
            let key_lc = key.to_lowercase();
            if !URL_KEY_NEEDLES.iter().any(|n| key_lc.contains(n)) {
                continue;
            }
            if let Some(v) = value.take() {
                *value = Some(normalize(candidate_url, &v));
            }
        }
    }

    /// Randomized minimum spacing between successive external calls, to
    /// stay under upstream rate limits.
    async fn pace(&self) {
        if self.config.pacing_max_ms == 0 {
            return;
        }
        let min = self.config.pacing_min_ms.min(self.config.pacing_max_ms);
        let ms = fastrand::u64(min..=self.config.pacing_max_ms);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::{MockExtractor, MockLanguageModel, MockSearchProvider, Scripted};
    use crate::record::ExtractOutcome;
    use crate::urlnorm::FilterMode;

    fn product(name: &str) -> ExtractOutcome {
        let mut r = Record::new();
        r.insert("Name", Some(name.to_string()));
        r.insert("Price", Some("$99".to_string()));
        r.insert("Image", Some("/img/p.png".to_string()));
        ExtractOutcome::One(r)
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            target_count: 3,
            pacing_min_ms: 0,
            pacing_max_ms: 0,
            ..PipelineConfig::default()
        }
    }

    fn urls(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("https://site{}.example.com/item", i)).collect()
    }

    #[tokio::test]
    async fn stops_at_target_and_skips_remaining_candidates() {
        let candidates = urls(6);
        let search =
            MockSearchProvider::with_batches(vec![candidates.iter().map(|s| s.as_str()).collect()]);
        let llm = MockLanguageModel::failing();

        let mut extractor = MockExtractor::new()
            .on(&candidates[0], Scripted::SoftError)
            .on(&candidates[1], Scripted::Outcome(ExtractOutcome::Many(vec![])));
        for url in &candidates[2..] {
            extractor = extractor.on(url, Scripted::Outcome(product("Widget")));
        }

        let pipeline = Pipeline {
            extractor: &extractor,
            search: &search,
            llm: &llm,
            config: PipelineConfig { search_limit: 6, ..test_config() },
        };
        let outcome = pipeline.run("widget").await.unwrap();

        assert_eq!(outcome.records.len(), 3);
        assert!(!outcome.partial);
        // Candidates 1-5 were tried; the target was hit at the 5th, so the
        // 6th never reached the extractor.
        assert_eq!(extractor.call_count(), 5);
        assert!(!extractor.calls.lock().unwrap().contains(&candidates[5]));
    }

    #[tokio::test]
    async fn timeout_midway_returns_partial_results_with_warning() {
        let candidates = urls(5);
        let search =
            MockSearchProvider::with_batches(vec![candidates.iter().map(|s| s.as_str()).collect()]);
        let llm = MockLanguageModel::failing();

        let mut extractor = MockExtractor::new()
            .on(&candidates[0], Scripted::Outcome(product("Widget")))
            .on(&candidates[1], Scripted::Timeout);
        for url in &candidates[2..] {
            extractor = extractor.on(url, Scripted::Outcome(product("Widget")));
        }

        let pipeline = Pipeline {
            extractor: &extractor,
            search: &search,
            llm: &llm,
            config: test_config(),
        };
        let outcome = pipeline.run("widget").await.unwrap();

        assert_eq!(outcome.records.len(), 1);
        assert!(outcome.partial);
        assert!(outcome.warning.as_deref().unwrap().contains("timed out"));
        // Candidates 3-5 were never processed.
        assert_eq!(extractor.call_count(), 2);
    }

    #[tokio::test]
    async fn timeout_with_nothing_collected_is_an_error() {
        let search = MockSearchProvider::with_batches(vec![vec!["https://a.example.com/"]]);
        let llm = MockLanguageModel::failing();
        let extractor = MockExtractor::new().on("https://a.example.com/", Scripted::Timeout);

        let pipeline = Pipeline {
            extractor: &extractor,
            search: &search,
            llm: &llm,
            config: test_config(),
        };
        assert!(matches!(
            pipeline.run("widget").await,
            Err(PipelineError::FatalTimeout(_))
        ));
    }

    #[tokio::test]
    async fn soft_errors_never_abort_the_loop() {
        let candidates = urls(3);
        let search =
            MockSearchProvider::with_batches(vec![candidates.iter().map(|s| s.as_str()).collect()]);
        let llm = MockLanguageModel::failing();

        let extractor = MockExtractor::new()
            .on(&candidates[0], Scripted::SoftError)
            .on(&candidates[1], Scripted::SoftError)
            .on(&candidates[2], Scripted::Outcome(product("Widget")));

        let pipeline = Pipeline {
            extractor: &extractor,
            search: &search,
            llm: &llm,
            config: test_config(),
        };
        let outcome = pipeline.run("widget").await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(extractor.call_count(), 3);
    }

    #[tokio::test]
    async fn empty_discovery_is_retried_exactly_once() {
        let candidates = urls(1);
        let search = MockSearchProvider::with_batches(vec![
            vec![],
            candidates.iter().map(|s| s.as_str()).collect(),
        ]);
        let llm = MockLanguageModel::failing();
        let extractor =
            MockExtractor::new().on(&candidates[0], Scripted::Outcome(product("Widget")));

        let pipeline = Pipeline {
            extractor: &extractor,
            search: &search,
            llm: &llm,
            config: test_config(),
        };
        let outcome = pipeline.run("widget").await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(search.call_count(), 2);
    }

    #[tokio::test]
    async fn discovery_retry_can_be_disabled() {
        let search = MockSearchProvider::with_batches(vec![vec![], vec!["https://a.example.com/"]]);
        let llm = MockLanguageModel::failing();
        let extractor = MockExtractor::new();

        let pipeline = Pipeline {
            extractor: &extractor,
            search: &search,
            llm: &llm,
            config: PipelineConfig { retry_empty_discovery: false, ..test_config() },
        };
        assert!(matches!(pipeline.run("widget").await, Err(PipelineError::NoCandidates)));
        assert_eq!(search.call_count(), 1);
    }

    #[tokio::test]
    async fn twice_empty_discovery_gives_up() {
        let search = MockSearchProvider::with_batches(vec![vec![], vec![]]);
        let llm = MockLanguageModel::failing();
        let extractor = MockExtractor::new();

        let pipeline = Pipeline {
            extractor: &extractor,
            search: &search,
            llm: &llm,
            config: test_config(),
        };
        assert!(matches!(pipeline.run("widget").await, Err(PipelineError::NoCandidates)));
        assert_eq!(search.call_count(), 2);
    }

    #[tokio::test]
    async fn out_of_scope_candidates_never_reach_the_extractor() {
        let search = MockSearchProvider::with_batches(vec![vec![
            "https://spam.example.com/x",
            "https://shop.example.com/item",
        ]]);
        let llm = MockLanguageModel::failing();
        let extractor = MockExtractor::new()
            .on("https://shop.example.com/item", Scripted::Outcome(product("Widget")));

        let pipeline = Pipeline {
            extractor: &extractor,
            search: &search,
            llm: &llm,
            config: PipelineConfig {
                domain_filter: DomainFilter::new(FilterMode::Deny, vec!["spam".into()]),
                ..test_config()
            },
        };
        let outcome = pipeline.run("widget").await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(extractor.call_count(), 1);
    }

    #[tokio::test]
    async fn url_fields_are_normalized_against_the_candidate_origin() {
        let url = "https://shop.example.com/catalog/item";
        let search = MockSearchProvider::with_batches(vec![vec![url]]);
        let llm = MockLanguageModel::failing();
        let extractor = MockExtractor::new().on(url, Scripted::Outcome(product("Widget")));

        let pipeline = Pipeline {
            extractor: &extractor,
            search: &search,
            llm: &llm,
            config: PipelineConfig { target_count: 1, ..test_config() },
        };
        let outcome = pipeline.run("widget").await.unwrap();
        assert_eq!(
            outcome.records[0].get_ci("image").unwrap().as_deref(),
            Some("https://shop.example.com/img/p.png")
        );
        // Non-URL fields are untouched.
        assert_eq!(outcome.records[0].get_ci("price").unwrap().as_deref(), Some("$99"));
    }

    #[tokio::test]
    async fn product_mode_filters_records_by_name() {
        let candidates = urls(2);
        let search =
            MockSearchProvider::with_batches(vec![candidates.iter().map(|s| s.as_str()).collect()]);
        let llm = MockLanguageModel::failing();
        let extractor = MockExtractor::new()
            .on(&candidates[0], Scripted::Outcome(product("Garden Hose 20m")))
            .on(&candidates[1], Scripted::Outcome(product("Apple iPhone 13 128GB")));

        let pipeline = Pipeline {
            extractor: &extractor,
            search: &search,
            llm: &llm,
            config: PipelineConfig {
                strictness: Strictness::Strict,
                required_fields: vec!["Name".into(), "Price".into(), "Image".into()],
                filter_by_name: true,
                ..test_config()
            },
        };
        let outcome = pipeline.run("iphone 13").await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(
            outcome.records[0].get_ci("name").unwrap().as_deref(),
            Some("Apple iPhone 13 128GB")
        );
    }

    #[tokio::test]
    async fn list_outcomes_are_flattened_and_vetted_per_record() {
        let url = "https://shop.example.com/list";
        let search = MockSearchProvider::with_batches(vec![vec![url]]);
        let llm = MockLanguageModel::failing();

        let mut good = Record::new();
        good.insert("Name", Some("Widget Pro".to_string()));
        good.insert("Price", Some("$5".to_string()));
        good.insert("Image", Some("p.example.com/i.png".to_string()));
        let mut junk = Record::new();
        junk.insert("Name", Some("Widget Lite".to_string()));
        junk.insert("Price", Some("None".to_string()));
        junk.insert("Image", Some("p.example.com/j.png".to_string()));

        let extractor = MockExtractor::new()
            .on(url, Scripted::Outcome(ExtractOutcome::Many(vec![good, junk])));

        let pipeline = Pipeline {
            extractor: &extractor,
            search: &search,
            llm: &llm,
            config: PipelineConfig {
                strictness: Strictness::Strict,
                required_fields: vec!["Name".into(), "Price".into(), "Image".into()],
                ..test_config()
            },
        };
        let outcome = pipeline.run("widget").await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(
            outcome.records[0].get_ci("image").unwrap().as_deref(),
            Some("https://p.example.com/i.png")
        );
    }
}
