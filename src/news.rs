use std::time::Duration;

use tracing::{info, warn};

use crate::providers::{
    Extractor, FetchOptions, LanguageModel, PageFetcher, ProviderError, SpeechSynthesizer,
};
use crate::schema::ExtractionSchema;
use crate::urlnorm::normalize;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum NewsError {
    #[error("no articles could be summarized from {site}")]
    NoSummaries { site: String },
    #[error("fetch timed out: {0}")]
    FatalTimeout(#[source] ProviderError),
    #[error("speech synthesis failed: {0}")]
    Speech(#[source] ProviderError),
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewsConfig {
    /// How many of the latest articles to read.
    pub article_count: usize,
    /// Spoken phrase inserted between article summaries.
    pub separator: String,
    pub pacing_min_ms: u64,
    pub pacing_max_ms: u64,
    pub fetch_timeout: Duration,
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            article_count: 3,
            separator: "Next article.".to_string(),
            pacing_min_ms: 1_000,
            pacing_max_ms: 2_000,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Fetches the latest article links from a news site, summarizes each with
/// the language model, and synthesizes the joined summaries as speech.
pub struct NewsReader<'a> {
    pub extractor: &'a dyn Extractor,
    pub fetcher: &'a dyn PageFetcher,
    pub llm: &'a dyn LanguageModel,
    pub tts: &'a dyn SpeechSynthesizer,
    pub config: NewsConfig,
}

impl<'a> NewsReader<'a> {
    pub async fn read_latest(&self, site_url: &str, lang: &str) -> Result<Vec<u8>, NewsError> {
        let article_urls = self.latest_article_urls(site_url).await;
        info!(site_url, articles = article_urls.len(), "summarizing latest articles");

        let mut summaries: Vec<String> = Vec::new();
        for (idx, url) in article_urls.iter().enumerate() {
            if idx > 0 {
                self.pace().await;
            }
            match self.summarize_article(site_url, url).await? {
                Some(summary) => summaries.push(summary),
                None => continue,
            }
        }

        if summaries.is_empty() {
            return Err(NewsError::NoSummaries { site: site_url.to_string() });
        }

        let full_text = summaries.join(&format!(" {} ", self.config.separator));
        self.tts
            .synthesize(&full_text, lang)
            .await
            .map_err(NewsError::Speech)
    }

    /// Ask the extractor for the site's latest article links. Failures are
    /// soft and yield an empty list; the caller reports NoSummaries.
    async fn latest_article_urls(&self, site_url: &str) -> Vec<String> {
        let schema = article_link_schema();
        let outcome = match self.extractor.run(site_url, &schema).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(site_url, error = %e, "article link discovery failed");
                return Vec::new();
            }
        };

        let mut urls: Vec<String> = Vec::new();
        for record in outcome.into_records() {
            if let Some(Some(link)) = record.get_ci("link").cloned() {
                let link = link.trim().to_string();
                if !link.is_empty() && !urls.contains(&link) {
                    urls.push(link);
                }
            }
            if urls.len() == self.config.article_count {
                break;
            }
        }
        urls
    }

    /// Fetch one article (resolving relative links against the site) and
    /// summarize it for speaking. Soft failures come back as `None`; a
    /// fetch timeout aborts the whole request.
    async fn summarize_article(
        &self,
        site_url: &str,
        article_url: &str,
    ) -> Result<Option<String>, NewsError> {
        let url = normalize(site_url, article_url);
        let opts = FetchOptions::new(self.config.fetch_timeout);

        let text = match self.fetcher.fetch_text(&url, &opts).await {
            Ok(text) => text,
            Err(e) if e.is_timeout() => return Err(NewsError::FatalTimeout(e)),
            Err(e) => {
                warn!(url = %url, error = %e, "article fetch failed, skipping");
                return Ok(None);
            }
        };

        let prompt = format!(
            "Extract the title and a summary of the news article from the \
             following page text. Format it as a report suitable for speaking \
             aloud, with no markdown. Return the title, then the summarized \
             description in about 100 words, and nothing else. Keep the \
             language of the article.\n\n{}",
            text
        );
        match self.llm.invoke(&prompt).await {
            Ok(summary) => {
                let summary = summary.trim().to_string();
                Ok(if summary.is_empty() { None } else { Some(summary) })
            }
            Err(e) if e.is_timeout() => Err(NewsError::FatalTimeout(e)),
            Err(e) => {
                warn!(url = %url, error = %e, "summarization failed, skipping");
                Ok(None)
            }
        }
    }

    async fn pace(&self) {
        if self.config.pacing_max_ms == 0 {
            return;
        }
        let min = self.config.pacing_min_ms.min(self.config.pacing_max_ms);
        let ms = fastrand::u64(min..=self.config.pacing_max_ms);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// Fixed schema for article-link discovery: one record per article with a
/// single Link field.
fn article_link_schema() -> ExtractionSchema {
    ExtractionSchema::from_pairs(&[(
        "Link",
        "URL of one of the latest full news articles on this page. Do not \
         include category or tag pages. Return one object per article.",
    )])
}
