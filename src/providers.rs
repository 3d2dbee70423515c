use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::record::ExtractOutcome;
use crate::schema::{parse_json_reply, ExtractionSchema};

// ── Constants ────────────────────────────────────────────────────────────────

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/13.1.1 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:77.0) Gecko/20100101 Firefox/77.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_5) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/83.0.4103.97 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:77.0) Gecko/20100101 Firefox/77.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/83.0.4103.97 Safari/537.36",
];

const MAX_PAGE_CHARS: usize = 12_000;
const TTS_CHUNK_CHARS: usize = 200;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request failed: {0}")]
    Http(String),
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("URL did not return HTML")]
    NotHtml,
    #[error("unparseable upstream output: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Timeouts are the one error class that aborts a whole request;
    /// everything else is a per-candidate soft failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProviderError::Timeout { .. })
    }
}

// ── Per-call fetch configuration ─────────────────────────────────────────────

/// Explicit per-call HTTP settings. Built fresh for each outbound call so
/// no shared client state is ever mutated.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub user_agent: String,
    pub timeout: Duration,
}

impl FetchOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            user_agent: random_user_agent().to_string(),
            timeout,
        }
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Rotating browser user agent, to avoid upstream blocks on a fixed one.
pub fn random_user_agent() -> &'static str {
    USER_AGENTS[fastrand::usize(..USER_AGENTS.len())]
}

// ── Trait seams for external collaborators ───────────────────────────────────

/// Scrapes structured records from one page, guided by a schema.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn run(&self, url: &str, schema: &ExtractionSchema)
        -> Result<ExtractOutcome, ProviderError>;
}

/// Produces candidate URLs for a query.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        opts: &FetchOptions,
    ) -> Result<Vec<String>, ProviderError>;
}

/// Hosted large-language-model completion.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn invoke(&self, prompt: &str) -> Result<String, ProviderError>;
}

/// Fetches one page and reduces it to readable text.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str, opts: &FetchOptions) -> Result<String, ProviderError>;
}

/// The reqwest-backed fetcher used outside of tests.
pub struct HttpPageFetcher;

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_text(&self, url: &str, opts: &FetchOptions) -> Result<String, ProviderError> {
        fetch_page_text(url, opts).await
    }
}

/// Text-to-speech synthesis.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, lang: &str) -> Result<Vec<u8>, ProviderError>;
}

// ── HTTP fetch ───────────────────────────────────────────────────────────────

fn classify_request_error(e: reqwest::Error, url: &str) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout { url: url.to_string() }
    } else if e.is_connect() {
        ProviderError::Http(format!("ConnectError: {}", e))
    } else {
        ProviderError::Http(format!("RequestError: {}", e))
    }
}

fn build_client(opts: &FetchOptions) -> Result<reqwest::Client, ProviderError> {
    let mut headers = reqwest::header::HeaderMap::new();
    if let Ok(accept) =
        "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".parse()
    {
        headers.insert(reqwest::header::ACCEPT, accept);
    }
    if let Ok(lang) = "en-US,en;q=0.9".parse() {
        headers.insert(reqwest::header::ACCEPT_LANGUAGE, lang);
    }

    reqwest::ClientBuilder::new()
        .connect_timeout(Duration::from_secs(5))
        .timeout(opts.timeout)
        .redirect(reqwest::redirect::Policy::limited(10))
        .user_agent(opts.user_agent.as_str())
        .default_headers(headers)
        .build()
        .map_err(|e| ProviderError::Http(e.to_string()))
}

/// Fetch a page and reduce it to readable text for LLM consumption.
pub async fn fetch_page_text(url: &str, opts: &FetchOptions) -> Result<String, ProviderError> {
    let client = build_client(opts)?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| classify_request_error(e, url))?;

    if !response.status().is_success() {
        return Err(ProviderError::Status(response.status().as_u16()));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();
    if !content_type.contains("text/html") {
        return Err(ProviderError::NotHtml);
    }

    let html = response
        .text()
        .await
        .map_err(|e| classify_request_error(e, url))?;

    let mut text = html_to_text(&html);
    if let Some((idx, _)) = text.char_indices().nth(MAX_PAGE_CHARS) {
        text.truncate(idx);
    }
    Ok(text)
}

/// Strip markup down to whitespace-normalized text, skipping script-like
/// and chrome elements.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let body_sel = Selector::parse("body").unwrap();
    let root = match document.select(&body_sel).next() {
        Some(body) => body,
        None => return String::new(),
    };
    let mut parts: Vec<String> = Vec::new();
    collect_visible_text(root, &mut parts);
    parts.join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collect_visible_text(el: ElementRef<'_>, parts: &mut Vec<String>) {
    use scraper::node::Node;

    if matches!(el.value().name(), "script" | "style" | "noscript" | "svg" | "template") {
        return;
    }
    for child in el.children() {
        match child.value() {
            Node::Text(text) => parts.push((&*text.text).to_string()),
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_visible_text(child_el, parts);
                }
            }
            _ => {}
        }
    }
}

// ── LLM-backed extractor ─────────────────────────────────────────────────────

/// Extractor that fetches the page itself and asks the language model to
/// fill in the schema from the page text.
pub struct LlmExtractor {
    llm: Arc<dyn LanguageModel>,
    timeout: Duration,
}

impl LlmExtractor {
    pub fn new(llm: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    fn prompt(url: &str, schema: &ExtractionSchema, page_text: &str) -> String {
        let mut fields = String::new();
        for (name, description) in schema.iter() {
            fields.push_str(&format!("  \"{}\": {}\n", name, description));
        }
        format!(
            "Extract the following fields from the page text below.\n\
             Fields:\n{fields}\
             Page URL: {url}\n\
             Return a single JSON object (or a JSON array of objects if the \
             page lists several matching items) whose keys are exactly the \
             field names above. Use null for anything not present on the \
             page. Return JSON only, no prose.\n\n\
             Page text:\n{page_text}"
        )
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn run(
        &self,
        url: &str,
        schema: &ExtractionSchema,
    ) -> Result<ExtractOutcome, ProviderError> {
        let opts = FetchOptions::new(self.timeout);
        let text = fetch_page_text(url, &opts).await?;
        let reply = self.llm.invoke(&Self::prompt(url, schema, &text)).await?;
        let value = parse_json_reply(&reply)
            .map_err(|e| ProviderError::Parse(format!("extractor reply: {}", e)))?;
        ExtractOutcome::from_json(&value)
            .ok_or_else(|| ProviderError::Parse("extractor reply is not an object or array".into()))
    }
}

// ── Google result-page search provider ───────────────────────────────────────

/// Search provider that scrapes a Google result page, in the manner of the
/// classic result-link scrapers. A rotating user agent comes in through
/// `FetchOptions`; nothing global is touched.
pub struct GoogleSearchProvider;

#[async_trait]
impl SearchProvider for GoogleSearchProvider {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        opts: &FetchOptions,
    ) -> Result<Vec<String>, ProviderError> {
        let num = (limit + 2).to_string();
        let url = Url::parse_with_params(
            "https://www.google.com/search",
            &[("q", query), ("num", num.as_str())],
        )
        .map_err(|e| ProviderError::Http(e.to_string()))?;

        let client = build_client(opts)?;
        let response = client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| classify_request_error(e, url.as_str()))?;
        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }
        let html = response
            .text()
            .await
            .map_err(|e| classify_request_error(e, url.as_str()))?;

        Ok(result_links(&html, limit))
    }
}

/// Pull outbound result links out of a Google result page, in order,
/// deduplicated, capped at `limit`.
fn result_links(html: &str, limit: usize) -> Vec<String> {
    let document = Html::parse_document(html);
    let anchor_sel = Selector::parse("a[href]").unwrap();

    let mut links: Vec<String> = Vec::new();
    for anchor in document.select(&anchor_sel) {
        let href = match anchor.value().attr("href") {
            Some(h) => h,
            None => continue,
        };
        let target = if let Some(rest) = href.strip_prefix("/url?") {
            // Redirect-style links carry the destination in the q param.
            Url::parse(&format!("https://www.google.com/url?{}", rest))
                .ok()
                .and_then(|u| {
                    u.query_pairs()
                        .find(|(k, _)| k == "q")
                        .map(|(_, v)| v.into_owned())
                })
        } else if href.starts_with("http://") || href.starts_with("https://") {
            Some(href.to_string())
        } else {
            None
        };

        if let Some(target) = target {
            let is_google = Url::parse(&target)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.contains("google.")))
                .unwrap_or(true);
            if !is_google && !links.contains(&target) {
                links.push(target);
            }
        }
        if links.len() >= limit {
            break;
        }
    }
    links
}

// ── Gemini language model ────────────────────────────────────────────────────

/// Gemini `generateContent` REST client, temperature pinned to zero.
pub struct GeminiModel {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiModel {
    pub fn new(api_key: String, model: String) -> Result<Self, ProviderError> {
        let client = reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ProviderError::Http(e.to_string()))?;
        Ok(Self { api_key, model, client })
    }
}

#[async_trait]
impl LanguageModel for GeminiModel {
    async fn invoke(&self, prompt: &str) -> Result<String, ProviderError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "temperature": 0.0 },
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_request_error(e, "generativelanguage.googleapis.com"))?;
        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        value
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Parse("no text candidate in model response".into()))
    }
}

// ── Translate TTS synthesizer ────────────────────────────────────────────────

/// Speech synthesis through the public translate TTS endpoint. Long text
/// is split into ≤200-character chunks and the MP3 segments concatenated.
pub struct TranslateTts;

impl TranslateTts {
    fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current = String::new();
        for word in text.split_whitespace() {
            if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > max_chars
            {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }
}

#[async_trait]
impl SpeechSynthesizer for TranslateTts {
    async fn synthesize(&self, text: &str, lang: &str) -> Result<Vec<u8>, ProviderError> {
        let chunks = Self::chunk_text(text, TTS_CHUNK_CHARS);
        if chunks.is_empty() {
            return Err(ProviderError::Parse("no text to synthesize".into()));
        }

        let opts = FetchOptions::default();
        let client = build_client(&opts)?;
        let mut audio = Vec::new();

        let total = chunks.len().to_string();
        for (idx, chunk) in chunks.iter().enumerate() {
            let idx = idx.to_string();
            let url = Url::parse_with_params(
                "https://translate.google.com/translate_tts",
                &[
                    ("ie", "UTF-8"),
                    ("client", "tw-ob"),
                    ("tl", lang),
                    ("q", chunk.as_str()),
                    ("idx", idx.as_str()),
                    ("total", total.as_str()),
                ],
            )
            .map_err(|e| ProviderError::Http(e.to_string()))?;

            let response = client
                .get(url.as_str())
                .send()
                .await
                .map_err(|e| classify_request_error(e, url.as_str()))?;
            if !response.status().is_success() {
                return Err(ProviderError::Status(response.status().as_u16()));
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|e| classify_request_error(e, url.as_str()))?;
            audio.extend_from_slice(&bytes);
        }

        Ok(audio)
    }
}

// ── Mocks for tests ──────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// What a mock extractor should do for one URL.
    #[derive(Debug, Clone)]
    pub enum Scripted {
        Outcome(ExtractOutcome),
        SoftError,
        Timeout,
    }

    #[derive(Default)]
    pub struct MockExtractor {
        scripts: HashMap<String, Scripted>,
        pub calls: Mutex<Vec<String>>,
    }

    impl MockExtractor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(mut self, url: &str, script: Scripted) -> Self {
            self.scripts.insert(url.to_string(), script);
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Extractor for MockExtractor {
        async fn run(
            &self,
            url: &str,
            _schema: &ExtractionSchema,
        ) -> Result<ExtractOutcome, ProviderError> {
            self.calls.lock().unwrap().push(url.to_string());
            match self.scripts.get(url) {
                Some(Scripted::Outcome(outcome)) => Ok(outcome.clone()),
                Some(Scripted::SoftError) => {
                    Err(ProviderError::Http("scripted failure".into()))
                }
                Some(Scripted::Timeout) => Err(ProviderError::Timeout { url: url.to_string() }),
                None => Err(ProviderError::Status(404)),
            }
        }
    }

    /// Returns one batch of URLs per call; used to script the
    /// retry-on-empty-discovery behavior.
    #[derive(Default)]
    pub struct MockSearchProvider {
        batches: Mutex<Vec<Vec<String>>>,
        pub calls: Mutex<usize>,
    }

    impl MockSearchProvider {
        pub fn with_batches(batches: Vec<Vec<&str>>) -> Self {
            Self {
                batches: Mutex::new(
                    batches
                        .into_iter()
                        .map(|b| b.into_iter().map(str::to_string).collect())
                        .collect(),
                ),
                calls: Mutex::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl SearchProvider for MockSearchProvider {
        async fn search(
            &self,
            _query: &str,
            limit: usize,
            _opts: &FetchOptions,
        ) -> Result<Vec<String>, ProviderError> {
            *self.calls.lock().unwrap() += 1;
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                return Err(ProviderError::Status(429));
            }
            let mut batch = batches.remove(0);
            batch.truncate(limit);
            Ok(batch)
        }
    }

    pub struct MockLanguageModel {
        reply: Result<String, ()>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl MockLanguageModel {
        pub fn replying(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self {
                reply: Err(()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for MockLanguageModel {
        async fn invoke(&self, prompt: &str) -> Result<String, ProviderError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(()) => Err(ProviderError::Status(500)),
            }
        }
    }

    pub struct MockPageFetcher {
        pages: HashMap<String, String>,
        timeout_urls: Vec<String>,
    }

    impl MockPageFetcher {
        pub fn new() -> Self {
            Self { pages: HashMap::new(), timeout_urls: Vec::new() }
        }

        pub fn with_page(mut self, url: &str, text: &str) -> Self {
            self.pages.insert(url.to_string(), text.to_string());
            self
        }

        pub fn timing_out_on(mut self, url: &str) -> Self {
            self.timeout_urls.push(url.to_string());
            self
        }
    }

    #[async_trait]
    impl PageFetcher for MockPageFetcher {
        async fn fetch_text(
            &self,
            url: &str,
            _opts: &FetchOptions,
        ) -> Result<String, ProviderError> {
            if self.timeout_urls.iter().any(|u| u == url) {
                return Err(ProviderError::Timeout { url: url.to_string() });
            }
            self.pages
                .get(url)
                .cloned()
                .ok_or(ProviderError::Status(404))
        }
    }

    pub struct MockSpeech;

    #[async_trait]
    impl SpeechSynthesizer for MockSpeech {
        async fn synthesize(&self, text: &str, _lang: &str) -> Result<Vec<u8>, ProviderError> {
            Ok(format!("MP3:{}", text).into_bytes())
        }
    }
}
