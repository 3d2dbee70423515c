use serde::{Deserialize, Serialize};

use crate::record::Record;

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    /// Caller override for how many records to collect (clamped 1-10).
    pub num_results: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<Record>,
    /// True when a fatal error cut the run short after partial collection.
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NewsRequest {
    pub site_url: String,
    /// BCP-47-ish language code for the synthesized voice; defaults to "en".
    pub voice_lang: Option<String>,
}
