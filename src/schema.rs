use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::providers::LanguageModel;

/// A query with any of these words gets the shoppable-result treatment.
const PRODUCT_KEYWORDS: &[&str] = &["buy", "price", "product", "item", "purchase"];

/// Schemas may name at most this many fields.
const MAX_SCHEMA_FIELDS: usize = 5;

const SCHEMA_INSTRUCTION: &str = "You design extraction schemas for a web scraper. \
Given a search query, return a JSON object mapping field names to one-line \
descriptions of what to extract from a matching page. Use at most 5 fields. \
Return JSON only, no prose.";

const PRODUCT_ADDENDUM: &str = "This is a shopping query. Request exactly these fields: \
\"Name\" (name of the product), \"Price\" (price of the product), \"Image\" (the \
product image URL; if it is not a complete URL the extractor must prepend the \
domain), and \"Website\" (the product detail page URL, likewise made absolute).";

const GENERIC_ADDENDUM: &str = "This is a general query. Request a \"Title\" field, a \
\"Content\" field for the main text, and a \"Source\" field for the page URL.";

// ── Schema type ──────────────────────────────────────────────────────────────

/// Field name → natural-language description, built once per query and
/// passed unchanged to every extractor call for that query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractionSchema(IndexMap<String, String>);

impl ExtractionSchema {
    /// The hard-coded fallback used whenever schema generation fails.
    pub fn default_generic() -> Self {
        let mut fields = IndexMap::new();
        fields.insert("Title".to_string(), "Title of the page or item".to_string());
        fields.insert(
            "Content".to_string(),
            "Main textual content, condensed to a few sentences".to_string(),
        );
        fields.insert("Source".to_string(), "The complete URL of the page".to_string());
        Self(fields)
    }

    /// Build a fixed schema from literal field/description pairs.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    /// Accept a JSON object of string descriptions, capped at
    /// `MAX_SCHEMA_FIELDS`. Non-string values reject the whole mapping.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let mut fields = IndexMap::new();
        for (name, description) in map {
            fields.insert(name.clone(), description.as_str()?.to_string());
            if fields.len() == MAX_SCHEMA_FIELDS {
                break;
            }
        }
        if fields.is_empty() {
            None
        } else {
            Some(Self(fields))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }
}

// ── Query classification ─────────────────────────────────────────────────────

pub fn is_product_query(query: &str) -> bool {
    let q = query.to_lowercase();
    PRODUCT_KEYWORDS.iter().any(|k| q.contains(k))
}

// ── Generation ───────────────────────────────────────────────────────────────

/// Ask the language model for a per-query schema. Advisory only: any
/// invocation or parse failure logs a warning and falls back to the
/// hard-coded generic schema, never failing the request.
pub async fn generate_schema(llm: &dyn LanguageModel, query: &str) -> ExtractionSchema {
    let addendum = if is_product_query(query) {
        PRODUCT_ADDENDUM
    } else {
        GENERIC_ADDENDUM
    };
    let prompt = format!("{}\n\n{}\n\nSearch query: {}", SCHEMA_INSTRUCTION, addendum, query);

    let reply = match llm.invoke(&prompt).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(query, error = %e, "schema generation failed, using default schema");
            return ExtractionSchema::default_generic();
        }
    };

    match parse_json_reply(&reply).ok().as_ref().and_then(ExtractionSchema::from_value) {
        Some(schema) => schema,
        None => {
            warn!(query, "unparseable schema reply, using default schema");
            ExtractionSchema::default_generic()
        }
    }
}

/// Parse a model reply as JSON, tolerating prose or code fences around the
/// payload by retrying on the outermost brace-delimited span.
pub(crate) fn parse_json_reply(text: &str) -> Result<Value, serde_json::Error> {
    let trimmed = text.trim();
    match serde_json::from_str(trimmed) {
        Ok(value) => Ok(value),
        Err(err) => {
            let start = trimmed.find(|c| c == '{' || c == '[');
            let end = trimmed.rfind(|c| c == '}' || c == ']');
            if let (Some(start), Some(end)) = (start, end) {
                if start < end {
                    return serde_json::from_str(&trimmed[start..=end]);
                }
            }
            Err(err)
        }
    }
}
