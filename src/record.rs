use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Record ───────────────────────────────────────────────────────────────────

/// One extracted item: an ordered field → value mapping.
///
/// Field names keep their original casing for display; lookups for a
/// "name"-like key are case-insensitive. `None` models an explicit null
/// from the extractor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub IndexMap<String, Option<String>>);

/// Values the extractor emits when it found nothing useful.
fn is_placeholder(value: &Option<String>) -> bool {
    match value {
        None => true,
        Some(s) => {
            let t = s.trim();
            t.is_empty()
                || t.eq_ignore_ascii_case("none")
                || t.eq_ignore_ascii_case("null")
                || t.eq_ignore_ascii_case("n/a")
        }
    }
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Option<String>) {
        self.0.insert(key.into(), value);
    }

    /// Case-insensitive field lookup.
    pub fn get_ci(&self, key: &str) -> Option<&Option<String>> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// The value used for relevance matching: the `name` field if one
    /// exists (any casing), otherwise the first field in insertion order.
    pub fn name_like(&self) -> Option<&str> {
        self.get_ci("name")
            .or_else(|| self.0.values().next())
            .and_then(|v| v.as_deref())
    }

    /// True if at least one field carries a real value.
    pub fn has_content(&self) -> bool {
        self.0.values().any(|v| !is_placeholder(v))
    }

    /// True if `field` is present (any casing) with a non-placeholder value.
    pub fn field_filled(&self, field: &str) -> bool {
        self.get_ci(field).map(|v| !is_placeholder(v)).unwrap_or(false)
    }

    /// Build a Record from a JSON object, coercing scalar values to
    /// strings and dropping nested structures.
    pub fn from_json_object(map: &serde_json::Map<String, Value>) -> Self {
        let mut record = Record::new();
        for (key, value) in map {
            let coerced = match value {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                Value::Array(_) | Value::Object(_) => continue,
            };
            record.insert(key.clone(), coerced);
        }
        record
    }
}

// ── Extractor output shape ───────────────────────────────────────────────────

/// The upstream extractor returns either one record or a list of them.
/// Callers normalize to a sequence immediately via [`ExtractOutcome::into_records`].
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractOutcome {
    One(Record),
    Many(Vec<Record>),
}

impl ExtractOutcome {
    /// Parse the extractor's raw JSON into an outcome. Arrays keep only
    /// object elements; anything else is rejected.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(ExtractOutcome::One(Record::from_json_object(map))),
            Value::Array(items) => {
                let records: Vec<Record> = items
                    .iter()
                    .filter_map(|v| v.as_object().map(Record::from_json_object))
                    .collect();
                Some(ExtractOutcome::Many(records))
            }
            _ => None,
        }
    }

    pub fn into_records(self) -> Vec<Record> {
        match self {
            ExtractOutcome::One(record) => vec![record],
            ExtractOutcome::Many(records) => records,
        }
    }
}

// ── Validation ───────────────────────────────────────────────────────────────

/// How strictly extractor output is vetted before it enters the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// Non-emptiness only; used for generic extraction.
    Loose,
    /// Non-emptiness plus required, non-placeholder fields; used for
    /// product search.
    Strict,
}

/// Whether an extractor outcome is worth keeping at all.
///
/// Lists must be non-empty with a non-empty first record; single records
/// must be non-empty. Strict mode additionally checks the required fields
/// on the record that was inspected.
pub fn is_relevant_result(
    outcome: &ExtractOutcome,
    strictness: Strictness,
    required_fields: &[String],
) -> bool {
    let probe = match outcome {
        ExtractOutcome::Many(records) => match records.first() {
            Some(first) => first,
            None => return false,
        },
        ExtractOutcome::One(record) => record,
    };

    if !probe.has_content() {
        return false;
    }

    match strictness {
        Strictness::Loose => true,
        Strictness::Strict => required_fields.iter().all(|f| probe.field_filled(f)),
    }
}

/// Per-record check applied while accumulating: every kept record must
/// have content, and strict mode re-checks the required fields on each
/// record individually (a list can mix good and junk entries).
pub fn record_passes(record: &Record, strictness: Strictness, required_fields: &[String]) -> bool {
    if !record.has_content() {
        return false;
    }
    match strictness {
        Strictness::Loose => true,
        Strictness::Strict => required_fields.iter().all(|f| record.field_filled(f)),
    }
}
