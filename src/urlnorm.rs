use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

static SCHEME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://").unwrap());

// ── URL normalization ────────────────────────────────────────────────────────

/// Resolve a possibly-relative `path` against `base_url` into an absolute
/// URL string. Best effort on malformed input; never panics.
///
/// - empty path → empty string
/// - already has a scheme → unchanged
/// - `//host/x` → `https://host/x`
/// - `/x` → root-relative join against `base_url`'s origin
/// - anything else (bare host, relative fragment) → `https://` prefix
pub fn normalize(base_url: &str, path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    if SCHEME_RE.is_match(path) {
        return path.to_string();
    }
    if path.starts_with("//") {
        return format!("https:{}", path);
    }
    if path.starts_with('/') {
        if let Ok(base) = Url::parse(base_url) {
            if let Ok(joined) = base.join(path) {
                return joined.to_string();
            }
        }
        // Unparseable base: fall through to string concatenation.
        return format!("{}{}", base_url.trim_end_matches('/'), path);
    }
    format!("https://{}", path)
}

// ── Domain filtering ─────────────────────────────────────────────────────────

/// Whether the needle list names hosts to keep or hosts to drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Host must match at least one needle to stay in scope.
    Allow,
    /// Host matching any needle is dropped.
    Deny,
}

/// Classifies candidate URLs as in-scope or not by case-insensitive
/// substring match against the host component. The mode and needle list
/// are deployment configuration, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct DomainFilter {
    mode: FilterMode,
    needles: Vec<String>,
}

impl DomainFilter {
    pub fn new(mode: FilterMode, needles: Vec<String>) -> Self {
        let needles = needles
            .into_iter()
            .map(|n| n.trim().to_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        Self { mode, needles }
    }

    /// A deny filter with no needles: everything with a host passes.
    pub fn permissive() -> Self {
        Self::new(FilterMode::Deny, Vec::new())
    }

    /// URLs without a parseable host are out of scope in both modes: a
    /// deny list cannot vouch for them and an allow list cannot match them.
    pub fn is_in_scope(&self, url: &str) -> bool {
        let host = match Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_lowercase)) {
            Some(h) => h,
            None => return false,
        };
        let hit = self.needles.iter().any(|n| host.contains(n.as_str()));
        match self.mode {
            FilterMode::Allow => hit,
            FilterMode::Deny => !hit,
        }
    }
}
