use crate::record::Record;

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.6;

// ── Character-level similarity ───────────────────────────────────────────────

/// Longest common block between `a` and `b`: (start in a, start in b, len).
/// Ties go to the earliest block in `a`.
fn longest_block(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut prev = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        let mut curr = vec![0usize; b.len() + 1];
        for (j, &cb) in b.iter().enumerate() {
            if ca == cb {
                let len = prev[j] + 1;
                curr[j + 1] = len;
                if len > best.2 {
                    best = (i + 1 - len, j + 1 - len, len);
                }
            }
        }
        prev = curr;
    }
    best
}

/// Total characters covered by matching blocks: the longest common block,
/// then recursively the regions to its left and right.
fn matched_chars(a: &[char], b: &[char]) -> usize {
    let (ai, bi, len) = longest_block(a, b);
    if len == 0 {
        return 0;
    }
    len + matched_chars(&a[..ai], &b[..bi]) + matched_chars(&a[ai + len..], &b[bi + len..])
}

/// Normalized similarity in [0, 1]: twice the matched character count over
/// the combined length. Two empty strings are identical.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matched_chars(&a, &b) as f64 / total as f64
}

// ── Relevance cascade ────────────────────────────────────────────────────────

/// Decide whether a record's display name is close enough to the query.
///
/// Cheap, high-precision checks run first: exact substring, then
/// majority word overlap. The character similarity ratio is a last-resort
/// fallback for near-miss spellings and reordered words.
pub fn is_relevant(query: &str, record: &Record, threshold: f64) -> bool {
    let name = match record.name_like() {
        Some(n) => n,
        None => return false,
    };

    let query_lc = query.to_lowercase();
    let name_lc = name.to_lowercase();

    if name_lc.contains(&query_lc) {
        return true;
    }

    let query_words: Vec<&str> = query_lc.split_whitespace().collect();
    let name_words: Vec<&str> = name_lc.split_whitespace().collect();
    if !query_words.is_empty() {
        let matching = query_words
            .iter()
            .filter(|qw| name_words.iter().any(|nw| nw.contains(*qw)))
            .count();
        let needed = (query_words.len() / 2).max(1);
        if matching >= needed {
            return true;
        }
    }

    similarity_ratio(&query_lc, &name_lc) >= threshold
}
