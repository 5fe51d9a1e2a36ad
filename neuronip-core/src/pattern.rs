//! Key and path matching rules shared by cache invalidation and route
//! classification.

/// `true` when `pattern` equals `key`, is a prefix of it, or is a suffix of
/// it. Interior occurrences do not match. An empty pattern matches any key.
pub fn matches_affix(key: &str, pattern: &str) -> bool {
    key == pattern || key.starts_with(pattern) || key.ends_with(pattern)
}

/// `true` when `marker` occurs anywhere in `path`, including as a prefix,
/// suffix or exact match.
pub fn contains_marker(path: &str, marker: &str) -> bool {
    matches_affix(path, marker) || path.contains(marker)
}
