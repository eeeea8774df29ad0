use rustc_hash::{FxHashMap, FxHashSet};

/// Upper bound the Responses API enforces on function names.
pub const TOOL_NAME_LIMIT: usize = 64;

/// Original tool names mapped to the names sent upstream, plus the inverse.
#[derive(Debug, Clone, Default)]
pub struct ShortNameMap {
    forward: FxHashMap<String, String>,
    reverse: FxHashMap<String, String>,
}

impl ShortNameMap {
    /// Build unique short names for `names` in order, each at most `limit` chars.
    #[must_use]
    pub fn build<'a>(names: impl IntoIterator<Item = &'a str>, limit: usize) -> Self {
        let mut used = FxHashSet::default();
        let mut map = Self::default();
        for name in names {
            if map.forward.contains_key(name) {
                continue;
            }
            let unique = make_unique(base_candidate(name, limit), &used, limit);
            used.insert(unique.clone());
            map.reverse.insert(unique.clone(), name.to_string());
            map.forward.insert(name.to_string(), unique);
        }
        map
    }

    /// Short name for `original`; names never registered fall back to plain shortening.
    #[must_use]
    pub fn shorten(&self, original: &str, limit: usize) -> String {
        self.forward
            .get(original)
            .cloned()
            .unwrap_or_else(|| base_candidate(original, limit))
    }

    /// Original name for `short`, or `short` itself when it was never shortened.
    #[must_use]
    pub fn restore<'a>(&'a self, short: &'a str) -> &'a str {
        self.reverse.get(short).map_or(short, String::as_str)
    }

    /// Whether any registered name actually changed.
    #[must_use]
    pub fn has_renames(&self) -> bool {
        self.forward.iter().any(|(original, short)| original != short)
    }

    /// Short-to-original pairs for names that changed.
    #[must_use]
    pub fn reverse_renames(&self) -> FxHashMap<String, String> {
        self.reverse
            .iter()
            .filter(|(short, original)| short != original)
            .map(|(short, original)| (short.clone(), original.clone()))
            .collect()
    }
}

fn truncate_chars(value: &str, limit: usize) -> String {
    value.chars().take(limit).collect()
}

/// `mcp__server__tool` keeps the `mcp__` prefix and the final segment.
fn base_candidate(name: &str, limit: usize) -> String {
    if name.chars().count() <= limit {
        return name.to_string();
    }
    if let Some(rest) = name.strip_prefix("mcp__") {
        if let Some(pos) = rest.rfind("__") {
            if pos > 0 {
                let candidate = format!("mcp__{}", &rest[pos + 2..]);
                return truncate_chars(&candidate, limit);
            }
        }
    }
    truncate_chars(name, limit)
}

fn make_unique(candidate: String, used: &FxHashSet<String>, limit: usize) -> String {
    if !used.contains(&candidate) {
        return candidate;
    }
    let mut last = candidate.clone();
    for suffix in 1..=1000u32 {
        let suffix = format!("_{suffix}");
        let Some(allowed) = limit.checked_sub(suffix.len()) else {
            return truncate_chars(&candidate, limit);
        };
        let mut unique = truncate_chars(&candidate, allowed);
        unique.push_str(&suffix);
        if !used.contains(&unique) {
            return unique;
        }
        last = unique;
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_names_pass_through() {
        let map = ShortNameMap::build(["read_file", "write_file"], TOOL_NAME_LIMIT);
        assert_eq!(map.shorten("read_file", TOOL_NAME_LIMIT), "read_file");
        assert_eq!(map.restore("read_file"), "read_file");
        assert!(!map.has_renames());
    }

    #[test]
    fn test_mcp_names_keep_last_segment() {
        let long = format!("mcp__{}__search_docs", "server".repeat(12));
        let map = ShortNameMap::build([long.as_str()], TOOL_NAME_LIMIT);
        let short = map.shorten(&long, TOOL_NAME_LIMIT);
        assert_eq!(short, "mcp__search_docs");
        assert_eq!(map.restore(&short), long);
        assert!(map.has_renames());
        assert_eq!(map.reverse_renames().len(), 1);
    }

    #[test]
    fn test_collisions_get_numeric_suffix() {
        let a = format!("{}_alpha", "x".repeat(70));
        let b = format!("{}_beta", "x".repeat(70));
        let map = ShortNameMap::build([a.as_str(), b.as_str()], TOOL_NAME_LIMIT);
        let short_a = map.shorten(&a, TOOL_NAME_LIMIT);
        let short_b = map.shorten(&b, TOOL_NAME_LIMIT);
        assert_eq!(short_a.len(), TOOL_NAME_LIMIT);
        assert_ne!(short_a, short_b);
        assert!(short_b.ends_with("_1"));
        assert!(short_b.len() <= TOOL_NAME_LIMIT);
        assert_eq!(map.restore(&short_b), b);
    }
}
