// ─────────────────────────────────────────────────────────────────────────────
//  hotaru-build :: props  —  ordered build-property map
//
//  The board/platform definition format is a flat list of dotted keys with
//  string values.  Values may reference other keys as {key}; expansion is
//  recursive with a fixed depth cap so reference cycles degrade to the
//  innermost placeholder surviving verbatim.
//
//  Insertion order is preserved: merge() keeps the receiver's ordering and
//  appends unseen keys, which keeps expanded recipes deterministic.
// ─────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::path::Path;

/// Expansion recurses at most this deep before leaving placeholders alone.
const MAX_EXPANSION_DEPTH: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct PropertyMap {
    keys:   Vec<String>,
    values: HashMap<String, String>,
}

impl PropertyMap {
    pub fn new() -> Self {
        PropertyMap::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        if !self.values.contains_key(key) {
            self.keys.push(key.to_owned());
        }
        self.values.insert(key.to_owned(), value.to_owned());
    }

    /// Values from `other` win; unseen keys append in `other`'s order.
    pub fn merge(&mut self, other: &PropertyMap) {
        for key in &other.keys {
            self.set(key, &other.values[key]);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.keys
            .iter()
            .map(move |k| (k.as_str(), self.values[k].as_str()))
    }

    /// `key.arch` if present, else `key`.
    pub fn get_with_arch_fallback(&self, key: &str, arch: &str) -> Option<&str> {
        self.get(&format!("{}.{}", key, arch)).or_else(|| self.get(key))
    }

    /// Sub-map of every `prefix.rest` key, with `prefix.` stripped.
    pub fn subtree(&self, prefix: &str) -> PropertyMap {
        let want = format!("{}.", prefix);
        let mut out = PropertyMap::new();
        for key in &self.keys {
            if let Some(rest) = key.strip_prefix(&want) {
                out.set(rest, &self.values[key]);
            }
        }
        out
    }

    /// Immediate child segments of `prefix`, deduplicated, insertion order.
    pub fn first_level_of(&self, prefix: &str) -> Vec<String> {
        let want = format!("{}.", prefix);
        let mut out: Vec<String> = Vec::new();
        for key in &self.keys {
            if let Some(rest) = key.strip_prefix(&want) {
                let child = rest.split('.').next().unwrap_or(rest);
                if !out.iter().any(|c| c == child) {
                    out.push(child.to_owned());
                }
            }
        }
        out
    }

    /// Expand every `{key}` in `s`, left to right, recursively.
    /// Unknown placeholders survive verbatim.
    pub fn expand(&self, s: &str) -> String {
        self.expand_depth(s, 0)
    }

    fn expand_depth(&self, s: &str, depth: usize) -> String {
        if depth >= MAX_EXPANSION_DEPTH {
            return s.to_owned();
        }
        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    let key = &after[..close];
                    match self.values.get(key) {
                        Some(value) => out.push_str(&self.expand_depth(value, depth + 1)),
                        None => {
                            out.push('{');
                            out.push_str(key);
                            out.push('}');
                        }
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    // Unbalanced brace: keep it and stop scanning.
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }

    // ── Loading ───────────────────────────────────────────────────────────────

    /// Parse `key=value` lines.  Blank lines and `#` comments are skipped;
    /// everything after the first `=` belongs to the value.
    pub fn load_from_str(text: &str) -> PropertyMap {
        let mut map = PropertyMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(eq) = line.find('=') {
                let key = line[..eq].trim();
                let value = line[eq + 1..].trim();
                if !key.is_empty() {
                    map.set(key, value);
                }
            }
        }
        map
    }

    pub fn load_from_file(path: &Path) -> std::io::Result<PropertyMap> {
        let text = std::fs::read_to_string(path)?;
        Ok(PropertyMap::load_from_str(&text))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────
