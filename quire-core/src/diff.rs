//! Structural diff between two content snapshots.
//!
//! The comparison rule depends on the shape of the payloads:
//!
//! | Shape pair   | Additions / deletions              | Modifications        |
//! |--------------|------------------------------------|----------------------|
//! | Text, Text   | lines by exact equality            | none                 |
//! | List, List   | items by deep equality (not index) | none                 |
//! | Map, Map     | keys present on one side only      | shared keys, changed |
//! | anything else| one deletion + one addition if ≠   | none                 |
//!
//! Mismatched shapes are not an error: they fall through to the scalar rule.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::content::Content;
use crate::version::Version;

/// A value whose key exists on both sides of a map diff but changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    pub key: String,
    pub previous: Value,
    pub current: Value,
}

/// Unordered result of comparing two payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentDiff {
    pub additions: Vec<Value>,
    pub deletions: Vec<Value>,
    pub modifications: Vec<Modification>,
}

impl ContentDiff {
    /// True when the two payloads compared equal under their shape's rule.
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.deletions.is_empty() && self.modifications.is_empty()
    }

    /// Total number of reported changes.
    pub fn change_count(&self) -> usize {
        self.additions.len() + self.deletions.len() + self.modifications.len()
    }
}

/// Diff of two stored versions, with `previous_version` always the lower number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionDiff {
    pub previous_version: u64,
    pub current_version: u64,
    pub additions: Vec<Value>,
    pub deletions: Vec<Value>,
    pub modifications: Vec<Modification>,
}

impl VersionDiff {
    /// Compare two versions in either argument order.
    ///
    /// The versions are sorted by `version_number` first, so `between(a, b)`
    /// and `between(b, a)` produce the same result.
    pub fn between(a: &Version, b: &Version) -> Self {
        let (previous, current) = if a.version_number <= b.version_number {
            (a, b)
        } else {
            (b, a)
        };
        let ContentDiff {
            additions,
            deletions,
            modifications,
        } = diff(&previous.content, &current.content);
        Self {
            previous_version: previous.version_number,
            current_version: current.version_number,
            additions,
            deletions,
            modifications,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.deletions.is_empty() && self.modifications.is_empty()
    }
}

/// Compute the structural delta from `previous` to `current`.
pub fn diff(previous: &Content, current: &Content) -> ContentDiff {
    match (previous, current) {
        (Content::Text(prev), Content::Text(curr)) => diff_text(prev, curr),
        (Content::List(prev), Content::List(curr)) => diff_list(prev, curr),
        (Content::Map(prev), Content::Map(curr)) => diff_map(prev, curr),
        _ => diff_scalar(previous.to_value(), current.to_value()),
    }
}

fn diff_text(previous: &str, current: &str) -> ContentDiff {
    let prev_lines: HashSet<&str> = previous.split('\n').collect();
    let curr_lines: HashSet<&str> = current.split('\n').collect();

    let additions = current
        .split('\n')
        .filter(|line| !prev_lines.contains(line))
        .map(|line| Value::String(line.to_string()))
        .collect();
    let deletions = previous
        .split('\n')
        .filter(|line| !curr_lines.contains(line))
        .map(|line| Value::String(line.to_string()))
        .collect();

    ContentDiff {
        additions,
        deletions,
        modifications: Vec::new(),
    }
}

fn diff_list(previous: &[Value], current: &[Value]) -> ContentDiff {
    let prev_keys: HashSet<String> = previous.iter().map(canonical_key).collect();
    let curr_keys: HashSet<String> = current.iter().map(canonical_key).collect();

    let additions = current
        .iter()
        .filter(|item| !prev_keys.contains(&canonical_key(item)))
        .cloned()
        .collect();
    let deletions = previous
        .iter()
        .filter(|item| !curr_keys.contains(&canonical_key(item)))
        .cloned()
        .collect();

    ContentDiff {
        additions,
        deletions,
        modifications: Vec::new(),
    }
}

fn diff_map(previous: &Map<String, Value>, current: &Map<String, Value>) -> ContentDiff {
    let mut result = ContentDiff::default();

    for (key, value) in current {
        match previous.get(key) {
            None => result.additions.push(single_entry(key, value)),
            Some(old) if canonical_key(old) != canonical_key(value) => {
                result.modifications.push(Modification {
                    key: key.clone(),
                    previous: old.clone(),
                    current: value.clone(),
                });
            }
            Some(_) => {}
        }
    }
    for (key, value) in previous {
        if !current.contains_key(key) {
            result.deletions.push(single_entry(key, value));
        }
    }

    result
}

fn diff_scalar(previous: Value, current: Value) -> ContentDiff {
    if canonical_key(&previous) == canonical_key(&current) {
        return ContentDiff::default();
    }
    ContentDiff {
        additions: vec![current],
        deletions: vec![previous],
        modifications: Vec::new(),
    }
}

fn single_entry(key: &str, value: &Value) -> Value {
    let mut entry = Map::new();
    entry.insert(key.to_string(), value.clone());
    Value::Object(entry)
}

/// Serialized form with object keys sorted at every level.
///
/// Two values are deep-equal exactly when their canonical keys match,
/// independent of how the underlying map orders its entries.
fn canonical_key(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
