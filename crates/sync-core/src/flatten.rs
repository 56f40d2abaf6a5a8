//! Nested document flattening
//!
//! Search engines index a single level of fields, so nested maps and arrays
//! are folded into synthesized keys:
//!
//! ```text
//! {"foo": ["Hello", "World"], "bar": {"x": 1}}  =>  {"foo_0": "Hello", "foo_1": "World", "bar_x": 1}
//! ```
//!
//! Key collisions (a literal `a_0` next to a flattened `a[0]`) are not
//! detected; pick separators that cannot occur in the schema's field names.

use serde_json::Value;
use std::collections::BTreeMap;

pub const DEFAULT_SEPARATOR: &str = "_";

/// Separators used to build flattened keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flattener {
    pub array_separator: String,
    pub hash_separator: String,
}

impl Default for Flattener {
    fn default() -> Self {
        Self::new(DEFAULT_SEPARATOR, DEFAULT_SEPARATOR)
    }
}

impl Flattener {
    pub fn new(array_separator: impl Into<String>, hash_separator: impl Into<String>) -> Self {
        Self {
            array_separator: array_separator.into(),
            hash_separator: hash_separator.into(),
        }
    }

    /// Flatten a document into a single-level field map
    pub fn flatten(&self, document: &Value) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        self.walk("", document, &mut out);
        out
    }

    fn walk(&self, prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let name = self.join(prefix, &self.hash_separator, key);
                    self.walk(&name, child, out);
                }
            }
            Value::Array(items) => {
                for (index, child) in items.iter().enumerate() {
                    let name = self.join(prefix, &self.array_separator, &index.to_string());
                    self.walk(&name, child, out);
                }
            }
            scalar => {
                out.insert(prefix.to_string(), scalar.clone());
            }
        }
    }

    fn join(&self, prefix: &str, separator: &str, key: &str) -> String {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}{separator}{key}")
        }
    }
}

/// Flatten with the default `_` separators
pub fn flatten(document: &Value) -> BTreeMap<String, Value> {
    Flattener::default().flatten(document)
}

/// Flatten with explicit array and hash separators
pub fn flatten_with(
    document: &Value,
    array_separator: &str,
    hash_separator: &str,
) -> BTreeMap<String, Value> {
    Flattener::new(array_separator, hash_separator).flatten(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn expected(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_default_separators() {
        let doc = json!({"foo": ["Hello", "World"], "bar": {"x": 1, "y": 2}});
        assert_eq!(
            flatten(&doc),
            expected(&[
                ("foo_0", json!("Hello")),
                ("foo_1", json!("World")),
                ("bar_x", json!(1)),
                ("bar_y", json!(2)),
            ])
        );
    }

    #[test]
    fn test_custom_separators() {
        let doc = json!({"foo": ["Hello", "World"], "bar": {"x": 1, "y": 2}});
        assert_eq!(
            flatten_with(&doc, "@", "/"),
            expected(&[
                ("foo@0", json!("Hello")),
                ("foo@1", json!("World")),
                ("bar/x", json!(1)),
                ("bar/y", json!(2)),
            ])
        );
    }

    #[test]
    fn test_flat_input_is_identity() {
        let doc = json!({"a": 1, "b": "two", "c": null, "d": true});
        let once = flatten(&doc);
        let again = flatten(&serde_json::to_value(&once).unwrap());
        assert_eq!(once, again);
        assert_eq!(serde_json::to_value(&once).unwrap(), doc);
    }

    #[test]
    fn test_deep_mixed_nesting() {
        let doc = json!({"a": [{"b": [1, {"c": "x"}]}]});
        assert_eq!(
            flatten_with(&doc, "#", "."),
            expected(&[("a#0.b#0", json!(1)), ("a#0.b#1.c", json!("x"))])
        );
    }

    #[test]
    fn test_empty_containers_vanish() {
        let doc = json!({"a": {}, "b": [], "c": 1});
        assert_eq!(flatten(&doc), expected(&[("c", json!(1))]));
    }
}
