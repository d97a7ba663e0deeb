//! Version payloads.
//!
//! A version snapshot can hold text, an ordered list, a keyed map or a bare
//! scalar. The shape is only known at runtime, so `Content` is a tagged union
//! that round-trips through plain JSON:
//!
//! ```text
//! JSON string  ──► Content::Text
//! JSON array   ──► Content::List
//! JSON object  ──► Content::Map
//! anything else ─► Content::Scalar
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Runtime shape of a [`Content`] value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    List,
    Map,
    Scalar,
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContentKind::Text => "text",
            ContentKind::List => "list",
            ContentKind::Map => "map",
            ContentKind::Scalar => "scalar",
        };
        f.write_str(name)
    }
}

/// Opaque version payload.
///
/// Serializes as the JSON value it wraps, so stored records stay readable by
/// anything that speaks JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum Content {
    Text(String),
    List(Vec<Value>),
    Map(Map<String, Value>),
    Scalar(Value),
}

impl Content {
    /// Shorthand for `Content::Text`.
    pub fn text(value: impl Into<String>) -> Self {
        Content::Text(value.into())
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            Content::Text(_) => ContentKind::Text,
            Content::List(_) => ContentKind::List,
            Content::Map(_) => ContentKind::Map,
            Content::Scalar(_) => ContentKind::Scalar,
        }
    }

    /// Borrow the string if this is text content.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Content::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Textual form used when the payload is written back into a text document.
    ///
    /// Text is returned verbatim; every other shape is rendered as compact JSON.
    pub fn as_text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            other => other.to_value().to_string(),
        }
    }

    /// Convert into the equivalent JSON value.
    pub fn to_value(&self) -> Value {
        self.clone().into()
    }
}

impl Default for Content {
    fn default() -> Self {
        Content::Text(String::new())
    }
}

impl From<Value> for Content {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => Content::Text(s),
            Value::Array(items) => Content::List(items),
            Value::Object(map) => Content::Map(map),
            other => Content::Scalar(other),
        }
    }
}

impl From<Content> for Value {
    fn from(content: Content) -> Self {
        match content {
            Content::Text(s) => Value::String(s),
            Content::List(items) => Value::Array(items),
            Content::Map(map) => Value::Object(map),
            Content::Scalar(v) => v,
        }
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_dispatches_on_shape() {
        assert_eq!(Content::from(json!("hi")).kind(), ContentKind::Text);
        assert_eq!(Content::from(json!([1, 2])).kind(), ContentKind::List);
        assert_eq!(Content::from(json!({"a": 1})).kind(), ContentKind::Map);
        assert_eq!(Content::from(json!(42)).kind(), ContentKind::Scalar);
        assert_eq!(Content::from(json!(null)).kind(), ContentKind::Scalar);
    }

    #[test]
    fn test_serializes_as_plain_json() {
        let content = Content::from(json!({"title": "Notes", "tags": ["a"]}));
        let encoded = serde_json::to_string(&content).unwrap();
        assert!(encoded.starts_with('{'));
        assert!(encoded.contains(r#""title":"Notes""#));

        let decoded: Content = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, content);
    }

    #[test]
    fn test_text_serializes_as_string() {
        let encoded = serde_json::to_string(&Content::text("hello")).unwrap();
        assert_eq!(encoded, r#""hello""#);
    }

    #[test]
    fn test_as_text() {
        assert_eq!(Content::text("line one\nline two").as_text(), "line one\nline two");
        assert_eq!(Content::from(json!(["a", 1])).as_text(), r#"["a",1]"#);
        assert_eq!(Content::from(json!(true)).as_text(), "true");
    }

    #[test]
    fn test_as_str() {
        assert_eq!(Content::text("x").as_str(), Some("x"));
        assert!(Content::from(json!([1])).as_str().is_none());
    }
}
