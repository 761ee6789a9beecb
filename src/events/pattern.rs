//! Content-filter event patterns.
//!
//! A pattern is a JSON object with optional `source`, `detail-type` and
//! `detail` fields. `source` and `detail-type` are lists of allowed values;
//! `detail` is a nested object whose leaves are lists. A field absent from
//! the pattern matches anything. List elements are either literal values or
//! one of the filters `{"prefix": "..."}` and `{"exists": bool}`.

use std::collections::BTreeMap;

use serde::{Serialize, Serializer};
use serde_json::Value;

use super::types::PutEventEntry;
use crate::error::RouterError;

#[derive(Debug, Clone, PartialEq)]
enum Matcher {
    Equals(Value),
    Prefix(String),
    Exists(bool),
}

impl Matcher {
    fn parse(path: &str, value: &Value) -> Result<Self, RouterError> {
        match value {
            Value::Object(filter) => {
                if filter.len() != 1 {
                    return Err(invalid(path, "a filter object must have exactly one key"));
                }
                match (filter.get("prefix"), filter.get("exists")) {
                    (Some(Value::String(p)), _) => Ok(Self::Prefix(p.clone())),
                    (_, Some(Value::Bool(b))) => Ok(Self::Exists(*b)),
                    _ => Err(invalid(path, "unsupported filter, expected prefix or exists")),
                }
            }
            Value::Array(_) => Err(invalid(path, "nested arrays are not allowed")),
            scalar => Ok(Self::Equals(scalar.clone())),
        }
    }

    fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Self::Exists(expected) => value.is_some_and(|v| !v.is_null()) == *expected,
            Self::Equals(want) => value.is_some_and(|v| any_element(v, |x| x == want)),
            Self::Prefix(prefix) => value.is_some_and(|v| {
                any_element(v, |x| x.as_str().is_some_and(|s| s.starts_with(prefix.as_str())))
            }),
        }
    }
}

/// Array-valued event fields match if any element matches.
fn any_element(value: &Value, pred: impl Fn(&Value) -> bool) -> bool {
    match value {
        Value::Array(items) => items.iter().any(&pred),
        other => pred(other),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum FieldPattern {
    Leaf(Vec<Matcher>),
    Nested(BTreeMap<String, FieldPattern>),
}

impl FieldPattern {
    fn parse(path: &str, value: &Value) -> Result<Self, RouterError> {
        match value {
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(invalid(path, "allowed-value list is empty"));
                }
                let matchers = items
                    .iter()
                    .map(|item| Matcher::parse(path, item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Leaf(matchers))
            }
            Value::Object(fields) => {
                let mut nested = BTreeMap::new();
                for (key, sub) in fields {
                    nested.insert(key.clone(), Self::parse(&format!("{path}.{key}"), sub)?);
                }
                Ok(Self::Nested(nested))
            }
            _ => Err(invalid(path, "must be a list or an object")),
        }
    }

    fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Self::Leaf(matchers) => matchers.iter().any(|m| m.matches(value)),
            Self::Nested(fields) => {
                let object = value.and_then(Value::as_object);
                fields
                    .iter()
                    .all(|(key, pattern)| pattern.matches(object.and_then(|o| o.get(key))))
            }
        }
    }
}

/// A compiled rule pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPattern {
    raw: Value,
    source: Option<FieldPattern>,
    detail_type: Option<FieldPattern>,
    detail: Option<FieldPattern>,
}

impl EventPattern {
    /// Compile a pattern from its JSON form.
    pub fn from_value(raw: Value) -> Result<Self, RouterError> {
        let Some(fields) = raw.as_object() else {
            return Err(RouterError::InvalidPattern(
                "pattern must be a JSON object".to_string(),
            ));
        };

        let mut source = None;
        let mut detail_type = None;
        let mut detail = None;
        for (key, value) in fields {
            match key.as_str() {
                "source" => source = Some(list_only(key, value)?),
                "detail-type" => detail_type = Some(list_only(key, value)?),
                "detail" => {
                    if !value.is_object() {
                        return Err(invalid(key, "must be an object"));
                    }
                    detail = Some(FieldPattern::parse(key, value)?);
                }
                other => {
                    return Err(RouterError::InvalidPattern(format!(
                        "unsupported pattern field '{other}'"
                    )));
                }
            }
        }

        Ok(Self {
            raw,
            source,
            detail_type,
            detail,
        })
    }

    /// Compile a pattern from a JSON string.
    pub fn parse(text: &str) -> Result<Self, RouterError> {
        let raw: Value =
            serde_json::from_str(text).map_err(|e| RouterError::InvalidPattern(e.to_string()))?;
        Self::from_value(raw)
    }

    /// The pattern as written.
    pub fn as_json(&self) -> &Value {
        &self.raw
    }

    pub fn matches(&self, event: &PutEventEntry) -> bool {
        let source = Value::String(event.source.clone());
        let detail_type = Value::String(event.detail_type.clone());
        self.source.as_ref().is_none_or(|p| p.matches(Some(&source)))
            && self
                .detail_type
                .as_ref()
                .is_none_or(|p| p.matches(Some(&detail_type)))
            && self
                .detail
                .as_ref()
                .is_none_or(|p| p.matches(Some(&event.detail)))
    }
}

impl Serialize for EventPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

fn list_only(key: &str, value: &Value) -> Result<FieldPattern, RouterError> {
    if !value.is_array() {
        return Err(invalid(key, "must be a list of allowed values"));
    }
    FieldPattern::parse(key, value)
}

fn invalid(path: &str, reason: &str) -> RouterError {
    RouterError::InvalidPattern(format!("{path}: {reason}"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event(source: &str, detail_type: &str, detail: Value) -> PutEventEntry {
        PutEventEntry::new(source, detail_type, detail)
    }

    #[test]
    fn source_and_detail_type_lists() {
        let pattern = EventPattern::from_value(json!({
            "source": ["email-processor"],
            "detail-type": ["EmailReceived", "EmailParsed"]
        }))
        .unwrap();

        assert!(pattern.matches(&event("email-processor", "EmailParsed", json!({}))));
        assert!(!pattern.matches(&event("email-processor", "SupplierMatched", json!({}))));
        assert!(!pattern.matches(&event("billing", "EmailParsed", json!({}))));
    }

    #[test]
    fn empty_pattern_matches_everything() {
        let pattern = EventPattern::from_value(json!({})).unwrap();
        assert!(pattern.matches(&event("anything", "At all", json!({"x": 1}))));
    }

    #[test]
    fn nested_detail_fields() {
        let pattern = EventPattern::from_value(json!({
            "detail": { "email": { "status": ["PARSED"] }, "bucket": [{"prefix": "inbound-"}] }
        }))
        .unwrap();

        assert!(pattern.matches(&event(
            "s",
            "t",
            json!({"email": {"status": "PARSED"}, "bucket": "inbound-email"})
        )));
        assert!(!pattern.matches(&event(
            "s",
            "t",
            json!({"email": {"status": "FAILED"}, "bucket": "inbound-email"})
        )));
        assert!(!pattern.matches(&event("s", "t", json!({"bucket": "inbound-email"}))));
    }

    #[test]
    fn exists_filter() {
        let pattern =
            EventPattern::from_value(json!({"detail": {"emailId": [{"exists": false}]}})).unwrap();
        assert!(pattern.matches(&event("s", "t", json!({}))));
        assert!(!pattern.matches(&event("s", "t", json!({"emailId": "rfq-001"}))));
    }

    #[test]
    fn array_event_values_match_any_element() {
        let pattern =
            EventPattern::from_value(json!({"detail": {"categories": ["valves"]}})).unwrap();
        assert!(pattern.matches(&event("s", "t", json!({"categories": ["pipes", "valves"]}))));
    }

    #[test]
    fn rejects_malformed_patterns() {
        assert!(EventPattern::from_value(json!([])).is_err());
        assert!(EventPattern::from_value(json!({"source": "email-processor"})).is_err());
        assert!(EventPattern::from_value(json!({"source": []})).is_err());
        assert!(EventPattern::from_value(json!({"account": ["1"]})).is_err());
        assert!(EventPattern::from_value(json!({"detail": {"a": [{"suffix": "x"}]}})).is_err());
        assert!(EventPattern::parse("{not json").is_err());
    }

    #[test]
    fn serializes_as_written() {
        let raw = json!({"source": ["email-processor"]});
        let pattern = EventPattern::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&pattern).unwrap(), raw);
    }
}
