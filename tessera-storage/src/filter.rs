//! Key query filters

use serde_json::Value;

/// Filter accepted by [`crate::StorageAdapter::query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageFilter {
    All,
    Prefix(String),
    /// Records whose JSON value at dotted `field` equals `value`
    /// (strings compare unquoted; array fields match any element).
    Attribute { field: String, value: String },
    And(Vec<StorageFilter>),
}

impl StorageFilter {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        StorageFilter::Prefix(prefix.into())
    }

    pub fn attribute(field: impl Into<String>, value: impl Into<String>) -> Self {
        StorageFilter::Attribute {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn and(self, other: StorageFilter) -> Self {
        match self {
            StorageFilter::And(mut parts) => {
                parts.push(other);
                StorageFilter::And(parts)
            }
            first => StorageFilter::And(vec![first, other]),
        }
    }

    /// Whether the filter needs the record body, not just its key.
    pub fn needs_value(&self) -> bool {
        match self {
            StorageFilter::All | StorageFilter::Prefix(_) => false,
            StorageFilter::Attribute { .. } => true,
            StorageFilter::And(parts) => parts.iter().any(StorageFilter::needs_value),
        }
    }

    /// Evaluate against a key and (optionally) its raw value.
    pub fn matches(&self, key: &str, value: Option<&[u8]>) -> bool {
        match self {
            StorageFilter::All => true,
            StorageFilter::Prefix(prefix) => key.starts_with(prefix.as_str()),
            StorageFilter::Attribute { field, value: wanted } => value
                .and_then(|bytes| serde_json::from_slice::<Value>(bytes).ok())
                .map(|json| json_field_values(&json, field).iter().any(|v| v == wanted))
                .unwrap_or(false),
            StorageFilter::And(parts) => parts.iter().all(|p| p.matches(key, value)),
        }
    }
}

/// String forms of the scalar(s) at a dotted path.
pub fn json_field_values(json: &Value, field: &str) -> Vec<String> {
    let Some(found) = field
        .split('.')
        .try_fold(json, |value, segment| value.get(segment))
    else {
        return Vec::new();
    };
    match found {
        Value::Array(items) => items.iter().filter_map(scalar_string).collect(),
        other => scalar_string(other).into_iter().collect(),
    }
}

pub(crate) fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prefix_and_all() {
        assert!(StorageFilter::All.matches("a", None));
        assert!(StorageFilter::prefix("contexts/").matches("contexts/1", None));
        assert!(!StorageFilter::prefix("contexts/").matches("shares/1", None));
    }

    #[test]
    fn test_attribute_matches_nested_and_arrays() {
        let body = serde_json::to_vec(&json!({
            "context_type": "task",
            "metadata": { "priority": 9, "tags": ["rust", "async"] }
        }))
        .unwrap();
        let f = StorageFilter::attribute("metadata.tags", "async");
        assert!(f.matches("k", Some(&body)));
        let f = StorageFilter::attribute("metadata.priority", "9");
        assert!(f.matches("k", Some(&body)));
        let f = StorageFilter::attribute("context_type", "workflow");
        assert!(!f.matches("k", Some(&body)));
    }

    #[test]
    fn test_and_combines() {
        let body = serde_json::to_vec(&json!({ "context_type": "task" })).unwrap();
        let f = StorageFilter::prefix("contexts/").and(StorageFilter::attribute("context_type", "task"));
        assert!(f.needs_value());
        assert!(f.matches("contexts/1", Some(&body)));
        assert!(!f.matches("archive/1", Some(&body)));
    }

    #[test]
    fn test_attribute_without_value_never_matches() {
        assert!(!StorageFilter::attribute("a", "b").matches("k", None));
    }
}
