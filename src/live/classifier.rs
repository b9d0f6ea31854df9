use serde_json::Value;

use crate::domain::OperationKind;

const ID_FIELD: &str = "id";
const MAX_KEY_VALUE_FIELDS: usize = 2;
const MIN_RELATIONAL_SCALARS: usize = 3;
const MAX_RELATIONAL_NESTED: usize = 1;

/// Infer the kind of operation from the shape of the record.
///
/// Precedence is fixed: graph, key-value, relational, document. The `id`
/// field is ignored when counting. Anything that is not an object is
/// [`OperationKind::Unknown`].
pub fn classify(record: Option<&Value>) -> OperationKind {
    let Some(Value::Object(fields)) = record else {
        return OperationKind::Unknown;
    };

    if fields.contains_key("in") && fields.contains_key("out") {
        return OperationKind::Graph;
    }

    let mut total = 0;
    let mut scalar = 0;
    let mut nested = 0;
    for (name, value) in fields {
        if name == ID_FIELD {
            continue;
        }
        total += 1;
        match value {
            Value::Object(_) | Value::Array(_) => nested += 1,
            _ => scalar += 1,
        }
    }

    // An id-only record falls through to document
    if total > 0 && total <= MAX_KEY_VALUE_FIELDS {
        return OperationKind::KeyValue;
    }
    if scalar >= MIN_RELATIONAL_SCALARS && nested <= MAX_RELATIONAL_NESTED {
        return OperationKind::Relational;
    }
    OperationKind::Document
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kind(v: Value) -> OperationKind {
        classify(Some(&v))
    }

    #[test]
    fn test_graph_edge_wins_regardless_of_other_fields() {
        assert_eq!(kind(json!({"id": "likes:1", "in": "user:1", "out": "post:1"})), OperationKind::Graph);
        assert_eq!(
            kind(json!({"in": "a:1", "out": "b:1", "w": 1, "x": 2, "y": 3, "meta": {"k": 1}, "tags": []})),
            OperationKind::Graph
        );
        // Only one side of the edge is not enough
        assert_eq!(kind(json!({"id": 1, "in": "a:1"})), OperationKind::KeyValue);
    }

    #[test]
    fn test_key_value() {
        assert_eq!(kind(json!({"id": "cfg:1", "value": 42})), OperationKind::KeyValue);
        assert_eq!(kind(json!({"id": "cfg:1", "key": "k", "value": {"nested": true}})), OperationKind::KeyValue);
        assert_eq!(kind(json!({"key": "k"})), OperationKind::KeyValue);
    }

    #[test]
    fn test_relational() {
        assert_eq!(
            kind(json!({"id": 1, "customer": "a", "total": 9.5, "status": "paid"})),
            OperationKind::Relational
        );
        assert_eq!(
            kind(json!({"id": 1, "a": 1, "b": null, "c": true, "d": "x"})),
            OperationKind::Relational
        );
        // One nested value is still tabular
        assert_eq!(
            kind(json!({"a": 1, "b": 2, "c": 3, "address": {"city": "x"}})),
            OperationKind::Relational
        );
    }

    #[test]
    fn test_document() {
        assert_eq!(
            kind(json!({"a": 1, "b": 2, "c": 3, "tags": [], "meta": {}})),
            OperationKind::Document
        );
        assert_eq!(kind(json!({"a": {}, "b": [], "c": 1})), OperationKind::Document);
        assert_eq!(kind(json!({"id": "only:1"})), OperationKind::Document);
        assert_eq!(kind(json!({})), OperationKind::Document);
    }

    #[test]
    fn test_unknown_payloads() {
        assert_eq!(classify(None), OperationKind::Unknown);
        assert_eq!(kind(Value::Null), OperationKind::Unknown);
        assert_eq!(kind(json!("orders:1")), OperationKind::Unknown);
        assert_eq!(kind(json!([1, 2, 3])), OperationKind::Unknown);
    }
}
