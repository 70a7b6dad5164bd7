//! Wire types and the typed-value codec of the REST document API.
//!
//! Every field value travels wrapped in a single-key object naming its type,
//! e.g. `{"stringValue": "Lisbon"}` or `{"integerValue": "3"}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DocumentClientError, Result};

pub type Fields = Map<String, Value>;

/// Document resource as returned by get, patch and runQuery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub fields: Fields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMask {
    pub field_paths: Vec<String>,
}

/// One entry of a commit request: either a masked update or a delete.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Write {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<WireDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_mask: Option<DocumentMask>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitRequest {
    pub writes: Vec<Write>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSelector {
    pub collection_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldReference {
    pub field_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldFilter {
    pub field: FieldReference,
    pub op: &'static str,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompositeFilter {
    pub op: &'static str,
    pub filters: Vec<QueryFilter>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryFilter {
    FieldFilter(FieldFilter),
    CompositeFilter(CompositeFilter),
}

#[derive(Debug, Clone, Serialize)]
pub struct StructuredQuery {
    pub from: Vec<CollectionSelector>,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub filter: Option<QueryFilter>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQueryRequest {
    pub structured_query: StructuredQuery,
}

/// One element of the runQuery response stream. Elements without a
/// document only carry progress information.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQueryResponseItem {
    #[serde(default)]
    pub document: Option<WireDocument>,
    #[serde(default)]
    pub read_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Wraps a plain JSON value in its typed wire form.
pub fn encode_value(value: &Value) -> Value {
    let mut wrapped = Map::new();
    match value {
        Value::Null => {
            wrapped.insert("nullValue".to_string(), Value::Null);
        }
        Value::Bool(b) => {
            wrapped.insert("booleanValue".to_string(), Value::Bool(*b));
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                // 64-bit integers travel as strings.
                wrapped.insert("integerValue".to_string(), Value::String(i.to_string()));
            } else {
                wrapped.insert("doubleValue".to_string(), Value::Number(n.clone()));
            }
        }
        Value::String(s) => {
            wrapped.insert("stringValue".to_string(), Value::String(s.clone()));
        }
        Value::Array(items) => {
            let values = items.iter().map(encode_value).collect();
            let mut array = Map::new();
            array.insert("values".to_string(), Value::Array(values));
            wrapped.insert("arrayValue".to_string(), Value::Object(array));
        }
        Value::Object(object) => {
            let mut map = Map::new();
            map.insert("fields".to_string(), Value::Object(encode_fields(object)));
            wrapped.insert("mapValue".to_string(), Value::Object(map));
        }
    }
    Value::Object(wrapped)
}

pub fn encode_fields(fields: &Fields) -> Fields {
    fields
        .iter()
        .map(|(key, value)| (key.clone(), encode_value(value)))
        .collect()
}

/// Unwraps a typed wire value back into plain JSON.
pub fn decode_value(value: &Value) -> Result<Value> {
    let Some((kind, inner)) = value.as_object().and_then(|o| o.iter().next()) else {
        return Err(DocumentClientError::invalid_response(format!(
            "expected a typed value, got {}",
            value
        )));
    };
    let decoded = match kind.as_str() {
        "nullValue" => Value::Null,
        "booleanValue" | "doubleValue" => inner.clone(),
        "integerValue" => {
            let parsed = match inner {
                Value::String(s) => s.parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            };
            parsed.map(Value::from).ok_or_else(|| {
                DocumentClientError::invalid_response(format!("bad integerValue {}", inner))
            })?
        }
        // Timestamps and references are surfaced as their string form.
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner.clone(),
        "geoPointValue" => inner.clone(),
        "arrayValue" => {
            let items = match inner.get("values") {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(decode_value)
                    .collect::<Result<Vec<_>>>()?,
                _ => Vec::new(),
            };
            Value::Array(items)
        }
        "mapValue" => {
            let fields = match inner.get("fields") {
                Some(Value::Object(fields)) => decode_fields(fields)?,
                _ => Map::new(),
            };
            Value::Object(fields)
        }
        other => {
            return Err(DocumentClientError::invalid_response(format!(
                "unsupported value type '{}'",
                other
            )))
        }
    };
    Ok(decoded)
}

pub fn decode_fields(fields: &Fields) -> Result<Fields> {
    fields
        .iter()
        .map(|(key, value)| Ok((key.clone(), decode_value(value)?)))
        .collect()
}

/// Field path as accepted by update masks; names that are not simple
/// identifiers are backtick-quoted.
pub fn quote_field_path(field: &str) -> String {
    let simple = field
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        field.to_string()
    } else {
        format!("`{}`", field.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_values_are_wrapped_by_type() {
        let encoded = encode_value(&json!({
            "name": "Lisbon",
            "days": 4,
            "budget": 1250.5,
            "collaborators": ["ana@example.com"],
            "archived": false
        }));
        let fields = &encoded["mapValue"]["fields"];
        assert_eq!(fields["name"], json!({"stringValue": "Lisbon"}));
        assert_eq!(fields["days"], json!({"integerValue": "4"}));
        assert_eq!(fields["budget"], json!({"doubleValue": 1250.5}));
        assert_eq!(
            fields["collaborators"],
            json!({"arrayValue": {"values": [{"stringValue": "ana@example.com"}]}})
        );
        assert_eq!(fields["archived"], json!({"booleanValue": false}));
    }

    #[test]
    fn server_values_decode_to_plain_json() {
        let fields = json!({
            "ownerId": {"stringValue": "u1"},
            "count": {"integerValue": "12"},
            "editors": {"arrayValue": {}},
            "location": {"mapValue": {"fields": {"lat": {"doubleValue": 38.7}}}},
            "createdAt": {"timestampValue": "2024-05-01T10:00:00Z"}
        });
        let decoded = decode_fields(fields.as_object().expect("object")).expect("decode");
        assert_eq!(
            Value::Object(decoded),
            json!({
                "ownerId": "u1",
                "count": 12,
                "editors": [],
                "location": {"lat": 38.7},
                "createdAt": "2024-05-01T10:00:00Z"
            })
        );
    }

    #[test]
    fn untyped_values_are_rejected() {
        assert!(decode_value(&json!("bare")).is_err());
        assert!(decode_value(&json!({"integerValue": "twelve"})).is_err());
    }

    #[test]
    fn unusual_field_names_are_quoted() {
        assert_eq!(quote_field_path("tripId"), "tripId");
        assert_eq!(quote_field_path("split-between"), "`split-between`");
        assert_eq!(quote_field_path("2fa"), "`2fa`");
    }

    #[test]
    fn filters_serialize_in_structured_query_form() {
        let query = RunQueryRequest {
            structured_query: StructuredQuery {
                from: vec![CollectionSelector {
                    collection_id: "trips".to_string(),
                }],
                filter: Some(QueryFilter::FieldFilter(FieldFilter {
                    field: FieldReference {
                        field_path: "ownerId".to_string(),
                    },
                    op: "EQUAL",
                    value: encode_value(&json!("u1")),
                })),
            },
        };
        assert_eq!(
            serde_json::to_value(&query).expect("json"),
            json!({
                "structuredQuery": {
                    "from": [{"collectionId": "trips"}],
                    "where": {"fieldFilter": {
                        "field": {"fieldPath": "ownerId"},
                        "op": "EQUAL",
                        "value": {"stringValue": "u1"}
                    }}
                }
            })
        );
    }
}
