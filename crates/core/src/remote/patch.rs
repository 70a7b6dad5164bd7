use std::collections::BTreeMap;

use serde::Serialize;

use crate::errors::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum FieldPatch {
    Set(serde_json::Value),
    /// Explicit remote-side removal of a field the user cleared.
    Delete,
}

/// Top-level field changes for a merge write.
///
/// A merge write only touches the fields it names, so a cleared field has to
/// be named with [`FieldPatch::Delete`]; leaving it out would keep the stale
/// remote value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentPatch {
    fields: BTreeMap<String, FieldPatch>,
}

impl DocumentPatch {
    /// Serializes an entity into a patch. Top-level nulls become delete
    /// markers; nulls nested inside objects are stripped since nested values
    /// are replaced wholesale.
    pub fn from_entity<T: Serialize>(entity: &T) -> Result<Self> {
        Self::from_value(serde_json::to_value(entity)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(object) = value else {
            return Err(Error::invalid_input(
                "Only JSON objects can be written as documents",
            ));
        };
        let fields = object
            .into_iter()
            .map(|(key, value)| {
                let patch = if value.is_null() {
                    FieldPatch::Delete
                } else {
                    FieldPatch::Set(strip_nulls(value))
                };
                (key, patch)
            })
            .collect();
        Ok(Self { fields })
    }

    pub fn set(mut self, field: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields
            .insert(field.to_string(), FieldPatch::Set(value.into()));
        self
    }

    pub fn delete(mut self, field: &str) -> Self {
        self.fields.insert(field.to_string(), FieldPatch::Delete);
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldPatch)> {
        self.fields.iter()
    }

    /// Every field the write touches, including deletions.
    pub fn field_paths(&self) -> Vec<&str> {
        self.fields.keys().map(String::as_str).collect()
    }

    /// Only the fields that receive a value.
    pub fn set_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        self.fields
            .iter()
            .filter_map(|(key, patch)| match patch {
                FieldPatch::Set(value) => Some((key.clone(), value.clone())),
                FieldPatch::Delete => None,
            })
            .collect()
    }

    pub fn apply_to(&self, target: &mut serde_json::Map<String, serde_json::Value>) {
        for (key, patch) in &self.fields {
            match patch {
                FieldPatch::Set(value) => {
                    target.insert(key.clone(), value.clone());
                }
                FieldPatch::Delete => {
                    target.remove(key);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn strip_nulls(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(object) => serde_json::Value::Object(
            object
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(strip_nulls).collect())
        }
        other => other,
    }
}
