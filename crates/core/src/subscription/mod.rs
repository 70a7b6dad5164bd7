//! Inbound path: live listeners that keep in-memory state current for
//! trips the user owns or has been invited to.
//!
//! Nothing applied here marks the dirty queue. Collaborative writes go
//! straight to the trip tree.

mod manager;
mod tree;

pub use manager::*;
pub use tree::*;

use log::warn;

use crate::models::Entity;
use crate::remote::QuerySnapshot;

/// Decodes every document of a snapshot as `T`, injecting the document id
/// and the parent ids implied by its path. Malformed documents are skipped.
pub(crate) fn decode_documents<T: Entity>(
    snapshot: &QuerySnapshot,
    parents: &[(&str, &str)],
) -> Vec<(T, bool)> {
    snapshot
        .documents
        .iter()
        .filter_map(|doc| {
            let mut fields = doc.fields.clone();
            fields.insert("id".to_string(), doc.id().into());
            for (field, value) in parents {
                fields.insert(field.to_string(), (*value).into());
            }
            match serde_json::from_value::<T>(serde_json::Value::Object(fields)) {
                Ok(entity) => Some((entity, doc.has_pending_writes)),
                Err(err) => {
                    warn!(
                        "[Subscriptions] Skipping malformed {} document {}: {}",
                        T::KIND,
                        doc.path,
                        err
                    );
                    None
                }
            }
        })
        .collect()
}
