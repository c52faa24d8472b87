//! Document field transformation applied between staging and the index
//!
//! A handful of staging columns hold JSON text (category lists, post meta);
//! those are decoded into structured values. Inside the decoded meta list,
//! PHP-serialized entries are unserialized and promoted to top-level fields
//! under their index names.

mod php;

pub use php::{unserialize, UnserializeError};

use serde_json::{Map, Value};
use tracing::warn;

/// Columns carrying a JSON-encoded list
pub const JSON_FIELDS: [&str; 2] = ["categories", "metaArrayJson"];

/// Meta list column whose entries may hold serialized values
pub const META_FIELD: &str = "metaArrayJson";

/// Serialized meta keys and the document field each one is promoted to
pub const SERIALIZED_META_KEYS: [(&str, &str); 2] = [
    ("_wp_attachment_metadata", "wp_attachment_meta_data"),
    ("_product_attributes", "product_attributes"),
];

pub type Document = Map<String, Value>;

/// Index field name for a serialized meta key
pub fn meta_field_name(key: &str) -> &str {
    SERIALIZED_META_KEYS
        .iter()
        .find(|(from, _)| *from == key)
        .map(|(_, to)| *to)
        .unwrap_or(key)
}

/// Apply every field rule to one document in place
pub fn transform_document(doc: &mut Document) {
    decode_json_fields(doc, &JSON_FIELDS);
    promote_serialized_meta(doc);
}

/// Decode JSON list columns. Empty or non-text values become null; text
/// that is not a JSON list is logged and left as is.
pub fn decode_json_fields(doc: &mut Document, fields: &[&str]) {
    for field in fields {
        let decoded = match doc.get(*field) {
            Some(Value::String(raw)) if !raw.is_empty() => {
                match serde_json::from_str::<Vec<Value>>(raw) {
                    Ok(list) => Value::Array(list),
                    Err(e) => {
                        warn!("json decode field: {}, error: {}", field, e);
                        continue;
                    }
                }
            }
            _ => Value::Null,
        };
        doc.insert(field.to_string(), decoded);
    }
}

/// Unserialize known meta entries into top-level fields and drop them from
/// the meta list. A failed decode stores null for that field.
pub fn promote_serialized_meta(doc: &mut Document) {
    let Some(Value::Array(meta)) = doc.get_mut(META_FIELD) else {
        return;
    };

    let mut promoted = Vec::new();
    meta.retain(|entry| {
        let Some(entry) = entry.as_object() else {
            return true;
        };
        let mut consumed = false;
        for (key, _) in SERIALIZED_META_KEYS {
            let Some(raw) = entry.get(key) else {
                continue;
            };
            consumed = true;
            if let Value::String(raw) = raw {
                let value = match unserialize(raw) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!("php unserialize {} failed: {}", key, e);
                        Value::Null
                    }
                };
                promoted.push((meta_field_name(key).to_string(), value));
            }
        }
        !consumed
    });

    for (field, value) in promoted {
        doc.insert(field, value);
    }
}
