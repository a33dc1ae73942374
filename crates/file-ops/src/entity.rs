//! Book record access.

use std::future::Future;
use std::pin::Pin;

use galley_protocol::Purpose;
use galley_protocol::messages::UploadedFile;
use serde_json::Value;

/// A book record as a JSON object.
pub type Record = serde_json::Map<String, Value>;

/// A boxed future returned by [`EntityStore`] methods.
pub type StoreFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, EntityStoreError>> + Send + 'a>>;

/// Errors reported by the record store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntityStoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// Get/patch access to book records by id.
pub trait EntityStore: Send + Sync {
    /// Fetches a record. `None` if no book has this id.
    fn get_record<'a>(&'a self, entity_id: &'a str) -> StoreFuture<'a, Option<Record>>;

    /// Merges `patch` into the record; keys not in `patch` are untouched.
    fn patch_record<'a>(&'a self, entity_id: &'a str, patch: Record) -> StoreFuture<'a, ()>;
}

/// Patch attaching `file` to the record fields of `purpose`.
pub(crate) fn purpose_patch(purpose: Purpose, file: &UploadedFile) -> Record {
    let fields = purpose.fields();
    let mut patch = Record::new();
    patch.insert(fields.file_id.into(), Value::from(file.object_id.as_str()));
    patch.insert(fields.file_name.into(), Value::from(file.object_name.as_str()));
    patch.insert(fields.file_link.into(), Value::from(file.view_link.as_str()));
    patch
}

/// Non-empty string stored under `field`, if any.
pub(crate) fn string_field<'r>(record: &'r Record, field: &str) -> Option<&'r str> {
    record
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_uses_purpose_fields() {
        let file = UploadedFile {
            object_id: "obj-1".into(),
            object_name: "cover.jpg".into(),
            view_link: "https://files/view/obj-1".into(),
            download_link: "https://files/download/obj-1".into(),
        };
        let patch = purpose_patch(Purpose::Cover, &file);
        assert_eq!(patch["coverFileId"], "obj-1");
        assert_eq!(patch["coverFileName"], "cover.jpg");
        assert_eq!(patch["coverFileLink"], "https://files/view/obj-1");
        assert_eq!(patch.len(), 3);
    }

    #[test]
    fn string_field_skips_empty_and_non_strings() {
        let mut record = Record::new();
        record.insert("a".into(), Value::from("x"));
        record.insert("b".into(), Value::from(""));
        record.insert("c".into(), Value::from(3));
        assert_eq!(string_field(&record, "a"), Some("x"));
        assert_eq!(string_field(&record, "b"), None);
        assert_eq!(string_field(&record, "c"), None);
        assert_eq!(string_field(&record, "d"), None);
    }
}
