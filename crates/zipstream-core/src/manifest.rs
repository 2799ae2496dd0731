//! The download manifest model.
//!
//! A manifest is the stored record describing one download: its storage
//! bucket, the ordered object list, and optional attributes. Manifests are
//! immutable snapshots fully owned by the request that fetched them.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result};

/// One download record, loaded from a manifest store.
///
/// Optional fields may be absent depending on what the backing schema
/// carries; absence is never an error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadManifest {
    /// Opaque identifier, as passed in the URL path.
    #[serde(default)]
    pub id: String,

    /// Storage namespace or path prefix. May be empty for the local-path
    /// backend.
    #[serde(default)]
    pub bucket: String,

    /// Ordered object keys. Duplicates are allowed and preserved.
    ///
    /// A JSON `null` decodes to an empty list; empty lists are rejected by
    /// the coordinator before any work starts.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub objects: Vec<String>,

    /// Suggested archive basename, without extension.
    #[serde(default)]
    pub name: Option<String>,

    /// Absolute http(s) URL notified with the attempt outcome.
    #[serde(default)]
    pub callback: Option<String>,

    /// Passphrase for per-entry encryption, when enabled globally.
    #[serde(default)]
    pub password: Option<String>,

    /// Extra response headers applied before the standard ones.
    #[serde(default)]
    pub custom_headers: Option<HashMap<String, String>>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Vec<String>>::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}

impl DownloadManifest {
    /// Decodes the JSON document stored by the key-value backend.
    ///
    /// The document uses the same field names as the tabular columns. The
    /// record id is taken from the lookup key, not the document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] when the document is not valid JSON for
    /// this shape — a malformed record is a store fault, not a missing one.
    pub fn from_json_document(id: &str, document: &str) -> Result<Self> {
        let mut manifest: Self = serde_json::from_str(document).map_err(|e| {
            Error::backend_with_source(format!("malformed manifest document for {id}"), e)
        })?;
        manifest.id = id.to_string();
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_full_document() {
        let doc = r#"{
            "bucket": "exports",
            "objects": ["a.txt", "b/c.json"],
            "name": "report",
            "callback": "https://example.com/hook",
            "password": "s3cret",
            "custom_headers": {"X-Origin": "zipstream"}
        }"#;

        let manifest = DownloadManifest::from_json_document("dl-1", doc).unwrap();
        assert_eq!(manifest.id, "dl-1");
        assert_eq!(manifest.bucket, "exports");
        assert_eq!(manifest.objects, vec!["a.txt", "b/c.json"]);
        assert_eq!(manifest.name.as_deref(), Some("report"));
        assert_eq!(manifest.callback.as_deref(), Some("https://example.com/hook"));
        assert_eq!(
            manifest
                .custom_headers
                .as_ref()
                .and_then(|h| h.get("X-Origin"))
                .map(String::as_str),
            Some("zipstream")
        );
    }

    #[test]
    fn test_absent_optionals_decode_to_none() {
        let doc = r#"{"bucket": "b", "objects": ["x"]}"#;
        let manifest = DownloadManifest::from_json_document("dl-2", doc).unwrap();
        assert!(manifest.name.is_none());
        assert!(manifest.callback.is_none());
        assert!(manifest.password.is_none());
        assert!(manifest.custom_headers.is_none());
    }

    #[test]
    fn test_null_objects_decode_to_empty() {
        let doc = r#"{"bucket": "b", "objects": null}"#;
        let manifest = DownloadManifest::from_json_document("dl-3", doc).unwrap();
        assert!(manifest.objects.is_empty());
    }

    #[test]
    fn test_duplicate_keys_preserved_in_order() {
        let doc = r#"{"bucket": "b", "objects": ["a", "b", "a"]}"#;
        let manifest = DownloadManifest::from_json_document("dl-4", doc).unwrap();
        assert_eq!(manifest.objects, vec!["a", "b", "a"]);
    }

    #[test]
    fn test_malformed_document_is_backend_error() {
        let err = DownloadManifest::from_json_document("dl-5", "{not json").unwrap_err();
        assert!(matches!(err, Error::Backend { .. }));
    }
}
