//! Manifest media types

use http::header::ACCEPT;
use http::{HeaderMap, HeaderValue};

use crate::digest::Digest;

/// Docker schema 1 manifest.
pub const DOCKER_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
/// Signed Docker schema 1 manifest.
pub const DOCKER_V1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
/// Docker schema 2 manifest.
pub const DOCKER_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker schema 2 manifest list.
pub const DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image manifest.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Content type of blobs served to clients.
pub const BLOB: &str = "application/octet-stream";

/// Manifest types requested from upstreams for clients which do not name any.
pub const LEGACY: &[&str] = &[DOCKER_V1_SIGNED, DOCKER_V1];

/// The manifest media types a client takes, forwarded to the upstream.
///
/// Entries are trimmed and lowercased; wildcards carry no preference and are
/// dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Accept(String);

impl Accept {
    /// Build from a list of media types.
    pub fn new<I, S>(media_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries: Vec<String> = media_types
            .into_iter()
            .map(|entry| entry.as_ref().trim().to_ascii_lowercase())
            .filter(|entry| {
                let media_type = entry.split(';').next().unwrap_or_default().trim();
                !media_type.is_empty() && media_type != "*/*"
            })
            .collect();
        Accept(entries.join(", "))
    }

    /// The client's `Accept` headers, or `fallback` when they name nothing.
    pub fn from_headers(headers: &HeaderMap, fallback: &Accept) -> Self {
        let accept = Self::new(
            headers
                .get_all(ACCEPT)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .flat_map(|value| value.split(',')),
        );
        if accept.is_empty() {
            fallback.clone()
        } else {
            accept
        }
    }

    /// True when no media type is named.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The `Accept` header to send, if any.
    pub fn header_value(&self) -> Option<HeaderValue> {
        if self.is_empty() {
            return None;
        }
        HeaderValue::from_str(&self.0).ok()
    }

    /// A short stable name for this list, usable in storage paths.
    pub fn fingerprint(&self) -> String {
        if self.is_empty() {
            return "any".into();
        }
        Digest::sha256_of(self.0.as_bytes()).hex()[..16].to_owned()
    }
}

/// Pick the content type for a manifest.
///
/// A usable `Content-Type` from the upstream wins; otherwise the type is
/// detected from the document.
pub fn content_type(declared: Option<&str>, data: &[u8]) -> String {
    let declared = declared
        .map(|value| value.split(';').next().unwrap_or_default().trim())
        .filter(|value| !value.is_empty() && *value != "application/json" && *value != "text/plain");

    match declared {
        Some(value) => value.to_string(),
        None => detect_manifest_type(data),
    }
}

/// Detect manifest type from content
pub fn detect_manifest_type(data: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(data) {
        if let Some(media_type) = json.get("mediaType").and_then(|v| v.as_str()) {
            return media_type.to_string();
        }

        if let Some(schema_version) = json.get("schemaVersion").and_then(|v| v.as_u64()) {
            return match schema_version {
                1 if json.get("signatures").is_some() => DOCKER_V1_SIGNED.to_string(),
                1 => DOCKER_V1.to_string(),
                2 if json.get("manifests").is_some() => OCI_INDEX.to_string(),
                _ => OCI_MANIFEST.to_string(),
            };
        }
    }

    OCI_MANIFEST.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_lists_are_normalized() {
        let fallback = Accept::new(LEGACY);
        assert_eq!(
            fallback.header_value().unwrap(),
            "application/vnd.docker.distribution.manifest.v1+prettyjws, application/vnd.docker.distribution.manifest.v1+json"
        );

        let mut headers = HeaderMap::new();
        assert_eq!(Accept::from_headers(&headers, &fallback), fallback);

        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        assert_eq!(Accept::from_headers(&headers, &fallback), fallback);

        headers.insert(ACCEPT, HeaderValue::from_static(" Application/VND.OCI.image.index.v1+json ,*/*"));
        headers.append(ACCEPT, HeaderValue::from_static(DOCKER_V2));
        let accept = Accept::from_headers(&headers, &fallback);
        assert_eq!(accept, Accept::new([OCI_INDEX, DOCKER_V2]));
        assert_ne!(accept.fingerprint(), fallback.fingerprint());
        assert_eq!(accept.fingerprint().len(), 16);

        assert!(Accept::default().header_value().is_none());
        assert_eq!(Accept::default().fingerprint(), "any");
    }

    #[test]
    fn detects_legacy_schema() {
        let data = br#"{"schemaVersion": 1, "name": "library/busybox", "tag": "latest"}"#;
        assert_eq!(detect_manifest_type(data), DOCKER_V1);

        let signed = br#"{"schemaVersion": 1, "signatures": []}"#;
        assert_eq!(detect_manifest_type(signed), DOCKER_V1_SIGNED);
    }

    #[test]
    fn media_type_field_wins() {
        let data = br#"{"schemaVersion": 2, "mediaType": "application/vnd.docker.distribution.manifest.v2+json"}"#;
        assert_eq!(detect_manifest_type(data), DOCKER_V2);
    }

    #[test]
    fn declared_content_type_is_preferred() {
        let data = br#"{"schemaVersion": 2}"#;
        assert_eq!(
            content_type(Some("application/vnd.oci.image.index.v1+json; charset=utf-8"), data),
            OCI_INDEX
        );
        assert_eq!(content_type(Some("application/json"), data), OCI_MANIFEST);
        assert_eq!(content_type(None, b"not json"), OCI_MANIFEST);
    }
}
