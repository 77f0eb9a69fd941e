//! Object-store record types: entry metadata, checksums, and conditional
//! evaluation.

use serde::{Deserialize, Serialize};

/// HTTP metadata carried by an object, mirrored into response headers on
/// serve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    /// Absolute expiry in unix milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_expiry: Option<u64>,
}

/// Digests recorded at put time, hex-encoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checksums {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha384: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha512: Option<String>,
}

/// Custom user metadata: a flat string map.
pub type CustomMetadata = std::collections::BTreeMap<String, String>;

/// A stored object's metadata row.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectEntry {
    /// Object key.
    pub key: String,
    /// Version uuid; immutable once written.
    pub version: String,
    /// Total body size in bytes.
    pub size: u64,
    /// Entity tag: hex MD5 for simple puts, composite for multipart.
    pub etag: String,
    /// Upload time in unix milliseconds.
    pub uploaded: u64,
    /// HTTP metadata provided at put time.
    pub http_metadata: HttpMetadata,
    /// Custom user metadata provided at put time.
    pub custom_metadata: CustomMetadata,
    /// Digests recorded at put time.
    pub checksums: Checksums,
    /// Storage class label; informational in the simulator.
    pub storage_class: String,
}

/// Conditional operation preconditions, RFC 7232-like, evaluated against
/// the current stored metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct R2Conditional {
    /// Passes when unset or equal to the stored etag.
    pub etag_matches: Option<String>,
    /// Passes when unset or different from the stored etag.
    pub etag_does_not_match: Option<String>,
    /// Passes when unset or the stored upload time is at or before this
    /// bound (unix milliseconds), or when `etag_matches` passed explicitly.
    pub if_unmodified_since: Option<u64>,
    /// Passes when unset or the stored upload time is after this bound
    /// (unix milliseconds), or when `etag_does_not_match` passed
    /// explicitly.
    pub if_modified_since: Option<u64>,
    /// Truncates upload times and bounds to whole seconds before
    /// comparing.
    pub seconds_granularity: bool,
}

impl R2Conditional {
    /// Returns whether all four preconditions pass against the current
    /// stored metadata, if any. For an absent object, `etag_matches` and
    /// `if_modified_since` pass only when unset.
    pub fn check(&self, entry: Option<&ObjectEntry>) -> bool {
        let Some(entry) = entry else {
            return self.etag_matches.is_none() && self.if_modified_since.is_none();
        };

        let truncate = |t: u64| {
            if self.seconds_granularity {
                t / 1000 * 1000
            } else {
                t
            }
        };
        let uploaded = truncate(entry.uploaded);

        let if_match = match &self.etag_matches {
            None => true,
            Some(etag) => strip_etag_quotes(etag) == entry.etag,
        };
        let if_none_match = match &self.etag_does_not_match {
            None => true,
            Some(etag) => strip_etag_quotes(etag) != entry.etag,
        };
        let if_unmodified = match self.if_unmodified_since {
            None => true,
            Some(bound) => {
                uploaded <= truncate(bound) || (self.etag_matches.is_some() && if_match)
            }
        };
        let if_modified = match self.if_modified_since {
            None => true,
            Some(bound) => {
                uploaded > truncate(bound) || (self.etag_does_not_match.is_some() && if_none_match)
            }
        };

        if_match && if_none_match && if_unmodified && if_modified
    }
}

pub(crate) fn strip_etag_quotes(raw: &str) -> &str {
    raw.trim().trim_matches('"')
}

/// Serialized byte length of the custom metadata, counting each string as
/// 2 bytes per UTF-16 code unit when any code unit is 256 or above, and 1
/// byte per code unit otherwise.
pub fn custom_metadata_size(metadata: &CustomMetadata) -> usize {
    fn weighted_len(s: &str) -> usize {
        let units: Vec<u16> = s.encode_utf16().collect();
        let wide = units.iter().any(|&u| u >= 256);
        units.len() * if wide { 2 } else { 1 }
    }
    metadata
        .iter()
        .map(|(k, v)| weighted_len(k) + weighted_len(v))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(etag: &str, uploaded: u64) -> ObjectEntry {
        ObjectEntry {
            key: "k".into(),
            version: "v".into(),
            size: 0,
            etag: etag.into(),
            uploaded,
            http_metadata: HttpMetadata::default(),
            custom_metadata: CustomMetadata::new(),
            checksums: Checksums::default(),
            storage_class: "Standard".into(),
        }
    }

    #[test]
    fn etag_conditions() {
        let e = entry("abc", 1000);
        let pass = R2Conditional {
            etag_matches: Some("\"abc\"".into()),
            ..Default::default()
        };
        assert!(pass.check(Some(&e)));

        let fail = R2Conditional {
            etag_matches: Some("other".into()),
            ..Default::default()
        };
        assert!(!fail.check(Some(&e)));

        let none_match = R2Conditional {
            etag_does_not_match: Some("abc".into()),
            ..Default::default()
        };
        assert!(!none_match.check(Some(&e)));
    }

    #[test]
    fn time_conditions() {
        let e = entry("abc", 5_000);
        let unmodified = R2Conditional {
            if_unmodified_since: Some(5_000),
            ..Default::default()
        };
        assert!(unmodified.check(Some(&e)));

        let too_old = R2Conditional {
            if_unmodified_since: Some(4_999),
            ..Default::default()
        };
        assert!(!too_old.check(Some(&e)));

        let modified = R2Conditional {
            if_modified_since: Some(4_999),
            ..Default::default()
        };
        assert!(modified.check(Some(&e)));

        let not_modified = R2Conditional {
            if_modified_since: Some(5_000),
            ..Default::default()
        };
        assert!(!not_modified.check(Some(&e)));
    }

    #[test]
    fn explicit_etag_pass_overrides_time_failure() {
        let e = entry("abc", 5_000);
        let cond = R2Conditional {
            etag_matches: Some("abc".into()),
            if_unmodified_since: Some(1_000),
            ..Default::default()
        };
        assert!(cond.check(Some(&e)));

        let cond = R2Conditional {
            etag_does_not_match: Some("other".into()),
            if_modified_since: Some(9_000),
            ..Default::default()
        };
        assert!(cond.check(Some(&e)));
    }

    #[test]
    fn seconds_granularity_truncates() {
        let e = entry("abc", 5_400);
        let cond = R2Conditional {
            if_unmodified_since: Some(5_000),
            seconds_granularity: true,
            ..Default::default()
        };
        assert!(cond.check(Some(&e)));
        let strict = R2Conditional {
            if_unmodified_since: Some(5_000),
            ..Default::default()
        };
        assert!(!strict.check(Some(&e)));
    }

    #[test]
    fn absent_object_rules() {
        let unset = R2Conditional::default();
        assert!(unset.check(None));

        let if_match = R2Conditional {
            etag_matches: Some("abc".into()),
            ..Default::default()
        };
        assert!(!if_match.check(None));

        let if_modified = R2Conditional {
            if_modified_since: Some(1),
            ..Default::default()
        };
        assert!(!if_modified.check(None));

        let vacuous = R2Conditional {
            etag_does_not_match: Some("abc".into()),
            if_unmodified_since: Some(1),
            ..Default::default()
        };
        assert!(vacuous.check(None));
    }

    #[test]
    fn metadata_size_accounting() {
        let mut metadata = CustomMetadata::new();
        metadata.insert("key".into(), "value".into());
        // All code units below 256: one byte each.
        assert_eq!(custom_metadata_size(&metadata), 8);

        let mut wide = CustomMetadata::new();
        // U+00FF stays narrow; U+0100 forces the 2-byte rate for the
        // whole string.
        wide.insert("k".into(), "\u{00FF}\u{0100}".into());
        assert_eq!(custom_metadata_size(&wide), 1 + 4);
    }
}
