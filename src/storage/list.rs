//! Listing pipeline shared by all storage backends.
//!
//! Filtering, ordering, cursor pagination, and delimiter grouping proceed
//! in a fixed order so every backend produces identical listings: filter by
//! prefix/start/end, sort lexicographically (reversed on request), skip past
//! the cursor, then walk the remainder emitting keys or grouped delimited
//! prefixes until the limit is reached. The returned cursor is the base64 of
//! the last consumed key, or empty when the listing is exhausted.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

/// Options controlling a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Only keys starting with this prefix are listed.
    pub prefix: Option<String>,
    /// Inclusive lower bound on key names.
    pub start: Option<String>,
    /// Exclusive upper bound on key names.
    pub end: Option<String>,
    /// Reverses the lexicographic order.
    pub reverse: bool,
    /// Maximum number of keys plus delimited prefixes to emit.
    pub limit: Option<usize>,
    /// Opaque cursor from a previous listing page.
    pub cursor: Option<String>,
    /// Groups keys sharing a prefix up to the next occurrence of this
    /// delimiter into a single delimited-prefix result.
    pub delimiter: Option<String>,
}

/// A listed key with its expiration and metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListedKey {
    /// The key name.
    pub name: String,
    /// Absolute expiration in unix seconds, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<u64>,
    /// Metadata, if any and not skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Result of one listing page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Listing {
    /// Keys on this page, in listing order.
    pub keys: Vec<ListedKey>,
    /// Cursor for the next page; empty when exhausted.
    pub cursor: String,
    /// Grouped delimited prefixes, present iff a delimiter was set.
    pub delimited_prefixes: Option<Vec<String>>,
}

/// Encodes a key name into an opaque listing cursor.
pub(crate) fn encode_cursor(name: &str) -> String {
    STANDARD.encode(name.as_bytes())
}

/// Decodes an opaque listing cursor back into a key name. Invalid cursors
/// decode to `None` and behave as if no cursor was supplied.
pub(crate) fn decode_cursor(cursor: &str) -> Option<String> {
    let bytes = STANDARD.decode(cursor).ok()?;
    String::from_utf8(bytes).ok()
}

/// Runs the filter/sort/paginate/delimit pipeline over the full set of live
/// keys. `keys` need not be sorted; expired entries must already have been
/// dropped by the backend.
pub(crate) fn paginate(mut keys: Vec<ListedKey>, options: &ListOptions) -> Listing {
    let prefix = options.prefix.as_deref().unwrap_or("");

    keys.retain(|k| {
        if !k.name.starts_with(prefix) {
            return false;
        }
        if let Some(start) = &options.start {
            if k.name.as_str() < start.as_str() {
                return false;
            }
        }
        if let Some(end) = &options.end {
            if k.name.as_str() >= end.as_str() {
                return false;
            }
        }
        true
    });

    keys.sort_by(|a, b| a.name.cmp(&b.name));
    if options.reverse {
        keys.reverse();
    }

    // Skip keys up to and including the decoded cursor, in listing order.
    if let Some(cursor_name) = options.cursor.as_deref().and_then(decode_cursor) {
        if let Some(idx) = keys.iter().position(|k| k.name == cursor_name) {
            keys.drain(..=idx);
        } else {
            // The cursor key may have expired since the previous page; skip
            // everything that sorts at or before it.
            keys.retain(|k| {
                if options.reverse {
                    k.name < cursor_name
                } else {
                    k.name > cursor_name
                }
            });
        }
    }

    let limit = options.limit.unwrap_or(usize::MAX);
    let mut out_keys = Vec::new();
    let mut delimited: Vec<String> = Vec::new();
    let mut emitted = 0usize;
    let mut last_consumed: Option<String> = None;
    let mut exhausted = true;

    let mut iter = keys.into_iter().peekable();
    while let Some(key) = iter.next() {
        if emitted >= limit {
            exhausted = false;
            break;
        }

        if let Some(delimiter) = &options.delimiter {
            let suffix = &key.name[prefix.len()..];
            if let Some(pos) = suffix.find(delimiter.as_str()) {
                let group = key.name[..prefix.len() + pos + delimiter.len()].to_string();
                last_consumed = Some(key.name.clone());
                // Swallow every subsequent key sharing the delimited prefix.
                while let Some(next) = iter.peek() {
                    if next.name.starts_with(&group) {
                        last_consumed = Some(next.name.clone());
                        iter.next();
                    } else {
                        break;
                    }
                }
                delimited.push(group);
                emitted += 1;
                continue;
            }
        }

        last_consumed = Some(key.name.clone());
        out_keys.push(key);
        emitted += 1;
    }

    if iter.peek().is_some() {
        exhausted = false;
    }

    let cursor = if exhausted {
        String::new()
    } else {
        last_consumed.as_deref().map(encode_cursor).unwrap_or_default()
    };

    Listing {
        keys: out_keys,
        cursor,
        delimited_prefixes: options.delimiter.as_ref().map(|_| delimited),
    }
}
