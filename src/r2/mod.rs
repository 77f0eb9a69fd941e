//! R2-style object store gateway.
//!
//! Blob bodies live in the storage substrate keyed by random uuids;
//! object metadata lives as rows in an embedded SQL database. Puts are
//! atomic: the blob is written first, then the metadata row is upserted,
//! and on failure the orphan blob is swept. Conditional operations follow
//! RFC 7232-like evaluation against the current stored metadata, listings
//! are key-ordered scans with delimiter handling applied after the fetch,
//! and multipart uploads assemble objects from independently uploaded
//! parts.
//!
//! # Examples
//!
//! ```rust
//! use kumo::r2::{R2Gateway, R2PutOptions};
//! use kumo::storage::{MemoryStorage, Storage};
//! use kumo::clock::system_clock;
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! # async fn example() -> kumo::error::Result<()> {
//! let clock = system_clock();
//! let blobs = Arc::new(MemoryStorage::new(clock.clone()));
//! let db = blobs.sql_database()?;
//! let bucket = R2Gateway::new("bucket", blobs, db, clock)?;
//! bucket.put("key", Bytes::from("body"), R2PutOptions::default()).await?;
//! assert!(bucket.head("key").await?.is_some());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use md5::Md5;
use rusqlite::OptionalExtension;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use uuid::Uuid;

use crate::{
    clock::SharedClock,
    error::{ErrorKind, KumoError, Result},
    storage::{
        ListOptions, ListedKey, MAX_KEY_SIZE, RangeOptions, ResolvedRange, SqliteHandle, Storage,
        StoredEntry,
    },
};

mod multipart;
mod record;

pub use multipart::{MultipartUpload, UploadedPart};
pub use record::{
    Checksums, CustomMetadata, HttpMetadata, ObjectEntry, R2Conditional, custom_metadata_size,
};

/// Maximum object body size accepted by a single put.
pub const MAX_VALUE_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Maximum serialized custom-metadata size in bytes.
pub const MAX_METADATA_SIZE: usize = 2048;

/// Default storage class label.
const DEFAULT_STORAGE_CLASS: &str = "Standard";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS objects (
    key TEXT PRIMARY KEY,
    version TEXT NOT NULL,
    blob_refs TEXT NOT NULL,
    size INTEGER NOT NULL,
    etag TEXT NOT NULL,
    uploaded INTEGER NOT NULL,
    http_metadata TEXT NOT NULL,
    custom_metadata TEXT NOT NULL,
    checksums TEXT NOT NULL,
    storage_class TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS multipart_uploads (
    upload_id TEXT PRIMARY KEY,
    key TEXT NOT NULL,
    http_metadata TEXT NOT NULL,
    custom_metadata TEXT NOT NULL,
    storage_class TEXT NOT NULL,
    state INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS multipart_parts (
    upload_id TEXT NOT NULL,
    part_number INTEGER NOT NULL,
    blob_id TEXT NOT NULL,
    size INTEGER NOT NULL,
    etag TEXT NOT NULL,
    PRIMARY KEY (upload_id, part_number)
);
";

/// Digests the caller claims for a put body, hex-encoded.
#[derive(Debug, Clone, Default)]
pub struct ProvidedHashes {
    pub md5: Option<String>,
    pub sha1: Option<String>,
    pub sha256: Option<String>,
    pub sha384: Option<String>,
    pub sha512: Option<String>,
}

/// Options for [`R2Gateway::put`].
#[derive(Debug, Clone, Default)]
pub struct R2PutOptions {
    pub http_metadata: HttpMetadata,
    pub custom_metadata: CustomMetadata,
    pub only_if: Option<R2Conditional>,
    pub hashes: ProvidedHashes,
    pub storage_class: Option<String>,
}

/// Options for [`R2Gateway::get`].
#[derive(Debug, Clone, Default)]
pub struct R2GetOptions {
    pub only_if: Option<R2Conditional>,
    pub range: Option<RangeOptions>,
}

/// Options for [`R2Gateway::list`].
#[derive(Debug, Clone, Default)]
pub struct R2ListOptions {
    pub prefix: Option<String>,
    pub cursor: Option<String>,
    /// Page size, 1..=1000; anything else is `InvalidMaxKeys`.
    pub limit: Option<usize>,
    pub delimiter: Option<String>,
    /// Exclusive lower bound on keys.
    pub start_after: Option<String>,
    /// Populate `http_metadata` on listed objects.
    pub include_http_metadata: bool,
    /// Populate `custom_metadata` on listed objects.
    pub include_custom_metadata: bool,
}

/// One page of listed objects.
#[derive(Debug, Clone, Default)]
pub struct R2Objects {
    pub objects: Vec<ObjectEntry>,
    /// Cursor for the next page; empty when exhausted.
    pub cursor: String,
    pub delimited_prefixes: Vec<String>,
}

/// Result of a conditional get.
#[derive(Debug)]
pub enum R2GetResult {
    /// The object with its (possibly range-sliced) body.
    Found {
        object: ObjectEntry,
        body: Bytes,
        range: Option<ResolvedRange>,
    },
    /// A precondition failed; the current metadata is attached.
    PreconditionFailed(Box<ObjectEntry>),
    /// No such object.
    Absent,
}

/// Result of a conditional put.
#[derive(Debug)]
pub enum R2PutResult {
    /// The object was written.
    Created(ObjectEntry),
    /// A precondition failed; the prior metadata is attached when the
    /// object existed.
    PreconditionFailed(Option<Box<ObjectEntry>>),
}

struct ObjectRow {
    entry: ObjectEntry,
    blob_refs: Vec<String>,
}

/// Blob + SQL object store for one bucket.
pub struct R2Gateway {
    bucket: String,
    blobs: Arc<dyn Storage>,
    db: SqliteHandle,
    clock: SharedClock,
}

impl R2Gateway {
    /// Creates a gateway for one bucket, initializing the metadata schema.
    pub fn new(
        bucket: impl Into<String>,
        blobs: Arc<dyn Storage>,
        db: SqliteHandle,
        clock: SharedClock,
    ) -> Result<Self> {
        db.execute_batch(SCHEMA)?;
        Ok(Self {
            bucket: bucket.into(),
            blobs,
            db,
            clock,
        })
    }

    /// The bucket name this gateway serves.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Returns the object's metadata, or `None` when absent.
    pub async fn head(&self, key: &str) -> Result<Option<ObjectEntry>> {
        validate_object_key(key)?;
        Ok(self.load_row(key)?.map(|row| row.entry))
    }

    /// Returns the object and its body, honoring conditionals and ranges.
    pub async fn get(&self, key: &str, options: R2GetOptions) -> Result<R2GetResult> {
        validate_object_key(key)?;
        let Some(row) = self.load_row(key)? else {
            return Ok(R2GetResult::Absent);
        };

        if let Some(only_if) = &options.only_if {
            if !only_if.check(Some(&row.entry)) {
                return Ok(R2GetResult::PreconditionFailed(Box::new(row.entry)));
            }
        }

        let body = self.read_blobs(&row.blob_refs).await?;
        let (body, range) = match options.range {
            Some(range_options) if !range_options.is_unbounded() => {
                let resolved = crate::storage::range::resolve(range_options, body.len() as u64)?;
                let start = resolved.offset as usize;
                let end = start + resolved.length as usize;
                (body.slice(start..end), Some(resolved))
            }
            _ => (body, None),
        };

        Ok(R2GetResult::Found {
            object: row.entry,
            body,
            range,
        })
    }

    /// Stores an object. Returns the new entry, or the failed-precondition
    /// outcome with the prior metadata attached.
    pub async fn put(&self, key: &str, value: Bytes, options: R2PutOptions) -> Result<R2PutResult> {
        validate_object_key(key)?;
        if value.len() as u64 > MAX_VALUE_SIZE {
            return Err(entity_too_large(format!(
                "Value length of {} exceeds limit of {MAX_VALUE_SIZE}",
                value.len()
            )));
        }
        let metadata_size = custom_metadata_size(&options.custom_metadata);
        if metadata_size > MAX_METADATA_SIZE {
            return Err(KumoError::new(
                ErrorKind::Capacity,
                "MetadataTooLarge",
                format!(
                    "Custom metadata size of {metadata_size} exceeds limit of {MAX_METADATA_SIZE}"
                ),
            ));
        }

        let checksums = verify_hashes(&value, &options.hashes)?;
        let etag = checksums.md5.clone().unwrap_or_default();

        let prior = self.load_row(key)?;
        if let Some(only_if) = &options.only_if {
            if !only_if.check(prior.as_ref().map(|row| &row.entry)) {
                return Ok(R2PutResult::PreconditionFailed(
                    prior.map(|row| Box::new(row.entry)),
                ));
            }
        }

        let entry = ObjectEntry {
            key: key.to_string(),
            version: Uuid::new_v4().to_string(),
            size: value.len() as u64,
            etag,
            uploaded: self.clock.now_millis(),
            http_metadata: options.http_metadata,
            custom_metadata: options.custom_metadata,
            checksums,
            storage_class: options
                .storage_class
                .unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string()),
        };

        let blob_id = Uuid::new_v4().to_string();
        self.blobs
            .put(&blob_id, StoredEntry::from_value(value))
            .await?;
        if let Err(e) = self.write_row(&entry, std::slice::from_ref(&blob_id)) {
            // Sweep the orphan blob so a failed upsert leaves no garbage.
            let _ = self.blobs.delete(&blob_id).await;
            return Err(e);
        }
        if let Some(prior) = prior {
            self.delete_blobs(&prior.blob_refs).await;
        }
        Ok(R2PutResult::Created(entry))
    }

    /// Deletes one or more objects and their blobs.
    pub async fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            validate_object_key(key)?;
            if let Some(row) = self.load_row(key)? {
                self.db
                    .with(|conn| conn.execute("DELETE FROM objects WHERE key = ?1", [key]))?;
                self.delete_blobs(&row.blob_refs).await;
            }
        }
        Ok(())
    }

    /// Lists objects in key order with delimiter grouping and cursor
    /// pagination.
    pub async fn list(&self, options: R2ListOptions) -> Result<R2Objects> {
        let limit = options.limit.unwrap_or(1000);
        if !(1..=1000).contains(&limit) {
            return Err(KumoError::new(
                ErrorKind::Capacity,
                "InvalidMaxKeys",
                "MaxKeys params must be positive integer <= 1000",
            ));
        }

        let mut rows = self.load_all_rows()?;
        if let Some(start_after) = &options.start_after {
            rows.retain(|row| row.entry.key.as_str() > start_after.as_str());
        }

        let names: Vec<ListedKey> = rows
            .iter()
            .map(|row| ListedKey {
                name: row.entry.key.clone(),
                ..Default::default()
            })
            .collect();
        let listing = crate::storage::list::paginate(
            names,
            &ListOptions {
                prefix: options.prefix.clone(),
                limit: Some(limit),
                cursor: options.cursor.clone(),
                delimiter: options.delimiter.clone(),
                ..Default::default()
            },
        );

        let mut by_key: std::collections::HashMap<String, ObjectEntry> = rows
            .into_iter()
            .map(|row| (row.entry.key.clone(), row.entry))
            .collect();
        let objects = listing
            .keys
            .into_iter()
            .filter_map(|k| by_key.remove(&k.name))
            .map(|mut entry| {
                if !options.include_http_metadata {
                    entry.http_metadata = HttpMetadata::default();
                }
                if !options.include_custom_metadata {
                    entry.custom_metadata = CustomMetadata::new();
                }
                entry
            })
            .collect();

        Ok(R2Objects {
            objects,
            cursor: listing.cursor,
            delimited_prefixes: listing.delimited_prefixes.unwrap_or_default(),
        })
    }

    fn load_row(&self, key: &str) -> Result<Option<ObjectRow>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT key, version, blob_refs, size, etag, uploaded, http_metadata, \
                 custom_metadata, checksums, storage_class FROM objects WHERE key = ?1",
                [key],
                row_to_object,
            )
            .optional()
        })
    }

    fn load_all_rows(&self) -> Result<Vec<ObjectRow>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, version, blob_refs, size, etag, uploaded, http_metadata, \
                 custom_metadata, checksums, storage_class FROM objects ORDER BY key",
            )?;
            let rows = stmt.query_map([], row_to_object)?;
            rows.collect()
        })
    }

    fn write_row(&self, entry: &ObjectEntry, blob_refs: &[String]) -> Result<()> {
        let blob_refs = serde_json::to_string(blob_refs)?;
        let http_metadata = serde_json::to_string(&entry.http_metadata)?;
        let custom_metadata = serde_json::to_string(&entry.custom_metadata)?;
        let checksums = serde_json::to_string(&entry.checksums)?;
        self.db.with(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO objects (key, version, blob_refs, size, etag, uploaded, \
                 http_metadata, custom_metadata, checksums, storage_class) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    entry.key,
                    entry.version,
                    blob_refs,
                    entry.size as i64,
                    entry.etag,
                    entry.uploaded as i64,
                    http_metadata,
                    custom_metadata,
                    checksums,
                    entry.storage_class,
                ],
            )?;
            Ok(())
        })
    }

    async fn read_blobs(&self, blob_refs: &[String]) -> Result<Bytes> {
        if blob_refs.len() == 1 {
            let entry = self.blobs.get(&blob_refs[0], true).await?;
            return Ok(entry.map(|e| e.value).unwrap_or_default());
        }
        let mut out = Vec::new();
        for blob_id in blob_refs {
            if let Some(entry) = self.blobs.get(blob_id, true).await? {
                out.extend_from_slice(&entry.value);
            }
        }
        Ok(Bytes::from(out))
    }

    async fn delete_blobs(&self, blob_refs: &[String]) {
        for blob_id in blob_refs {
            let _ = self.blobs.delete(blob_id).await;
        }
    }
}

fn row_to_object(row: &rusqlite::Row<'_>) -> rusqlite::Result<ObjectRow> {
    let blob_refs: String = row.get(2)?;
    let http_metadata: String = row.get(6)?;
    let custom_metadata: String = row.get(7)?;
    let checksums: String = row.get(8)?;
    Ok(ObjectRow {
        entry: ObjectEntry {
            key: row.get(0)?,
            version: row.get(1)?,
            size: row.get::<_, i64>(3)? as u64,
            etag: row.get(4)?,
            uploaded: row.get::<_, i64>(5)? as u64,
            http_metadata: serde_json::from_str(&http_metadata).unwrap_or_default(),
            custom_metadata: serde_json::from_str(&custom_metadata).unwrap_or_default(),
            checksums: serde_json::from_str(&checksums).unwrap_or_default(),
            storage_class: row.get(9)?,
        },
        blob_refs: serde_json::from_str(&blob_refs).unwrap_or_default(),
    })
}

/// Validates an object key. Keys over 1024 bytes are `InvalidObjectName`;
/// well-formed UTF-8 cannot contain unpaired surrogates, so no further
/// check is needed.
fn validate_object_key(key: &str) -> Result<()> {
    if key.len() > MAX_KEY_SIZE {
        return Err(KumoError::new(
            ErrorKind::Capacity,
            "InvalidObjectName",
            "The specified object name is not valid",
        ));
    }
    Ok(())
}

fn entity_too_large(message: String) -> KumoError {
    KumoError::new(ErrorKind::Capacity, "EntityTooLarge", message)
}

/// Verifies caller-provided digests against the body, recording them plus
/// the always-computed MD5.
fn verify_hashes(value: &Bytes, hashes: &ProvidedHashes) -> Result<Checksums> {
    fn check(algorithm: &str, provided: &Option<String>, actual: String) -> Result<Option<String>> {
        match provided {
            None => Ok(None),
            Some(expected) if expected.eq_ignore_ascii_case(&actual) => Ok(Some(actual)),
            Some(expected) => Err(KumoError::new(
                ErrorKind::Integrity,
                "BadDigest",
                format!(
                    "The {algorithm} checksum you specified did not match what we received. \
                     You provided a {algorithm} checksum with value: {expected}\n\
                     Actual {algorithm} was: {actual}"
                ),
            )),
        }
    }

    let md5 = hex::encode(Md5::digest(value));
    check("MD5", &hashes.md5, md5.clone())?;
    let sha1 = check("SHA-1", &hashes.sha1, hex::encode(Sha1::digest(value)))?;
    let sha256 = check("SHA-256", &hashes.sha256, hex::encode(Sha256::digest(value)))?;
    let sha384 = check("SHA-384", &hashes.sha384, hex::encode(Sha384::digest(value)))?;
    let sha512 = check("SHA-512", &hashes.sha512, hex::encode(Sha512::digest(value)))?;

    Ok(Checksums {
        md5: Some(md5),
        sha1,
        sha256,
        sha384,
        sha512,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::FakeClock, storage::MemoryStorage};

    fn setup() -> (Arc<FakeClock>, R2Gateway) {
        let clock = Arc::new(FakeClock::new(1_700_000_000_000));
        let blobs = Arc::new(MemoryStorage::new(clock.clone()));
        let db = blobs.sql_database().unwrap();
        let gateway = R2Gateway::new("bucket", blobs, db, clock.clone()).unwrap();
        (clock, gateway)
    }

    fn created(result: R2PutResult) -> ObjectEntry {
        match result {
            R2PutResult::Created(entry) => entry,
            other => panic!("expected Created, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn put_then_head_and_get() {
        let (_, r2) = setup();
        let entry = created(
            r2.put("key", Bytes::from("body"), R2PutOptions::default())
                .await
                .unwrap(),
        );
        assert_eq!(entry.size, 4);
        assert_eq!(entry.etag, hex::encode(Md5::digest(b"body")));

        let head = r2.head("key").await.unwrap().unwrap();
        assert_eq!(head.etag, entry.etag);
        assert_eq!(head.version, entry.version);

        match r2.get("key", R2GetOptions::default()).await.unwrap() {
            R2GetResult::Found { object, body, range } => {
                assert_eq!(object.etag, entry.etag);
                assert_eq!(&body[..], b"body");
                assert!(range.is_none());
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_range_slices_the_body() {
        let (_, r2) = setup();
        r2.put("key", Bytes::from("0123456789"), R2PutOptions::default())
            .await
            .unwrap();
        let result = r2
            .get(
                "key",
                R2GetOptions {
                    range: Some(RangeOptions {
                        offset: Some(2),
                        length: Some(3),
                        suffix: None,
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        match result {
            R2GetResult::Found { body, range, .. } => {
                assert_eq!(&body[..], b"234");
                assert_eq!(range.unwrap().offset, 2);
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn conditional_put_on_etag() {
        let (_, r2) = setup();
        let first = created(
            r2.put("key", Bytes::from("v1"), R2PutOptions::default())
                .await
                .unwrap(),
        );

        // Matching etag: allowed.
        let second = r2
            .put(
                "key",
                Bytes::from("v2"),
                R2PutOptions {
                    only_if: Some(R2Conditional {
                        etag_matches: Some(first.etag.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let second = created(second);
        assert_ne!(second.etag, first.etag);

        // Stale etag: rejected with the prior metadata attached.
        let third = r2
            .put(
                "key",
                Bytes::from("v3"),
                R2PutOptions {
                    only_if: Some(R2Conditional {
                        etag_matches: Some(first.etag.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        match third {
            R2PutResult::PreconditionFailed(Some(prior)) => {
                assert_eq!(prior.etag, second.etag);
            }
            other => panic!("expected PreconditionFailed, got {other:?}"),
        }
        // The stored object is unchanged.
        match r2.get("key", R2GetOptions::default()).await.unwrap() {
            R2GetResult::Found { body, .. } => assert_eq!(&body[..], b"v2"),
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn conditional_get_reports_metadata() {
        let (_, r2) = setup();
        let entry = created(
            r2.put("key", Bytes::from("v"), R2PutOptions::default())
                .await
                .unwrap(),
        );
        let result = r2
            .get(
                "key",
                R2GetOptions {
                    only_if: Some(R2Conditional {
                        etag_does_not_match: Some(entry.etag.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        match result {
            R2GetResult::PreconditionFailed(prior) => assert_eq!(prior.etag, entry.etag),
            other => panic!("expected PreconditionFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_digest_rejected_with_both_values() {
        let (_, r2) = setup();
        let err = r2
            .put(
                "key",
                Bytes::from("body"),
                R2PutOptions {
                    hashes: ProvidedHashes {
                        sha256: Some("00".repeat(32)),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.name(), "BadDigest");
        assert!(err.message().contains("SHA-256"));
        assert!(err.message().contains(&hex::encode(Sha256::digest(b"body"))));
        assert!(r2.head("key").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn provided_hashes_are_recorded() {
        let (_, r2) = setup();
        let sha256 = hex::encode(Sha256::digest(b"body"));
        let entry = created(
            r2.put(
                "key",
                Bytes::from("body"),
                R2PutOptions {
                    hashes: ProvidedHashes {
                        sha256: Some(sha256.to_ascii_uppercase()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .await
            .unwrap(),
        );
        assert_eq!(entry.checksums.sha256.as_deref(), Some(sha256.as_str()));
        assert!(entry.checksums.md5.is_some());
    }

    #[tokio::test]
    async fn metadata_too_large_rejected() {
        let (_, r2) = setup();
        let mut custom = CustomMetadata::new();
        custom.insert("k".into(), "x".repeat(MAX_METADATA_SIZE));
        let err = r2
            .put(
                "key",
                Bytes::from("v"),
                R2PutOptions {
                    custom_metadata: custom,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.name(), "MetadataTooLarge");
    }

    #[tokio::test]
    async fn long_keys_are_invalid_object_names() {
        let (_, r2) = setup();
        let err = r2
            .put(
                &"x".repeat(MAX_KEY_SIZE + 1),
                Bytes::from("v"),
                R2PutOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.name(), "InvalidObjectName");
    }

    #[tokio::test]
    async fn delete_removes_objects_and_blobs() {
        let (_, r2) = setup();
        r2.put("a", Bytes::from("1"), R2PutOptions::default())
            .await
            .unwrap();
        r2.put("b", Bytes::from("2"), R2PutOptions::default())
            .await
            .unwrap();
        r2.delete(&["a".to_string(), "b".to_string()]).await.unwrap();
        assert!(r2.head("a").await.unwrap().is_none());
        assert!(r2.head("b").await.unwrap().is_none());
        // All blobs swept.
        let listing = r2
            .blobs
            .list(ListOptions::default(), true)
            .await
            .unwrap();
        assert!(listing.keys.is_empty());
    }

    #[tokio::test]
    async fn list_with_delimiter_and_pagination() {
        let (_, r2) = setup();
        for key in ["dir/a", "dir/b", "top1", "top2"] {
            r2.put(key, Bytes::from("x"), R2PutOptions::default())
                .await
                .unwrap();
        }

        let page = r2
            .list(R2ListOptions {
                delimiter: Some("/".into()),
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.delimited_prefixes, vec!["dir/".to_string()]);
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].key, "top1");
        assert_ne!(page.cursor, "");

        let rest = r2
            .list(R2ListOptions {
                delimiter: Some("/".into()),
                limit: Some(2),
                cursor: Some(page.cursor),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rest.objects.len(), 1);
        assert_eq!(rest.objects[0].key, "top2");
        assert_eq!(rest.cursor, "");
    }

    #[tokio::test]
    async fn list_limit_validation_and_includes() {
        let (_, r2) = setup();
        let err = r2
            .list(R2ListOptions {
                limit: Some(0),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.name(), "InvalidMaxKeys");

        let mut custom = CustomMetadata::new();
        custom.insert("a".into(), "b".into());
        r2.put(
            "key",
            Bytes::from("v"),
            R2PutOptions {
                http_metadata: HttpMetadata {
                    content_type: Some("text/plain".into()),
                    ..Default::default()
                },
                custom_metadata: custom.clone(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let bare = r2.list(R2ListOptions::default()).await.unwrap();
        assert!(bare.objects[0].http_metadata.content_type.is_none());
        assert!(bare.objects[0].custom_metadata.is_empty());

        let full = r2
            .list(R2ListOptions {
                include_http_metadata: true,
                include_custom_metadata: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            full.objects[0].http_metadata.content_type.as_deref(),
            Some("text/plain")
        );
        assert_eq!(full.objects[0].custom_metadata, custom);
    }

    #[tokio::test]
    async fn start_after_excludes_the_bound() {
        let (_, r2) = setup();
        for key in ["a", "b", "c"] {
            r2.put(key, Bytes::from("x"), R2PutOptions::default())
                .await
                .unwrap();
        }
        let page = r2
            .list(R2ListOptions {
                start_after: Some("a".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let keys: Vec<_> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c"]);
    }
}
