//! Multipart upload operations for the object store.
//!
//! Parts are uploaded independently as blobs with hex-MD5 etags;
//! completion stitches the referenced parts into one object whose etag is
//! the MD5 of the concatenated part digests suffixed with the part count.
//! Every non-final part must be at least 5 MiB; the final part is
//! unbounded on the low end. Parts persist until the upload is aborted or
//! completed.

use bytes::Bytes;
use md5::Md5;
use rusqlite::OptionalExtension;
use sha2::Digest;
use uuid::Uuid;

use crate::{
    error::{ErrorKind, KumoError, Result},
    storage::{RangeOptions, StoredEntry},
};

use super::{
    CustomMetadata, HttpMetadata, MAX_METADATA_SIZE, ObjectEntry, R2GetOptions, R2GetResult,
    R2Gateway, custom_metadata_size,
};

/// Minimum size of every non-final part.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

const STATE_IN_PROGRESS: i64 = 0;
const STATE_COMPLETED: i64 = 1;
const STATE_ABORTED: i64 = 2;

/// Handle to an in-progress multipart upload.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipartUpload {
    /// Opaque upload identifier.
    pub upload_id: String,
    /// Target object key.
    pub key: String,
}

/// A part as acknowledged by `upload_part`, and as referenced on
/// completion.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedPart {
    /// 1-based part number.
    pub part_number: u32,
    /// Hex MD5 of the part body.
    pub etag: String,
}

struct UploadRow {
    key: String,
    http_metadata: HttpMetadata,
    custom_metadata: CustomMetadata,
    storage_class: String,
    state: i64,
}

impl R2Gateway {
    /// Starts a multipart upload for `key`.
    pub async fn create_multipart(
        &self,
        key: &str,
        http_metadata: HttpMetadata,
        custom_metadata: CustomMetadata,
        storage_class: Option<String>,
    ) -> Result<MultipartUpload> {
        super::validate_object_key(key)?;
        let metadata_size = custom_metadata_size(&custom_metadata);
        if metadata_size > MAX_METADATA_SIZE {
            return Err(KumoError::new(
                ErrorKind::Capacity,
                "MetadataTooLarge",
                format!(
                    "Custom metadata size of {metadata_size} exceeds limit of {MAX_METADATA_SIZE}"
                ),
            ));
        }

        let upload_id = Uuid::new_v4().simple().to_string();
        let http = serde_json::to_string(&http_metadata)?;
        let custom = serde_json::to_string(&custom_metadata)?;
        let storage_class =
            storage_class.unwrap_or_else(|| super::DEFAULT_STORAGE_CLASS.to_string());
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO multipart_uploads (upload_id, key, http_metadata, custom_metadata, \
                 storage_class, state) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![upload_id, key, http, custom, storage_class, STATE_IN_PROGRESS],
            )?;
            Ok(())
        })?;
        Ok(MultipartUpload {
            upload_id,
            key: key.to_string(),
        })
    }

    /// Uploads (or replaces) one part of an in-progress upload.
    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        value: Bytes,
    ) -> Result<UploadedPart> {
        self.in_progress_upload(key, upload_id)?;

        let etag = hex::encode(Md5::digest(&value));
        let size = value.len() as u64;
        let blob_id = Uuid::new_v4().to_string();
        self.blobs
            .put(&blob_id, StoredEntry::from_value(value))
            .await?;

        let replaced: Option<String> = self.db.with(|conn| {
            let prior = conn
                .query_row(
                    "SELECT blob_id FROM multipart_parts WHERE upload_id = ?1 AND part_number = ?2",
                    rusqlite::params![upload_id, part_number],
                    |row| row.get(0),
                )
                .optional()?;
            conn.execute(
                "INSERT OR REPLACE INTO multipart_parts (upload_id, part_number, blob_id, size, \
                 etag) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![upload_id, part_number, blob_id, size as i64, etag],
            )?;
            Ok(prior)
        })?;
        if let Some(old_blob) = replaced {
            let _ = self.blobs.delete(&old_blob).await;
        }

        Ok(UploadedPart { part_number, etag })
    }

    /// Copies a byte range of an existing object in as a part.
    pub async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        source_key: &str,
        range: Option<RangeOptions>,
    ) -> Result<UploadedPart> {
        let source = self
            .get(
                source_key,
                R2GetOptions {
                    range,
                    ..Default::default()
                },
            )
            .await?;
        let body = match source {
            R2GetResult::Found { body, .. } => body,
            _ => {
                return Err(KumoError::new(
                    ErrorKind::NotFound,
                    "NoSuchKey",
                    "The specified key does not exist",
                ));
            }
        };
        self.upload_part(key, upload_id, part_number, body).await
    }

    /// Completes an upload from the referenced parts, producing the final
    /// object.
    pub async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<ObjectEntry> {
        let upload = self.in_progress_upload(key, upload_id)?;
        if parts.is_empty() {
            return Err(invalid_part());
        }

        struct PartRow {
            part_number: u32,
            blob_id: String,
            size: u64,
            etag: String,
        }
        let stored: Vec<PartRow> = self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT part_number, blob_id, size, etag FROM multipart_parts \
                 WHERE upload_id = ?1 ORDER BY part_number",
            )?;
            let rows = stmt.query_map([upload_id], |row| {
                Ok(PartRow {
                    part_number: row.get::<_, i64>(0)? as u32,
                    blob_id: row.get(1)?,
                    size: row.get::<_, i64>(2)? as u64,
                    etag: row.get(3)?,
                })
            })?;
            rows.collect()
        })?;

        // Every referenced part must exist with a matching etag.
        let mut selected = Vec::with_capacity(parts.len());
        for wanted in parts {
            let found = stored.iter().find(|p| {
                p.part_number == wanted.part_number
                    && p.etag == super::record::strip_etag_quotes(&wanted.etag)
            });
            match found {
                Some(part) => selected.push(part),
                None => return Err(invalid_part()),
            }
        }
        selected.sort_by_key(|p| p.part_number);

        // Non-final parts respect the minimum size.
        for part in &selected[..selected.len() - 1] {
            if part.size < MIN_PART_SIZE {
                return Err(KumoError::new(
                    ErrorKind::Capacity,
                    "EntityTooLarge",
                    format!(
                        "Each part size must be at least {MIN_PART_SIZE} bytes, except the last"
                    ),
                ));
            }
        }

        let mut digest_concat = Vec::with_capacity(selected.len() * 16);
        for part in &selected {
            digest_concat.extend_from_slice(&hex::decode(&part.etag).unwrap_or_default());
        }
        let etag = format!(
            "{}-{}",
            hex::encode(Md5::digest(&digest_concat)),
            selected.len()
        );

        let prior = self.load_row(key)?;
        let entry = ObjectEntry {
            key: key.to_string(),
            version: Uuid::new_v4().to_string(),
            size: selected.iter().map(|p| p.size).sum(),
            etag,
            uploaded: self.clock.now_millis(),
            http_metadata: upload.http_metadata,
            custom_metadata: upload.custom_metadata,
            checksums: Default::default(),
            storage_class: upload.storage_class,
        };
        let blob_refs: Vec<String> = selected.iter().map(|p| p.blob_id.clone()).collect();
        self.write_row(&entry, &blob_refs)?;
        if let Some(prior) = prior {
            self.delete_blobs(&prior.blob_refs).await;
        }

        // Unreferenced parts are dropped with the upload.
        let selected_blobs: std::collections::HashSet<&str> =
            blob_refs.iter().map(String::as_str).collect();
        for part in &stored {
            if !selected_blobs.contains(part.blob_id.as_str()) {
                let _ = self.blobs.delete(&part.blob_id).await;
            }
        }
        self.db.with(|conn| {
            conn.execute(
                "DELETE FROM multipart_parts WHERE upload_id = ?1",
                [upload_id],
            )?;
            conn.execute(
                "UPDATE multipart_uploads SET state = ?2 WHERE upload_id = ?1",
                rusqlite::params![upload_id, STATE_COMPLETED],
            )?;
            Ok(())
        })?;

        Ok(entry)
    }

    /// Aborts an upload, dropping its parts. Aborting an already aborted
    /// upload is a no-op.
    pub async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        let upload = self.load_upload(upload_id)?;
        let Some(upload) = upload else {
            return Err(no_such_upload());
        };
        if upload.key != key || upload.state == STATE_COMPLETED {
            return Err(no_such_upload());
        }
        if upload.state == STATE_ABORTED {
            return Ok(());
        }

        let blobs: Vec<String> = self.db.with(|conn| {
            let mut stmt =
                conn.prepare("SELECT blob_id FROM multipart_parts WHERE upload_id = ?1")?;
            let rows = stmt.query_map([upload_id], |row| row.get(0))?;
            rows.collect()
        })?;
        for blob_id in &blobs {
            let _ = self.blobs.delete(blob_id).await;
        }
        self.db.with(|conn| {
            conn.execute(
                "DELETE FROM multipart_parts WHERE upload_id = ?1",
                [upload_id],
            )?;
            conn.execute(
                "UPDATE multipart_uploads SET state = ?2 WHERE upload_id = ?1",
                rusqlite::params![upload_id, STATE_ABORTED],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn load_upload(&self, upload_id: &str) -> Result<Option<UploadRow>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT key, http_metadata, custom_metadata, storage_class, state \
                 FROM multipart_uploads WHERE upload_id = ?1",
                [upload_id],
                |row| {
                    let http: String = row.get(1)?;
                    let custom: String = row.get(2)?;
                    Ok(UploadRow {
                        key: row.get(0)?,
                        http_metadata: serde_json::from_str(&http).unwrap_or_default(),
                        custom_metadata: serde_json::from_str(&custom).unwrap_or_default(),
                        storage_class: row.get(3)?,
                        state: row.get(4)?,
                    })
                },
            )
            .optional()
        })
    }

    fn in_progress_upload(&self, key: &str, upload_id: &str) -> Result<UploadRow> {
        match self.load_upload(upload_id)? {
            Some(upload) if upload.key == key && upload.state == STATE_IN_PROGRESS => Ok(upload),
            _ => Err(no_such_upload()),
        }
    }
}

fn no_such_upload() -> KumoError {
    KumoError::new(
        ErrorKind::NotFound,
        "NoSuchUpload",
        "The specified multipart upload does not exist",
    )
}

fn invalid_part() -> KumoError {
    KumoError::new(
        ErrorKind::Validation,
        "InvalidPart",
        "One or more of the specified parts could not be found",
    )
}
