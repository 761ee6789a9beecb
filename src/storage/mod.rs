//! Object store: the landing zone for raw email objects.
//!
//! Objects are immutable: a key can be written once. Every successful `put`
//! emits one `ObjectCreated` notification on the store's channel, which is
//! what drives ingestion.

pub mod local;
pub mod memory;

pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::StorageError;

/// Maximum key length, matching common object-store limits.
const MAX_KEY_LEN: usize = 1024;

/// Object-creation notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectCreated {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub event_time: DateTime<Utc>,
}

/// Durable, write-once object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket name this store represents.
    fn bucket(&self) -> &str;

    /// Land a new object. Fails if the key already exists.
    async fn put(&self, key: &str, body: &[u8]) -> Result<ObjectCreated, StorageError>;

    /// Read an object.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Whether an object exists under `key`.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Every object whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectCreated>, StorageError>;
}

/// Reject keys that are empty, absolute, or escape the bucket.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let reason = if key.is_empty() {
        Some("key is empty")
    } else if key.len() > MAX_KEY_LEN {
        Some("key is too long")
    } else if key.starts_with('/') || key.starts_with('\\') {
        Some("key must be relative")
    } else if key.ends_with('/') {
        Some("key must not end with '/'")
    } else if key.split(['/', '\\']).any(|seg| seg == ".." || seg == "." || seg.is_empty()) {
        Some("key contains an empty, '.' or '..' segment")
    } else if key.chars().any(char::is_control) {
        Some("key contains control characters")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Extension of landed email objects.
pub const EMAIL_EXTENSION: &str = ".eml";

/// Stands in for `/` in ids of emails landed below a sub-directory of the prefix.
pub const ID_PATH_SEPARATOR: char = '~';

/// Derive the stable email identifier from an object key.
///
/// The id is the key relative to `prefix` without its `.eml` extension, so
/// `emails/rfq-001.eml` → `rfq-001` and `emails/alice/rfq-001.eml` →
/// `alice~rfq-001`. Distinct keys always give distinct ids; keys that could
/// not be told apart (a `~` in the relative path) have no id.
pub fn email_id_from_key(key: &str, prefix: &str) -> Option<String> {
    let stem = key.strip_prefix(prefix)?.strip_suffix(EMAIL_EXTENSION)?;
    if stem.is_empty()
        || stem.starts_with('/')
        || stem.ends_with('/')
        || stem.contains(ID_PATH_SEPARATOR)
    {
        return None;
    }
    Some(stem.replace('/', &ID_PATH_SEPARATOR.to_string()))
}

/// Object key an email id was derived from; the inverse of `email_id_from_key`.
pub fn key_for_email_id(email_id: &str, prefix: &str) -> String {
    format!("{prefix}{}{EMAIL_EXTENSION}", email_id.replace(ID_PATH_SEPARATOR, "/"))
}

/// Forward a notification to the ingestion side. Waits while the channel is full.
pub(crate) async fn notify(tx: Option<&mpsc::Sender<ObjectCreated>>, event: &ObjectCreated) {
    let Some(tx) = tx else {
        return;
    };
    if tx.send(event.clone()).await.is_err() {
        warn!(
            bucket = %event.bucket,
            key = %event.key,
            "Object notification dropped, ingestion is not running"
        );
    }
}
