//! Filesystem-backed object store.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{ObjectCreated, ObjectStore, notify, validate_key};
use crate::error::StorageError;

/// Object store rooted at a local directory; keys map to relative paths.
pub struct LocalObjectStore {
    root: PathBuf,
    bucket: String,
    notifications: Option<mpsc::Sender<ObjectCreated>>,
}

impl LocalObjectStore {
    /// Open (or create) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>, bucket: impl Into<String>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        info!(root = %root.display(), "Object store opened");
        Ok(Self {
            root,
            bucket: bucket.into(),
            notifications: None,
        })
    }

    /// Emit `ObjectCreated` on `tx` for every successful put.
    pub fn with_notifications(mut self, tx: mpsc::Sender<ObjectCreated>) -> Self {
        self.notifications = Some(tx);
        self
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn not_found(&self, key: &str) -> StorageError {
        StorageError::NotFound {
            bucket: self.bucket.clone(),
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, key: &str, body: &[u8]) -> Result<ObjectCreated, StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // create_new makes the write-once check atomic.
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StorageError::AlreadyExists {
                    bucket: self.bucket.clone(),
                    key: key.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(body).await?;
        file.sync_all().await?;

        let event = ObjectCreated {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            size: body.len() as u64,
            event_time: Utc::now(),
        };
        debug!(key = %key, size = event.size, "Object landed");
        notify(self.notifications.as_ref(), &event).await;
        Ok(event)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(self.not_found(key)),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectCreated>, StorageError> {
        let mut objects = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];
        while let Some((dir, dir_key)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let key = format!("{dir_key}{name}");
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    pending.push((entry.path(), format!("{key}/")));
                } else if key.starts_with(prefix) {
                    objects.push(ObjectCreated {
                        bucket: self.bucket.clone(),
                        key,
                        size: metadata.len(),
                        event_time: metadata.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
                    });
                }
            }
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip_and_notification() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let store = LocalObjectStore::open(tmp.path(), "inbox")
            .await
            .unwrap()
            .with_notifications(tx);

        let created = store.put("emails/a.eml", b"Subject: hi\r\n\r\nbody").await.unwrap();
        assert_eq!(created.size, 19);
        assert_eq!(store.get("emails/a.eml").await.unwrap(), b"Subject: hi\r\n\r\nbody");
        assert!(store.exists("emails/a.eml").await.unwrap());

        let note = rx.recv().await.unwrap();
        assert_eq!(note.key, "emails/a.eml");
        assert_eq!(note.bucket, "inbox");
    }

    #[tokio::test]
    async fn objects_are_write_once() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::open(tmp.path(), "inbox").await.unwrap();
        store.put("emails/a.eml", b"one").await.unwrap();
        let err = store.put("emails/a.eml", b"two").await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
        assert_eq!(store.get("emails/a.eml").await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::open(tmp.path(), "inbox").await.unwrap();
        assert!(matches!(
            store.get("emails/none.eml").await,
            Err(StorageError::NotFound { .. })
        ));
        assert!(!store.exists("emails/none.eml").await.unwrap());
    }

    #[tokio::test]
    async fn list_walks_nested_keys_under_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::open(tmp.path(), "inbox").await.unwrap();
        store.put("emails/b.eml", b"b").await.unwrap();
        store.put("emails/alice/a.eml", b"aa").await.unwrap();
        store.put("attachments/x.pdf", b"x").await.unwrap();

        let listed = store.list("emails/").await.unwrap();
        let keys: Vec<&str> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["emails/alice/a.eml", "emails/b.eml"]);
        assert_eq!(listed[0].size, 2);
        assert_eq!(store.list("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::open(tmp.path().join("root"), "inbox").await.unwrap();
        assert!(matches!(
            store.put("../escape.eml", b"x").await,
            Err(StorageError::InvalidKey { .. })
        ));
    }
}
