//! In-memory object store, used in tests and throwaway runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};

use super::{ObjectCreated, ObjectStore, notify, validate_key};
use crate::error::StorageError;

struct StoredObject {
    body: Vec<u8>,
    created_at: DateTime<Utc>,
}

pub struct MemoryObjectStore {
    bucket: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    notifications: Option<mpsc::Sender<ObjectCreated>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
            notifications: None,
        }
    }

    pub fn with_notifications(mut self, tx: mpsc::Sender<ObjectCreated>) -> Self {
        self.notifications = Some(tx);
        self
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, key: &str, body: &[u8]) -> Result<ObjectCreated, StorageError> {
        validate_key(key)?;
        let event = {
            let mut objects = self.objects.write().await;
            if objects.contains_key(key) {
                return Err(StorageError::AlreadyExists {
                    bucket: self.bucket.clone(),
                    key: key.to_string(),
                });
            }
            let event = ObjectCreated {
                bucket: self.bucket.clone(),
                key: key.to_string(),
                size: body.len() as u64,
                event_time: Utc::now(),
            };
            objects.insert(
                key.to_string(),
                StoredObject {
                    body: body.to_vec(),
                    created_at: event.event_time,
                },
            );
            event
        };
        notify(self.notifications.as_ref(), &event).await;
        Ok(event)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(key)?;
        self.objects
            .read()
            .await
            .get(key)
            .map(|object| object.body.clone())
            .ok_or_else(|| StorageError::NotFound {
                bucket: self.bucket.clone(),
                key: key.to_string(),
            })
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectCreated>, StorageError> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectCreated {
                bucket: self.bucket.clone(),
                key: key.clone(),
                size: object.body.len() as u64,
                event_time: object.created_at,
            })
            .collect())
    }
}
