use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Last known linkage record of one account, persisted across restarts.
///
/// `status` holds the canonical status name (for example `LINKED_INACTIVE`), not the
/// authority's raw vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StoredRecord {
    pub account_id: String,
    pub display_name: String,
    pub status: String,
    pub disabled: bool,
    pub last_synced_at: SystemTime,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordStoreError {
    #[error("store error: {0}")]
    Store(String),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, account_id: &str) -> Result<Option<StoredRecord>, RecordStoreError>;

    async fn put(&self, account_id: &str, record: StoredRecord) -> Result<(), RecordStoreError>;
}

/// In-memory adapter for tests and early wiring.
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<String, StoredRecord>>,
    puts: Mutex<usize>,
    failure: Mutex<Option<String>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of `put` calls observed so far.
    pub async fn put_count(&self) -> usize {
        *self.puts.lock().await
    }

    /// Makes every `get` and `put` fail with `message` until cleared.
    pub async fn fail_with(&self, message: Option<&str>) {
        *self.failure.lock().await = message.map(str::to_string);
    }

    async fn check_failure(&self) -> Result<(), RecordStoreError> {
        match self.failure.lock().await.as_ref() {
            Some(message) => Err(RecordStoreError::Store(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, account_id: &str) -> Result<Option<StoredRecord>, RecordStoreError> {
        self.check_failure().await?;
        Ok(self.records.lock().await.get(account_id).cloned())
    }

    async fn put(&self, account_id: &str, record: StoredRecord) -> Result<(), RecordStoreError> {
        self.check_failure().await?;
        self.records
            .lock()
            .await
            .insert(account_id.to_string(), record);
        *self.puts.lock().await += 1;
        Ok(())
    }
}
