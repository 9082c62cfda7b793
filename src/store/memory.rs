//! In-memory backends for tests and single-instance deployments.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{
    MessageStore, QuotaStore, StoreError, StoreResult, StoredMessage, UsageLogRecord,
    UsageLogStore, UsageRow, WriteOutcome,
};
use crate::tiers::QuotaSlot;

#[derive(Debug, Default)]
struct QuotaState {
    rows: HashMap<(String, QuotaSlot), UsageRow>,
    deductions: HashSet<(Uuid, QuotaSlot)>,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryQuotaStore {
    state: Arc<Mutex<QuotaState>>,
    offline: Arc<AtomicBool>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Seeds a row directly, bypassing version checks.
    pub async fn insert(&self, row: UsageRow) {
        let mut state = self.state.lock().await;
        state.rows.insert((row.user_id.clone(), row.slot), row);
    }

    pub async fn row(&self, user_id: &str, slot: QuotaSlot) -> Option<UsageRow> {
        let state = self.state.lock().await;
        state.rows.get(&(user_id.to_string(), slot)).cloned()
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("memory store is offline"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl QuotaStore for MemoryQuotaStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, user_id: &str, slot: QuotaSlot) -> StoreResult<Option<UsageRow>> {
        self.check_online()?;
        let state = self.state.lock().await;
        Ok(state.rows.get(&(user_id.to_string(), slot)).cloned())
    }

    async fn write(
        &self,
        expected: Option<u64>,
        row: &UsageRow,
        deduction: Option<Uuid>,
    ) -> StoreResult<WriteOutcome> {
        self.check_online()?;
        let mut state = self.state.lock().await;

        if let Some(key) = deduction
            && state.deductions.contains(&(key, row.slot))
        {
            return Ok(WriteOutcome::AlreadyApplied);
        }

        let key = (row.user_id.clone(), row.slot);
        let current = state.rows.get(&key).map(|r| r.version);
        if current != expected {
            return Ok(WriteOutcome::Conflict);
        }

        state.rows.insert(key, row.clone());
        if let Some(id) = deduction {
            state.deductions.insert((id, row.slot));
        }
        Ok(WriteOutcome::Applied)
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryUsageLog {
    records: Arc<RwLock<Vec<UsageLogRecord>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryUsageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<UsageLogRecord> {
        self.records.read().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait::async_trait]
impl UsageLogStore for MemoryUsageLog {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, record: &UsageLogRecord) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("memory usage log is offline"));
        }
        self.records.write().await.push(record.clone());
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryMessageStore {
    messages: Arc<RwLock<Vec<StoredMessage>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<StoredMessage> {
        self.messages.read().await.clone()
    }

    pub async fn for_user(&self, user_id: &str) -> Vec<StoredMessage> {
        self.messages
            .read()
            .await
            .iter()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl MessageStore for MemoryMessageStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save(&self, message: &StoredMessage) -> StoreResult<()> {
        self.messages.write().await.push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiers::PeriodKind;
    use chrono::Utc;

    fn daily() -> QuotaSlot {
        QuotaSlot::primary(PeriodKind::Daily)
    }

    #[tokio::test]
    async fn test_insert_if_absent() {
        let store = MemoryQuotaStore::new();
        let row = UsageRow::fresh("u1", daily(), Utc::now());

        assert_eq!(
            store.write(None, &row, None).await.unwrap(),
            WriteOutcome::Applied
        );
        assert_eq!(
            store.write(None, &row, None).await.unwrap(),
            WriteOutcome::Conflict
        );
    }

    #[tokio::test]
    async fn test_version_compare_and_swap() {
        let store = MemoryQuotaStore::new();
        let row = UsageRow::fresh("u1", daily(), Utc::now());
        store.insert(row.clone()).await;

        let next = row.with_added(100);
        assert_eq!(
            store.write(Some(0), &next, None).await.unwrap(),
            WriteOutcome::Applied
        );
        // Stale writer still believes version 0.
        assert_eq!(
            store.write(Some(0), &row.with_added(5), None).await.unwrap(),
            WriteOutcome::Conflict
        );
        assert_eq!(store.row("u1", daily()).await.unwrap().tokens_used, 100);
    }

    #[tokio::test]
    async fn test_deduction_key_is_idempotent() {
        let store = MemoryQuotaStore::new();
        let key = Uuid::new_v4();
        let row = UsageRow::fresh("u1", daily(), Utc::now());
        store.insert(row.clone()).await;

        let first = row.with_added(600);
        assert_eq!(
            store.write(Some(0), &first, Some(key)).await.unwrap(),
            WriteOutcome::Applied
        );
        assert_eq!(
            store
                .write(Some(1), &first.with_added(600), Some(key))
                .await
                .unwrap(),
            WriteOutcome::AlreadyApplied
        );

        // The same key against another slot is independent.
        let weekly = UsageRow::fresh("u1", QuotaSlot::primary(PeriodKind::Weekly), Utc::now());
        assert_eq!(
            store.write(None, &weekly.with_added(600), Some(key)).await.unwrap(),
            WriteOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_offline_store_fails() {
        let store = MemoryQuotaStore::new();
        store.set_offline(true);
        let err = store.load("u1", daily()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));
    }
}
