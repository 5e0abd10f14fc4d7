//! Persistence store: durable records for bots, performance projections and
//! the credential audit trail.
//!
//! The engine writes whole bot documents; one `save_bot` call covers order
//! mutations, statistics and recovery history together, which is what makes
//! fill application atomic from the store's point of view.

pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::engine::types::{BotId, BotRecord, BotState, PerformanceSnapshot};
use crate::error::{StoreError, StoreResult};

pub use sqlite::SqliteStore;

// ─────────────────────────────────────────────────────────
// Credential audit
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAuditAction {
    Added,
    Updated,
    Removed,
    Used,
}

impl KeyAuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAuditAction::Added => "added",
            KeyAuditAction::Updated => "updated",
            KeyAuditAction::Removed => "removed",
            KeyAuditAction::Used => "used",
        }
    }
}

/// Append-only record of credential actions. Trust infrastructure, not
/// trading logic; never read on the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyAuditEvent {
    pub id: Uuid,
    pub owner: String,
    pub action: KeyAuditAction,
    pub client_addr: Option<String>,
    pub outcome: String,
    pub at: DateTime<Utc>,
}

impl KeyAuditEvent {
    pub fn now(owner: &str, action: KeyAuditAction, outcome: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            action,
            client_addr: None,
            outcome: outcome.to_string(),
            at: Utc::now(),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Store trait
// ─────────────────────────────────────────────────────────

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new bot document. Fails if the id already exists.
    async fn insert_bot(&self, bot: &BotRecord) -> StoreResult<()>;

    /// Atomically replace a bot document (orders, stats, history together).
    async fn save_bot(&self, bot: &BotRecord) -> StoreResult<()>;

    async fn load_bot(&self, id: BotId) -> StoreResult<BotRecord>;

    async fn delete_bot(&self, id: BotId) -> StoreResult<()>;

    /// All bots, optionally restricted to one owner.
    async fn list_bots(&self, owner: Option<&str>) -> StoreResult<Vec<BotRecord>>;

    /// Bots in a given state (startup recovery iterates `Active`).
    async fn list_bots_in_state(&self, state: BotState) -> StoreResult<Vec<BotRecord>>;

    async fn save_performance(&self, snapshot: &PerformanceSnapshot) -> StoreResult<()>;

    async fn load_performance(&self, bot_id: BotId) -> StoreResult<PerformanceSnapshot>;

    async fn append_audit(&self, event: &KeyAuditEvent) -> StoreResult<()>;

    async fn list_audit(&self, owner: &str, limit: u32) -> StoreResult<Vec<KeyAuditEvent>>;
}

// ─────────────────────────────────────────────────────────
// In-memory store (tests and ephemeral runs)
// ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    bots: HashMap<BotId, BotRecord>,
    performance: HashMap<BotId, PerformanceSnapshot>,
    audit: Vec<KeyAuditEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_bot(&self, bot: &BotRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.bots.contains_key(&bot.id) {
            return Err(StoreError::Database("duplicate bot id".into()));
        }
        inner.bots.insert(bot.id, bot.clone());
        Ok(())
    }

    async fn save_bot(&self, bot: &BotRecord) -> StoreResult<()> {
        self.inner.lock().await.bots.insert(bot.id, bot.clone());
        Ok(())
    }

    async fn load_bot(&self, id: BotId) -> StoreResult<BotRecord> {
        self.inner
            .lock()
            .await
            .bots
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn delete_bot(&self, id: BotId) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.bots.remove(&id).ok_or(StoreError::NotFound)?;
        inner.performance.remove(&id);
        Ok(())
    }

    async fn list_bots(&self, owner: Option<&str>) -> StoreResult<Vec<BotRecord>> {
        let inner = self.inner.lock().await;
        let mut bots: Vec<_> = inner
            .bots
            .values()
            .filter(|b| owner.map_or(true, |o| b.owner == o))
            .cloned()
            .collect();
        bots.sort_by_key(|b| b.created_at);
        Ok(bots)
    }

    async fn list_bots_in_state(&self, state: BotState) -> StoreResult<Vec<BotRecord>> {
        let inner = self.inner.lock().await;
        let mut bots: Vec<_> = inner
            .bots
            .values()
            .filter(|b| b.state == state)
            .cloned()
            .collect();
        bots.sort_by_key(|b| b.created_at);
        Ok(bots)
    }

    async fn save_performance(&self, snapshot: &PerformanceSnapshot) -> StoreResult<()> {
        self.inner
            .lock()
            .await
            .performance
            .insert(snapshot.bot_id, snapshot.clone());
        Ok(())
    }

    async fn load_performance(&self, bot_id: BotId) -> StoreResult<PerformanceSnapshot> {
        self.inner
            .lock()
            .await
            .performance
            .get(&bot_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn append_audit(&self, event: &KeyAuditEvent) -> StoreResult<()> {
        self.inner.lock().await.audit.push(event.clone());
        Ok(())
    }

    async fn list_audit(&self, owner: &str, limit: u32) -> StoreResult<Vec<KeyAuditEvent>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .audit
            .iter()
            .filter(|e| e.owner == owner)
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::BotConfig;
    use rust_decimal_macros::dec;

    fn bot() -> BotRecord {
        BotRecord::new(
            "alice",
            BotConfig {
                symbol: "FOOUSDT".into(),
                upper_price: dec!(11),
                lower_price: dec!(9),
                grid_levels: 11,
                investment: dec!(110),
                profit_per_grid: dec!(1),
                test_mode: false,
                replenish_after_close: true,
            },
        )
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        let b = bot();
        store.insert_bot(&b).await.unwrap();
        assert!(store.insert_bot(&b).await.is_err());

        let loaded = store.load_bot(b.id).await.unwrap();
        assert_eq!(loaded.owner, "alice");

        store.delete_bot(b.id).await.unwrap();
        assert!(matches!(
            store.load_bot(b.id).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_memory_store_state_filter() {
        let store = MemoryStore::new();
        let mut a = bot();
        a.state = BotState::Active;
        let mut s = bot();
        s.state = BotState::Stopped;
        store.insert_bot(&a).await.unwrap();
        store.insert_bot(&s).await.unwrap();

        let active = store.list_bots_in_state(BotState::Active).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
    }

    #[tokio::test]
    async fn test_audit_newest_first() {
        let store = MemoryStore::new();
        store
            .append_audit(&KeyAuditEvent::now("alice", KeyAuditAction::Added, "ok"))
            .await
            .unwrap();
        store
            .append_audit(&KeyAuditEvent::now("alice", KeyAuditAction::Used, "ok"))
            .await
            .unwrap();
        store
            .append_audit(&KeyAuditEvent::now("bob", KeyAuditAction::Added, "ok"))
            .await
            .unwrap();

        let events = store.list_audit("alice", 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, KeyAuditAction::Used);
    }
}
