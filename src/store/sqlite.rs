//! SQLite adapter for the persistence store.
//!
//! Bot documents are stored as JSON alongside a few indexed columns (owner,
//! symbol, state) so listings never deserialize every record. WAL mode keeps
//! reader tasks off the single writer's back.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::engine::types::{BotId, BotRecord, BotState, PerformanceSnapshot};
use crate::error::{StoreError, StoreResult};
use crate::store::{KeyAuditAction, KeyAuditEvent, Store};

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Private page cache, used by tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS bots (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                symbol TEXT NOT NULL,
                state TEXT NOT NULL,
                doc TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_bots_owner ON bots(owner, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_bots_state ON bots(state)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS performance (
                bot_id TEXT PRIMARY KEY,
                doc TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS key_audit (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                action TEXT NOT NULL,
                client_addr TEXT,
                outcome TEXT NOT NULL,
                ts INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_key_audit_owner_ts ON key_audit(owner, ts DESC)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_bot(doc: String) -> StoreResult<BotRecord> {
        Ok(serde_json::from_str(&doc)?)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_bot(&self, bot: &BotRecord) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let doc = serde_json::to_string(bot)?;
        conn.execute(
            "INSERT INTO bots (id, owner, symbol, state, doc, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                bot.id.to_string(),
                bot.owner,
                bot.config.symbol,
                bot.state.as_str(),
                doc,
                bot.created_at.timestamp_millis(),
                bot.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    async fn save_bot(&self, bot: &BotRecord) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let doc = serde_json::to_string(bot)?;
        let updated = conn.execute(
            "UPDATE bots SET owner = ?2, symbol = ?3, state = ?4, doc = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                bot.id.to_string(),
                bot.owner,
                bot.config.symbol,
                bot.state.as_str(),
                doc,
                bot.updated_at.timestamp_millis(),
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn load_bot(&self, id: BotId) -> StoreResult<BotRecord> {
        let conn = self.conn.lock().await;
        let doc: String = conn
            .query_row(
                "SELECT doc FROM bots WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;
        Self::row_to_bot(doc)
    }

    async fn delete_bot(&self, id: BotId) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let removed = conn.execute("DELETE FROM bots WHERE id = ?1", params![id.to_string()])?;
        if removed == 0 {
            return Err(StoreError::NotFound);
        }
        conn.execute(
            "DELETE FROM performance WHERE bot_id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    async fn list_bots(&self, owner: Option<&str>) -> StoreResult<Vec<BotRecord>> {
        let conn = self.conn.lock().await;
        let mut out = Vec::new();
        match owner {
            Some(owner) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT doc FROM bots WHERE owner = ?1 ORDER BY created_at ASC",
                )?;
                let rows = stmt.query_map(params![owner], |row| row.get::<_, String>(0))?;
                for doc in rows {
                    out.push(Self::row_to_bot(doc?)?);
                }
            }
            None => {
                let mut stmt =
                    conn.prepare_cached("SELECT doc FROM bots ORDER BY created_at ASC")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                for doc in rows {
                    out.push(Self::row_to_bot(doc?)?);
                }
            }
        }
        Ok(out)
    }

    async fn list_bots_in_state(&self, state: BotState) -> StoreResult<Vec<BotRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached("SELECT doc FROM bots WHERE state = ?1 ORDER BY created_at ASC")?;
        let rows = stmt.query_map(params![state.as_str()], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for doc in rows {
            out.push(Self::row_to_bot(doc?)?);
        }
        Ok(out)
    }

    async fn save_performance(&self, snapshot: &PerformanceSnapshot) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let doc = serde_json::to_string(snapshot)?;
        conn.execute(
            "INSERT INTO performance (bot_id, doc, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(bot_id) DO UPDATE SET doc = excluded.doc, updated_at = excluded.updated_at",
            params![
                snapshot.bot_id.to_string(),
                doc,
                snapshot.computed_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    async fn load_performance(&self, bot_id: BotId) -> StoreResult<PerformanceSnapshot> {
        let conn = self.conn.lock().await;
        let doc: String = conn
            .query_row(
                "SELECT doc FROM performance WHERE bot_id = ?1",
                params![bot_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;
        Ok(serde_json::from_str(&doc)?)
    }

    async fn append_audit(&self, event: &KeyAuditEvent) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO key_audit (id, owner, action, client_addr, outcome, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id.to_string(),
                event.owner,
                event.action.as_str(),
                event.client_addr,
                event.outcome,
                event.at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    async fn list_audit(&self, owner: &str, limit: u32) -> StoreResult<Vec<KeyAuditEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, owner, action, client_addr, outcome, ts FROM key_audit
             WHERE owner = ?1 ORDER BY ts DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![owner, limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, owner, action, client_addr, outcome, ts) = row?;
            let action = match action.as_str() {
                "added" => KeyAuditAction::Added,
                "updated" => KeyAuditAction::Updated,
                "removed" => KeyAuditAction::Removed,
                _ => KeyAuditAction::Used,
            };
            out.push(KeyAuditEvent {
                id: id
                    .parse()
                    .map_err(|e| StoreError::Database(format!("bad audit id: {e}")))?,
                owner,
                action,
                client_addr,
                outcome,
                at: chrono::DateTime::from_timestamp_millis(ts)
                    .unwrap_or_else(chrono::Utc::now),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{BotConfig, GridOrder};
    use crate::venue::types::Side;
    use rust_decimal_macros::dec;

    fn bot() -> BotRecord {
        let mut b = BotRecord::new(
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
        );
        b.orders.push(GridOrder::new(Side::Buy, dec!(9.8), dec!(1.02), 4));
        b
    }

    #[tokio::test]
    async fn test_sqlite_bot_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut b = bot();
        store.insert_bot(&b).await.unwrap();

        b.state = BotState::Paused;
        b.stats.total_trades = 3;
        store.save_bot(&b).await.unwrap();

        let loaded = store.load_bot(b.id).await.unwrap();
        assert_eq!(loaded.state, BotState::Paused);
        assert_eq!(loaded.stats.total_trades, 3);
        assert_eq!(loaded.orders.len(), 1);
        assert_eq!(loaded.orders[0].price, dec!(9.8));
    }

    #[tokio::test]
    async fn test_sqlite_save_missing_bot_fails() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(
            store.save_bot(&bot()).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_sqlite_state_listing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let active = bot();
        let mut stopped = bot();
        stopped.state = BotState::Stopped;
        store.insert_bot(&active).await.unwrap();
        store.insert_bot(&stopped).await.unwrap();

        let got = store.list_bots_in_state(BotState::Active).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, active.id);

        let all = store.list_bots(Some("alice")).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_sqlite_performance_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        let b = bot();
        let mut snap = PerformanceSnapshot {
            bot_id: b.id,
            realized_pnl: dec!(1.5),
            computed_at: chrono::Utc::now(),
            ..Default::default()
        };
        store.save_performance(&snap).await.unwrap();
        snap.realized_pnl = dec!(2.5);
        store.save_performance(&snap).await.unwrap();

        let loaded = store.load_performance(b.id).await.unwrap();
        assert_eq!(loaded.realized_pnl, dec!(2.5));
    }

    #[tokio::test]
    async fn test_sqlite_audit_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .append_audit(&KeyAuditEvent::now("alice", KeyAuditAction::Added, "ok"))
            .await
            .unwrap();
        store
            .append_audit(&KeyAuditEvent::now("alice", KeyAuditAction::Used, "ok"))
            .await
            .unwrap();

        let events = store.list_audit("alice", 1).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, KeyAuditAction::Used);
    }

    #[tokio::test]
    async fn test_sqlite_file_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.db");
        let b = bot();
        {
            let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
            store.insert_bot(&b).await.unwrap();
        }
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
        let loaded = store.load_bot(b.id).await.unwrap();
        assert_eq!(loaded.owner, "alice");
    }
}
