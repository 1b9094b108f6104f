//! SQLite journal for restart recovery.
//!
//! Persists:
//! - Hedge positions (upserted on every state change, JSON payload)
//! - Lifecycle events as published on the event bus
//! - The daily loss ledger of the risk gate

use crate::events::{EventRecord, EventSink};
use crate::hedge::{HedgePosition, HedgeStatus};
use crate::risk::LossLedger;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// A journaled lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub pair_id: Option<String>,
    pub position_id: Option<String>,
    pub payload: serde_json::Value,
}

/// SQLite-backed journal.
pub struct JournalStore {
    conn: Mutex<Connection>,
}

impl JournalStore {
    /// Open (or create) the journal at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create journal directory {:?}", parent))?;
        }
        let conn = Connection::open(path).with_context(|| format!("Failed to open journal at {:?}", path))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Journal initialized at {:?}", path);
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS hedge_positions (
                id TEXT PRIMARY KEY,
                pair_id TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_positions_status ON hedge_positions(status);

            CREATE TABLE IF NOT EXISTS lifecycle_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                pair_id TEXT,
                position_id TEXT,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_timestamp ON lifecycle_events(timestamp);
            CREATE INDEX IF NOT EXISTS idx_events_pair ON lifecycle_events(pair_id);

            -- One row per UTC day
            CREATE TABLE IF NOT EXISTS daily_loss_ledger (
                day TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                saved_at TEXT NOT NULL
            );
            "#,
        )?;

        debug!("Journal schema initialized");
        Ok(())
    }

    pub fn record_event(&self, record: &EventRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        self.conn().execute(
            r#"
            INSERT INTO lifecycle_events (timestamp, event_type, pair_id, position_id, payload)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.timestamp.to_rfc3339(),
                record.event.name(),
                record.event.pair_id(),
                record.event.position_id(),
                payload,
            ],
        )?;
        Ok(())
    }

    /// Insert or replace the stored copy of `position`.
    pub fn save_position(&self, position: &HedgePosition) -> Result<()> {
        let payload = serde_json::to_string(position)?;
        self.conn().execute(
            r#"
            INSERT INTO hedge_positions (id, pair_id, status, payload, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                status = ?3,
                payload = ?4,
                updated_at = ?5
            "#,
            params![
                position.id,
                position.pair_id,
                position.status.as_str(),
                payload,
                position.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Positions not yet CLOSED or FAILED, oldest first.
    pub fn load_open_positions(&self) -> Result<Vec<HedgePosition>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, payload FROM hedge_positions
            WHERE status NOT IN (?1, ?2)
            ORDER BY updated_at
            "#,
        )?;

        let rows: Vec<(String, String)> = stmt
            .query_map(
                params![HedgeStatus::Closed.as_str(), HedgeStatus::Failed.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<rusqlite::Result<_>>()?;

        let mut positions = Vec::with_capacity(rows.len());
        for (id, payload) in rows {
            match serde_json::from_str::<HedgePosition>(&payload) {
                Ok(position) => positions.push(position),
                Err(e) => warn!(position = %id, error = %e, "Skipping unreadable journal entry"),
            }
        }
        Ok(positions)
    }

    pub fn save_loss_ledger(&self, ledger: &LossLedger) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO daily_loss_ledger (day, payload, saved_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(day) DO UPDATE SET payload = ?2, saved_at = ?3
            "#,
            params![
                ledger.day.to_string(),
                serde_json::to_string(ledger)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn load_loss_ledger(&self, day: NaiveDate) -> Result<Option<LossLedger>> {
        let payload: Option<String> = self
            .conn()
            .query_row(
                "SELECT payload FROM daily_loss_ledger WHERE day = ?1",
                params![day.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        payload
            .map(|p| serde_json::from_str(&p).context("Corrupt loss ledger"))
            .transpose()
    }

    /// Most recent events, newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<JournalEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT timestamp, event_type, pair_id, position_id, payload
            FROM lifecycle_events
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let entries = stmt
            .query_map([limit], |row| {
                let ts: String = row.get(0)?;
                let payload: String = row.get(4)?;
                Ok(JournalEntry {
                    timestamp: DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    event_type: row.get(1)?,
                    pair_id: row.get(2)?,
                    position_id: row.get(3)?,
                    payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(entries)
    }

    /// Number of stored positions per status.
    pub fn position_counts(&self) -> Result<Vec<(String, u64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT status, COUNT(*) FROM hedge_positions
            GROUP BY status
            ORDER BY status
            "#,
        )?;

        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(counts)
    }
}

/// Event sink writing every event into the journal.
pub struct JournalSink {
    store: Arc<JournalStore>,
}

impl JournalSink {
    pub fn new(store: Arc<JournalStore>) -> Self {
        Self { store }
    }
}

impl EventSink for JournalSink {
    fn record(&self, record: &EventRecord) {
        if let Err(e) = self.store.record_event(record) {
            warn!(event = record.event.name(), error = %e, "Failed to journal event");
        }
    }
}
