//! The store itself: schema, single-writer connection, operations.

use std::path::Path;

use chrono::{DateTime, Utc};
use hearth_types::Message;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::log::{AutomationLogEntry, CallServiceLogEntry, LogType, NewAutomationLog};
use crate::signal::{Signal, SignalData};
use crate::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS signals (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    automation_hash TEXT NOT NULL,
    kind            TEXT NOT NULL,
    data            TEXT NOT NULL,
    is_dead         INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_signals_hash ON signals (automation_hash, is_dead);

CREATE TABLE IF NOT EXISTS automation_logs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at      TEXT NOT NULL,
    automation_hash TEXT,
    type            TEXT NOT NULL,
    messages        TEXT NOT NULL,
    signaled_by     TEXT
);
CREATE INDEX IF NOT EXISTS idx_automation_logs_hash ON automation_logs (automation_hash);

CREATE TABLE IF NOT EXISTS call_service_logs (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at        TEXT NOT NULL,
    automation_log_id INTEGER NOT NULL,
    service           TEXT NOT NULL,
    target            TEXT NOT NULL,
    data              TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS images (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at        TEXT NOT NULL,
    automation_log_id INTEGER,
    media_type        TEXT NOT NULL,
    bytes             BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS logs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL,
    level      TEXT NOT NULL,
    message    TEXT NOT NULL
);
";

/// The durable store. Single writer; all mutations serialize through the
/// one connection.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (and create if missing) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// Open an in-memory store. Used by tests and the eval harness.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ─── Signals ──────────────────────────────────────────────────────────

    /// Insert a new alive signal and return its id.
    pub async fn insert_signal(
        &self,
        automation_hash: &str,
        data: &SignalData,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO signals (automation_hash, kind, data, is_dead, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![
                automation_hash,
                data.kind(),
                serde_json::to_string(data)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All alive signals for an automation hash.
    pub async fn alive_signals_for_hash(&self, hash: &str) -> Result<Vec<Signal>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, automation_hash, data, is_dead, created_at
             FROM signals WHERE automation_hash = ?1 AND is_dead = 0 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![hash], row_to_signal)?;
        collect_signals(rows)
    }

    /// All alive signals across every automation.
    pub async fn alive_signals(&self) -> Result<Vec<Signal>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, automation_hash, data, is_dead, created_at
             FROM signals WHERE is_dead = 0 ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_signal)?;
        collect_signals(rows)
    }

    /// Load one signal by id, dead or alive.
    pub async fn signal(&self, id: i64) -> Result<Option<Signal>, StoreError> {
        let conn = self.conn.lock().await;
        let signal = conn
            .query_row(
                "SELECT id, automation_hash, data, is_dead, created_at
                 FROM signals WHERE id = ?1",
                params![id],
                row_to_signal,
            )
            .optional()?;
        signal.map(parse_signal).transpose()
    }

    /// Mark one signal dead.
    pub async fn kill_signal(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("UPDATE signals SET is_dead = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Mark every signal for a hash dead.
    pub async fn kill_all_for_hash(&self, hash: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let killed = conn.execute(
            "UPDATE signals SET is_dead = 1 WHERE automation_hash = ?1 AND is_dead = 0",
            params![hash],
        )?;
        if killed > 0 {
            tracing::debug!(hash, killed, "killed signals");
        }
        Ok(())
    }

    // ─── Automation logs ──────────────────────────────────────────────────

    /// Append an automation log row and return its id.
    pub async fn append_automation_log(&self, entry: &NewAutomationLog) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        insert_log(&conn, entry)
    }

    /// Replace the message list of an existing row.
    ///
    /// Only `manual` entries grow in place, and only within one request.
    pub async fn update_automation_log(
        &self,
        id: i64,
        messages: &[Message],
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE automation_logs SET messages = ?2 WHERE id = ?1",
            params![id, serde_json::to_string(messages)?],
        )?;
        Ok(())
    }

    /// Append an `execute-signal` log row and kill the fired one-shot in
    /// the same transaction.
    pub async fn append_execution_log_and_kill(
        &self,
        signal_id: i64,
        entry: &NewAutomationLog,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let log_id = insert_log(&tx, entry)?;
        tx.execute(
            "UPDATE signals SET is_dead = 1 WHERE id = ?1",
            params![signal_id],
        )?;
        tx.commit()?;
        Ok(log_id)
    }

    /// Load one automation log row.
    pub async fn automation_log(&self, id: i64) -> Result<Option<AutomationLogEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, created_at, automation_hash, type, messages, signaled_by
                 FROM automation_logs WHERE id = ?1",
                params![id],
                row_to_log,
            )
            .optional()?;
        row.map(parse_log).transpose()
    }

    /// All log rows for a hash, oldest first.
    pub async fn automation_logs_for_hash(
        &self,
        hash: &str,
    ) -> Result<Vec<AutomationLogEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, created_at, automation_hash, type, messages, signaled_by
             FROM automation_logs WHERE automation_hash = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![hash], row_to_log)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(parse_log(row?)?);
        }
        Ok(entries)
    }

    // ─── Service calls ────────────────────────────────────────────────────

    /// Record one service call under an automation log entry.
    pub async fn record_service_call(
        &self,
        automation_log_id: i64,
        service: &str,
        target: &serde_json::Value,
        data: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO call_service_logs (created_at, automation_log_id, service, target, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Utc::now().to_rfc3339(),
                automation_log_id,
                service,
                target.to_string(),
                data.to_string(),
            ],
        )?;
        Ok(())
    }

    /// All service calls recorded under a log entry.
    pub async fn service_calls_for_log(
        &self,
        automation_log_id: i64,
    ) -> Result<Vec<CallServiceLogEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT created_at, automation_log_id, service, target, data
             FROM call_service_logs WHERE automation_log_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![automation_log_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (created_at, automation_log_id, service, target, data) = row?;
            entries.push(CallServiceLogEntry {
                created_at: parse_timestamp(&created_at)?,
                automation_log_id,
                service,
                target: serde_json::from_str(&target)?,
                data: serde_json::from_str(&data)?,
            });
        }
        Ok(entries)
    }

    // ─── Images ───────────────────────────────────────────────────────────

    /// Store an image blob referenced by a vision tool.
    pub async fn insert_image(
        &self,
        automation_log_id: Option<i64>,
        media_type: &str,
        bytes: &[u8],
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO images (created_at, automation_log_id, media_type, bytes)
             VALUES (?1, ?2, ?3, ?4)",
            params![Utc::now().to_rfc3339(), automation_log_id, media_type, bytes],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // ─── App log tail ─────────────────────────────────────────────────────

    /// Append one line to the app log tail.
    pub async fn append_log(&self, level: &str, message: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO logs (created_at, level, message) VALUES (?1, ?2, ?3)",
            params![Utc::now().to_rfc3339(), level, message],
        )?;
        Ok(())
    }

    /// The last `limit` app log lines, oldest first.
    pub async fn tail_logs(&self, limit: usize) -> Result<Vec<(String, String, String)>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT created_at, level, message FROM
             (SELECT id, created_at, level, message FROM logs ORDER BY id DESC LIMIT ?1)
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        let mut lines = Vec::new();
        for row in rows {
            lines.push(row?);
        }
        Ok(lines)
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────

    /// Flush and fsync. Invoked on shutdown.
    pub async fn checkpoint(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        // No-op outside WAL mode (in-memory stores).
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

// ─── Row mapping ──────────────────────────────────────────────────────────

type SignalRow = (i64, String, String, bool, String);

fn row_to_signal(row: &rusqlite::Row<'_>) -> rusqlite::Result<SignalRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get::<_, i64>(3)? != 0,
        row.get(4)?,
    ))
}

fn parse_signal(row: SignalRow) -> Result<Signal, StoreError> {
    let (id, automation_hash, data, is_dead, created_at) = row;
    Ok(Signal {
        id,
        automation_hash,
        data: serde_json::from_str(&data)?,
        is_dead,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn collect_signals(
    rows: impl Iterator<Item = rusqlite::Result<SignalRow>>,
) -> Result<Vec<Signal>, StoreError> {
    let mut signals = Vec::new();
    for row in rows {
        signals.push(parse_signal(row?)?);
    }
    Ok(signals)
}

type LogRow = (i64, String, Option<String>, String, String, Option<String>);

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn parse_log(row: LogRow) -> Result<AutomationLogEntry, StoreError> {
    let (id, created_at, automation_hash, log_type, messages, signaled_by) = row;
    let log_type = LogType::parse(&log_type)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown log type: {log_type}")))?;
    Ok(AutomationLogEntry {
        id,
        created_at: parse_timestamp(&created_at)?,
        automation_hash,
        log_type,
        messages: serde_json::from_str(&messages)?,
        signaled_by: signaled_by
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
    })
}

fn insert_log(conn: &Connection, entry: &NewAutomationLog) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO automation_logs (created_at, automation_hash, type, messages, signaled_by)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            Utc::now().to_rfc3339(),
            entry.automation_hash,
            entry.log_type.as_str(),
            serde_json::to_string(&entry.messages)?,
            entry
                .signaled_by
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {s}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_types::{ContentPart, Role};

    fn cron_data() -> SignalData {
        SignalData::Cron {
            expr: "0 7 * * *".into(),
        }
    }

    #[tokio::test]
    async fn insert_and_query_signals() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_signal("hash-a", &cron_data()).await.unwrap();

        let alive = store.alive_signals_for_hash("hash-a").await.unwrap();
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].id, id);
        assert_eq!(alive[0].data, cron_data());
        assert!(!alive[0].is_dead);

        assert!(store.alive_signals_for_hash("hash-b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn kill_signal_removes_from_alive_set() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_signal("hash-a", &cron_data()).await.unwrap();
        store.kill_signal(id).await.unwrap();
        assert!(store.alive_signals_for_hash("hash-a").await.unwrap().is_empty());
        assert!(store.signal(id).await.unwrap().unwrap().is_dead);
    }

    #[tokio::test]
    async fn kill_all_for_hash_spares_other_hashes() {
        let store = Store::open_in_memory().unwrap();
        store.insert_signal("hash-a", &cron_data()).await.unwrap();
        store.insert_signal("hash-a", &cron_data()).await.unwrap();
        store.insert_signal("hash-b", &cron_data()).await.unwrap();

        store.kill_all_for_hash("hash-a").await.unwrap();
        assert!(store.alive_signals_for_hash("hash-a").await.unwrap().is_empty());
        assert_eq!(store.alive_signals_for_hash("hash-b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn every_signal_kind_survives_reload() {
        let store = Store::open_in_memory().unwrap();
        let kinds = vec![
            cron_data(),
            SignalData::State {
                entity_ids: vec!["binary_sensor.front_door".into()],
                regex: "open".into(),
            },
            SignalData::Offset {
                offset_seconds: 30,
                repeat_forever: false,
                anchor: "2025-06-01T00:00:00Z".parse().unwrap(),
            },
            SignalData::Time {
                at: "2025-06-02T07:00:00Z".parse().unwrap(),
            },
            SignalData::StateRange {
                entity_id: "sensor.living_room_temperature".into(),
                min: Some(60.0),
                max: Some(80.0),
                for_seconds: 120,
            },
        ];
        for data in &kinds {
            store.insert_signal("hash-a", data).await.unwrap();
        }
        let alive = store.alive_signals_for_hash("hash-a").await.unwrap();
        let reloaded: Vec<&SignalData> = alive.iter().map(|s| &s.data).collect();
        assert_eq!(reloaded.len(), kinds.len());
        for (stored, original) in reloaded.iter().zip(kinds.iter()) {
            assert_eq!(*stored, original);
        }
    }

    #[tokio::test]
    async fn execution_log_and_kill_is_atomic() {
        let store = Store::open_in_memory().unwrap();
        let signal_id = store
            .insert_signal(
                "hash-a",
                &SignalData::Time {
                    at: "2025-06-02T07:00:00Z".parse().unwrap(),
                },
            )
            .await
            .unwrap();

        let log_id = store
            .append_execution_log_and_kill(
                signal_id,
                &NewAutomationLog {
                    automation_hash: Some("hash-a".into()),
                    log_type: LogType::ExecuteSignal,
                    messages: vec![Message::user("fire")],
                    signaled_by: Some(SignalData::Time {
                        at: "2025-06-02T07:00:00Z".parse().unwrap(),
                    }),
                },
            )
            .await
            .unwrap();

        let entry = store.automation_log(log_id).await.unwrap().unwrap();
        assert_eq!(entry.log_type, LogType::ExecuteSignal);
        assert!(entry.signaled_by.is_some());
        assert!(store.signal(signal_id).await.unwrap().unwrap().is_dead);
    }

    #[tokio::test]
    async fn update_log_replaces_messages() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .append_automation_log(&NewAutomationLog {
                automation_hash: None,
                log_type: LogType::Manual,
                messages: vec![Message::user("hi")],
                signaled_by: None,
            })
            .await
            .unwrap();

        let grown = vec![
            Message::user("hi"),
            Message {
                role: Role::Assistant,
                content: vec![ContentPart::Text {
                    text: "hello".into(),
                }],
            },
        ];
        store.update_automation_log(id, &grown).await.unwrap();
        let entry = store.automation_log(id).await.unwrap().unwrap();
        assert_eq!(entry.messages.len(), 2);
    }

    #[tokio::test]
    async fn service_calls_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let log_id = store
            .append_automation_log(&NewAutomationLog {
                automation_hash: Some("hash-a".into()),
                log_type: LogType::ExecuteSignal,
                messages: vec![],
                signaled_by: None,
            })
            .await
            .unwrap();

        store
            .record_service_call(
                log_id,
                "light.turn_off",
                &serde_json::json!({"entity_id": "light.kitchen_counter"}),
                &serde_json::json!({}),
            )
            .await
            .unwrap();

        let calls = store.service_calls_for_log(log_id).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].service, "light.turn_off");
        assert_eq!(calls[0].target["entity_id"], "light.kitchen_counter");
    }

    #[tokio::test]
    async fn log_tail_keeps_latest() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..10 {
            store.append_log("info", &format!("line {i}")).await.unwrap();
        }
        let tail = store.tail_logs(3).await.unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].2, "line 7");
        assert_eq!(tail[2].2, "line 9");
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearth.db");
        {
            let store = Store::open(&path).unwrap();
            store.insert_signal("hash-a", &cron_data()).await.unwrap();
            store.checkpoint().await.unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.alive_signals_for_hash("hash-a").await.unwrap().len(), 1);
    }
}
