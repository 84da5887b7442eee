use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode};

use super::{BackendError, PatternBackend};
use crate::logging::{log, obj, v_num, Domain, Level};
use crate::record::{DataType, Direction, PatternRecord};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS patterns (
    id TEXT PRIMARY KEY,
    entry_signal_id TEXT NOT NULL,
    ts_ms INTEGER NOT NULL,
    instrument TEXT NOT NULL,
    direction TEXT NOT NULL,
    entry_type TEXT,
    session_id TEXT NOT NULL,
    data_type TEXT NOT NULL,
    dimension INTEGER NOT NULL,
    feature_vector BLOB NOT NULL,
    feature_names TEXT NOT NULL,
    pnl REAL NOT NULL,
    duration_bracket TEXT NOT NULL,
    move_type TEXT NOT NULL,
    outcome TEXT NOT NULL,
    trajectory TEXT NOT NULL,
    duration TEXT NOT NULL,
    movement TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_patterns_instrument_ts ON patterns (instrument, ts_ms);
";

fn map_sqlite(e: rusqlite::Error) -> BackendError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            BackendError::Conflict(e.to_string())
        }
        _ => BackendError::Unavailable(e.to_string()),
    }
}

fn encode_vector(vector: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_vector(blob: &[u8], dimension: usize) -> Option<Vec<f64>> {
    if blob.len() != dimension.checked_mul(8)? {
        return None;
    }
    let mut out = Vec::with_capacity(dimension);
    for chunk in blob.chunks_exact(8) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        out.push(f64::from_le_bytes(raw));
    }
    Some(out)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, BackendError> {
    serde_json::to_string(value).map_err(|e| BackendError::Unavailable(format!("encode: {}", e)))
}

/// Row as read from SQLite, before JSON columns are decoded.
struct RawRow {
    id: String,
    entry_signal_id: String,
    ts_ms: i64,
    instrument: String,
    direction: String,
    entry_type: Option<String>,
    session_id: String,
    data_type: String,
    dimension: i64,
    feature_vector: Vec<u8>,
    feature_names: String,
    outcome: String,
    trajectory: String,
    duration: String,
    movement: String,
}

impl RawRow {
    fn decode(self) -> Result<PatternRecord, BackendError> {
        let id = self.id;
        let corrupt = |reason: String| BackendError::Corrupt { id: id.clone(), reason };
        let dimension = usize::try_from(self.dimension).map_err(|_| corrupt("negative dimension".into()))?;
        let feature_vector = decode_vector(&self.feature_vector, dimension)
            .ok_or_else(|| corrupt(format!("vector blob of {} bytes for dimension {}", self.feature_vector.len(), dimension)))?;
        let direction = Direction::parse(&self.direction)
            .ok_or_else(|| corrupt(format!("unknown direction {}", self.direction)))?;
        let data_type = match self.data_type.as_str() {
            "training" => DataType::Training,
            "recent" => DataType::Recent,
            other => return Err(corrupt(format!("unknown data type {}", other))),
        };
        let json_err = |col: &str, e: serde_json::Error| corrupt(format!("{}: {}", col, e));
        Ok(PatternRecord {
            entry_signal_id: self.entry_signal_id,
            timestamp_ms: self.ts_ms,
            instrument: self.instrument,
            direction,
            entry_type: self.entry_type,
            session_id: self.session_id,
            data_type,
            schema_version: dimension as u32,
            feature_vector,
            feature_names: serde_json::from_str(&self.feature_names).map_err(|e| json_err("feature_names", e))?,
            outcome: serde_json::from_str(&self.outcome).map_err(|e| json_err("outcome", e))?,
            trajectory: serde_json::from_str(&self.trajectory).map_err(|e| json_err("trajectory", e))?,
            duration: serde_json::from_str(&self.duration).map_err(|e| json_err("duration", e))?,
            movement: serde_json::from_str(&self.movement).map_err(|e| json_err("movement", e))?,
            id,
        })
    }
}

pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| BackendError::Unavailable(e.to_string()))?;
            }
        }
        Ok(Self { conn: Connection::open(path).map_err(map_sqlite)? })
    }

    pub fn in_memory() -> Result<Self, BackendError> {
        Ok(Self { conn: Connection::open_in_memory().map_err(map_sqlite)? })
    }

    fn stored_dimension(&self) -> Result<Option<usize>, BackendError> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM schema_meta WHERE key = 'feature_dimension'")
            .map_err(map_sqlite)?;
        let mut rows = stmt.query([]).map_err(map_sqlite)?;
        match rows.next().map_err(map_sqlite)? {
            Some(row) => {
                let value: String = row.get(0).map_err(map_sqlite)?;
                Ok(value.parse().ok())
            }
            None => Ok(None),
        }
    }
}

impl PatternBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn open(&mut self, dimension: usize) -> Result<(), BackendError> {
        // Busy handling belongs to the retry policy, not to SQLite.
        self.conn.busy_timeout(Duration::ZERO).map_err(map_sqlite)?;
        let _mode: String = self
            .conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(map_sqlite)?;
        self.conn.execute_batch(SCHEMA_SQL).map_err(map_sqlite)?;

        if let Some(previous) = self.stored_dimension()? {
            if previous != dimension {
                log(
                    Level::Warn,
                    Domain::Store,
                    "schema_dimension_changed",
                    obj(&[
                        ("previous", v_num(previous as f64)),
                        ("configured", v_num(dimension as f64)),
                    ]),
                );
            }
        }
        self.conn
            .execute(
                "INSERT INTO schema_meta (key, value) VALUES ('feature_dimension', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![dimension.to_string()],
            )
            .map_err(map_sqlite)?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PatternRecord>, BackendError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, entry_signal_id, ts_ms, instrument, direction, entry_type, session_id,
                        data_type, dimension, feature_vector, feature_names, outcome, trajectory,
                        duration, movement
                 FROM patterns ORDER BY ts_ms, id",
            )
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RawRow {
                    id: row.get(0)?,
                    entry_signal_id: row.get(1)?,
                    ts_ms: row.get(2)?,
                    instrument: row.get(3)?,
                    direction: row.get(4)?,
                    entry_type: row.get(5)?,
                    session_id: row.get(6)?,
                    data_type: row.get(7)?,
                    dimension: row.get(8)?,
                    feature_vector: row.get(9)?,
                    feature_names: row.get(10)?,
                    outcome: row.get(11)?,
                    trajectory: row.get(12)?,
                    duration: row.get(13)?,
                    movement: row.get(14)?,
                })
            })
            .map_err(map_sqlite)?;

        let mut out = Vec::new();
        for raw in rows {
            out.push(raw.map_err(map_sqlite)?.decode()?);
        }
        Ok(out)
    }

    fn commit(&mut self, batch: &[PatternRecord]) -> Result<(), BackendError> {
        let tx = self.conn.transaction().map_err(map_sqlite)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO patterns (id, entry_signal_id, ts_ms, instrument, direction, entry_type,
                        session_id, data_type, dimension, feature_vector, feature_names, pnl,
                        duration_bracket, move_type, outcome, trajectory, duration, movement)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                )
                .map_err(map_sqlite)?;
            for rec in batch {
                stmt.execute(params![
                    rec.id,
                    rec.entry_signal_id,
                    rec.timestamp_ms,
                    rec.instrument,
                    rec.direction.as_str(),
                    rec.entry_type,
                    rec.session_id,
                    rec.data_type.as_str(),
                    rec.feature_vector.len() as i64,
                    encode_vector(&rec.feature_vector),
                    to_json(&rec.feature_names)?,
                    rec.outcome.pnl,
                    rec.duration.bracket.as_str(),
                    rec.movement.move_type.as_str(),
                    to_json(&rec.outcome)?,
                    to_json(&rec.trajectory)?,
                    to_json(&rec.duration)?,
                    to_json(&rec.movement)?,
                ])
                .map_err(map_sqlite)?;
            }
        }
        tx.commit().map_err(map_sqlite)
    }

    fn compact(&mut self) -> Result<(), BackendError> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .map_err(map_sqlite)?;
        self.conn.execute_batch("VACUUM;").map_err(map_sqlite)
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.conn.execute_batch("PRAGMA optimize;").map_err(map_sqlite)
    }
}
