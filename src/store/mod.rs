//! Vector store: write buffer, in-memory similarity index and the persisted
//! backend behind them.
//!
//! Records are decoded from the backend once, at `open`, and kept in a
//! timestamp-ordered index. New records sit in a FIFO buffer until the next
//! flush commits them; only then do they become searchable.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::time::Duration;

use crate::config::StoreConfig;
use crate::error::{StorageError, ValidationError};
use crate::logging::{log, log_flush, obj, v_num, v_str, Domain, Level, ProfileScope};
use crate::record::{DataType, Direction, PatternRecord};
use crate::similarity;

pub mod memory;
pub mod retry;
pub mod sqlite;

use retry::retry_with_backoff;

/// Scans check the deadline every this many candidates.
pub(crate) const DEADLINE_CHECK_INTERVAL: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl BackendError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, BackendError::Conflict(_))
    }
}

impl From<BackendError> for StorageError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Conflict(msg) => StorageError::RetriesExhausted { attempts: 1, last: msg },
            BackendError::Unavailable(msg) => StorageError::Unavailable(msg),
            BackendError::Corrupt { id, reason } => StorageError::Corrupt { id, reason },
        }
    }
}

/// Persistence seam. Implementations are single-writer.
pub trait PatternBackend: Send {
    fn name(&self) -> &'static str;
    /// Create or verify the layout for the configured vector dimension.
    fn open(&mut self, dimension: usize) -> Result<(), BackendError>;
    fn load_all(&self) -> Result<Vec<PatternRecord>, BackendError>;
    /// Commit a batch atomically: either every record lands or none does.
    fn commit(&mut self, batch: &[PatternRecord]) -> Result<(), BackendError>;
    fn compact(&mut self) -> Result<(), BackendError>;
    fn close(&mut self) -> Result<(), BackendError>;
}

/// Candidate filters and ranking knobs for a similarity query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimilarityQuery {
    pub instrument: Option<String>,
    pub direction: Option<Direction>,
    pub entry_type: Option<String>,
    pub data_type: Option<DataType>,
    pub session_id: Option<String>,
    /// Inclusive lower bound on record timestamp.
    pub from_ms: Option<i64>,
    /// Inclusive upper bound on record timestamp.
    pub to_ms: Option<i64>,
    pub limit: Option<usize>,
    pub similarity_threshold: Option<f64>,
}

impl SimilarityQuery {
    pub fn for_instrument(instrument: &str) -> Self {
        Self { instrument: Some(instrument.to_string()), ..Default::default() }
    }

    pub fn accepts(&self, rec: &PatternRecord) -> bool {
        if let Some(inst) = &self.instrument {
            if &rec.instrument != inst {
                return false;
            }
        }
        if let Some(dir) = self.direction {
            if rec.direction != dir {
                return false;
            }
        }
        if let Some(et) = &self.entry_type {
            if rec.entry_type.as_deref() != Some(et.as_str()) {
                return false;
            }
        }
        if let Some(dt) = self.data_type {
            if rec.data_type != dt {
                return false;
            }
        }
        if let Some(sid) = &self.session_id {
            if &rec.session_id != sid {
                return false;
            }
        }
        if let Some(from) = self.from_ms {
            if rec.timestamp_ms < from {
                return false;
            }
        }
        if let Some(to) = self.to_ms {
            if rec.timestamp_ms > to {
                return false;
            }
        }
        true
    }

    /// Narrow the time range to `[from, to]`.
    pub fn clamp_window(&mut self, from_ms: i64, to_ms: i64) {
        self.from_ms = Some(self.from_ms.map_or(from_ms, |f| f.max(from_ms)));
        self.to_ms = Some(self.to_ms.map_or(to_ms, |t| t.min(to_ms)));
    }
}

#[derive(Debug, Clone)]
pub struct SimilarMatch {
    pub record: Arc<PatternRecord>,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SimilarityResponse {
    pub matches: Vec<SimilarMatch>,
    pub candidates_scanned: usize,
    /// The scan deadline expired before every candidate was compared.
    pub truncated: bool,
}

pub struct VectorStore {
    cfg: StoreConfig,
    backend: Box<dyn PatternBackend>,
    index: Vec<Arc<PatternRecord>>,
    ids: HashSet<String>,
    buffer: VecDeque<PatternRecord>,
    pending_ids: HashSet<String>,
    flushes_since_compaction: u32,
    opened: bool,
}

impl VectorStore {
    pub fn new(cfg: StoreConfig, backend: Box<dyn PatternBackend>) -> Self {
        Self {
            cfg,
            backend,
            index: Vec::new(),
            ids: HashSet::new(),
            buffer: VecDeque::new(),
            pending_ids: HashSet::new(),
            flushes_since_compaction: 0,
            opened: false,
        }
    }

    pub fn open(&mut self) -> Result<(), StorageError> {
        self.backend.open(self.cfg.feature_dimension)?;
        let mut records = self.backend.load_all()?;
        records.sort_by(|a, b| a.timestamp_ms.cmp(&b.timestamp_ms).then_with(|| a.id.cmp(&b.id)));
        self.ids = records.iter().map(|r| r.id.clone()).collect();
        self.index = records.into_iter().map(Arc::new).collect();
        self.opened = true;
        log(
            Level::Info,
            Domain::Store,
            "opened",
            obj(&[
                ("backend", v_str(self.backend.name())),
                ("records", v_num(self.index.len() as f64)),
                ("dimension", v_num(self.cfg.feature_dimension as f64)),
            ]),
        );
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    /// Committed, searchable records in timestamp order.
    pub fn records(&self) -> &[Arc<PatternRecord>] {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id) || self.pending_ids.contains(id)
    }

    /// Buffer a record. Returns true when the buffer has reached batch size.
    pub fn append(&mut self, record: PatternRecord) -> Result<bool, ValidationError> {
        if self.contains(&record.id) {
            return Err(ValidationError::Duplicate { id: record.id });
        }
        self.pending_ids.insert(record.id.clone());
        self.buffer.push_back(record);
        Ok(self.buffer.len() >= self.cfg.batch_size)
    }

    /// Commit the whole buffer as one batch, retrying write conflicts.
    ///
    /// On failure the buffer is left intact so the next flush retries it.
    pub async fn flush(&mut self) -> Result<usize, StorageError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        let batch: Vec<PatternRecord> = self.buffer.iter().cloned().collect();
        let policy = self.cfg.retry.clone();
        let backend = &mut self.backend;
        let result = retry_with_backoff(&policy, "flush", BackendError::is_conflict, || {
            backend.commit(&batch)
        })
        .await;

        let attempts = match result {
            Ok(((), attempts)) => attempts,
            Err(e) => {
                log(
                    Level::Error,
                    Domain::Store,
                    "flush_failed",
                    obj(&[
                        ("records", v_num(batch.len() as f64)),
                        ("attempts", v_num(e.attempts as f64)),
                        ("error", v_str(&e.last.to_string())),
                    ]),
                );
                return Err(if e.retryable {
                    StorageError::RetriesExhausted { attempts: e.attempts, last: e.last.to_string() }
                } else {
                    e.last.into()
                });
            }
        };

        let committed = batch.len();
        self.buffer.clear();
        self.pending_ids.clear();
        for rec in batch {
            self.ids.insert(rec.id.clone());
            self.insert_indexed(Arc::new(rec));
        }
        log_flush(committed, attempts, started.elapsed().as_secs_f64() * 1000.0);

        self.flushes_since_compaction += 1;
        if self.cfg.compact_every_flushes > 0 && self.flushes_since_compaction >= self.cfg.compact_every_flushes {
            self.compact();
        }
        Ok(committed)
    }

    /// Compaction failures are logged, never fatal: the data is already committed.
    pub fn compact(&mut self) {
        self.flushes_since_compaction = 0;
        match self.backend.compact() {
            Ok(()) => log(Level::Info, Domain::Store, "compacted", obj(&[("backend", v_str(self.backend.name()))])),
            Err(e) => log(
                Level::Warn,
                Domain::Store,
                "compact_failed",
                obj(&[("error", v_str(&e.to_string()))]),
            ),
        }
    }

    pub async fn close(&mut self) -> Result<(), StorageError> {
        self.flush().await?;
        self.backend.close()?;
        self.opened = false;
        Ok(())
    }

    fn insert_indexed(&mut self, rec: Arc<PatternRecord>) {
        let pos = self.index.partition_point(|r| {
            (r.timestamp_ms, r.id.as_str()) <= (rec.timestamp_ms, rec.id.as_str())
        });
        self.index.insert(pos, rec);
    }

    /// Deadline for a scan starting now; `None` when scans are unbounded.
    pub fn scan_deadline(&self) -> Option<Instant> {
        if self.cfg.scan_deadline_ms == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(self.cfg.scan_deadline_ms))
        }
    }

    pub fn find_similar(&self, query: &[f64], q: &SimilarityQuery) -> SimilarityResponse {
        self.find_similar_until(query, q, self.scan_deadline())
    }

    /// Ranked scan, newest candidates first, stopping at `deadline`.
    pub fn find_similar_until(
        &self,
        query: &[f64],
        q: &SimilarityQuery,
        deadline: Option<Instant>,
    ) -> SimilarityResponse {
        let _scope = ProfileScope::with_context("find_similar", &[("candidates", json!(self.index.len()))]);
        let threshold = q.similarity_threshold.unwrap_or(self.cfg.similarity_threshold);
        let limit = q.limit.unwrap_or(self.cfg.default_limit);
        let mut matches = Vec::new();
        let mut scanned = 0;
        let mut truncated = false;

        for (i, rec) in self.index.iter().rev().enumerate() {
            if i % DEADLINE_CHECK_INTERVAL == 0 {
                if let Some(d) = deadline {
                    if Instant::now() >= d {
                        truncated = true;
                        break;
                    }
                }
            }
            if !q.accepts(rec) {
                continue;
            }
            scanned += 1;
            let sim = similarity::compare(query, &rec.feature_vector, self.cfg.schema_policy);
            if sim >= threshold {
                matches.push(SimilarMatch { record: Arc::clone(rec), similarity: sim });
            }
        }

        rank(&mut matches);
        matches.truncate(limit);

        if truncated {
            log(
                Level::Warn,
                Domain::Retrieval,
                "scan_deadline_exceeded",
                obj(&[
                    ("scanned", v_num(scanned as f64)),
                    ("total", v_num(self.index.len() as f64)),
                    ("deadline_ms", v_num(self.cfg.scan_deadline_ms as f64)),
                ]),
            );
        }

        SimilarityResponse { matches, candidates_scanned: scanned, truncated }
    }

    /// Up to `limit` records for `instrument` strictly before `before_ms`,
    /// oldest first.
    pub fn history(&self, instrument: &str, before_ms: i64, limit: usize) -> Vec<Arc<PatternRecord>> {
        let end = self.index.partition_point(|r| r.timestamp_ms < before_ms);
        let mut out: Vec<Arc<PatternRecord>> = self.index[..end]
            .iter()
            .rev()
            .filter(|r| r.instrument == instrument)
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        out
    }
}

/// Similarity descending, then newest first, then id.
pub fn rank(matches: &mut [SimilarMatch]) {
    matches.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.record.timestamp_ms.cmp(&a.record.timestamp_ms))
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;

    use crate::classifier::DurationClassifier;
    use crate::record::{derive_pattern_id, DataType, Direction, Outcome, PatternRecord, LIVE_SESSION};

    pub fn record(signal: &str, ts: i64, vector: Vec<f64>, pnl: f64) -> PatternRecord {
        let mut outcome = Outcome::with_pnl(pnl);
        outcome.holding_bars = Some(10);
        let (duration, movement) = DurationClassifier::default().classify(&outcome, &BTreeMap::new());
        PatternRecord {
            id: derive_pattern_id(signal, ts),
            entry_signal_id: signal.to_string(),
            timestamp_ms: ts,
            instrument: "MGC".to_string(),
            direction: Direction::Long,
            entry_type: None,
            session_id: LIVE_SESSION.to_string(),
            data_type: DataType::Recent,
            schema_version: vector.len() as u32,
            feature_names: (0..vector.len()).map(|i| format!("feature_{}", i)).collect(),
            feature_vector: vector,
            outcome,
            trajectory: BTreeMap::new(),
            duration,
            movement,
        }
    }
}
