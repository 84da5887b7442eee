//! Pattern memory facade.
//!
//! ```text
//! completed trade ──► codec ──► classifier ──► store buffer ──flush──► backend
//!
//! pending decision ──► codec ──► find_similar / extract_context
//!                                   │
//!                                   ▼
//!                          exposure gate + adjustment ──► confidence
//! ```
//!
//! The owner constructs one `PatternMemory`, calls `initialize`, and must
//! `close` it to flush what is still buffered.

pub mod duration;
pub mod evaluate;
pub mod health;

use crate::classifier::DurationClassifier;
use crate::codec::{EncodedFeatures, FeatureCodec, FeatureInput};
use crate::config::Config;
use crate::context::{ContextExtractor, ContextQuery, HistoricalContext};
use crate::error::{MemoryError, Result, StorageError, ValidationError};
use crate::exposure::{AdjustmentOutcome, BacktestSession, ExposureManager, ExposureQuery, PatternDecision};
use crate::logging::{log, obj, v_num, v_str, Domain, Level, ProfileScope};
use crate::record::{derive_pattern_id, normalize_instrument, CompletedTrade, PatternRecord};
use crate::store::sqlite::SqliteBackend;
use crate::store::{PatternBackend, SimilarityQuery, SimilarityResponse, VectorStore};

pub use duration::{DurationOutlook, DurationPrediction, DurationQuery};
pub use evaluate::{Evaluation, EvaluationRequest, Verdict};
pub use health::HealthReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Ready,
    Closed,
}

pub struct PatternMemory {
    cfg: Config,
    codec: FeatureCodec,
    classifier: DurationClassifier,
    store: VectorStore,
    context: ContextExtractor,
    exposure: ExposureManager,
    lifecycle: Lifecycle,
}

impl PatternMemory {
    /// Memory backed by the SQLite file at `cfg.store.sqlite_path`.
    pub fn open(cfg: Config) -> Result<Self> {
        let backend = SqliteBackend::new(&cfg.store.sqlite_path).map_err(StorageError::from)?;
        Ok(Self::with_backend(cfg, Box::new(backend)))
    }

    pub fn with_backend(cfg: Config, backend: Box<dyn PatternBackend>) -> Self {
        let exposure = ExposureManager::new(cfg.exposure.clone());
        Self::with_parts(cfg, backend, exposure)
    }

    /// Full control over the exposure manager, e.g. to inject a clock.
    pub fn with_parts(mut cfg: Config, backend: Box<dyn PatternBackend>, exposure: ExposureManager) -> Self {
        let codec = match &cfg.store.feature_schema {
            Some(names) => FeatureCodec::with_schema(names.iter().cloned()),
            None => FeatureCodec::new(cfg.store.feature_dimension),
        };
        if codec.dimension() != cfg.store.feature_dimension {
            log(
                Level::Warn,
                Domain::System,
                "dimension_from_schema",
                obj(&[
                    ("configured", v_num(cfg.store.feature_dimension as f64)),
                    ("schema", v_num(codec.dimension() as f64)),
                ]),
            );
            cfg.store.feature_dimension = codec.dimension();
        }
        Self {
            codec,
            classifier: DurationClassifier::new(cfg.classifier.clone()),
            store: VectorStore::new(cfg.store.clone(), backend),
            context: ContextExtractor::new(cfg.context.clone()),
            exposure,
            cfg,
            lifecycle: Lifecycle::Created,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn initialize(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Ready => return Ok(()),
            Lifecycle::Closed => return Err(MemoryError::Closed),
            Lifecycle::Created => {}
        }
        self.store.open()?;
        self.lifecycle = Lifecycle::Ready;
        log(
            Level::Info,
            Domain::System,
            "initialized",
            obj(&[
                ("records", v_num(self.store.len() as f64)),
                ("dimension", v_num(self.cfg.store.feature_dimension as f64)),
            ]),
        );
        Ok(())
    }

    /// Flush the buffer and release the backend. A failed flush leaves the
    /// memory open so the caller can retry.
    pub async fn close(&mut self) -> Result<()> {
        self.ensure_ready()?;
        self.store.close().await?;
        self.lifecycle = Lifecycle::Closed;
        log(Level::Info, Domain::System, "closed", obj(&[("records", v_num(self.store.len() as f64))]));
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Ready => Ok(()),
            Lifecycle::Created => Err(MemoryError::NotInitialized),
            Lifecycle::Closed => Err(MemoryError::Closed),
        }
    }

    fn instrument_key(&self, instrument: &str) -> String {
        if self.cfg.store.normalize_instruments {
            normalize_instrument(instrument)
        } else {
            instrument.trim().to_string()
        }
    }

    /// Committed records in timestamp order.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.store.pending()
    }

    pub fn encode(&self, features: &FeatureInput) -> EncodedFeatures {
        self.codec.encode(features)
    }

    /// Validate, label and buffer a completed trade. Returns the pattern id.
    ///
    /// The record becomes searchable after the flush that commits it; a full
    /// buffer is flushed before returning. If that flush fails the record
    /// stays buffered and `MemoryError::FlushDeferred` carries its id.
    pub async fn store(&mut self, trade: &CompletedTrade) -> Result<String> {
        self.ensure_ready()?;
        let valid = trade.validate()?;
        let instrument = self.instrument_key(&valid.instrument);
        if instrument.is_empty() {
            return Err(ValidationError::MissingField("instrument").into());
        }

        let encoded = self.codec.encode(&valid.features);
        let (duration, movement) = self.classifier.classify(&valid.outcome, &valid.trajectory);
        let session_id = trade
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.exposure.session_id())
            .to_string();

        let id = derive_pattern_id(&valid.entry_signal_id, valid.timestamp_ms);
        let record = PatternRecord {
            id: id.clone(),
            entry_signal_id: valid.entry_signal_id,
            timestamp_ms: valid.timestamp_ms,
            instrument,
            direction: trade.direction,
            entry_type: trade.entry_type.clone(),
            session_id,
            data_type: trade.data_type,
            schema_version: encoded.vector.len() as u32,
            feature_vector: encoded.vector,
            feature_names: encoded.names,
            outcome: valid.outcome,
            trajectory: valid.trajectory,
            duration,
            movement,
        };

        log(
            Level::Info,
            Domain::Ingest,
            "pattern_stored",
            obj(&[
                ("pattern_id", v_str(&record.id)),
                ("instrument", v_str(&record.instrument)),
                ("session_id", v_str(&record.session_id)),
                ("pnl", v_num(record.outcome.pnl)),
                ("bracket", v_str(record.duration.bracket.as_str())),
                ("move_type", v_str(record.movement.move_type.as_str())),
                ("dropped_features", v_num(encoded.dropped as f64)),
            ]),
        );

        if self.store.append(record)? {
            if let Err(source) = self.store.flush().await {
                return Err(MemoryError::FlushDeferred { id, source });
            }
        }
        Ok(id)
    }

    pub async fn flush(&mut self) -> Result<usize> {
        self.ensure_ready()?;
        Ok(self.store.flush().await?)
    }

    /// Ranked neighbors of `vector`. During a backtest only records inside
    /// the session window are candidates.
    pub fn find_similar(&self, vector: &[f64], mut query: SimilarityQuery) -> Result<SimilarityResponse> {
        self.ensure_ready()?;
        if let Some(inst) = query.instrument.take() {
            query.instrument = Some(self.instrument_key(&inst));
        }
        if let Some((start, end)) = self.exposure.active_window() {
            query.clamp_window(start, end);
        }
        Ok(self.store.find_similar(vector, &query))
    }

    pub fn predict_duration(&self, vector: &[f64], query: &DurationQuery) -> Result<DurationPrediction> {
        let sim = SimilarityQuery {
            instrument: query.instrument.clone(),
            direction: query.direction,
            entry_type: query.entry_type.clone(),
            limit: Some(query.limit.unwrap_or(self.cfg.duration.neighbor_limit)),
            similarity_threshold: Some(query.similarity_threshold.unwrap_or(f64::NEG_INFINITY)),
            ..SimilarityQuery::default()
        };
        let response = self.find_similar(vector, sim)?;
        let prediction = duration::predict(&response.matches, query.minimum_duration, &self.cfg.duration);
        log(
            Level::Debug,
            Domain::Retrieval,
            "duration_predicted",
            obj(&[
                ("neighbors", v_num(prediction.sample_size as f64)),
                ("confidence", v_num(prediction.confidence)),
                ("minimum_duration", v_num(query.minimum_duration)),
            ]),
        );
        Ok(prediction)
    }

    pub fn extract_context(&mut self, vector: &[f64], query: &ContextQuery) -> Result<HistoricalContext> {
        self.ensure_ready()?;
        let query = ContextQuery { instrument: self.instrument_key(&query.instrument), ..query.clone() };
        Ok(self.context.extract(&self.store, vector, &query))
    }

    pub fn start_backtest(&mut self, start_ms: i64, end_ms: i64, reset_learning: bool) -> Result<String> {
        self.ensure_ready()?;
        self.exposure.start_backtest(start_ms, end_ms, reset_learning)
    }

    pub fn start_backtest_session(
        &mut self,
        session_id: &str,
        start_ms: i64,
        end_ms: i64,
        reset_learning: bool,
    ) -> Result<()> {
        self.ensure_ready()?;
        self.exposure.start_backtest_session(session_id, start_ms, end_ms, reset_learning)
    }

    pub fn end_backtest(&mut self) -> Result<BacktestSession> {
        self.ensure_ready()?;
        Ok(self.exposure.end_backtest()?)
    }

    pub fn active_backtest(&self) -> Option<&BacktestSession> {
        self.exposure.active_session()
    }

    pub fn should_allow_pattern(
        &mut self,
        pattern_id: &str,
        pattern_ts_ms: i64,
        query: &ExposureQuery,
    ) -> Result<PatternDecision> {
        self.ensure_ready()?;
        Ok(self.exposure.should_allow_pattern(pattern_id, pattern_ts_ms, query))
    }

    pub fn apply_anti_overfitting_adjustment(
        &mut self,
        base_confidence: f64,
        entry_signal_id: &str,
        timestamp_ms: i64,
        features: Option<&[f64]>,
    ) -> Result<AdjustmentOutcome> {
        self.ensure_ready()?;
        Ok(self
            .exposure
            .apply_anti_overfitting_adjustment(base_confidence, entry_signal_id, timestamp_ms, features))
    }

    pub fn health_report(&self) -> Result<HealthReport> {
        self.ensure_ready()?;
        let _scope = ProfileScope::new("health_report");
        Ok(health::build(self.store.records(), self.store.pending()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::StoreConfig;
    use crate::record::{Outcome, TradeTimestamp};
    use crate::store::memory::MemoryBackend;
    use crate::store::retry::RetryPolicy;

    fn config() -> Config {
        Config {
            store: StoreConfig {
                feature_dimension: 3,
                retry: RetryPolicy::immediate(3),
                ..StoreConfig::default()
            },
            ..Config::default()
        }
    }

    fn memory() -> PatternMemory {
        let mut pm = PatternMemory::with_backend(config(), Box::new(MemoryBackend::new()));
        pm.initialize().unwrap();
        pm
    }

    fn trade(signal: &str, ts: i64, features: &[f64], pnl: f64) -> CompletedTrade {
        let mut outcome = Outcome::with_pnl(pnl);
        outcome.holding_bars = Some(10);
        CompletedTrade {
            entry_signal_id: Some(signal.into()),
            instrument: Some("MGC AUG25".into()),
            timestamp: Some(TradeTimestamp::Millis(ts)),
            features: Some(FeatureInput::from_values(features)),
            outcome: Some(outcome),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let mut pm = PatternMemory::with_backend(config(), Box::new(MemoryBackend::new()));
        assert!(matches!(pm.store(&trade("a", 1, &[1.0], 1.0)).await, Err(MemoryError::NotInitialized)));
        pm.initialize().unwrap();
        pm.close().await.unwrap();
        assert!(matches!(pm.find_similar(&[1.0], SimilarityQuery::default()), Err(MemoryError::Closed)));
        assert!(matches!(pm.initialize(), Err(MemoryError::Closed)));
    }

    #[tokio::test]
    async fn test_store_normalizes_and_labels() {
        let mut pm = memory();
        let id = pm.store(&trade("sig", 1_000, &[1.0, 0.0, 0.0], 25.0)).await.unwrap();
        assert_eq!(id, derive_pattern_id("sig", 1_000));
        assert_eq!(pm.pending(), 1);
        pm.flush().await.unwrap();

        let resp = pm.find_similar(&[1.0, 0.0, 0.0], SimilarityQuery::for_instrument("MGC SEP25")).unwrap();
        let rec = &resp.matches[0].record;
        assert_eq!(rec.instrument, "MGC");
        assert_eq!(rec.session_id, "live");
        assert_eq!(rec.schema_version, 3);
        assert_eq!(rec.duration.sustained_minutes, 10.0);
    }

    #[tokio::test]
    async fn test_duplicate_and_missing_fields_rejected() {
        let mut pm = memory();
        pm.store(&trade("sig", 1_000, &[1.0, 0.0, 0.0], 25.0)).await.unwrap();
        let dup = pm.store(&trade("sig", 1_000, &[0.0, 1.0, 0.0], -5.0)).await;
        assert!(matches!(dup, Err(MemoryError::Validation(ValidationError::Duplicate { .. }))));

        let mut t = trade("x", 2_000, &[1.0], 1.0);
        t.timestamp = None;
        assert!(matches!(
            pm.store(&t).await,
            Err(MemoryError::Validation(ValidationError::MissingField("timestamp")))
        ));
    }

    #[tokio::test]
    async fn test_backtest_session_tags_records_and_clamps_window() {
        let mut pm = memory();
        pm.store(&trade("before", 50, &[1.0, 0.0, 0.0], 1.0)).await.unwrap();
        let session = pm.start_backtest(100, 200, true).unwrap();
        pm.store(&trade("inside", 150, &[1.0, 0.0, 0.0], 1.0)).await.unwrap();
        pm.flush().await.unwrap();

        let resp = pm.find_similar(&[1.0, 0.0, 0.0], SimilarityQuery::default()).unwrap();
        assert_eq!(resp.matches.len(), 1);
        assert_eq!(resp.matches[0].record.session_id, session);

        pm.end_backtest().unwrap();
        let resp = pm.find_similar(&[1.0, 0.0, 0.0], SimilarityQuery::default()).unwrap();
        assert_eq!(resp.matches.len(), 2);
    }

    #[tokio::test]
    async fn test_full_batch_flushes_on_store() {
        let mut cfg = config();
        cfg.store.batch_size = 2;
        let mut pm = PatternMemory::with_backend(cfg, Box::new(MemoryBackend::new()));
        pm.initialize().unwrap();
        pm.store(&trade("a", 1, &[1.0, 0.0, 0.0], 1.0)).await.unwrap();
        assert_eq!(pm.len(), 0);
        pm.store(&trade("b", 2, &[1.0, 0.0, 0.0], 1.0)).await.unwrap();
        assert_eq!(pm.len(), 2);
        assert_eq!(pm.pending(), 0);
    }

    #[tokio::test]
    async fn test_trajectory_drives_sustained_minutes() {
        let mut pm = memory();
        let mut t = trade("traj", 10, &[1.0, 0.0, 0.0], 4.0);
        t.trajectory = Some(BTreeMap::from([(0, 1.0), (1, 2.0), (2, -1.0), (7, 4.0)]));
        pm.store(&t).await.unwrap();
        pm.flush().await.unwrap();
        let report = pm.health_report().unwrap();
        assert_eq!(report.total_records, 1);
        let resp = pm.find_similar(&[1.0, 0.0, 0.0], SimilarityQuery::default()).unwrap();
        assert_eq!(resp.matches[0].record.duration.sustained_minutes, 8.0);
    }

    #[tokio::test]
    async fn test_schema_keeps_partial_feature_sets_aligned() {
        let mut cfg = config();
        cfg.store.feature_dimension = 8;
        cfg.store.feature_schema = Some(vec!["c".into(), "a".into(), "b".into()]);
        let backend = MemoryBackend::new();
        let handle = backend.handle();
        let mut pm = PatternMemory::with_backend(cfg, Box::new(backend));
        pm.initialize().unwrap();
        assert_eq!(pm.config().store.feature_dimension, 3);
        assert_eq!(handle.dimension(), Some(3));

        let named = |signal: &str, ts: i64, pairs: [(&str, f64); 2]| CompletedTrade {
            features: Some(FeatureInput::from_named(pairs)),
            ..trade(signal, ts, &[], 1.0)
        };
        pm.store(&named("ac", 1, [("a", 1.0), ("c", 3.0)])).await.unwrap();
        pm.store(&named("bc", 2, [("b", 2.0), ("c", 3.0)])).await.unwrap();
        pm.flush().await.unwrap();

        let q = SimilarityQuery { similarity_threshold: Some(f64::NEG_INFINITY), ..SimilarityQuery::default() };
        let resp = pm.find_similar(&[1.0, 0.0, 0.0], q).unwrap();
        assert_eq!(resp.matches.len(), 2);
        for m in &resp.matches {
            assert_eq!(m.record.feature_names, ["a", "b", "c"]);
            assert_eq!(m.record.feature_vector[2], 3.0);
        }
        // Only the record carrying `a` points the same way as the query.
        assert_eq!(resp.matches[0].record.entry_signal_id, "ac");
        assert!(resp.matches[1].similarity < 0.8);
    }

    #[tokio::test]
    async fn test_failed_batch_flush_reports_buffered_id() {
        let mut cfg = config();
        cfg.store.batch_size = 1;
        let backend = MemoryBackend::new();
        let handle = backend.handle();
        let mut pm = PatternMemory::with_backend(cfg, Box::new(backend));
        pm.initialize().unwrap();
        handle.inject_conflicts(10);

        let t = trade("a", 1, &[1.0, 0.0, 0.0], 1.0);
        match pm.store(&t).await {
            Err(MemoryError::FlushDeferred { id, source }) => {
                assert_eq!(id, derive_pattern_id("a", 1));
                assert!(matches!(source, StorageError::RetriesExhausted { .. }));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(pm.pending(), 1);
        assert!(matches!(
            pm.store(&t).await,
            Err(MemoryError::Validation(ValidationError::Duplicate { .. }))
        ));

        handle.inject_conflicts(0);
        assert_eq!(pm.flush().await.unwrap(), 1);
        assert_eq!(handle.committed_len(), 1);
    }

    #[tokio::test]
    async fn test_close_flushes_buffer() {
        let backend = MemoryBackend::new();
        let handle = backend.handle();
        let mut pm = PatternMemory::with_backend(config(), Box::new(backend));
        pm.initialize().unwrap();
        pm.store(&trade("a", 1, &[1.0, 0.0, 0.0], 1.0)).await.unwrap();
        pm.close().await.unwrap();
        assert_eq!(handle.committed_len(), 1);
        assert!(handle.is_closed());
    }
}
