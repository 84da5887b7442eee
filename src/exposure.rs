//! Anti-overfitting exposure accounting.
//!
//! Every pattern that is allowed to inform a decision gains one unit of
//! exposure inside the current session partition. Patterns that have been
//! leaned on too often are penalized or excluded. Backtests run in their own
//! partition with a fixed time window and no decay; live exposure decays with
//! a configurable half-life.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::ExposureConfig;
use crate::error::{ExposureError, MemoryError, ValidationError};
use crate::logging::{log, log_backtest_transition, log_exposure_decision, obj, v_str, Domain, Level};
use crate::record::{derive_pattern_id, LIVE_SESSION};

const SHARED_PARTITION: &str = "shared";
/// Decayed live entries below this are forgotten.
const PRUNE_EPSILON: f64 = 1e-3;
/// Live partitions are swept every this many counted uses.
const PRUNE_INTERVAL: u64 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverexposurePolicy {
    /// Keep the pattern but scale its confidence down by the excess.
    Penalize,
    /// Refuse the pattern outright.
    Exclude,
}

impl FromStr for OverexposurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "penalize" => Ok(OverexposurePolicy::Penalize),
            "exclude" => Ok(OverexposurePolicy::Exclude),
            other => Err(format!("unknown overexposure policy: {}", other)),
        }
    }
}

/// What `start_backtest` does when a session is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Reject,
    Restart,
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(RestartPolicy::Reject),
            "restart" => Ok(RestartPolicy::Restart),
            other => Err(format!("unknown restart policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentType {
    None,
    OverexposurePenalty,
    OverexposureExcluded,
    Lookahead,
    OutsideWindow,
}

impl AdjustmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentType::None => "none",
            AdjustmentType::OverexposurePenalty => "overexposure_penalty",
            AdjustmentType::OverexposureExcluded => "overexposure_excluded",
            AdjustmentType::Lookahead => "lookahead",
            AdjustmentType::OutsideWindow => "outside_window",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestSession {
    pub session_id: String,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl BacktestSession {
    pub fn contains(&self, ts_ms: i64) -> bool {
        ts_ms >= self.start_ms && ts_ms <= self.end_ms
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Mode {
    Idle,
    BacktestActive(BacktestSession),
}

/// The decision being made when a pattern is consulted.
#[derive(Debug, Clone, Default)]
pub struct ExposureQuery {
    pub features: Option<Vec<f64>>,
    /// Time of the decision; patterns at or after it are look-ahead.
    pub timestamp_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternDecision {
    pub allowed: bool,
    /// Exposure before this decision was counted.
    pub exposure: f64,
    /// Multiplier in `[0, 1]` to apply to anything derived from the pattern.
    pub confidence: f64,
    pub adjustment_type: AdjustmentType,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentOutcome {
    pub base_confidence: f64,
    pub adjusted_confidence: f64,
    pub blocked: bool,
    pub exposure: f64,
    pub adjustment_type: AdjustmentType,
    pub reason: String,
}

#[derive(Debug, Clone, Copy)]
struct ExposureEntry {
    value: f64,
    updated_ms: i64,
}

pub type Clock = Box<dyn Fn() -> i64 + Send + Sync>;

pub struct ExposureManager {
    cfg: ExposureConfig,
    mode: Mode,
    partitions: HashMap<String, HashMap<String, ExposureEntry>>,
    /// Ended backtest partitions, oldest first.
    ended: VecDeque<String>,
    bumps: u64,
    clock: Clock,
}

impl ExposureManager {
    pub fn new(cfg: ExposureConfig) -> Self {
        Self::with_clock(cfg, Box::new(|| chrono::Utc::now().timestamp_millis()))
    }

    /// Manager reading wall-clock time from `clock` (epoch millis).
    pub fn with_clock(cfg: ExposureConfig, clock: Clock) -> Self {
        Self {
            cfg,
            mode: Mode::Idle,
            partitions: HashMap::new(),
            ended: VecDeque::new(),
            bumps: 0,
            clock,
        }
    }

    pub fn config(&self) -> &ExposureConfig {
        &self.cfg
    }

    pub fn is_backtest_active(&self) -> bool {
        matches!(self.mode, Mode::BacktestActive(_))
    }

    pub fn active_session(&self) -> Option<&BacktestSession> {
        match &self.mode {
            Mode::BacktestActive(s) => Some(s),
            Mode::Idle => None,
        }
    }

    /// Inclusive `[start, end]` of the running backtest.
    pub fn active_window(&self) -> Option<(i64, i64)> {
        self.active_session().map(|s| (s.start_ms, s.end_ms))
    }

    /// Session id new records and exposure are attributed to.
    pub fn session_id(&self) -> &str {
        self.active_session().map(|s| s.session_id.as_str()).unwrap_or(LIVE_SESSION)
    }

    fn partition_key(&self) -> String {
        if self.cfg.share_across_sessions {
            SHARED_PARTITION.to_string()
        } else {
            self.session_id().to_string()
        }
    }

    pub fn start_backtest(&mut self, start_ms: i64, end_ms: i64, reset_learning: bool) -> Result<String, MemoryError> {
        let session_id = format!("bt:{}:{}", start_ms, end_ms);
        self.start_backtest_session(&session_id, start_ms, end_ms, reset_learning)?;
        Ok(session_id)
    }

    pub fn start_backtest_session(
        &mut self,
        session_id: &str,
        start_ms: i64,
        end_ms: i64,
        reset_learning: bool,
    ) -> Result<(), MemoryError> {
        if start_ms > end_ms {
            return Err(ValidationError::InvalidWindow { start_ms, end_ms }.into());
        }
        if let Mode::BacktestActive(current) = &self.mode {
            match self.cfg.restart_policy {
                RestartPolicy::Reject => {
                    return Err(ExposureError::BacktestAlreadyActive { session_id: current.session_id.clone() }.into());
                }
                RestartPolicy::Restart => {
                    log_backtest_transition("backtest_abandoned", &current.session_id, current.start_ms, current.end_ms, false);
                    let abandoned = current.session_id.clone();
                    self.retire_partition(abandoned);
                }
            }
        }

        self.ended.retain(|k| k != session_id);
        self.mode = Mode::BacktestActive(BacktestSession { session_id: session_id.to_string(), start_ms, end_ms });
        if reset_learning {
            let key = self.partition_key();
            self.partitions.remove(&key);
        }
        log_backtest_transition("backtest_started", session_id, start_ms, end_ms, reset_learning);
        Ok(())
    }

    pub fn end_backtest(&mut self) -> Result<BacktestSession, ExposureError> {
        match std::mem::replace(&mut self.mode, Mode::Idle) {
            Mode::BacktestActive(session) => {
                log_backtest_transition("backtest_ended", &session.session_id, session.start_ms, session.end_ms, false);
                self.retire_partition(session.session_id.clone());
                Ok(session)
            }
            Mode::Idle => Err(ExposureError::BacktestNotActive),
        }
    }

    /// Queue an ended session's partition, dropping the oldest beyond the
    /// retention limit. The shared partition is never dropped.
    fn retire_partition(&mut self, session_id: String) {
        if self.cfg.share_across_sessions || session_id == LIVE_SESSION {
            return;
        }
        self.ended.retain(|k| k != &session_id);
        self.ended.push_back(session_id);
        while self.ended.len() > self.cfg.retained_backtest_partitions {
            if let Some(old) = self.ended.pop_front() {
                self.partitions.remove(&old);
            }
        }
    }

    /// Number of partitions holding exposure, live included.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Patterns tracked in the active partition.
    pub fn tracked_patterns(&self) -> usize {
        self.partitions.get(&self.partition_key()).map_or(0, |p| p.len())
    }

    /// Forget live entries whose decayed exposure fell below `PRUNE_EPSILON`.
    /// Returns how many were removed. No-op while a backtest runs.
    pub fn prune_decayed(&mut self) -> usize {
        if self.is_backtest_active() || self.cfg.live_half_life_secs == 0 {
            return 0;
        }
        let key = self.partition_key();
        let Some(mut partition) = self.partitions.remove(&key) else {
            return 0;
        };
        let before = partition.len();
        partition.retain(|_, e| self.decayed(e) >= PRUNE_EPSILON);
        let removed = before - partition.len();
        if !partition.is_empty() {
            self.partitions.insert(key, partition);
        }
        removed
    }

    /// Current exposure of `pattern_id` in the active partition, with live
    /// decay applied.
    pub fn exposure_of(&self, pattern_id: &str) -> f64 {
        let key = self.partition_key();
        self.partitions
            .get(&key)
            .and_then(|p| p.get(pattern_id))
            .map(|e| self.decayed(e))
            .unwrap_or(0.0)
    }

    fn decayed(&self, entry: &ExposureEntry) -> f64 {
        if self.is_backtest_active() || self.cfg.live_half_life_secs == 0 {
            return entry.value;
        }
        let elapsed_ms = ((self.clock)() - entry.updated_ms).max(0) as f64;
        let half_life_ms = self.cfg.live_half_life_secs as f64 * 1000.0;
        entry.value * 0.5_f64.powf(elapsed_ms / half_life_ms)
    }

    fn bump(&mut self, pattern_id: &str) {
        let current = self.exposure_of(pattern_id);
        let now = (self.clock)();
        let key = self.partition_key();
        self.partitions
            .entry(key)
            .or_default()
            .insert(pattern_id.to_string(), ExposureEntry { value: current + 1.0, updated_ms: now });
        self.bumps += 1;
        if self.bumps % PRUNE_INTERVAL == 0 {
            self.prune_decayed();
        }
    }

    /// Gate one pattern for the decision described by `query`.
    pub fn should_allow_pattern(&mut self, pattern_id: &str, pattern_ts_ms: i64, query: &ExposureQuery) -> PatternDecision {
        let decision = self.gate(pattern_id, pattern_ts_ms, query.timestamp_ms);
        log_exposure_decision(
            pattern_id,
            self.session_id(),
            decision.allowed,
            decision.exposure,
            decision.adjustment_type.as_str(),
            &fingerprint(query.features.as_deref()),
        );
        decision
    }

    fn gate(&mut self, pattern_id: &str, pattern_ts_ms: i64, query_ts_ms: Option<i64>) -> PatternDecision {
        let exposure = self.exposure_of(pattern_id);
        let blocked = |adjustment_type, reason: String| PatternDecision {
            allowed: false,
            exposure,
            confidence: 0.0,
            adjustment_type,
            reason,
        };

        if let Some(session) = self.active_session() {
            if !session.contains(pattern_ts_ms) {
                return blocked(
                    AdjustmentType::OutsideWindow,
                    format!(
                        "pattern at {} outside backtest window [{}, {}]",
                        pattern_ts_ms, session.start_ms, session.end_ms
                    ),
                );
            }
        }
        if let Some(query_ts) = query_ts_ms {
            if pattern_ts_ms >= query_ts {
                return blocked(
                    AdjustmentType::Lookahead,
                    format!("pattern at {} is not before decision at {}", pattern_ts_ms, query_ts),
                );
            }
        }

        // Excess counts the use being decided on.
        let excess = exposure + 1.0 - self.cfg.threshold;
        let (confidence, adjustment_type, reason) = if excess > 0.0 {
            match self.cfg.policy {
                OverexposurePolicy::Exclude => {
                    return blocked(
                        AdjustmentType::OverexposureExcluded,
                        format!("exposure {:.2} reached threshold {:.2}", exposure, self.cfg.threshold),
                    );
                }
                OverexposurePolicy::Penalize => (
                    (1.0 - self.cfg.penalty_per_exposure * excess).clamp(0.0, 1.0),
                    AdjustmentType::OverexposurePenalty,
                    format!("exposure {:.2} exceeds threshold {:.2} by {:.2}", exposure, self.cfg.threshold, excess),
                ),
            }
        } else {
            (1.0, AdjustmentType::None, "within exposure budget".to_string())
        };

        self.bump(pattern_id);
        PatternDecision { allowed: true, exposure, confidence, adjustment_type, reason }
    }

    /// Scale `base_confidence` by the exposure of the signal's own pattern.
    ///
    /// The result never exceeds the base; a blocked signal yields 0.
    pub fn apply_anti_overfitting_adjustment(
        &mut self,
        base_confidence: f64,
        entry_signal_id: &str,
        timestamp_ms: i64,
        features: Option<&[f64]>,
    ) -> AdjustmentOutcome {
        let base = if base_confidence.is_finite() { base_confidence.clamp(0.0, 1.0) } else { 0.0 };
        let pattern_id = derive_pattern_id(entry_signal_id, timestamp_ms);
        // The signal is judged at its own timestamp, so look-ahead does not apply.
        let decision = self.gate(&pattern_id, timestamp_ms, None);
        let adjusted = if decision.allowed { (base * decision.confidence).min(base) } else { 0.0 };

        log(
            Level::Debug,
            Domain::Exposure,
            "confidence_adjusted",
            obj(&[
                ("pattern_id", v_str(&pattern_id)),
                ("session_id", v_str(self.session_id())),
                ("base", serde_json::json!(base)),
                ("adjusted", serde_json::json!(adjusted)),
                ("adjustment", v_str(decision.adjustment_type.as_str())),
                ("query", v_str(&fingerprint(features))),
            ]),
        );

        AdjustmentOutcome {
            base_confidence: base,
            adjusted_confidence: adjusted,
            blocked: !decision.allowed,
            exposure: decision.exposure,
            adjustment_type: decision.adjustment_type,
            reason: decision.reason,
        }
    }
}

/// Short stable digest of a query vector for log correlation.
pub fn fingerprint(features: Option<&[f64]>) -> String {
    match features {
        None => "none".to_string(),
        Some(values) => {
            let mut hasher = Sha256::new();
            for v in values {
                hasher.update(v.to_le_bytes());
            }
            hex::encode(&hasher.finalize()[..6])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    fn manager(cfg: ExposureConfig) -> (ExposureManager, Arc<AtomicI64>) {
        let now = Arc::new(AtomicI64::new(1_000_000));
        let clock = Arc::clone(&now);
        let mgr = ExposureManager::with_clock(cfg, Box::new(move || clock.load(Ordering::SeqCst)));
        (mgr, now)
    }

    #[test]
    fn test_state_machine_transitions() {
        let (mut mgr, _) = manager(ExposureConfig::default());
        assert!(matches!(mgr.end_backtest(), Err(ExposureError::BacktestNotActive)));

        let id = mgr.start_backtest(100, 200, false).unwrap();
        assert_eq!(id, "bt:100:200");
        assert_eq!(mgr.session_id(), "bt:100:200");
        assert_eq!(mgr.active_window(), Some((100, 200)));

        let again = mgr.start_backtest(300, 400, false);
        assert!(matches!(again, Err(MemoryError::Exposure(ExposureError::BacktestAlreadyActive { .. }))));

        let ended = mgr.end_backtest().unwrap();
        assert_eq!(ended.session_id, "bt:100:200");
        assert_eq!(mgr.session_id(), LIVE_SESSION);
    }

    #[test]
    fn test_restart_policy_replaces_session() {
        let cfg = ExposureConfig { restart_policy: RestartPolicy::Restart, ..ExposureConfig::default() };
        let (mut mgr, _) = manager(cfg);
        mgr.start_backtest(100, 200, false).unwrap();
        mgr.start_backtest(300, 400, false).unwrap();
        assert_eq!(mgr.active_window(), Some((300, 400)));
    }

    #[test]
    fn test_inverted_window_rejected() {
        let (mut mgr, _) = manager(ExposureConfig::default());
        let err = mgr.start_backtest(500, 100, false).unwrap_err();
        assert!(matches!(err, MemoryError::Validation(ValidationError::InvalidWindow { .. })));
        assert!(!mgr.is_backtest_active());
    }

    #[test]
    fn test_lookahead_and_window_blocked() {
        let (mut mgr, _) = manager(ExposureConfig::default());
        mgr.start_backtest(100, 200, false).unwrap();
        let q = ExposureQuery { features: None, timestamp_ms: Some(150) };

        let d = mgr.should_allow_pattern("p1", 150, &q);
        assert!(!d.allowed);
        assert_eq!(d.adjustment_type, AdjustmentType::Lookahead);

        let d = mgr.should_allow_pattern("p1", 50, &q);
        assert_eq!(d.adjustment_type, AdjustmentType::OutsideWindow);

        let d = mgr.should_allow_pattern("p1", 120, &q);
        assert!(d.allowed);
        assert_eq!(d.confidence, 1.0);
        assert_eq!(mgr.exposure_of("p1"), 1.0);
    }

    #[test]
    fn test_penalty_grows_with_excess() {
        let (mut mgr, _) = manager(ExposureConfig::default());
        mgr.start_backtest(0, 1_000, false).unwrap();
        let q = ExposureQuery::default();
        let confidences: Vec<f64> = (0..5).map(|_| mgr.should_allow_pattern("p", 10, &q).confidence).collect();
        assert_eq!(&confidences[..3], &[1.0, 1.0, 1.0]);
        assert!((confidences[3] - 0.85).abs() < 1e-9);
        assert!((confidences[4] - 0.70).abs() < 1e-9);
    }

    #[test]
    fn test_exclude_policy_blocks_at_threshold() {
        let cfg = ExposureConfig { policy: OverexposurePolicy::Exclude, threshold: 2.0, ..ExposureConfig::default() };
        let (mut mgr, _) = manager(cfg);
        let q = ExposureQuery::default();
        assert!(mgr.should_allow_pattern("p", 10, &q).allowed);
        assert!(mgr.should_allow_pattern("p", 10, &q).allowed);
        let d = mgr.should_allow_pattern("p", 10, &q);
        assert!(!d.allowed);
        assert_eq!(d.adjustment_type, AdjustmentType::OverexposureExcluded);
        // Blocked uses are not counted.
        assert_eq!(mgr.exposure_of("p"), 2.0);
    }

    #[test]
    fn test_adjustment_drops_then_resets_with_new_session() {
        let (mut mgr, _) = manager(ExposureConfig::default());
        mgr.start_backtest(0, 10_000, false).unwrap();
        let mut last = 0.0;
        for _ in 0..4 {
            last = mgr.apply_anti_overfitting_adjustment(0.8, "sig-1", 500, None).adjusted_confidence;
        }
        assert!(last < 0.8);

        mgr.end_backtest().unwrap();
        mgr.start_backtest(0, 10_000, true).unwrap();
        let out = mgr.apply_anti_overfitting_adjustment(0.8, "sig-1", 500, None);
        assert_eq!(out.adjusted_confidence, 0.8);
        assert!(!out.blocked);
    }

    #[test]
    fn test_adjustment_outside_window_is_zero() {
        let (mut mgr, _) = manager(ExposureConfig::default());
        mgr.start_backtest(0, 100, false).unwrap();
        let out = mgr.apply_anti_overfitting_adjustment(0.9, "sig-1", 500, Some(&[1.0, 2.0]));
        assert!(out.blocked);
        assert_eq!(out.adjusted_confidence, 0.0);
    }

    #[test]
    fn test_sessions_are_partitioned() {
        let (mut mgr, _) = manager(ExposureConfig::default());
        let q = ExposureQuery::default();
        mgr.should_allow_pattern("p", 10, &q);
        assert_eq!(mgr.exposure_of("p"), 1.0);
        mgr.start_backtest(0, 100, false).unwrap();
        assert_eq!(mgr.exposure_of("p"), 0.0);
        mgr.end_backtest().unwrap();
        assert_eq!(mgr.exposure_of("p"), 1.0);
    }

    #[test]
    fn test_shared_partition_spans_sessions() {
        let cfg = ExposureConfig { share_across_sessions: true, ..ExposureConfig::default() };
        let (mut mgr, _) = manager(cfg);
        mgr.should_allow_pattern("p", 10, &ExposureQuery::default());
        mgr.start_backtest(0, 100, false).unwrap();
        assert_eq!(mgr.exposure_of("p"), 1.0);
    }

    #[test]
    fn test_live_exposure_decays_by_half_life() {
        let cfg = ExposureConfig { live_half_life_secs: 60, ..ExposureConfig::default() };
        let (mut mgr, now) = manager(cfg);
        mgr.should_allow_pattern("p", 10, &ExposureQuery::default());
        now.fetch_add(60_000, Ordering::SeqCst);
        assert!((mgr.exposure_of("p") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_ended_partitions_bounded() {
        let cfg = ExposureConfig { retained_backtest_partitions: 1, ..ExposureConfig::default() };
        let (mut mgr, _) = manager(cfg);
        let q = ExposureQuery::default();
        for window in [(0, 100), (200, 300), (400, 500)] {
            mgr.start_backtest(window.0, window.1, false).unwrap();
            mgr.should_allow_pattern("p", window.0 + 10, &q);
            mgr.end_backtest().unwrap();
        }
        assert_eq!(mgr.partition_count(), 1);

        // The most recent session can still be resumed without a reset.
        mgr.start_backtest(400, 500, false).unwrap();
        assert_eq!(mgr.exposure_of("p"), 1.0);
        mgr.end_backtest().unwrap();
        mgr.start_backtest(0, 100, false).unwrap();
        assert_eq!(mgr.exposure_of("p"), 0.0);
    }

    #[test]
    fn test_ended_partition_dropped_without_retention() {
        let cfg = ExposureConfig { retained_backtest_partitions: 0, ..ExposureConfig::default() };
        let (mut mgr, _) = manager(cfg);
        mgr.start_backtest(0, 100, false).unwrap();
        mgr.should_allow_pattern("p", 10, &ExposureQuery::default());
        assert_eq!(mgr.partition_count(), 1);
        mgr.end_backtest().unwrap();
        assert_eq!(mgr.partition_count(), 0);
    }

    #[test]
    fn test_shared_partition_survives_end() {
        let cfg = ExposureConfig {
            share_across_sessions: true,
            retained_backtest_partitions: 0,
            ..ExposureConfig::default()
        };
        let (mut mgr, _) = manager(cfg);
        mgr.start_backtest(0, 100, false).unwrap();
        mgr.should_allow_pattern("p", 10, &ExposureQuery::default());
        mgr.end_backtest().unwrap();
        assert_eq!(mgr.exposure_of("p"), 1.0);
    }

    #[test]
    fn test_decayed_live_entries_pruned() {
        let cfg = ExposureConfig { live_half_life_secs: 60, ..ExposureConfig::default() };
        let (mut mgr, now) = manager(cfg);
        let q = ExposureQuery::default();
        for id in ["a", "b", "c"] {
            mgr.should_allow_pattern(id, 10, &q);
        }
        assert_eq!(mgr.prune_decayed(), 0);
        assert_eq!(mgr.tracked_patterns(), 3);

        // Twenty half-lives leave about 1e-6 of each unit.
        now.fetch_add(20 * 60_000, Ordering::SeqCst);
        mgr.should_allow_pattern("a", 10, &q);
        assert_eq!(mgr.prune_decayed(), 2);
        assert_eq!(mgr.tracked_patterns(), 1);
        assert!((mgr.exposure_of("a") - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_pruning_sweeps_during_use() {
        let cfg = ExposureConfig { live_half_life_secs: 1, ..ExposureConfig::default() };
        let (mut mgr, now) = manager(cfg);
        let q = ExposureQuery::default();
        for i in 0..PRUNE_INTERVAL {
            mgr.should_allow_pattern(&format!("p{}", i), 10, &q);
            now.fetch_add(60_000, Ordering::SeqCst);
        }
        // The sweep on the last use kept only that pattern.
        assert_eq!(mgr.tracked_patterns(), 1);
    }

    #[test]
    fn test_negative_base_clamped() {
        let cfg = ExposureConfig { policy: OverexposurePolicy::Exclude, threshold: 1.0, ..ExposureConfig::default() };
        let (mut mgr, _) = manager(cfg);
        let first = mgr.apply_anti_overfitting_adjustment(-0.5, "sig", 10, None);
        assert_eq!(first.base_confidence, 0.0);
        assert_eq!(first.adjusted_confidence, 0.0);
        let blocked = mgr.apply_anti_overfitting_adjustment(-0.5, "sig", 10, None);
        assert!(blocked.blocked);
        assert!(blocked.adjusted_confidence <= blocked.base_confidence);
        let high = mgr.apply_anti_overfitting_adjustment(1.7, "other", 10, None);
        assert_eq!(high.adjusted_confidence, 1.0);
    }

    #[test]
    fn test_fingerprint_stable() {
        assert_eq!(fingerprint(None), "none");
        let a = fingerprint(Some(&[1.0, 2.0]));
        assert_eq!(a, fingerprint(Some(&[1.0, 2.0])));
        assert_ne!(a, fingerprint(Some(&[2.0, 1.0])));
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("exclude".parse::<OverexposurePolicy>(), Ok(OverexposurePolicy::Exclude));
        assert_eq!("restart".parse::<RestartPolicy>(), Ok(RestartPolicy::Restart));
        assert!("later".parse::<RestartPolicy>().is_err());
    }
}
