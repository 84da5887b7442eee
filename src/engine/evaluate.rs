//! Confidence for a pending decision: retrieve neighbors, gate each one for
//! exposure, weight the survivors, then adjust for the signal's own exposure.

use serde::{Deserialize, Serialize};

use super::PatternMemory;
use crate::codec::FeatureInput;
use crate::error::Result;
use crate::exposure::{AdjustmentOutcome, AdjustmentType, ExposureQuery};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::record::{Direction, TradeTimestamp};
use crate::store::SimilarityQuery;

/// Adjusted confidence at or above this supports the decision.
const SUPPORT_THRESHOLD: f64 = 0.6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRequest {
    pub entry_signal_id: String,
    pub instrument: String,
    pub timestamp: TradeTimestamp,
    pub features: FeatureInput,
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub entry_type: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub similarity_threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Supported,
    Weak,
    Suppressed,
    InsufficientData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatedMatch {
    pub pattern_id: String,
    pub timestamp_ms: i64,
    pub similarity: f64,
    pub pnl: f64,
    pub allowed: bool,
    pub confidence: f64,
    pub adjustment_type: AdjustmentType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub verdict: Verdict,
    /// Similarity- and penalty-weighted win rate of the allowed neighbors.
    pub base_confidence: f64,
    pub adjusted_confidence: f64,
    pub matches_considered: usize,
    pub matches_allowed: usize,
    pub truncated: bool,
    pub adjustment: Option<AdjustmentOutcome>,
    pub matches: Vec<EvaluatedMatch>,
}

fn verdict_for(base: f64, adjustment: &AdjustmentOutcome) -> Verdict {
    if adjustment.blocked || (base >= SUPPORT_THRESHOLD && adjustment.adjusted_confidence < SUPPORT_THRESHOLD) {
        Verdict::Suppressed
    } else if adjustment.adjusted_confidence >= SUPPORT_THRESHOLD {
        Verdict::Supported
    } else {
        Verdict::Weak
    }
}

impl PatternMemory {
    pub fn evaluate(&mut self, req: &EvaluationRequest) -> Result<Evaluation> {
        self.ensure_ready()?;
        let timestamp_ms = req.timestamp.to_millis()?;
        let vector = self.codec.encode(&req.features).vector;

        let query = SimilarityQuery {
            instrument: Some(req.instrument.clone()),
            direction: req.direction,
            entry_type: req.entry_type.clone(),
            limit: req.limit,
            similarity_threshold: req.similarity_threshold,
            ..SimilarityQuery::default()
        };
        let response = self.find_similar(&vector, query)?;
        let gate_query = ExposureQuery { features: Some(vector.clone()), timestamp_ms: Some(timestamp_ms) };

        let mut matches = Vec::with_capacity(response.matches.len());
        let (mut weight_sum, mut win_weight) = (0.0, 0.0);
        for m in &response.matches {
            let decision = self.exposure.should_allow_pattern(&m.record.id, m.record.timestamp_ms, &gate_query);
            if decision.allowed {
                let w = m.similarity.max(0.0) * decision.confidence;
                weight_sum += w;
                if m.record.is_win() {
                    win_weight += w;
                }
            }
            matches.push(EvaluatedMatch {
                pattern_id: m.record.id.clone(),
                timestamp_ms: m.record.timestamp_ms,
                similarity: m.similarity,
                pnl: m.record.outcome.pnl,
                allowed: decision.allowed,
                confidence: decision.confidence,
                adjustment_type: decision.adjustment_type,
            });
        }
        let matches_allowed = matches.iter().filter(|m| m.allowed).count();

        let insufficient = matches_allowed < self.cfg.duration.min_samples.max(1) || weight_sum <= 0.0;
        let (verdict, base, adjustment) = if insufficient {
            (Verdict::InsufficientData, 0.0, None)
        } else {
            let base = win_weight / weight_sum;
            let adj = self
                .exposure
                .apply_anti_overfitting_adjustment(base, &req.entry_signal_id, timestamp_ms, Some(&vector));
            (verdict_for(base, &adj), base, Some(adj))
        };
        let adjusted = adjustment.as_ref().map(|a| a.adjusted_confidence).unwrap_or(0.0);

        log(
            Level::Info,
            Domain::Retrieval,
            "evaluated",
            obj(&[
                ("instrument", v_str(&req.instrument)),
                ("verdict", serde_json::to_value(verdict).unwrap_or_default()),
                ("base", v_num(base)),
                ("adjusted", v_num(adjusted)),
                ("considered", v_num(matches.len() as f64)),
                ("allowed", v_num(matches_allowed as f64)),
            ]),
        );

        Ok(Evaluation {
            verdict,
            base_confidence: base,
            adjusted_confidence: adjusted,
            matches_considered: matches.len(),
            matches_allowed,
            truncated: response.truncated,
            adjustment,
            matches,
        })
    }
}
