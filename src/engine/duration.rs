//! Duration outlook from the nearest historical neighbors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::classifier::DurationBracket;
use crate::config::DurationConfig;
use crate::record::Direction;
use crate::store::SimilarMatch;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DurationQuery {
    pub instrument: Option<String>,
    pub direction: Option<Direction>,
    pub entry_type: Option<String>,
    /// Minutes a neighbor must have stayed profitable to count as sustained.
    pub minimum_duration: f64,
    pub limit: Option<usize>,
    /// Neighbors are ranked but not thresholded unless this is set.
    pub similarity_threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DurationOutlook {
    Sustained,
    Mixed,
    ShortLived,
    InsufficientData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DurationPrediction {
    pub recommendation: DurationOutlook,
    /// Share of neighbors sustained for at least the minimum duration.
    pub confidence: f64,
    pub sample_size: usize,
    pub minimum_duration: f64,
    pub median_sustained_minutes: Option<f64>,
    pub expected_bracket: Option<DurationBracket>,
    /// Bracket label to share of neighbors.
    pub bracket_distribution: BTreeMap<String, f64>,
    pub average_similarity: f64,
}

impl DurationPrediction {
    pub fn insufficient(sample_size: usize, minimum_duration: f64) -> Self {
        Self {
            recommendation: DurationOutlook::InsufficientData,
            confidence: 0.0,
            sample_size,
            minimum_duration,
            median_sustained_minutes: None,
            expected_bracket: None,
            bracket_distribution: BTreeMap::new(),
            average_similarity: 0.0,
        }
    }
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 { (values[mid - 1] + values[mid]) / 2.0 } else { values[mid] })
}

pub fn predict(neighbors: &[SimilarMatch], minimum_duration: f64, cfg: &DurationConfig) -> DurationPrediction {
    let n = neighbors.len();
    if n == 0 || n < cfg.min_samples {
        return DurationPrediction::insufficient(n, minimum_duration);
    }

    let sustained = neighbors
        .iter()
        .filter(|m| m.record.duration.sustained_minutes >= minimum_duration)
        .count();
    let confidence = sustained as f64 / n as f64;

    let mut counts: BTreeMap<DurationBracket, usize> = BTreeMap::new();
    for m in neighbors {
        *counts.entry(m.record.duration.bracket).or_insert(0) += 1;
    }
    // Ties go to the shorter bracket.
    let expected_bracket = counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(bracket, _)| *bracket);
    let bracket_distribution = DurationBracket::ALL
        .iter()
        .map(|b| (b.as_str().to_string(), counts.get(b).copied().unwrap_or(0) as f64 / n as f64))
        .collect();

    let mut minutes: Vec<f64> = neighbors.iter().map(|m| m.record.duration.sustained_minutes).collect();
    let recommendation = if confidence >= cfg.sustained_confidence {
        DurationOutlook::Sustained
    } else if confidence <= cfg.short_lived_confidence {
        DurationOutlook::ShortLived
    } else {
        DurationOutlook::Mixed
    };

    DurationPrediction {
        recommendation,
        confidence,
        sample_size: n,
        minimum_duration,
        median_sustained_minutes: median(&mut minutes),
        expected_bracket,
        bracket_distribution,
        average_similarity: neighbors.iter().map(|m| m.similarity).sum::<f64>() / n as f64,
    }
}
