//! Store health report: what is in memory and whether it is fit to learn from.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::record::PatternRecord;

/// Below this pnl standard deviation the store cannot separate good setups from bad.
const MIN_PNL_STD: f64 = 1.0;
const MIN_UNIQUE_PNL: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStats {
    pub count: usize,
    pub win_rate: f64,
    pub avg_pnl: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PnlDistribution {
    pub mean: f64,
    /// Sample standard deviation.
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub winners: usize,
    pub losers: usize,
    pub unique_values: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub total_records: usize,
    pub pending_records: usize,
    /// Keyed `"{instrument} {direction}"`.
    pub by_instrument_direction: BTreeMap<String, GroupStats>,
    pub by_data_type: BTreeMap<String, usize>,
    pub by_schema_version: BTreeMap<u32, usize>,
    pub by_session: BTreeMap<String, usize>,
    pub pnl: PnlDistribution,
    pub warnings: Vec<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.warnings.is_empty()
    }
}

pub fn build(records: &[Arc<PatternRecord>], pending: usize) -> HealthReport {
    let mut report = HealthReport { total_records: records.len(), pending_records: pending, ..Default::default() };
    if records.is_empty() {
        report.warnings.push("store is empty".to_string());
        return report;
    }

    let mut groups: BTreeMap<String, (usize, usize, f64)> = BTreeMap::new();
    let mut unique = HashSet::new();
    let (mut sum, mut sumsq) = (0.0, 0.0);
    let (mut min, mut max) = (f64::INFINITY, f64::NEG_INFINITY);

    for rec in records {
        let pnl = rec.outcome.pnl;
        let g = groups.entry(format!("{} {}", rec.instrument, rec.direction.as_str())).or_insert((0, 0, 0.0));
        g.0 += 1;
        g.2 += pnl;
        if pnl > 0.0 {
            g.1 += 1;
            report.pnl.winners += 1;
        } else if pnl < 0.0 {
            report.pnl.losers += 1;
        }
        *report.by_data_type.entry(rec.data_type.as_str().to_string()).or_insert(0) += 1;
        *report.by_schema_version.entry(rec.schema_version).or_insert(0) += 1;
        *report.by_session.entry(rec.session_id.clone()).or_insert(0) += 1;

        // -0.0 and 0.0 are the same pnl.
        unique.insert((pnl + 0.0).to_bits());
        sum += pnl;
        sumsq += pnl * pnl;
        min = min.min(pnl);
        max = max.max(pnl);
    }

    let n = records.len() as f64;
    report.pnl.mean = sum / n;
    report.pnl.std = if records.len() < 2 { 0.0 } else { ((sumsq - sum * sum / n) / (n - 1.0)).max(0.0).sqrt() };
    report.pnl.min = min;
    report.pnl.max = max;
    report.pnl.unique_values = unique.len();
    report.by_instrument_direction = groups
        .into_iter()
        .map(|(k, (count, wins, pnl))| {
            (k, GroupStats { count, win_rate: wins as f64 / count as f64, avg_pnl: pnl / count as f64 })
        })
        .collect();

    if report.pnl.std < MIN_PNL_STD {
        report.warnings.push(format!("low pnl variance (std {:.2})", report.pnl.std));
    } else if report.pnl.unique_values < MIN_UNIQUE_PNL {
        report.warnings.push(format!("very few unique pnl values ({})", report.pnl.unique_values));
    }
    if report.by_schema_version.len() > 1 {
        let versions: Vec<String> = report.by_schema_version.keys().map(|v| v.to_string()).collect();
        report.warnings.push(format!("mixed schema versions: {}", versions.join(", ")));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Direction;
    use crate::store::test_support::record;

    #[test]
    fn test_empty_store_warns() {
        let r = build(&[], 3);
        assert_eq!(r.pending_records, 3);
        assert!(!r.is_healthy());
    }

    #[test]
    fn test_distribution_and_groups() {
        let mut recs: Vec<Arc<PatternRecord>> =
            (0..12).map(|i| Arc::new(record(&format!("s{}", i), i, vec![1.0, 0.0], i as f64 * 10.0 - 30.0))).collect();
        let mut short = record("short", 99, vec![1.0, 0.0], 5.0);
        short.direction = Direction::Short;
        recs.push(Arc::new(short));

        let r = build(&recs, 0);
        assert_eq!(r.total_records, 13);
        assert_eq!(r.by_instrument_direction["MGC long"].count, 12);
        assert_eq!(r.by_instrument_direction["MGC short"].win_rate, 1.0);
        assert_eq!(r.pnl.min, -30.0);
        assert_eq!(r.pnl.max, 80.0);
        assert_eq!(r.pnl.losers, 3);
        assert_eq!(r.pnl.unique_values, 13);
        assert!(r.is_healthy(), "{:?}", r.warnings);
    }

    #[test]
    fn test_flat_pnl_and_mixed_schemas_flagged() {
        let recs = vec![
            Arc::new(record("a", 1, vec![1.0, 0.0], 1.0)),
            Arc::new(record("b", 2, vec![1.0, 0.0, 0.0], 1.0)),
        ];
        let r = build(&recs, 0);
        assert_eq!(r.pnl.std, 0.0);
        assert_eq!(r.warnings.len(), 2);
        assert!(r.warnings[1].starts_with("mixed schema versions"));
    }
}
