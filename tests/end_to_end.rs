//! Integration test: store, retrieve and predict over a small history.
//!
//! Three trades for instrument `X`:
//! - a: `[1,0,0]`, +50, profitable through bar 19 (20 sustained minutes)
//! - b: `[0,1,0]`, -30, profitable for 2 bars
//! - c: `[0.9,0.1,0]`, +10, profitable through bar 39

use std::collections::BTreeMap;

use pattern_memory::classifier::DurationBracket;
use pattern_memory::codec::FeatureInput;
use pattern_memory::config::{Config, StoreConfig};
use pattern_memory::engine::{DurationOutlook, DurationQuery};
use pattern_memory::record::{CompletedTrade, Outcome, TradeTimestamp};
use pattern_memory::store::memory::MemoryBackend;
use pattern_memory::store::SimilarityQuery;
use pattern_memory::PatternMemory;

fn trade(signal: &str, ts: i64, features: &[f64], pnl: f64, trajectory: &[(u32, f64)]) -> CompletedTrade {
    CompletedTrade {
        entry_signal_id: Some(signal.to_string()),
        instrument: Some("X".to_string()),
        timestamp: Some(TradeTimestamp::Millis(ts)),
        features: Some(FeatureInput::from_values(features)),
        outcome: Some(Outcome::with_pnl(pnl)),
        trajectory: Some(trajectory.iter().copied().collect::<BTreeMap<u32, f64>>()),
        ..Default::default()
    }
}

async fn seeded() -> PatternMemory {
    let cfg = Config {
        store: StoreConfig { feature_dimension: 3, ..StoreConfig::default() },
        ..Config::default()
    };
    let mut pm = PatternMemory::with_backend(cfg, Box::new(MemoryBackend::new()));
    pm.initialize().unwrap();

    pm.store(&trade("a", 1_000, &[1.0, 0.0, 0.0], 50.0, &[(0, 5.0), (10, 20.0), (19, 50.0)]))
        .await
        .unwrap();
    pm.store(&trade("b", 2_000, &[0.0, 1.0, 0.0], -30.0, &[(0, 1.0), (1, 0.5), (2, -10.0), (5, -30.0)]))
        .await
        .unwrap();
    pm.store(&trade("c", 3_000, &[0.9, 0.1, 0.0], 10.0, &[(0, 1.0), (39, 10.0)]))
        .await
        .unwrap();
    pm.flush().await.unwrap();
    pm
}

#[tokio::test]
async fn test_similar_trades_ranked_and_dissimilar_excluded() {
    let pm = seeded().await;
    let query = SimilarityQuery { limit: Some(2), ..SimilarityQuery::for_instrument("X") };
    let resp = pm.find_similar(&[1.0, 0.0, 0.0], query).unwrap();

    assert_eq!(resp.matches.len(), 2);
    assert_eq!(resp.matches[0].record.entry_signal_id, "a");
    assert!((resp.matches[0].similarity - 1.0).abs() < 1e-9);
    assert_eq!(resp.matches[1].record.entry_signal_id, "c");
    assert!((resp.matches[1].similarity - 0.9939).abs() < 1e-3);
    assert!(resp.matches.iter().all(|m| m.record.entry_signal_id != "b"));
}

#[tokio::test]
async fn test_classifier_labels_persisted_with_records() {
    let pm = seeded().await;
    let q = SimilarityQuery { similarity_threshold: Some(-1.0), ..SimilarityQuery::for_instrument("X") };
    let resp = pm.find_similar(&[1.0, 0.0, 0.0], q).unwrap();
    let minutes: BTreeMap<&str, f64> = resp
        .matches
        .iter()
        .map(|m| (m.record.entry_signal_id.as_str(), m.record.duration.sustained_minutes))
        .collect();
    assert_eq!(minutes["a"], 20.0);
    assert_eq!(minutes["b"], 2.0);
    assert_eq!(minutes["c"], 40.0);
}

#[tokio::test]
async fn test_duration_prediction_two_of_three_sustained() {
    let pm = seeded().await;
    let query = DurationQuery {
        instrument: Some("X".into()),
        minimum_duration: 15.0,
        ..DurationQuery::default()
    };
    let p = pm.predict_duration(&[1.0, 0.0, 0.0], &query).unwrap();
    assert_eq!(p.sample_size, 3);
    assert!((p.confidence - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(p.recommendation, DurationOutlook::Sustained);
    assert_eq!(p.median_sustained_minutes, Some(20.0));
    assert_eq!(p.bracket_distribution[DurationBracket::From30To60.as_str()], 1.0 / 3.0);
}

#[tokio::test]
async fn test_duration_prediction_without_history() {
    let pm = seeded().await;
    let query = DurationQuery {
        instrument: Some("Y".into()),
        minimum_duration: 15.0,
        ..DurationQuery::default()
    };
    let p = pm.predict_duration(&[1.0, 0.0, 0.0], &query).unwrap();
    assert_eq!(p.recommendation, DurationOutlook::InsufficientData);
    assert_eq!(p.confidence, 0.0);
}

#[tokio::test]
async fn test_same_signal_and_time_is_one_record() {
    let mut pm = seeded().await;
    let again = pm.store(&trade("a", 1_000, &[0.0, 0.0, 1.0], -1.0, &[])).await;
    assert!(again.is_err());
    assert_eq!(pm.len(), 3);
}
