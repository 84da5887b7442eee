//! Duration and move-shape classification of a finished trade.
//!
//! Pure functions of (final pnl, trajectory, holding bars). Every input maps
//! to exactly one bracket and one move type; absent data falls back to
//! neutral defaults instead of failing. One bar is one minute.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::ClassifierConfig;
use crate::record::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DurationBracket {
    #[serde(rename = "<5")]
    Under5,
    #[serde(rename = "[5,15)")]
    From5To15,
    #[serde(rename = "[15,30)")]
    From15To30,
    #[serde(rename = "[30,60)")]
    From30To60,
    #[serde(rename = ">=60")]
    Over60,
}

impl DurationBracket {
    pub const ALL: [DurationBracket; 5] = [
        DurationBracket::Under5,
        DurationBracket::From5To15,
        DurationBracket::From15To30,
        DurationBracket::From30To60,
        DurationBracket::Over60,
    ];

    /// Total over all inputs: NaN and negatives land in `<5`.
    pub fn classify(minutes: f64) -> Self {
        if !(minutes >= 5.0) {
            DurationBracket::Under5
        } else if minutes < 15.0 {
            DurationBracket::From5To15
        } else if minutes < 30.0 {
            DurationBracket::From15To30
        } else if minutes < 60.0 {
            DurationBracket::From30To60
        } else {
            DurationBracket::Over60
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DurationBracket::Under5 => "<5",
            DurationBracket::From5To15 => "[5,15)",
            DurationBracket::From15To30 => "[15,30)",
            DurationBracket::From30To60 => "[30,60)",
            DurationBracket::Over60 => ">=60",
        }
    }
}

impl Default for DurationBracket {
    fn default() -> Self {
        DurationBracket::Under5
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveType {
    SpikeReversal,
    TrendContinuation,
    ConsolidationBreakout,
    RangeBounce,
}

impl MoveType {
    pub fn sustainability(&self) -> f64 {
        match self {
            MoveType::SpikeReversal => 0.2,
            MoveType::TrendContinuation => 0.8,
            MoveType::ConsolidationBreakout => 0.6,
            MoveType::RangeBounce => 0.5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MoveType::SpikeReversal => "spike_reversal",
            MoveType::TrendContinuation => "trend_continuation",
            MoveType::ConsolidationBreakout => "consolidation_breakout",
            MoveType::RangeBounce => "range_bounce",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccelerationType {
    Accelerating,
    Steady,
    Decelerating,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationProfile {
    pub sustained_minutes: f64,
    pub bracket: DurationBracket,
    pub first_profit_bar: Option<u32>,
    pub max_profit_bar: Option<u32>,
    pub profit_sustained_run: u32,
    /// Lowest running pnl seen, always <= 0.
    pub max_adverse_excursion: f64,
}

impl Default for DurationProfile {
    fn default() -> Self {
        Self {
            sustained_minutes: 0.0,
            bracket: DurationBracket::Under5,
            first_profit_bar: None,
            max_profit_bar: None,
            profit_sustained_run: 0,
            max_adverse_excursion: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveProfile {
    pub move_type: MoveType,
    pub sustainability_score: f64,
    pub follow_through_quality: f64,
    pub acceleration: AccelerationType,
}

impl Default for MoveProfile {
    fn default() -> Self {
        Self {
            move_type: MoveType::RangeBounce,
            sustainability_score: MoveType::RangeBounce.sustainability(),
            follow_through_quality: 0.0,
            acceleration: AccelerationType::Steady,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DurationClassifier {
    cfg: ClassifierConfig,
}

impl DurationClassifier {
    pub fn new(cfg: ClassifierConfig) -> Self {
        Self { cfg }
    }

    pub fn classify(
        &self,
        outcome: &Outcome,
        trajectory: &BTreeMap<u32, f64>,
    ) -> (DurationProfile, MoveProfile) {
        let duration = duration_profile(outcome, trajectory);
        let movement = self.move_profile(outcome.pnl, &duration, trajectory);
        (duration, movement)
    }

    fn move_profile(&self, pnl: f64, duration: &DurationProfile, trajectory: &BTreeMap<u32, f64>) -> MoveProfile {
        let move_type = if duration.sustained_minutes < 5.0 || !duration.sustained_minutes.is_finite() {
            MoveType::SpikeReversal
        } else if duration.sustained_minutes >= 30.0 && pnl > 0.0 {
            MoveType::TrendContinuation
        } else if duration.sustained_minutes >= 30.0 {
            MoveType::ConsolidationBreakout
        } else {
            MoveType::RangeBounce
        };

        let mae = duration.max_adverse_excursion.abs();
        let acceleration = if mae < self.cfg.accelerating_mae {
            AccelerationType::Accelerating
        } else if mae < self.cfg.steady_mae {
            AccelerationType::Steady
        } else {
            AccelerationType::Decelerating
        };

        MoveProfile {
            move_type,
            sustainability_score: move_type.sustainability(),
            follow_through_quality: follow_through(pnl, trajectory),
            acceleration,
        }
    }
}

impl Default for DurationClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

fn duration_profile(outcome: &Outcome, trajectory: &BTreeMap<u32, f64>) -> DurationProfile {
    if trajectory.is_empty() {
        let bars = outcome.holding_bars.unwrap_or(0);
        let sustained = bars as f64;
        return DurationProfile {
            sustained_minutes: sustained,
            bracket: DurationBracket::classify(sustained),
            first_profit_bar: None,
            max_profit_bar: None,
            profit_sustained_run: if outcome.pnl > 0.0 { bars } else { 0 },
            max_adverse_excursion: finite_or_zero(-outcome.max_adverse_excursion.abs()),
        };
    }

    let mut last_positive: Option<u32> = None;
    let mut first_positive: Option<u32> = None;
    let mut max_bar: Option<(u32, f64)> = None;
    let mut longest_run = 0u32;
    let mut run = 0u32;
    let mut prev_bar: Option<u32> = None;
    let mut min_pnl = 0.0f64;

    for (&bar, &pnl) in trajectory {
        let pnl = if pnl.is_finite() { pnl } else { 0.0 };
        if pnl > 0.0 {
            first_positive.get_or_insert(bar);
            last_positive = Some(bar);
            let contiguous = prev_bar.map(|p| p + 1 == bar).unwrap_or(false);
            run = if contiguous && run > 0 { run + 1 } else { 1 };
            longest_run = longest_run.max(run);
        } else {
            run = 0;
        }
        if pnl > 0.0 && max_bar.map(|(_, best)| pnl > best).unwrap_or(true) {
            max_bar = Some((bar, pnl));
        }
        min_pnl = min_pnl.min(pnl);
        prev_bar = Some(bar);
    }

    let sustained = last_positive.map(|b| b as f64 + 1.0).unwrap_or(0.0);
    DurationProfile {
        sustained_minutes: sustained,
        bracket: DurationBracket::classify(sustained),
        first_profit_bar: first_positive,
        max_profit_bar: max_bar.map(|(bar, _)| bar),
        profit_sustained_run: longest_run,
        max_adverse_excursion: min_pnl,
    }
}

/// Share of the peak running profit still held at exit, in `[0, 1]`.
fn follow_through(pnl: f64, trajectory: &BTreeMap<u32, f64>) -> f64 {
    let peak = trajectory
        .values()
        .copied()
        .filter(|v| v.is_finite())
        .fold(pnl.max(0.0), f64::max);
    if peak <= 0.0 {
        return 0.0;
    }
    (pnl / peak).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn traj(points: &[(u32, f64)]) -> BTreeMap<u32, f64> {
        points.iter().copied().collect()
    }

    #[test]
    fn test_bracket_boundaries_exact() {
        assert_eq!(DurationBracket::classify(4.999), DurationBracket::Under5);
        assert_eq!(DurationBracket::classify(5.0), DurationBracket::From5To15);
        assert_eq!(DurationBracket::classify(15.0), DurationBracket::From15To30);
        assert_eq!(DurationBracket::classify(30.0), DurationBracket::From30To60);
        assert_eq!(DurationBracket::classify(60.0), DurationBracket::Over60);
        assert_eq!(DurationBracket::classify(0.0), DurationBracket::Under5);
        assert_eq!(DurationBracket::classify(f64::NAN), DurationBracket::Under5);
        assert_eq!(DurationBracket::classify(-3.0), DurationBracket::Under5);
    }

    #[test]
    fn test_bracket_labels() {
        let labels: Vec<&str> = DurationBracket::ALL.iter().map(|b| b.as_str()).collect();
        assert_eq!(labels, vec!["<5", "[5,15)", "[15,30)", "[30,60)", ">=60"]);
        assert_eq!(serde_json::to_string(&DurationBracket::From5To15).unwrap(), "\"[5,15)\"");
    }

    #[test]
    fn test_sustained_from_last_positive_bar() {
        let t: BTreeMap<u32, f64> = (0..20).map(|b| (b, 5.0 + b as f64)).chain([(20, -2.0)]).collect();
        let (d, _) = DurationClassifier::default().classify(&Outcome::with_pnl(50.0), &t);
        assert_eq!(d.sustained_minutes, 20.0);
        assert_eq!(d.bracket, DurationBracket::From15To30);
        assert_eq!(d.first_profit_bar, Some(0));
        assert_eq!(d.max_profit_bar, Some(19));
    }

    #[test]
    fn test_sustained_run_requires_consecutive_bars() {
        // 3 positive, 1 negative, 2 positive, gap, 1 positive
        let t = traj(&[(0, 1.0), (1, 2.0), (2, 1.0), (3, -1.0), (4, 1.0), (5, 2.0), (7, 3.0)]);
        let (d, _) = DurationClassifier::default().classify(&Outcome::with_pnl(3.0), &t);
        assert_eq!(d.profit_sustained_run, 3);
        assert_eq!(d.sustained_minutes, 8.0);
        assert_eq!(d.max_adverse_excursion, -1.0);
    }

    #[test]
    fn test_no_trajectory_uses_holding_bars() {
        let mut o = Outcome::with_pnl(-30.0);
        o.holding_bars = Some(2);
        o.max_adverse_excursion = 12.0;
        let (d, m) = DurationClassifier::default().classify(&o, &BTreeMap::new());
        assert_eq!(d.sustained_minutes, 2.0);
        assert_eq!(d.bracket, DurationBracket::Under5);
        assert_eq!(d.profit_sustained_run, 0);
        assert_eq!(d.max_adverse_excursion, -12.0);
        assert_eq!(m.move_type, MoveType::SpikeReversal);
        assert_eq!(m.acceleration, AccelerationType::Steady);
    }

    #[test]
    fn test_absent_everything_is_neutral() {
        let (d, m) = DurationClassifier::default().classify(&Outcome::with_pnl(0.0), &BTreeMap::new());
        assert_eq!(d, DurationProfile::default());
        assert_eq!(m.move_type, MoveType::SpikeReversal);
        assert_eq!(m.sustainability_score, 0.2);
    }

    #[test]
    fn test_move_type_rules() {
        let c = DurationClassifier::default();
        let mut o = Outcome::with_pnl(10.0);
        o.holding_bars = Some(40);
        assert_eq!(c.classify(&o, &BTreeMap::new()).1.move_type, MoveType::TrendContinuation);
        o.pnl = -10.0;
        assert_eq!(c.classify(&o, &BTreeMap::new()).1.move_type, MoveType::ConsolidationBreakout);
        o.holding_bars = Some(12);
        let (_, m) = c.classify(&o, &BTreeMap::new());
        assert_eq!(m.move_type, MoveType::RangeBounce);
        assert_eq!(m.sustainability_score, 0.5);
    }

    #[test]
    fn test_acceleration_thresholds() {
        let c = DurationClassifier::default();
        let small = traj(&[(0, -4.0), (1, 2.0)]);
        let medium = traj(&[(0, -10.0), (1, 2.0)]);
        let large = traj(&[(0, -20.0), (1, 2.0)]);
        let o = Outcome::with_pnl(2.0);
        assert_eq!(c.classify(&o, &small).1.acceleration, AccelerationType::Accelerating);
        assert_eq!(c.classify(&o, &medium).1.acceleration, AccelerationType::Steady);
        assert_eq!(c.classify(&o, &large).1.acceleration, AccelerationType::Decelerating);
    }

    #[test]
    fn test_follow_through_retention() {
        let t = traj(&[(0, 5.0), (1, 20.0), (2, 10.0)]);
        let (_, m) = DurationClassifier::default().classify(&Outcome::with_pnl(10.0), &t);
        assert!((m.follow_through_quality - 0.5).abs() < 1e-12);
        let (_, m) = DurationClassifier::default().classify(&Outcome::with_pnl(-4.0), &t);
        assert_eq!(m.follow_through_quality, 0.0);
    }
}
