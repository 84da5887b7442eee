//! Streak and regime features over a sequence of implied market moves.
//!
//! Input is one entry per prior record, oldest first: the sign of the move
//! the trade implied (+1 up, -1 down, 0 flat) and its magnitude.

use std::collections::VecDeque;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Trending,
    MeanReverting,
    Ranging,
    Consolidating,
    Unknown,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Trending => "trending",
            Regime::MeanReverting => "mean_reverting",
            Regime::Ranging => "ranging",
            Regime::Consolidating => "consolidating",
            Regime::Unknown => "unknown",
        }
    }

    /// Stable numeric code for feature vectors.
    pub fn code(&self) -> f64 {
        match self {
            Regime::Unknown => 0.0,
            Regime::Ranging => 1.0,
            Regime::Consolidating => 2.0,
            Regime::MeanReverting => 3.0,
            Regime::Trending => 4.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreakState {
    /// Direction of the current streak: +1, -1 or 0.
    pub current_direction: f64,
    pub current_streak: usize,
    pub longest_up_streak: usize,
    pub longest_down_streak: usize,
    pub consolidation_bars: usize,
    pub trend_age_bars: usize,
    /// Fraction of consecutive moves that kept the same sign, in `[0, 1]`.
    pub momentum_score: f64,
    pub mean_reversion_score: f64,
    pub regime: Regime,
}

impl StreakState {
    pub fn neutral() -> Self {
        Self {
            current_direction: 0.0,
            current_streak: 0,
            longest_up_streak: 0,
            longest_down_streak: 0,
            consolidation_bars: 0,
            trend_age_bars: 0,
            momentum_score: 0.5,
            mean_reversion_score: 0.5,
            regime: Regime::Unknown,
        }
    }
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

pub fn analyze(moves: &[f64], magnitudes: &[f64], trend_window: usize, consolidation_ratio: f64) -> StreakState {
    if moves.is_empty() {
        return StreakState::neutral();
    }
    let (current_direction, current_streak) = current_streak(moves);
    let (longest_up_streak, longest_down_streak) = longest_streaks(moves);
    let consolidation_bars = consolidation_bars(magnitudes, consolidation_ratio);
    let trend_age_bars = trend_age(moves, trend_window);
    let momentum_score = momentum(moves);

    let regime = if consolidation_bars * 2 >= trend_window.max(2) {
        Regime::Consolidating
    } else if momentum_score >= 0.6 {
        Regime::Trending
    } else if momentum_score <= 0.4 {
        Regime::MeanReverting
    } else {
        Regime::Ranging
    };

    StreakState {
        current_direction,
        current_streak,
        longest_up_streak,
        longest_down_streak,
        consolidation_bars,
        trend_age_bars,
        momentum_score,
        mean_reversion_score: 1.0 - momentum_score,
        regime,
    }
}

fn current_streak(moves: &[f64]) -> (f64, usize) {
    let last = moves.last().copied().map(sign).unwrap_or(0.0);
    if last == 0.0 {
        return (0.0, 0);
    }
    let len = moves.iter().rev().take_while(|&&m| sign(m) == last).count();
    (last, len)
}

fn longest_streaks(moves: &[f64]) -> (usize, usize) {
    let (mut up, mut down) = (0, 0);
    let (mut run, mut dir) = (0, 0.0);
    for &m in moves {
        let s = sign(m);
        if s != 0.0 && s == dir {
            run += 1;
        } else {
            run = if s == 0.0 { 0 } else { 1 };
            dir = s;
        }
        if dir > 0.0 {
            up = up.max(run);
        } else if dir < 0.0 {
            down = down.max(run);
        }
    }
    (up, down)
}

/// Trailing records whose move was smaller than `ratio` times the window mean.
fn consolidation_bars(magnitudes: &[f64], ratio: f64) -> usize {
    if magnitudes.is_empty() {
        return 0;
    }
    let mean = magnitudes.iter().sum::<f64>() / magnitudes.len() as f64;
    if mean <= 0.0 {
        return 0;
    }
    magnitudes.iter().rev().take_while(|&&m| m < ratio * mean).count()
}

/// Bars since the rolling trend direction last flipped.
fn trend_age(moves: &[f64], window: usize) -> usize {
    if window == 0 || moves.len() < window {
        return 0;
    }
    let mut buf: VecDeque<f64> = VecDeque::with_capacity(window);
    let mut sum = 0.0;
    let mut trend = 0.0;
    let mut age = 0;
    for &m in moves {
        buf.push_back(m);
        sum += m;
        if buf.len() > window {
            if let Some(old) = buf.pop_front() {
                sum -= old;
            }
        }
        if buf.len() < window {
            continue;
        }
        let t = sign(sum);
        if t == trend {
            age += 1;
        } else {
            trend = t;
            age = 1;
        }
    }
    age
}

fn momentum(moves: &[f64]) -> f64 {
    if moves.len() < 2 {
        return 0.5;
    }
    let pairs = moves.len() - 1;
    let same = moves
        .windows(2)
        .filter(|w| sign(w[0]) != 0.0 && sign(w[0]) == sign(w[1]))
        .count();
    same as f64 / pairs as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_and_longest_streaks() {
        let moves = [1.0, 1.0, 1.0, -1.0, 0.0, -1.0, -1.0];
        assert_eq!(current_streak(&moves), (-1.0, 2));
        assert_eq!(longest_streaks(&moves), (3, 2));
        assert_eq!(current_streak(&[1.0, 0.0]), (0.0, 0));
    }

    #[test]
    fn test_consolidation_counts_quiet_tail() {
        let mags = [10.0, 10.0, 10.0, 10.0, 1.0, 1.0];
        // Mean is 7, quiet threshold 3.5.
        assert_eq!(consolidation_bars(&mags, 0.5), 2);
        assert_eq!(consolidation_bars(&[0.0, 0.0], 0.5), 0);
    }

    #[test]
    fn test_trend_age_resets_on_flip() {
        let mut moves = vec![1.0; 12];
        moves.extend(vec![-1.0; 12]);
        // Window 4 flips once four down moves dominate.
        let age = trend_age(&moves, 4);
        assert_eq!(age, 10);
        assert_eq!(trend_age(&[1.0, 1.0], 4), 0);
    }

    #[test]
    fn test_regime_labels() {
        let trending = analyze(&[1.0; 30], &[5.0; 30], 10, 0.5);
        assert_eq!(trending.regime, Regime::Trending);
        assert_eq!(trending.momentum_score, 1.0);
        assert_eq!(trending.mean_reversion_score, 0.0);

        let alternating: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let choppy = analyze(&alternating, &[5.0; 30], 10, 0.5);
        assert_eq!(choppy.regime, Regime::MeanReverting);

        let mut mags = vec![10.0; 24];
        mags.extend(vec![0.5; 6]);
        let quiet = analyze(&alternating, &mags, 10, 0.5);
        assert_eq!(quiet.regime, Regime::Consolidating);
        assert_eq!(quiet.consolidation_bars, 6);
    }

    #[test]
    fn test_empty_is_neutral() {
        assert_eq!(analyze(&[], &[], 10, 0.5), StreakState::neutral());
    }
}
