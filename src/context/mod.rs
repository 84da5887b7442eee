//! Historical context for a pending decision: how often a similar setup has
//! shown up recently, the streak and regime the instrument is in, and how
//! trades have fared at this hour and weekday.
//!
//! Everything is read from records strictly before the query timestamp, so a
//! backtest replay never sees its own future.

pub mod cache;
pub mod streaks;

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::ContextConfig;
use crate::logging::{log, obj, v_num, v_str, Domain, Level, ProfileScope};
use crate::similarity;
use crate::store::{VectorStore, DEADLINE_CHECK_INTERVAL};

pub use cache::{TimeProfile, TimeProfileCache};
pub use streaks::{Regime, StreakState};

const MS_PER_HOUR: i64 = 3_600_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextQuery {
    pub instrument: String,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub lookback_bars: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LagRecurrence {
    pub lag: usize,
    pub recurred: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarSetups {
    pub count: usize,
    /// Share of the lookback window that was similar, in `[0, 1]`.
    pub rate: f64,
    pub win_rate: f64,
    /// Bars back to the most recent similar record; `None` when there is none.
    pub bars_since_last: Option<usize>,
    pub recurrence: Vec<LagRecurrence>,
}

impl SimilarSetups {
    fn neutral(lags: &[usize]) -> Self {
        Self {
            count: 0,
            rate: 0.0,
            win_rate: 0.5,
            bars_since_last: None,
            recurrence: lags.iter().map(|&lag| LagRecurrence { lag, recurred: false }).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalContext {
    pub instrument: String,
    pub lookback_bars: usize,
    pub sample_size: usize,
    /// False when the window was too small and neutral defaults were used.
    pub sufficient: bool,
    /// The similarity pass hit the scan deadline; `similar` covers only the
    /// most recent records compared before it.
    pub truncated: bool,
    pub context_quality: f64,
    pub similar: SimilarSetups,
    pub streaks: StreakState,
    pub time_profile: TimeProfile,
}

impl HistoricalContext {
    /// Flatten into `ctx_*` features for enriching a raw feature map.
    pub fn to_features(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        let mut put = |name: &str, value: f64| {
            out.insert(format!("ctx_{}", name), value);
        };
        put("sample_size", self.sample_size as f64);
        put("quality", self.context_quality);
        put("similar_count", self.similar.count as f64);
        put("similar_rate", self.similar.rate);
        put("similar_win_rate", self.similar.win_rate);
        put(
            "bars_since_similar",
            self.similar.bars_since_last.unwrap_or(self.lookback_bars) as f64,
        );
        for r in &self.similar.recurrence {
            put(&format!("recur_lag_{}", r.lag), if r.recurred { 1.0 } else { 0.0 });
        }
        put("streak_direction", self.streaks.current_direction);
        put("streak_length", self.streaks.current_streak as f64);
        put("longest_up_streak", self.streaks.longest_up_streak as f64);
        put("longest_down_streak", self.streaks.longest_down_streak as f64);
        put("consolidation_bars", self.streaks.consolidation_bars as f64);
        put("trend_age", self.streaks.trend_age_bars as f64);
        put("momentum", self.streaks.momentum_score);
        put("mean_reversion", self.streaks.mean_reversion_score);
        put("regime", self.streaks.regime.code());
        put("hour", self.time_profile.hour_of_day as f64);
        put("day_of_week", self.time_profile.day_of_week as f64);
        put("hour_samples", self.time_profile.hour_samples as f64);
        put("hour_win_rate", self.time_profile.hour_win_rate);
        put("hour_avg_pnl", self.time_profile.hour_avg_pnl);
        put("day_samples", self.time_profile.day_samples as f64);
        put("day_win_rate", self.time_profile.day_win_rate);
        out
    }
}

pub fn context_quality(sample_size: usize) -> f64 {
    match sample_size {
        0..=19 => 0.2,
        20..=49 => 0.5,
        50..=99 => 0.7,
        _ => 0.9,
    }
}

/// `(hour of day, weekday from Monday = 0)` in UTC.
fn calendar(ts_ms: i64) -> (u32, u32) {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .map(|dt| (dt.hour(), dt.weekday().num_days_from_monday()))
        .unwrap_or((0, 0))
}

pub struct ContextExtractor {
    cfg: ContextConfig,
    cache: TimeProfileCache,
}

impl ContextExtractor {
    pub fn new(cfg: ContextConfig) -> Self {
        let cache = TimeProfileCache::new(cfg.cache_capacity);
        Self { cfg, cache }
    }

    pub fn cache(&self) -> &TimeProfileCache {
        &self.cache
    }

    pub fn extract(&mut self, store: &VectorStore, current: &[f64], q: &ContextQuery) -> HistoricalContext {
        self.extract_until(store, current, q, store.scan_deadline())
    }

    /// Like `extract`, with the similarity pass stopping at `deadline`.
    pub fn extract_until(
        &mut self,
        store: &VectorStore,
        current: &[f64],
        q: &ContextQuery,
        deadline: Option<Instant>,
    ) -> HistoricalContext {
        let _scope = ProfileScope::with_context("extract_context", &[("instrument", json!(q.instrument))]);
        let lookback = q.lookback_bars.unwrap_or(self.cfg.lookback_bars).min(self.cfg.max_lookback_bars);
        let prior = store.history(&q.instrument, q.timestamp_ms, lookback);
        let sample_size = prior.len();
        let time_profile = self.time_profile(store, &q.instrument, q.timestamp_ms);

        if sample_size < self.cfg.min_samples {
            log(
                Level::Debug,
                Domain::Context,
                "context_neutral",
                obj(&[
                    ("instrument", v_str(&q.instrument)),
                    ("samples", v_num(sample_size as f64)),
                    ("min_samples", v_num(self.cfg.min_samples as f64)),
                ]),
            );
            return HistoricalContext {
                instrument: q.instrument.clone(),
                lookback_bars: lookback,
                sample_size,
                sufficient: false,
                truncated: false,
                context_quality: context_quality(sample_size),
                similar: SimilarSetups::neutral(&self.cfg.recurrence_lags),
                streaks: StreakState::neutral(),
                time_profile,
            };
        }

        let moves: Vec<f64> = prior.iter().map(|r| r.implied_move()).collect();
        let magnitudes: Vec<f64> = prior.iter().map(|r| r.outcome.move_magnitude()).collect();
        let streaks = streaks::analyze(&moves, &magnitudes, self.cfg.trend_window, self.cfg.consolidation_ratio);

        let policy = store.config().schema_policy;
        let mut count = 0;
        let mut wins = 0;
        let mut compared = 0;
        let mut truncated = false;
        let mut bars_since_last: Option<usize> = None;
        let mut recurrence: Vec<LagRecurrence> =
            self.cfg.recurrence_lags.iter().map(|&lag| LagRecurrence { lag, recurred: false }).collect();

        // Newest first, so a deadline cut keeps the most recent bars.
        for (i, rec) in prior.iter().rev().enumerate() {
            if i % DEADLINE_CHECK_INTERVAL == 0 {
                if let Some(d) = deadline {
                    if Instant::now() >= d {
                        truncated = true;
                        break;
                    }
                }
            }
            compared += 1;
            let bars_back = i + 1;
            if similarity::compare(current, &rec.feature_vector, policy) < self.cfg.similar_threshold {
                continue;
            }
            count += 1;
            if rec.is_win() {
                wins += 1;
            }
            bars_since_last.get_or_insert(bars_back);
            for r in recurrence.iter_mut() {
                if bars_back.abs_diff(r.lag) <= self.cfg.lag_tolerance {
                    r.recurred = true;
                }
            }
        }

        if truncated {
            log(
                Level::Warn,
                Domain::Context,
                "context_deadline_exceeded",
                obj(&[
                    ("instrument", v_str(&q.instrument)),
                    ("compared", v_num(compared as f64)),
                    ("samples", v_num(sample_size as f64)),
                ]),
            );
        }

        let similar = SimilarSetups {
            count,
            rate: if compared == 0 { 0.0 } else { count as f64 / compared as f64 },
            win_rate: if count == 0 { 0.5 } else { wins as f64 / count as f64 },
            bars_since_last,
            recurrence,
        };

        HistoricalContext {
            instrument: q.instrument.clone(),
            lookback_bars: lookback,
            sample_size,
            sufficient: true,
            truncated,
            context_quality: context_quality(sample_size),
            similar,
            streaks,
            time_profile,
        }
    }

    fn time_profile(&mut self, store: &VectorStore, instrument: &str, ts_ms: i64) -> TimeProfile {
        let (hour, weekday) = calendar(ts_ms);
        let epoch_hour = ts_ms.div_euclid(MS_PER_HOUR);
        if let Some(hit) = self.cache.get(instrument, hour, epoch_hour) {
            return hit;
        }

        // Built from records before the hour began, so every query in this
        // epoch hour shares one input and none of it is ahead of the query.
        let hour_start_ms = epoch_hour * MS_PER_HOUR;
        let mut profile = TimeProfile::neutral(hour, weekday);
        let (mut hour_wins, mut hour_pnl, mut day_wins) = (0usize, 0.0, 0usize);
        for rec in store.history(instrument, hour_start_ms, self.cfg.time_profile_scan_limit) {
            let (h, d) = calendar(rec.timestamp_ms);
            if h == hour {
                profile.hour_samples += 1;
                hour_pnl += rec.outcome.pnl;
                if rec.is_win() {
                    hour_wins += 1;
                }
            }
            if d == weekday {
                profile.day_samples += 1;
                if rec.is_win() {
                    day_wins += 1;
                }
            }
        }
        if profile.hour_samples > 0 {
            profile.hour_win_rate = hour_wins as f64 / profile.hour_samples as f64;
            profile.hour_avg_pnl = hour_pnl / profile.hour_samples as f64;
        }
        if profile.day_samples > 0 {
            profile.day_win_rate = day_wins as f64 / profile.day_samples as f64;
        }

        self.cache.insert(instrument, epoch_hour, profile.clone());
        profile
    }
}
