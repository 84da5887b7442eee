use std::str::FromStr;

use crate::exposure::{OverexposurePolicy, RestartPolicy};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::store::retry::RetryPolicy;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn parse_schema_list(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect()
}

/// Fixed feature names from `FEATURE_SCHEMA_FILE` (a JSON array of names) or
/// `FEATURE_SCHEMA` (comma separated). The file wins when both are set.
fn feature_schema_from_env() -> Option<Vec<String>> {
    if let Ok(path) = std::env::var("FEATURE_SCHEMA_FILE") {
        let parsed = std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str::<Vec<String>>(&text).map_err(|e| e.to_string()));
        match parsed {
            Ok(names) if !names.is_empty() => return Some(names),
            Ok(_) => {}
            Err(e) => log(
                Level::Warn,
                Domain::System,
                "feature_schema_unreadable",
                obj(&[("path", v_str(&path)), ("error", v_str(&e))]),
            ),
        }
    }
    std::env::var("FEATURE_SCHEMA")
        .ok()
        .map(|raw| parse_schema_list(&raw))
        .filter(|names| !names.is_empty())
}

/// How vectors of different schema versions (dimensions) are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaPolicy {
    /// Mismatched lengths score 0.
    Strict,
    /// The shorter vector is zero-padded to the longer one.
    PadShorter,
}

impl FromStr for SchemaPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(SchemaPolicy::Strict),
            "pad" | "pad_shorter" => Ok(SchemaPolicy::PadShorter),
            other => Err(format!("unknown schema policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub sqlite_path: String,
    pub feature_dimension: usize,
    /// Fixed feature names. Named inputs are placed by this list, so records
    /// with different feature subsets stay position-aligned; the dimension
    /// becomes the number of distinct names.
    pub feature_schema: Option<Vec<String>>,
    pub batch_size: usize,
    /// Run backend compaction after this many successful flushes (0 disables).
    pub compact_every_flushes: u32,
    pub similarity_threshold: f64,
    pub default_limit: usize,
    pub scan_deadline_ms: u64,
    pub schema_policy: SchemaPolicy,
    pub normalize_instruments: bool,
    pub retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "./patterns.sqlite".to_string(),
            feature_dimension: 94,
            feature_schema: None,
            batch_size: 100,
            compact_every_flushes: 10,
            similarity_threshold: 0.8,
            default_limit: 10,
            scan_deadline_ms: 250,
            schema_policy: SchemaPolicy::Strict,
            normalize_instruments: true,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// |MAE| below this is an accelerating move.
    pub accelerating_mae: f64,
    /// |MAE| below this (and above `accelerating_mae`) is steady.
    pub steady_mae: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self { accelerating_mae: 5.0, steady_mae: 15.0 }
    }
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub lookback_bars: usize,
    /// Caller-supplied lookbacks are clamped to this.
    pub max_lookback_bars: usize,
    pub min_samples: usize,
    pub similar_threshold: f64,
    pub recurrence_lags: Vec<usize>,
    pub lag_tolerance: usize,
    pub trend_window: usize,
    pub consolidation_ratio: f64,
    pub cache_capacity: usize,
    /// Upper bound on records scanned for hour/day aggregates.
    pub time_profile_scan_limit: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            lookback_bars: 100,
            max_lookback_bars: 5000,
            min_samples: 20,
            similar_threshold: 0.75,
            recurrence_lags: vec![20, 50],
            lag_tolerance: 2,
            trend_window: 10,
            consolidation_ratio: 0.5,
            cache_capacity: 256,
            time_profile_scan_limit: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DurationConfig {
    pub min_samples: usize,
    pub neighbor_limit: usize,
    pub sustained_confidence: f64,
    pub short_lived_confidence: f64,
}

impl Default for DurationConfig {
    fn default() -> Self {
        Self {
            min_samples: 3,
            neighbor_limit: 50,
            sustained_confidence: 0.6,
            short_lived_confidence: 0.4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExposureConfig {
    /// Exposure above this count within a session is overexposure.
    pub threshold: f64,
    pub policy: OverexposurePolicy,
    /// Confidence multiplier lost per unit of excess exposure.
    pub penalty_per_exposure: f64,
    pub live_half_life_secs: u64,
    pub share_across_sessions: bool,
    /// Partitions of ended backtests kept for resumption; older ones are dropped.
    pub retained_backtest_partitions: usize,
    pub restart_policy: RestartPolicy,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            threshold: 3.0,
            policy: OverexposurePolicy::Penalize,
            penalty_per_exposure: 0.15,
            live_half_life_secs: 3600,
            share_across_sessions: false,
            retained_backtest_partitions: 4,
            restart_policy: RestartPolicy::Reject,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub store: StoreConfig,
    pub classifier: ClassifierConfig,
    pub context: ContextConfig,
    pub duration: DurationConfig,
    pub exposure: ExposureConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let store_defaults = StoreConfig::default();
        let retry_defaults = RetryPolicy::default();
        let ctx_defaults = ContextConfig::default();
        let dur_defaults = DurationConfig::default();
        let exp_defaults = ExposureConfig::default();
        let cls_defaults = ClassifierConfig::default();

        Self {
            store: StoreConfig {
                sqlite_path: std::env::var("PATTERN_DB_PATH").unwrap_or(store_defaults.sqlite_path),
                feature_dimension: env_or("FEATURE_DIM", store_defaults.feature_dimension),
                feature_schema: feature_schema_from_env(),
                batch_size: env_or("BATCH_SIZE", store_defaults.batch_size).max(1),
                compact_every_flushes: env_or("COMPACT_EVERY", store_defaults.compact_every_flushes),
                similarity_threshold: env_or("SIM_THRESHOLD", store_defaults.similarity_threshold),
                default_limit: env_or("SIM_LIMIT", store_defaults.default_limit),
                scan_deadline_ms: env_or("SCAN_DEADLINE_MS", store_defaults.scan_deadline_ms),
                schema_policy: env_or("SCHEMA_POLICY", store_defaults.schema_policy),
                normalize_instruments: env_flag("NORMALIZE_INSTRUMENTS", store_defaults.normalize_instruments),
                retry: RetryPolicy {
                    max_attempts: env_or("RETRY_ATTEMPTS", retry_defaults.max_attempts).max(1),
                    base_delay_ms: env_or("RETRY_BASE_MS", retry_defaults.base_delay_ms),
                    max_delay_ms: env_or("RETRY_MAX_MS", retry_defaults.max_delay_ms),
                    jitter_factor: env_or("RETRY_JITTER", retry_defaults.jitter_factor),
                },
            },
            classifier: ClassifierConfig {
                accelerating_mae: env_or("MAE_ACCEL", cls_defaults.accelerating_mae),
                steady_mae: env_or("MAE_STEADY", cls_defaults.steady_mae),
            },
            context: ContextConfig {
                lookback_bars: env_or("CTX_LOOKBACK", ctx_defaults.lookback_bars),
                max_lookback_bars: env_or("CTX_MAX_LOOKBACK", ctx_defaults.max_lookback_bars).max(1),
                min_samples: env_or("CTX_MIN_SAMPLES", ctx_defaults.min_samples),
                similar_threshold: env_or("CTX_SIM_THRESHOLD", ctx_defaults.similar_threshold),
                cache_capacity: env_or("CTX_CACHE_CAP", ctx_defaults.cache_capacity).max(1),
                ..ctx_defaults
            },
            duration: DurationConfig {
                min_samples: env_or("DURATION_MIN_SAMPLES", dur_defaults.min_samples),
                neighbor_limit: env_or("DURATION_NEIGHBORS", dur_defaults.neighbor_limit),
                ..dur_defaults
            },
            exposure: ExposureConfig {
                threshold: env_or("EXPOSURE_THRESHOLD", exp_defaults.threshold),
                policy: env_or("EXPOSURE_POLICY", exp_defaults.policy),
                penalty_per_exposure: env_or("EXPOSURE_PENALTY", exp_defaults.penalty_per_exposure),
                live_half_life_secs: env_or("EXPOSURE_HALF_LIFE_SECS", exp_defaults.live_half_life_secs),
                share_across_sessions: env_flag("EXPOSURE_SHARE_SESSIONS", exp_defaults.share_across_sessions),
                retained_backtest_partitions: env_or(
                    "EXPOSURE_RETAINED_SESSIONS",
                    exp_defaults.retained_backtest_partitions,
                ),
                restart_policy: env_or("BACKTEST_RESTART", exp_defaults.restart_policy),
            },
        }
    }
}
