//! Pattern records and the ingest payload they are built from.

use std::collections::BTreeMap;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::classifier::{DurationProfile, MoveProfile};
use crate::codec::FeatureInput;
use crate::error::ValidationError;

pub const LIVE_SESSION: &str = "live";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "buy" => Some(Direction::Long),
            "short" | "sell" => Some(Direction::Short),
            _ => None,
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    TrailingStop,
    TimeExit,
    SignalExit,
    Manual,
    Unknown,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::TimeExit => "time_exit",
            ExitReason::SignalExit => "signal_exit",
            ExitReason::Manual => "manual",
            ExitReason::Unknown => "unknown",
        }
    }
}

impl From<String> for ExitReason {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "take_profit" | "tp" | "target" => ExitReason::TakeProfit,
            "stop_loss" | "sl" | "stop" => ExitReason::StopLoss,
            "trailing_stop" => ExitReason::TrailingStop,
            "time_exit" | "timeout" => ExitReason::TimeExit,
            "signal_exit" | "signal" => ExitReason::SignalExit,
            "manual" => ExitReason::Manual,
            _ => ExitReason::Unknown,
        }
    }
}

impl From<ExitReason> for String {
    fn from(r: ExitReason) -> Self {
        r.as_str().to_string()
    }
}

impl Default for ExitReason {
    fn default() -> Self {
        ExitReason::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Training,
    Recent,
}

impl Default for DataType {
    fn default() -> Self {
        DataType::Recent
    }
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Training => "training",
            DataType::Recent => "recent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub pnl: f64,
    #[serde(default)]
    pub pnl_points: f64,
    #[serde(default)]
    pub holding_bars: Option<u32>,
    #[serde(default)]
    pub exit_reason: ExitReason,
    #[serde(default)]
    pub max_favorable_excursion: f64,
    #[serde(default)]
    pub max_adverse_excursion: f64,
}

impl Outcome {
    pub fn with_pnl(pnl: f64) -> Self {
        Self {
            pnl,
            pnl_points: 0.0,
            holding_bars: None,
            exit_reason: ExitReason::Unknown,
            max_favorable_excursion: 0.0,
            max_adverse_excursion: 0.0,
        }
    }

    /// Size of the move in points, falling back to currency pnl.
    pub fn move_magnitude(&self) -> f64 {
        if self.pnl_points != 0.0 {
            self.pnl_points.abs()
        } else {
            self.pnl.abs()
        }
    }
}

/// Trade time as either epoch milliseconds or an RFC 3339 string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TradeTimestamp {
    Millis(i64),
    Text(String),
}

impl TradeTimestamp {
    pub fn to_millis(&self) -> Result<i64, ValidationError> {
        match self {
            TradeTimestamp::Millis(ms) => Ok(*ms),
            TradeTimestamp::Text(s) => {
                if let Ok(ms) = s.trim().parse::<i64>() {
                    return Ok(ms);
                }
                DateTime::parse_from_rfc3339(s.trim())
                    .map(|dt| dt.timestamp_millis())
                    .map_err(|e| ValidationError::InvalidTimestamp {
                        value: s.clone(),
                        reason: e.to_string(),
                    })
            }
        }
    }
}

/// Ingest payload reported by the execution engine when a trade closes.
///
/// Derived labels are not part of this type: they are always computed when
/// the record is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedTrade {
    pub entry_signal_id: Option<String>,
    pub instrument: Option<String>,
    pub timestamp: Option<TradeTimestamp>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub entry_type: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub data_type: DataType,
    pub features: Option<FeatureInput>,
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub trajectory: Option<BTreeMap<u32, f64>>,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Long
    }
}

/// Required fields of a trade once validated.
#[derive(Debug, Clone)]
pub struct ValidatedTrade {
    pub entry_signal_id: String,
    pub instrument: String,
    pub timestamp_ms: i64,
    pub features: FeatureInput,
    pub outcome: Outcome,
    pub trajectory: BTreeMap<u32, f64>,
}

impl Outcome {
    /// First numeric field that is NaN or infinite.
    fn non_finite_field(&self) -> Option<&'static str> {
        [
            ("outcome.pnl", self.pnl),
            ("outcome.pnlPoints", self.pnl_points),
            ("outcome.maxFavorableExcursion", self.max_favorable_excursion),
            ("outcome.maxAdverseExcursion", self.max_adverse_excursion),
        ]
        .into_iter()
        .find(|(_, v)| !v.is_finite())
        .map(|(name, _)| name)
    }
}

impl CompletedTrade {
    pub fn validate(&self) -> Result<ValidatedTrade, ValidationError> {
        let timestamp_ms = self
            .timestamp
            .as_ref()
            .ok_or(ValidationError::MissingField("timestamp"))?
            .to_millis()?;
        let entry_signal_id = self
            .entry_signal_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingField("entrySignalId"))?
            .to_string();
        let instrument = self
            .instrument
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingField("instrument"))?
            .to_string();
        let features = self
            .features
            .clone()
            .ok_or(ValidationError::MissingField("features"))?;
        let outcome = self.outcome.clone().ok_or(ValidationError::MissingField("outcome.pnl"))?;
        if let Some(field) = outcome.non_finite_field() {
            return Err(ValidationError::NonFinite(field));
        }
        let trajectory = self.trajectory.clone().unwrap_or_default();
        if trajectory.values().any(|v| !v.is_finite()) {
            return Err(ValidationError::NonFinite("trajectory"));
        }
        Ok(ValidatedTrade { entry_signal_id, instrument, timestamp_ms, features, outcome, trajectory })
    }
}

/// One stored historical trade. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub id: String,
    pub entry_signal_id: String,
    pub timestamp_ms: i64,
    pub instrument: String,
    pub direction: Direction,
    pub entry_type: Option<String>,
    pub session_id: String,
    pub data_type: DataType,
    /// Dimension the vector was encoded with.
    pub schema_version: u32,
    pub feature_vector: Vec<f64>,
    pub feature_names: Vec<String>,
    pub outcome: Outcome,
    pub trajectory: BTreeMap<u32, f64>,
    pub duration: DurationProfile,
    pub movement: MoveProfile,
}

impl PatternRecord {
    pub fn is_win(&self) -> bool {
        self.outcome.pnl > 0.0
    }

    /// Sign of the market move implied by the trade: +1 up, -1 down, 0 flat.
    pub fn implied_move(&self) -> f64 {
        if self.outcome.pnl > 0.0 {
            self.direction.sign()
        } else if self.outcome.pnl < 0.0 {
            -self.direction.sign()
        } else {
            0.0
        }
    }
}

/// Deterministic pattern id for a (signal, timestamp) pair.
pub fn derive_pattern_id(entry_signal_id: &str, timestamp_ms: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entry_signal_id.as_bytes());
    hasher.update(b":");
    hasher.update(timestamp_ms.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("pat_{}", &digest[..24])
}

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

fn is_contract_suffix(token: &str) -> bool {
    let upper = token.to_ascii_uppercase();
    if !upper.is_ascii() {
        return false;
    }
    let is_month_code = upper.len() == 5
        && MONTHS.contains(&&upper[..3])
        && upper[3..].chars().all(|c| c.is_ascii_digit());
    let is_year = upper.len() == 4 && upper.chars().all(|c| c.is_ascii_digit());
    is_month_code || is_year
}

/// Strip contract month/year suffixes: `"MGC AUG25"` and `"ES 2025"` map to
/// their root symbol.
pub fn normalize_instrument(instrument: &str) -> String {
    let mut tokens: Vec<&str> = instrument.split_whitespace().collect();
    while tokens.len() > 1 && tokens.last().map(|t| is_contract_suffix(t)).unwrap_or(false) {
        tokens.pop();
    }
    tokens.join(" ")
}
