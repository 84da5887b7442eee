//! JSONL driver: one command per stdin line, one response per stdout line.
//!
//! ```text
//! {"op":"store","trade":{"entrySignalId":"s1","instrument":"MGC","timestamp":1700000000000,
//!   "features":{"rsi":0.4},"outcome":{"pnl":12.5,"holdingBars":18}}}
//! {"op":"flush"}
//! {"op":"find_similar","vector":[0.4],"query":{"instrument":"MGC","limit":5}}
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use pattern_memory::codec::FeatureInput;
use pattern_memory::context::ContextQuery;
use pattern_memory::engine::{DurationQuery, EvaluationRequest};
use pattern_memory::exposure::ExposureQuery;
use pattern_memory::logging::{log, obj, v_num, v_str, Domain, Level};
use pattern_memory::record::{CompletedTrade, TradeTimestamp};
use pattern_memory::store::{SimilarityQuery, SimilarityResponse};
use pattern_memory::{Config, MemoryError, PatternMemory};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Command {
    Store {
        trade: CompletedTrade,
    },
    Flush,
    Encode {
        features: FeatureInput,
    },
    FindSimilar {
        vector: Vec<f64>,
        #[serde(default)]
        query: SimilarityQuery,
    },
    PredictDuration {
        vector: Vec<f64>,
        #[serde(default)]
        query: DurationQuery,
    },
    ExtractContext {
        vector: Vec<f64>,
        query: ContextQuery,
    },
    StartBacktest {
        start: TradeTimestamp,
        end: TradeTimestamp,
        #[serde(default)]
        reset_learning: bool,
        #[serde(default)]
        session_id: Option<String>,
    },
    EndBacktest,
    ShouldAllowPattern {
        pattern_id: String,
        pattern_timestamp: TradeTimestamp,
        #[serde(default)]
        features: Option<Vec<f64>>,
        #[serde(default)]
        timestamp: Option<TradeTimestamp>,
    },
    Adjust {
        base_confidence: f64,
        entry_signal_id: String,
        timestamp: TradeTimestamp,
        #[serde(default)]
        features: Option<Vec<f64>>,
    },
    Evaluate {
        request: EvaluationRequest,
    },
    Health,
}

fn similarity_json(resp: &SimilarityResponse) -> Value {
    let matches: Vec<Value> = resp
        .matches
        .iter()
        .map(|m| {
            json!({
                "id": m.record.id,
                "entrySignalId": m.record.entry_signal_id,
                "instrument": m.record.instrument,
                "direction": m.record.direction,
                "timestampMs": m.record.timestamp_ms,
                "sessionId": m.record.session_id,
                "similarity": m.similarity,
                "outcome": m.record.outcome,
                "duration": m.record.duration,
                "movement": m.record.movement,
            })
        })
        .collect();
    json!({
        "matches": matches,
        "candidatesScanned": resp.candidates_scanned,
        "truncated": resp.truncated,
    })
}

async fn handle(pm: &mut PatternMemory, cmd: Command) -> std::result::Result<Value, MemoryError> {
    let value = match cmd {
        Command::Store { trade } => json!({ "id": pm.store(&trade).await? }),
        Command::Flush => json!({ "committed": pm.flush().await? }),
        Command::Encode { features } => {
            let encoded = pm.encode(&features);
            json!({ "vector": encoded.vector, "names": encoded.names, "dropped": encoded.dropped })
        }
        Command::FindSimilar { vector, query } => similarity_json(&pm.find_similar(&vector, query)?),
        Command::PredictDuration { vector, query } => json!(pm.predict_duration(&vector, &query)?),
        Command::ExtractContext { vector, query } => {
            let ctx = pm.extract_context(&vector, &query)?;
            json!({ "context": ctx, "features": ctx.to_features() })
        }
        Command::StartBacktest { start, end, reset_learning, session_id } => {
            let (start_ms, end_ms) = (start.to_millis()?, end.to_millis()?);
            let id = match session_id {
                Some(id) => {
                    pm.start_backtest_session(&id, start_ms, end_ms, reset_learning)?;
                    id
                }
                None => pm.start_backtest(start_ms, end_ms, reset_learning)?,
            };
            json!({ "sessionId": id })
        }
        Command::EndBacktest => json!(pm.end_backtest()?),
        Command::ShouldAllowPattern { pattern_id, pattern_timestamp, features, timestamp } => {
            let query = ExposureQuery {
                features,
                timestamp_ms: timestamp.map(|t| t.to_millis()).transpose()?,
            };
            json!(pm.should_allow_pattern(&pattern_id, pattern_timestamp.to_millis()?, &query)?)
        }
        Command::Adjust { base_confidence, entry_signal_id, timestamp, features } => json!(pm
            .apply_anti_overfitting_adjustment(
                base_confidence,
                &entry_signal_id,
                timestamp.to_millis()?,
                features.as_deref(),
            )?),
        Command::Evaluate { request } => json!(pm.evaluate(&request)?),
        Command::Health => json!(pm.health_report()?),
    };
    Ok(value)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let db_path = cfg.store.sqlite_path.clone();
    let mut pm = PatternMemory::open(cfg).with_context(|| format!("opening pattern store at {}", db_path))?;
    pm.initialize().context("initializing pattern memory")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut handled = 0u64;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Command>(line) {
            Ok(cmd) => match handle(&mut pm, cmd).await {
                Ok(result) => json!({ "ok": true, "result": result }),
                Err(e) => json!({ "ok": false, "error": e.to_string() }),
            },
            Err(e) => {
                log(Level::Warn, Domain::System, "bad_command", obj(&[("error", v_str(&e.to_string()))]));
                json!({ "ok": false, "error": format!("bad command: {}", e) })
            }
        };
        handled += 1;
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    pm.close().await.context("closing pattern memory")?;
    log(Level::Info, Domain::System, "driver_exit", obj(&[("commands", v_num(handled as f64))]));
    Ok(())
}
