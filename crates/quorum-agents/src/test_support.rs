//! Test support: agent units that answer without spawning a model.
//!
//! `ScriptedAgent` replays a fixed behavior per instrument (respond, fail,
//! hang, panic) and records what it was asked. `IndicatorAgent` reads the
//! market context the way the technical prompt describes and derives a
//! verdict from it, so context plumbing can be tested end to end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use quorum_models::{AgentInput, AgentVerdict, Direction};
use rust_decimal::Decimal;

use crate::error::AgentError;
use crate::unit::AgentUnit;

/// What a scripted agent does when called.
#[derive(Debug, Clone)]
pub enum Script {
    Respond {
        verdict: AgentVerdict,
        delay: Duration,
    },
    Fail(String),
    /// Reports that the agent's own call limit ran out after this many ms.
    TimedOut(u64),
    /// Never returns; only a deadline or cancellation ends the call.
    Hang,
    Panic,
    /// Fail the first `failures` calls, then respond.
    Flaky {
        failures: usize,
        verdict: AgentVerdict,
    },
}

pub struct ScriptedAgent {
    id: String,
    default: Script,
    per_instrument: HashMap<String, Script>,
    calls: AtomicUsize,
    inputs: Mutex<Vec<AgentInput>>,
}

impl ScriptedAgent {
    pub fn new(id: &str, default: Script) -> Self {
        Self {
            id: id.to_string(),
            default,
            per_instrument: HashMap::new(),
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn responding(id: &str, direction: Direction, confidence: Decimal) -> Self {
        Self::new(
            id,
            Script::Respond {
                verdict: AgentVerdict::new(direction, confidence, &format!("{id} scripted")),
                delay: Duration::ZERO,
            },
        )
    }

    pub fn failing(id: &str) -> Self {
        Self::new(id, Script::Fail(format!("{id} unavailable")))
    }

    pub fn hanging(id: &str) -> Self {
        Self::new(id, Script::Hang)
    }

    pub fn panicking(id: &str) -> Self {
        Self::new(id, Script::Panic)
    }

    pub fn flaky(id: &str, failures: usize, direction: Direction, confidence: Decimal) -> Self {
        Self::new(
            id,
            Script::Flaky {
                failures,
                verdict: AgentVerdict::new(direction, confidence, &format!("{id} recovered")),
            },
        )
    }

    /// Delay every scripted response by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        let apply = |script: &mut Script| {
            if let Script::Respond { delay: d, .. } = script {
                *d = delay;
            }
        };
        apply(&mut self.default);
        self.per_instrument.values_mut().for_each(apply);
        self
    }

    /// Override the behavior for one instrument.
    pub fn with_script(mut self, instrument_id: &str, script: Script) -> Self {
        self.per_instrument.insert(instrument_id.to_string(), script);
        self
    }

    pub fn with_instrument(self, instrument_id: &str, direction: Direction, confidence: Decimal) -> Self {
        let verdict = AgentVerdict::new(
            direction,
            confidence,
            &format!("{} on {instrument_id}", self.id),
        );
        self.with_script(
            instrument_id,
            Script::Respond {
                verdict,
                delay: Duration::ZERO,
            },
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Inputs received so far, in call order.
    pub fn inputs(&self) -> Vec<AgentInput> {
        self.inputs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AgentUnit for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, input: &AgentInput) -> Result<AgentVerdict, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(input.clone());

        let script = self
            .per_instrument
            .get(&input.instrument_id)
            .unwrap_or(&self.default)
            .clone();
        match script {
            Script::Respond { verdict, delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(verdict)
            }
            Script::Fail(reason) => Err(AgentError::Execution(reason)),
            Script::TimedOut(ms) => Err(AgentError::Timeout(ms)),
            Script::Hang => std::future::pending().await,
            Script::Panic => panic!("{} panicked on {}", self.id, input.instrument_id),
            Script::Flaky { failures, verdict } => {
                if call < failures {
                    Err(AgentError::Execution(format!("{} transient failure", self.id)))
                } else {
                    Ok(verdict)
                }
            }
        }
    }
}

/// Helper to get a nested last value: data[outer_key][inner_key].last()
fn last_nested_value(data: &serde_json::Value, outer_key: &str, inner_key: &str) -> Option<f64> {
    data.get(outer_key)
        .and_then(|obj| obj.get(inner_key))
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.last())
        .and_then(|v| v.as_f64())
}

/// Count consecutive direction from the end of a price series.
/// Positive for consecutive higher closes, negative for lower.
fn consecutive_trend(values: &[f64]) -> i32 {
    let mut count = 0i32;
    for pair in values.windows(2).rev() {
        let step = if pair[1] > pair[0] {
            1
        } else if pair[1] < pair[0] {
            -1
        } else {
            break;
        };
        if count != 0 && count.signum() != step {
            break;
        }
        count += step;
    }
    count
}

fn closes(data: &serde_json::Value, bars_key: &str) -> Vec<f64> {
    data.get(bars_key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|bar| bar.get("close").and_then(|c| c.as_f64()))
                .collect()
        })
        .unwrap_or_default()
}

/// Reads RSI and recent bars from the context and scores them with the
/// rules the technical prompt lists. With no usable data it holds at 0.5.
pub struct IndicatorAgent {
    id: String,
}

impl IndicatorAgent {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[async_trait]
impl AgentUnit for IndicatorAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, input: &AgentInput) -> Result<AgentVerdict, AgentError> {
        let symbol = &input.instrument_id;
        let data = &input.context.data;
        let mut score = 0.0f64;
        let mut reasons: Vec<String> = Vec::new();

        if let Some(rsi) = last_nested_value(data, &format!("indicator:rsi_14:{symbol}"), "value") {
            if rsi < 30.0 {
                score += 0.3;
                reasons.push(format!("RSI {rsi:.0} oversold"));
            } else if rsi > 70.0 {
                score -= 0.3;
                reasons.push(format!("RSI {rsi:.0} overbought"));
            } else {
                reasons.push(format!("RSI {rsi:.0} neutral"));
            }
        }

        let trend = consecutive_trend(&closes(data, &format!("bars:{symbol}:5m")));
        if trend.abs() >= 3 {
            score += 0.1 * f64::from(trend.signum());
            reasons.push(format!("{} consecutive closes", trend.abs()));
        }

        let direction = if score > 0.0 {
            Direction::Buy
        } else if score < 0.0 {
            Direction::Sell
        } else {
            Direction::Hold
        };
        let confidence = Decimal::try_from((0.5 + score.abs()).min(1.0))
            .map_err(|e| AgentError::Parse(e.to_string()))?
            .round_dp(2);
        let rationale = if reasons.is_empty() {
            "No indicator data".to_string()
        } else {
            reasons.join("; ")
        };
        Ok(AgentVerdict::new(direction, confidence, &rationale))
    }
}
