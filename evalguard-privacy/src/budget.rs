//! Windowed differential-privacy budget with a per-window answer cache.
//!
//! Each distinct `(query_type, parameters)` pair is computed and charged at
//! most once per window; repeats replay the stored noised answer, so noise
//! cannot be averaged away by asking again. Windows rotate lazily on the
//! first operation at or after `window_end`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::BudgetConfig;

const EPSILON_TOLERANCE: f64 = 1e-9;
const MAX_WINDOW_SECS: u64 = 10 * 366 * 24 * 60 * 60;

#[derive(Debug, Error, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BudgetError {
    #[error("privacy budget exhausted for this window, try again after {window_end}")]
    Exhausted { window_end: DateTime<Utc> },
    #[error("query limit of {max_queries} reached for this window, try again after {window_end}")]
    QueryLimit {
        max_queries: u32,
        window_end: DateTime<Utc>,
    },
    #[error("query needs epsilon {requested} but only {remaining} remains in this window")]
    InsufficientBudget { requested: f64, remaining: f64 },
    #[error("epsilon must be a positive finite number, got {epsilon}")]
    InvalidEpsilon { epsilon: f64 },
    #[error("query computation failed: {reason}")]
    Compute { reason: String },
}

/// Deterministic digest of query type and parameters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(String);

impl QueryId {
    pub fn derive(query_type: &str, parameters: &Value) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(query_type.as_bytes());
        hasher.update(&[0u8]);
        hasher.update(canonical(parameters).to_string().as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Rebuilds `value` with object keys in sorted order at every depth, so the
/// serialized form does not depend on insertion order.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, child)| (key.clone(), canonical(child)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query_type: String,
    #[serde(default)]
    pub parameters: Value,
    /// Falls back to the configured default when absent.
    #[serde(default)]
    pub epsilon: Option<f64>,
}

impl QueryRequest {
    pub fn new(query_type: impl Into<String>, parameters: Value) -> Self {
        Self {
            query_type: query_type.into(),
            parameters,
            epsilon: None,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = Some(epsilon);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStatus {
    pub window_id: u64,
    pub remaining_budget: f64,
    pub queries_used: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub budget_exhausted: bool,
    pub max_queries: u32,
    pub total_budget: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub query_id: QueryId,
    pub query_type: String,
    pub timestamp: DateTime<Utc>,
    pub epsilon_cost: f64,
    pub result: Value,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutcome {
    pub success: bool,
    pub cached: bool,
    pub result: Option<Value>,
    pub budget_status: BudgetStatus,
    pub error: Option<BudgetError>,
}

struct BudgetWindow {
    window_id: u64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    remaining_budget: f64,
    queries_used: u32,
    ledger: HashMap<QueryId, LedgerEntry>,
}

impl BudgetWindow {
    fn open(window_id: u64, start: DateTime<Utc>, config: &BudgetConfig) -> Self {
        let secs = config.window_secs.clamp(1, MAX_WINDOW_SECS) as i64;
        Self {
            window_id,
            start,
            end: start + Duration::seconds(secs),
            remaining_budget: config.total_budget,
            queries_used: 0,
            ledger: HashMap::new(),
        }
    }

    fn is_exhausted(&self, config: &BudgetConfig) -> bool {
        self.remaining_budget <= 0.0 || self.queries_used >= config.max_queries
    }

    fn status(&self, config: &BudgetConfig) -> BudgetStatus {
        BudgetStatus {
            window_id: self.window_id,
            remaining_budget: self.remaining_budget,
            queries_used: self.queries_used,
            window_start: self.start,
            window_end: self.end,
            budget_exhausted: self.is_exhausted(config),
            max_queries: config.max_queries,
            total_budget: config.total_budget,
        }
    }
}

/// Process-wide budget ledger. Share it behind an `Arc`; every operation
/// takes the same lock, so rotation, cache lookup, the exhaustion check and
/// the deduction happen atomically.
pub struct PrivacyBudgetTracker {
    config: BudgetConfig,
    clock: Arc<dyn Clock>,
    window: Mutex<BudgetWindow>,
}

impl PrivacyBudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BudgetConfig, clock: Arc<dyn Clock>) -> Self {
        let window = BudgetWindow::open(0, clock.now(), &config);
        Self {
            config,
            clock,
            window: Mutex::new(window),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn get_budget_status(&self) -> BudgetStatus {
        let mut window = self.window.lock();
        self.rotate_if_expired(&mut window);
        window.status(&self.config)
    }

    /// Runs `compute` with the epsilon to charge, unless the answer is
    /// already cached for this window or the budget refuses it. `compute`
    /// runs under the tracker lock and must not block on I/O.
    pub fn execute_query<F, E>(&self, request: &QueryRequest, compute: F) -> QueryOutcome
    where
        F: FnOnce(f64) -> Result<Value, E>,
        E: fmt::Display,
    {
        let mut window = self.window.lock();
        self.rotate_if_expired(&mut window);

        let query_id = QueryId::derive(&request.query_type, &request.parameters);
        if let Some(entry) = window.ledger.get(&query_id) {
            debug!(query_type = %request.query_type, %query_id, "replaying cached dp answer");
            return QueryOutcome {
                success: true,
                cached: true,
                result: Some(entry.result.clone()),
                budget_status: window.status(&self.config),
                error: None,
            };
        }

        let epsilon = request.epsilon.unwrap_or(self.config.default_epsilon);
        if let Err(error) = self.admit(&window, epsilon) {
            warn!(query_type = %request.query_type, %error, "dp query refused");
            return self.refused(&window, error);
        }

        let result = match compute(epsilon) {
            Ok(result) => result,
            Err(err) => {
                let error = BudgetError::Compute {
                    reason: err.to_string(),
                };
                warn!(query_type = %request.query_type, %error, "dp query failed, budget untouched");
                return self.refused(&window, error);
            }
        };

        window.remaining_budget -= epsilon;
        if window.remaining_budget < EPSILON_TOLERANCE {
            window.remaining_budget = 0.0;
        }
        window.queries_used += 1;
        let timestamp = self.clock.now();
        window.ledger.insert(
            query_id.clone(),
            LedgerEntry {
                query_id,
                query_type: request.query_type.clone(),
                timestamp,
                epsilon_cost: epsilon,
                result: result.clone(),
            },
        );
        debug!(
            query_type = %request.query_type,
            epsilon,
            remaining = window.remaining_budget,
            "dp query charged"
        );

        QueryOutcome {
            success: true,
            cached: false,
            result: Some(result),
            budget_status: window.status(&self.config),
            error: None,
        }
    }

    /// Starts a fresh window immediately. This voids the privacy guarantee
    /// for everything answered in the current window.
    pub fn reset_budget(&self) {
        let mut window = self.window.lock();
        let next_id = window.window_id + 1;
        warn!(
            window_id = window.window_id,
            queries_used = window.queries_used,
            "privacy budget manually reset"
        );
        *window = BudgetWindow::open(next_id, self.clock.now(), &self.config);
    }

    /// Entries charged in the current window, oldest first.
    pub fn ledger(&self) -> Vec<LedgerEntry> {
        let mut window = self.window.lock();
        self.rotate_if_expired(&mut window);
        let mut entries: Vec<_> = window.ledger.values().cloned().collect();
        entries.sort_by_key(|entry| entry.timestamp);
        entries
    }

    fn admit(&self, window: &BudgetWindow, epsilon: f64) -> Result<(), BudgetError> {
        if !(epsilon.is_finite() && epsilon > 0.0) {
            return Err(BudgetError::InvalidEpsilon { epsilon });
        }
        if window.remaining_budget <= 0.0 {
            return Err(BudgetError::Exhausted {
                window_end: window.end,
            });
        }
        if window.queries_used >= self.config.max_queries {
            return Err(BudgetError::QueryLimit {
                max_queries: self.config.max_queries,
                window_end: window.end,
            });
        }
        if epsilon > window.remaining_budget + EPSILON_TOLERANCE {
            return Err(BudgetError::InsufficientBudget {
                requested: epsilon,
                remaining: window.remaining_budget,
            });
        }
        Ok(())
    }

    fn refused(&self, window: &BudgetWindow, error: BudgetError) -> QueryOutcome {
        QueryOutcome {
            success: false,
            cached: false,
            result: None,
            budget_status: window.status(&self.config),
            error: Some(error),
        }
    }

    fn rotate_if_expired(&self, window: &mut BudgetWindow) {
        let now = self.clock.now();
        if now < window.end {
            return;
        }
        let next_id = window.window_id + 1;
        info!(
            window_id = next_id,
            previous_queries = window.queries_used,
            "privacy budget window rotated"
        );
        *window = BudgetWindow::open(next_id, now, &self.config);
    }
}
