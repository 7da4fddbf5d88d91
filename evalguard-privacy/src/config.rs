use serde::{Deserialize, Serialize};

const fn default_delay_min_secs() -> u64 {
    1
}

const fn default_delay_max_secs() -> u64 {
    3
}

const fn default_mixing_window_minutes() -> u32 {
    15
}

const fn default_min_group_size() -> usize {
    5
}

const fn default_min_responses() -> usize {
    10
}

const fn default_max_comment_chars() -> usize {
    2_000
}

/// Knobs for the anonymization toolkit.
///
/// # TOML
/// ```text
/// [anonymity]
/// delay-min-secs = 1
/// delay-max-secs = 3
/// mixing-window-minutes = 15
/// min-group-size = 5
/// min-responses = 10
/// max-comment-chars = 2000
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct AnonymityConfig {
    #[serde(default = "default_delay_min_secs")]
    pub delay_min_secs: u64,
    #[serde(default = "default_delay_max_secs")]
    pub delay_max_secs: u64,
    #[serde(default = "default_mixing_window_minutes")]
    pub mixing_window_minutes: u32,
    /// k for the k-anonymity gate.
    #[serde(default = "default_min_group_size")]
    pub min_group_size: usize,
    #[serde(default = "default_min_responses")]
    pub min_responses: usize,
    #[serde(default = "default_max_comment_chars")]
    pub max_comment_chars: usize,
}

impl Default for AnonymityConfig {
    fn default() -> Self {
        Self {
            delay_min_secs: default_delay_min_secs(),
            delay_max_secs: default_delay_max_secs(),
            mixing_window_minutes: default_mixing_window_minutes(),
            min_group_size: default_min_group_size(),
            min_responses: default_min_responses(),
            max_comment_chars: default_max_comment_chars(),
        }
    }
}

const fn default_total_budget() -> f64 {
    10.0
}

const fn default_max_queries() -> u32 {
    100
}

const fn default_window_secs() -> u64 {
    24 * 60 * 60
}

const fn default_epsilon() -> f64 {
    0.1
}

/// Per-window differential-privacy allowance.
///
/// # TOML
/// ```text
/// [budget]
/// total-budget = 10.0
/// max-queries = 100
/// window-secs = 86400
/// default-epsilon = 0.1
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct BudgetConfig {
    #[serde(default = "default_total_budget")]
    pub total_budget: f64,
    #[serde(default = "default_max_queries")]
    pub max_queries: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Charged when a query does not name its own epsilon.
    #[serde(default = "default_epsilon")]
    pub default_epsilon: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            total_budget: default_total_budget(),
            max_queries: default_max_queries(),
            window_secs: default_window_secs(),
            default_epsilon: default_epsilon(),
        }
    }
}
