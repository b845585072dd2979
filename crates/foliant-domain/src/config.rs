use serde::{Deserialize, Serialize};

/// Retry policy shared by page-level operations and book-scoped
/// operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "d_max_retries")]
    pub max_retries: u32,
}

fn d_max_retries() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: d_max_retries(),
        }
    }
}

/// Construction-time configuration for one pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    /// Maximum in-flight requests.
    #[serde(default = "d_concurrency")]
    pub concurrency: usize,
    /// Requests per second enforced before concurrency admission.
    #[serde(default = "d_rps")]
    pub requests_per_second: u32,
    /// Queue depth above which the pool is considered backpressured for
    /// progress-reporting purposes.
    #[serde(default = "d_high_water_mark")]
    pub high_water_mark: usize,
}

fn d_concurrency() -> usize {
    4
}
fn d_rps() -> u32 {
    2
}
fn d_high_water_mark() -> usize {
    64
}

impl PoolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: d_concurrency(),
            requests_per_second: d_rps(),
            high_water_mark: d_high_water_mark(),
        }
    }
}

/// Top-level scheduler configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub retry: RetryConfig,
}
