//! The metrics-sink collaborator: the scheduler and pools report usage
//! through this seam rather than calling a concrete backend directly, so
//! accounting logic stays separate from where the numbers end up.

use foliant_domain::{MetricsTag, UsageInfo};

pub trait MetricsSink: Send + Sync {
    fn record_usage(&self, tag: &MetricsTag, usage: &UsageInfo);
    fn record_failure(&self, tag: &MetricsTag, error: &str);
}

/// Default sink: usage and failures go to the tracing subscriber at
/// info/warn, tagged with whatever of book/stage/item/prompt the caller
/// populated. Good enough to run without a metrics backend wired up.
#[derive(Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record_usage(&self, tag: &MetricsTag, usage: &UsageInfo) {
        tracing::info!(
            book_id = tag.book_id.as_deref().unwrap_or("-"),
            stage = tag.stage.as_deref().unwrap_or("-"),
            item_key = tag.item_key.as_deref().unwrap_or("-"),
            prompt_key = tag.prompt_key.as_deref().unwrap_or("-"),
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            latency_ms = usage.latency_ms,
            cost_usd = usage.cost_usd,
            "work unit completed"
        );
    }

    fn record_failure(&self, tag: &MetricsTag, error: &str) {
        tracing::warn!(
            book_id = tag.book_id.as_deref().unwrap_or("-"),
            stage = tag.stage.as_deref().unwrap_or("-"),
            item_key = tag.item_key.as_deref().unwrap_or("-"),
            error,
            "work unit failed"
        );
    }
}

#[derive(Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record_usage(&self, _tag: &MetricsTag, _usage: &UsageInfo) {}
    fn record_failure(&self, _tag: &MetricsTag, _error: &str) {}
}
