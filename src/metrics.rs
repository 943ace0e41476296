//! Narrow stand-in for the out-of-scope metrics exporter: the engine records
//! counters/gauges through this trait and something else (a Prometheus or
//! StatsD sink, not shipped here) is expected to read them.

/// Counters and gauges the cache engine emits. Names match the dotted
/// convention used in the monitoring surface (`cache.set.total`,
/// `cache.ring.members`, ...).
pub trait MetricsSink: Send + Sync {
    fn record_counter(&self, name: &str, value: u64);
    fn set_gauge(&self, name: &str, value: u64);
}

/// Discards everything. The default when no sink is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record_counter(&self, _name: &str, _value: u64) {}
    fn set_gauge(&self, _name: &str, _value: u64) {}
}

/// Logs every counter/gauge update through `tracing`. Useful for local
/// development and for tests that want to assert a metric fired without
/// standing up a real exporter.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record_counter(&self, name: &str, value: u64) {
        tracing::debug!(metric = name, value, "counter");
    }

    fn set_gauge(&self, name: &str, value: u64) {
        tracing::debug!(metric = name, value, "gauge");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sink_accepts_anything() {
        let sink = NoopMetricsSink;
        sink.record_counter("cache.set.total", 1);
        sink.set_gauge("cache.ring.members", 3);
    }
}
