use std::fmt::Write;

use anyhow::Result;

/// One named measurement with its tags.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub name: &'static str,
    pub value: f64,
    pub tags: Vec<(&'static str, String)>,
}

impl MetricPoint {
    pub fn new(name: &'static str, value: f64) -> Self { Self { name, value, tags: vec![] } }

    pub fn tag(mut self, key: &'static str, value: impl ToString) -> Self {
        self.tags.push((key, value.to_string()));
        self
    }
}

/// Destination for metric points.
pub trait MetricsSink: Send + Sync {
    fn send(&self, point: MetricPoint) -> Result<()>;
}

/// Writes every point as a `tracing` event on the `metrics` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn send(&self, point: MetricPoint) -> Result<()> {
        let mut tags = String::new();
        for (i, (key, value)) in point.tags.iter().enumerate() {
            if i > 0 {
                tags.push(',');
            }
            write!(tags, "{key}={value}")?;
        }
        tracing::info!(target: "metrics", name = point.name, value = point.value, tags = %tags);
        Ok(())
    }
}

/// Send a point, logging failures instead of returning them.
pub fn emit(sink: &dyn MetricsSink, point: MetricPoint) {
    let name = point.name;
    if let Err(e) = sink.send(point) {
        tracing::warn!("Failed to send metric {}: {:?}", name, e);
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;

    use super::*;

    struct FailingSink;

    impl MetricsSink for FailingSink {
        fn send(&self, _point: MetricPoint) -> Result<()> { bail!("sink unavailable") }
    }

    #[test]
    fn test_emit_swallows_errors() {
        emit(&FailingSink, MetricPoint::new("job_run.processed", 1.0));
        emit(&TracingMetrics, MetricPoint::new("job_run.tests", 3.0).tag("project", 1));
    }

    #[test]
    fn test_point_tags() {
        let point =
            MetricPoint::new("job_run.processed", 12.0).tag("project", 5).tag("job", "lint");
        assert_eq!(point.tags, vec![("project", "5".to_string()), ("job", "lint".to_string())]);
    }
}
