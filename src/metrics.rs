//! Prometheus adapter (spec §4.9): a request counter and an executor
//! in-flight gauge, exposed as the default text encoding on `GET /metrics`.
//!
//! Grounded on the `prometheus` crate's own registry idiom (no teacher
//! counterpart — the teacher has no metrics surface at all); kept narrow on
//! purpose, a thin adapter rather than a metrics subsystem.

use prometheus::{Encoder, IntCounterVec, IntGauge, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    requests_total: IntCounterVec,
    in_flight: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            prometheus::opts!(
                "hookforge_requests_total",
                "Total hook invocation requests by status class"
            ),
            &["status_class"],
        )
        .expect("valid metric definition");
        let in_flight = IntGauge::new(
            "hookforge_executor_in_flight",
            "Number of hook commands currently executing",
        )
        .expect("valid metric definition");

        registry
            .register(Box::new(requests_total.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(in_flight.clone()))
            .expect("unique metric name");

        Metrics {
            registry,
            requests_total,
            in_flight,
        }
    }

    pub fn record_response(&self, status: u16) {
        let class = match status {
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            500..=599 => "5xx",
            _ => "other",
        };
        self.requests_total.with_label_values(&[class]).inc();
    }

    pub fn set_in_flight(&self, n: usize) {
        self.in_flight.set(n as i64);
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut buf)
            .expect("text encoding never fails for well-formed families");
        String::from_utf8(buf).expect("prometheus text encoder emits valid utf8")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_series() {
        let m = Metrics::new();
        m.record_response(200);
        m.record_response(503);
        m.set_in_flight(3);
        let text = m.render();
        assert!(text.contains("hookforge_requests_total"));
        assert!(text.contains("hookforge_executor_in_flight 3"));
    }
}
