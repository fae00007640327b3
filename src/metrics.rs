//! Prometheus metrics for the mirror
//!
//! A process-owned [`Registry`] rather than the global default, so tests can
//! build as many instances as they like.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};

/// Counters and gauges exposed on `/metrics`
#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Registry,
    redirect_decisions: IntCounterVec,
    uploads: IntCounterVec,
    responses: IntCounterVec,
    pending_uploads: IntGauge,
}

fn metrics_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

impl ProxyMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("goproxy_cn".to_string()), None)
            .map_err(metrics_err)?;

        let redirect_decisions = IntCounterVec::new(
            Opts::new(
                "redirect_decisions_total",
                "Artifact requests by redirect decision",
            ),
            &["decision"],
        )
        .map_err(metrics_err)?;
        let uploads = IntCounterVec::new(
            Opts::new("uploads_total", "Staged artifact promotions by outcome"),
            &["outcome"],
        )
        .map_err(metrics_err)?;
        let responses = IntCounterVec::new(
            Opts::new("responses_total", "Front door responses by status code"),
            &["status"],
        )
        .map_err(metrics_err)?;
        let pending_uploads = IntGauge::new(
            "pending_uploads",
            "Artifacts staged locally and not yet promoted",
        )
        .map_err(metrics_err)?;

        registry
            .register(Box::new(redirect_decisions.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(uploads.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(responses.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(pending_uploads.clone()))
            .map_err(metrics_err)?;

        Ok(Self {
            registry,
            redirect_decisions,
            uploads,
            responses,
            pending_uploads,
        })
    }

    /// `decision` is one of `redirect`, `below_threshold`, `miss`, `ineligible`.
    pub fn record_decision(&self, decision: &str) {
        self.redirect_decisions.with_label_values(&[decision]).inc();
    }

    /// `outcome` is one of `uploaded`, `exists`, `missing`, `retry`, `failed`.
    pub fn record_upload(&self, outcome: &str) {
        self.uploads.with_label_values(&[outcome]).inc();
    }

    pub fn record_response(&self, status: u16) {
        self.responses
            .with_label_values(&[status.to_string().as_str()])
            .inc();
    }

    pub fn set_pending_uploads(&self, n: usize) {
        self.pending_uploads.set(n as i64);
    }

    pub fn decision_count(&self, decision: &str) -> u64 {
        self.redirect_decisions.with_label_values(&[decision]).get()
    }

    pub fn upload_count(&self, outcome: &str) -> u64 {
        self.uploads.with_label_values(&[outcome]).get()
    }

    /// Text exposition of every registered metric.
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_err)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_exposition() {
        let metrics = ProxyMetrics::new().unwrap();
        metrics.record_decision("redirect");
        metrics.record_decision("redirect");
        metrics.record_upload("uploaded");
        metrics.record_response(302);
        metrics.set_pending_uploads(3);

        assert_eq!(metrics.decision_count("redirect"), 2);
        assert_eq!(metrics.upload_count("uploaded"), 1);
        assert_eq!(metrics.upload_count("failed"), 0);

        let (content_type, body) = metrics.encode().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("goproxy_cn_redirect_decisions_total{decision=\"redirect\"} 2"));
        assert!(text.contains("goproxy_cn_pending_uploads 3"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = ProxyMetrics::new().unwrap();
        let b = ProxyMetrics::new().unwrap();
        a.record_upload("failed");
        assert_eq!(b.upload_count("failed"), 0);
    }
}
