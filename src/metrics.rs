//! Fire-and-forget reporting of admission decisions.
//!
//! A sink is told about every counted decision. Reporting never blocks the decision and
//! its failures never reach the caller: the HTTP reporter posts from a spawned task and
//! only logs what goes wrong.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::MetricsConfig;
use crate::error::{FlowGuardError, Result};

/// Metric name used for every decision.
pub const DECISION_METRIC: &str = "rate_limit.decision";

/// Receives one notification per counted decision.
pub trait MetricsSink: Send + Sync {
    fn record_decision(&self, path: &str, allowed: bool);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record_decision(&self, _path: &str, _allowed: bool) {}
}

/// One reported sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    pub metric: String,
    /// Unix seconds
    pub timestamp: i64,
    pub value: f64,
    pub tags: HashMap<String, String>,
}

impl DataPoint {
    pub fn decision(path: &str, allowed: bool) -> Self {
        let status = if allowed { "allowed" } else { "blocked" };
        let tags = HashMap::from([
            ("path".to_string(), path.to_string()),
            ("status".to_string(), status.to_string()),
            ("source".to_string(), "flow_guard".to_string()),
        ]);

        Self {
            metric: DECISION_METRIC.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            value: 1.0,
            tags,
        }
    }
}

#[derive(Debug, Serialize)]
struct ReportPayload<'a> {
    app_id: &'a str,
    token: &'a str,
    data: &'a [DataPoint],
}

/// Posts decisions as JSON to a collector endpoint.
#[derive(Debug, Clone)]
pub struct HttpReporter {
    inner: Arc<ReporterInner>,
}

#[derive(Debug)]
struct ReporterInner {
    endpoint: String,
    app_id: String,
    token: String,
    client: reqwest::Client,
}

impl HttpReporter {
    pub fn new(
        endpoint: impl Into<String>,
        app_id: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FlowGuardError::Config(format!("metrics client: {}", e)))?;

        Ok(Self {
            inner: Arc::new(ReporterInner {
                endpoint: endpoint.into(),
                app_id: app_id.into(),
                token: token.into(),
                client,
            }),
        })
    }

    /// Build the reporter from configuration, if enabled.
    pub fn from_config(config: &MetricsConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let endpoint = config.endpoint.clone().ok_or_else(|| {
            FlowGuardError::Config("metrics endpoint is required when metrics are enabled".into())
        })?;

        Self::new(
            endpoint,
            config.app_id.clone(),
            config.token.clone(),
            Duration::from_millis(config.timeout_ms),
        )
        .map(Some)
    }

    /// Send a batch and wait for the collector's answer.
    pub async fn report(&self, data: &[DataPoint]) -> std::result::Result<(), String> {
        let inner = &self.inner;
        let payload = ReportPayload {
            app_id: &inner.app_id,
            token: &inner.token,
            data,
        };

        let response = inner
            .client
            .post(&inner.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("collector returned {}: {}", status, body));
        }
        Ok(())
    }
}

impl MetricsSink for HttpReporter {
    fn record_decision(&self, path: &str, allowed: bool) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(path = %path, "No runtime available, dropping decision report");
            return;
        };

        let reporter = self.clone();
        let point = DataPoint::decision(path, allowed);
        runtime.spawn(async move {
            if let Err(e) = reporter.report(std::slice::from_ref(&point)).await {
                warn!(error = %e, "Decision report failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_decision_point() {
        let point = DataPoint::decision("/api/*", false);
        assert_eq!(point.metric, DECISION_METRIC);
        assert_eq!(point.value, 1.0);
        assert_eq!(point.tags["status"], "blocked");
        assert_eq!(point.tags["path"], "/api/*");
    }

    #[test]
    fn test_disabled_config_builds_nothing() {
        let reporter = HttpReporter::from_config(&MetricsConfig::default()).unwrap();
        assert!(reporter.is_none());
    }

    #[test]
    fn test_noop_and_no_runtime_do_not_panic() {
        NoopSink.record_decision("/x", true);

        let reporter =
            HttpReporter::new("http://127.0.0.1:1/report", "app", "t", Duration::from_secs(1))
                .unwrap();
        reporter.record_decision("/x", true);
    }

    #[tokio::test]
    async fn test_report_posts_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/report"))
            .and(body_partial_json(serde_json::json!({
                "app_id": "shop",
                "token": "secret",
                "data": [{ "metric": "rate_limit.decision", "tags": { "status": "allowed" } }]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let reporter = HttpReporter::new(
            format!("{}/report", server.uri()),
            "shop",
            "secret",
            Duration::from_secs(5),
        )
        .unwrap();

        reporter
            .report(&[DataPoint::decision("/api/*", true)])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_report_surfaces_collector_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("down"))
            .mount(&server)
            .await;

        let reporter =
            HttpReporter::new(server.uri(), "shop", "secret", Duration::from_secs(5)).unwrap();
        let err = reporter
            .report(&[DataPoint::decision("/api/*", true)])
            .await
            .unwrap_err();
        assert!(err.contains("500"));
    }

    #[tokio::test]
    async fn test_record_decision_is_asynchronous() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let reporter =
            HttpReporter::new(server.uri(), "shop", "secret", Duration::from_secs(5)).unwrap();
        reporter.record_decision("/api/*", false);

        let mut received = Vec::new();
        for _ in 0..50 {
            received = server.received_requests().await.unwrap_or_default();
            if !received.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(received.len(), 1);
        let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body["data"][0]["tags"]["status"], "blocked");
    }
}
