//! Liveness probing of backends
use crate::client::HttpClient;
use axum::{
    body::Body,
    http::{Method, Request},
};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use url::Url;

/// Probes are issued against this path; any 2xx means the backend is up.
const PROBE_PATH: &str = "/api/tags";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthProbeResult {
    pub server_url: String,
    pub healthy: bool,
    pub latency_seconds: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HealthProber<T: HttpClient> {
    http_client: T,
    timeout: Duration,
}

impl<T: HttpClient + Send + Sync> HealthProber<T> {
    pub fn new(http_client: T, timeout: Duration) -> Self {
        Self {
            http_client,
            timeout,
        }
    }

    /// Probe one backend. Never fails: timeouts, transport errors and non-2xx statuses all come
    /// back as `healthy: false`.
    ///
    /// Only reachability is verified. Whether `model_name` is actually loaded on the backend is
    /// not checked; a reachable backend missing the model is found out when the forwarded call
    /// fails.
    pub async fn probe(&self, server_url: &Url, model_name: &str) -> HealthProbeResult {
        let started = Instant::now();
        let outcome = self.call(server_url).await;
        let latency_seconds = started.elapsed().as_secs_f64();

        let result = HealthProbeResult {
            server_url: server_url.to_string(),
            healthy: outcome.is_ok(),
            latency_seconds,
            error: outcome.err(),
        };

        match &result.error {
            None => info!(
                target: "spillway::health",
                server_url = %result.server_url,
                model = %model_name,
                status = "healthy",
                latency = result.latency_seconds,
            ),
            Some(error) => warn!(
                target: "spillway::health",
                server_url = %result.server_url,
                model = %model_name,
                status = "unhealthy",
                latency = result.latency_seconds,
                error = %error,
            ),
        }
        result
    }

    async fn call(&self, server_url: &Url) -> Result<(), String> {
        let uri = format!("{}{}", server_url.as_str().trim_end_matches('/'), PROBE_PATH);
        let request = Request::builder()
            .method(Method::GET)
            .uri(&uri)
            .body(Body::empty())
            .map_err(|e| format!("invalid probe uri {uri}: {e}"))?;

        let response = tokio::time::timeout(self.timeout, self.http_client.request(request))
            .await
            .map_err(|_| format!("timed out after {:.1}s", self.timeout.as_secs_f64()))?
            .map_err(|e| e.to_string())?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", response.status().as_u16()))
        }
    }
}
