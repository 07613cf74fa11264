//! Resource sufficiency gating
//!
//! Before a request is forwarded, the backend's resource monitor is asked whether the host has
//! enough free memory (or VRAM) for the model. Checks are memoized per (server, model): once a
//! pair has been checked, further checks inside `same_model_interval` are skipped and assumed
//! sufficient, since the model is most likely still loaded from the previous call.
use crate::client::HttpClient;
use crate::registry::ServerType;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use bon::Builder;
use dashmap::DashMap;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use url::Url;

/// Source of wall-clock time, in whole seconds since the epoch.
pub trait Clock: std::fmt::Debug + Send + Sync {
    fn now_secs(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start)))
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Builder)]
pub struct GateSettings {
    #[builder(default = 8005)]
    pub cpu_monitor_port: u16,
    #[builder(default = 8006)]
    pub gpu_monitor_port: u16,
    #[builder(default = Duration::from_secs(10))]
    pub timeout: Duration,
    /// Checks for a pair younger than this are skipped.
    #[builder(default = Duration::from_secs(1200))]
    pub same_model_interval: Duration,
    /// Entries older than this are purged.
    #[builder(default = Duration::from_secs(2400))]
    pub usage_window: Duration,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    SameModelConcurrent,
}

/// What the gate concluded about one backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceCheckOutcome {
    pub sufficient: bool,
    pub available_gb: f64,
    pub total_gb: f64,
    pub usage_percentage: f64,
    pub skipped: bool,
    pub skip_reason: Option<SkipReason>,
    /// Set when the monitor could not be asked or answered nonsense.
    pub error: Option<String>,
}

impl ResourceCheckOutcome {
    fn skipped() -> Self {
        Self {
            sufficient: true,
            skipped: true,
            skip_reason: Some(SkipReason::SameModelConcurrent),
            ..Default::default()
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            sufficient: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub total_model_usage_entries: usize,
    pub active_usage_entries: usize,
    pub same_model_interval: u64,
    pub model_usage_window: u64,
}

/// Time-windowed record of when each (server, model) pair was last checked.
#[derive(Debug)]
pub struct UsageWindow {
    entries: DashMap<(String, String), u64>,
    same_model_interval: u64,
    usage_window: u64,
    clock: Arc<dyn Clock>,
}

impl UsageWindow {
    pub fn new(same_model_interval: Duration, usage_window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            same_model_interval: same_model_interval.as_secs(),
            usage_window: usage_window.as_secs(),
            clock,
        }
    }

    fn key(server_url: &str, model: &str) -> (String, String) {
        (server_url.to_owned(), model.to_owned())
    }

    /// Whether a check for this pair can be skipped. An expired entry is dropped on the way.
    pub fn should_skip(&self, server_url: &str, model: &str) -> bool {
        let key = Self::key(server_url, model);
        let now = self.clock.now_secs();
        let Some(last_checked) = self.entries.get(&key).map(|e| *e.value()) else {
            return false;
        };
        let age = now.saturating_sub(last_checked);
        if age > self.usage_window {
            self.entries.remove_if(&key, |_, ts| *ts == last_checked);
            return false;
        }
        age < self.same_model_interval
    }

    /// Stamp the pair with the current time and sweep out expired entries.
    pub fn record(&self, server_url: &str, model: &str) {
        let now = self.clock.now_secs();
        self.entries.insert(Self::key(server_url, model), now);
        let window = self.usage_window;
        self.entries
            .retain(|_, last_checked| now.saturating_sub(*last_checked) <= window);
    }

    pub fn stats(&self) -> UsageStats {
        let now = self.clock.now_secs();
        let active = self
            .entries
            .iter()
            .filter(|e| now.saturating_sub(*e.value()) < self.usage_window)
            .count();
        UsageStats {
            total_model_usage_entries: self.entries.len(),
            active_usage_entries: active,
            same_model_interval: self.same_model_interval,
            model_usage_window: self.usage_window,
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// The monitor wraps every payload as `{status, message?, data?}`.
#[derive(Debug, Deserialize)]
struct MonitorEnvelope<T> {
    status: String,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ResourceCheckData {
    sufficient: bool,
    #[serde(default)]
    available_gb: f64,
    #[serde(default)]
    total_gb: f64,
    #[serde(default)]
    usage_percent: f64,
}

/// Host memory as reported by `GET /memory`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total_gb: f64,
    pub available_gb: f64,
    pub used_gb: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub gpu_id: u32,
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
}

/// Per-device VRAM as reported by `GET /gpu-memory`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuMemoryInfo {
    pub gpus: Vec<GpuInfo>,
    pub total_gpus: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateConfigView {
    pub cpu_monitor_port: u16,
    pub gpu_monitor_port: u16,
    pub timeout_secs: u64,
    pub same_model_interval: u64,
    pub model_usage_window: u64,
}

#[derive(Debug)]
pub struct ResourceGate<T: HttpClient> {
    http_client: T,
    settings: GateSettings,
    usage: UsageWindow,
}

impl<T: HttpClient + Send + Sync> ResourceGate<T> {
    pub fn new(http_client: T, settings: GateSettings, clock: Arc<dyn Clock>) -> Self {
        let usage = UsageWindow::new(settings.same_model_interval, settings.usage_window, clock);
        Self {
            http_client,
            settings,
            usage,
        }
    }

    /// The monitor lives on the backend's host, on a port chosen by server type.
    pub fn monitor_url(&self, server_url: &Url, server_type: ServerType) -> Option<Url> {
        let port = match server_type {
            ServerType::Cpu => self.settings.cpu_monitor_port,
            ServerType::Gpu => self.settings.gpu_monitor_port,
        };
        server_url.host_str()?;
        let mut url = server_url.clone();
        url.set_port(Some(port)).ok()?;
        url.set_path("/");
        url.set_query(None);
        url.set_fragment(None);
        Some(url)
    }

    pub async fn check_sufficiency(
        &self,
        server_url: &Url,
        server_type: ServerType,
        required_gb: f64,
        model_name: Option<&str>,
    ) -> ResourceCheckOutcome {
        if let Some(model) = model_name
            && self.usage.should_skip(server_url.as_str(), model)
        {
            info!(
                server_url = %server_url,
                model = %model,
                "Skipping resource check, model was checked within the last {}s",
                self.settings.same_model_interval.as_secs()
            );
            return ResourceCheckOutcome::skipped();
        }

        let Some(monitor) = self.monitor_url(server_url, server_type) else {
            return ResourceCheckOutcome::failed(format!(
                "cannot derive resource monitor address from {server_url}"
            ));
        };
        let check_url = format!("{}resource-check", monitor);
        debug!(
            check_url = %check_url,
            server_type = %server_type,
            required_gb,
            model = ?model_name,
            "Calling resource monitor"
        );

        let payload = json!({ "type": server_type, "performance": required_gb });
        let data: ResourceCheckData = match self
            .call_monitor(Method::POST, &check_url, Some(payload))
            .await
        {
            Ok(data) => data,
            Err(e) => {
                warn!(server_url = %server_url, "Resource check failed: {}", e);
                return ResourceCheckOutcome::failed(e);
            }
        };

        info!(
            server_url = %server_url,
            server_type = %server_type,
            total_gb = data.total_gb,
            available_gb = data.available_gb,
            usage_percent = data.usage_percent,
            required_gb,
            sufficient = data.sufficient,
            "Resource monitor answered"
        );

        if let Some(model) = model_name {
            self.usage.record(server_url.as_str(), model);
        }

        ResourceCheckOutcome {
            sufficient: data.sufficient,
            available_gb: data.available_gb,
            total_gb: data.total_gb,
            usage_percentage: data.usage_percent,
            skipped: false,
            skip_reason: None,
            error: None,
        }
    }

    pub async fn memory_info(&self, server_url: &Url, server_type: ServerType) -> Option<MemoryInfo> {
        let monitor = self.monitor_url(server_url, server_type)?;
        self.call_monitor(Method::GET, &format!("{monitor}memory"), None)
            .await
            .inspect_err(|e| warn!(server_url = %server_url, "Failed to fetch memory info: {}", e))
            .ok()
    }

    pub async fn gpu_memory_info(&self, server_url: &Url) -> Option<GpuMemoryInfo> {
        let monitor = self.monitor_url(server_url, ServerType::Gpu)?;
        self.call_monitor(Method::GET, &format!("{monitor}gpu-memory"), None)
            .await
            .inspect_err(|e| warn!(server_url = %server_url, "Failed to fetch GPU memory info: {}", e))
            .ok()
    }

    /// Issue one monitor call under the configured timeout and unwrap its envelope.
    async fn call_monitor<D: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<D, String> {
        let body = match &payload {
            Some(payload) => Body::from(payload.to_string()),
            None => Body::empty(),
        };
        let request = Request::builder()
            .method(method)
            .uri(url)
            .header("content-type", "application/json")
            .body(body)
            .map_err(|e| format!("invalid monitor request: {e}"))?;

        let call = async {
            let response = self
                .http_client
                .request(request)
                .await
                .map_err(|e| format!("resource monitor unreachable: {e}"))?;
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .map_err(|e| format!("failed to read monitor response: {e}"))?;
            Ok::<_, String>((status, bytes))
        };
        let (status, bytes) = tokio::time::timeout(self.settings.timeout, call)
            .await
            .map_err(|_| format!("resource monitor timed out: {url}"))??;

        if status != StatusCode::OK {
            return Err(format!("resource monitor returned status {status}"));
        }
        let envelope: MonitorEnvelope<D> = serde_json::from_slice(&bytes)
            .map_err(|e| format!("malformed resource monitor response: {e}"))?;
        if envelope.status != "success" {
            return Err(envelope
                .message
                .unwrap_or_else(|| "resource monitor reported failure".into()));
        }
        envelope
            .data
            .ok_or_else(|| "resource monitor response has no data".into())
    }

    pub fn stats(&self) -> UsageStats {
        self.usage.stats()
    }

    pub fn clear(&self) {
        self.usage.clear();
        info!("Cleared model usage history");
    }

    pub fn config(&self) -> GateConfigView {
        GateConfigView {
            cpu_monitor_port: self.settings.cpu_monitor_port,
            gpu_monitor_port: self.settings.gpu_monitor_port,
            timeout_secs: self.settings.timeout.as_secs(),
            same_model_interval: self.settings.same_model_interval.as_secs(),
            model_usage_window: self.settings.usage_window.as_secs(),
        }
    }
}
