//! Command-line configuration for the proxy server.
//!
//! Flags map onto the library's `DispatchSettings`, `GateSettings` and `PoolSettings`; nothing
//! here is read by the library directly.
use anyhow::anyhow;
use clap::Parser;
use spillway::client::PoolSettings;
use spillway::dispatch::DispatchSettings;
use spillway::resource::GateSettings;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the proxy server will listen.
    #[arg(short = 'p', long, default_value_t = 8080)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true)]
    pub metrics: bool,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "spillway")]
    pub metrics_prefix: String,

    /// The JSON file holding the server registry.
    #[arg(short = 'f', long)]
    pub servers: PathBuf,

    /// Whether we should continue watching the registry file for changes
    #[arg(short = 'w', long, default_value_t = true)]
    pub watch: bool,

    /// How long a backend has to answer a health probe.
    #[arg(long, default_value_t = 3.0)]
    pub health_check_timeout_secs: f64,

    /// Bound on a forwarded call. Streams are only bounded until the backend starts answering.
    #[arg(long, default_value_t = 300)]
    pub request_timeout_secs: u64,

    /// Longest silence tolerated from a backend once its stream has started.
    #[arg(long, default_value_t = 300)]
    pub stream_idle_timeout_secs: u64,

    #[arg(long, default_value_t = 10)]
    pub resource_check_timeout_secs: u64,

    /// Resource monitor port on CPU backends.
    #[arg(long, env = "RESOURCE_MONITOR_CPU_PORT", default_value_t = 8005)]
    pub resource_monitor_cpu_port: u16,

    /// Resource monitor port on GPU backends.
    #[arg(long, env = "RESOURCE_MONITOR_GPU_PORT", default_value_t = 8006)]
    pub resource_monitor_gpu_port: u16,

    /// A (server, model) pair checked more recently than this skips its resource check.
    #[arg(long, default_value_t = 1200)]
    pub same_model_interval_secs: u64,

    /// How long resource-check history is kept.
    #[arg(long, default_value_t = 2400)]
    pub usage_window_secs: u64,

    /// Maximum number of idle HTTP connections to keep alive per upstream host.
    #[arg(long, default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if !self.servers.exists() {
            return Err(anyhow!(
                "Registry file '{}' does not exist",
                self.servers.display()
            ));
        }
        if !self.health_check_timeout_secs.is_finite() || self.health_check_timeout_secs <= 0.0 {
            return Err(anyhow!(
                "--health-check-timeout-secs must be a positive number of seconds"
            ));
        }
        if self.stream_idle_timeout_secs == 0 {
            return Err(anyhow!("--stream-idle-timeout-secs must be at least 1"));
        }
        if self.same_model_interval_secs > self.usage_window_secs {
            return Err(anyhow!(
                "--same-model-interval-secs ({}) must not exceed --usage-window-secs ({})",
                self.same_model_interval_secs,
                self.usage_window_secs
            ));
        }
        Ok(self)
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        let gate = GateSettings::builder()
            .cpu_monitor_port(self.resource_monitor_cpu_port)
            .gpu_monitor_port(self.resource_monitor_gpu_port)
            .timeout(Duration::from_secs(self.resource_check_timeout_secs))
            .same_model_interval(Duration::from_secs(self.same_model_interval_secs))
            .usage_window(Duration::from_secs(self.usage_window_secs))
            .build();
        DispatchSettings::builder()
            .health_check_timeout(Duration::from_secs_f64(self.health_check_timeout_secs))
            .request_timeout(Duration::from_secs(self.request_timeout_secs))
            .stream_idle_timeout(Duration::from_secs(self.stream_idle_timeout_secs))
            .gate(gate)
            .build()
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_become_library_settings() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = Config::try_parse_from(["spillway", "-f", file.path().to_str().unwrap()])
            .unwrap()
            .validate()
            .unwrap();
        assert_eq!(config.port, 8080);
        let settings = config.dispatch_settings();
        assert_eq!(settings.health_check_timeout, Duration::from_secs(3));
        assert_eq!(settings.request_timeout, Duration::from_secs(300));
        assert_eq!(settings.stream_idle_timeout, Duration::from_secs(300));
        assert_eq!(settings.gate.cpu_monitor_port, 8005);
        assert_eq!(settings.gate.gpu_monitor_port, 8006);
        assert_eq!(settings.gate.same_model_interval, Duration::from_secs(1200));
        assert_eq!(config.pool_settings().max_idle_per_host, 100);
    }

    #[test]
    fn interval_longer_than_window_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = Config::try_parse_from([
            "spillway",
            "-f",
            file.path().to_str().unwrap(),
            "--same-model-interval-secs",
            "600",
            "--usage-window-secs",
            "300",
        ])
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_stream_idle_timeout_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = Config::try_parse_from([
            "spillway",
            "-f",
            file.path().to_str().unwrap(),
            "--stream-idle-timeout-secs",
            "0",
        ])
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_registry_file_is_rejected() {
        let config = Config::try_parse_from(["spillway", "-f", "/nonexistent/servers.json"]).unwrap();
        assert!(config.validate().is_err());
    }
}
