/// The server registry is the source of truth for which backends serve which virtual models. It is
/// read from a JSON file (`{"servers": [...]}`) and, optionally, kept in sync with that file as it
/// changes on disk.
///
/// Every query returns a fresh snapshot of the active records; nothing downstream caches them, so
/// registry edits take effect on the next request.
use anyhow::anyhow;
use async_trait::async_trait;
use bon::Builder;
use dashmap::DashMap;
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::PathBuf,
    sync::Arc,
};
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};
use tracing::{debug, error, info, warn};
use url::Url;

/// The kind of capacity a backend advertises. Decides which resource-monitor port is asked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerType {
    #[default]
    Cpu,
    Gpu,
}

impl ServerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerType::Cpu => "CPU",
            ServerType::Gpu => "GPU",
        }
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One advertised backend route: requests for `virtual_model_name` may be served by
/// `actual_model_name` on `server_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
pub struct ServerRecord {
    pub id: u64,
    #[builder(into)]
    pub virtual_model_name: String,
    pub server_url: Url,
    #[builder(into)]
    pub actual_model_name: String,
    #[serde(default = "default_weight")]
    #[builder(default = 100)]
    pub weight: u32,
    /// 1 is the most preferred tier.
    #[serde(default = "default_priority")]
    #[builder(default = 1)]
    pub priority: u32,
    #[serde(default, rename = "type")]
    #[builder(default)]
    pub server_type: ServerType,
    /// Capacity (GB of RAM or VRAM) the backend needs free to serve the model.
    #[serde(default = "default_performance", rename = "performance")]
    #[builder(default = 8.0)]
    pub performance_gb: f64,
    #[serde(default)]
    #[builder(default)]
    pub skip_resource_check: bool,
    #[serde(default = "default_active", rename = "is_active")]
    #[builder(default = true)]
    pub active: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "count")]
    #[builder(default)]
    pub usage_count: u64,
}

fn default_weight() -> u32 {
    100
}

fn default_priority() -> u32 {
    1
}

fn default_performance() -> f64 {
    8.0
}

fn default_active() -> bool {
    true
}

/// The on-disk registry document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryFile {
    pub servers: Vec<ServerRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read registry file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse registry file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("registry contains duplicate server id {0}")]
    DuplicateId(u64),
    #[error("servers {first} and {second} both route {virtual_model} to {actual_model} on {server_url}")]
    DuplicateRoute {
        first: u64,
        second: u64,
        virtual_model: String,
        server_url: Url,
        actual_model: String,
    },
    #[error("no server with id {0}")]
    UnknownServer(u64),
    #[error("registry has no backing file to reload from")]
    NoSource,
}

/// Counts over every record, active or not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_servers: usize,
    pub enabled_servers: usize,
    pub disabled_servers: usize,
    pub virtual_models: usize,
}

impl RegistryStats {
    pub fn from_records(records: &[ServerRecord]) -> Self {
        let enabled: Vec<_> = records.iter().filter(|r| r.active).collect();
        let virtual_models: HashSet<&str> = enabled
            .iter()
            .map(|r| r.virtual_model_name.as_str())
            .collect();
        RegistryStats {
            total_servers: records.len(),
            enabled_servers: enabled.len(),
            disabled_servers: records.len() - enabled.len(),
            virtual_models: virtual_models.len(),
        }
    }
}

/// Storage-agnostic access to server records.
#[async_trait]
pub trait ServerRegistry: fmt::Debug + Send + Sync {
    /// Active records, for one virtual model or all of them, ordered by priority ascending.
    async fn active_servers(
        &self,
        virtual_model: Option<&str>,
    ) -> Result<Vec<ServerRecord>, RegistryError>;

    /// Every record, including inactive ones.
    async fn all_servers(&self) -> Result<Vec<ServerRecord>, RegistryError>;

    async fn increment_usage(&self, id: u64) -> Result<(), RegistryError>;

    /// Re-read the backing store, returning the number of records now held.
    async fn reload(&self) -> Result<usize, RegistryError>;

    /// Names of the virtual models that have at least one active record, in priority order of
    /// their first record.
    async fn virtual_models(&self) -> Result<Vec<String>, RegistryError> {
        let mut seen = HashSet::new();
        Ok(self
            .active_servers(None)
            .await?
            .into_iter()
            .filter_map(|r| seen.insert(r.virtual_model_name.clone()).then_some(r.virtual_model_name))
            .collect())
    }

    async fn stats(&self) -> Result<RegistryStats, RegistryError> {
        Ok(RegistryStats::from_records(&self.all_servers().await?))
    }
}

/// A registry held in memory and loaded from a JSON file.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    pub(crate) records: Arc<DashMap<u64, ServerRecord>>,
    source: Option<PathBuf>,
}

#[async_trait]
pub trait RegistryStream {
    async fn receive(
        &self,
    ) -> Result<mpsc::Receiver<Result<RegistryFile, anyhow::Error>>, anyhow::Error>;
}

pub struct WatchedFile(pub PathBuf);

#[async_trait]
impl RegistryStream for WatchedFile {
    /// Watches the registry file and yields a freshly parsed document on each modification.
    async fn receive(
        &self,
    ) -> Result<mpsc::Receiver<Result<RegistryFile, anyhow::Error>>, anyhow::Error> {
        let (registry_tx, registry_rx) = mpsc::channel(100);
        let (file_tx, mut file_rx) = mpsc::channel(100);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = file_tx.blocking_send(res);
            },
            NotifyConfig::default(),
        )?;

        watcher.watch(&self.0, RecursiveMode::NonRecursive)?;

        let path = self.0.clone();
        tokio::spawn(async move {
            // The watcher stops emitting once dropped, so it lives as long as this task.
            let _watcher = watcher;
            while let Some(res) = file_rx.recv().await {
                let update = match res {
                    Ok(event) if event.kind.is_modify() => {
                        info!("Registry file changed, reloading servers...");
                        read_registry_file(&path).await.map_err(|e| anyhow!(e))
                    }
                    Ok(_) => continue,
                    Err(e) => Err(anyhow!("Watch error: {}", e)),
                };
                if registry_tx.send(update).await.is_err() {
                    break; // Receiver dropped
                }
            }
        });

        Ok(registry_rx)
    }
}

async fn read_registry_file(path: &PathBuf) -> Result<RegistryFile, RegistryError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| RegistryError::Read {
            path: path.clone(),
            source,
        })?;
    serde_json::from_str(&contents).map_err(|source| RegistryError::Parse {
        path: path.clone(),
        source,
    })
}

impl FileRegistry {
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let file = read_registry_file(&path).await?;
        let registry = Self {
            records: Arc::new(DashMap::new()),
            source: Some(path.clone()),
        };
        registry.replace(file.servers)?;
        info!(
            "Loaded {} server records from {}",
            registry.records.len(),
            path.display()
        );
        Ok(registry)
    }

    pub fn from_records(servers: Vec<ServerRecord>) -> Result<Self, RegistryError> {
        let registry = Self {
            records: Arc::new(DashMap::new()),
            source: None,
        };
        registry.replace(servers)?;
        Ok(registry)
    }

    /// Swap in a new record set. Records are upserted before stale ids are removed so that
    /// concurrent readers never observe an empty registry mid-update.
    ///
    /// Ids must be unique, and so must (virtual model, server, actual model) routes, active or
    /// not. A rejected set leaves the current one untouched.
    fn replace(&self, servers: Vec<ServerRecord>) -> Result<(), RegistryError> {
        let mut incoming = HashSet::new();
        let mut routes = HashMap::new();
        for server in &servers {
            if !incoming.insert(server.id) {
                return Err(RegistryError::DuplicateId(server.id));
            }
            let route = (
                server.virtual_model_name.as_str(),
                &server.server_url,
                server.actual_model_name.as_str(),
            );
            if let Some(first) = routes.insert(route, server.id) {
                return Err(RegistryError::DuplicateRoute {
                    first,
                    second: server.id,
                    virtual_model: server.virtual_model_name.clone(),
                    server_url: server.server_url.clone(),
                    actual_model: server.actual_model_name.clone(),
                });
            }
        }

        for mut server in servers {
            // Usage counters belong to the running process, not the file.
            if let Some(existing) = self.records.get(&server.id) {
                server.usage_count = server.usage_count.max(existing.usage_count);
            }
            self.records.insert(server.id, server);
        }
        self.records.retain(|id, _| incoming.contains(id));
        debug!("Registry now holds {} records", self.records.len());
        Ok(())
    }

    /// Consume registry updates from a stream, replacing the record set on each one.
    pub async fn receive_updates<W: RegistryStream + Send + 'static>(
        &self,
        registry_stream: W,
    ) -> Result<(), anyhow::Error> {
        let registry = self.clone();
        let mut rx = registry_stream.receive().await?;

        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                match result.and_then(|file| registry.replace(file.servers).map_err(|e| anyhow!(e)))
                {
                    Ok(()) => info!("Registry updated, {} records", registry.records.len()),
                    Err(e) => error!("Failed to reload registry: {}", e),
                }
            }
        });

        Ok(())
    }

    fn snapshot(&self) -> Vec<ServerRecord> {
        let mut records: Vec<ServerRecord> =
            self.records.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by_key(|r| (r.priority, r.id));
        records
    }
}

#[async_trait]
impl ServerRegistry for FileRegistry {
    async fn active_servers(
        &self,
        virtual_model: Option<&str>,
    ) -> Result<Vec<ServerRecord>, RegistryError> {
        let servers: Vec<ServerRecord> = self
            .snapshot()
            .into_iter()
            .filter(|r| r.active)
            .filter(|r| virtual_model.is_none_or(|m| r.virtual_model_name == m))
            .collect();
        debug!(
            virtual_model = ?virtual_model,
            "Registry query returned {} active servers",
            servers.len()
        );
        Ok(servers)
    }

    async fn all_servers(&self) -> Result<Vec<ServerRecord>, RegistryError> {
        Ok(self.snapshot())
    }

    async fn increment_usage(&self, id: u64) -> Result<(), RegistryError> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or(RegistryError::UnknownServer(id))?;
        record.usage_count += 1;
        debug!(
            server_url = %record.server_url,
            "Usage count for server {} is now {}", id, record.usage_count
        );
        Ok(())
    }

    async fn reload(&self) -> Result<usize, RegistryError> {
        let path = self.source.as_ref().ok_or(RegistryError::NoSource)?;
        let file = read_registry_file(path).await?;
        self.replace(file.servers)?;
        info!("Reloaded {} server records from {}", self.records.len(), path.display());
        Ok(self.records.len())
    }
}

/// Posts usage-counter increments to a background worker so that recording a successful dispatch
/// never waits on, or fails because of, the registry.
#[derive(Debug, Clone)]
pub struct UsageRecorder {
    tx: mpsc::UnboundedSender<u64>,
}

impl UsageRecorder {
    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn spawn(registry: Arc<dyn ServerRegistry>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut ids = UnboundedReceiverStream::new(rx);
            while let Some(id) = ids.next().await {
                if let Err(e) = registry.increment_usage(id).await {
                    warn!("Failed to increment usage count for server {}: {}", id, e);
                }
            }
        });
        Self { tx }
    }

    pub fn record(&self, id: u64) {
        if self.tx.send(id).is_err() {
            warn!("Usage recorder stopped, dropping increment for server {}", id);
        }
    }
}
