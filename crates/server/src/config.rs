use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use testflow_core::actions::ActionDispatcher;
use testflow_core::broadcast::EventHub;
use testflow_core::storage::RedbStore;
use testflow_core::store::Store;
use testflow_core::workflow::WorkflowEngine;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub test: TestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_file")]
    pub db_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    /// Base URL that http actions resolve relative paths against
    #[serde(default = "default_target_host")]
    pub target_host: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_file() -> String {
    "./data/testflow.redb".to_string()
}

fn default_target_host() -> String {
    "http://localhost:8080".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_file: default_db_file(),
        }
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            target_host: default_target_host(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.db_file)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub hub: Arc<EventHub>,
    pub engine: Arc<WorkflowEngine>,
    pub dispatcher: Arc<ActionDispatcher>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let store: Arc<dyn Store> =
            Arc::new(RedbStore::new(config.db_path()).context("Failed to open store")?);
        let hub = Arc::new(EventHub::new());

        let engine = Arc::new(WorkflowEngine::new(
            store.clone(),
            hub.clone(),
            config.test.target_host.clone(),
        ));
        let dispatcher = Arc::new(ActionDispatcher::new(
            store.clone(),
            hub.clone(),
            config.test.target_host.clone(),
        ));

        Ok(Self {
            store,
            hub,
            engine,
            dispatcher,
        })
    }
}
