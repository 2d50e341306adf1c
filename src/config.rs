use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::expiry::ExpiryConfig;
use crate::notify::DispatcherConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    /// `hourly`, `daily` or `never`
    pub rotation: String,
    /// When false, debug output of the escrow engine is filtered out
    pub enable_tracing: bool,
    /// PostgreSQL connection URL; the in-memory store is used when absent
    pub postgres_url: Option<String>,
    pub ledger: LedgerSection,
    pub expiry: ExpirySection,
    pub notifications: NotificationSection,
    pub push: PushSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "escrow_ledger.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            enable_tracing: true,
            postgres_url: None,
            ledger: LedgerSection::default(),
            expiry: ExpirySection::default(),
            notifications: NotificationSection::default(),
            push: PushSection::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerSection {
    /// Public URI of this ledger, stamped on every transfer
    pub uri: String,
    /// System account holding escrowed funds
    pub hold_account: String,
    /// Create tables on startup (development databases)
    pub init_schema: bool,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            uri: "http://localhost:3000".to_string(),
            hold_account: "hold".to_string(),
            init_schema: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExpirySection {
    /// Longest single sleep of the expiry timer
    pub max_timeout_ms: u64,
}

impl Default for ExpirySection {
    fn default() -> Self {
        Self {
            max_timeout_ms: i32::MAX as u64,
        }
    }
}

impl ExpirySection {
    pub fn to_expiry_config(&self) -> ExpiryConfig {
        ExpiryConfig {
            max_timeout: Duration::from_millis(self.max_timeout_ms.max(1)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NotificationSection {
    pub poll_interval_ms: u64,
    pub delivery_timeout_ms: u64,
    pub batch_size: usize,
    pub max_retries: i32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for NotificationSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            delivery_timeout_ms: 10_000,
            batch_size: 100,
            max_retries: 10,
            retry_base_ms: 1000,
            retry_max_ms: 300_000,
        }
    }
}

impl NotificationSection {
    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            batch_size: self.batch_size.max(1),
            max_retries: self.max_retries,
            retry_base: Duration::from_millis(self.retry_base_ms),
            retry_max: Duration::from_millis(self.retry_max_ms),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PushSection {
    pub queue_size: usize,
    /// How often the relay drains the queue to live listeners
    pub poll_interval_ms: u64,
}

impl Default for PushSection {
    fn default() -> Self {
        Self {
            queue_size: crate::push::DEFAULT_QUEUE_SIZE,
            poll_interval_ms: 10,
        }
    }
}

impl PushSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}
