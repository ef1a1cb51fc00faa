//! Config - TOML で読み込む設定
//!
//! どのセクションも省略可能で、省略時はデフォルト値になります。
//!
//! ```toml
//! [queue]
//! max_retries = 3
//! history_limit = 512
//!
//! [queue.retry]
//! base_delay_ms = 2000
//! multiplier = 2.0
//! max_delay_ms = 60000
//!
//! [store]
//! dir = "/var/lib/ferry/queues"
//!
//! [logging]
//! filter = "info,ferry_core=debug"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::StoreError;
use crate::impls::{InMemoryQueueStore, JsonFileQueueStore};
use crate::ports::QueueStore;
use crate::queue::{DEFAULT_HISTORY_LIMIT, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub retry: RetryConfig,
    /// Terminal records kept per owner for status queries and dependency checks.
    pub history_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry: RetryConfig::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON queue files go here. In-memory when unset.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives. `RUST_LOG` takes precedence.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
        }
    }
}

impl FerryConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_toml_str(&text)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = &self.queue.retry;
        RetryPolicy {
            max_retries: self.queue.max_retries,
            base_delay: Duration::from_millis(retry.base_delay_ms),
            multiplier: retry.multiplier,
            max_delay: Duration::from_millis(retry.max_delay_ms),
        }
    }

    pub async fn open_queue_store(&self) -> Result<Arc<dyn QueueStore>, StoreError> {
        match &self.store.dir {
            Some(dir) => Ok(Arc::new(JsonFileQueueStore::open(dir).await?)),
            None => Ok(Arc::new(InMemoryQueueStore::new())),
        }
    }
}
