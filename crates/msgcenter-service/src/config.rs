use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::store::{FileStore, MemoryStore, SubscriptionStore};

pub(crate) const DEFAULT_TEARDOWN_TIMEOUT_MS: u64 = 3000;
pub(crate) const DEFAULT_PUSH_SERVICE_TYPE: &str = "gcm";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Policy for send and control operations.
    pub retry: RetryPolicy,
    /// Policy for the initial handshake of a connect request.
    pub connect_retry: RetryPolicy,
    /// Policy for subscribe/unsubscribe passes.
    pub subscribe_retry: RetryPolicy,
    /// Bounded wait for the reader task on teardown.
    pub teardown_timeout_ms: u64,
    pub push_service_type: String,
    /// Push sender ids handed to the registrar when a registration is needed.
    pub sender_ids: Vec<String>,
    /// JSON file for subscription records. In-memory when unset.
    pub store_path: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            connect_retry: RetryPolicy::new(2, 1000),
            subscribe_retry: RetryPolicy::new(4, 5000),
            teardown_timeout_ms: DEFAULT_TEARDOWN_TIMEOUT_MS,
            push_service_type: DEFAULT_PUSH_SERVICE_TYPE.to_string(),
            sender_ids: Vec::new(),
            store_path: None,
        }
    }
}

impl ServiceConfig {
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        for (label, policy) in [
            ("retry", &self.retry),
            ("connect_retry", &self.connect_retry),
            ("subscribe_retry", &self.subscribe_retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(Error::Config(format!(
                    "{label}.max_attempts must be at least 1"
                )));
            }
        }
        if self.push_service_type.trim().is_empty() {
            return Err(Error::Config(
                "push_service_type must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Open the configured subscription store.
    pub fn open_store(&self) -> Result<Arc<dyn SubscriptionStore>> {
        let store: Arc<dyn SubscriptionStore> = match &self.store_path {
            Some(path) => Arc::new(FileStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        if !self.sender_ids.is_empty() {
            store.set_sender_ids(&self.sender_ids)?;
        }
        Ok(store)
    }
}

/// Load and validate a service config from a YAML file.
///
/// A relative `store_path` is resolved against the config file's directory.
pub async fn load(path: &Path) -> Result<ServiceConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
    let mut config: ServiceConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
    if let (Some(store), Some(dir)) = (&mut config.store_path, path.parent())
        && store.is_relative()
    {
        *store = dir.join(&*store);
    }
    config.validate()?;
    Ok(config)
}
