//! Session context: configuration and the shared worker pool
//!
//! One [`SomaContext`] is created per session and shared (via `Arc`) by every
//! experiment opened in it. Queries never build their own pool.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{QueryError, Result};

/// Context configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Worker threads in the shared pool; 0 uses one per CPU
    pub threads: usize,
    /// Prefix for worker thread names
    pub thread_name_prefix: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            thread_name_prefix: "axisquery-worker".to_string(),
        }
    }
}

impl ContextConfig {
    /// Load from a JSON document; absent fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| QueryError::InvalidArgument(e.to_string()))
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
}

/// Shared session state
pub struct SomaContext {
    config: ContextConfig,
    pool: rayon::ThreadPool,
}

impl SomaContext {
    pub fn new(config: ContextConfig) -> Result<Self> {
        let prefix = config.thread_name_prefix.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .thread_name(move |i| format!("{}-{}", prefix, i))
            .build()
            .map_err(|e| QueryError::Pool(e.to_string()))?;

        log::debug!(
            "SomaContext created with {} worker threads",
            pool.current_num_threads()
        );

        Ok(Self { config, pool })
    }

    /// Context with default configuration, wrapped for sharing.
    pub fn shared() -> Result<Arc<Self>> {
        Self::new(ContextConfig::default()).map(Arc::new)
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// The bounded worker pool used for all fan-out reads.
    pub fn threadpool(&self) -> &rayon::ThreadPool {
        &self.pool
    }
}

impl std::fmt::Debug for SomaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SomaContext")
            .field("config", &self.config)
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json_partial() {
        let config = ContextConfig::from_json(r#"{ "threads": 3 }"#).unwrap();
        assert_eq!(config.threads, 3);
        assert_eq!(config.thread_name_prefix, "axisquery-worker");
    }

    #[test]
    fn test_config_from_json_invalid() {
        let err = ContextConfig::from_json("{ threads: ").unwrap_err();
        assert!(matches!(err, QueryError::InvalidArgument(_)));
    }

    #[test]
    fn test_context_pool_size() {
        let ctx = SomaContext::new(ContextConfig::default().with_threads(2)).unwrap();
        assert_eq!(ctx.threadpool().current_num_threads(), 2);
    }
}
