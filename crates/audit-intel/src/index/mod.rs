//! Vector index adapters.
//!
//! The [`VectorIndex`] trait and the in-memory index live in the core
//! crate. This module adds the persistent backends and the retry
//! decorator, and picks one from `[index]` configuration:
//!
//! | `index.backend` | Adapter |
//! |-----------------|---------|
//! | `memory` | [`InMemoryIndex`] |
//! | `sqlite` | [`SqliteIndex`] wrapped in [`RetryingIndex`] |
//! | `qdrant` | `QdrantIndex` wrapped in [`RetryingIndex`] (feature `qdrant`) |

#[cfg(feature = "qdrant")]
pub mod qdrant;
pub mod retry;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use audit_intel_core::index::memory::InMemoryIndex;
use audit_intel_core::index::VectorIndex;

use crate::config::IndexConfig;
use crate::retry::RetryPolicy;

pub use retry::RetryingIndex;
pub use sqlite::SqliteIndex;

impl IndexConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_ms),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Open the configured vector index.
pub async fn open_index(config: &IndexConfig) -> Result<Arc<dyn VectorIndex>> {
    let index: Arc<dyn VectorIndex> = match config.backend.as_str() {
        "memory" => return Ok(Arc::new(InMemoryIndex::new())),
        "sqlite" => {
            let Some(path) = &config.path else {
                bail!("index.path must be set when index.backend is 'sqlite'");
            };
            let pool = crate::db::connect(path)
                .await
                .with_context(|| format!("Failed to open vector index at {}", path.display()))?;
            Arc::new(SqliteIndex::new(pool))
        }
        #[cfg(feature = "qdrant")]
        "qdrant" => {
            let Some(url) = &config.url else {
                bail!("index.url must be set when index.backend is 'qdrant'");
            };
            Arc::new(qdrant::QdrantIndex::connect(url, &config.collection)?)
        }
        #[cfg(not(feature = "qdrant"))]
        "qdrant" => bail!("index.backend 'qdrant' requires building with the `qdrant` feature"),
        other => bail!("Unknown index backend: {}", other),
    };
    Ok(Arc::new(RetryingIndex::new(index, config.retry_policy())))
}
