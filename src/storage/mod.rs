pub mod backend;
pub mod cache;
pub mod jobs;
pub mod redis_store;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::cli::config::{BackendKind, StorageSettings};

// Re-export common types
pub use backend::{MemoryBackend, SharedBackend};
pub use cache::ResultCache;
pub use jobs::{JobRecord, JobStore};
pub use redis_store::RedisBackend;

/// Open the configured shared backend
pub async fn connect_backend(settings: &StorageSettings) -> Result<Arc<dyn SharedBackend>> {
    match settings.backend {
        BackendKind::Redis => {
            let backend = RedisBackend::connect(&settings.redis_url).await?;
            Ok(Arc::new(backend))
        }
        BackendKind::Memory => {
            info!("Using in-process backend; state is lost on exit");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}
