use std::sync::Arc;

use async_trait::async_trait;

use crate::ac::ActionCache;
use crate::builder::{BuildQueue, OperationWatcher};
use crate::error::{Error, Result};
use crate::types::{ExecuteRequest, ExecuteResponse, Operation, OperationResult};

/// answers requests from the action cache before queueing them
///
/// a hit yields an operation that is already completed, under a fresh name
/// the underlying queue does not know; it is not watchable. misses and
/// lookup failures fall through to the wrapped queue.
pub struct CachedBuildQueue {
    base: Arc<dyn BuildQueue>,
    action_cache: Arc<dyn ActionCache>,
}

impl CachedBuildQueue {
    pub fn new(base: Arc<dyn BuildQueue>, action_cache: Arc<dyn ActionCache>) -> Self {
        Self { base, action_cache }
    }
}

#[async_trait]
impl BuildQueue for CachedBuildQueue {
    async fn execute(&self, request: ExecuteRequest) -> Result<Operation> {
        if request.skip_cache_lookup {
            return self.base.execute(request).await;
        }

        let action_digest = request.action.digest()?;
        let lookup = {
            let action_cache = self.action_cache.clone();
            let instance = request.instance_name.clone();
            let digest = action_digest.clone();
            tokio::task::spawn_blocking(move || action_cache.get_action_result(&instance, &digest))
                .await
                .map_err(|e| Error::Internal(format!("action cache task failed: {}", e)))?
        };

        match lookup {
            Ok(result) => {
                tracing::debug!(instance = %request.instance_name, action = %action_digest, "action cache hit");
                Ok(Operation::completed(
                    uuid::Uuid::new_v4().to_string(),
                    action_digest,
                    OperationResult::Response(ExecuteResponse::from_cache(result)),
                ))
            }
            Err(e) => {
                if !e.is_not_found() {
                    tracing::warn!(instance = %request.instance_name, error = %e, "action cache lookup failed");
                }
                self.base.execute(request).await
            }
        }
    }

    fn watch(&self, name: &str) -> Result<OperationWatcher> {
        self.base.watch(name)
    }
}
