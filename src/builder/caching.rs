use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::ac::ActionCache;
use crate::builder::BuildExecutor;
use crate::error::{Error, Result};
use crate::types::{ExecuteRequest, ExecuteResponse};

/// records successful results of the wrapped executor in the action cache
///
/// a result is stored only if the action allows caching, ran without an
/// execution error and exited zero. a failed cache write turns the response
/// into an error, since clients would otherwise get a result that later
/// lookups cannot see.
pub struct CachingBuildExecutor {
    base: Arc<dyn BuildExecutor>,
    action_cache: Arc<dyn ActionCache>,
}

impl CachingBuildExecutor {
    pub fn new(base: Arc<dyn BuildExecutor>, action_cache: Arc<dyn ActionCache>) -> Self {
        Self { base, action_cache }
    }

    async fn store(&self, request: &ExecuteRequest, response: &ExecuteResponse) -> Result<()> {
        let Some(result) = response.result.clone() else {
            return Ok(());
        };
        let action_digest = request.action.digest()?;
        let instance = request.instance_name.clone();
        let action_cache = self.action_cache.clone();
        tokio::task::spawn_blocking(move || {
            action_cache.put_action_result(&instance, &action_digest, &result)
        })
        .await
        .map_err(|e| Error::Internal(format!("action cache task failed: {}", e)))?
    }
}

#[async_trait]
impl BuildExecutor for CachingBuildExecutor {
    async fn execute(
        &self,
        request: &ExecuteRequest,
        cancel: &CancellationToken,
    ) -> ExecuteResponse {
        let response = self.base.execute(request, cancel).await;

        let cacheable = !request.action.do_not_cache
            && response.status.is_none()
            && response.result.as_ref().is_some_and(|r| r.exit_code == 0);
        if !cacheable {
            return response;
        }

        match self.store(request, &response).await {
            Ok(()) => response,
            Err(e) => {
                tracing::warn!(instance = %request.instance_name, error = %e, "failed to store action result");
                ExecuteResponse::from_error(e)
            }
        }
    }
}
