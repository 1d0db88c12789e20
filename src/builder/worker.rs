//! worker side of the scheduler's request/response stream

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::builder::BuildExecutor;
use crate::error::{Error, Result};
use crate::types::{ExecuteRequest, ExecuteResponse};

/// execute requests arriving on `requests` one at a time, answering each on
/// `responses`
///
/// returns `Ok` when the scheduler closes its end or `cancel` fires, and an
/// error if responses can no longer be delivered.
pub async fn subscribe_and_execute(
    executor: &dyn BuildExecutor,
    mut requests: mpsc::Receiver<ExecuteRequest>,
    responses: mpsc::Sender<ExecuteResponse>,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let request = tokio::select! {
            request = requests.recv() => request,
            _ = cancel.cancelled() => return Ok(()),
        };
        let Some(request) = request else {
            tracing::debug!("scheduler closed the work stream");
            return Ok(());
        };

        let response = executor.execute(&request, cancel).await;
        if responses.send(response).await.is_err() {
            return Err(Error::Unavailable(
                "scheduler stopped accepting responses".to_string(),
            ));
        }
    }
}
