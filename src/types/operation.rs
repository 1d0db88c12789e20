use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::Status;
use crate::types::ExecuteResponse;

/// lifecycle of a job; `Completed` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Queued,
    Executing,
    Completed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Queued => write!(f, "queued"),
            Stage::Executing => write!(f, "executing"),
            Stage::Completed => write!(f, "completed"),
        }
    }
}

/// what a completed job carries: the executor's response, or the reason
/// no response could be produced
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResult {
    Response(ExecuteResponse),
    Error(Status),
}

/// point-in-time view of a job, as returned by execute and watch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub action_digest: Digest,
    pub stage: Stage,
    pub result: Option<OperationResult>,
}

impl Operation {
    pub fn queued(name: impl Into<String>, action_digest: Digest) -> Self {
        Self {
            name: name.into(),
            action_digest,
            stage: Stage::Queued,
            result: None,
        }
    }

    pub fn completed(
        name: impl Into<String>,
        action_digest: Digest,
        result: OperationResult,
    ) -> Self {
        Self {
            name: name.into(),
            action_digest,
            stage: Stage::Completed,
            result: Some(result),
        }
    }

    pub fn is_done(&self) -> bool {
        self.stage == Stage::Completed
    }

    /// the execute response, if the job completed with one
    pub fn response(&self) -> Option<&ExecuteResponse> {
        match &self.result {
            Some(OperationResult::Response(response)) => Some(response),
            _ => None,
        }
    }
}
