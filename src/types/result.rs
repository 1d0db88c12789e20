use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{Error, Status};

/// outcome of running an action
///
/// small outputs are inlined (`*_raw`, `OutputFile::contents`) next to their
/// digests so readers can skip a CAS round trip.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_raw: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_digest: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_raw: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_digest: Option<Digest>,
    #[serde(default)]
    pub output_files: Vec<OutputFile>,
    #[serde(default)]
    pub output_directories: Vec<OutputDirectory>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub path: String,
    pub digest: Digest,
    #[serde(default)]
    pub is_executable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<Vec<u8>>,
}

/// an output directory, uploaded as a single `Tree` object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDirectory {
    pub path: String,
    pub tree_digest: Digest,
}

/// what an executor hands back for one request
///
/// `status` is set when the action could not be run (staging failure, spawn
/// failure, deadline); a command that ran and exited nonzero is not an error.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ActionResult>,
    #[serde(default)]
    pub cached_result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl ExecuteResponse {
    pub fn from_result(result: ActionResult) -> Self {
        Self {
            result: Some(result),
            cached_result: false,
            status: None,
        }
    }

    pub fn from_cache(result: ActionResult) -> Self {
        Self {
            result: Some(result),
            cached_result: true,
            status: None,
        }
    }

    pub fn from_error(err: Error) -> Self {
        Self {
            result: None,
            cached_result: false,
            status: Some(Status::from(err)),
        }
    }

    /// true if the action ran without an execution-level error
    pub fn is_ok(&self) -> bool {
        self.status.is_none() && self.result.is_some()
    }
}
