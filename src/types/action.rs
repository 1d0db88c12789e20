use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::Result;

/// a request to run a command against an input tree
///
/// the digest of the serialized action, together with the instance name, is
/// the key used to collapse identical concurrent requests into one job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub command_digest: Digest,
    pub input_root_digest: Digest,
    #[serde(default)]
    pub output_files: Vec<String>,
    #[serde(default)]
    pub output_directories: Vec<String>,
    #[serde(default)]
    pub do_not_cache: bool,
}

impl Action {
    pub fn digest(&self) -> Result<Digest> {
        Digest::of_message(self)
    }
}

/// the process to run: argument vector plus environment
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment_variables: Vec<EnvironmentVariable>,
}

impl Command {
    pub fn new<I, S>(arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            arguments: arguments.into_iter().map(Into::into).collect(),
            environment_variables: vec![],
        }
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_variables.push(EnvironmentVariable {
            name: name.into(),
            value: value.into(),
        });
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

/// an execution request as submitted by a client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub instance_name: String,
    pub action: Action,
    #[serde(default)]
    pub skip_cache_lookup: bool,
}

impl ExecuteRequest {
    pub fn new(instance_name: impl Into<String>, action: Action) -> Self {
        Self {
            instance_name: instance_name.into(),
            action,
            skip_cache_lookup: false,
        }
    }
}
