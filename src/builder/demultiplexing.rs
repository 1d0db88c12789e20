use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::builder::{BuildQueue, OperationWatcher};
use crate::digest::KEY_SEPARATOR;
use crate::error::{Error, Result};
use crate::types::{ExecuteRequest, Operation};

/// routes requests to one of several backend queues by instance name
///
/// operation names handed out are `instance|name`, so that a later watch
/// can find its way back to the backend that owns the job.
pub struct DemultiplexingBuildQueue {
    backends: HashMap<String, Arc<dyn BuildQueue>>,
}

impl DemultiplexingBuildQueue {
    pub fn new(backends: HashMap<String, Arc<dyn BuildQueue>>) -> Self {
        Self { backends }
    }

    fn backend(&self, instance: &str) -> Result<&Arc<dyn BuildQueue>> {
        if instance.contains(KEY_SEPARATOR) {
            return Err(Error::InvalidInstanceName(format!(
                "instance name {:?} contains {:?}",
                instance, KEY_SEPARATOR
            )));
        }
        self.backends
            .get(instance)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown instance name {:?}", instance)))
    }
}

#[async_trait]
impl BuildQueue for DemultiplexingBuildQueue {
    async fn execute(&self, request: ExecuteRequest) -> Result<Operation> {
        let instance = request.instance_name.clone();
        let backend = self.backend(&instance)?;
        let mut operation = backend.execute(request).await?;
        operation.name = format!("{}{}{}", instance, KEY_SEPARATOR, operation.name);
        Ok(operation)
    }

    fn watch(&self, name: &str) -> Result<OperationWatcher> {
        let (instance, inner) = name.split_once(KEY_SEPARATOR).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "unable to extract instance name from operation name {:?}",
                name
            ))
        })?;
        let backend = self.backend(instance)?;
        Ok(backend.watch(inner)?.with_name_prefix(instance))
    }
}
