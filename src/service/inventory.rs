use std::sync::Arc;

use crate::deploy::error::DeployError;
use crate::service::{snapshot::ContainerSnapshot, supervisor::ContainerRuntime};

/// Read side of the container runtime, backing `/list`.
#[derive(Clone)]
pub struct Inventory {
    runtime: Arc<dyn ContainerRuntime>,
}

impl Inventory {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Every managed container, running or not, sorted by name.
    pub async fn list(&self) -> Result<Vec<ContainerSnapshot>, DeployError> {
        let mut containers = self.runtime.list_all().await?;
        containers.sort_by(|a, b| a.names.cmp(&b.names));
        Ok(containers)
    }
}
