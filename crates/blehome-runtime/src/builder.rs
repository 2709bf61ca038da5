//! Node Builder API
//!
//! Validates a `MeshConfig`, wires up the node task's channels and spawns
//! it on the current tokio runtime.

use std::sync::Arc;

use blehome_core::{DeviceState, MeshConfig, Result, TimeSource};
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::clock::TokioTimeSource;
use crate::executor::{CommandExecutor, LightExecutor};
use crate::handle::MeshHandle;
use crate::node::NodeTask;

// ----------------------------------------------------------------------------
// Node Builder
// ----------------------------------------------------------------------------

pub struct NodeBuilder {
    config: MeshConfig,
    executor: Option<Box<dyn CommandExecutor>>,
    clock: Option<Arc<dyn TimeSource>>,
}

impl NodeBuilder {
    pub fn new(config: MeshConfig) -> Self {
        Self {
            config,
            executor: None,
            clock: None,
        }
    }

    /// Use a custom executor for commands addressed to this node
    pub fn with_executor(mut self, executor: impl CommandExecutor) -> Self {
        self.executor = Some(Box::new(executor));
        self
    }

    /// Drive protocol timestamps from another clock
    pub fn with_time_source(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and start the node task.
    ///
    /// Devices and bridges without an explicit executor get an in-memory
    /// light. Must be called from within a tokio runtime.
    pub fn spawn(self) -> Result<MeshHandle> {
        self.config.validate()?;

        let executor = match self.executor {
            Some(executor) => Some(executor),
            None if self.config.role.executes_commands() => {
                Some(Box::new(LightExecutor::new(DeviceState::default())) as Box<dyn CommandExecutor>)
            }
            None => None,
        };
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(TokioTimeSource::new()));

        let (request_tx, request_rx) = mpsc::channel(self.config.runtime.event_buffer_size);
        let (events_tx, _) = broadcast::channel(self.config.runtime.mesh_event_buffer_size);

        let handle = MeshHandle::new(
            self.config.address,
            self.config.role,
            request_tx,
            events_tx.clone(),
        );
        let task = NodeTask::new(self.config, executor, clock, request_rx, events_tx);
        tokio::spawn(task.run());

        info!(address = %handle.address(), role = %handle.role(), "mesh node spawned");
        Ok(handle)
    }
}

impl std::fmt::Debug for NodeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBuilder")
            .field("address", &self.config.address)
            .field("role", &self.config.role)
            .field("custom_executor", &self.executor.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blehome_core::{BlehomeError, MeshAddress, NodeRole};

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_spawn() {
        let config = MeshConfig::device(MeshAddress::new(2)).with_default_ttl(0);
        assert!(matches!(
            NodeBuilder::new(config).spawn(),
            Err(BlehomeError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_spawned_node_reports_its_identity() {
        let handle = NodeBuilder::new(MeshConfig::gateway(MeshAddress::new(1)))
            .spawn()
            .unwrap();
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.address, MeshAddress::new(1));
        assert_eq!(stats.role, NodeRole::Gateway);
        assert_eq!(stats.links, 0);

        handle.shutdown().await.unwrap();
        assert!(handle.stats().await.is_err());
    }
}
