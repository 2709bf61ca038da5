//! Mesh Handle
//!
//! Cloneable front door to a running node. Every call is a message to the
//! node task; replies come back on oneshot channels.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use blehome_core::{
    BlehomeError, BthomeAdvertisement, CommandOutcome, CommandPayload,
    CommandReceipt, CoordinatorStats, DedupStats, DeviceState, FrameId, GattLink, MeshAddress,
    NeighborEntry, NodeRole, RelayStats, Result, SensorReading,
};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::node::NodeRequest;
use crate::registry::DeviceRecord;

// ----------------------------------------------------------------------------
// Events and Stats
// ----------------------------------------------------------------------------

/// Notifications published to every subscriber of a node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MeshEvent {
    /// A bridged BTHome advertisement reached this node
    SensorReading(SensorReading),
    DeviceStateChanged {
        address: MeshAddress,
        state: DeviceState,
    },
    DeviceDiscovered {
        address: MeshAddress,
        role: Option<NodeRole>,
        name: Option<String>,
    },
    CommandResolved {
        frame_id: FrameId,
        destination: MeshAddress,
        outcome: CommandOutcome,
    },
    LinkLost {
        peer: MeshAddress,
    },
}

/// Point-in-time view of a node's protocol state
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub address: MeshAddress,
    pub role: NodeRole,
    pub uptime: Duration,
    pub links: usize,
    pub neighbors: Vec<NeighborEntry>,
    pub outstanding_commands: usize,
    pub relay: RelayStats,
    pub dedup: DedupStats,
    pub commands: CoordinatorStats,
    pub malformed_frames: u64,
    pub known_devices: usize,
}

// ----------------------------------------------------------------------------
// Mesh Handle
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct MeshHandle {
    address: MeshAddress,
    role: NodeRole,
    requests: mpsc::Sender<NodeRequest>,
    events: broadcast::Sender<MeshEvent>,
}

impl MeshHandle {
    pub(crate) fn new(
        address: MeshAddress,
        role: NodeRole,
        requests: mpsc::Sender<NodeRequest>,
        events: broadcast::Sender<MeshEvent>,
    ) -> Self {
        Self {
            address,
            role,
            requests,
            events,
        }
    }

    pub fn address(&self) -> MeshAddress {
        self.address
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Hand a connected link to the node
    pub async fn attach_link(&self, link: Arc<dyn GattLink>) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.request(NodeRequest::AttachLink { link, reply }).await?;
        receive(response).await?
    }

    /// Send a command and wait until it is acknowledged, times out or is cancelled
    pub async fn send_command(
        &self,
        destination: MeshAddress,
        command: CommandPayload,
    ) -> Result<CommandReceipt> {
        self.send_command_cancellable(destination, command)
            .await?
            .wait()
            .await
    }

    /// Send a command, returning as soon as the first attempt is on its way
    pub async fn send_command_cancellable(
        &self,
        destination: MeshAddress,
        command: CommandPayload,
    ) -> Result<PendingCommand> {
        let (accepted, accepted_rx) = oneshot::channel();
        let (resolution, resolution_rx) = oneshot::channel();
        self.request(NodeRequest::SendCommand {
            destination,
            command,
            accepted,
            resolution,
        })
        .await?;
        let frame_id = receive(accepted_rx).await??;
        Ok(PendingCommand {
            frame_id,
            destination,
            resolution: resolution_rx,
            canceller: CommandCanceller {
                frame_id,
                requests: self.requests.clone(),
            },
        })
    }

    /// Query every address in `range` that is not yet a known device.
    ///
    /// Queries go out `spacing` apart and resolve concurrently; the
    /// receipts of every device that answered are returned in address order.
    pub async fn scan(
        &self,
        range: RangeInclusive<u16>,
        spacing: Duration,
    ) -> Result<Vec<CommandReceipt>> {
        let known: Vec<MeshAddress> = self
            .devices()
            .await?
            .into_iter()
            .map(|record| record.address)
            .collect();

        let mut pending = Vec::new();
        for value in range {
            let address = MeshAddress::new(value);
            if address == self.address || !address.is_unicast() || known.contains(&address) {
                continue;
            }
            pending.push(self.send_command_cancellable(address, CommandPayload::Query).await?);
            if !spacing.is_zero() {
                tokio::time::sleep(spacing).await;
            }
        }

        let results = futures::future::join_all(pending.into_iter().map(PendingCommand::wait)).await;
        let mut receipts = Vec::new();
        for result in results {
            match result {
                Ok(receipt) => receipts.push(receipt),
                Err(BlehomeError::CommandTimeout { destination, .. }) => {
                    debug!(%destination, "no answer during scan");
                }
                Err(error) => return Err(error),
            }
        }
        receipts.sort_by_key(|receipt| receipt.destination);
        Ok(receipts)
    }

    /// Bridge a BTHome advertisement heard by this node toward the gateway.
    ///
    /// Returns `false` when the same sensor packet was already bridged.
    pub async fn inject_bthome(&self, advertisement: BthomeAdvertisement) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.request(NodeRequest::InjectBthome {
            advertisement,
            reply,
        })
        .await?;
        receive(response).await?
    }

    /// Report a locally changed device state to the gateway
    pub async fn report_state(&self, state: DeviceState) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.request(NodeRequest::ReportState { state, reply }).await?;
        receive(response).await?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub async fn stats(&self) -> Result<NodeStats> {
        let (reply, response) = oneshot::channel();
        self.request(NodeRequest::Stats { reply }).await?;
        receive(response).await
    }

    pub async fn devices(&self) -> Result<Vec<DeviceRecord>> {
        let (reply, response) = oneshot::channel();
        self.request(NodeRequest::Devices { reply }).await?;
        receive(response).await
    }

    /// Stop the node task. Outstanding commands are abandoned.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        if self.requests.send(NodeRequest::Shutdown { reply }).await.is_err() {
            // Already stopped.
            return Ok(());
        }
        let _ = response.await;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.requests.is_closed()
    }

    async fn request(&self, request: NodeRequest) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| BlehomeError::channel_error("mesh node has stopped"))
    }
}

impl std::fmt::Debug for MeshHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshHandle")
            .field("address", &self.address)
            .field("role", &self.role)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn receive<T>(response: oneshot::Receiver<T>) -> Result<T> {
    response
        .await
        .map_err(|_| BlehomeError::channel_error("mesh node dropped the request"))
}

// ----------------------------------------------------------------------------
// Pending Commands
// ----------------------------------------------------------------------------

/// A command in flight
#[derive(Debug)]
pub struct PendingCommand {
    frame_id: FrameId,
    destination: MeshAddress,
    resolution: oneshot::Receiver<Result<CommandReceipt>>,
    canceller: CommandCanceller,
}

impl PendingCommand {
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn destination(&self) -> MeshAddress {
        self.destination
    }

    /// Detached cancel capability, usable while another task awaits `wait`
    pub fn canceller(&self) -> CommandCanceller {
        self.canceller.clone()
    }

    /// Cancel the command; `false` if it had already resolved
    pub async fn cancel(&self) -> Result<bool> {
        self.canceller.cancel().await
    }

    /// Wait for the terminal result
    pub async fn wait(self) -> Result<CommandReceipt> {
        receive(self.resolution).await?
    }
}

#[derive(Debug, Clone)]
pub struct CommandCanceller {
    frame_id: FrameId,
    requests: mpsc::Sender<NodeRequest>,
}

impl CommandCanceller {
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub async fn cancel(&self) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(NodeRequest::CancelCommand {
                frame_id: self.frame_id,
                reply,
            })
            .await
            .map_err(|_| BlehomeError::channel_error("mesh node has stopped"))?;
        receive(response).await
    }
}
