//! Mesh Node Task
//!
//! The single owner of a node's protocol state. All inputs (API requests,
//! link traffic, transmit results, timer ticks) arrive as messages and are
//! processed one at a time, so the relay engine, coordinator and registry
//! need no locking. Link transmissions run as spawned tasks and report
//! back through the same event channel.

use std::sync::Arc;

use blehome_core::{
    AckLedger, AckOutcome, AckPayload, AckResolution, BlehomeError, BthomeAdvertisement,
    BthomeBridge, CommandCoordinator, CommandOutcome, CommandPayload, CommandReceipt,
    CoordinatorAction, DeviceState, DiscoveryBeacon, Frame, FrameError, FrameId,
    FrameIdGenerator, FrameKey, GattLink, MeshAddress, MeshConfig, NodeRole, PayloadType, RelayEngine,
    Result, SequenceCounter, TimeSource, Timestamp, Ttl, WireFormat,
};
use hashbrown::HashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::executor::CommandExecutor;
use crate::handle::{MeshEvent, NodeStats};
use crate::link::LinkSession;
use crate::registry::{DeviceRecord, DeviceRegistry, RegistryUpdate};

/// Commands remembered for re-acknowledging retransmissions
const ACK_LEDGER_CAPACITY: usize = 64;

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

/// Requests issued through a `MeshHandle`
pub(crate) enum NodeRequest {
    AttachLink {
        link: Arc<dyn GattLink>,
        reply: oneshot::Sender<Result<()>>,
    },
    SendCommand {
        destination: MeshAddress,
        command: CommandPayload,
        accepted: oneshot::Sender<Result<FrameId>>,
        resolution: oneshot::Sender<Result<CommandReceipt>>,
    },
    CancelCommand {
        frame_id: FrameId,
        reply: oneshot::Sender<bool>,
    },
    InjectBthome {
        advertisement: BthomeAdvertisement,
        reply: oneshot::Sender<Result<bool>>,
    },
    ReportState {
        state: DeviceState,
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<NodeStats>,
    },
    Devices {
        reply: oneshot::Sender<Vec<DeviceRecord>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Internal traffic from link sessions and transmit tasks
#[derive(Debug)]
pub(crate) enum NodeEvent {
    FrameReceived {
        from: MeshAddress,
        frame: Frame,
        rssi: Option<i16>,
    },
    Malformed {
        from: MeshAddress,
        error: FrameError,
    },
    Transmitted {
        peer: MeshAddress,
        key: FrameKey,
        outcome: AckOutcome,
    },
    LinkDown {
        peer: MeshAddress,
        session_id: u64,
    },
}

struct AttachedLink {
    session: Arc<LinkSession>,
    reader: JoinHandle<()>,
}

// ----------------------------------------------------------------------------
// Node Task
// ----------------------------------------------------------------------------

pub(crate) struct NodeTask {
    config: MeshConfig,
    wire: WireFormat,
    clock: Arc<dyn TimeSource>,
    relay: RelayEngine,
    coordinator: CommandCoordinator,
    ledger: AckLedger,
    bridge: BthomeBridge,
    registry: DeviceRegistry,
    executor: Option<Box<dyn CommandExecutor>>,
    links: HashMap<MeshAddress, AttachedLink>,
    waiters: HashMap<FrameId, oneshot::Sender<Result<CommandReceipt>>>,
    frame_ids: FrameIdGenerator,
    sequence: SequenceCounter,
    requests: mpsc::Receiver<NodeRequest>,
    events_tx: mpsc::Sender<NodeEvent>,
    events_rx: mpsc::Receiver<NodeEvent>,
    mesh_events: broadcast::Sender<MeshEvent>,
    started_at: Timestamp,
    last_beacon: Option<Timestamp>,
    malformed_frames: u64,
    running: bool,
}

impl NodeTask {
    pub(crate) fn new(
        config: MeshConfig,
        executor: Option<Box<dyn CommandExecutor>>,
        clock: Arc<dyn TimeSource>,
        requests: mpsc::Receiver<NodeRequest>,
        mesh_events: broadcast::Sender<MeshEvent>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.runtime.event_buffer_size);
        let started_at = clock.now();
        Self {
            wire: WireFormat::new(config.network_key.clone()),
            relay: RelayEngine::new(&config),
            coordinator: CommandCoordinator::new(&config.command),
            ledger: AckLedger::new(ACK_LEDGER_CAPACITY, config.command.reack_holdoff),
            bridge: BthomeBridge::new(config.address, config.gateway, config.ttl(), &config.bthome),
            registry: DeviceRegistry::default(),
            executor,
            links: HashMap::new(),
            waiters: HashMap::new(),
            frame_ids: FrameIdGenerator::random(),
            sequence: SequenceCounter::default(),
            requests,
            events_tx,
            events_rx,
            mesh_events,
            started_at,
            last_beacon: None,
            malformed_frames: 0,
            running: true,
            clock,
            config,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            address = %self.config.address,
            role = %self.config.role,
            "mesh node starting"
        );
        if self.config.network_key.is_development() {
            warn!("using the development network key; configure network_key for real installs");
        }

        let mut ticker = tokio::time::interval(self.config.runtime.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.running {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => {
                        info!("all mesh handles dropped, stopping node");
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = ticker.tick() => self.on_tick(),
            }
        }

        for (_, attached) in self.links.drain() {
            attached.reader.abort();
        }
        info!(address = %self.config.address, "mesh node stopped");
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // ---- Requests ----

    fn handle_request(&mut self, request: NodeRequest) {
        match request {
            NodeRequest::AttachLink { link, reply } => {
                let _ = reply.send(self.attach_link(link));
            }
            NodeRequest::SendCommand {
                destination,
                command,
                accepted,
                resolution,
            } => match self.start_command(destination, command) {
                Ok(frame_id) => {
                    self.waiters.insert(frame_id, resolution);
                    let _ = accepted.send(Ok(frame_id));
                }
                Err(error) => {
                    let _ = accepted.send(Err(error));
                }
            },
            NodeRequest::CancelCommand { frame_id, reply } => {
                let _ = reply.send(self.cancel_command(frame_id));
            }
            NodeRequest::InjectBthome {
                advertisement,
                reply,
            } => {
                let _ = reply.send(self.bridge_advertisement(&advertisement));
            }
            NodeRequest::ReportState { state, reply } => {
                let _ = reply.send(self.report_state(state));
            }
            NodeRequest::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            NodeRequest::Devices { reply } => {
                let _ = reply.send(self.registry.records());
            }
            NodeRequest::Shutdown { reply } => {
                self.running = false;
                let _ = reply.send(());
            }
        }
    }

    fn attach_link(&mut self, link: Arc<dyn GattLink>) -> Result<()> {
        let peer = link.peer();
        if peer == self.config.address || !peer.is_unicast() {
            return Err(BlehomeError::config_error(
                "link",
                format!("cannot attach a link to {}", peer),
            ));
        }

        let session = LinkSession::new(link.clone(), self.config.link.clone());
        let reader = tokio::spawn(
            session
                .clone()
                .run_reader(self.wire.clone(), self.events_tx.clone()),
        );
        if let Some(previous) = self.links.insert(peer, AttachedLink { session, reader }) {
            debug!(%peer, "replacing existing link session");
            previous.reader.abort();
        }

        let now = self.now();
        self.relay
            .neighbors_mut()
            .record_sighting(peer, link.rssi(), now);
        info!(%peer, "link attached");

        // Introduce ourselves right away instead of waiting for the next beacon.
        self.send_beacon(now);
        Ok(())
    }

    fn start_command(&mut self, destination: MeshAddress, command: CommandPayload) -> Result<FrameId> {
        if self.config.role != NodeRole::Gateway {
            return Err(BlehomeError::config_error(
                "role",
                "only gateway nodes issue commands",
            ));
        }
        if destination == self.config.address || destination == MeshAddress::UNASSIGNED {
            return Err(BlehomeError::config_error(
                "destination",
                format!("{} cannot receive commands", destination),
            ));
        }

        let now = self.now();
        let frame = self.build_frame(
            destination,
            self.config.ttl(),
            PayloadType::Command,
            command.to_bytes(),
        )?;
        let frame_id = frame.frame_id;
        self.coordinator.register(frame.clone(), now)?;
        debug!(%frame_id, %destination, ?command, "sending command");
        self.originate(frame, now);
        Ok(frame_id)
    }

    fn cancel_command(&mut self, frame_id: FrameId) -> bool {
        let Some(destination) = self
            .coordinator
            .outstanding(frame_id)
            .map(|command| command.destination)
        else {
            return false;
        };
        self.coordinator.cancel(frame_id);
        if let Some(waiter) = self.waiters.remove(&frame_id) {
            let _ = waiter.send(Err(BlehomeError::CommandCancelled { frame_id }));
        }
        debug!(%frame_id, "command cancelled");
        self.publish(MeshEvent::CommandResolved {
            frame_id,
            destination,
            outcome: CommandOutcome::Cancelled,
        });
        true
    }

    fn bridge_advertisement(&mut self, advertisement: &BthomeAdvertisement) -> Result<bool> {
        if !self.config.bthome.enabled {
            return Err(BlehomeError::config_error(
                "bthome.enabled",
                "BTHome bridging is disabled on this node",
            ));
        }
        let frame_id = self.frame_ids.next_id();
        let Some(frame) = self.bridge.wrap(advertisement, frame_id)? else {
            trace!(sensor = %advertisement.mac_string(), "repeated BTHome packet suppressed");
            return Ok(false);
        };
        let frame = frame.with_sequence(self.sequence.next_sequence());
        let now = self.now();
        self.originate(frame, now);
        Ok(true)
    }

    fn report_state(&mut self, state: DeviceState) -> Result<()> {
        let frame = self.build_frame(
            self.config.gateway,
            self.config.ttl(),
            PayloadType::StateReport,
            state.to_bytes().to_vec(),
        )?;
        let now = self.now();
        self.originate(frame, now);
        Ok(())
    }

    fn stats(&self) -> NodeStats {
        let now = self.now();
        NodeStats {
            address: self.config.address,
            role: self.config.role,
            uptime: now.duration_since(self.started_at),
            links: self.links.len(),
            neighbors: self.relay.neighbors().iter().cloned().collect(),
            outstanding_commands: self.coordinator.outstanding_count(),
            relay: self.relay.stats(),
            dedup: self.relay.dedup_stats(),
            commands: self.coordinator.stats(),
            malformed_frames: self.malformed_frames,
            known_devices: self.registry.len(),
        }
    }

    // ---- Events ----

    fn handle_event(&mut self, event: NodeEvent) {
        let now = self.now();
        match event {
            NodeEvent::FrameReceived { from, frame, rssi } => {
                self.relay.neighbors_mut().record_sighting(from, rssi, now);
                self.on_frame(frame, from, now);
            }
            NodeEvent::Malformed { from, error } => {
                self.malformed_frames += 1;
                debug!(%from, %error, "malformed input dropped");
            }
            NodeEvent::Transmitted { peer, key, outcome } => {
                self.relay
                    .neighbors_mut()
                    .record_link_outcome(peer, outcome.is_acked(), now);
                if !outcome.is_acked() {
                    debug!(%peer, %key, ?outcome, "frame not delivered on link");
                }
            }
            NodeEvent::LinkDown { peer, session_id } => {
                let current = self
                    .links
                    .get(&peer)
                    .map(|attached| attached.session.id() == session_id)
                    .unwrap_or(false);
                if current {
                    self.links.remove(&peer);
                    self.relay.neighbors_mut().remove(peer);
                    warn!(%peer, "link lost");
                    self.publish(MeshEvent::LinkLost { peer });
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame, from: MeshAddress, now: Timestamp) {
        let key = frame.key();
        let reack_candidate =
            frame.payload_type == PayloadType::Command && frame.destination == self.config.address;

        let outcome = self.relay.process(frame, Some(from), now);

        if outcome.is_duplicate() {
            if reack_candidate {
                if let Some(ack) = self.ledger.reack(key, now) {
                    debug!(%key, "re-acknowledging retransmitted command");
                    self.send_ack(key.origin, ack, now);
                }
            }
            return;
        }

        if let Some(forward) = outcome.forward {
            trace!(%key, targets = forward.targets.len(), "relaying frame");
            self.transmit(&forward.frame, &forward.targets);
        }
        if let Some(frame) = outcome.deliver {
            self.consume(frame, now);
        }
    }

    // ---- Local consumption ----

    fn consume(&mut self, frame: Frame, now: Timestamp) {
        match frame.payload_type {
            PayloadType::Command => self.execute_command(&frame, now),
            PayloadType::Ack => match AckPayload::from_bytes(&frame.payload) {
                Ok(ack) => self.on_ack(ack, frame.origin, now),
                Err(error) => debug!(key = %frame.key(), %error, "undecodable ack"),
            },
            PayloadType::SensorRelay => match BthomeBridge::reading(&frame) {
                Ok(reading) => {
                    debug!(
                        bridge = %reading.bridge,
                        measurements = reading.measurements.len(),
                        "sensor reading received"
                    );
                    self.publish(MeshEvent::SensorReading(reading));
                }
                Err(error) => debug!(key = %frame.key(), %error, "undecodable sensor relay"),
            },
            PayloadType::Discovery => match DiscoveryBeacon::from_bytes(&frame.payload) {
                Ok(beacon) => {
                    let update = self.registry.observe_beacon(frame.origin, &beacon, now);
                    if update.discovered {
                        info!(address = %frame.origin, role = %beacon.role, name = %beacon.name, "node discovered");
                        self.announce_discovery(frame.origin);
                    }
                }
                Err(error) => debug!(key = %frame.key(), %error, "undecodable beacon"),
            },
            PayloadType::StateReport => match DeviceState::from_bytes(&frame.payload) {
                Ok(state) => {
                    let update = self.registry.update_state(frame.origin, state, now);
                    self.announce_update(frame.origin, update, Some(state));
                }
                Err(error) => debug!(key = %frame.key(), %error, "undecodable state report"),
            },
        }
    }

    fn execute_command(&mut self, frame: &Frame, now: Timestamp) {
        let Some(executor) = self.executor.as_mut() else {
            debug!(key = %frame.key(), "no executor on this node, command ignored");
            return;
        };

        let ack = match CommandPayload::from_bytes(&frame.payload) {
            Ok(command) => match executor.execute(&command) {
                Ok(state) => {
                    debug!(key = %frame.key(), ?command, "command executed");
                    AckPayload::ok(frame.frame_id, state)
                }
                Err(reason) => {
                    warn!(key = %frame.key(), %reason, "command rejected");
                    AckPayload::rejected(frame.frame_id)
                }
            },
            Err(error) => {
                warn!(key = %frame.key(), %error, "malformed command rejected");
                AckPayload::rejected(frame.frame_id)
            }
        };

        self.ledger.record(frame.key(), ack, now);
        self.send_ack(frame.origin, ack, now);

        if let Some(state) = ack.state {
            let local = self.config.address;
            let update = self.registry.update_state(local, state, now);
            if update.state_changed {
                self.publish(MeshEvent::DeviceStateChanged {
                    address: local,
                    state,
                });
            }
        }
    }

    fn on_ack(&mut self, ack: AckPayload, from: MeshAddress, now: Timestamp) {
        match self.coordinator.on_ack(&ack, from, now) {
            AckResolution::Succeeded(receipt) => {
                let update = match receipt.state {
                    Some(state) => self.registry.update_state(from, state, now),
                    None => self.registry.mark_seen(from, now),
                };
                self.announce_update(from, update, receipt.state);

                if let Some(waiter) = self.waiters.remove(&receipt.frame_id) {
                    let _ = waiter.send(Ok(receipt.clone()));
                }
                self.publish(MeshEvent::CommandResolved {
                    frame_id: receipt.frame_id,
                    destination: receipt.destination,
                    outcome: CommandOutcome::Succeeded(receipt),
                });
            }
            AckResolution::Duplicate => {
                trace!(frame_id = %ack.acked, %from, "duplicate ack ignored");
            }
            AckResolution::Unknown => {
                debug!(frame_id = %ack.acked, %from, "ack for unknown command");
            }
        }
    }

    fn announce_update(&mut self, address: MeshAddress, update: RegistryUpdate, state: Option<DeviceState>) {
        if update.discovered {
            self.announce_discovery(address);
        }
        if update.state_changed {
            if let Some(state) = state {
                self.publish(MeshEvent::DeviceStateChanged { address, state });
            }
        }
    }

    fn announce_discovery(&mut self, address: MeshAddress) {
        let (role, name) = self
            .registry
            .get(&address)
            .map(|record| (record.role, record.name.clone()))
            .unwrap_or((None, None));
        self.publish(MeshEvent::DeviceDiscovered {
            address,
            role,
            name,
        });
    }

    // ---- Timers ----

    fn on_tick(&mut self) {
        let now = self.now();

        for peer in self.relay.evict_expired(now) {
            debug!(%peer, "neighbor went stale");
        }

        for action in self.coordinator.poll(now) {
            match action {
                CoordinatorAction::Retransmit(frame) => self.originate(frame, now),
                CoordinatorAction::Failed {
                    frame_id,
                    destination,
                    attempts,
                } => {
                    if let Some(waiter) = self.waiters.remove(&frame_id) {
                        let _ = waiter.send(Err(BlehomeError::CommandTimeout {
                            frame_id,
                            destination,
                            attempts,
                        }));
                    }
                    warn!(%frame_id, %destination, attempts, "command timed out");
                    self.publish(MeshEvent::CommandResolved {
                        frame_id,
                        destination,
                        outcome: CommandOutcome::TimedOut { attempts },
                    });
                }
            }
        }

        let beacon_due = self
            .last_beacon
            .map(|last| now.duration_since(last) >= self.config.discovery.beacon_interval)
            .unwrap_or(true);
        if beacon_due {
            self.send_beacon(now);
        }
    }

    // ---- Transmission ----

    fn build_frame(
        &mut self,
        destination: MeshAddress,
        ttl: Ttl,
        payload_type: PayloadType,
        payload: Vec<u8>,
    ) -> Result<Frame> {
        let frame = Frame::new(
            self.frame_ids.next_id(),
            self.config.address,
            destination,
            ttl,
            payload_type,
            payload,
        )?;
        Ok(frame.with_sequence(self.sequence.next_sequence()))
    }

    fn send_ack(&mut self, destination: MeshAddress, ack: AckPayload, now: Timestamp) {
        match self.build_frame(destination, self.config.ttl(), PayloadType::Ack, ack.to_bytes()) {
            Ok(frame) => self.originate(frame, now),
            Err(error) => warn!(%error, "failed to build ack frame"),
        }
    }

    fn send_beacon(&mut self, now: Timestamp) {
        self.last_beacon = Some(now);
        if self.links.is_empty() {
            return;
        }
        let beacon = DiscoveryBeacon {
            role: self.config.role,
            capabilities: self.config.discovery.capabilities,
            name: self.config.discovery.name.clone(),
        };
        let frame = match self.build_frame(
            MeshAddress::BROADCAST,
            Ttl::ZERO,
            PayloadType::Discovery,
            beacon.to_bytes(),
        ) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "failed to build beacon");
                return;
            }
        };
        self.relay.originate(&frame, now);
        let peers: Vec<MeshAddress> = self.links.keys().copied().collect();
        self.transmit(&frame, &peers);
    }

    /// Send a locally built frame into the mesh, or consume it if it is ours
    fn originate(&mut self, frame: Frame, now: Timestamp) {
        if frame.destination == self.config.address {
            self.consume(frame, now);
            return;
        }
        let targets = self.relay.originate(&frame, now);
        if targets.is_empty() {
            debug!(key = %frame.key(), "no neighbors to send to");
            return;
        }
        self.transmit(&frame, &targets);
    }

    fn transmit(&self, frame: &Frame, targets: &[MeshAddress]) {
        let bytes: Arc<[u8]> = match self.wire.encode(frame) {
            Ok(bytes) => bytes.into(),
            Err(error) => {
                warn!(key = %frame.key(), %error, "failed to encode frame");
                return;
            }
        };
        let key = frame.key();

        for peer in targets {
            let Some(attached) = self.links.get(peer) else {
                trace!(%peer, %key, "no link session for target");
                continue;
            };
            let session = attached.session.clone();
            let events = self.events_tx.clone();
            let bytes = bytes.clone();
            let peer = *peer;
            tokio::spawn(async move {
                let outcome = session.send_encoded(key, &bytes).await;
                let _ = events
                    .send(NodeEvent::Transmitted { peer, key, outcome })
                    .await;
            });
        }
    }

    fn publish(&self, event: MeshEvent) {
        // No subscribers is fine.
        let _ = self.mesh_events.send(event);
    }
}
