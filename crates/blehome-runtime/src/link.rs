//! Link Session
//!
//! Wraps one `GattLink` with the per-hop acknowledgement protocol. Every
//! frame written to the neighbor waits for a 7 byte link ack and is
//! retransmitted on the same link a bounded number of times; every valid
//! frame received is link-acked immediately and handed to the node.
//!
//! Writes are serialised through the radio lock, one buffer at a time, so
//! concurrent senders queue instead of interleaving. The lock is held only
//! for the write itself: waiting for an ack must not block the link ack this
//! side owes the neighbor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use blehome_core::{
    AckOutcome, FrameError, FrameKey, GattLink, LinkConfig, MeshAddress, WireFormat, WireKind,
};
use hashbrown::HashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, trace, warn};

use crate::node::NodeEvent;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Counters of one link session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub frames_sent: u64,
    pub retransmissions: u64,
    pub link_acks_received: u64,
    pub frames_received: u64,
    pub malformed_received: u64,
}

#[derive(Debug, Default)]
struct LinkCounters {
    frames_sent: AtomicU64,
    retransmissions: AtomicU64,
    link_acks_received: AtomicU64,
    frames_received: AtomicU64,
    malformed_received: AtomicU64,
}

pub struct LinkSession {
    id: u64,
    peer: MeshAddress,
    link: Arc<dyn GattLink>,
    config: LinkConfig,
    radio: Mutex<()>,
    pending: Mutex<HashMap<FrameKey, Vec<oneshot::Sender<()>>>>,
    counters: LinkCounters,
}

impl LinkSession {
    pub fn new(link: Arc<dyn GattLink>, config: LinkConfig) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer: link.peer(),
            link,
            config,
            radio: Mutex::new(()),
            pending: Mutex::new(HashMap::new()),
            counters: LinkCounters::default(),
        })
    }

    /// Unique id distinguishing this session from later ones to the same peer
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> MeshAddress {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            retransmissions: self.counters.retransmissions.load(Ordering::Relaxed),
            link_acks_received: self.counters.link_acks_received.load(Ordering::Relaxed),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            malformed_received: self.counters.malformed_received.load(Ordering::Relaxed),
        }
    }

    /// Deliver an encoded frame to the neighbor, retrying on this link.
    ///
    /// Returns `LinkLost` once the retry budget is spent without a link ack.
    pub async fn send_encoded(&self, key: FrameKey, bytes: &[u8]) -> AckOutcome {
        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                self.counters.retransmissions.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %self.peer, %key, attempt, "retransmitting on link");
            }
            match self.send_once(key, bytes).await {
                AckOutcome::TimedOut => continue,
                outcome => return outcome,
            }
        }
        warn!(peer = %self.peer, %key, "no link ack after retries");
        AckOutcome::LinkLost
    }

    /// Single write followed by one ack wait
    pub async fn send_once(&self, key: FrameKey, bytes: &[u8]) -> AckOutcome {
        if !self.link.is_connected() {
            return AckOutcome::LinkLost;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.lock().await.entry(key).or_default().push(ack_tx);

        let written = {
            let _radio = self.radio.lock().await;
            self.link.write(bytes).await
        };
        if let Err(error) = written {
            debug!(peer = %self.peer, %key, %error, "link write failed");
            self.forget_waiters(key).await;
            return AckOutcome::LinkLost;
        }
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(self.config.ack_timeout, ack_rx).await {
            Ok(Ok(())) => AckOutcome::Acked,
            Ok(Err(_)) => AckOutcome::LinkLost,
            Err(_) => {
                self.forget_waiters(key).await;
                AckOutcome::TimedOut
            }
        }
    }

    /// Read inbound traffic until the link closes, then report it down
    pub(crate) async fn run_reader(self: Arc<Self>, wire: WireFormat, events: mpsc::Sender<NodeEvent>) {
        info!(peer = %self.peer, session = self.id, "link session started");

        while let Some(bytes) = self.link.recv().await {
            match WireKind::classify(&bytes) {
                Some(WireKind::LinkAck) => match WireFormat::decode_link_ack(&bytes) {
                    Ok(key) => self.complete(key).await,
                    Err(error) => self.report_malformed(error, &events).await,
                },
                Some(WireKind::Frame) => match wire.decode(&bytes) {
                    Ok(frame) => {
                        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                        self.acknowledge(frame.key()).await;
                        let event = NodeEvent::FrameReceived {
                            from: self.peer,
                            frame,
                            rssi: self.link.rssi(),
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => self.report_malformed(error, &events).await,
                },
                None => {
                    let error = match bytes.first() {
                        Some(byte) => FrameError::BadMagic(*byte),
                        None => FrameError::TooShort {
                            expected: 1,
                            actual: 0,
                        },
                    };
                    self.report_malformed(error, &events).await;
                }
            }
        }

        // Dropping the waiters resolves in-flight sends as LinkLost.
        self.pending.lock().await.clear();
        info!(peer = %self.peer, session = self.id, "link session closed");
        let _ = events
            .send(NodeEvent::LinkDown {
                peer: self.peer,
                session_id: self.id,
            })
            .await;
    }

    async fn complete(&self, key: FrameKey) {
        self.counters.link_acks_received.fetch_add(1, Ordering::Relaxed);
        match self.pending.lock().await.remove(&key) {
            Some(waiters) => {
                for waiter in waiters {
                    let _ = waiter.send(());
                }
            }
            None => trace!(peer = %self.peer, %key, "link ack with no waiter"),
        }
    }

    async fn acknowledge(&self, key: FrameKey) {
        let ack = WireFormat::encode_link_ack(key);
        let _radio = self.radio.lock().await;
        if let Err(error) = self.link.write(&ack).await {
            debug!(peer = %self.peer, %key, %error, "failed to send link ack");
        }
    }

    async fn forget_waiters(&self, key: FrameKey) {
        let mut pending = self.pending.lock().await;
        if let Some(waiters) = pending.get_mut(&key) {
            waiters.retain(|waiter| !waiter.is_closed());
            if waiters.is_empty() {
                pending.remove(&key);
            }
        }
    }

    async fn report_malformed(&self, error: FrameError, events: &mpsc::Sender<NodeEvent>) {
        self.counters.malformed_received.fetch_add(1, Ordering::Relaxed);
        debug!(peer = %self.peer, %error, "dropping malformed input");
        let _ = events
            .send(NodeEvent::Malformed {
                from: self.peer,
                error,
            })
            .await;
    }
}

impl std::fmt::Debug for LinkSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("connected", &self.link.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::loopback_pair;
    use blehome_core::{Frame, FrameId, NetworkKey, PayloadType, Ttl};
    use std::time::Duration;

    fn config() -> LinkConfig {
        LinkConfig {
            ack_timeout: Duration::from_millis(100),
            retries: 2,
        }
    }

    fn frame() -> Frame {
        Frame::new(
            FrameId::new(42),
            MeshAddress::new(1),
            MeshAddress::new(2),
            Ttl::DEFAULT,
            PayloadType::Command,
            vec![0x82, 0x01],
        )
        .unwrap()
    }

    fn start_pair() -> (
        Arc<LinkSession>,
        Arc<crate::loopback::LoopbackLink>,
        mpsc::Receiver<NodeEvent>,
    ) {
        let wire = WireFormat::new(NetworkKey::default());
        let (near, far) = loopback_pair(MeshAddress::new(1), MeshAddress::new(2), Duration::from_millis(5));
        let sender = LinkSession::new(near, config());
        let receiver = LinkSession::new(far.clone(), config());
        let (sender_tx, _sender_rx) = mpsc::channel(16);
        let (receiver_tx, receiver_rx) = mpsc::channel(16);
        tokio::spawn(sender.clone().run_reader(wire.clone(), sender_tx));
        tokio::spawn(receiver.run_reader(wire, receiver_tx));
        (sender, far, receiver_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_is_acked_and_delivered() {
        let (sender, _far, mut inbound) = start_pair();
        let bytes = WireFormat::new(NetworkKey::default()).encode(&frame()).unwrap();

        assert_eq!(sender.send_encoded(frame().key(), &bytes).await, AckOutcome::Acked);
        match inbound.recv().await {
            Some(NodeEvent::FrameReceived { from, frame: received, .. }) => {
                assert_eq!(from, MeshAddress::new(1));
                assert_eq!(received, frame());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(sender.stats().retransmissions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_write_is_retransmitted() {
        let (sender, far, _inbound) = start_pair();
        let bytes = WireFormat::new(NetworkKey::default()).encode(&frame()).unwrap();

        // The far side drops its first link ack, so the sender retries once.
        far.drop_next_writes(1);
        assert_eq!(sender.send_encoded(frame().key(), &bytes).await, AckOutcome::Acked);
        assert_eq!(sender.stats().retransmissions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_neighbor_surfaces_link_lost() {
        let (sender, far, _inbound) = start_pair();
        let bytes = WireFormat::new(NetworkKey::default()).encode(&frame()).unwrap();

        far.drop_next_writes(10);
        assert_eq!(sender.send_encoded(frame().key(), &bytes).await, AckOutcome::LinkLost);
        assert_eq!(sender.stats().retransmissions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_severed_link_reports_down() {
        let (_sender, far, mut inbound) = start_pair();
        far.sever();
        loop {
            match inbound.recv().await {
                Some(NodeEvent::LinkDown { peer, .. }) => {
                    assert_eq!(peer, MeshAddress::new(1));
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed before link down"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_is_counted_not_acked() {
        let wire = WireFormat::new(NetworkKey::default());
        let (near, far) = loopback_pair(MeshAddress::new(1), MeshAddress::new(2), Duration::ZERO);
        let receiver = LinkSession::new(far, config());
        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(receiver.clone().run_reader(wire, tx));

        near.write(&[0xA5, 0x11, 0x00]).await.unwrap();
        match rx.recv().await {
            Some(NodeEvent::Malformed { error, .. }) => {
                assert!(matches!(error, FrameError::TooShort { .. }))
            }
            _ => panic!("expected malformed event"),
        }
        assert_eq!(receiver.stats().malformed_received, 1);
    }
}
