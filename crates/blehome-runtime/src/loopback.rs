//! In-memory links
//!
//! A `loopback_pair` behaves like a GATT connection between two nodes:
//! buffers arrive whole and in order after a fixed latency. Tests and the
//! simulator use the fault hooks to lose writes or cut the connection.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blehome_core::{GattLink, LinkError, MeshAddress};
use tokio::sync::{mpsc, Mutex};

type Inbox = mpsc::UnboundedSender<Option<Vec<u8>>>;

/// One end of an in-memory link
pub struct LoopbackLink {
    local: MeshAddress,
    peer: MeshAddress,
    outbound: Inbox,
    own_inbox: Inbox,
    inbound: Mutex<mpsc::UnboundedReceiver<Option<Vec<u8>>>>,
    connected: Arc<AtomicBool>,
    latency: Duration,
    drop_budget: AtomicU32,
    rssi: Option<i16>,
}

/// Connect `a` and `b`; returns the end owned by `a` first
pub fn loopback_pair(
    a: MeshAddress,
    b: MeshAddress,
    latency: Duration,
) -> (Arc<LoopbackLink>, Arc<LoopbackLink>) {
    let (to_a, a_inbox) = mpsc::unbounded_channel();
    let (to_b, b_inbox) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(true));

    let a_end = LoopbackLink {
        local: a,
        peer: b,
        outbound: to_b.clone(),
        own_inbox: to_a.clone(),
        inbound: Mutex::new(a_inbox),
        connected: connected.clone(),
        latency,
        drop_budget: AtomicU32::new(0),
        rssi: None,
    };
    let b_end = LoopbackLink {
        local: b,
        peer: a,
        outbound: to_a,
        own_inbox: to_b,
        inbound: Mutex::new(b_inbox),
        connected,
        latency,
        drop_budget: AtomicU32::new(0),
        rssi: None,
    };
    (Arc::new(a_end), Arc::new(b_end))
}

impl LoopbackLink {
    pub fn local(&self) -> MeshAddress {
        self.local
    }

    /// Silently lose the next `count` writes made from this end
    pub fn drop_next_writes(&self, count: u32) {
        self.drop_budget.fetch_add(count, Ordering::SeqCst);
    }

    /// Cut the connection for both ends
    pub fn sever(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.outbound.send(None);
            let _ = self.own_inbox.send(None);
        }
    }

    fn take_drop(&self) -> bool {
        self.drop_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl GattLink for LoopbackLink {
    fn peer(&self) -> MeshAddress {
        self.peer
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected { peer: self.peer });
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.take_drop() {
            return Ok(());
        }
        self.outbound
            .send(Some(bytes.to_vec()))
            .map_err(|_| LinkError::Lost { peer: self.peer })
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(Some(bytes)) => Some(bytes),
            _ => None,
        }
    }

    fn rssi(&self) -> Option<i16> {
        self.rssi
    }
}

impl std::fmt::Debug for LoopbackLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackLink")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_buffers_arrive_whole_and_in_order() {
        let (a, b) = loopback_pair(MeshAddress::new(1), MeshAddress::new(2), Duration::from_millis(3));
        a.write(&[1, 2, 3]).await.unwrap();
        a.write(&[4]).await.unwrap();
        assert_eq!(b.recv().await, Some(vec![1, 2, 3]));
        assert_eq!(b.recv().await, Some(vec![4]));
        assert_eq!(b.peer(), MeshAddress::new(1));
    }

    #[tokio::test]
    async fn test_dropped_writes_never_arrive() {
        let (a, b) = loopback_pair(MeshAddress::new(1), MeshAddress::new(2), Duration::ZERO);
        a.drop_next_writes(1);
        a.write(&[9]).await.unwrap();
        a.write(&[10]).await.unwrap();
        assert_eq!(b.recv().await, Some(vec![10]));
    }

    #[tokio::test]
    async fn test_sever_closes_both_ends() {
        let (a, b) = loopback_pair(MeshAddress::new(1), MeshAddress::new(2), Duration::ZERO);
        b.sever();
        assert!(!a.is_connected());
        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await, None);
        assert!(a.write(&[1]).await.is_err());
    }
}
