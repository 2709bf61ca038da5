//! Gateway connection state and reconnect bookkeeping

use std::time::Duration;

use crate::protocol::{connect_timeout, reconnect_delay};

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Connection state of the gateway link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Tracks connection attempts to one gateway device
#[derive(Debug, Clone)]
pub struct GatewayPeer {
    pub state: ConnectionState,
    /// Failed attempts since the last successful connection
    pub attempt: u32,
    base_timeout: Duration,
    max_attempts: u32,
}

impl GatewayPeer {
    /// `max_attempts == 0` means keep trying forever
    pub fn new(base_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            base_timeout,
            max_attempts,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn can_retry(&self) -> bool {
        self.max_attempts == 0 || self.attempt < self.max_attempts
    }

    /// Timeout to use for the attempt about to start
    pub fn start_connection_attempt(&mut self) -> Duration {
        self.state = ConnectionState::Connecting;
        connect_timeout(self.base_timeout, self.attempt)
    }

    pub fn mark_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.attempt = 0;
    }

    /// Record a failed attempt; returns how long to wait before the next one
    pub fn mark_failed(&mut self) -> Duration {
        self.state = ConnectionState::Failed;
        let delay = reconnect_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_transitions() {
        let mut peer = GatewayPeer::new(Duration::from_secs(15), 0);
        assert_eq!(peer.start_connection_attempt(), Duration::from_secs(15));
        assert_eq!(peer.state, ConnectionState::Connecting);

        assert_eq!(peer.mark_failed(), Duration::from_secs(1));
        assert_eq!(peer.start_connection_attempt(), Duration::from_secs(20));
        assert_eq!(peer.mark_failed(), Duration::from_secs(2));

        peer.mark_connected();
        assert!(peer.is_connected());
        assert_eq!(peer.attempt, 0);
        assert_eq!(peer.start_connection_attempt(), Duration::from_secs(15));
    }

    #[test]
    fn test_retry_limit() {
        let mut peer = GatewayPeer::new(Duration::from_secs(5), 2);
        assert!(peer.can_retry());
        peer.mark_failed();
        assert!(peer.can_retry());
        peer.mark_failed();
        assert!(!peer.can_retry());

        let unlimited = GatewayPeer::new(Duration::from_secs(5), 0);
        assert!(unlimited.can_retry());
    }
}
