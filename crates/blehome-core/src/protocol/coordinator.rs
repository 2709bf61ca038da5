//! End-to-end command tracking
//!
//! The gateway registers every command frame it originates with a
//! `CommandCoordinator`. The coordinator matches incoming acks by frame id,
//! asks for retransmissions (same frame id) when an attempt times out, and
//! reports a terminal failure once the retry budget is spent. A command
//! resolves exactly once: the first valid ack wins, later acks and acks for
//! forgotten commands are reported but change nothing.
//!
//! `AckLedger` is the device-side counterpart: it remembers which commands
//! were already executed so a retransmitted copy is re-acknowledged without
//! being executed a second time. Relays drop the retransmission as a
//! duplicate, so this only helps when the device is a direct neighbor.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::config::CommandConfig;
use crate::errors::BlehomeError;
use crate::protocol::frame::Frame;
use crate::protocol::payload::{AckPayload, AckStatus, DeviceState};
use crate::types::{FrameId, FrameKey, MeshAddress, Timestamp};

/// How many resolved commands are remembered to classify late acks
const RESOLVED_HISTORY: usize = 64;

// ----------------------------------------------------------------------------
// Outstanding Commands
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OutstandingCommand {
    pub frame: Frame,
    pub destination: MeshAddress,
    pub first_sent_at: Timestamp,
    pub sent_at: Timestamp,
    pub retry_count: u32,
    pub received_ack_set: Vec<MeshAddress>,
}

impl OutstandingCommand {
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }
}

/// Proof that a command reached its destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandReceipt {
    pub frame_id: FrameId,
    pub destination: MeshAddress,
    /// Node whose ack resolved the command
    pub acked_by: MeshAddress,
    pub status: AckStatus,
    pub state: Option<DeviceState>,
    pub attempts: u32,
    pub round_trip: Duration,
}

/// Terminal result of a command, as announced to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CommandOutcome {
    Succeeded(CommandReceipt),
    TimedOut { attempts: u32 },
    Cancelled,
}

/// How an incoming ack was classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckResolution {
    /// First ack for an outstanding command
    Succeeded(CommandReceipt),
    /// Ack for a command that already resolved
    Duplicate,
    /// Ack for a command this coordinator never issued or has forgotten
    Unknown,
}

/// Timer-driven work the node must carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorAction {
    /// Send this frame again; it keeps its original frame id
    Retransmit(Frame),
    /// Retry budget exhausted
    Failed {
        frame_id: FrameId,
        destination: MeshAddress,
        attempts: u32,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub registered: u64,
    pub succeeded: u64,
    pub retransmitted: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub duplicate_acks: u64,
    pub unknown_acks: u64,
}

#[derive(Debug, Clone)]
struct ResolvedCommand {
    frame_id: FrameId,
    ack_sources: Vec<MeshAddress>,
}

// ----------------------------------------------------------------------------
// Command Coordinator
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CommandCoordinator {
    outstanding: BTreeMap<FrameId, OutstandingCommand>,
    resolved: VecDeque<ResolvedCommand>,
    attempt_timeout: Duration,
    max_attempts: u32,
    stats: CoordinatorStats,
}

impl CommandCoordinator {
    pub fn new(config: &CommandConfig) -> Self {
        Self {
            outstanding: BTreeMap::new(),
            resolved: VecDeque::with_capacity(RESOLVED_HISTORY),
            attempt_timeout: config.attempt_timeout,
            max_attempts: config.max_attempts.max(1),
            stats: CoordinatorStats::default(),
        }
    }

    /// Start tracking `frame`, which is being sent for the first time
    pub fn register(&mut self, frame: Frame, now: Timestamp) -> Result<(), BlehomeError> {
        if self.outstanding.contains_key(&frame.frame_id) {
            return Err(BlehomeError::DuplicateCommand {
                frame_id: frame.frame_id,
            });
        }
        let frame_id = frame.frame_id;
        let destination = frame.destination;
        self.outstanding.insert(
            frame_id,
            OutstandingCommand {
                frame,
                destination,
                first_sent_at: now,
                sent_at: now,
                retry_count: 0,
                received_ack_set: Vec::new(),
            },
        );
        self.stats.registered += 1;
        tracing::debug!(%frame_id, %destination, "command registered");
        Ok(())
    }

    /// Match an ack for `frame_id` sent by `from`
    pub fn on_ack(
        &mut self,
        ack: &AckPayload,
        from: MeshAddress,
        now: Timestamp,
    ) -> AckResolution {
        if let Some(mut command) = self.outstanding.remove(&ack.acked) {
            command.received_ack_set.push(from);
            let receipt = CommandReceipt {
                frame_id: ack.acked,
                destination: command.destination,
                acked_by: from,
                status: ack.status,
                state: ack.state,
                attempts: command.attempts(),
                round_trip: now.duration_since(command.first_sent_at),
            };
            self.remember(ResolvedCommand {
                frame_id: ack.acked,
                ack_sources: command.received_ack_set,
            });
            self.stats.succeeded += 1;
            tracing::debug!(frame_id = %ack.acked, %from, "command acknowledged");
            return AckResolution::Succeeded(receipt);
        }

        if let Some(resolved) = self
            .resolved
            .iter_mut()
            .find(|resolved| resolved.frame_id == ack.acked)
        {
            if !resolved.ack_sources.contains(&from) {
                resolved.ack_sources.push(from);
            }
            self.stats.duplicate_acks += 1;
            return AckResolution::Duplicate;
        }

        self.stats.unknown_acks += 1;
        AckResolution::Unknown
    }

    /// Collect retransmissions and terminal failures due at `now`
    pub fn poll(&mut self, now: Timestamp) -> Vec<CoordinatorAction> {
        let mut actions = Vec::new();
        let mut failed = Vec::new();

        for (frame_id, command) in self.outstanding.iter_mut() {
            if now.duration_since(command.sent_at) < self.attempt_timeout {
                continue;
            }
            if command.attempts() < self.max_attempts {
                command.retry_count += 1;
                command.sent_at = now;
                self.stats.retransmitted += 1;
                tracing::debug!(
                    %frame_id,
                    attempt = command.attempts(),
                    "retransmitting command"
                );
                actions.push(CoordinatorAction::Retransmit(command.frame.clone()));
            } else {
                failed.push(*frame_id);
            }
        }

        for frame_id in failed {
            if let Some(command) = self.outstanding.remove(&frame_id) {
                self.stats.timed_out += 1;
                tracing::warn!(
                    %frame_id,
                    destination = %command.destination,
                    attempts = command.attempts(),
                    "command timed out"
                );
                self.remember(ResolvedCommand {
                    frame_id,
                    ack_sources: Vec::new(),
                });
                actions.push(CoordinatorAction::Failed {
                    frame_id,
                    destination: command.destination,
                    attempts: command.attempts(),
                });
            }
        }
        actions
    }

    /// Stop tracking a command; `false` if it was not outstanding
    pub fn cancel(&mut self, frame_id: FrameId) -> bool {
        match self.outstanding.remove(&frame_id) {
            Some(_) => {
                self.stats.cancelled += 1;
                self.remember(ResolvedCommand {
                    frame_id,
                    ack_sources: Vec::new(),
                });
                true
            }
            None => false,
        }
    }

    pub fn outstanding(&self, frame_id: FrameId) -> Option<&OutstandingCommand> {
        self.outstanding.get(&frame_id)
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats
    }

    fn remember(&mut self, resolved: ResolvedCommand) {
        if self.resolved.len() >= RESOLVED_HISTORY {
            self.resolved.pop_front();
        }
        self.resolved.push_back(resolved);
    }
}

// ----------------------------------------------------------------------------
// Ack Ledger
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct LedgerEntry {
    key: FrameKey,
    ack: AckPayload,
    acked_at: Timestamp,
}

/// Device-side record of executed commands and the acks sent for them
#[derive(Debug, Clone)]
pub struct AckLedger {
    entries: VecDeque<LedgerEntry>,
    capacity: usize,
    holdoff: Duration,
}

impl AckLedger {
    pub fn new(capacity: usize, holdoff: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            holdoff,
        }
    }

    /// Remember the ack produced by executing the command `key`
    pub fn record(&mut self, key: FrameKey, ack: AckPayload, now: Timestamp) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LedgerEntry {
            key,
            ack,
            acked_at: now,
        });
    }

    /// Ack to repeat for a retransmitted command, if the holdoff has passed
    pub fn reack(&mut self, key: FrameKey, now: Timestamp) -> Option<AckPayload> {
        let holdoff = self.holdoff;
        let entry = self.entries.iter_mut().find(|entry| entry.key == key)?;
        if now.duration_since(entry.acked_at) < holdoff {
            return None;
        }
        entry.acked_at = now;
        Some(entry.ack)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
