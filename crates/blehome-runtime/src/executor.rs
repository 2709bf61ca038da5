//! Device-side command execution

use blehome_core::{CommandPayload, DeviceState};

/// Applies commands addressed to this node.
///
/// Returning `Ok(state)` produces a successful ack carrying `state`;
/// `Err(reason)` produces a rejected ack.
pub trait CommandExecutor: Send + 'static {
    fn execute(&mut self, command: &CommandPayload) -> Result<Option<DeviceState>, String>;
}

/// In-memory dimmable light
#[derive(Debug, Clone, Default)]
pub struct LightExecutor {
    state: DeviceState,
}

impl LightExecutor {
    pub fn new(initial: DeviceState) -> Self {
        Self { state: initial }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }
}

impl CommandExecutor for LightExecutor {
    fn execute(&mut self, command: &CommandPayload) -> Result<Option<DeviceState>, String> {
        match command {
            CommandPayload::Control { on, brightness } => {
                self.state = DeviceState::new(*on, *brightness);
                Ok(Some(self.state))
            }
            CommandPayload::Query => Ok(Some(self.state)),
            CommandPayload::Heartbeat => Ok(None),
            CommandPayload::Raw { opcode, .. } => {
                Err(format!("unsupported opcode 0x{:04x}", opcode))
            }
        }
    }
}
