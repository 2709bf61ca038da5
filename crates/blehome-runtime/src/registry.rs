//! Devices the node has learned about from beacons, acks and state reports

use blehome_core::{DeviceState, DiscoveryBeacon, MeshAddress, NodeRole, Timestamp};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub address: MeshAddress,
    pub role: Option<NodeRole>,
    pub name: Option<String>,
    pub state: Option<DeviceState>,
    pub last_seen: Timestamp,
}

/// What an observation changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryUpdate {
    /// First time this address was seen
    pub discovered: bool,
    /// The reported state differs from the previous one
    pub state_changed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<MeshAddress, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn observe_beacon(
        &mut self,
        address: MeshAddress,
        beacon: &DiscoveryBeacon,
        now: Timestamp,
    ) -> RegistryUpdate {
        let (record, discovered) = self.record_mut(address, now);
        record.role = Some(beacon.role);
        if !beacon.name.is_empty() {
            record.name = Some(beacon.name.clone());
        }
        RegistryUpdate {
            discovered,
            state_changed: false,
        }
    }

    pub fn update_state(
        &mut self,
        address: MeshAddress,
        state: DeviceState,
        now: Timestamp,
    ) -> RegistryUpdate {
        let (record, discovered) = self.record_mut(address, now);
        let state_changed = record.state != Some(state);
        record.state = Some(state);
        RegistryUpdate {
            discovered,
            state_changed,
        }
    }

    pub fn mark_seen(&mut self, address: MeshAddress, now: Timestamp) -> RegistryUpdate {
        let (_, discovered) = self.record_mut(address, now);
        RegistryUpdate {
            discovered,
            state_changed: false,
        }
    }

    pub fn get(&self, address: &MeshAddress) -> Option<&DeviceRecord> {
        self.devices.get(address)
    }

    pub fn contains(&self, address: &MeshAddress) -> bool {
        self.devices.contains_key(address)
    }

    pub fn records(&self) -> Vec<DeviceRecord> {
        self.devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn record_mut(&mut self, address: MeshAddress, now: Timestamp) -> (&mut DeviceRecord, bool) {
        let discovered = !self.devices.contains_key(&address);
        let record = self.devices.entry(address).or_insert_with(|| DeviceRecord {
            address,
            role: None,
            name: None,
            state: None,
            last_seen: now,
        });
        record.last_seen = now;
        (record, discovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_changes_are_detected() {
        let mut registry = DeviceRegistry::default();
        let address = MeshAddress::new(3);
        let first = registry.update_state(address, DeviceState::new(true, 10), Timestamp::new(0));
        assert!(first.discovered && first.state_changed);

        let same = registry.update_state(address, DeviceState::new(true, 10), Timestamp::new(5));
        assert!(!same.discovered && !same.state_changed);

        let changed = registry.update_state(address, DeviceState::new(false, 10), Timestamp::new(9));
        assert!(changed.state_changed);
        assert_eq!(registry.get(&address).unwrap().last_seen, Timestamp::new(9));
    }

    #[test]
    fn test_beacons_fill_in_role_and_name() {
        let mut registry = DeviceRegistry::default();
        let beacon = DiscoveryBeacon {
            role: NodeRole::Device,
            capabilities: 0,
            name: "hall".to_string(),
        };
        let update = registry.observe_beacon(MeshAddress::new(4), &beacon, Timestamp::new(0));
        assert!(update.discovered);
        let record = registry.get(&MeshAddress::new(4)).unwrap();
        assert_eq!(record.role, Some(NodeRole::Device));
        assert_eq!(record.name.as_deref(), Some("hall"));
        assert!(!registry.mark_seen(MeshAddress::new(4), Timestamp::new(1)).discovered);
    }
}
