//! In-memory mesh simulation
//!
//! Spawns real node tasks and connects them with loopback links, so whole
//! topologies can be exercised without a radio. Used by the integration
//! tests and the CLI `simulate` command.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use blehome_core::{BlehomeError, MeshAddress, MeshConfig, NodeRole, Result};
use tracing::debug;

use crate::builder::NodeBuilder;
use crate::handle::MeshHandle;
use crate::loopback::{loopback_pair, LoopbackLink};

pub struct MeshSimulation {
    template: MeshConfig,
    latency: Duration,
    nodes: BTreeMap<MeshAddress, MeshHandle>,
    links: BTreeMap<(MeshAddress, MeshAddress), Arc<LoopbackLink>>,
}

impl MeshSimulation {
    /// Every node is configured from `template` with its own address and role
    pub fn new(template: MeshConfig) -> Self {
        Self {
            template,
            latency: Duration::from_millis(5),
            nodes: BTreeMap::new(),
            links: BTreeMap::new(),
        }
    }

    /// One-way delay of every simulated link
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn add_gateway(&mut self, address: u16) -> Result<MeshHandle> {
        self.add_node(address, NodeRole::Gateway)
    }

    pub fn add_device(&mut self, address: u16) -> Result<MeshHandle> {
        self.add_node(address, NodeRole::Device)
    }

    pub fn add_node(&mut self, address: u16, role: NodeRole) -> Result<MeshHandle> {
        let address = MeshAddress::new(address);
        if self.nodes.contains_key(&address) {
            return Err(BlehomeError::config_error(
                "address",
                format!("{} is already in the simulation", address),
            ));
        }
        let mut config = self.template.clone().with_role(role);
        config.address = address;
        config.discovery.name = format!("{} {:04x}", config.discovery.name, address.value());

        let handle = NodeBuilder::new(config).spawn()?;
        self.nodes.insert(address, handle.clone());
        Ok(handle)
    }

    /// Open a link between two nodes already in the simulation
    pub async fn connect(&mut self, a: u16, b: u16) -> Result<()> {
        let (a, b) = (MeshAddress::new(a), MeshAddress::new(b));
        let (a_handle, b_handle) = (self.require(a)?.clone(), self.require(b)?.clone());

        let (a_end, b_end) = loopback_pair(a, b, self.latency);
        a_handle.attach_link(a_end.clone()).await?;
        b_handle.attach_link(b_end).await?;
        self.links.insert(ordered(a, b), a_end);
        debug!(%a, %b, "simulated link up");
        Ok(())
    }

    /// Cut the link between two nodes; `false` if there was none
    pub fn sever(&mut self, a: u16, b: u16) -> bool {
        match self.links.remove(&ordered(MeshAddress::new(a), MeshAddress::new(b))) {
            Some(link) => {
                link.sever();
                true
            }
            None => false,
        }
    }

    pub fn node(&self, address: u16) -> Option<&MeshHandle> {
        self.nodes.get(&MeshAddress::new(address))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &MeshHandle> {
        self.nodes.values()
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        for link in self.links.values() {
            link.sever();
        }
        self.links.clear();
        for handle in self.nodes.values() {
            handle.shutdown().await?;
        }
        self.nodes.clear();
        Ok(())
    }

    fn require(&self, address: MeshAddress) -> Result<&MeshHandle> {
        self.nodes.get(&address).ok_or_else(|| {
            BlehomeError::config_error("address", format!("{} is not in the simulation", address))
        })
    }
}

fn ordered(a: MeshAddress, b: MeshAddress) -> (MeshAddress, MeshAddress) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
