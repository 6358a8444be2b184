use crate::network::route::RouteTable;
use crate::network::spec::NodeKind;
use crate::network::{DeviceId, NodeId};

pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) interfaces: Vec<DeviceId>,
    pub(crate) routes: RouteTable,
    pub(crate) unroutable: u64,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// The node's devices, indexed by interface number
    pub fn interfaces(&self) -> &[DeviceId] {
        &self.interfaces
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Packets dropped because no route matched their destination
    pub fn unroutable_packets(&self) -> u64 {
        self.unroutable
    }
}
