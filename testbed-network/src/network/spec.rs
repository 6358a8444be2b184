use crate::network::ip::Ipv4Cidr;
use crate::network::route::Route;
use crate::network::{DeviceId, LinkId, NodeId};
use std::time::Duration;

/// Declarative description of a network, turned into a live
/// [`Network`](crate::network::Network) by
/// [`Network::initialize`](crate::network::Network::initialize)
///
/// Ids are handed out in insertion order, and a node's interfaces are numbered in the order its
/// links were added.
#[derive(Clone, Default)]
pub struct NetworkSpec {
    pub nodes: Vec<NodeSpec>,
    pub links: Vec<LinkSpec>,
}

#[derive(Clone)]
pub struct NodeSpec {
    pub name: String,
    pub kind: NodeKind,
    pub routes: Vec<Route>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Host,
    Router,
}

#[derive(Clone)]
pub struct LinkSpec {
    pub name: String,
    pub a: LinkEndpointSpec,
    pub b: LinkEndpointSpec,
    pub delay: Duration,
    pub data_rate_bps: u64,
    /// Capacity of each device's drop-tail queue, in packets
    pub queue_packets: usize,
}

#[derive(Clone)]
pub struct LinkEndpointSpec {
    pub node: NodeId,
    pub address: Ipv4Cidr,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkSide {
    A,
    B,
}

impl NetworkSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: impl Into<String>, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(NodeSpec {
            name: name.into(),
            kind,
            routes: Vec::new(),
        });
        id
    }

    pub fn add_link(&mut self, link: LinkSpec) -> LinkId {
        let id = LinkId(self.links.len());
        self.links.push(link);
        id
    }

    pub fn node_mut(&mut self, node: NodeId) -> Option<&mut NodeSpec> {
        self.nodes.get_mut(node.0)
    }

    pub fn link(&self, link: LinkId) -> Option<&LinkSpec> {
        self.links.get(link.0)
    }

    /// The device sitting at one side of a link
    pub fn device(&self, link: LinkId, side: LinkSide) -> DeviceId {
        DeviceId::new(link, side)
    }

    /// The interface index under which `link` will show up on `node`
    pub fn interface_of(&self, node: NodeId, link: LinkId) -> Option<usize> {
        self.links
            .iter()
            .enumerate()
            .flat_map(|(i, l)| {
                let a = (l.a.node == node).then_some(i);
                let b = (l.b.node == node).then_some(i);
                a.into_iter().chain(b)
            })
            .position(|i| i == link.0)
    }
}
