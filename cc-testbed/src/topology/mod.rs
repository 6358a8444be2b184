//! Topology assembly
//!
//! Assemblers turn experiment parameters into a [`NetworkSpec`] plus the typed handles the rest of
//! the driver needs: flow endpoints, the devices whose queues are observed, the resources targeted
//! by link changes and (for cross-path experiments) the routes that get swapped at runtime.

pub mod cross_path;
pub mod dumbbell;

use crate::config::{ConfigError, TopologyParams};
use std::net::Ipv4Addr;
use std::time::Duration;
use testbed_network::network::ip::Ipv4Cidr;
use testbed_network::network::route::Route;
use testbed_network::network::spec::{LinkEndpointSpec, LinkSide, LinkSpec, NetworkSpec};
use testbed_network::network::{DeviceId, LinkId, NodeId};

const SUBNET_PREFIX: u8 = 24;

pub struct Topology {
    pub spec: NetworkSpec,
    /// One entry per flow, in flow order
    pub flows: Vec<FlowEndpoints>,
    pub observed_queues: Vec<ObservedQueue>,
    pub targets: MutationTargets,
    /// Devices worth capturing when packet captures are enabled
    pub bottlenecks: Vec<DeviceId>,
    pub reroute: Option<ReroutePlan>,
}

#[derive(Clone, Debug)]
pub struct FlowEndpoints {
    /// Identifies the flow in output file names (e.g. `2` or `1_2`)
    pub label: String,
    pub sender: NodeId,
    pub receiver: NodeId,
    pub sender_address: Ipv4Addr,
    pub receiver_address: Ipv4Addr,
    pub receiver_port: u16,
}

#[derive(Clone, Debug)]
pub struct ObservedQueue {
    pub device: DeviceId,
    /// Name of the queue length series file
    pub size_file: String,
    /// Name of the queue drops series file
    pub drops_file: String,
}

/// The resources modified by link changes
#[derive(Clone, Debug)]
pub struct MutationTargets {
    /// Both devices of the shared bottleneck link
    pub bottleneck: [DeviceId; 2],
    /// The per-flow access links whose delay follows delay changes
    pub access_links: Vec<LinkId>,
    /// The device whose receive error model follows loss changes
    pub error_model_device: DeviceId,
}

/// Two alternative route sets for a pair of routers
#[derive(Clone, Debug)]
pub struct ReroutePlan {
    pub routers: [NodeId; 2],
    /// Routes installed at startup and restored when rerouting back
    pub direct: [Vec<Route>; 2],
    /// Routes installed while traffic goes through the cross links
    pub rerouted: [Vec<Route>; 2],
    pub reroute_at: f64,
    pub reroute_back_at: f64,
}

impl Topology {
    /// Assembles the requested variant for `flow_count` flows
    pub fn build(params: &TopologyParams, flow_count: usize) -> anyhow::Result<Self> {
        match params {
            TopologyParams::Dumbbell(params) => dumbbell::build(params, flow_count),
            TopologyParams::CrossPath(params) => cross_path::build(params, flow_count),
        }
    }
}

/// Hands out consecutive /24 subnets below `a.b.0.0`
pub(crate) struct SubnetAllocator {
    prefix: [u8; 2],
    next: u16,
}

impl SubnetAllocator {
    pub(crate) fn new(a: u8, b: u8) -> Self {
        Self {
            prefix: [a, b],
            next: 0,
        }
    }

    pub(crate) fn next_subnet(&mut self) -> Result<Subnet, ConfigError> {
        let third = u8::try_from(self.next).map_err(|_| ConfigError::InvalidParameter {
            parameter: "number of flows",
            reason: format!(
                "the {}.{}.0.0/16 block ran out of /24 subnets",
                self.prefix[0], self.prefix[1]
            ),
        })?;
        self.next += 1;

        Ok(Subnet(Ipv4Addr::new(self.prefix[0], self.prefix[1], third, 0)))
    }
}

/// A /24 subnet joining the two devices of a point-to-point link
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Subnet(Ipv4Addr);

impl Subnet {
    pub(crate) fn fixed(a: u8, b: u8, c: u8) -> Self {
        Subnet(Ipv4Addr::new(a, b, c, 0))
    }

    /// The network itself, usable as a route destination
    pub(crate) fn network(&self) -> Ipv4Cidr {
        Ipv4Cidr {
            address: self.0,
            network_prefix: SUBNET_PREFIX,
        }
    }

    /// The address of the `n`-th host in the subnet (1-based)
    pub(crate) fn host(&self, n: u8) -> Ipv4Cidr {
        let [a, b, c, _] = self.0.octets();
        Ipv4Cidr {
            address: Ipv4Addr::new(a, b, c, n),
            network_prefix: SUBNET_PREFIX,
        }
    }
}

pub(crate) struct PointToPoint {
    pub data_rate_bps: u64,
    pub delay: Duration,
    pub queue_packets: usize,
}

impl PointToPoint {
    /// Adds a link between `a` and `b`, which get the first and second host address of `subnet`
    pub(crate) fn install(
        &self,
        spec: &mut NetworkSpec,
        name: String,
        a: NodeId,
        b: NodeId,
        subnet: Subnet,
    ) -> InstalledLink {
        let link = spec.add_link(LinkSpec {
            name,
            a: LinkEndpointSpec {
                node: a,
                address: subnet.host(1),
            },
            b: LinkEndpointSpec {
                node: b,
                address: subnet.host(2),
            },
            delay: self.delay,
            data_rate_bps: self.data_rate_bps,
            queue_packets: self.queue_packets,
        });

        InstalledLink {
            link,
            subnet,
            devices: [spec.device(link, LinkSide::A), spec.device(link, LinkSide::B)],
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct InstalledLink {
    pub link: LinkId,
    pub subnet: Subnet,
    pub devices: [DeviceId; 2],
}

impl InstalledLink {
    pub(crate) fn address(&self, side: LinkSide) -> Ipv4Addr {
        match side {
            LinkSide::A => self.subnet.host(1).address,
            LinkSide::B => self.subnet.host(2).address,
        }
    }
}

pub(crate) fn mbps(value: u64) -> u64 {
    value.saturating_mul(1_000_000)
}

/// Adds a route to the node's startup routing table
pub(crate) fn add_static_route(
    spec: &mut NetworkSpec,
    node: NodeId,
    destination: Subnet,
    gateway: Ipv4Addr,
    interface: usize,
) -> anyhow::Result<()> {
    let node_spec = spec
        .node_mut(node)
        .ok_or_else(|| anyhow::anyhow!("cannot add a route to unknown node {}", node.index()))?;
    node_spec.routes.push(Route {
        destination: destination.network(),
        gateway,
        interface,
    });

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use testbed_network::network::spec::NodeKind;

    #[test]
    fn test_subnets_are_allocated_sequentially() {
        let mut allocator = SubnetAllocator::new(10, 1);
        let first = allocator.next_subnet().unwrap();
        let second = allocator.next_subnet().unwrap();

        assert_eq!(first.network().to_string(), "10.1.0.0/24");
        assert_eq!(second.host(1).address, Ipv4Addr::new(10, 1, 1, 1));
        assert_eq!(second.host(2).address, Ipv4Addr::new(10, 1, 1, 2));
    }

    #[test]
    fn test_subnet_allocator_runs_out() {
        let mut allocator = SubnetAllocator::new(10, 2);
        for _ in 0..256 {
            allocator.next_subnet().unwrap();
        }

        assert!(allocator.next_subnet().is_err());
    }

    #[test]
    fn test_static_route_on_unknown_node_fails() {
        let mut other = NetworkSpec::new();
        let foreign = other.add_node("router-0", NodeKind::Router);

        let mut spec = NetworkSpec::new();
        let result = add_static_route(
            &mut spec,
            foreign,
            Subnet::fixed(10, 2, 0),
            Ipv4Addr::new(10, 3, 0, 2),
            0,
        );
        assert!(result.is_err());

        let router = spec.add_node("router-0", NodeKind::Router);
        add_static_route(
            &mut spec,
            router,
            Subnet::fixed(10, 2, 0),
            Ipv4Addr::new(10, 3, 0, 2),
            0,
        )
        .unwrap();
        assert_eq!(spec.nodes[0].routes.len(), 1);
        assert_eq!(spec.nodes[0].routes[0].destination.to_string(), "10.2.0.0/24");
    }
}
