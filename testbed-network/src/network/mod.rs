//! Simulated point-to-point network
//!
//! Nodes are joined by full-duplex links. Each side of a link is a [`Device`] with its own data
//! rate and drop-tail transmit queue; packets are serialized one at a time and arrive at the peer
//! device after the link's propagation delay. Forwarding is fully static: a node first checks its
//! directly connected subnets and then its [`RouteTable`].

pub mod error_model;
pub mod ip;
pub mod link;
pub mod node;
pub mod packet;
pub mod route;
pub mod spec;

use crate::clock::Scheduler;
use crate::network::error_model::RateErrorModel;
use crate::network::link::{Device, DeviceStats, DropTailQueue, Link};
use crate::network::node::Node;
use crate::network::packet::Packet;
use crate::network::route::{Route, RouteId, RouteTable};
use crate::network::spec::{LinkSide, NetworkSpec};
use crate::pcap_exporter::PcapExporter;
use crate::tcp::{FlowId, TcpFlow};
use crate::trace::TraceHook;
use fastrand::Rng;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ErrorModelId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl LinkId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl DeviceId {
    pub(crate) fn new(link: LinkId, side: LinkSide) -> Self {
        match side {
            LinkSide::A => DeviceId(link.0 * 2),
            LinkSide::B => DeviceId(link.0 * 2 + 1),
        }
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

impl Display for LinkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

impl Display for ErrorModelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "error-model#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("{0} does not exist")]
    UnknownNode(NodeId),
    #[error("{0} does not exist")]
    UnknownLink(LinkId),
    #[error("{0} does not exist")]
    UnknownDevice(DeviceId),
    #[error("{0} does not exist")]
    UnknownErrorModel(ErrorModelId),
    #[error("{0} does not exist")]
    UnknownFlow(FlowId),
    #[error("route {route:?} does not exist on {node}")]
    UnknownRoute { node: NodeId, route: RouteId },
    #[error("{node} has no interface {interface}")]
    UnknownInterface { node: NodeId, interface: usize },
    #[error("invalid {attribute}: {reason}")]
    InvalidAttribute {
        attribute: &'static str,
        reason: String,
    },
}

pub struct Network {
    nodes: Vec<Node>,
    links: Vec<Link>,
    devices: Vec<Device>,
    error_models: Vec<RateErrorModel>,
    pub(crate) flows: Vec<TcpFlow>,
    rng: Rng,
}

impl Network {
    /// Builds the network described by `spec`
    ///
    /// Packet-level randomness (i.e. receive error models) is drawn from `rng`.
    pub fn initialize(spec: NetworkSpec, rng: Rng) -> Result<Self, NetworkError> {
        let mut nodes: Vec<_> = spec
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| Node {
                id: NodeId(i),
                name: n.name.clone(),
                kind: n.kind,
                interfaces: Vec::new(),
                routes: RouteTable::new(),
                unroutable: 0,
            })
            .collect();

        let mut links = Vec::with_capacity(spec.links.len());
        let mut devices = Vec::with_capacity(spec.links.len() * 2);
        for (i, l) in spec.links.iter().enumerate() {
            let link_id = LinkId(i);
            validate_data_rate(l.data_rate_bps)?;
            if l.queue_packets == 0 {
                return Err(NetworkError::InvalidAttribute {
                    attribute: "queue size",
                    reason: format!("{} has an empty queue", l.name),
                });
            }

            for (side, endpoint) in [(LinkSide::A, &l.a), (LinkSide::B, &l.b)] {
                let node = nodes
                    .get_mut(endpoint.node.0)
                    .ok_or(NetworkError::UnknownNode(endpoint.node))?;

                let id = DeviceId::new(link_id, side);
                let peer = DeviceId::new(
                    link_id,
                    match side {
                        LinkSide::A => LinkSide::B,
                        LinkSide::B => LinkSide::A,
                    },
                );

                devices.push(Device {
                    id,
                    node: node.id,
                    link: link_id,
                    peer,
                    interface: node.interfaces.len(),
                    address: endpoint.address,
                    data_rate_bps: l.data_rate_bps,
                    queue: DropTailQueue::new(l.queue_packets),
                    transmitting: false,
                    error_model: None,
                    capture: None,
                    stats: DeviceStats::default(),
                });
                node.interfaces.push(id);
            }

            links.push(Link {
                id: link_id,
                name: l.name.clone(),
                devices: [
                    DeviceId::new(link_id, LinkSide::A),
                    DeviceId::new(link_id, LinkSide::B),
                ],
                delay: l.delay,
            });
        }

        let mut network = Self {
            nodes,
            links,
            devices,
            error_models: Vec::new(),
            flows: Vec::new(),
            rng,
        };

        for (i, n) in spec.nodes.into_iter().enumerate() {
            for route in n.routes {
                network.add_route(NodeId(i), route)?;
            }
        }

        Ok(network)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, NetworkError> {
        self.nodes.get(id.0).ok_or(NetworkError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, NetworkError> {
        self.nodes.get_mut(id.0).ok_or(NetworkError::UnknownNode(id))
    }

    pub fn link(&self, id: LinkId) -> Result<&Link, NetworkError> {
        self.links.get(id.0).ok_or(NetworkError::UnknownLink(id))
    }

    pub fn device(&self, id: DeviceId) -> Result<&Device, NetworkError> {
        self.devices.get(id.0).ok_or(NetworkError::UnknownDevice(id))
    }

    fn device_mut(&mut self, id: DeviceId) -> Result<&mut Device, NetworkError> {
        self.devices
            .get_mut(id.0)
            .ok_or(NetworkError::UnknownDevice(id))
    }

    pub fn device_stats(&self, id: DeviceId) -> Result<DeviceStats, NetworkError> {
        Ok(self.device(id)?.stats)
    }

    /// The device of `node` whose subnet contains `address`, if any
    pub fn device_facing(
        &self,
        node: NodeId,
        address: Ipv4Addr,
    ) -> Result<Option<DeviceId>, NetworkError> {
        let node = self.node(node)?;
        Ok(node
            .interfaces
            .iter()
            .copied()
            .find(|&d| self.devices[d.0].address.contains(address)))
    }

    pub fn set_data_rate(
        &mut self,
        device: DeviceId,
        data_rate_bps: u64,
    ) -> Result<(), NetworkError> {
        validate_data_rate(data_rate_bps)?;
        self.device_mut(device)?.data_rate_bps = data_rate_bps;
        Ok(())
    }

    /// Changes the propagation delay of a link (packets already in flight keep their old delay)
    pub fn set_link_delay(&mut self, link: LinkId, delay: Duration) -> Result<(), NetworkError> {
        self.links
            .get_mut(link.0)
            .ok_or(NetworkError::UnknownLink(link))?
            .delay = delay;
        Ok(())
    }

    /// Attaches a receive error model with the given packet error rate to `device`
    pub fn add_error_model(
        &mut self,
        device: DeviceId,
        rate: f64,
    ) -> Result<ErrorModelId, NetworkError> {
        validate_error_rate(rate)?;
        let id = ErrorModelId(self.error_models.len());
        self.device_mut(device)?.error_model = Some(id);
        self.error_models.push(RateErrorModel::new(rate));
        Ok(id)
    }

    pub fn error_model(&self, id: ErrorModelId) -> Result<&RateErrorModel, NetworkError> {
        self.error_models
            .get(id.0)
            .ok_or(NetworkError::UnknownErrorModel(id))
    }

    pub fn set_error_rate(&mut self, id: ErrorModelId, rate: f64) -> Result<(), NetworkError> {
        validate_error_rate(rate)?;
        self.error_models
            .get_mut(id.0)
            .ok_or(NetworkError::UnknownErrorModel(id))?
            .set_rate(rate);
        Ok(())
    }

    pub fn add_route(&mut self, node: NodeId, route: Route) -> Result<RouteId, NetworkError> {
        let node = self.node_mut(node)?;
        if route.interface >= node.interfaces.len() {
            return Err(NetworkError::UnknownInterface {
                node: node.id,
                interface: route.interface,
            });
        }

        Ok(node.routes.add(route))
    }

    pub fn remove_route(&mut self, node: NodeId, route: RouteId) -> Result<Route, NetworkError> {
        self.node_mut(node)?
            .routes
            .remove(route)
            .ok_or(NetworkError::UnknownRoute { node, route })
    }

    pub fn routes(&self, node: NodeId) -> Result<&RouteTable, NetworkError> {
        Ok(&self.node(node)?.routes)
    }

    /// Reports every change in the length of the device's transmit queue
    pub fn connect_queue_trace(
        &mut self,
        device: DeviceId,
        hook: TraceHook<u32>,
    ) -> Result<(), NetworkError> {
        self.device_mut(device)?.queue.len.connect(hook);
        Ok(())
    }

    /// Records every packet the device puts on the wire
    pub fn capture_device(
        &mut self,
        device: DeviceId,
        exporter: PcapExporter,
    ) -> Result<(), NetworkError> {
        self.device_mut(device)?.capture = Some(exporter);
        Ok(())
    }

    pub fn flush_captures(&mut self) -> anyhow::Result<()> {
        for device in &mut self.devices {
            if let Some(capture) = &mut device.capture {
                capture.flush()?;
            }
        }

        Ok(())
    }

    /// Forwards a packet originating at (or passing through) `node`
    pub(crate) fn send_from_node(
        &mut self,
        scheduler: &mut Scheduler<Network>,
        node: NodeId,
        packet: Packet,
    ) -> anyhow::Result<()> {
        let Some(device) = self.outgoing_device(node, packet.destination)? else {
            let node = self.node_mut(node)?;
            node.unroutable += 1;
            tracing::debug!(
                node = %node.name,
                destination = %packet.destination,
                "dropping unroutable packet"
            );
            return Ok(());
        };

        self.enqueue(scheduler, device, packet)
    }

    fn outgoing_device(
        &self,
        node: NodeId,
        destination: Ipv4Addr,
    ) -> Result<Option<DeviceId>, NetworkError> {
        if let Some(device) = self.device_facing(node, destination)? {
            return Ok(Some(device));
        }

        let node = self.node(node)?;
        Ok(node
            .routes
            .lookup(destination)
            .and_then(|r| node.interfaces.get(r.interface).copied()))
    }

    fn enqueue(
        &mut self,
        scheduler: &mut Scheduler<Network>,
        device_id: DeviceId,
        packet: Packet,
    ) -> anyhow::Result<()> {
        let now = scheduler.now();
        let device = self
            .devices
            .get_mut(device_id.0)
            .ok_or(NetworkError::UnknownDevice(device_id))?;

        if let Some(dropped) = device.queue.enqueue(now, packet)? {
            device.stats.queue_drops += 1;
            if !device.queue.reported_overflow {
                device.queue.reported_overflow = true;
                tracing::warn!(
                    "{:.2}s {} interface {} queue full, dropping packets (first dropped: {:?})",
                    now.as_secs_f64(),
                    self.nodes[device.node.0].name,
                    device.interface,
                    dropped.segment,
                );
            }
            return Ok(());
        }

        if !device.transmitting {
            self.start_transmission(scheduler, device_id)?;
        }

        Ok(())
    }

    fn start_transmission(
        &mut self,
        scheduler: &mut Scheduler<Network>,
        device_id: DeviceId,
    ) -> anyhow::Result<()> {
        let now = scheduler.now();
        let device = self.device_mut(device_id)?;
        let Some(packet) = device.queue.dequeue(now)? else {
            return Ok(());
        };

        device.transmitting = true;
        device.stats.tx_packets += 1;
        device.stats.tx_bytes += packet.wire_size() as u64;
        if let Some(capture) = &mut device.capture {
            capture.track_packet(now, &packet)?;
        }

        let tx_time = device.serialization_time(packet.wire_size());
        let (peer, link) = (device.peer, device.link);
        let delay = self.links[link.0].delay;

        scheduler.schedule_in(tx_time, move |network: &mut Network, scheduler| {
            network.transmit_complete(scheduler, device_id)
        });
        scheduler.schedule_in(tx_time + delay, move |network: &mut Network, scheduler| {
            network.receive(scheduler, peer, packet)
        });

        Ok(())
    }

    fn transmit_complete(
        &mut self,
        scheduler: &mut Scheduler<Network>,
        device_id: DeviceId,
    ) -> anyhow::Result<()> {
        self.device_mut(device_id)?.transmitting = false;
        self.start_transmission(scheduler, device_id)
    }

    fn receive(
        &mut self,
        scheduler: &mut Scheduler<Network>,
        device_id: DeviceId,
        packet: Packet,
    ) -> anyhow::Result<()> {
        if let Some(error_model) = self.device(device_id)?.error_model {
            if self.error_models[error_model.0].is_corrupt(&mut self.rng) {
                self.device_mut(device_id)?.stats.rx_errors += 1;
                return Ok(());
            }
        }

        let device = self.device_mut(device_id)?;
        device.stats.rx_packets += 1;
        let node = device.node;

        let is_local = self.nodes[node.0]
            .interfaces
            .iter()
            .any(|d| self.devices[d.0].address.address == packet.destination);
        if is_local {
            self.deliver_local(scheduler, node, packet)
        } else {
            self.send_from_node(scheduler, node, packet)
        }
    }
}

fn validate_data_rate(data_rate_bps: u64) -> Result<(), NetworkError> {
    if data_rate_bps == 0 {
        return Err(NetworkError::InvalidAttribute {
            attribute: "data rate",
            reason: "must be greater than zero".to_string(),
        });
    }

    Ok(())
}

fn validate_error_rate(rate: f64) -> Result<(), NetworkError> {
    if !(0.0..=1.0).contains(&rate) {
        return Err(NetworkError::InvalidAttribute {
            attribute: "error rate",
            reason: format!("{rate} is not a probability"),
        });
    }

    Ok(())
}
