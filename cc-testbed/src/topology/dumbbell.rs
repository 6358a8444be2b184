//! One bottleneck shared by every flow
//!
//! ```text
//! sender-1 --+                        +-- receiver-1
//! sender-2 --+-- router-0 ==== router-1 --+-- receiver-2
//! ...                                     ...
//! ```
//!
//! The bottleneck is the first link (10.3.0.0/24), so it is interface 0 on both routers. Flow `i`
//! uses the subnets 10.1.i.0/24 (sender side) and 10.2.i.0/24 (receiver side).

use crate::config::{ConfigError, DumbbellParams};
use crate::topology::{
    FlowEndpoints, MutationTargets, ObservedQueue, PointToPoint, SubnetAllocator, Subnet, Topology,
    add_static_route, mbps,
};
use std::time::Duration;
use testbed_network::network::spec::{LinkSide, NetworkSpec, NodeKind};

const ACCESS_RATE_BPS: u64 = 10_000_000_000;
const SINK_PORT: u16 = 50001;

pub fn build(params: &DumbbellParams, flow_count: usize) -> anyhow::Result<Topology> {
    if flow_count == 0 {
        return Err(ConfigError::FlowCountMismatch {
            topology: "dumbbell",
            expected: "at least one flow".to_string(),
            actual: flow_count,
        }
        .into());
    }

    let mut spec = NetworkSpec::new();
    let senders: Vec<_> = (1..=flow_count)
        .map(|i| spec.add_node(format!("sender-{i}"), NodeKind::Host))
        .collect();
    let receivers: Vec<_> = (1..=flow_count)
        .map(|i| spec.add_node(format!("receiver-{i}"), NodeKind::Host))
        .collect();
    let left_router = spec.add_node("router-0", NodeKind::Router);
    let right_router = spec.add_node("router-1", NodeKind::Router);

    let bottleneck = PointToPoint {
        data_rate_bps: mbps(params.bandwidth_mbps),
        delay: Duration::ZERO,
        queue_packets: params.queue_packets,
    }
    .install(
        &mut spec,
        "bottleneck".to_string(),
        left_router,
        right_router,
        Subnet::fixed(10, 3, 0),
    );

    let mut sender_subnets = SubnetAllocator::new(10, 1);
    let mut receiver_subnets = SubnetAllocator::new(10, 2);
    let mut flows = Vec::with_capacity(flow_count);
    let mut access_links = Vec::with_capacity(flow_count);
    for (i, (&sender, &receiver)) in senders.iter().zip(&receivers).enumerate() {
        let delay = if i > 0 && !params.delay2.is_zero() {
            params.delay2
        } else {
            params.delay
        };

        let sender_link = PointToPoint {
            data_rate_bps: ACCESS_RATE_BPS,
            delay,
            queue_packets: params.queue_packets,
        }
        .install(
            &mut spec,
            format!("sender-{}", i + 1),
            sender,
            left_router,
            sender_subnets.next_subnet()?,
        );
        let receiver_link = PointToPoint {
            data_rate_bps: ACCESS_RATE_BPS,
            delay: Duration::ZERO,
            queue_packets: params.queue_packets,
        }
        .install(
            &mut spec,
            format!("receiver-{}", i + 1),
            receiver,
            right_router,
            receiver_subnets.next_subnet()?,
        );

        // Hosts reach the opposite subnet through their router, routers through the bottleneck
        add_static_route(
            &mut spec,
            sender,
            receiver_link.subnet,
            sender_link.address(LinkSide::B),
            0,
        )?;
        add_static_route(
            &mut spec,
            receiver,
            sender_link.subnet,
            receiver_link.address(LinkSide::B),
            0,
        )?;
        add_static_route(
            &mut spec,
            left_router,
            receiver_link.subnet,
            bottleneck.address(LinkSide::B),
            0,
        )?;
        add_static_route(
            &mut spec,
            right_router,
            sender_link.subnet,
            bottleneck.address(LinkSide::A),
            0,
        )?;

        access_links.push(sender_link.link);
        flows.push(FlowEndpoints {
            label: (i + 1).to_string(),
            sender,
            receiver,
            sender_address: sender_link.address(LinkSide::A),
            receiver_address: receiver_link.address(LinkSide::A),
            receiver_port: SINK_PORT,
        });
    }

    let [left_device, right_device] = bottleneck.devices;
    Ok(Topology {
        spec,
        flows,
        observed_queues: vec![ObservedQueue {
            device: left_device,
            size_file: "queueSize.csv".to_string(),
            drops_file: "queueDrops.csv".to_string(),
        }],
        targets: MutationTargets {
            bottleneck: bottleneck.devices,
            access_links,
            error_model_device: right_device,
        },
        bottlenecks: vec![left_device],
        reroute: None,
    })
}
