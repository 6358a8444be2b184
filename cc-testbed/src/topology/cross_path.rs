//! Two dumbbells whose routers are joined by cross links
//!
//! ```text
//! client-1-i -- left-router-1 ===== right-router-1 -- server-1-i
//!                    |                   |
//!                 cross-1             cross-2
//!                    |                   |
//! client-2-i -- left-router-2 ===== right-router-2 -- server-2-i
//! ```
//!
//! Every router has static routes towards the subnets of both dumbbells. The routes that carry the
//! second dumbbell's traffic are the dynamic part: they either point at the second bottleneck
//! (direct) or at the cross links, so the traffic shares the first bottleneck (rerouted).
//!
//! With `N` clients per dumbbell, interface indices are:
//! * left routers: clients `0..N`, bottleneck `N`, cross link `N + 1`
//! * right routers: bottleneck `0`, servers `1..=N`, cross link `N + 1`

use crate::config::{ConfigError, CrossPathParams};
use crate::topology::{
    FlowEndpoints, InstalledLink, MutationTargets, ObservedQueue, PointToPoint, ReroutePlan, Subnet,
    SubnetAllocator, Topology, add_static_route, mbps,
};
use anyhow::Context;
use std::time::Duration;
use testbed_network::network::route::Route;
use testbed_network::network::spec::{LinkSide, NetworkSpec, NodeKind};
use testbed_network::network::{LinkId, NodeId};

const ACCESS_RATE_BPS: u64 = 100_000_000_000;
const FIRST_SINK_PORT: u16 = 8080;

struct Dumbbell {
    clients: Vec<NodeId>,
    servers: Vec<NodeId>,
    left_router: NodeId,
    right_router: NodeId,
    client_links: Vec<InstalledLink>,
    server_links: Vec<InstalledLink>,
}

pub fn build(params: &CrossPathParams, flow_count: usize) -> anyhow::Result<Topology> {
    let n = params.num_clients;
    if flow_count != 2 * n {
        return Err(ConfigError::FlowCountMismatch {
            topology: "cross-path",
            expected: format!("{} flows ({n} per dumbbell)", 2 * n),
            actual: flow_count,
        }
        .into());
    }

    let mut spec = NetworkSpec::new();
    let mut dumbbells: Vec<_> = (1..=2)
        .map(|d| Dumbbell {
            clients: (1..=n)
                .map(|i| spec.add_node(format!("client-{d}-{i}"), NodeKind::Host))
                .collect(),
            servers: (1..=n)
                .map(|i| spec.add_node(format!("server-{d}-{i}"), NodeKind::Host))
                .collect(),
            left_router: spec.add_node(format!("left-router-{d}"), NodeKind::Router),
            right_router: spec.add_node(format!("right-router-{d}"), NodeKind::Router),
            client_links: Vec::with_capacity(n),
            server_links: Vec::with_capacity(n),
        })
        .collect();

    let access = |d: usize| PointToPoint {
        data_rate_bps: ACCESS_RATE_BPS,
        delay: params.delay[d],
        queue_packets: params.queue_packets[d],
    };
    let zero_delay = |d: usize| PointToPoint {
        data_rate_bps: ACCESS_RATE_BPS,
        delay: Duration::ZERO,
        queue_packets: params.queue_packets[d],
    };

    // Client links, interleaved per client index (10.1.i.0 and 10.2.i.0)
    let mut client_subnets = [SubnetAllocator::new(10, 1), SubnetAllocator::new(10, 2)];
    for i in 0..n {
        for (d, dumbbell) in dumbbells.iter_mut().enumerate() {
            let link = access(d).install(
                &mut spec,
                format!("client-{}-{}", d + 1, i + 1),
                dumbbell.clients[i],
                dumbbell.left_router,
                client_subnets[d].next_subnet()?,
            );
            dumbbell.client_links.push(link);
        }
    }

    let bottlenecks: Vec<_> = dumbbells
        .iter()
        .enumerate()
        .map(|(d, dumbbell)| {
            PointToPoint {
                data_rate_bps: mbps(params.bandwidth_mbps[d]),
                delay: Duration::ZERO,
                queue_packets: params.queue_packets[d],
            }
            .install(
                &mut spec,
                format!("bottleneck-{}", d + 1),
                dumbbell.left_router,
                dumbbell.right_router,
                Subnet::fixed(11, d as u8 + 1, 0),
            )
        })
        .collect();

    // Server links (10.3.i.0 and 10.4.i.0)
    let mut server_subnets = [SubnetAllocator::new(10, 3), SubnetAllocator::new(10, 4)];
    for i in 0..n {
        for (d, dumbbell) in dumbbells.iter_mut().enumerate() {
            let link = zero_delay(d).install(
                &mut spec,
                format!("server-{}-{}", d + 1, i + 1),
                dumbbell.right_router,
                dumbbell.servers[i],
                server_subnets[d].next_subnet()?,
            );
            dumbbell.server_links.push(link);
        }
    }

    // The A side of each cross link sits on the second dumbbell
    let [first, second] = [&dumbbells[0], &dumbbells[1]];
    let left_cross = zero_delay(0).install(
        &mut spec,
        "cross-1".to_string(),
        second.left_router,
        first.left_router,
        Subnet::fixed(12, 1, 0),
    );
    let right_cross = zero_delay(1).install(
        &mut spec,
        "cross-2".to_string(),
        second.right_router,
        first.right_router,
        Subnet::fixed(12, 2, 0),
    );

    let left_bottleneck_iface = n;
    let cross_iface = n + 1;
    let right_bottleneck_iface = 0;

    for (d, dumbbell) in dumbbells.iter().enumerate() {
        for i in 0..n {
            let client_link = &dumbbell.client_links[i];
            let server_link = &dumbbell.server_links[i];
            add_static_route(
                &mut spec,
                dumbbell.clients[i],
                server_link.subnet,
                client_link.address(LinkSide::B),
                0,
            )?;
            add_static_route(
                &mut spec,
                dumbbell.servers[i],
                client_link.subnet,
                server_link.address(LinkSide::A),
                0,
            )?;

            // Both dumbbells' traffic may cross the first bottleneck
            add_static_route(
                &mut spec,
                first.left_router,
                server_link.subnet,
                bottlenecks[0].address(LinkSide::B),
                left_bottleneck_iface,
            )?;
            add_static_route(
                &mut spec,
                first.right_router,
                client_link.subnet,
                bottlenecks[0].address(LinkSide::A),
                right_bottleneck_iface,
            )?;

            // Rerouted traffic leaves the first dumbbell through the cross links
            if d == 1 {
                add_static_route(
                    &mut spec,
                    first.left_router,
                    client_link.subnet,
                    left_cross.address(LinkSide::A),
                    cross_iface,
                )?;
                add_static_route(
                    &mut spec,
                    first.right_router,
                    server_link.subnet,
                    right_cross.address(LinkSide::A),
                    cross_iface,
                )?;
            }
        }
    }

    let mut direct = [Vec::with_capacity(n), Vec::with_capacity(n)];
    let mut rerouted = [Vec::with_capacity(n), Vec::with_capacity(n)];
    for i in 0..n {
        let server_subnet = second.server_links[i].subnet.network();
        let client_subnet = second.client_links[i].subnet.network();

        direct[0].push(Route {
            destination: server_subnet,
            gateway: bottlenecks[1].address(LinkSide::B),
            interface: left_bottleneck_iface,
        });
        direct[1].push(Route {
            destination: client_subnet,
            gateway: bottlenecks[1].address(LinkSide::A),
            interface: right_bottleneck_iface,
        });
        rerouted[0].push(Route {
            destination: server_subnet,
            gateway: left_cross.address(LinkSide::B),
            interface: cross_iface,
        });
        rerouted[1].push(Route {
            destination: client_subnet,
            gateway: right_cross.address(LinkSide::B),
            interface: cross_iface,
        });
    }

    check_interface(&spec, first.left_router, bottlenecks[0].link, left_bottleneck_iface)?;
    check_interface(&spec, second.left_router, left_cross.link, cross_iface)?;
    check_interface(&spec, second.right_router, right_cross.link, cross_iface)?;

    let mut flows = Vec::with_capacity(flow_count);
    for (d, dumbbell) in dumbbells.iter().enumerate() {
        for i in 0..n {
            flows.push(FlowEndpoints {
                label: format!("{}_{}", d + 1, i + 1),
                sender: dumbbell.clients[i],
                receiver: dumbbell.servers[i],
                sender_address: dumbbell.client_links[i].address(LinkSide::A),
                receiver_address: dumbbell.server_links[i].address(LinkSide::B),
                receiver_port: FIRST_SINK_PORT + i as u16,
            });
        }
    }

    let observed_queues = bottlenecks
        .iter()
        .zip(&dumbbells)
        .map(|(bottleneck, dumbbell)| {
            let router = &spec.nodes[dumbbell.left_router.index()].name;
            let suffix = format!("{router}_{left_bottleneck_iface}");
            ObservedQueue {
                device: bottleneck.devices[0],
                size_file: format!("queueSize-{suffix}.csv"),
                drops_file: format!("queueDrops-{suffix}.csv"),
            }
        })
        .collect();

    let access_links = dumbbells
        .iter()
        .flat_map(|d| d.client_links.iter().map(|l| l.link))
        .collect();

    Ok(Topology {
        observed_queues,
        flows,
        targets: MutationTargets {
            bottleneck: bottlenecks[0].devices,
            access_links,
            error_model_device: bottlenecks[0].devices[1],
        },
        bottlenecks: bottlenecks.iter().map(|b| b.devices[0]).collect(),
        reroute: Some(ReroutePlan {
            routers: [second.left_router, second.right_router],
            direct,
            rerouted,
            reroute_at: params.reroute_at,
            reroute_back_at: params.reroute_back_at,
        }),
        spec,
    })
}

fn check_interface(
    spec: &NetworkSpec,
    node: NodeId,
    link: LinkId,
    expected: usize,
) -> anyhow::Result<()> {
    let actual = spec
        .interface_of(node, link)
        .with_context(|| format!("{link} is not attached to {node}"))?;
    anyhow::ensure!(
        actual == expected,
        "{link} is interface {actual} of {node}, expected {expected}"
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use fastrand::Rng;
    use std::net::Ipv4Addr;
    use testbed_network::network::Network;

    fn params(num_clients: usize) -> CrossPathParams {
        CrossPathParams {
            num_clients,
            delay: [Duration::from_millis(5), Duration::from_millis(10)],
            bandwidth_mbps: [10, 10],
            queue_packets: [100, 150],
            reroute_at: 100.0,
            reroute_back_at: 200.0,
        }
    }

    #[test]
    fn test_layout() {
        let topology = build(&params(2), 4).unwrap();
        let network = Network::initialize(topology.spec, Rng::with_seed(1)).unwrap();

        // 2 clients and 2 servers per dumbbell, plus 4 routers
        assert_eq!(network.nodes().len(), 12);
        // Access links, 2 bottlenecks and 2 cross links
        assert_eq!(network.links().len(), 12);

        let labels: Vec<_> = topology.flows.iter().map(|f| f.label.as_str()).collect();
        assert_eq!(labels, ["1_1", "1_2", "2_1", "2_2"]);
        assert_eq!(topology.flows[3].sender_address, Ipv4Addr::new(10, 2, 1, 1));
        assert_eq!(topology.flows[3].receiver_address, Ipv4Addr::new(10, 4, 1, 2));
        assert_eq!(topology.flows[3].receiver_port, 8081);

        let sizes: Vec<_> = topology.observed_queues.iter().map(|q| q.size_file.as_str()).collect();
        assert_eq!(
            sizes,
            ["queueSize-left-router-1_2.csv", "queueSize-left-router-2_2.csv"]
        );
    }

    #[test]
    fn test_second_dumbbell_starts_direct() {
        let topology = build(&params(2), 4).unwrap();
        let plan = topology.reroute.clone().unwrap();
        let network = Network::initialize(topology.spec, Rng::with_seed(1)).unwrap();

        for flow in &topology.flows[2..] {
            let route = network
                .routes(plan.routers[0])
                .unwrap()
                .lookup(flow.receiver_address);
            // Dynamic routes are installed by the reroute mutator, not at assembly time
            assert!(route.is_none());
        }

        for (direct, rerouted) in plan.direct[0].iter().zip(&plan.rerouted[0]) {
            assert_eq!(direct.destination, rerouted.destination);
            assert_eq!(direct.interface, 2);
            assert_eq!(rerouted.interface, 3);
        }
        assert!(plan.direct[1].iter().all(|r| r.interface == 0));
        assert!(plan.rerouted[1].iter().all(|r| r.interface == 3));
    }

    #[test]
    fn test_first_dumbbell_carries_rerouted_traffic() {
        let topology = build(&params(1), 2).unwrap();
        let rerouted_flow = topology.flows[1].clone();
        let network = Network::initialize(topology.spec, Rng::with_seed(1)).unwrap();

        // The first left router forwards the second dumbbell's data over its bottleneck
        let routers: Vec<_> = network
            .nodes()
            .iter()
            .filter(|n| n.name() == "left-router-1" || n.name() == "right-router-1")
            .map(|n| n.id())
            .collect();
        let forward = network
            .routes(routers[0])
            .unwrap()
            .lookup(rerouted_flow.receiver_address)
            .unwrap();
        assert_eq!(forward.interface, 1);
        let ack_path = network
            .routes(routers[0])
            .unwrap()
            .lookup(rerouted_flow.sender_address)
            .unwrap();
        assert_eq!(ack_path.interface, 2);

        let to_server = network
            .routes(routers[1])
            .unwrap()
            .lookup(rerouted_flow.receiver_address)
            .unwrap();
        assert_eq!(to_server.interface, 2);
    }

    #[test]
    fn test_flow_count_must_match() {
        let err = build(&params(2), 3).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::FlowCountMismatch { actual: 3, .. })
        ));
    }
}
