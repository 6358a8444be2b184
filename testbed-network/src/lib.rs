#![allow(clippy::type_complexity)]

pub mod clock;
pub mod network;
pub mod pcap_exporter;
pub mod tcp;
pub mod trace;

#[cfg(test)]
mod test {
    use crate::clock::{Scheduler, SimTime};
    use crate::network::Network;
    use crate::network::ip::Ipv4Cidr;
    use crate::network::route::Route;
    use crate::network::spec::{LinkEndpointSpec, LinkSide, LinkSpec, NetworkSpec, NodeKind};
    use crate::network::{DeviceId, LinkId, NodeId};
    use crate::tcp::congestion;
    use crate::tcp::{FlowId, FlowSpec, TcpConfig, WindowTrace};
    use bon::builder;
    use fastrand::Rng;
    use std::cell::RefCell;
    use std::net::Ipv4Addr;
    use std::rc::Rc;
    use std::time::Duration;

    const SENDER_ADDR: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 1);
    const ROUTER_LEFT_ADDR: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 2);
    const ROUTER_RIGHT_ADDR: Ipv4Addr = Ipv4Addr::new(10, 2, 0, 2);
    const RECEIVER_ADDR: Ipv4Addr = Ipv4Addr::new(10, 2, 0, 1);
    const BANDWIDTH_100_MBPS: u64 = 100_000_000;
    const BANDWIDTH_10_MBPS: u64 = 10_000_000;

    struct LineNetwork {
        network: Network,
        sender: NodeId,
        receiver: NodeId,
        bottleneck: LinkId,
        flow: FlowId,
    }

    impl LineNetwork {
        /// The device on the router that feeds the bottleneck link
        fn bottleneck_device(&self) -> DeviceId {
            self.network.link(self.bottleneck).unwrap().devices()[0]
        }

        /// The device on the receiver that terminates the bottleneck link
        fn receiver_device(&self) -> DeviceId {
            self.network.link(self.bottleneck).unwrap().devices()[1]
        }

        fn run_for(&mut self, duration: Duration, start_sink: bool) {
            let mut scheduler = Scheduler::new();
            if start_sink {
                self.network.start_sink(self.flow).unwrap();
            }
            self.network.start_sender(&mut scheduler, self.flow).unwrap();
            scheduler.stop_at(SimTime::ZERO + duration);
            scheduler.run(&mut self.network).unwrap();
        }
    }

    fn cidr(address: Ipv4Addr) -> Ipv4Cidr {
        Ipv4Cidr::new(address, 24).unwrap()
    }

    /// sender -- router -- receiver, where the second link is the bottleneck
    #[builder]
    fn line_network(
        bottleneck_bps: Option<u64>,
        bottleneck_queue: Option<usize>,
        sender_routes: Option<bool>,
    ) -> LineNetwork {
        let delay = Duration::from_millis(5);
        let mut spec = NetworkSpec::new();
        let sender = spec.add_node("sender", NodeKind::Host);
        let router = spec.add_node("router", NodeKind::Router);
        let receiver = spec.add_node("receiver", NodeKind::Host);

        spec.add_link(LinkSpec {
            name: "sender-router".to_string(),
            a: LinkEndpointSpec {
                node: sender,
                address: cidr(SENDER_ADDR),
            },
            b: LinkEndpointSpec {
                node: router,
                address: cidr(ROUTER_LEFT_ADDR),
            },
            delay,
            data_rate_bps: BANDWIDTH_100_MBPS,
            queue_packets: 100,
        });
        let bottleneck = spec.add_link(LinkSpec {
            name: "router-receiver".to_string(),
            a: LinkEndpointSpec {
                node: router,
                address: cidr(ROUTER_RIGHT_ADDR),
            },
            b: LinkEndpointSpec {
                node: receiver,
                address: cidr(RECEIVER_ADDR),
            },
            delay,
            data_rate_bps: bottleneck_bps.unwrap_or(BANDWIDTH_10_MBPS),
            queue_packets: bottleneck_queue.unwrap_or(100),
        });

        if sender_routes.unwrap_or(true) {
            spec.node_mut(sender).unwrap().routes.push(Route {
                destination: cidr(RECEIVER_ADDR),
                gateway: ROUTER_LEFT_ADDR,
                interface: 0,
            });
        }
        spec.node_mut(receiver).unwrap().routes.push(Route {
            destination: cidr(SENDER_ADDR),
            gateway: ROUTER_RIGHT_ADDR,
            interface: 0,
        });

        let mut network = Network::initialize(spec, Rng::with_seed(42)).unwrap();
        let flow = network
            .add_flow(FlowSpec {
                name: "flow".to_string(),
                sender,
                receiver,
                sender_address: SENDER_ADDR,
                receiver_address: RECEIVER_ADDR,
                receiver_port: 8080,
                congestion_control: congestion::by_name("TcpNewReno").unwrap(),
                config: TcpConfig::default(),
            })
            .unwrap();

        LineNetwork {
            network,
            sender,
            receiver,
            bottleneck,
            flow,
        }
    }

    #[test]
    fn test_bulk_transfer_is_limited_by_bottleneck() {
        let mut line = line_network().call();
        line.run_for(Duration::from_secs(2), true);

        let counters = line.network.flow_counters(line.flow).unwrap();
        assert!(counters.rx_bytes > 1_000_000, "rx = {}", counters.rx_bytes);

        // 10 Mbps for two seconds, headers not included
        assert!(counters.rx_bytes <= 2_500_000, "rx = {}", counters.rx_bytes);
        assert!(counters.tx_bytes > counters.rx_bytes);

        let stats = line.network.device_stats(line.bottleneck_device()).unwrap();
        assert!(stats.tx_packets > 0);
        let receiver_stats = line.network.device_stats(line.receiver_device()).unwrap();
        assert_eq!(receiver_stats.rx_errors, 0);
    }

    #[test]
    fn test_small_queue_leads_to_drops_and_retransmits() {
        let mut line = line_network()
            .bottleneck_bps(1_000_000)
            .bottleneck_queue(5)
            .call();
        line.run_for(Duration::from_secs(5), true);

        let stats = line.network.device_stats(line.bottleneck_device()).unwrap();
        assert!(stats.queue_drops > 0);

        let counters = line.network.flow_counters(line.flow).unwrap();
        assert!(counters.retransmits > 0);
        assert!(counters.rx_bytes > 0);
    }

    #[test]
    fn test_error_model_at_full_rate_blocks_delivery() {
        let mut line = line_network().call();
        let device = line.receiver_device();
        let model = line.network.add_error_model(device, 1.0).unwrap();
        assert_eq!(line.network.error_model(model).unwrap().rate(), 1.0);

        line.run_for(Duration::from_secs(3), true);

        let counters = line.network.flow_counters(line.flow).unwrap();
        assert_eq!(counters.rx_bytes, 0);
        assert!(counters.retransmits > 0);
        assert!(line.network.device_stats(device).unwrap().rx_errors > 0);
    }

    #[test]
    fn test_error_rate_can_be_changed_at_runtime() {
        let mut line = line_network().call();
        let model = line
            .network
            .add_error_model(line.receiver_device(), 0.0)
            .unwrap();

        line.network.set_error_rate(model, 0.5).unwrap();
        assert_eq!(line.network.error_model(model).unwrap().rate(), 0.5);
        assert!(line.network.set_error_rate(model, 1.5).is_err());
        assert_eq!(line.network.error_model(model).unwrap().rate(), 0.5);
    }

    #[test]
    fn test_stopped_sink_discards_data() {
        let mut line = line_network().call();
        line.run_for(Duration::from_secs(3), false);

        let counters = line.network.flow_counters(line.flow).unwrap();
        assert_eq!(counters.rx_bytes, 0);
        assert!(counters.tx_bytes > 0);

        // Without acks, the retransmission timer has to fire
        assert!(counters.retransmits > 0);
    }

    #[test]
    fn test_missing_route_drops_packets_at_sender() {
        let mut line = line_network().sender_routes(false).call();
        line.run_for(Duration::from_secs(1), true);

        let sender = line.network.node(line.sender).unwrap();
        assert!(sender.unroutable_packets() > 0);
        assert_eq!(line.network.flow_counters(line.flow).unwrap().rx_bytes, 0);
        assert_eq!(line.network.node(line.receiver).unwrap().unroutable_packets(), 0);
    }

    #[test]
    fn test_cwnd_trace_sees_growth() {
        let mut line = line_network().call();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_cp = seen.clone();
        line.network
            .connect_window_trace(
                line.flow,
                WindowTrace::CongestionWindow,
                Box::new(move |now, cwnd| {
                    seen_cp.borrow_mut().push((now, cwnd));
                    Ok(())
                }),
            )
            .unwrap();

        line.run_for(Duration::from_secs(1), true);

        let seen = seen.borrow();
        assert!(!seen.is_empty());
        let initial_cwnd = 10 * TcpConfig::default().segment_size;
        assert!(seen.iter().any(|&(_, cwnd)| cwnd > initial_cwnd));
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn test_bottleneck_queue_is_traced() {
        let mut line = line_network().bottleneck_bps(1_000_000).call();
        let max_len = Rc::new(RefCell::new(0));
        let max_len_cp = max_len.clone();
        let device = line.bottleneck_device();
        line.network
            .connect_queue_trace(
                device,
                Box::new(move |_, len| {
                    let mut max_len = max_len_cp.borrow_mut();
                    *max_len = (*max_len).max(len);
                    Ok(())
                }),
            )
            .unwrap();

        line.run_for(Duration::from_secs(1), true);

        assert!(*max_len.borrow() > 0);
        assert!(*max_len.borrow() <= 100);
    }

    #[test]
    fn test_flow_endpoints_must_own_their_addresses() {
        let mut line = line_network().call();
        let result = line.network.add_flow(FlowSpec {
            name: "bogus".to_string(),
            sender: line.sender,
            receiver: line.receiver,
            sender_address: RECEIVER_ADDR,
            receiver_address: RECEIVER_ADDR,
            receiver_port: 8081,
            congestion_control: congestion::by_name("TcpCubic").unwrap(),
            config: TcpConfig::default(),
        });

        assert!(result.is_err());
    }

    #[test]
    fn test_link_sides_map_to_devices() {
        let line = line_network().call();
        let link = line.network.link(line.bottleneck).unwrap();
        let [a, b] = link.devices();
        assert_eq!(a, DeviceId::new(line.bottleneck, LinkSide::A));
        assert_eq!(b, DeviceId::new(line.bottleneck, LinkSide::B));
        assert_eq!(line.network.device(a).unwrap().peer(), b);
        assert_eq!(line.network.device(b).unwrap().node(), line.receiver);
    }
}
