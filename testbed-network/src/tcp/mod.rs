//! Bulk TCP transfers
//!
//! A flow pairs a sender that always has data to send with a sink that acknowledges every data
//! segment it receives. There is no handshake and no receive window: a sender starts pushing
//! segments as soon as it is started, limited only by its congestion window.

pub mod congestion;

use crate::clock::{Scheduler, SimTime};
use crate::network::packet::{HEADER_BYTES, Packet, Segment};
use crate::network::{Network, NetworkError, NodeId};
use crate::tcp::congestion::{CongestionControl, Window};
use crate::trace::{TraceHook, TracedValue};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::time::Duration;

const DUPACK_THRESHOLD: u32 = 3;
const MAX_RTO: Duration = Duration::from_secs(60);
const CLOCK_GRANULARITY: Duration = Duration::from_millis(1);
const FIRST_SENDER_PORT: u16 = 49153;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(pub(crate) usize);

impl FlowId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for FlowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "flow#{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct TcpConfig {
    pub segment_size: u32,
    pub initial_cwnd_segments: u32,
    /// Initial slow start threshold, in bytes (`None` leaves it unset, i.e. at its maximum)
    pub initial_ssthresh_bytes: Option<u32>,
    pub initial_rto: Duration,
    pub min_rto: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            segment_size: 1448,
            initial_cwnd_segments: 10,
            initial_ssthresh_bytes: Some(10),
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(200),
        }
    }
}

pub struct FlowSpec {
    pub name: String,
    pub sender: NodeId,
    pub receiver: NodeId,
    pub sender_address: Ipv4Addr,
    pub receiver_address: Ipv4Addr,
    pub receiver_port: u16,
    pub congestion_control: Box<dyn CongestionControl>,
    pub config: TcpConfig,
}

/// Cumulative per-flow counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowCounters {
    /// Bytes of data segments put on the wire by the sender, headers and retransmissions included
    pub tx_bytes: u64,
    /// Application bytes delivered in order at the sink
    pub rx_bytes: u64,
    /// Data segments sent more than once
    pub retransmits: u64,
}

/// Integer-valued sender state exposed for tracing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowTrace {
    CongestionWindow,
    BytesInFlight,
    SlowStartThreshold,
}

/// Time-valued sender state exposed for tracing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeTrace {
    /// Smoothed round-trip time
    Rtt,
    /// Most recent round-trip time sample
    LastRtt,
    RetransmissionTimeout,
}

pub(crate) struct TcpFlow {
    name: String,
    sender: BulkSender,
    sink: PacketSink,
}

#[derive(Default)]
struct Outbox {
    segments: Vec<Segment>,
    timer: Option<TimerRequest>,
}

struct TimerRequest {
    generation: u64,
    after: Duration,
}

#[derive(Clone, Copy)]
struct SentSegment {
    at: SimTime,
    retransmitted: bool,
}

struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    min_rto: Duration,
}

impl RttEstimator {
    fn new(initial_rto: Duration, min_rto: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: initial_rto,
            min_rto,
        }
    }

    fn sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let deviation = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = self.rttvar * 3 / 4 + deviation / 4;
                self.srtt = Some(srtt * 7 / 8 + rtt / 8);
            }
        }

        let srtt = self.srtt.unwrap_or(rtt);
        self.rto = (srtt + CLOCK_GRANULARITY.max(self.rttvar * 4)).clamp(self.min_rto, MAX_RTO);
    }

    fn back_off(&mut self) {
        self.rto = (self.rto * 2).min(MAX_RTO);
    }
}

struct BulkSender {
    node: NodeId,
    address: Ipv4Addr,
    port: u16,
    remote: Ipv4Addr,
    remote_port: u16,
    running: bool,
    window: Window,
    congestion_control: Box<dyn CongestionControl>,
    snd_una: u64,
    snd_nxt: u64,
    high_tx: u64,
    dupacks: u32,
    recover: Option<u64>,
    rtt: RttEstimator,
    timer_generation: u64,
    timer_running: bool,
    sent: BTreeMap<u64, SentSegment>,
    tx_bytes: u64,
    retransmits: u64,
    cwnd_trace: TracedValue<u32>,
    in_flight_trace: TracedValue<u32>,
    ssthresh_trace: TracedValue<u32>,
    rtt_trace: TracedValue<Duration>,
    last_rtt_trace: TracedValue<Duration>,
    rto_trace: TracedValue<Duration>,
}

impl BulkSender {
    fn new(spec: FlowSpec, port: u16) -> Self {
        let config = spec.config;
        let window = Window {
            cwnd: config.initial_cwnd_segments * config.segment_size,
            ssthresh: config.initial_ssthresh_bytes.unwrap_or(u32::MAX),
            segment_size: config.segment_size,
        };

        Self {
            node: spec.sender,
            address: spec.sender_address,
            port,
            remote: spec.receiver_address,
            remote_port: spec.receiver_port,
            running: false,
            window,
            congestion_control: spec.congestion_control,
            snd_una: 0,
            snd_nxt: 0,
            high_tx: 0,
            dupacks: 0,
            recover: None,
            rtt: RttEstimator::new(config.initial_rto, config.min_rto),
            timer_generation: 0,
            timer_running: false,
            sent: BTreeMap::new(),
            tx_bytes: 0,
            retransmits: 0,
            cwnd_trace: TracedValue::new(window.cwnd),
            in_flight_trace: TracedValue::new(0),
            ssthresh_trace: TracedValue::new(window.ssthresh),
            rtt_trace: TracedValue::new(Duration::ZERO),
            last_rtt_trace: TracedValue::new(Duration::ZERO),
            rto_trace: TracedValue::new(config.initial_rto),
        }
    }

    fn segment_size(&self) -> u64 {
        self.window.segment_size as u64
    }

    fn bytes_in_flight(&self) -> u32 {
        u32::try_from(self.snd_nxt - self.snd_una).unwrap_or(u32::MAX)
    }

    fn start(&mut self, now: SimTime, out: &mut Outbox) -> anyhow::Result<()> {
        self.running = true;
        self.fill_window(now, out);
        self.publish(now)
    }

    fn stop(&mut self) {
        self.running = false;
        self.cancel_timer();
    }

    fn fill_window(&mut self, now: SimTime, out: &mut Outbox) {
        if !self.running {
            return;
        }

        let usable = self.window.cwnd.max(self.window.segment_size) as u64;
        while self.bytes_in_flight() as u64 + self.segment_size() <= usable {
            self.transmit(now, self.snd_nxt, out);
            self.snd_nxt += self.segment_size();
        }

        if !self.timer_running && self.snd_nxt > self.snd_una {
            self.arm_timer(out);
        }
    }

    fn transmit(&mut self, now: SimTime, seq: u64, out: &mut Outbox) {
        let retransmission = seq < self.high_tx;
        if retransmission {
            self.retransmits += 1;
        }

        let len = self.window.segment_size;
        self.high_tx = self.high_tx.max(seq + len as u64);
        self.tx_bytes += (HEADER_BYTES + len as usize) as u64;
        self.sent.insert(
            seq,
            SentSegment {
                at: now,
                retransmitted: retransmission,
            },
        );
        out.segments.push(Segment::Data { seq, len });
    }

    fn arm_timer(&mut self, out: &mut Outbox) {
        self.timer_generation += 1;
        self.timer_running = true;
        out.timer = Some(TimerRequest {
            generation: self.timer_generation,
            after: self.rtt.rto,
        });
    }

    fn cancel_timer(&mut self) {
        self.timer_generation += 1;
        self.timer_running = false;
    }

    fn on_ack(&mut self, now: SimTime, ack: u64, out: &mut Outbox) -> anyhow::Result<()> {
        if !self.running {
            return Ok(());
        }

        if ack > self.snd_una {
            self.on_new_ack(now, ack, out)?;
        } else if ack == self.snd_una && self.snd_nxt > self.snd_una {
            self.on_duplicate_ack(now, out);
        }

        self.publish(now)
    }

    fn on_new_ack(&mut self, now: SimTime, ack: u64, out: &mut Outbox) -> anyhow::Result<()> {
        let acked = ack - self.snd_una;

        // Karn's algorithm: only segments sent exactly once yield rtt samples
        if let Some((_, segment)) = self.sent.range(..ack).next_back() {
            if !segment.retransmitted {
                let sample = now.saturating_since(segment.at);
                self.rtt.sample(sample);
                self.last_rtt_trace.set(now, sample)?;
            }
        }
        self.sent = self.sent.split_off(&ack);

        self.snd_una = ack;
        self.snd_nxt = self.snd_nxt.max(ack);
        self.dupacks = 0;

        match self.recover {
            Some(recover) if ack < recover => {
                // Partial ack: the next hole was lost as well
                self.transmit(now, self.snd_una, out);
                let deflated = self.window.cwnd.saturating_sub(acked as u32);
                self.window.cwnd = deflated.saturating_add(self.window.segment_size);
            }
            Some(_) => {
                self.recover = None;
                self.window.cwnd = self.window.ssthresh;
            }
            None => {
                let segments_acked = acked.div_ceil(self.segment_size()) as u32;
                self.congestion_control
                    .increase_window(&mut self.window, segments_acked, now);
            }
        }

        if self.snd_nxt > self.snd_una {
            self.arm_timer(out);
        } else {
            self.cancel_timer();
        }

        self.fill_window(now, out);
        Ok(())
    }

    fn on_duplicate_ack(&mut self, now: SimTime, out: &mut Outbox) {
        self.dupacks += 1;

        if self.recover.is_some() {
            // Every duplicate ack means another segment left the network
            self.window.cwnd = self.window.cwnd.saturating_add(self.window.segment_size);
            self.fill_window(now, out);
        } else if self.dupacks == DUPACK_THRESHOLD {
            let in_flight = self.bytes_in_flight();
            self.window.ssthresh = self
                .congestion_control
                .ssthresh(&self.window, in_flight, now);
            self.recover = Some(self.high_tx);
            self.transmit(now, self.snd_una, out);
            self.window.cwnd = self
                .window
                .ssthresh
                .saturating_add(DUPACK_THRESHOLD * self.window.segment_size);
            self.arm_timer(out);
            self.fill_window(now, out);
        }
    }

    fn on_timeout(
        &mut self,
        now: SimTime,
        generation: u64,
        out: &mut Outbox,
    ) -> anyhow::Result<()> {
        if !self.running || generation != self.timer_generation {
            return Ok(());
        }

        let in_flight = self.bytes_in_flight();
        self.window.ssthresh = self
            .congestion_control
            .ssthresh(&self.window, in_flight, now);
        self.window.cwnd = self.window.segment_size;
        self.recover = None;
        self.dupacks = 0;
        self.rtt.back_off();
        self.timer_running = false;

        // Go back N: everything outstanding is sent again, and none of it may be used for rtt
        // estimation anymore
        self.snd_nxt = self.snd_una;
        for segment in self.sent.values_mut() {
            segment.retransmitted = true;
        }

        self.fill_window(now, out);
        self.publish(now)
    }

    fn publish(&mut self, now: SimTime) -> anyhow::Result<()> {
        self.cwnd_trace.set(now, self.window.cwnd)?;
        self.ssthresh_trace.set(now, self.window.ssthresh)?;
        let in_flight = self.bytes_in_flight();
        self.in_flight_trace.set(now, in_flight)?;
        if let Some(srtt) = self.rtt.srtt {
            self.rtt_trace.set(now, srtt)?;
        }
        self.rto_trace.set(now, self.rtt.rto)?;
        Ok(())
    }
}

struct PacketSink {
    node: NodeId,
    address: Ipv4Addr,
    port: u16,
    running: bool,
    next_expected: u64,
    out_of_order: BTreeMap<u64, u32>,
    rx_bytes: u64,
}

impl PacketSink {
    /// Accepts a data segment, returning the cumulative ack to send back
    fn on_data(&mut self, seq: u64, len: u32) -> Option<u64> {
        if !self.running {
            return None;
        }

        if seq == self.next_expected {
            self.next_expected += len as u64;
            self.rx_bytes += len as u64;
            while let Some(len) = self.out_of_order.remove(&self.next_expected) {
                self.next_expected += len as u64;
                self.rx_bytes += len as u64;
            }
        } else if seq > self.next_expected {
            self.out_of_order.entry(seq).or_insert(len);
        }

        Some(self.next_expected)
    }
}

impl Network {
    /// Installs a bulk sender and its sink, both initially stopped
    pub fn add_flow(&mut self, mut spec: FlowSpec) -> Result<FlowId, NetworkError> {
        for (node, address) in [
            (spec.sender, spec.sender_address),
            (spec.receiver, spec.receiver_address),
        ] {
            let owns_address = self
                .node(node)?
                .interfaces()
                .iter()
                .any(|&d| self.devices()[d.index()].address().address == address);
            if !owns_address {
                return Err(NetworkError::InvalidAttribute {
                    attribute: "flow endpoint",
                    reason: format!("{address} is not assigned to {node}"),
                });
            }
        }

        if spec.config.segment_size == 0 {
            return Err(NetworkError::InvalidAttribute {
                attribute: "segment size",
                reason: "must be greater than zero".to_string(),
            });
        }

        let id = FlowId(self.flows.len());
        let port = FIRST_SENDER_PORT.wrapping_add(id.0 as u16);
        let sink = PacketSink {
            node: spec.receiver,
            address: spec.receiver_address,
            port: spec.receiver_port,
            running: false,
            next_expected: 0,
            out_of_order: BTreeMap::new(),
            rx_bytes: 0,
        };
        let name = std::mem::take(&mut spec.name);
        let flow = TcpFlow {
            name,
            sender: BulkSender::new(spec, port),
            sink,
        };

        self.flows.push(flow);
        Ok(id)
    }

    fn flow_mut(&mut self, id: FlowId) -> Result<&mut TcpFlow, NetworkError> {
        self.flows.get_mut(id.0).ok_or(NetworkError::UnknownFlow(id))
    }

    fn flow(&self, id: FlowId) -> Result<&TcpFlow, NetworkError> {
        self.flows.get(id.0).ok_or(NetworkError::UnknownFlow(id))
    }

    pub fn flow_name(&self, id: FlowId) -> Result<&str, NetworkError> {
        Ok(&self.flow(id)?.name)
    }

    pub fn flow_counters(&self, id: FlowId) -> Result<FlowCounters, NetworkError> {
        let flow = self.flow(id)?;
        Ok(FlowCounters {
            tx_bytes: flow.sender.tx_bytes,
            rx_bytes: flow.sink.rx_bytes,
            retransmits: flow.sender.retransmits,
        })
    }

    pub fn connect_window_trace(
        &mut self,
        id: FlowId,
        trace: WindowTrace,
        hook: TraceHook<u32>,
    ) -> Result<(), NetworkError> {
        let sender = &mut self.flow_mut(id)?.sender;
        match trace {
            WindowTrace::CongestionWindow => sender.cwnd_trace.connect(hook),
            WindowTrace::BytesInFlight => sender.in_flight_trace.connect(hook),
            WindowTrace::SlowStartThreshold => sender.ssthresh_trace.connect(hook),
        }

        Ok(())
    }

    pub fn connect_time_trace(
        &mut self,
        id: FlowId,
        trace: TimeTrace,
        hook: TraceHook<Duration>,
    ) -> Result<(), NetworkError> {
        let sender = &mut self.flow_mut(id)?.sender;
        match trace {
            TimeTrace::Rtt => sender.rtt_trace.connect(hook),
            TimeTrace::LastRtt => sender.last_rtt_trace.connect(hook),
            TimeTrace::RetransmissionTimeout => sender.rto_trace.connect(hook),
        }

        Ok(())
    }

    pub fn start_sender(
        &mut self,
        scheduler: &mut Scheduler<Network>,
        id: FlowId,
    ) -> anyhow::Result<()> {
        let mut out = Outbox::default();
        self.flow_mut(id)?.sender.start(scheduler.now(), &mut out)?;
        self.flush_sender(scheduler, id, out)
    }

    pub fn stop_sender(&mut self, id: FlowId) -> Result<(), NetworkError> {
        self.flow_mut(id)?.sender.stop();
        Ok(())
    }

    pub fn start_sink(&mut self, id: FlowId) -> Result<(), NetworkError> {
        self.flow_mut(id)?.sink.running = true;
        Ok(())
    }

    pub fn stop_sink(&mut self, id: FlowId) -> Result<(), NetworkError> {
        self.flow_mut(id)?.sink.running = false;
        Ok(())
    }

    fn flush_sender(
        &mut self,
        scheduler: &mut Scheduler<Network>,
        id: FlowId,
        out: Outbox,
    ) -> anyhow::Result<()> {
        let sender = &self.flow(id)?.sender;
        let (node, source, source_port, destination, destination_port) = (
            sender.node,
            sender.address,
            sender.port,
            sender.remote,
            sender.remote_port,
        );

        if let Some(timer) = out.timer {
            let generation = timer.generation;
            scheduler.schedule_in(timer.after, move |network: &mut Network, scheduler| {
                let mut out = Outbox::default();
                let now = scheduler.now();
                network
                    .flow_mut(id)?
                    .sender
                    .on_timeout(now, generation, &mut out)?;
                network.flush_sender(scheduler, id, out)
            });
        }

        for segment in out.segments {
            let packet = Packet {
                flow: id,
                source,
                source_port,
                destination,
                destination_port,
                segment,
            };
            self.send_from_node(scheduler, node, packet)?;
        }

        Ok(())
    }

    /// Hands a packet addressed to `node` to the flow endpoint it belongs to
    pub(crate) fn deliver_local(
        &mut self,
        scheduler: &mut Scheduler<Network>,
        node: NodeId,
        packet: Packet,
    ) -> anyhow::Result<()> {
        let id = packet.flow;
        let now = scheduler.now();
        let flow = self.flow_mut(id)?;

        match packet.segment {
            Segment::Data { seq, len } => {
                let sink = &mut flow.sink;
                if sink.node != node {
                    tracing::debug!(%id, "data segment delivered to the wrong node");
                    return Ok(());
                }

                let Some(ack) = sink.on_data(seq, len) else {
                    return Ok(());
                };

                let reply = Packet {
                    flow: id,
                    source: sink.address,
                    source_port: sink.port,
                    destination: packet.source,
                    destination_port: packet.source_port,
                    segment: Segment::Ack { ack },
                };
                self.send_from_node(scheduler, node, reply)
            }
            Segment::Ack { ack } => {
                if flow.sender.node != node {
                    tracing::debug!(%id, "ack delivered to the wrong node");
                    return Ok(());
                }

                let mut out = Outbox::default();
                flow.sender.on_ack(now, ack, &mut out)?;
                self.flush_sender(scheduler, id, out)
            }
        }
    }
}
