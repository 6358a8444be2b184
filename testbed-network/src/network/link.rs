use crate::clock::SimTime;
use crate::network::ip::Ipv4Cidr;
use crate::network::packet::Packet;
use crate::network::{DeviceId, ErrorModelId, LinkId, NodeId};
use crate::pcap_exporter::PcapExporter;
use crate::trace::TracedValue;
use std::collections::VecDeque;
use std::time::Duration;

/// A point-to-point channel between exactly two devices
pub struct Link {
    pub(crate) id: LinkId,
    pub(crate) name: String,
    pub(crate) devices: [DeviceId; 2],
    pub(crate) delay: Duration,
}

impl Link {
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn devices(&self) -> [DeviceId; 2] {
        self.devices
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    /// Packets dropped because the transmit queue was full
    pub queue_drops: u64,
    pub rx_packets: u64,
    /// Packets dropped by the receive error model
    pub rx_errors: u64,
}

/// A network interface attached to one side of a [`Link`]
pub struct Device {
    pub(crate) id: DeviceId,
    pub(crate) node: NodeId,
    pub(crate) link: LinkId,
    pub(crate) peer: DeviceId,
    pub(crate) interface: usize,
    pub(crate) address: Ipv4Cidr,
    pub(crate) data_rate_bps: u64,
    pub(crate) queue: DropTailQueue,
    pub(crate) transmitting: bool,
    pub(crate) error_model: Option<ErrorModelId>,
    pub(crate) capture: Option<PcapExporter>,
    pub(crate) stats: DeviceStats,
}

impl Device {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn peer(&self) -> DeviceId {
        self.peer
    }

    pub fn interface(&self) -> usize {
        self.interface
    }

    pub fn address(&self) -> Ipv4Cidr {
        self.address
    }

    pub fn data_rate_bps(&self) -> u64 {
        self.data_rate_bps
    }

    pub fn stats(&self) -> DeviceStats {
        self.stats
    }

    /// Time needed to put `bytes` on the wire at the current data rate
    pub(crate) fn serialization_time(&self, bytes: usize) -> Duration {
        let nanos = bytes as u128 * 8 * 1_000_000_000 / self.data_rate_bps as u128;
        Duration::from_nanos(nanos as u64)
    }
}

pub(crate) struct DropTailQueue {
    packets: VecDeque<Packet>,
    max_packets: usize,
    pub(crate) len: TracedValue<u32>,
    pub(crate) reported_overflow: bool,
}

impl DropTailQueue {
    pub(crate) fn new(max_packets: usize) -> Self {
        Self {
            packets: VecDeque::new(),
            max_packets,
            len: TracedValue::new(0),
            reported_overflow: false,
        }
    }

    /// Appends the packet, handing it back if the queue is full
    pub(crate) fn enqueue(
        &mut self,
        now: SimTime,
        packet: Packet,
    ) -> anyhow::Result<Option<Packet>> {
        if self.packets.len() >= self.max_packets {
            return Ok(Some(packet));
        }

        self.packets.push_back(packet);
        self.len.set(now, self.packets.len() as u32)?;
        Ok(None)
    }

    pub(crate) fn dequeue(&mut self, now: SimTime) -> anyhow::Result<Option<Packet>> {
        let packet = self.packets.pop_front();
        self.len.set(now, self.packets.len() as u32)?;
        Ok(packet)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::packet::Segment;
    use crate::tcp::FlowId;
    use std::net::Ipv4Addr;

    fn data_packet(seq: u64) -> Packet {
        Packet {
            flow: FlowId(0),
            source: Ipv4Addr::new(10, 1, 0, 1),
            source_port: 49153,
            destination: Ipv4Addr::new(10, 2, 0, 1),
            destination_port: 8080,
            segment: Segment::Data { seq, len: 1448 },
        }
    }

    #[test]
    fn test_drop_tail_rejects_when_full() {
        let mut queue = DropTailQueue::new(2);
        let now = SimTime::ZERO;

        assert!(queue.enqueue(now, data_packet(0)).unwrap().is_none());
        assert!(queue.enqueue(now, data_packet(1448)).unwrap().is_none());
        let rejected = queue.enqueue(now, data_packet(2896)).unwrap();
        assert_eq!(rejected, Some(data_packet(2896)));
        assert_eq!(queue.len.get(), 2);

        assert_eq!(queue.dequeue(now).unwrap(), Some(data_packet(0)));
        assert_eq!(queue.len.get(), 1);
    }
}
