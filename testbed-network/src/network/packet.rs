use crate::tcp::FlowId;
use std::net::Ipv4Addr;

/// Bytes of IPv4 and TCP headers added to every segment
pub const HEADER_BYTES: usize = 40;

#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub flow: FlowId,
    pub source: Ipv4Addr,
    pub source_port: u16,
    pub destination: Ipv4Addr,
    pub destination_port: u16,
    pub segment: Segment,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Segment {
    Data { seq: u64, len: u32 },
    Ack { ack: u64 },
}

impl Packet {
    pub fn payload_len(&self) -> usize {
        match self.segment {
            Segment::Data { len, .. } => len as usize,
            Segment::Ack { .. } => 0,
        }
    }

    /// Size of the packet as seen by links and queues
    pub fn wire_size(&self) -> usize {
        HEADER_BYTES + self.payload_len()
    }
}
