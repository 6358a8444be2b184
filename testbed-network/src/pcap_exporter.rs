use crate::clock::SimTime;
use crate::network::packet::{HEADER_BYTES, Packet, Segment};
use anyhow::{Context, anyhow};
use pcap_file::pcapng::PcapNgWriter;
use pcap_file::pcapng::blocks::enhanced_packet::EnhancedPacketBlock;
use pcap_file::pcapng::blocks::interface_description::InterfaceDescriptionBlock;
use pcap_file::pcapng::blocks::section_header::SectionHeaderBlock;
use pcap_file::{DataLink, Endianness};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::MutableIpv4Packet;
use pnet_packet::tcp::{MutableTcpPacket, TcpFlags};
use pnet_packet::{PacketSize, ipv4, tcp};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

/// Writes the packets sent by a device to a pcapng capture
///
/// Payload bytes are not simulated, so captured segments carry zeroed payloads of the right
/// length.
pub struct PcapExporter {
    total_tracked_packets: u64,
    writer: PcapNgWriter<BufWriter<Box<dyn Write + Send + 'static>>>,
}

impl PcapExporter {
    pub fn new(writer: impl Write + Send + 'static) -> anyhow::Result<Self> {
        let writer: Box<dyn Write + Send + 'static> = Box::new(writer);
        let mut writer = PcapNgWriter::with_section_header(
            BufWriter::new(writer),
            SectionHeaderBlock {
                endianness: Endianness::Big,
                major_version: 1,
                minor_version: 0,
                section_length: 0,
                options: vec![],
            },
        )
        .context("failed to write pcap section header")?;

        writer
            .write_pcapng_block(InterfaceDescriptionBlock {
                linktype: DataLink::IPV4,
                snaplen: 65535,
                options: vec![],
            })
            .context("failed to write pcap interface description")?;

        Ok(Self {
            writer,
            total_tracked_packets: 0,
        })
    }

    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file = fs::File::create(path)
            .with_context(|| format!("failed to open {} for writing", path.display()))?;
        Self::new(file)
    }

    pub fn total_tracked_packets(&self) -> u64 {
        self.total_tracked_packets
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.writer
            .get_mut()
            .flush()
            .context("failed to flush pcap writer")
    }

    pub fn track_packet(&mut self, now: SimTime, packet: &Packet) -> anyhow::Result<()> {
        let tcp_packet = tcp_segment(packet)?;
        let ip_packet = ip_datagram(packet, &tcp_packet)?;

        self.total_tracked_packets += 1;
        self.writer
            .write_pcapng_block(EnhancedPacketBlock {
                interface_id: 0,
                timestamp: correct_timestamp(now.since_start()),
                original_len: ip_packet.len() as u32,
                data: ip_packet.into(),
                options: Vec::new(),
            })
            .context("failed to write packet to pcap")?;

        Ok(())
    }
}

fn tcp_segment(packet: &Packet) -> anyhow::Result<Vec<u8>> {
    let tcp_length = HEADER_BYTES - 20 + packet.payload_len();
    let mut buffer = vec![0; tcp_length];
    let mut tcp_writer =
        MutableTcpPacket::new(&mut buffer).ok_or(anyhow!("buffer too small for tcp header"))?;

    tcp_writer.set_source(packet.source_port);
    tcp_writer.set_destination(packet.destination_port);
    match packet.segment {
        Segment::Data { seq, .. } => {
            // Sequence numbers wrap, just like on a real wire
            tcp_writer.set_sequence(seq as u32);
            tcp_writer.set_flags(TcpFlags::ACK | TcpFlags::PSH);
        }
        Segment::Ack { ack } => {
            tcp_writer.set_acknowledgement(ack as u32);
            tcp_writer.set_flags(TcpFlags::ACK);
        }
    }
    tcp_writer.set_data_offset(5); // We don't use options
    tcp_writer.set_window(u16::MAX);
    let checksum = tcp::ipv4_checksum(
        &tcp_writer.to_immutable(),
        &packet.source,
        &packet.destination,
    );
    tcp_writer.set_checksum(checksum);
    drop(tcp_writer);

    Ok(buffer)
}

fn ip_datagram(packet: &Packet, tcp_packet: &[u8]) -> anyhow::Result<Vec<u8>> {
    let ip_packet_length = 20 + tcp_packet.len();
    let mut buffer = vec![0; ip_packet_length];
    let mut ip_writer =
        MutableIpv4Packet::new(&mut buffer).ok_or(anyhow!("buffer too small for ip header"))?;

    ip_writer.set_version(4);
    ip_writer.set_header_length(5); // We don't use options
    ip_writer.set_dscp(0);
    ip_writer.set_identification(0); // We never fragment
    ip_writer.set_flags(0b010); // We never fragment
    ip_writer.set_fragment_offset(0); // We never fragment
    ip_writer.set_ttl(64);
    ip_writer.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
    ip_writer.set_source(packet.source);
    ip_writer.set_destination(packet.destination);
    // The payload slot is derived from the total length, so it must be set first
    ip_writer.set_total_length(ip_packet_length as u16);
    ip_writer.set_payload(tcp_packet);
    let checksum = ipv4::checksum(&ip_writer.to_immutable());
    ip_writer.set_checksum(checksum);
    let ip_packet_length = ip_writer.packet_size();
    drop(ip_writer);

    buffer.truncate(ip_packet_length);
    Ok(buffer)
}

fn correct_timestamp(d: Duration) -> Duration {
    // Round to the nearest microsecond
    let micros = (d.as_secs_f64() * 1_000_000.0).round();

    // Return the time, three orders of magnitude smaller (the library we are using writes
    // nanoseconds where readers expect microseconds)
    Duration::from_secs_f64(micros / 1_000_000_000.0)
}
