//! IPv4 frame assembly/serialization over a byte stream (spec §4.F),
//! grounded on `GG_Ipv4FrameAssembler`/`GG_Ipv4FrameSerializer` in
//! `gg_ipv4_protocol.c`. Packets arrive length-prefixed (bytes 2..3 of
//! the header, compressed or not, both carry a big-endian total length)
//! over a reliable, in-order byte stream such as a Gattlink session; this
//! module turns that stream back into discrete IPv4 datagrams and back.

pub mod compression;
pub mod ipv4;

use byteorder::{ByteOrder, NetworkEndian};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use compression::{IpConfig, IpMap};
use ipv4::{Ipv4Header, UdpHeader};

/// Bytes needed before the declared total length (at offset 2..3) can be
/// read back out of the reassembly buffer.
const MIN_PARTIAL_HEADER_SIZE: usize = 4;

/// Reassembles a byte stream into discrete IPv4 datagrams (spec §4.F.1).
///
/// The API is pull-style: the caller repeatedly asks for a scratch
/// region with [`feed_buffer`](Assembler::feed_buffer), fills some or
/// all of it from the byte stream, then reports how much it actually
/// wrote with [`feed`](Assembler::feed). `feed` returns a completed
/// frame once enough bytes have accumulated.
pub struct Assembler {
    max_packet_size: usize,
    buffer: Vec<u8>,
    /// Bytes still to be discarded because a declared length exceeded
    /// `max_packet_size`.
    skip: usize,
    payload_size: usize,
    packet_size: usize,
    enable_decompression: bool,
    ip_config: IpConfig,
    ip_map: Option<IpMap>,
}

impl Assembler {
    pub fn new(max_packet_size: usize) -> Assembler {
        Assembler {
            max_packet_size,
            buffer: vec![0u8; max_packet_size],
            skip: 0,
            payload_size: 0,
            packet_size: 0,
            enable_decompression: false,
            ip_config: IpConfig::default(),
            ip_map: None,
        }
    }

    pub fn set_decompression(&mut self, enabled: bool, ip_config: IpConfig) {
        self.enable_decompression = enabled;
        self.ip_config = ip_config;
    }

    pub fn set_address_remapping(&mut self, ip_map: Option<IpMap>) {
        self.ip_map = ip_map;
    }

    /// Discards any partially-accumulated packet, e.g. after the
    /// underlying byte stream reconnects and framing may have desynced.
    pub fn reset(&mut self) {
        self.skip = 0;
        self.payload_size = 0;
        self.packet_size = 0;
    }

    /// Returns a scratch region to fill with the next bytes off the wire.
    /// Its length bounds how much the caller may write before calling
    /// [`feed`](Assembler::feed).
    pub fn feed_buffer(&mut self) -> &mut [u8] {
        if self.skip > 0 {
            let n = self.skip.min(self.buffer.len());
            return &mut self.buffer[..n];
        }
        let limit = if self.packet_size == 0 { MIN_PARTIAL_HEADER_SIZE } else { self.packet_size };
        &mut self.buffer[self.payload_size..limit]
    }

    /// Reports that `amount` bytes (`<= feed_buffer().len()`) were
    /// written into the region last returned by
    /// [`feed_buffer`](Assembler::feed_buffer). Returns the number of
    /// bytes consumed and, once a full frame has accumulated, the
    /// decoded packet.
    pub fn feed(&mut self, amount: usize) -> Result<(usize, Option<Buffer>)> {
        if self.skip > 0 {
            let consumed = amount.min(self.skip);
            self.skip -= consumed;
            return Ok((consumed, None));
        }

        self.payload_size += amount;

        if self.packet_size == 0 {
            if self.payload_size < MIN_PARTIAL_HEADER_SIZE {
                return Ok((amount, None));
            }
            let declared = NetworkEndian::read_u16(&self.buffer[2..4]) as usize;
            if declared < MIN_PARTIAL_HEADER_SIZE {
                log::warn!("frame assembler: declared length {declared} is not a valid packet, resetting");
                self.payload_size = 0;
                self.packet_size = 0;
                return Err(Error::InvalidSyntax);
            }
            if declared > self.buffer.len() {
                log::warn!(
                    "frame assembler: declared length {} exceeds max packet size {}, discarding",
                    declared,
                    self.buffer.len()
                );
                self.skip = declared - self.payload_size;
                self.payload_size = 0;
                return Ok((amount, None));
            }
            self.packet_size = declared;
        }

        if self.payload_size < self.packet_size {
            return Ok((amount, None));
        }

        let frame = self.emit_packet()?;
        self.payload_size = 0;
        self.packet_size = 0;
        Ok((amount, Some(frame)))
    }

    fn emit_packet(&self) -> Result<Buffer> {
        let raw = &self.buffer[..self.packet_size];
        let mut packet = if raw[0] & compression::PACKET_IS_COMPRESSED != 0 {
            if !self.enable_decompression {
                return Err(Error::NotSupported);
            }
            decompress_packet(raw, &self.ip_config)?
        } else {
            raw.to_vec()
        };
        if let Some(map) = &self.ip_map {
            compression::remap_addresses(&mut packet, map);
        }
        Ok(Buffer::copy_from_slice(&packet))
    }
}

fn decompress_packet(raw: &[u8], ip_config: &IpConfig) -> Result<Vec<u8>> {
    let (ip_header, udp_header, compressed_header_size) = compression::decompress(raw, ip_config)?;
    let mut out = ip_header.serialize(true)?;
    if let Some(udp) = &udp_header {
        out.extend_from_slice(&udp.serialize());
    }
    out.extend_from_slice(&raw[compressed_header_size..]);
    Ok(out)
}

/// Serializes full-size IPv4 datagrams for the wire, optionally applying
/// header compression (spec §4.F.2).
pub struct Serializer {
    enable_compression: bool,
    ip_config: IpConfig,
}

impl Serializer {
    pub fn new(enable_compression: bool, ip_config: IpConfig) -> Serializer {
        Serializer { enable_compression, ip_config }
    }

    /// `packet` must be a complete, full-size IPv4 datagram (as produced
    /// by a network interface element). Returns the bytes to hand to the
    /// underlying byte stream.
    pub fn serialize(&self, packet: &[u8]) -> Result<Vec<u8>> {
        if !self.enable_compression {
            return Ok(packet.to_vec());
        }
        let ip_header = Ipv4Header::parse(packet)?;
        let header_size = 4 * ip_header.ihl as usize;
        let udp_header = if ip_header.protocol == ipv4::PROTOCOL_UDP {
            Some(UdpHeader::parse(packet.get(header_size..).ok_or(Error::InvalidFormat)?)?)
        } else {
            None
        };
        let payload_start = header_size + if udp_header.is_some() { ipv4::UDP_HEADER_SIZE } else { 0 };
        let mut out = compression::compress(&ip_header, udp_header.as_ref(), &self.ip_config);
        out.extend_from_slice(packet.get(payload_start..).ok_or(Error::InvalidFormat)?);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Vec<u8> {
        let ip = Ipv4Header {
            ihl: 5,
            dscp: 0,
            ecn: 0,
            total_length: 20 + 8 + 4,
            identification: 1,
            flags: 0,
            fragment_offset: 0,
            ttl: 64,
            protocol: ipv4::PROTOCOL_UDP,
            checksum: 0,
            src_address: 0x0A00_0001,
            dst_address: 0x0A00_0002,
            options: vec![],
        };
        let mut packet = ip.serialize(true).unwrap();
        packet.extend_from_slice(&UdpHeader { src_port: 1234, dst_port: 53, length: 12, checksum: 0 }.serialize());
        packet.extend_from_slice(b"ping");
        packet
    }

    fn feed_all(assembler: &mut Assembler, bytes: &[u8]) -> Option<Buffer> {
        let mut offset = 0;
        while offset < bytes.len() {
            let chunk_len;
            let mut result = None;
            {
                let buf = assembler.feed_buffer();
                chunk_len = buf.len().min(bytes.len() - offset);
                buf[..chunk_len].copy_from_slice(&bytes[offset..offset + chunk_len]);
            }
            let (consumed, frame) = assembler.feed(chunk_len).unwrap();
            offset += consumed;
            if frame.is_some() {
                result = frame;
            }
            if result.is_some() {
                return result;
            }
        }
        None
    }

    #[test]
    fn assembler_reassembles_an_uncompressed_packet_fed_across_multiple_calls() {
        // the header-first protocol forces at least two feed() calls: one
        // to gather the 4-byte length prefix, one or more for the rest.
        let packet = sample_packet();
        let mut assembler = Assembler::new(256);
        let frame = feed_all(&mut assembler, &packet).expect("a full packet should have been emitted");
        assert_eq!(&*frame.data(), &packet[..]);
    }

    #[test]
    fn assembler_decompresses_a_compressed_packet_when_enabled() {
        let config = IpConfig {
            default_src_address: 0x0A00_0001,
            default_dst_address: 0x0A00_0002,
            udp_src_ports: [1234, 0, 0],
            udp_dst_ports: [53, 0, 0],
        };
        let ip = Ipv4Header {
            ihl: 5,
            dscp: 0,
            ecn: 0,
            total_length: 32,
            identification: 9,
            flags: 0,
            fragment_offset: 0,
            ttl: 0,
            protocol: ipv4::PROTOCOL_UDP,
            checksum: 0,
            src_address: config.default_src_address,
            dst_address: config.default_dst_address,
            options: vec![],
        };
        let udp = UdpHeader { src_port: 1234, dst_port: 53, length: 12, checksum: 0 };
        let mut compressed = compression::compress(&ip, Some(&udp), &config);
        compressed.extend_from_slice(b"ping");

        let mut assembler = Assembler::new(256);
        assembler.set_decompression(true, config);
        let frame = feed_all(&mut assembler, &compressed).expect("frame should complete");
        let decompressed = Ipv4Header::parse(&frame.data()).unwrap();
        assert_eq!(decompressed.src_address, config.default_src_address);
        assert_eq!(&frame.data()[28..], b"ping");
    }

    #[test]
    fn assembler_rejects_compressed_packet_when_decompression_disabled() {
        let config = IpConfig::default();
        let ip = Ipv4Header {
            ihl: 5,
            dscp: 0,
            ecn: 0,
            total_length: 24,
            identification: 0,
            flags: 0,
            fragment_offset: 0,
            ttl: 0,
            protocol: ipv4::PROTOCOL_ICMP,
            checksum: 0,
            src_address: 0,
            dst_address: 0,
            options: vec![],
        };
        let mut compressed = compression::compress(&ip, None, &config);
        compressed.extend_from_slice(b"abcd");

        let mut assembler = Assembler::new(256);
        let mut offset = 0;
        let mut result = Ok((0, None));
        while offset < compressed.len() {
            let chunk_len;
            {
                let buf = assembler.feed_buffer();
                chunk_len = buf.len().min(compressed.len() - offset);
                buf[..chunk_len].copy_from_slice(&compressed[offset..offset + chunk_len]);
            }
            result = assembler.feed(chunk_len);
            match &result {
                Ok((consumed, _)) => offset += consumed,
                Err(_) => break,
            }
        }
        assert!(matches!(result, Err(Error::NotSupported)));
    }

    #[test]
    fn reset_discards_a_partially_fed_packet() {
        let packet = sample_packet();
        let mut assembler = Assembler::new(256);
        {
            let buf = assembler.feed_buffer();
            let n = buf.len().min(4);
            buf[..n].copy_from_slice(&packet[..n]);
        }
        let (_, frame) = assembler.feed(4).unwrap();
        assert!(frame.is_none());
        assembler.reset();
        assert_eq!(assembler.feed_buffer().len(), MIN_PARTIAL_HEADER_SIZE);
    }

    #[test]
    fn declared_length_below_minimum_header_is_invalid_syntax() {
        let mut assembler = Assembler::new(256);
        let buf = assembler.feed_buffer();
        buf.copy_from_slice(&[0x45, 0x00, 0x00, 0x02]);
        assert!(matches!(assembler.feed(4), Err(Error::InvalidSyntax)));
    }

    #[test]
    fn assembler_discards_packets_declared_larger_than_capacity() {
        let mut assembler = Assembler::new(16);
        // declares a 1000-byte packet, which exceeds the 16-byte capacity.
        let header = [0x45u8, 0x00, 0x03, 0xE8];
        let (consumed, frame) = assembler.feed_buffer_and_feed(&header);
        assert_eq!(consumed, 4);
        assert!(frame.is_none());

        let next = sample_packet();
        let frame = feed_all(&mut assembler, &next[..4]);
        assert!(frame.is_none());
    }

    impl Assembler {
        fn feed_buffer_and_feed(&mut self, bytes: &[u8]) -> (usize, Option<Buffer>) {
            let buf = self.feed_buffer();
            let n = buf.len().min(bytes.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            self.feed(n).unwrap()
        }
    }

    #[test]
    fn serializer_passes_through_when_compression_disabled() {
        let packet = sample_packet();
        let serializer = Serializer::new(false, IpConfig::default());
        assert_eq!(serializer.serialize(&packet).unwrap(), packet);
    }

    #[test]
    fn serializer_then_assembler_round_trips_a_compressed_packet() {
        let config = IpConfig {
            default_src_address: 0x0A00_0001,
            default_dst_address: 0x0A00_0002,
            udp_src_ports: [1234, 0, 0],
            udp_dst_ports: [53, 0, 0],
        };
        let packet = sample_packet();
        let serializer = Serializer::new(true, config);
        let wire = serializer.serialize(&packet).unwrap();
        assert!(wire[0] & compression::PACKET_IS_COMPRESSED != 0);

        let mut assembler = Assembler::new(256);
        assembler.set_decompression(true, config);
        let frame = feed_all(&mut assembler, &wire).expect("frame should complete");
        assert_eq!(&*frame.data(), &packet[..]);
    }
}
