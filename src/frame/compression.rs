//! IPv4/UDP header compression (spec §4.F.2), ported from
//! `GG_Ipv4_CompressHeaders`/`GG_Ipv4_DecompressHeaders` in
//! `gg_ipv4_protocol.c`. Elides header fields that match a per-link
//! default configuration and packs the rest with [`bits`] instead of
//! carrying full 20+8-byte headers over the air.

pub mod bits;

use byteorder::{ByteOrder, NetworkEndian};

use bits::{BitReader, BitWriter};

use super::ipv4::{self, Ipv4Header, UdpHeader};
use crate::error::{Error, Result};

/// Flags(2) + total length(2) + identification(2), always present
/// uncompressed ahead of the bit-packed variable section.
pub const FIXED_HEADER_SIZE: usize = 6;

/// Set in byte 0 bit 7 of every compressed header; the frame assembler
/// checks this bit to decide whether a packet needs decompression.
pub const PACKET_IS_COMPRESSED: u8 = 0x80;

const HAS_IHL: u16 = 0x0001;
const HAS_DSCP: u16 = 0x0002;
const HAS_ECN: u16 = 0x0004;
const HAS_FLAGS: u16 = 0x0008;
const HAS_FRAGMENT_OFFSET: u16 = 0x0010;
const HAS_TTL: u16 = 0x0020;
const PROTOCOL_MASK: u16 = 0x00C0;
const PROTOCOL_IS_TCP: u16 = 0x0000;
const PROTOCOL_IS_UDP: u16 = 0x0040;
const PROTOCOL_IS_ICMP: u16 = 0x0080;
const PROTOCOL_IS_OTHER: u16 = 0x00C0;
const HAS_SRC_ADDRESS: u16 = 0x0100;
const HAS_DST_ADDRESS: u16 = 0x0200;
const UDP_SRC_PORT_MASK: u16 = 0x0C00;
const UDP_SRC_PORT_TABLE_0: u16 = 0x0000;
const UDP_SRC_PORT_TABLE_1: u16 = 0x0400;
const UDP_SRC_PORT_TABLE_2: u16 = 0x0800;
const UDP_SRC_PORT_EXPLICIT: u16 = 0x0C00;
const UDP_DST_PORT_MASK: u16 = 0x3000;
const UDP_DST_PORT_TABLE_0: u16 = 0x0000;
const UDP_DST_PORT_TABLE_1: u16 = 0x1000;
const UDP_DST_PORT_TABLE_2: u16 = 0x2000;
const UDP_DST_PORT_EXPLICIT: u16 = 0x3000;
const UDP_HAS_LENGTH: u16 = 0x4000;

const DEFAULT_IHL: u8 = ipv4::MIN_IHL;
const PORT_TABLE_SIZE: usize = 3;

/// Per-link defaults used to elide fields that would otherwise be
/// repeated on every packet (spec §4.F.2). The stack builder derives one
/// of these per Golden Gate instance from its IP configuration.
#[derive(Debug, Clone, Copy)]
pub struct IpConfig {
    pub default_src_address: u32,
    pub default_dst_address: u32,
    pub udp_src_ports: [u16; PORT_TABLE_SIZE],
    pub udp_dst_ports: [u16; PORT_TABLE_SIZE],
}

impl Default for IpConfig {
    fn default() -> IpConfig {
        IpConfig {
            default_src_address: 0,
            default_dst_address: 0,
            udp_src_ports: [0; PORT_TABLE_SIZE],
            udp_dst_ports: [0; PORT_TABLE_SIZE],
        }
    }
}

/// Addresses to rewrite on an inbound, already-decompressed packet (spec
/// §4.H "optional inbound address remapping"), e.g. NAT-ing a node's
/// on-link address to the hub-assigned address the rest of the stack
/// expects.
#[derive(Debug, Clone, Copy)]
pub struct IpMap {
    pub src_address: u32,
    pub remapped_src_address: u32,
    pub dst_address: u32,
    pub remapped_dst_address: u32,
}

/// Compresses `ip` (and `udp`, if the packet carries one) per the field
/// layout documented in the module doc comment. The caller appends the
/// packet's payload bytes after the returned header.
pub fn compress(ip: &Ipv4Header, udp: Option<&UdpHeader>, config: &IpConfig) -> Vec<u8> {
    let mut flags: u16 = (PACKET_IS_COMPRESSED as u16) << 8;
    let mut bits = BitWriter::new();

    if ip.ihl != DEFAULT_IHL {
        flags |= HAS_IHL;
        bits.write(ip.ihl as u32, 4);
    }
    if ip.dscp != 0 {
        flags |= HAS_DSCP;
        bits.write(ip.dscp as u32, 6);
    }
    if ip.ecn != 0 {
        flags |= HAS_ECN;
        bits.write(ip.ecn as u32, 2);
    }
    if ip.flags != 0 {
        flags |= HAS_FLAGS;
        bits.write(ip.flags as u32, 3);
    }
    if ip.fragment_offset != 0 {
        flags |= HAS_FRAGMENT_OFFSET;
        bits.write(ip.fragment_offset as u32, 13);
    }
    if ip.ttl != 0 {
        flags |= HAS_TTL;
        bits.write(ip.ttl as u32, 8);
    }
    match ip.protocol {
        ipv4::PROTOCOL_TCP => flags |= PROTOCOL_IS_TCP,
        ipv4::PROTOCOL_UDP => flags |= PROTOCOL_IS_UDP,
        ipv4::PROTOCOL_ICMP => flags |= PROTOCOL_IS_ICMP,
        other => {
            flags |= PROTOCOL_IS_OTHER;
            bits.write(other as u32, 8);
        }
    }
    if ip.src_address != config.default_src_address {
        flags |= HAS_SRC_ADDRESS;
        bits.write(ip.src_address, 32);
    }
    if ip.dst_address != config.default_dst_address {
        flags |= HAS_DST_ADDRESS;
        bits.write(ip.dst_address, 32);
    }
    for &byte in &ip.options {
        bits.write(byte as u32, 8);
    }

    let mut udp_payload_size = None;
    if let Some(udp) = udp {
        flags |= encode_port(udp.src_port, &config.udp_src_ports, &mut bits, [
            UDP_SRC_PORT_TABLE_0,
            UDP_SRC_PORT_TABLE_1,
            UDP_SRC_PORT_TABLE_2,
        ], UDP_SRC_PORT_EXPLICIT);
        flags |= encode_port(udp.dst_port, &config.udp_dst_ports, &mut bits, [
            UDP_DST_PORT_TABLE_0,
            UDP_DST_PORT_TABLE_1,
            UDP_DST_PORT_TABLE_2,
        ], UDP_DST_PORT_EXPLICIT);

        let header_bytes = 4 * ip.ihl as u16;
        if header_bytes.saturating_add(udp.length) != ip.total_length {
            flags |= UDP_HAS_LENGTH;
            bits.write(udp.length as u32, 16);
        }
        udp_payload_size = Some(udp.length as usize - ipv4::UDP_HEADER_SIZE);
    }
    let _ = udp_payload_size;

    let variable_bytes = (bits.position_bits() + 7) / 8;
    let compressed_header_size = FIXED_HEADER_SIZE + variable_bytes;
    let header_size = 4 * ip.ihl as usize + if udp.is_some() { ipv4::UDP_HEADER_SIZE } else { 0 };
    let payload_size = ip.total_length as usize - header_size;
    let total_length = compressed_header_size + payload_size;

    let mut out = Vec::with_capacity(compressed_header_size);
    out.push((flags >> 8) as u8);
    out.push(flags as u8);
    out.push((total_length >> 8) as u8);
    out.push(total_length as u8);
    out.push((ip.identification >> 8) as u8);
    out.push(ip.identification as u8);
    out.extend(bits.finish());
    out
}

fn encode_port(
    port: u16,
    table: &[u16; PORT_TABLE_SIZE],
    bits: &mut BitWriter,
    table_flags: [u16; PORT_TABLE_SIZE],
    explicit_flag: u16,
) -> u16 {
    for (slot, &table_port) in table.iter().enumerate() {
        if port == table_port {
            return table_flags[slot];
        }
    }
    bits.write(port as u32, 16);
    explicit_flag
}

/// Decompresses `data` (a buffer produced by [`compress`], payload bytes
/// included). Returns the reconstructed headers and the byte offset in
/// `data` where the payload begins.
pub fn decompress(data: &[u8], config: &IpConfig) -> Result<(Ipv4Header, Option<UdpHeader>, usize)> {
    if data.len() < FIXED_HEADER_SIZE {
        return Err(Error::InvalidFormat);
    }
    let flags = NetworkEndian::read_u16(&data[0..2]);
    let identification = NetworkEndian::read_u16(&data[4..6]);
    let mut bits = BitReader::new(&data[FIXED_HEADER_SIZE..]);

    let ihl = if flags & HAS_IHL != 0 { bits.read(4)? as u8 } else { DEFAULT_IHL };
    if ihl < ipv4::MIN_IHL {
        return Err(Error::InvalidFormat);
    }
    let dscp = if flags & HAS_DSCP != 0 { bits.read(6)? as u8 } else { 0 };
    let ecn = if flags & HAS_ECN != 0 { bits.read(2)? as u8 } else { 0 };
    let ip_flags = if flags & HAS_FLAGS != 0 { bits.read(3)? as u8 } else { 0 };
    let fragment_offset = if flags & HAS_FRAGMENT_OFFSET != 0 { bits.read(13)? as u16 } else { 0 };
    let ttl = if flags & HAS_TTL != 0 { bits.read(8)? as u8 } else { 0 };
    let protocol = match flags & PROTOCOL_MASK {
        PROTOCOL_IS_TCP => ipv4::PROTOCOL_TCP,
        PROTOCOL_IS_UDP => ipv4::PROTOCOL_UDP,
        PROTOCOL_IS_ICMP => ipv4::PROTOCOL_ICMP,
        _ => bits.read(8)? as u8,
    };
    let src_address = if flags & HAS_SRC_ADDRESS != 0 { bits.read(32)? } else { config.default_src_address };
    let dst_address = if flags & HAS_DST_ADDRESS != 0 { bits.read(32)? } else { config.default_dst_address };

    let options_len = 4 * (ihl - ipv4::MIN_IHL) as usize;
    let mut options = Vec::with_capacity(options_len);
    for _ in 0..options_len {
        options.push(bits.read(8)? as u8);
    }

    let udp_header = if protocol == ipv4::PROTOCOL_UDP {
        let src_port = match flags & UDP_SRC_PORT_MASK {
            UDP_SRC_PORT_TABLE_0 => config.udp_src_ports[0],
            UDP_SRC_PORT_TABLE_1 => config.udp_src_ports[1],
            UDP_SRC_PORT_TABLE_2 => config.udp_src_ports[2],
            _ => bits.read(16)? as u16,
        };
        let dst_port = match flags & UDP_DST_PORT_MASK {
            UDP_DST_PORT_TABLE_0 => config.udp_dst_ports[0],
            UDP_DST_PORT_TABLE_1 => config.udp_dst_ports[1],
            UDP_DST_PORT_TABLE_2 => config.udp_dst_ports[2],
            _ => bits.read(16)? as u16,
        };
        let explicit_length = if flags & UDP_HAS_LENGTH != 0 { Some(bits.read(16)? as u16) } else { None };
        Some((src_port, dst_port, explicit_length))
    } else {
        None
    };

    let variable_bytes = (bits.position_bits() + 7) / 8;
    let compressed_header_size = FIXED_HEADER_SIZE + variable_bytes;
    if compressed_header_size > data.len() {
        return Err(Error::InvalidFormat);
    }
    let payload_size = data.len() - compressed_header_size;
    let header_size = 4 * ihl as usize + if udp_header.is_some() { ipv4::UDP_HEADER_SIZE } else { 0 };
    let total_length = (header_size + payload_size) as u16;

    let ip_header = Ipv4Header {
        ihl,
        dscp,
        ecn,
        total_length,
        identification,
        flags: ip_flags,
        fragment_offset,
        ttl,
        protocol,
        checksum: 0,
        src_address,
        dst_address,
        options,
    };

    let udp_header = udp_header.map(|(src_port, dst_port, explicit_length)| {
        let length = explicit_length.unwrap_or_else(|| (payload_size + ipv4::UDP_HEADER_SIZE) as u16);
        UdpHeader { src_port, dst_port, length, checksum: 0 }
    });

    Ok((ip_header, udp_header, compressed_header_size))
}

/// Rewrites the source/destination address of an already-serialized,
/// full-size IPv4 packet in place when it matches `map`, recomputing the
/// IPv4 checksum and zeroing the UDP checksum (if present) so downstream
/// consumers don't need to validate it against the old addresses.
/// Returns whether anything changed.
pub fn remap_addresses(packet: &mut [u8], map: &IpMap) -> bool {
    if packet.len() < ipv4::BASE_HEADER_SIZE {
        return false;
    }
    let mut changed = false;
    if NetworkEndian::read_u32(&packet[12..16]) == map.src_address {
        NetworkEndian::write_u32(&mut packet[12..16], map.remapped_src_address);
        changed = true;
    }
    if NetworkEndian::read_u32(&packet[16..20]) == map.dst_address {
        NetworkEndian::write_u32(&mut packet[16..20], map.remapped_dst_address);
        changed = true;
    }
    if !changed {
        return false;
    }

    let ihl = packet[0] & 0x0F;
    let header_len = 4 * ihl as usize;
    if ihl < ipv4::MIN_IHL || header_len > packet.len() {
        return true;
    }
    packet[10] = 0;
    packet[11] = 0;
    let sum = !ipv4::checksum(&packet[..header_len]);
    NetworkEndian::write_u16(&mut packet[10..12], sum);

    let protocol = packet[9];
    if protocol == ipv4::PROTOCOL_UDP && header_len + ipv4::UDP_HEADER_SIZE <= packet.len() {
        packet[header_len + 6] = 0;
        packet[header_len + 7] = 0;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> IpConfig {
        IpConfig {
            default_src_address: 0x0A00_0001,
            default_dst_address: 0x0A00_0002,
            udp_src_ports: [12345, 0, 0],
            udp_dst_ports: [53, 5683, 0],
        }
    }

    #[test]
    fn elided_fields_decompress_back_to_config_defaults() {
        let config = sample_config();
        let ip = Ipv4Header {
            ihl: 5,
            dscp: 0,
            ecn: 0,
            total_length: 20 + 8 + 4,
            identification: 0xBEEF,
            flags: 0,
            fragment_offset: 0,
            ttl: 0,
            protocol: ipv4::PROTOCOL_UDP,
            checksum: 0,
            src_address: config.default_src_address,
            dst_address: config.default_dst_address,
            options: vec![],
        };
        let udp = UdpHeader { src_port: 12345, dst_port: 53, length: 8 + 4, checksum: 0 };

        let mut compressed = compress(&ip, Some(&udp), &config);
        compressed.extend_from_slice(b"ping");

        let (decompressed_ip, decompressed_udp, offset) = decompress(&compressed, &config).unwrap();
        assert_eq!(decompressed_ip.src_address, config.default_src_address);
        assert_eq!(decompressed_ip.dst_address, config.default_dst_address);
        assert_eq!(decompressed_ip.ttl, 0);
        let udp = decompressed_udp.unwrap();
        assert_eq!(udp.src_port, 12345);
        assert_eq!(udp.dst_port, 53);
        assert_eq!(&compressed[offset..], b"ping");
    }

    #[test]
    fn non_default_fields_are_carried_explicitly() {
        let config = sample_config();
        let ip = Ipv4Header {
            ihl: 5,
            dscp: 0,
            ecn: 0,
            total_length: 20 + 8 + 2,
            identification: 7,
            flags: 0b010,
            fragment_offset: 0,
            ttl: 42,
            protocol: ipv4::PROTOCOL_UDP,
            checksum: 0,
            src_address: 0x0B0B_0B0B,
            dst_address: 0x0C0C_0C0C,
            options: vec![],
        };
        let udp = UdpHeader { src_port: 9999, dst_port: 9998, length: 8 + 2, checksum: 0 };
        let mut compressed = compress(&ip, Some(&udp), &config);
        compressed.extend_from_slice(b"hi");

        let (decompressed_ip, decompressed_udp, offset) = decompress(&compressed, &config).unwrap();
        assert_eq!(decompressed_ip.ttl, 42);
        assert_eq!(decompressed_ip.flags, 0b010);
        assert_eq!(decompressed_ip.src_address, 0x0B0B_0B0B);
        assert_eq!(decompressed_ip.dst_address, 0x0C0C_0C0C);
        assert_eq!(decompressed_udp.unwrap().src_port, 9999);
        assert_eq!(&compressed[offset..], b"hi");
    }

    #[test]
    fn non_udp_packet_has_no_udp_header() {
        let config = sample_config();
        let ip = Ipv4Header {
            ihl: 5,
            dscp: 0,
            ecn: 0,
            total_length: 24,
            identification: 1,
            flags: 0,
            fragment_offset: 0,
            ttl: 64,
            protocol: ipv4::PROTOCOL_ICMP,
            checksum: 0,
            src_address: config.default_src_address,
            dst_address: config.default_dst_address,
            options: vec![],
        };
        let mut compressed = compress(&ip, None, &config);
        compressed.extend_from_slice(b"abcd");
        let (_, udp, _) = decompress(&compressed, &config).unwrap();
        assert!(udp.is_none());
    }

    #[test]
    fn truncated_input_is_invalid_format() {
        let config = sample_config();
        assert_eq!(decompress(&[0x80, 0x00, 0x00], &config), Err(Error::InvalidFormat));
    }

    #[test]
    fn remap_rewrites_matching_addresses_and_zeroes_udp_checksum() {
        let ip = Ipv4Header {
            ihl: 5,
            dscp: 0,
            ecn: 0,
            total_length: 28,
            identification: 0,
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
        packet.extend_from_slice(&UdpHeader { src_port: 1, dst_port: 2, length: 8, checksum: 0xABCD }.serialize());

        let map = IpMap {
            src_address: 0x0A00_0001,
            remapped_src_address: 0x0A00_0099,
            dst_address: 0x0A00_0002,
            remapped_dst_address: 0x0A00_0098,
        };
        assert!(remap_addresses(&mut packet, &map));
        assert_eq!(NetworkEndian::read_u32(&packet[12..16]), 0x0A00_0099);
        assert_eq!(NetworkEndian::read_u32(&packet[16..20]), 0x0A00_0098);
        assert_eq!(packet[26], 0);
        assert_eq!(packet[27], 0);
    }

    #[test]
    fn remap_is_a_no_op_when_addresses_do_not_match() {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        let map = IpMap {
            src_address: 0x0A00_0001,
            remapped_src_address: 0x0A00_0099,
            dst_address: 0x0A00_0002,
            remapped_dst_address: 0x0A00_0098,
        };
        assert!(!remap_addresses(&mut packet, &map));
    }
}
