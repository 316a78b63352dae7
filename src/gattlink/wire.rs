//! Gattlink packet wire format (spec §4.E.1), ported field-for-field from
//! `gg_gattlink.c`'s `GG_GATTLINK_PACKET_TYPE_MASK`/
//! `GG_GATTLINK_CONTROL_PACKET_TYPE_*` constants and
//! `Gattlink_SerializeDataPacketHeader`/`Gattlink_ParsePacketHeader`.

use crate::error::{Error, Result};

/// Size of the sliding window over serial numbers (`1 << 5`, spec §4.E).
pub const SN_WINDOW_SIZE: u8 = 1 << 5;
const SN_MASK: u8 = SN_WINDOW_SIZE - 1;

const PACKET_TYPE_MASK: u8 = 0x80;
const CONTROL_SUBTYPE_MASK: u8 = 0x7f;
const HAS_ACK_MASK: u8 = 0x40;
const ACK_SN_MASK: u8 = 0x1f;

pub const CONTROL_SUBTYPE_RESET_REQUEST: u8 = 0;
pub const CONTROL_SUBTYPE_RESET_COMPLETE: u8 = 1;

/// Advance a serial number by one, wrapping modulo [`SN_WINDOW_SIZE`]
/// (spec §4.E: "`next_expected_ack_sn`/`next_data_sn` arithmetic is
/// modulo-32 throughout").
pub fn sn_next(sn: u8) -> u8 {
    (sn + 1) & SN_MASK
}

/// Number of serial numbers from `begin` (inclusive) up to `end`
/// (exclusive), mod [`SN_WINDOW_SIZE`] — the in-flight packet count.
pub fn sn_distance(begin: u8, end: u8) -> u8 {
    (SN_WINDOW_SIZE + (end & SN_MASK) - (begin & SN_MASK)) & SN_MASK
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    ResetRequest,
    ResetComplete {
        min_version: u8,
        max_version: u8,
        max_rx_window: u8,
        max_tx_window: u8,
    },
}

impl ControlPacket {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            ControlPacket::ResetRequest => {
                out.push(PACKET_TYPE_MASK | CONTROL_SUBTYPE_RESET_REQUEST);
            }
            ControlPacket::ResetComplete {
                min_version,
                max_version,
                max_rx_window,
                max_tx_window,
            } => {
                out.push(PACKET_TYPE_MASK | CONTROL_SUBTYPE_RESET_COMPLETE);
                out.push(*min_version);
                out.push(*max_version);
                out.push(*max_rx_window);
                out.push(*max_tx_window);
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<ControlPacket> {
        let first = *data.first().ok_or(Error::InvalidSyntax)?;
        if first & PACKET_TYPE_MASK == 0 {
            return Err(Error::InvalidSyntax);
        }
        match first & CONTROL_SUBTYPE_MASK {
            CONTROL_SUBTYPE_RESET_REQUEST => {
                if data.len() != 1 {
                    return Err(Error::InvalidSyntax);
                }
                Ok(ControlPacket::ResetRequest)
            }
            CONTROL_SUBTYPE_RESET_COMPLETE => {
                if data.len() != 5 {
                    return Err(Error::InvalidSyntax);
                }
                Ok(ControlPacket::ResetComplete {
                    min_version: data[1],
                    max_version: data[2],
                    max_rx_window: data[3],
                    max_tx_window: data[4],
                })
            }
            _ => Err(Error::InvalidSyntax),
        }
    }
}

/// A data packet: an optional cumulative ACK plus an optional payload
/// block (spec §4.E.1). At least one of the two must be present for the
/// packet to be meaningful, but encoding doesn't enforce that — an empty
/// data packet with neither is simply a malformed send the caller
/// shouldn't construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub ack_sn: Option<u8>,
    pub payload: Option<Payload>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub psn: u8,
    pub data: Vec<u8>,
}

impl DataPacket {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut first = 0u8; // top bit 0: data packet
        if let Some(ack_sn) = self.ack_sn {
            first |= HAS_ACK_MASK | (ack_sn & ACK_SN_MASK);
        }
        out.push(first);
        if let Some(payload) = &self.payload {
            out.push(payload.psn & SN_MASK);
            out.extend_from_slice(&payload.data);
        }
    }

    pub fn decode(data: &[u8]) -> Result<DataPacket> {
        let first = *data.first().ok_or(Error::InvalidSyntax)?;
        if first & PACKET_TYPE_MASK != 0 {
            return Err(Error::InvalidSyntax);
        }
        let ack_sn = if first & HAS_ACK_MASK != 0 {
            Some(first & ACK_SN_MASK)
        } else {
            None
        };
        let payload = if data.len() > 1 {
            let psn = data[1] & SN_MASK;
            Some(Payload {
                psn,
                data: data[2..].to_vec(),
            })
        } else {
            None
        };
        Ok(DataPacket { ack_sn, payload })
    }
}

/// True if `first_byte` marks a control packet.
pub fn is_control(first_byte: u8) -> bool {
    first_byte & PACKET_TYPE_MASK != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_request_round_trips() {
        let mut out = Vec::new();
        ControlPacket::ResetRequest.encode(&mut out);
        assert_eq!(out, vec![0x80]);
        assert_eq!(ControlPacket::decode(&out).unwrap(), ControlPacket::ResetRequest);
    }

    #[test]
    fn reset_complete_round_trips() {
        let pkt = ControlPacket::ResetComplete {
            min_version: 0,
            max_version: 0,
            max_rx_window: 16,
            max_tx_window: 16,
        };
        let mut out = Vec::new();
        pkt.encode(&mut out);
        assert_eq!(out.len(), 5);
        assert_eq!(ControlPacket::decode(&out).unwrap(), pkt);
    }

    #[test]
    fn data_packet_pure_ack_round_trips() {
        let pkt = DataPacket { ack_sn: Some(5), payload: None };
        let mut out = Vec::new();
        pkt.encode(&mut out);
        assert_eq!(out, vec![0x40 | 5]);
        assert_eq!(DataPacket::decode(&out).unwrap(), pkt);
    }

    #[test]
    fn data_packet_ack_plus_payload_round_trips() {
        let pkt = DataPacket {
            ack_sn: Some(3),
            payload: Some(Payload { psn: 7, data: vec![1, 2, 3] }),
        };
        let mut out = Vec::new();
        pkt.encode(&mut out);
        assert_eq!(DataPacket::decode(&out).unwrap(), pkt);
    }

    #[test]
    fn data_packet_payload_only_round_trips() {
        let pkt = DataPacket {
            ack_sn: None,
            payload: Some(Payload { psn: 31, data: vec![9] }),
        };
        let mut out = Vec::new();
        pkt.encode(&mut out);
        assert_eq!(out[0], 0);
        assert_eq!(DataPacket::decode(&out).unwrap(), pkt);
    }

    #[test]
    fn sn_distance_wraps_modulo_32() {
        assert_eq!(sn_distance(30, 2), 4);
        assert_eq!(sn_distance(5, 5), 0);
        assert_eq!(sn_next(31), 0);
    }
}
