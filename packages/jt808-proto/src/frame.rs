//! frame.rs — the outer `0x7E` byte-stuffed frame.
//!
//! Wire shape: `0x7E  escaped(header ∥ body ∥ checksum)  0x7E` where the
//! checksum is a single XOR fold over the unescaped `header ∥ body` and the
//! escape substitution is `0x7E → 0x7D 0x02`, `0x7D → 0x7D 0x01`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::bcd::DeviceId;
use crate::error::FrameError;

pub const FRAME_DELIMITER: u8 = 0x7E;
const ESCAPE: u8 = 0x7D;
const ESCAPED_DELIMITER: u8 = 0x02;
const ESCAPED_ESCAPE: u8 = 0x01;

const BODY_LEN_MASK: u16 = 0x03FF;
const ENCRYPTED_BIT: u16 = 0x0400;
const SUBPACKAGE_BIT: u16 = 0x2000;

// msg_id(2) + body_attr(2) + device_id(6) + serial(2) + pkg_info(2) + checksum(1)
const MIN_UNESCAPED_LEN: usize = 13;

/// Sub-package marker: this frame is one slice of a larger logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subpackage {
    pub total_packets: u16,
    pub packet_sequence: u16,
}

/// One decoded (or to-be-encoded) protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub msg_id: u16,
    pub device_id: DeviceId,
    pub serial_no: u16,
    pub package_info: u16,
    pub encrypted: bool,
    pub subpackage: Option<Subpackage>,
    pub body: Bytes,
    /// False only for frames admitted by [`Frame::decode_permissive`] with a
    /// bad checksum; strict decode never produces such a frame.
    pub checksum_ok: bool,
}

impl Frame {
    pub fn new(msg_id: u16, device_id: DeviceId, serial_no: u16, body: Bytes) -> Self {
        Self {
            msg_id,
            device_id,
            serial_no,
            package_info: 0,
            encrypted: false,
            subpackage: None,
            body,
            checksum_ok: true,
        }
    }

    /// The body-attributes word: bits 0–9 body length, bit 10 encryption,
    /// bit 13 sub-package.
    pub fn body_attr(&self) -> u16 {
        let mut attr = self.body.len() as u16 & BODY_LEN_MASK;
        if self.encrypted {
            attr |= ENCRYPTED_BIT;
        }
        if self.subpackage.is_some() {
            attr |= SUBPACKAGE_BIT;
        }
        attr
    }

    pub fn encode(&self) -> Bytes {
        let mut raw = BytesMut::with_capacity(17 + self.body.len());
        raw.put_u16(self.msg_id);
        raw.put_u16(self.body_attr());
        raw.put_slice(&self.device_id.to_bcd());
        raw.put_u16(self.serial_no);
        raw.put_u16(self.package_info);
        if let Some(sp) = self.subpackage {
            raw.put_u16(sp.total_packets);
            raw.put_u16(sp.packet_sequence);
        }
        raw.put_slice(&self.body);
        raw.put_u8(xor_checksum(&raw));

        let escaped = escape(&raw);
        let mut wire = BytesMut::with_capacity(escaped.len() + 2);
        wire.put_u8(FRAME_DELIMITER);
        wire.put_slice(&escaped);
        wire.put_u8(FRAME_DELIMITER);
        wire.freeze()
    }

    /// Strict decode: framing, escaping, minimum header length and checksum
    /// must all hold.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        Self::decode_inner(data, true)
    }

    /// Checksum-tolerant decode for devices with broken checksum
    /// implementations: a mismatch is logged and the frame returned with
    /// `checksum_ok = false`. Every other violation still fails.
    pub fn decode_permissive(data: &[u8]) -> Result<Self, FrameError> {
        Self::decode_inner(data, false)
    }

    fn decode_inner(data: &[u8], strict: bool) -> Result<Self, FrameError> {
        if data.len() < 2 || data[0] != FRAME_DELIMITER || data[data.len() - 1] != FRAME_DELIMITER {
            return Err(FrameError::Framing);
        }
        let unescaped = unescape(&data[1..data.len() - 1])?;
        if unescaped.len() < MIN_UNESCAPED_LEN {
            return Err(FrameError::TooShort(unescaped.len()));
        }

        let (msg_data, tail) = unescaped.split_at(unescaped.len() - 1);
        let expected = xor_checksum(msg_data);
        let actual = tail[0];
        let checksum_ok = expected == actual;
        if !checksum_ok {
            if strict {
                return Err(FrameError::Checksum { expected, actual });
            }
            warn!(expected, actual, "frame checksum mismatch, decoding anyway");
        }

        let mut buf = msg_data;
        let msg_id = buf.get_u16();
        let body_attr = buf.get_u16();
        let mut raw_id = [0u8; 6];
        buf.copy_to_slice(&mut raw_id);
        let device_id = DeviceId::from_bcd(&raw_id);
        let serial_no = buf.get_u16();
        let package_info = buf.get_u16();

        let subpackage = if body_attr & SUBPACKAGE_BIT != 0 {
            if buf.remaining() >= 4 {
                Some(Subpackage {
                    total_packets: buf.get_u16(),
                    packet_sequence: buf.get_u16(),
                })
            } else {
                warn!(msg_id, "sub-package bit set but no sub-package fields");
                None
            }
        } else {
            None
        };

        Ok(Self {
            msg_id,
            device_id,
            serial_no,
            package_info,
            encrypted: body_attr & ENCRYPTED_BIT != 0,
            subpackage,
            body: Bytes::copy_from_slice(buf),
            checksum_ok,
        })
    }
}

/// XOR fold over every byte.
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// Apply the escape substitution to the payload between framing bytes.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    for &b in data {
        match b {
            FRAME_DELIMITER => out.extend_from_slice(&[ESCAPE, ESCAPED_DELIMITER]),
            ESCAPE => out.extend_from_slice(&[ESCAPE, ESCAPED_ESCAPE]),
            _ => out.push(b),
        }
    }
    out
}

/// Undo the escape substitution. An `0x7D` followed by an unknown byte passes
/// through untouched (some devices emit them); an `0x7D` at the very end has
/// lost its partner and is an error.
pub fn unescape(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == ESCAPE {
            match data.get(i + 1) {
                Some(&ESCAPED_DELIMITER) => {
                    out.push(FRAME_DELIMITER);
                    i += 2;
                }
                Some(&ESCAPED_ESCAPE) => {
                    out.push(ESCAPE);
                    i += 2;
                }
                Some(_) => {
                    out.push(data[i]);
                    i += 1;
                }
                None => return Err(FrameError::DanglingEscape),
            }
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg_id;

    fn device() -> DeviceId {
        DeviceId::from_digits("123456789012")
    }

    #[test]
    fn escape_round_trip() {
        let body = [0x00, 0x7E, 0x7D, 0xFF];
        let escaped = escape(&body);
        assert_eq!(escaped, vec![0x00, 0x7D, 0x02, 0x7D, 0x01, 0xFF]);
        assert_eq!(unescape(&escaped).unwrap(), body.to_vec());
    }

    #[test]
    fn escaped_payload_has_no_interior_delimiter() {
        let data: Vec<u8> = (0u8..=255).collect();
        assert!(!escape(&data).contains(&FRAME_DELIMITER));
    }

    #[test]
    fn unescape_passes_unknown_escape_through() {
        assert_eq!(unescape(&[0x7D, 0x7F]).unwrap(), vec![0x7D, 0x7F]);
    }

    #[test]
    fn unescape_rejects_dangling_escape() {
        assert!(matches!(
            unescape(&[0x01, 0x7D]),
            Err(FrameError::DanglingEscape)
        ));
    }

    #[test]
    fn encode_decode_round_trip() {
        let frame = Frame::new(
            msg_id::LOCATION_REPORT,
            device(),
            42,
            Bytes::from_static(&[0x00, 0x7E, 0x7D, 0xFF]),
        );
        let wire = frame.encode();
        assert_eq!(wire.first(), Some(&FRAME_DELIMITER));
        assert_eq!(wire.last(), Some(&FRAME_DELIMITER));

        let decoded = Frame::decode(&wire).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(&decoded.body[..], &[0x00, 0x7E, 0x7D, 0xFF]);
    }

    #[test]
    fn body_attr_carries_length_and_flags() {
        let mut frame = Frame::new(0x0200, device(), 1, Bytes::from_static(&[0u8; 28]));
        assert_eq!(frame.body_attr(), 28);
        frame.subpackage = Some(Subpackage {
            total_packets: 3,
            packet_sequence: 1,
        });
        assert_eq!(frame.body_attr(), 28 | 0x2000);
    }

    #[test]
    fn subpackage_survives_round_trip() {
        let mut frame = Frame::new(0x0200, device(), 7, Bytes::from_static(&[1, 2, 3]));
        frame.subpackage = Some(Subpackage {
            total_packets: 2,
            packet_sequence: 2,
        });
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.subpackage, frame.subpackage);
        assert_eq!(&decoded.body[..], &[1, 2, 3]);
    }

    #[test]
    fn corrupted_byte_fails_checksum() {
        let frame = Frame::new(0x0002, device(), 9, Bytes::new());
        let mut wire = frame.encode().to_vec();
        // flip the low bit of the msg_id high byte; 0x00 ↔ 0x01 never
        // collides with a delimiter or escape byte
        wire[1] ^= 0x01;
        assert!(matches!(
            Frame::decode(&wire),
            Err(FrameError::Checksum { .. })
        ));
    }

    #[test]
    fn permissive_decode_flags_bad_checksum() {
        let frame = Frame::new(0x0002, device(), 9, Bytes::new());
        let mut wire = frame.encode().to_vec();
        wire[1] ^= 0x01;
        let decoded = Frame::decode_permissive(&wire).unwrap();
        assert!(!decoded.checksum_ok);
    }

    #[test]
    fn rejects_missing_delimiters() {
        assert!(matches!(Frame::decode(&[0x01, 0x02]), Err(FrameError::Framing)));
        let frame = Frame::new(0x0002, device(), 1, Bytes::new()).encode();
        assert!(matches!(
            Frame::decode(&frame[..frame.len() - 1]),
            Err(FrameError::Framing)
        ));
    }

    #[test]
    fn rejects_short_header() {
        // valid framing around too few header bytes
        let inner = [0x00u8, 0x02, 0x00, 0x00];
        let checksum = xor_checksum(&inner);
        let mut wire = vec![FRAME_DELIMITER];
        wire.extend_from_slice(&inner);
        wire.push(checksum);
        wire.push(FRAME_DELIMITER);
        assert!(matches!(Frame::decode(&wire), Err(FrameError::TooShort(_))));
    }
}
