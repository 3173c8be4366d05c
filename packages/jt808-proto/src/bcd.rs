//! bcd.rs — binary-coded-decimal helpers: device identities and timestamps.
//!
//! The protocol carries the device id (the SIM "phone number") as six BCD
//! bytes and timestamps as six BCD bytes in `YYMMDDhhmmss` order. The
//! canonical in-memory form of an identity is a 12-character decimal string
//! with leading zeros preserved.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::Serialize;

/// Canonical device identity: exactly 12 characters.
///
/// Normally 12 decimal digits. When a frame carries bytes that are not valid
/// BCD (any nibble above 9) the identity falls back to the uppercase hex
/// rendering of those bytes — construction never fails.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Build from free-form text: digits are extracted, the last 12 kept,
    /// shorter inputs left-padded with `'0'`.
    pub fn from_digits(input: &str) -> Self {
        let digits: String = input.chars().filter(char::is_ascii_digit).collect();
        let trimmed = if digits.len() > 12 {
            digits[digits.len() - 12..].to_string()
        } else {
            format!("{digits:0>12}")
        };
        Self(trimmed)
    }

    /// Build from the six on-wire BCD bytes.
    pub fn from_bcd(raw: &[u8; 6]) -> Self {
        let mut out = String::with_capacity(12);
        for &b in raw {
            let (hi, lo) = (b >> 4, b & 0x0F);
            if hi > 9 || lo > 9 {
                return Self(hex::encode_upper(raw));
            }
            out.push(char::from(b'0' + hi));
            out.push(char::from(b'0' + lo));
        }
        Self(out)
    }

    /// Pack back into six wire bytes, two digits per byte. Hex-fallback
    /// identities repack their nibbles the same way, so the round trip holds
    /// for them too.
    pub fn to_bcd(&self) -> [u8; 6] {
        let mut out = [0u8; 6];
        let nibbles: Vec<u8> = self
            .0
            .chars()
            .map(|c| c.to_digit(16).unwrap_or(0) as u8)
            .collect();
        for (i, pair) in nibbles.chunks(2).take(6).enumerate() {
            out[i] = (pair[0] << 4) | pair.get(1).copied().unwrap_or(0);
        }
        out
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Timestamps ────────────────────────────────────────────────────────────────

/// Encode a wall-clock time as the protocol's six BCD bytes (`YYMMDDhhmmss`).
pub fn encode_bcd_time(t: NaiveDateTime) -> [u8; 6] {
    let to_bcd = |v: u32| -> u8 { (((v / 10) << 4) | (v % 10)) as u8 };
    [
        to_bcd(t.year() as u32 % 100),
        to_bcd(t.month()),
        to_bcd(t.day()),
        to_bcd(t.hour()),
        to_bcd(t.minute()),
        to_bcd(t.second()),
    ]
}

/// Decode six BCD bytes into a wall-clock time. Years map into 20YY.
pub fn decode_bcd_time(raw: &[u8; 6]) -> Option<NaiveDateTime> {
    let mut fields = [0u32; 6];
    for (i, &b) in raw.iter().enumerate() {
        let (hi, lo) = ((b >> 4) as u32, (b & 0x0F) as u32);
        if hi > 9 || lo > 9 {
            return None;
        }
        fields[i] = hi * 10 + lo;
    }
    NaiveDate::from_ymd_opt(2000 + fields[0] as i32, fields[1], fields[2])?
        .and_hms_opt(fields[3], fields[4], fields[5])
}

/// Render BCD bytes as their digit string (`[0x25, 0x08] → "2508"`).
pub fn bcd_digits(raw: &[u8]) -> String {
    hex::encode(raw)
}

/// Format a device timestamp as `20YY-MM-DDTHH:MM:SSZ`, straight from the
/// digit string the way devices report it (no validation, matching how the
/// raw value is surfaced downstream).
pub fn iso_timestamp(raw: &[u8; 6]) -> String {
    let d = bcd_digits(raw);
    format!(
        "20{}-{}-{}T{}:{}:{}Z",
        &d[0..2],
        &d[2..4],
        &d[4..6],
        &d[6..8],
        &d[8..10],
        &d[10..12]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_pads_and_truncates() {
        assert_eq!(DeviceId::from_digits("123456").as_str(), "000000123456");
        assert_eq!(
            DeviceId::from_digits("99123456789012").as_str(),
            "123456789012"
        );
        assert_eq!(DeviceId::from_digits("sim-123456").as_str(), "000000123456");
    }

    #[test]
    fn device_id_bcd_round_trip() {
        let id = DeviceId::from_digits("123456789012");
        assert_eq!(id.to_bcd(), [0x12, 0x34, 0x56, 0x78, 0x90, 0x12]);
        assert_eq!(DeviceId::from_bcd(&id.to_bcd()), id);
    }

    #[test]
    fn non_bcd_bytes_render_as_hex() {
        let id = DeviceId::from_bcd(&[0x12, 0x34, 0xAB, 0x78, 0x90, 0x12]);
        assert_eq!(id.as_str(), "1234AB789012");
        // and they survive the trip back onto the wire
        assert_eq!(id.to_bcd(), [0x12, 0x34, 0xAB, 0x78, 0x90, 0x12]);
    }

    #[test]
    fn bcd_time_round_trip() {
        let t = NaiveDate::from_ymd_opt(2025, 8, 1)
            .unwrap()
            .and_hms_opt(13, 45, 59)
            .unwrap();
        let raw = encode_bcd_time(t);
        assert_eq!(raw, [0x25, 0x08, 0x01, 0x13, 0x45, 0x59]);
        assert_eq!(decode_bcd_time(&raw), Some(t));
        assert_eq!(iso_timestamp(&raw), "2025-08-01T13:45:59Z");
    }

    #[test]
    fn invalid_bcd_time_is_none() {
        assert_eq!(decode_bcd_time(&[0x25, 0x0A, 0x01, 0x13, 0x45, 0x59]), None);
        assert_eq!(decode_bcd_time(&[0x25, 0x13, 0x01, 0x13, 0x45, 0x59]), None);
    }
}
