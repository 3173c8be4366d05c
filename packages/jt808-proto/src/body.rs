//! body.rs — typed message bodies.
//!
//! Terminal → platform bodies are parsed from decoded frames; platform →
//! terminal bodies (and the simulator's uplink bodies) are built here. All
//! integers are big-endian on the wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::NaiveDateTime;

use crate::error::BodyError;
use crate::{bcd, geo};

// ── Result codes ──────────────────────────────────────────────────────────────

pub mod result_code {
    pub const SUCCESS: u8 = 0;
    pub const FAILURE: u8 = 1;
    pub const MALFORMED: u8 = 2;
    pub const UNSUPPORTED: u8 = 3;
}

// ── Status / alarm words ──────────────────────────────────────────────────────

pub mod status_bit {
    pub const ACC_ON: u32 = 0x01;
    pub const LOCATION_FIXED: u32 = 0x02;
    pub const LAT_SOUTH: u32 = 0x04;
    pub const LON_WEST: u32 = 0x08;
    pub const IN_OPERATION: u32 = 0x10;
    pub const ENCRYPTED: u32 = 0x20;
}

pub mod alarm_bit {
    pub const EMERGENCY: u32 = 0x01;
    pub const OVERSPEED: u32 = 0x02;
    pub const FATIGUE_DRIVING: u32 = 0x04;
    pub const DANGER_WARNING: u32 = 0x08;
    pub const GNSS_MODULE_FAULT: u32 = 0x10;
    pub const GNSS_ANTENNA_DISCONNECTED: u32 = 0x20;
    pub const GNSS_ANTENNA_SHORT_CIRCUIT: u32 = 0x40;
    pub const MAIN_POWER_UNDERVOLTAGE: u32 = 0x80;
}

/// Name/mask table consulted when shaping status flags for downstream
/// consumers.
pub const STATUS_FLAGS: &[(&str, u32)] = &[
    ("acc_on", status_bit::ACC_ON),
    ("location_fixed", status_bit::LOCATION_FIXED),
    ("lat_south", status_bit::LAT_SOUTH),
    ("lon_west", status_bit::LON_WEST),
    ("in_operation", status_bit::IN_OPERATION),
    ("encrypted", status_bit::ENCRYPTED),
];

pub const ALARM_FLAGS: &[(&str, u32)] = &[
    ("emergency", alarm_bit::EMERGENCY),
    ("overspeed", alarm_bit::OVERSPEED),
    ("fatigue_driving", alarm_bit::FATIGUE_DRIVING),
    ("danger_warning", alarm_bit::DANGER_WARNING),
    ("gnss_module_fault", alarm_bit::GNSS_MODULE_FAULT),
    ("gnss_antenna_disconnected", alarm_bit::GNSS_ANTENNA_DISCONNECTED),
    ("gnss_antenna_short_circuit", alarm_bit::GNSS_ANTENNA_SHORT_CIRCUIT),
    (
        "terminal_main_power_undervoltage",
        alarm_bit::MAIN_POWER_UNDERVOLTAGE,
    ),
];

// ── General response (0x8001) ─────────────────────────────────────────────────

/// Platform general response body: `ack_serial(16) ack_msg_id(16) result(8)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneralResponse {
    pub ack_serial: u16,
    pub ack_msg_id: u16,
    pub result: u8,
}

impl GeneralResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u16(self.ack_serial);
        buf.put_u16(self.ack_msg_id);
        buf.put_u8(self.result);
        buf.freeze()
    }

    /// Some platforms pad the body past five bytes; only the first five
    /// carry meaning.
    pub fn parse(body: &[u8]) -> Result<Self, BodyError> {
        if body.len() < 5 {
            return Err(BodyError::Truncated {
                msg: "general response",
                need: 5,
                have: body.len(),
            });
        }
        let mut buf = &body[..5];
        Ok(Self {
            ack_serial: buf.get_u16(),
            ack_msg_id: buf.get_u16(),
            result: buf.get_u8(),
        })
    }
}

// ── Registration response (0x8100) ────────────────────────────────────────────

/// `ack_serial(16) result(8) auth_len(8) auth…` — the auth code rides only
/// on success and some broken platforms omit it entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResponse {
    pub ack_serial: u16,
    pub result: u8,
    pub auth_code: Option<String>,
}

impl RegistrationResponse {
    pub fn encode(&self) -> Bytes {
        let auth = self.auth_code.as_deref().unwrap_or("");
        let mut buf = BytesMut::with_capacity(4 + auth.len());
        buf.put_u16(self.ack_serial);
        buf.put_u8(self.result);
        buf.put_u8(auth.len() as u8);
        buf.put_slice(auth.as_bytes());
        buf.freeze()
    }

    pub fn parse(body: &[u8]) -> Result<Self, BodyError> {
        if body.len() < 3 {
            return Err(BodyError::Truncated {
                msg: "registration response",
                need: 3,
                have: body.len(),
            });
        }
        let ack_serial = u16::from_be_bytes([body[0], body[1]]);
        let result = body[2];
        let auth_code = if body.len() > 3 {
            let len = body[3] as usize;
            if 4 + len <= body.len() {
                Some(string_or_hex(&body[4..4 + len]))
            } else {
                None
            }
        } else {
            None
        };
        Ok(Self {
            ack_serial,
            result,
            auth_code,
        })
    }
}

// ── Registration (0x0100) ─────────────────────────────────────────────────────

/// Terminal registration body: province/city, fixed-width ASCII identity
/// fields (5/20/7 bytes, NUL padded), plate colour and a length-prefixed
/// plate string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub province_id: u16,
    pub city_id: u16,
    pub manufacturer_id: String,
    pub terminal_model: String,
    pub terminal_id: String,
    pub plate_color: u8,
    pub license_plate: String,
}

impl Registration {
    pub fn encode(&self) -> Bytes {
        let plate = self.license_plate.as_bytes();
        let mut buf = BytesMut::with_capacity(38 + plate.len());
        buf.put_u16(self.province_id);
        buf.put_u16(self.city_id);
        put_fixed_ascii(&mut buf, &self.manufacturer_id, 5);
        put_fixed_ascii(&mut buf, &self.terminal_model, 20);
        put_fixed_ascii(&mut buf, &self.terminal_id, 7);
        buf.put_u8(self.plate_color);
        buf.put_u8(plate.len() as u8);
        buf.put_slice(plate);
        buf.freeze()
    }

    pub fn parse(body: &[u8]) -> Result<Self, BodyError> {
        if body.len() < 37 {
            return Err(BodyError::Truncated {
                msg: "registration",
                need: 37,
                have: body.len(),
            });
        }
        let license_plate = if body.len() > 37 {
            let len = body[37] as usize;
            if 38 + len <= body.len() {
                string_or_hex(&body[38..38 + len])
            } else {
                String::new()
            }
        } else {
            String::new()
        };
        Ok(Self {
            province_id: u16::from_be_bytes([body[0], body[1]]),
            city_id: u16::from_be_bytes([body[2], body[3]]),
            manufacturer_id: fixed_ascii(&body[4..9]),
            terminal_model: fixed_ascii(&body[9..29]),
            terminal_id: fixed_ascii(&body[29..36]),
            plate_color: body[36],
            license_plate,
        })
    }
}

// ── Authentication (0x0102) ───────────────────────────────────────────────────

/// `auth_len(8) auth…`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub auth_code: String,
}

impl AuthRequest {
    pub fn encode(&self) -> Bytes {
        let code = self.auth_code.as_bytes();
        let mut buf = BytesMut::with_capacity(1 + code.len());
        buf.put_u8(code.len() as u8);
        buf.put_slice(code);
        buf.freeze()
    }

    pub fn parse(body: &[u8]) -> Result<Self, BodyError> {
        if body.is_empty() {
            return Err(BodyError::Truncated {
                msg: "authentication",
                need: 1,
                have: 0,
            });
        }
        let len = body[0] as usize;
        if 1 + len > body.len() {
            return Err(BodyError::Truncated {
                msg: "authentication",
                need: 1 + len,
                have: body.len(),
            });
        }
        Ok(Self {
            auth_code: string_or_hex(&body[1..1 + len]),
        })
    }
}

// ── Location report (0x0200) ──────────────────────────────────────────────────

/// Additional-information TLV item trailing the basic location block.
/// Values keep the raw protocol scale; downstream shaping decides units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdditionalItem {
    /// 0x01 — accumulated mileage, 0.1 km units.
    Mileage(u32),
    /// 0x02 — fuel gauge, 0.1 L units (some devices report battery percent).
    Fuel(u16),
    /// 0x03 — speed from the dedicated sensor, 0.1 km/h units.
    SpeedSensor(u16),
    /// 0x04 — altitude sensor, metres.
    AltitudeSensor(u16),
    /// Anything else, preserved verbatim.
    Unknown { id: u8, value: Bytes },
}

impl AdditionalItem {
    fn from_wire(id: u8, value: &[u8]) -> Self {
        match (id, value.len()) {
            (0x01, 4) => Self::Mileage(u32::from_be_bytes([value[0], value[1], value[2], value[3]])),
            (0x02, 2) => Self::Fuel(u16::from_be_bytes([value[0], value[1]])),
            (0x03, 2) => Self::SpeedSensor(u16::from_be_bytes([value[0], value[1]])),
            (0x04, 2) => Self::AltitudeSensor(u16::from_be_bytes([value[0], value[1]])),
            _ => Self::Unknown {
                id,
                value: Bytes::copy_from_slice(value),
            },
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Self::Mileage(v) => {
                buf.put_u8(0x01);
                buf.put_u8(4);
                buf.put_u32(*v);
            }
            Self::Fuel(v) => {
                buf.put_u8(0x02);
                buf.put_u8(2);
                buf.put_u16(*v);
            }
            Self::SpeedSensor(v) => {
                buf.put_u8(0x03);
                buf.put_u8(2);
                buf.put_u16(*v);
            }
            Self::AltitudeSensor(v) => {
                buf.put_u8(0x04);
                buf.put_u8(2);
                buf.put_u16(*v);
            }
            Self::Unknown { id, value } => {
                buf.put_u8(*id);
                buf.put_u8(value.len() as u8);
                buf.put_slice(value);
            }
        }
    }
}

/// Basic location block (28 bytes) plus trailing TLV items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationReport {
    pub alarm: u32,
    pub status: u32,
    pub latitude_dms: u32,
    pub longitude_dms: u32,
    pub altitude_m: u16,
    pub speed_tenths: u16,
    pub direction_deg: u16,
    pub timestamp_bcd: [u8; 6],
    pub additional: Vec<AdditionalItem>,
}

pub const LOCATION_BLOCK_LEN: usize = 28;

impl LocationReport {
    /// Build a report from decimal coordinates; the coordinate signs fold
    /// into the status word's south / west bits.
    #[allow(clippy::too_many_arguments)]
    pub fn from_position(
        lat: f64,
        lon: f64,
        altitude_m: u16,
        speed_kmh: f64,
        direction_deg: u16,
        alarm: u32,
        mut status: u32,
        timestamp: NaiveDateTime,
    ) -> Self {
        if lat < 0.0 {
            status |= status_bit::LAT_SOUTH;
        }
        if lon < 0.0 {
            status |= status_bit::LON_WEST;
        }
        Self {
            alarm,
            status,
            latitude_dms: geo::decimal_to_dms(lat),
            longitude_dms: geo::decimal_to_dms(lon),
            altitude_m,
            speed_tenths: (speed_kmh * 10.0).round().clamp(0.0, f64::from(u16::MAX)) as u16,
            direction_deg: direction_deg % 360,
            timestamp_bcd: bcd::encode_bcd_time(timestamp),
            additional: Vec::new(),
        }
    }

    pub fn parse(body: &[u8]) -> Result<Self, BodyError> {
        let mut report = Self::parse_block(body)?;
        report.additional = parse_additional(&body[LOCATION_BLOCK_LEN..]);
        Ok(report)
    }

    /// Parse only the fixed 28-byte block — the unit of the batch upload
    /// stride, which cannot carry TLV items.
    pub fn parse_block(body: &[u8]) -> Result<Self, BodyError> {
        if body.len() < LOCATION_BLOCK_LEN {
            return Err(BodyError::Truncated {
                msg: "location report",
                need: LOCATION_BLOCK_LEN,
                have: body.len(),
            });
        }
        let mut buf = &body[..LOCATION_BLOCK_LEN];
        let alarm = buf.get_u32();
        let status = buf.get_u32();
        let latitude_dms = buf.get_u32();
        let longitude_dms = buf.get_u32();
        let altitude_m = buf.get_u16();
        let speed_tenths = buf.get_u16();
        let direction_deg = buf.get_u16();
        let mut timestamp_bcd = [0u8; 6];
        buf.copy_to_slice(&mut timestamp_bcd);
        Ok(Self {
            alarm,
            status,
            latitude_dms,
            longitude_dms,
            altitude_m,
            speed_tenths,
            direction_deg,
            timestamp_bcd,
            additional: Vec::new(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(LOCATION_BLOCK_LEN + 8 * self.additional.len());
        self.encode_block(&mut buf);
        for item in &self.additional {
            item.encode_into(&mut buf);
        }
        buf.freeze()
    }

    fn encode_block(&self, buf: &mut BytesMut) {
        buf.put_u32(self.alarm);
        buf.put_u32(self.status);
        buf.put_u32(self.latitude_dms);
        buf.put_u32(self.longitude_dms);
        buf.put_u16(self.altitude_m);
        buf.put_u16(self.speed_tenths);
        buf.put_u16(self.direction_deg);
        buf.put_slice(&self.timestamp_bcd);
    }

    /// Signed decimal latitude (south bit negates).
    pub fn latitude(&self) -> f64 {
        let v = geo::dms_to_decimal(self.latitude_dms);
        if self.status & status_bit::LAT_SOUTH != 0 {
            -v
        } else {
            v
        }
    }

    /// Signed decimal longitude (west bit negates).
    pub fn longitude(&self) -> f64 {
        let v = geo::dms_to_decimal(self.longitude_dms);
        if self.status & status_bit::LON_WEST != 0 {
            -v
        } else {
            v
        }
    }

    pub fn speed_kmh(&self) -> f64 {
        f64::from(self.speed_tenths) / 10.0
    }
}

fn parse_additional(mut rest: &[u8]) -> Vec<AdditionalItem> {
    let mut items = Vec::new();
    while rest.len() >= 2 {
        let id = rest[0];
        let len = rest[1] as usize;
        if rest.len() < 2 + len {
            break;
        }
        items.push(AdditionalItem::from_wire(id, &rest[2..2 + len]));
        rest = &rest[2 + len..];
    }
    items
}

// ── Batch location upload (0x0704) ────────────────────────────────────────────

/// `type(8) count(16)` then `count` location blocks at a fixed 28-byte
/// stride. The protocol gives batch items no length prefix, so TLV items
/// inside them cannot be recognised; a short trailing item ends the parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLocation {
    /// 1 = normal, 2 = supplementary upload.
    pub type_id: u8,
    pub items: Vec<LocationReport>,
}

impl BatchLocation {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3 + self.items.len() * LOCATION_BLOCK_LEN);
        buf.put_u8(self.type_id);
        buf.put_u16(self.items.len() as u16);
        for item in &self.items {
            item.encode_block(&mut buf);
        }
        buf.freeze()
    }

    pub fn parse(body: &[u8]) -> Result<Self, BodyError> {
        if body.len() < 3 {
            return Err(BodyError::Truncated {
                msg: "batch location",
                need: 3,
                have: body.len(),
            });
        }
        let type_id = body[0];
        let count = u16::from_be_bytes([body[1], body[2]]) as usize;
        let mut items = Vec::with_capacity(count.min(64));
        let mut pos = 3;
        for _ in 0..count {
            if pos + LOCATION_BLOCK_LEN > body.len() {
                break;
            }
            items.push(LocationReport::parse_block(&body[pos..pos + LOCATION_BLOCK_LEN])?);
            pos += LOCATION_BLOCK_LEN;
        }
        Ok(Self { type_id, items })
    }
}

// ── String helpers ────────────────────────────────────────────────────────────

/// NUL-trimmed ASCII, falling back to uppercase hex of the raw field.
fn fixed_ascii(raw: &[u8]) -> String {
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    let start = raw[..end].iter().position(|&b| b != 0).unwrap_or(end);
    let trimmed = &raw[start..end];
    match std::str::from_utf8(trimmed) {
        Ok(s) if trimmed.is_ascii() => s.to_string(),
        _ => hex::encode_upper(raw),
    }
}

/// UTF-8, falling back to uppercase hex.
fn string_or_hex(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => hex::encode_upper(raw),
    }
}

fn put_fixed_ascii(buf: &mut BytesMut, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width);
    buf.put_slice(&bytes[..n]);
    for _ in n..width {
        buf.put_u8(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn general_response_round_trip() {
        let r = GeneralResponse {
            ack_serial: 0x1234,
            ack_msg_id: 0x0200,
            result: result_code::SUCCESS,
        };
        let wire = r.encode();
        assert_eq!(&wire[..], &[0x12, 0x34, 0x02, 0x00, 0x00]);
        assert_eq!(GeneralResponse::parse(&wire).unwrap(), r);
        // padded bodies still parse
        let mut padded = wire.to_vec();
        padded.extend_from_slice(&[0xAA, 0xBB]);
        assert_eq!(GeneralResponse::parse(&padded).unwrap(), r);
    }

    #[test]
    fn registration_response_round_trip() {
        let r = RegistrationResponse {
            ack_serial: 7,
            result: result_code::SUCCESS,
            auth_code: Some("123456".into()),
        };
        let wire = r.encode();
        assert_eq!(wire[3], 6);
        assert_eq!(RegistrationResponse::parse(&wire).unwrap(), r);
    }

    #[test]
    fn registration_response_without_auth_code() {
        let parsed = RegistrationResponse::parse(&[0x00, 0x07, 0x00]).unwrap();
        assert_eq!(parsed.auth_code, None);
        // a length byte overrunning the body also yields no code
        let parsed = RegistrationResponse::parse(&[0x00, 0x07, 0x00, 0x09, b'a']).unwrap();
        assert_eq!(parsed.auth_code, None);
    }

    #[test]
    fn registration_round_trip() {
        let r = Registration {
            province_id: 11,
            city_id: 101,
            manufacturer_id: "PTRKR".into(),
            terminal_model: "PT-100".into(),
            terminal_id: "PT00001".into(),
            plate_color: 0,
            license_plate: "TEST123".into(),
        };
        let parsed = Registration::parse(&r.encode()).unwrap();
        assert_eq!(parsed, r);
    }

    #[test]
    fn registration_too_short() {
        assert!(matches!(
            Registration::parse(&[0u8; 20]),
            Err(BodyError::Truncated { msg: "registration", .. })
        ));
    }

    #[test]
    fn auth_round_trip() {
        let a = AuthRequest {
            auth_code: "123456".into(),
        };
        assert_eq!(AuthRequest::parse(&a.encode()).unwrap(), a);
    }

    #[test]
    fn location_round_trip_with_additional_items() {
        let mut report = LocationReport::from_position(
            14.072_222,
            -87.192_136,
            950,
            12.3,
            270,
            alarm_bit::OVERSPEED,
            status_bit::ACC_ON | status_bit::LOCATION_FIXED,
            sample_time(),
        );
        report.additional = vec![
            AdditionalItem::Mileage(12_345),
            AdditionalItem::Fuel(420),
            AdditionalItem::Unknown {
                id: 0x30,
                value: Bytes::from_static(&[0x1F]),
            },
        ];

        let parsed = LocationReport::parse(&report.encode()).unwrap();
        assert_eq!(parsed, report);
        assert!(parsed.longitude() < 0.0, "west bit must negate longitude");
        assert!(parsed.latitude() > 0.0);
        assert_eq!(parsed.speed_kmh(), 12.3);
    }

    #[test]
    fn location_sign_bits() {
        let r = LocationReport::from_position(
            -33.5, 151.2, 0, 0.0, 0, 0, 0, sample_time(),
        );
        assert_ne!(r.status & status_bit::LAT_SOUTH, 0);
        assert_eq!(r.status & status_bit::LON_WEST, 0);
        assert!(r.latitude() < 0.0);
        assert!(r.longitude() > 0.0);
    }

    #[test]
    fn truncated_additional_item_is_dropped() {
        let report = LocationReport::from_position(
            14.0, -87.0, 0, 0.0, 0, 0, 0, sample_time(),
        );
        let mut wire = report.encode().to_vec();
        // item claims 4 value bytes but provides one
        wire.extend_from_slice(&[0x01, 0x04, 0xAA]);
        let parsed = LocationReport::parse(&wire).unwrap();
        assert!(parsed.additional.is_empty());
    }

    #[test]
    fn location_too_short() {
        assert!(matches!(
            LocationReport::parse(&[0u8; 27]),
            Err(BodyError::Truncated { .. })
        ));
    }

    #[test]
    fn batch_round_trip_and_truncation() {
        let item = |lat: f64| {
            LocationReport::from_position(lat, -87.0, 10, 8.0, 90, 0, 0, sample_time())
        };
        let batch = BatchLocation {
            type_id: 1,
            items: vec![item(14.0), item(14.1), item(14.2)],
        };
        let wire = batch.encode();
        assert_eq!(BatchLocation::parse(&wire).unwrap(), batch);

        // cutting the final block mid-way drops it and keeps the rest
        let truncated = BatchLocation::parse(&wire[..wire.len() - 10]).unwrap();
        assert_eq!(truncated.items.len(), 2);
    }

    #[test]
    fn fixed_ascii_falls_back_to_hex() {
        assert_eq!(fixed_ascii(b"ABC\0\0"), "ABC");
        assert_eq!(fixed_ascii(&[0xFF, 0xFE, 0x00]), "FFFE00");
    }
}
