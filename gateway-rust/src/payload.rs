//! payload.rs — bus payload shaping.
//!
//! Two output modes: the verbose shape spells every field out; the compact
//! shape (`optimize_payload`) shortens keys and drops everything false or
//! zero to keep constrained subscribers cheap. Flag maps come from the static bit
//! tables — every flag in verbose mode, only raised flags in compact mode.

use chrono::Utc;
use jt808_proto::bcd;
use jt808_proto::body::{
    AdditionalItem, BatchLocation, LocationReport, Registration, ALARM_FLAGS, STATUS_FLAGS,
};
use jt808_proto::DeviceId;
use serde_json::{json, Map, Value};

use crate::gate::DeviceStatus;

fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

// ── Topics ────────────────────────────────────────────────────────────────────

pub fn topic(prefix: &str, device: &DeviceId, kind: &str) -> String {
    format!("{prefix}/{device}/{kind}")
}

pub fn location_topic(template: &str, device: &DeviceId) -> String {
    template.replace("{device_id}", device.as_str())
}

pub fn tracking_topic(prefix: &str) -> String {
    format!("{prefix}/tracking")
}

// ── Flag maps ─────────────────────────────────────────────────────────────────

fn flag_map(word: u32, table: &[(&str, u32)], only_true: bool) -> Map<String, Value> {
    let mut map = Map::new();
    for &(name, mask) in table {
        let set = word & mask != 0;
        if set || !only_true {
            map.insert(name.to_string(), Value::Bool(set));
        }
    }
    map
}

// ── Event payloads ────────────────────────────────────────────────────────────

pub fn location(device: &DeviceId, report: &LocationReport, compact: bool) -> Value {
    let timestamp = bcd::iso_timestamp(&report.timestamp_bcd);
    if compact {
        compact_location(device, report, timestamp)
    } else {
        json!({
            "device_id": device,
            "timestamp": timestamp,
            "event": "location",
            "location": {
                "latitude": report.latitude(),
                "longitude": report.longitude(),
                "altitude": report.altitude_m,
                "speed": report.speed_kmh(),
                "direction": report.direction_deg,
            },
            "status": flag_map(report.status, STATUS_FLAGS, false),
            "alarm": flag_map(report.alarm, ALARM_FLAGS, false),
            "additional": additional_map(&report.additional),
        })
    }
}

fn compact_location(device: &DeviceId, report: &LocationReport, timestamp: String) -> Value {
    let mut loc = Map::new();
    loc.insert("lat".into(), json!(round6(report.latitude())));
    loc.insert("lon".into(), json!(round6(report.longitude())));
    if report.altitude_m != 0 {
        loc.insert("alt".into(), json!(report.altitude_m));
    }
    if report.speed_tenths != 0 {
        loc.insert("spd".into(), json!(report.speed_kmh()));
    }
    if report.direction_deg != 0 {
        loc.insert("dir".into(), json!(report.direction_deg));
    }

    let mut out = Map::new();
    out.insert("d".into(), json!(device));
    out.insert("t".into(), Value::String(timestamp));
    out.insert("loc".into(), Value::Object(loc));

    let st = flag_map(report.status, STATUS_FLAGS, true);
    if !st.is_empty() {
        out.insert("st".into(), Value::Object(st));
    }
    let alm = flag_map(report.alarm, ALARM_FLAGS, true);
    if !alm.is_empty() {
        out.insert("alm".into(), Value::Object(alm));
    }

    let mut add = Map::new();
    for item in &report.additional {
        match item {
            AdditionalItem::Mileage(v) => {
                add.insert("m".into(), json!(f64::from(*v) / 10.0));
            }
            AdditionalItem::Fuel(v) => {
                add.insert("b".into(), json!(f64::from(*v) / 10.0));
            }
            _ => {}
        }
    }
    if !add.is_empty() {
        out.insert("add".into(), Value::Object(add));
    }
    Value::Object(out)
}

fn additional_map(items: &[AdditionalItem]) -> Map<String, Value> {
    let mut map = Map::new();
    for item in items {
        match item {
            AdditionalItem::Mileage(v) => {
                map.insert("mileage".into(), json!(f64::from(*v) / 10.0));
            }
            AdditionalItem::Fuel(v) => {
                map.insert("fuel".into(), json!(f64::from(*v) / 10.0));
            }
            AdditionalItem::SpeedSensor(v) => {
                map.insert("speed_sensor".into(), json!(f64::from(*v) / 10.0));
            }
            AdditionalItem::AltitudeSensor(v) => {
                map.insert("altitude_sensor".into(), json!(v));
            }
            AdditionalItem::Unknown { id, value } => {
                map.insert(format!("id_{id:02X}"), json!(hex::encode(value)));
            }
        }
    }
    map
}

/// Lightweight fan-out for the shared tracking channel.
pub fn tracking(device: &DeviceId, report: &LocationReport) -> Value {
    json!({
        "device_id": device,
        "timestamp": now_iso(),
        "latitude": report.latitude(),
        "longitude": report.longitude(),
        "speed": report.speed_kmh(),
        "direction": report.direction_deg,
    })
}

pub fn status(device: &DeviceId, status: DeviceStatus) -> Value {
    json!({
        "device_id": device,
        "timestamp": now_iso(),
        "status": status.label(),
    })
}

pub fn heartbeat(device: &DeviceId) -> Value {
    json!({
        "device_id": device,
        "timestamp": now_iso(),
        "event": "heartbeat",
    })
}

pub fn registration(device: &DeviceId, reg: &Registration) -> Value {
    json!({
        "device_id": device,
        "timestamp": now_iso(),
        "event": "registration",
        "province_id": reg.province_id,
        "city_id": reg.city_id,
        "manufacturer_id": reg.manufacturer_id,
        "terminal_model": reg.terminal_model,
        "terminal_id": reg.terminal_id,
        "license_plate_color": reg.plate_color,
        "license_plate": reg.license_plate,
    })
}

pub fn authentication(device: &DeviceId, auth_code: &str) -> Value {
    json!({
        "device_id": device,
        "timestamp": now_iso(),
        "event": "authentication",
        "auth_code": auth_code,
    })
}

pub fn logout(device: &DeviceId) -> Value {
    json!({
        "device_id": device,
        "timestamp": now_iso(),
        "event": "logout",
    })
}

pub fn batch_location(device: &DeviceId, batch: &BatchLocation) -> Value {
    let locations: Vec<Value> = batch
        .items
        .iter()
        .map(|item| {
            json!({
                "timestamp": bcd::iso_timestamp(&item.timestamp_bcd),
                "latitude": item.latitude(),
                "longitude": item.longitude(),
                "altitude": item.altitude_m,
                "speed": item.speed_kmh(),
                "direction": item.direction_deg,
            })
        })
        .collect();
    json!({
        "device_id": device,
        "timestamp": now_iso(),
        "event": "batch_location",
        "type": batch.type_id,
        "count": locations.len(),
        "locations": locations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use jt808_proto::body::{alarm_bit, status_bit};

    fn report() -> LocationReport {
        let ts = NaiveDate::from_ymd_opt(2025, 8, 1)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();
        let mut r = LocationReport::from_position(
            14.072_222,
            -87.192_136,
            950,
            12.3,
            270,
            alarm_bit::OVERSPEED,
            status_bit::ACC_ON,
            ts,
        );
        r.additional = vec![AdditionalItem::Mileage(12_345), AdditionalItem::Fuel(420)];
        r
    }

    fn device() -> DeviceId {
        DeviceId::from_digits("123456789012")
    }

    #[test]
    fn verbose_location_shape() {
        let v = location(&device(), &report(), false);
        assert_eq!(v["event"], "location");
        assert_eq!(v["timestamp"], "2025-08-01T12:30:00Z");
        assert_eq!(v["location"]["altitude"], 950);
        assert_eq!(v["location"]["speed"], 12.3);
        assert!(v["location"]["longitude"].as_f64().unwrap() < 0.0);
        // every flag appears, true or not
        assert_eq!(v["status"]["acc_on"], true);
        assert_eq!(v["status"]["location_fixed"], false);
        assert_eq!(v["alarm"]["overspeed"], true);
        assert_eq!(v["additional"]["mileage"], 1234.5);
        assert_eq!(v["additional"]["fuel"], 42.0);
    }

    #[test]
    fn compact_location_shape() {
        let v = location(&device(), &report(), true);
        assert_eq!(v["d"], "123456789012");
        assert_eq!(v["t"], "2025-08-01T12:30:00Z");
        assert!(v["loc"]["lat"].as_f64().unwrap() > 14.0);
        assert_eq!(v["loc"]["alt"], 950);
        // only raised flags survive
        assert_eq!(v["st"]["acc_on"], true);
        assert!(v["st"].get("location_fixed").is_none());
        assert_eq!(v["alm"]["overspeed"], true);
        assert_eq!(v["add"]["m"], 1234.5);
        assert_eq!(v["add"]["b"], 42.0);
        assert!(v.get("event").is_none());
    }

    #[test]
    fn compact_drops_empty_sections() {
        let ts = NaiveDate::from_ymd_opt(2025, 8, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let r = LocationReport::from_position(14.0, 87.0, 0, 0.0, 0, 0, 0, ts);
        let v = location(&device(), &r, true);
        assert!(v.get("st").is_none());
        assert!(v.get("alm").is_none());
        assert!(v.get("add").is_none());
        assert!(v["loc"].get("spd").is_none());
    }

    #[test]
    fn unknown_additional_items_render_as_hex() {
        let mut r = report();
        r.additional = vec![AdditionalItem::Unknown {
            id: 0x30,
            value: bytes::Bytes::from_static(&[0x1F, 0xA0]),
        }];
        let v = location(&device(), &r, false);
        assert_eq!(v["additional"]["id_30"], "1fa0");
    }

    #[test]
    fn topic_shapes() {
        let d = device();
        assert_eq!(
            topic("pettracker", &d, "heartbeat"),
            "pettracker/123456789012/heartbeat"
        );
        assert_eq!(
            location_topic("pettracker/{device_id}/location", &d),
            "pettracker/123456789012/location"
        );
        assert_eq!(tracking_topic("pettracker"), "pettracker/tracking");
    }

    #[test]
    fn status_payload() {
        let v = status(&device(), DeviceStatus::Offline);
        assert_eq!(v["status"], "offline");
        assert_eq!(v["device_id"], "123456789012");
    }
}
