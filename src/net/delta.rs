//! Delta derivation for entity state
//!
//! Builds the add/update/remove payloads sent to room subscribers. Payloads go
//! through a lossy quantization pass before they are wrapped: non-integer
//! numbers in the top level of the payload are truncated to hundredths, which
//! keeps msgpack floats compact-looking and stops sub-centimetre jitter from
//! reaching clients.
//!
//! Only the top level is quantized. Nested objects and arrays pass through
//! untouched.

use serde_json::{Number, Value};

use crate::net::protocol::{EntityPacket, Envelope};
use crate::world::entity::EntityRecord;

/// Truncate a float to two decimal places (`floor(v * 100) / 100`)
///
/// A value that already sits on a hundredth up to float error (`0.29 * 100`
/// is `28.999...`) is kept on that hundredth, so quantizing twice is the same
/// as quantizing once.
pub fn quantize_number(value: f64) -> f64 {
    let scaled = value * 100.0;
    let nearest = scaled.round();

    if (scaled - nearest).abs() <= 4.0 * f64::EPSILON * scaled.abs().max(1.0) {
        nearest / 100.0
    } else {
        scaled.floor() / 100.0
    }
}

fn quantize_field(field: &mut Value) {
    let Value::Number(number) = field else {
        return;
    };

    if !number.is_f64() {
        return;
    }

    if let Some(v) = number.as_f64() {
        if v.fract() != 0.0 {
            if let Some(q) = Number::from_f64(quantize_number(v)) {
                *number = q;
            }
        }
    }
}

/// Quantize the top-level numeric fields of a payload in place
pub fn quantize(payload: &mut Value) {
    match payload {
        Value::Object(map) => map.values_mut().for_each(quantize_field),
        Value::Array(items) => items.iter_mut().for_each(quantize_field),
        _ => {}
    }
}

/// Whether an update payload carries anything worth sending
///
/// Null, empty objects, empty arrays and empty strings are suppressed, as are
/// bare scalars which have no fields to update.
pub fn has_content(payload: &Value) -> bool {
    match payload {
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::String(s) => !s.is_empty(),
        Value::Null | Value::Bool(_) | Value::Number(_) => false,
    }
}

fn packet(record: &EntityRecord, payload: Option<Value>) -> EntityPacket {
    let mut data = payload.unwrap_or(Value::Null);
    quantize(&mut data);
    EntityPacket::new(record.kind.clone(), record.id, data)
}

/// `a` envelope for an entity
pub fn add_delta(record: &EntityRecord) -> Envelope {
    Envelope::add(packet(record, record.entity.add_packet()))
}

/// `r` envelope for an entity
pub fn remove_delta(record: &EntityRecord) -> Envelope {
    Envelope::remove(packet(record, record.entity.remove_packet()))
}

/// Update row for an entity, or `None` if it has nothing to send
pub fn update_row(record: &EntityRecord) -> Option<EntityPacket> {
    let mut data = record.entity.update_packet()?;
    if !has_content(&data) {
        return None;
    }

    quantize(&mut data);
    Some(EntityPacket::new(record.kind.clone(), record.id, data))
}

/// Single `u` envelope for a set of entities, or `None` if no row survives
pub fn update_batch<'a>(records: impl IntoIterator<Item = &'a EntityRecord>) -> Option<Envelope> {
    let rows: Vec<EntityPacket> = records.into_iter().filter_map(update_row).collect();

    if rows.is_empty() {
        None
    } else {
        Some(Envelope::update(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::entity::Entity;
    use serde_json::json;

    struct Probe {
        add: Option<Value>,
        update: Option<Value>,
        remove: Option<Value>,
    }

    impl Entity for Probe {
        fn add_packet(&self) -> Option<Value> {
            self.add.clone()
        }

        fn update_packet(&self) -> Option<Value> {
            self.update.clone()
        }

        fn remove_packet(&self) -> Option<Value> {
            self.remove.clone()
        }
    }

    fn record(add: Option<Value>, update: Option<Value>, remove: Option<Value>) -> EntityRecord {
        EntityRecord::new(4, "probe".to_string(), Box::new(Probe { add, update, remove }))
    }

    #[test]
    fn test_quantize_number() {
        assert_eq!(quantize_number(1.005), 1.0);
        assert_eq!(quantize_number(3.14159), 3.14);
        assert_eq!(quantize_number(-1.234), -1.24);
        assert_eq!(quantize_number(0.295), 0.29);
        assert_eq!(quantize_number(0.29), 0.29);
    }

    #[test]
    fn test_quantize_top_level_only() {
        let mut payload = json!({
            "x": 12.3456,
            "hp": 100,
            "whole": 2.0,
            "name": "ship",
            "nested": { "y": 1.23456 },
            "list": [1.23456]
        });

        quantize(&mut payload);

        assert_eq!(payload["x"], json!(12.34));
        assert_eq!(payload["hp"], json!(100));
        assert_eq!(payload["whole"], json!(2.0));
        assert_eq!(payload["name"], json!("ship"));
        assert_eq!(payload["nested"], json!({ "y": 1.23456 }));
        assert_eq!(payload["list"], json!([1.23456]));
    }

    #[test]
    fn test_quantize_top_level_array() {
        let mut payload = json!([1.999, 7, "s", [0.555]]);
        quantize(&mut payload);
        assert_eq!(payload, json!([1.99, 7, "s", [0.555]]));
    }

    #[test]
    fn test_quantize_idempotent() {
        let samples = [
            json!({ "a": 1.005, "b": -7.125, "c": 123.456, "d": 0.5, "e": 42 }),
            json!({ "x": 99.99, "y": -0.01, "z": 1e-9 }),
            json!([2.718281828, -3.75, 0.125]),
        ];

        for sample in samples {
            let mut once = sample.clone();
            quantize(&mut once);
            let mut twice = once.clone();
            quantize(&mut twice);
            assert_eq!(once, twice, "quantize not idempotent for {}", sample);
        }
    }

    #[test]
    fn test_has_content() {
        assert!(!has_content(&Value::Null));
        assert!(!has_content(&json!({})));
        assert!(!has_content(&json!([])));
        assert!(!has_content(&json!("")));
        assert!(!has_content(&json!(5)));
        assert!(has_content(&json!({ "v": 1 })));
        assert!(has_content(&json!([0])));
    }

    #[test]
    fn test_add_delta_with_payload() {
        let rec = record(Some(json!({ "v": 1.2345 })), None, None);
        let env = add_delta(&rec);

        assert_eq!(env.kind, "a");
        assert_eq!(env.data, json!({ "t": "probe", "id": 4, "d": { "v": 1.23 } }));
    }

    #[test]
    fn test_add_and_remove_default_null() {
        let rec = record(None, None, None);

        assert_eq!(add_delta(&rec).data, json!({ "t": "probe", "id": 4, "d": null }));
        assert_eq!(remove_delta(&rec).data, json!({ "t": "probe", "id": 4, "d": null }));
    }

    #[test]
    fn test_update_row_suppressed() {
        assert!(update_row(&record(None, None, None)).is_none());
        assert!(update_row(&record(None, Some(json!({})), None)).is_none());
        assert!(update_row(&record(None, Some(Value::Null), None)).is_none());
    }

    #[test]
    fn test_update_row_quantized() {
        let row = update_row(&record(None, Some(json!({ "v": 1.005 })), None)).unwrap();
        assert_eq!(row, EntityPacket::new("probe", 4, json!({ "v": 1.0 })));
    }

    #[test]
    fn test_update_batch() {
        let records = vec![
            record(None, Some(json!({ "v": 1 })), None),
            record(None, None, None),
            record(None, Some(json!({ "v": 2 })), None),
        ];

        let env = update_batch(&records).unwrap();
        assert_eq!(env.kind, "u");
        assert_eq!(env.data.as_array().map(Vec::len), Some(2));

        let silent = vec![record(None, None, None)];
        assert!(update_batch(&silent).is_none());
    }
}
