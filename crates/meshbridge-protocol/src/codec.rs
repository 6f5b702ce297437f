//! Envelope codec: key aliasing + MessagePack + zstd.
//!
//! Pipeline on encode: canonicalize values, alias the nested `data` payload
//! with the domain table, alias the top-level envelope keys, pack with
//! MessagePack, compress with zstd. Decode reverses every stage.
//!
//! Both alias tables are frozen wire format: changing them breaks interop
//! with deployed bridges.

use serde_json::{Map, Value};

use crate::envelope::{Envelope, EnvelopeKind, DEFAULT_PRIORITY};
use crate::ProtocolError;

/// Mid-range zstd level: balances CPU cost against ratio on small payloads.
const ZSTD_LEVEL: i32 = 4;

/// Top-level envelope key aliases, applied non-recursively.
const ENVELOPE_ALIASES: &[(&str, &str)] = &[
    ("id", "i"),
    ("type", "t"),
    ("command", "c"),
    ("priority", "p"),
    ("correlation_id", "x"),
    ("data", "d"),
    ("meta", "m"),
];

/// Domain key aliases, applied recursively inside `data`.
const DATA_ALIASES: &[(&str, &str)] = &[
    ("entity_id", "e"),
    ("task_id", "ti"),
    ("object_id", "oi"),
    ("alias", "als"),
    ("type", "t"),
    ("subtype", "st"),
    ("status", "s"),
    ("components", "c"),
    ("telemetry", "tl"),
    ("health", "h"),
    ("battery_percent", "bp"),
    ("latitude", "lat"),
    ("longitude", "lon"),
    ("altitude_m", "alt"),
    ("metadata", "m"),
    ("created_at", "ca"),
    ("updated_at", "ua"),
    ("note", "n"),
    ("reason", "r"),
    ("status_filter", "sf"),
    ("since", "sn"),
    ("fields", "f"),
    ("limit", "l"),
    ("offset", "o"),
    ("cursor", "cur"),
    ("result", "res"),
];

fn lookup(table: &'static [(&'static str, &'static str)], key: &str, encode: bool) -> Option<&'static str> {
    table.iter().find_map(|(long, short)| {
        if encode && *long == key {
            Some(*short)
        } else if !encode && *short == key {
            Some(*long)
        } else {
            None
        }
    })
}

/// Strip fractional seconds from an ISO-8601 timestamp, keeping the
/// timezone suffix. `2026-01-05T03:29:01.433990+00:00` becomes
/// `2026-01-05T03:29:01+00:00`. Returns `None` when nothing changes.
fn normalize_timestamp(value: &str) -> Option<String> {
    let t = value.find('T')?;
    let time = value.get(t + 1..)?;
    if time.len() < 9 {
        return None;
    }
    let hms = &time[..8];
    let valid_hms = hms
        .bytes()
        .enumerate()
        .all(|(i, b)| if i == 2 || i == 5 { b == b':' } else { b.is_ascii_digit() });
    if !valid_hms {
        return None;
    }
    let rest = &time[8..];
    if !rest.starts_with('.') {
        return None;
    }
    let frac_digits = rest[1..].bytes().take_while(|b| b.is_ascii_digit()).count();
    if frac_digits == 0 {
        return None;
    }
    let suffix = &rest[1 + frac_digits..];
    let suffix_ok = suffix.is_empty()
        || suffix == "Z"
        || (suffix.len() == 6 && (suffix.starts_with('+') || suffix.starts_with('-')));
    if !suffix_ok {
        return None;
    }
    Some(format!("{}{}", &value[..t + 9], suffix))
}

/// Timestamp keys (long and aliased forms) whose values get normalized.
fn is_timestamp_key(key: &str) -> bool {
    matches!(key, "created_at" | "updated_at" | "ca" | "ua")
}

fn normalize_value(key: &str, value: Value) -> Value {
    if let Value::String(s) = &value {
        if is_timestamp_key(key) {
            if let Some(normalized) = normalize_timestamp(s) {
                return Value::String(normalized);
            }
        }
    }
    value
}

/// Recursively alias (or un-alias) keys inside a `data` payload.
pub fn alias_payload(value: Value, encode: bool) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, val) in map {
                let val = if encode { normalize_value(&key, val) } else { val };
                let new_key = lookup(DATA_ALIASES, &key, encode)
                    .map(str::to_owned)
                    .unwrap_or(key);
                out.insert(new_key, alias_payload(val, encode));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| alias_payload(item, encode))
                .collect(),
        ),
        other => other,
    }
}

fn envelope_to_wire(envelope: &Envelope) -> Value {
    let mut raw = Map::new();
    raw.insert("id".into(), Value::String(envelope.id.clone()));
    raw.insert("type".into(), Value::String(envelope.kind.as_str().into()));
    if let Some(command) = &envelope.command {
        raw.insert("command".into(), Value::String(command.clone()));
    }
    raw.insert("priority".into(), Value::from(envelope.priority));
    if let Some(correlation_id) = &envelope.correlation_id {
        raw.insert("correlation_id".into(), Value::String(correlation_id.clone()));
    }
    raw.insert("data".into(), alias_payload(envelope.data.clone(), true));
    if !envelope.meta.is_empty() {
        raw.insert("meta".into(), Value::Object(envelope.meta.clone()));
    }

    let mut aliased = Map::with_capacity(raw.len());
    for (key, val) in raw {
        let new_key = lookup(ENVELOPE_ALIASES, &key, true)
            .map(str::to_owned)
            .unwrap_or(key);
        aliased.insert(new_key, val);
    }
    Value::Object(aliased)
}

fn wire_to_envelope(wire: Value) -> Result<Envelope, ProtocolError> {
    let Value::Object(packed) = wire else {
        return Err(ProtocolError::MalformedEnvelope(
            "envelope is not a map".into(),
        ));
    };

    let mut fields = Map::with_capacity(packed.len());
    for (key, val) in packed {
        let new_key = lookup(ENVELOPE_ALIASES, &key, false)
            .map(str::to_owned)
            .unwrap_or(key);
        fields.insert(new_key, val);
    }

    let id = fields
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::MalformedEnvelope("missing id".into()))?
        .to_owned();
    let kind: EnvelopeKind = fields
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::MalformedEnvelope("missing type".into()))?
        .parse()
        .map_err(ProtocolError::MalformedEnvelope)?;
    let command = fields
        .get("command")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let priority = fields
        .get("priority")
        .and_then(Value::as_i64)
        .map(|p| p as i32)
        .unwrap_or(DEFAULT_PRIORITY);
    let correlation_id = fields
        .get("correlation_id")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let data = alias_payload(fields.remove("data").unwrap_or(Value::Null), false);
    let meta = match fields.remove("meta") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    Ok(Envelope {
        id,
        kind,
        command,
        priority,
        correlation_id,
        data,
        meta,
    })
}

/// Encode an envelope to compressed wire bytes.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let wire = envelope_to_wire(envelope);
    let packed = rmp_serde::to_vec(&wire)
        .map_err(|e| ProtocolError::MalformedEnvelope(format!("msgpack encode: {e}")))?;
    zstd::encode_all(&packed[..], ZSTD_LEVEL)
        .map_err(|e| ProtocolError::MalformedEnvelope(format!("zstd encode: {e}")))
}

/// Decode compressed wire bytes back into an envelope.
pub fn decode_envelope(encoded: &[u8]) -> Result<Envelope, ProtocolError> {
    let packed = zstd::decode_all(encoded)
        .map_err(|e| ProtocolError::MalformedEnvelope(format!("zstd decode: {e}")))?;
    let wire: Value = rmp_serde::from_slice(&packed)
        .map_err(|e| ProtocolError::MalformedEnvelope(format!("msgpack decode: {e}")))?;
    wire_to_envelope(wire)
}
