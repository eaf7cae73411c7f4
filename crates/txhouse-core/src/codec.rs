//! Record Codec
//!
//! Converts queue message bodies to and from [`Row`]s.
//!
//! ## Wire Format
//!
//! One JSON object per message, keyed by column name, which is what the bulk CSV
//! loader publishes:
//!
//! ```text
//! {"transaction_time":"2019-01-01 00:00:18","merch":"fraud_Rippin","cat_id":"misc_net",
//!  ...,"amount":4.97,"population_city":3495,"target":0}
//! ```
//!
//! ## Decoding Rules
//!
//! - Unknown keys are ignored.
//! - Every column except `target` is required; absent or `null` is malformed.
//! - Text columns accept strings and numbers (numbers keep their JSON spelling).
//! - Float columns accept numbers and numeric strings.
//! - `target` accepts integers, integral floats and numeric strings. Values outside
//!   `0..=255` saturate. Absent, `null` and `NaN` decode to `None`.
//! - Bare `NaN`/`Infinity` tokens emitted by non-strict JSON writers are read as `null`.
//!
//! Every failure is an [`Error::MalformedRecord`] naming the offending column so the
//! consumer can count and skip it.

use crate::error::{Error, Result};
use crate::row::Row;
use bytes::Bytes;
use serde_json::{Map, Value as Json};
use std::borrow::Cow;

/// Field name reported when the message body itself is unusable.
pub const MESSAGE_FIELD: &str = "<message>";

pub fn decode(bytes: &[u8]) -> Result<Row> {
    let body = replace_non_finite_tokens(bytes);
    let object: Map<String, Json> = match serde_json::from_slice(&body) {
        Ok(Json::Object(object)) => object,
        Ok(other) => {
            return Err(Error::malformed(
                MESSAGE_FIELD,
                format!("expected JSON object, found {}", json_kind(&other)),
            ))
        }
        Err(e) => return Err(Error::malformed(MESSAGE_FIELD, e.to_string())),
    };

    Ok(Row {
        transaction_time: text(&object, "transaction_time")?,
        merch: text(&object, "merch")?,
        cat_id: text(&object, "cat_id")?,
        name_1: text(&object, "name_1")?,
        name_2: text(&object, "name_2")?,
        gender: text(&object, "gender")?,
        street: text(&object, "street")?,
        one_city: text(&object, "one_city")?,
        us_state: text(&object, "us_state")?,
        jobs: text(&object, "jobs")?,
        amount: float(&object, "amount")?,
        lat: float(&object, "lat")?,
        lon: float(&object, "lon")?,
        merchant_lat: float(&object, "merchant_lat")?,
        merchant_lon: float(&object, "merchant_lon")?,
        population_city: float(&object, "population_city")?,
        target: target(&object, "target")?,
    })
}

pub fn encode(row: &Row) -> Bytes {
    Bytes::from(serde_json::to_vec(row).unwrap_or_default())
}

fn required<'a>(object: &'a Map<String, Json>, field: &str) -> Result<&'a Json> {
    match object.get(field) {
        None | Some(Json::Null) => Err(Error::malformed(field, "missing required field")),
        Some(value) => Ok(value),
    }
}

fn text(object: &Map<String, Json>, field: &str) -> Result<String> {
    match required(object, field)? {
        Json::String(s) => Ok(s.clone()),
        Json::Number(n) => Ok(n.to_string()),
        other => Err(Error::malformed(
            field,
            format!("expected string, found {}", json_kind(other)),
        )),
    }
}

fn float(object: &Map<String, Json>, field: &str) -> Result<f64> {
    match required(object, field)? {
        Json::Number(n) => n
            .as_f64()
            .ok_or_else(|| Error::malformed(field, format!("number {} out of float range", n))),
        Json::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| Error::malformed(field, format!("expected number, found {:?}", s))),
        other => Err(Error::malformed(
            field,
            format!("expected number, found {}", json_kind(other)),
        )),
    }
}

fn target(object: &Map<String, Json>, field: &str) -> Result<Option<u8>> {
    let numeric = match object.get(field) {
        None | Some(Json::Null) => return Ok(None),
        Some(Json::Number(n)) => {
            if let Some(u) = n.as_u64() {
                return Ok(Some(u.min(u8::MAX as u64) as u8));
            }
            if let Some(i) = n.as_i64() {
                return Ok(Some(i.clamp(0, u8::MAX as i64) as u8));
            }
            n.as_f64()
        }
        Some(Json::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            s.parse::<f64>().ok()
        }
        Some(other) => {
            return Err(Error::malformed(
                field,
                format!("expected integer, found {}", json_kind(other)),
            ))
        }
    };

    match numeric {
        Some(f) if f.is_nan() => Ok(None),
        Some(f) if f.fract() == 0.0 || f.is_infinite() => {
            Ok(Some(f.clamp(0.0, u8::MAX as f64) as u8))
        }
        Some(f) => Err(Error::malformed(
            field,
            format!("expected integer, found {}", f),
        )),
        None => Err(Error::malformed(field, "expected integer")),
    }
}

fn json_kind(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

/// Rewrite bare `NaN`, `Infinity` and `-Infinity` tokens outside string literals to
/// `null`. Borrows the input when no such token can be present.
fn replace_non_finite_tokens(bytes: &[u8]) -> Cow<'_, [u8]> {
    let suspicious = bytes.windows(3).any(|w| w == b"NaN" || w == b"Inf");
    if !suspicious {
        return Cow::Borrowed(bytes);
    }

    const TOKENS: [&[u8]; 3] = [b"-Infinity", b"Infinity", b"NaN"];

    let mut out = Vec::with_capacity(bytes.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    'outer: while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            out.push(b);
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if b == b'"' {
            in_string = true;
        } else {
            for token in TOKENS {
                if bytes[i..].starts_with(token) {
                    out.extend_from_slice(b"null");
                    i += token.len();
                    continue 'outer;
                }
            }
        }
        out.push(b);
        i += 1;
    }
    Cow::Owned(out)
}
