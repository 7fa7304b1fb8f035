//! JSON codec between `Value` and wire payload bytes.
//!
//! Every transport carries the same UTF-8 JSON body produced here; only the
//! framing around it differs per protocol.

use crate::error::{BrokerError, Result};
use crate::value::Value;
use bytes::Bytes;

/// Encodes a value as UTF-8 JSON.
///
/// Map keys are emitted in sorted order (see [`Value`]), so encoding is
/// deterministic: `encode(decode(encode(v))) == encode(v)`.
#[must_use]
pub fn encode(value: &Value) -> Bytes {
    let json: serde_json::Value = value.clone().into();
    // Serializing a tree of JSON-representable values cannot fail.
    Bytes::from(serde_json::to_vec(&json).unwrap_or_default())
}

/// Decodes a JSON payload into a `Value`.
///
/// JSON numbers without a fractional part or exponent normalize to
/// [`Value::Int`]; all others to [`Value::Float`].
///
/// # Errors
///
/// Returns [`BrokerError::MalformedPayload`] when the input is not valid
/// JSON.
pub fn decode(payload: &[u8]) -> Result<Value> {
    let json: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| BrokerError::MalformedPayload(e.to_string()))?;
    Ok(json.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn round_trip(value: &Value) -> Value {
        decode(&encode(value)).unwrap()
    }

    #[test]
    fn test_scalar_round_trips() {
        assert_eq!(round_trip(&Value::Null), Value::Null);
        assert_eq!(round_trip(&Value::from(true)), Value::from(true));
        assert_eq!(round_trip(&Value::from(42i64)), Value::from(42i64));
        assert_eq!(round_trip(&Value::from(1.23456789)), Value::from(1.23456789));
        assert_eq!(
            round_trip(&Value::from("Test String")),
            Value::from("Test String")
        );
    }

    #[test]
    fn test_integer_stays_integer() {
        // `42` must survive as an integer type, not 42.0.
        let decoded = round_trip(&Value::from(42i64));
        assert_eq!(decoded.as_int(), Some(42));
        assert_eq!(decoded.as_float(), None);
    }

    #[test]
    fn test_list_preserves_order() {
        let list = Value::List(vec![
            Value::from("Test String"),
            Value::from(42i64),
            Value::from(1.23456789),
            Value::from(true),
        ]);
        assert_eq!(round_trip(&list), list);
    }

    #[test]
    fn test_map_round_trip() {
        let mut entries = BTreeMap::new();
        entries.insert("SomeString".to_string(), Value::from("Test String"));
        entries.insert("SomeInt".to_string(), Value::from(42i64));
        entries.insert("SomeFloat".to_string(), Value::from(1.23456789));
        entries.insert("SomeBoolean".to_string(), Value::from(true));
        let map = Value::Map(entries);
        assert_eq!(round_trip(&map), map);
    }

    #[test]
    fn test_encode_is_stable() {
        let mut entries = BTreeMap::new();
        entries.insert("b".to_string(), Value::from(2i64));
        entries.insert("a".to_string(), Value::from(1i64));
        let value = Value::Map(entries);

        let first = encode(&value);
        let second = encode(&decode(&first).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode(b"{not json").unwrap_err();
        assert!(matches!(err, BrokerError::MalformedPayload(_)));

        let err = decode(b"").unwrap_err();
        assert!(matches!(err, BrokerError::MalformedPayload(_)));
    }

    #[test]
    fn test_string_content_exact() {
        let tricky = Value::from("line\nbreak \"quoted\" \\ unicode: \u{00e9}");
        assert_eq!(round_trip(&tricky), tricky);
    }
}
