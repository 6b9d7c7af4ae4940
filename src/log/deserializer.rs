//! Record deserialization boundary.
//!
//! Deserializers are pure: no I/O, no retries. Returning `None` marks the
//! record undecodable; the owning source commits its offset and moves on.

use serde_json::Value;

/// Turns raw key/value bytes into the tuple of values a message carries.
pub trait Deserializer: Send + Sync {
    fn deserialize(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        key: Option<&[u8]>,
        value: &[u8],
    ) -> Option<Vec<Value>>;

    /// Field names for the tuples this deserializer produces, in order. Used
    /// by hosts that declare their output schema up front.
    fn output_fields(&self) -> Vec<String>;
}

/// Emits `[key, value]` as UTF-8 strings; the key may be null.
#[derive(Debug, Default)]
pub struct Utf8Deserializer;

impl Deserializer for Utf8Deserializer {
    fn deserialize(
        &self,
        _topic: &str,
        _partition: i32,
        _offset: i64,
        key: Option<&[u8]>,
        value: &[u8],
    ) -> Option<Vec<Value>> {
        let value = std::str::from_utf8(value).ok()?;
        let key = match key {
            Some(bytes) => Value::String(std::str::from_utf8(bytes).ok()?.to_string()),
            None => Value::Null,
        };
        Some(vec![key, Value::String(value.to_string())])
    }

    fn output_fields(&self) -> Vec<String> {
        vec!["key".to_string(), "value".to_string()]
    }
}

/// Emits `[key, value]` where the value bytes must parse as JSON.
#[derive(Debug, Default)]
pub struct JsonDeserializer;

impl Deserializer for JsonDeserializer {
    fn deserialize(
        &self,
        _topic: &str,
        _partition: i32,
        _offset: i64,
        key: Option<&[u8]>,
        value: &[u8],
    ) -> Option<Vec<Value>> {
        let value: Value = serde_json::from_slice(value).ok()?;
        let key = match key {
            Some(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
            None => Value::Null,
        };
        Some(vec![key, value])
    }

    fn output_fields(&self) -> Vec<String> {
        vec!["key".to_string(), "value".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_decodes_key_and_value() {
        let values = Utf8Deserializer
            .deserialize("t", 0, 0, Some(b"k"), b"hello")
            .unwrap();
        assert_eq!(values, vec![Value::from("k"), Value::from("hello")]);
    }

    #[test]
    fn utf8_rejects_invalid_bytes() {
        assert!(Utf8Deserializer
            .deserialize("t", 0, 0, None, &[0xff, 0xfe])
            .is_none());
    }

    #[test]
    fn json_parses_the_value_payload() {
        let values = JsonDeserializer
            .deserialize("t", 0, 0, None, br#"{"n":1}"#)
            .unwrap();
        assert_eq!(values[0], Value::Null);
        assert_eq!(values[1]["n"], 1);
    }
}
