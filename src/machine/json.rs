//! Typed JSON codec for VM values.
//!
//! Metadata written by scripts and account metadata read back by scripts use a
//! `{"type": ..., "value": ...}` envelope so the value's VM type survives storage.
//! Variables supplied by callers use the bare `value` part, typed by the program.

use std::str::FromStr;

use num_bigint::BigInt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use crate::core::account::is_valid_address;
use crate::core::asset::Asset;
use crate::machine::monetary::MonetaryInt;
use crate::machine::value::{Monetary, Portion, Type, Value};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JsonError {
    #[error("expected {expected}, got {got}")]
    Malformed { expected: Type, got: String },

    #[error("invalid account address '{0}'")]
    InvalidAccount(String),

    #[error("invalid asset '{0}'")]
    InvalidAsset(String),

    #[error("{0} values cannot be encoded")]
    Unsupported(Type),

    #[error("invalid envelope: {0}")]
    Envelope(String),
}

/// `{type, value}` envelope as stored in metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueJson {
    #[serde(rename = "type")]
    pub typ: Type,
    pub value: JsonValue,
}

/// Encodes the bare value part.
pub fn encode_bare(value: &Value) -> Result<JsonValue, JsonError> {
    Ok(match value {
        Value::Account(a) => JsonValue::String(a.clone()),
        Value::Asset(a) => JsonValue::String(a.to_string()),
        Value::Number(n) => serde_json::to_value(MonetaryInt::from(n.clone()))
            .map_err(|e| JsonError::Envelope(e.to_string()))?,
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Monetary(m) => json!({
            "asset": m.asset.to_string(),
            "amount": serde_json::to_value(&m.amount).map_err(|e| JsonError::Envelope(e.to_string()))?,
        }),
        Value::Portion(p) => JsonValue::String(p.to_string()),
        Value::Allotment(_) => return Err(JsonError::Unsupported(Type::Allotment)),
        Value::Funding(_) => return Err(JsonError::Unsupported(Type::Funding)),
    })
}

/// Decodes a bare value of the given type.
pub fn decode_bare(typ: Type, raw: &JsonValue) -> Result<Value, JsonError> {
    let malformed = || JsonError::Malformed {
        expected: typ,
        got: raw.to_string(),
    };
    match typ {
        Type::Account => {
            let address = raw.as_str().ok_or_else(malformed)?;
            if !is_valid_address(address) {
                return Err(JsonError::InvalidAccount(address.to_string()));
            }
            Ok(Value::Account(address.to_string()))
        }
        Type::Asset => {
            let name = raw.as_str().ok_or_else(malformed)?;
            Asset::parse(name)
                .map(Value::Asset)
                .map_err(|_| JsonError::InvalidAsset(name.to_string()))
        }
        Type::Number => decode_integer(raw).map(Value::Number).ok_or_else(malformed),
        Type::String => raw
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(malformed),
        Type::Monetary => {
            let object = raw.as_object().ok_or_else(malformed)?;
            let asset_name = object.get("asset").and_then(JsonValue::as_str).ok_or_else(malformed)?;
            let asset = Asset::parse(asset_name).map_err(|_| JsonError::InvalidAsset(asset_name.to_string()))?;
            let amount = object.get("amount").and_then(decode_integer).ok_or_else(malformed)?;
            let amount = MonetaryInt::from(amount);
            if amount.is_negative() {
                return Err(malformed());
            }
            Ok(Value::Monetary(Monetary::new(asset, amount)))
        }
        Type::Portion => {
            let text = raw.as_str().ok_or_else(malformed)?;
            Portion::parse(text).map(Value::Portion).map_err(|_| malformed())
        }
        Type::Allotment | Type::Funding => Err(JsonError::Unsupported(typ)),
    }
}

fn decode_integer(raw: &JsonValue) -> Option<BigInt> {
    match raw {
        JsonValue::Number(n) => n
            .as_i64()
            .map(BigInt::from)
            .or_else(|| n.as_u64().map(BigInt::from)),
        JsonValue::String(s) => BigInt::from_str(s).ok(),
        _ => None,
    }
}

/// Encodes a value into its `{type, value}` envelope.
pub fn encode(value: &Value) -> Result<JsonValue, JsonError> {
    let envelope = ValueJson {
        typ: value.get_type(),
        value: encode_bare(value)?,
    };
    serde_json::to_value(envelope).map_err(|e| JsonError::Envelope(e.to_string()))
}

/// Decodes a `{type, value}` envelope.
pub fn decode(raw: &JsonValue) -> Result<Value, JsonError> {
    let envelope: ValueJson =
        serde_json::from_value(raw.clone()).map_err(|e| JsonError::Envelope(e.to_string()))?;
    decode_bare(envelope.typ, &envelope.value)
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        encode(self)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = JsonValue::deserialize(deserializer)?;
        decode(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_monetary_envelope() {
        let value = Value::Monetary(Monetary::new(Asset::parse("USD/2").unwrap(), 1500u64));
        assert_eq!(
            encode(&value).unwrap(),
            json!({"type": "monetary", "value": {"asset": "USD/2", "amount": 1500}})
        );
    }

    #[test]
    fn test_decode_envelopes() {
        assert_eq!(
            decode(&json!({"type": "account", "value": "users:001"})).unwrap(),
            Value::Account("users:001".into())
        );
        assert_eq!(
            decode(&json!({"type": "portion", "value": "25%"})).unwrap(),
            Value::Portion(Portion::parse("1/4").unwrap())
        );
        assert_eq!(
            decode(&json!({"type": "number", "value": "123456789012345678901234567890"})).unwrap(),
            Value::Number(BigInt::from_str("123456789012345678901234567890").unwrap())
        );
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(matches!(
            decode(&json!({"type": "account", "value": "bad address!"})),
            Err(JsonError::InvalidAccount(_))
        ));
        assert!(matches!(
            decode(&json!({"type": "asset", "value": "usd"})),
            Err(JsonError::InvalidAsset(_))
        ));
        assert!(matches!(
            decode(&json!({"type": "monetary", "value": {"asset": "USD", "amount": -1}})),
            Err(JsonError::Malformed { .. })
        ));
        assert!(matches!(decode(&json!("plain")), Err(JsonError::Envelope(_))));
    }

    #[test]
    fn test_funding_cannot_be_encoded() {
        let funding = Value::Funding(crate::machine::value::Funding::empty(Asset::parse("USD").unwrap()));
        assert_eq!(encode(&funding).unwrap_err(), JsonError::Unsupported(Type::Funding));
    }
}
