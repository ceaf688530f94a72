//! Subscription wire format
//!
//! Exchanges disagree on envelopes, so the manager only talks to a [`StreamCodec`].
//! [`JsonCodec`] is a plain default:
//!
//! ```text
//! -> {"op":"subscribe","channel":"trades","params":{"symbol":"BTC-USD"}}
//! <- {"channel":"trades","params":{"symbol":"BTC-USD"},"data":{...}}
//! ```

use super::transport::Frame;
use crate::errors::ConnectionError;
use serde_json::{Value, json};

/// A decoded data message.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub channel: String,
    pub params: Value,
    pub payload: Value,
}

pub trait StreamCodec: Send + Sync {
    fn subscribe_frame(&self, channel: &str, params: &Value) -> Frame;

    fn unsubscribe_frame(&self, channel: &str, params: &Value) -> Frame;

    /// `Ok(None)` for frames that carry no subscription data (acks, heartbeats).
    fn decode(&self, frame: &Frame) -> Result<Option<Inbound>, ConnectionError>;

    /// Whether `inbound` belongs to a subscription registered with `channel`/`params`.
    fn matches(&self, channel: &str, params: &Value, inbound: &Inbound) -> bool {
        channel == inbound.channel && params_match(params, &inbound.params)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    fn control(op: &str, channel: &str, params: &Value) -> Frame {
        Frame::Text(json!({ "op": op, "channel": channel, "params": params }).to_string())
    }
}

impl StreamCodec for JsonCodec {
    fn subscribe_frame(&self, channel: &str, params: &Value) -> Frame {
        Self::control("subscribe", channel, params)
    }

    fn unsubscribe_frame(&self, channel: &str, params: &Value) -> Frame {
        Self::control("unsubscribe", channel, params)
    }

    fn decode(&self, frame: &Frame) -> Result<Option<Inbound>, ConnectionError> {
        let mut message: Value = match frame {
            Frame::Text(text) => serde_json::from_str(text),
            Frame::Binary(bytes) => serde_json::from_slice(bytes),
            Frame::Ping(_) | Frame::Pong(_) => return Ok(None),
        }
        .map_err(|e| ConnectionError::Codec(e.to_string()))?;

        let Some(channel) = message.get("channel").and_then(Value::as_str) else {
            return Ok(None);
        };
        let channel = channel.to_owned();
        let Some(payload) = message.get_mut("data").map(Value::take) else {
            return Ok(None);
        };
        let params = message.get_mut("params").map(Value::take).unwrap_or(Value::Null);

        Ok(Some(Inbound {
            channel,
            params,
            payload,
        }))
    }
}

/// `Null` matches anything. An object filter needs every one of its keys present and
/// equal in `actual`. Anything else compares by equality.
pub fn params_match(filter: &Value, actual: &Value) -> bool {
    match (filter, actual) {
        (Value::Null, _) => true,
        (Value::Object(wanted), Value::Object(got)) => wanted
            .iter()
            .all(|(key, value)| got.get(key).is_some_and(|v| v == value)),
        (Value::Object(wanted), _) => wanted.is_empty(),
        _ => filter == actual,
    }
}
