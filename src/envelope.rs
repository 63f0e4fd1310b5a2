//! Error envelope model as written to the broker's default error queue.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::RetryError;

/// A message that failed processing, captured with enough metadata to redeliver it.
///
/// Field names follow the error-queue JSON document (`Exchange`, `RoutingKey`,
/// `Message`, `BasicProperties`, `Exception`, `DateTime`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorEnvelope {
    /// Exchange recorded when the failure was captured.
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
    /// Serialized body; see [`BodyEncoding`].
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub basic_properties: MessageProperties,
    /// The exception text recorded by the failing consumer.
    #[serde(default)]
    pub exception: String,
    #[serde(default, with = "capture_time")]
    pub date_time: Option<DateTime<Utc>>,
}

impl ErrorEnvelope {
    /// Parses an envelope from a raw delivery payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self, RetryError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Captures an outbound message as an envelope, encoding the body with `encoding`.
    pub fn capture(
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: &[u8],
        exception: &str,
        encoding: BodyEncoding,
    ) -> Self {
        Self {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: encoding.encode(body),
            basic_properties: properties,
            exception: exception.to_string(),
            date_time: Some(Utc::now()),
        }
    }

    /// Decodes the stored body into the bytes originally published.
    pub fn body(&self, encoding: BodyEncoding) -> Result<Vec<u8>, RetryError> {
        encoding.decode(&self.message)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, RetryError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// AMQP basic properties as stored in the envelope.
///
/// Fields the model does not name (such as the `*Present` flags) are kept in
/// `extra` so that nothing is dropped on the way back out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_mode: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, rename = "Type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl MessageProperties {
    /// Whether the capturing side marked `field` as unset with `<field>Present: false`.
    pub fn flagged_absent(&self, field: &str) -> bool {
        matches!(self.extra.get(&format!("{}Present", field)), Some(Value::Bool(false)))
    }

    /// `value` if `field` was actually set on the failed message.
    ///
    /// The error queue writes every property, unset ones as `0` or `null`, so a
    /// `<field>Present: false` flag wins over whatever value was written.
    pub fn present<'a, T>(&self, field: &str, value: &'a Option<T>) -> Option<&'a T> {
        if self.flagged_absent(field) {
            None
        } else {
            value.as_ref()
        }
    }
}

/// How the failed message's body was turned into the envelope's `Message` text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BodyEncoding {
    /// Body bytes stored as UTF-8 text.
    #[default]
    Utf8,
    /// Body bytes stored as standard base64.
    Base64,
}

impl BodyEncoding {
    pub fn encode(self, body: &[u8]) -> String {
        match self {
            BodyEncoding::Utf8 => String::from_utf8_lossy(body).into_owned(),
            BodyEncoding::Base64 => STANDARD.encode(body),
        }
    }

    pub fn decode(self, message: &str) -> Result<Vec<u8>, RetryError> {
        match self {
            BodyEncoding::Utf8 => Ok(message.as_bytes().to_vec()),
            BodyEncoding::Base64 => Ok(STANDARD.decode(message)?),
        }
    }
}

impl FromStr for BodyEncoding {
    type Err = RetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" | "text" => Ok(BodyEncoding::Utf8),
            "base64" => Ok(BodyEncoding::Base64),
            other => Err(RetryError::from(format!("unknown error body encoding '{}'", other))),
        }
    }
}

/// A unit of work handed from the subscription to the dispatcher.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub envelope: ErrorEnvelope,
    pub submitted_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(envelope: ErrorEnvelope) -> Self {
        Self {
            envelope,
            submitted_at: Utc::now(),
        }
    }
}

/// Accepts RFC 3339 timestamps as well as offset-less ones, which are read as UTC.
mod capture_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(Some(dt.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| Some(naive.and_utc()))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use serde_json::json;

    fn sample_document() -> Value {
        json!({
            "RoutingKey": "orders.created",
            "Exchange": "Orders.Messages:Orders",
            "Exception": "System.Exception: boom",
            "Message": "{\"OrderId\":42}",
            "DateTime": "2013-03-06T12:34:56.789",
            "BasicProperties": {
                "ContentType": "application/json",
                "ContentTypePresent": true,
                "Headers": { "x-origin": "checkout", "attempts": 3 },
                "DeliveryMode": 2,
                "CorrelationId": "c0ffee",
                "Type": "Orders.Messages.OrderCreated:Orders",
                "TypePresent": true
            }
        })
    }

    #[test]
    fn test_parse_error_queue_document() {
        let payload = serde_json::to_vec(&sample_document()).unwrap();
        let envelope = ErrorEnvelope::from_slice(&payload).unwrap();

        assert_eq!(envelope.exchange, "Orders.Messages:Orders");
        assert_eq!(envelope.routing_key, "orders.created");
        assert_eq!(envelope.exception, "System.Exception: boom");
        assert_eq!(envelope.body(BodyEncoding::Utf8).unwrap(), b"{\"OrderId\":42}");

        let props = &envelope.basic_properties;
        assert_eq!(props.content_type.as_deref(), Some("application/json"));
        assert_eq!(props.delivery_mode, Some(2));
        assert_eq!(props.kind.as_deref(), Some("Orders.Messages.OrderCreated:Orders"));
        assert_eq!(props.headers["attempts"], json!(3));
        assert_eq!(props.extra["ContentTypePresent"], json!(true));
        assert_eq!(props.extra["TypePresent"], json!(true));

        let captured = envelope.date_time.unwrap();
        assert_eq!((captured.year(), captured.hour(), captured.second()), (2013, 12, 56));
    }

    #[test]
    fn test_unknown_property_fields_survive_reserialization() {
        let payload = serde_json::to_vec(&sample_document()).unwrap();
        let envelope = ErrorEnvelope::from_slice(&payload).unwrap();

        let reparsed = ErrorEnvelope::from_slice(&envelope.to_vec().unwrap()).unwrap();
        assert_eq!(reparsed, envelope);
    }

    #[test]
    fn test_missing_fields_default_to_empty() {
        let envelope = ErrorEnvelope::from_slice(br#"{"Message":"hi"}"#).unwrap();
        assert!(envelope.exchange.is_empty());
        assert!(envelope.date_time.is_none());
        assert_eq!(envelope.basic_properties, MessageProperties::default());
    }

    #[test]
    fn test_rejects_non_envelope_payload() {
        assert!(matches!(
            ErrorEnvelope::from_slice(b"not json"),
            Err(RetryError::Deserialization(_))
        ));
    }

    #[test]
    fn test_base64_body_round_trip_preserves_binary() {
        let body = [0u8, 159, 146, 150, 255];
        let encoded = BodyEncoding::Base64.encode(&body);
        assert_eq!(BodyEncoding::Base64.decode(&encoded).unwrap(), body);
        assert!(matches!(
            BodyEncoding::Base64.decode("%%%"),
            Err(RetryError::BodyDecoding(_))
        ));
    }

    #[test]
    fn test_body_encoding_from_str() {
        assert_eq!("UTF-8".parse::<BodyEncoding>().unwrap(), BodyEncoding::Utf8);
        assert_eq!("base64".parse::<BodyEncoding>().unwrap(), BodyEncoding::Base64);
        assert!("rot13".parse::<BodyEncoding>().is_err());
    }
}
