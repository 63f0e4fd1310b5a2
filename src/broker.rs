//! Broker operations used by the republish protocol.

use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions},
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldArray, FieldTable, LongString},
    BasicProperties, Connection, ExchangeKind,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::envelope::MessageProperties;
use crate::error::BrokerError;

/// Where the broker lives, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub vhost: String,
}

/// Result of a passive exchange check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeCheck {
    Exists,
    NotFound,
}

/// The broker capabilities the retry pipeline consumes.
///
/// Implementations are shared by every dispatcher worker and must tolerate
/// concurrent calls.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Checks that `exchange` exists without creating it.
    async fn verify_exchange(&self, exchange: &str) -> Result<ExchangeCheck, BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<(), BrokerError>;

    fn endpoint(&self) -> &BrokerEndpoint;
}

/// [`Broker`] backed by a shared `lapin` connection.
///
/// Each operation opens its own short-lived channel: a failed passive declare
/// closes the channel it ran on, and channels are not shared between workers.
#[derive(Clone)]
pub struct LapinBroker {
    connection: Arc<Connection>,
    endpoint: BrokerEndpoint,
}

impl LapinBroker {
    pub fn new(connection: Arc<Connection>, endpoint: BrokerEndpoint) -> Self {
        Self { connection, endpoint }
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn verify_exchange(&self, exchange: &str) -> Result<ExchangeCheck, BrokerError> {
        let channel = self.connection.create_channel().await?;
        let declared = channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions { passive: true, ..Default::default() },
                FieldTable::default(),
            )
            .await;

        match declared {
            Ok(()) => Ok(settle_close(ExchangeCheck::Exists, exchange, channel.close(200, "OK").await)),
            Err(e) if is_not_found(&e) => Ok(ExchangeCheck::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let channel = self.connection.create_channel().await?;
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions { mandatory, ..Default::default() },
                body,
                to_basic_properties(properties),
            )
            .await?
            .await?;
        settle_close((), exchange, channel.close(200, "OK").await);
        Ok(())
    }

    fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }
}

/// Keeps `outcome` when closing the operation's channel fails afterwards; the
/// broker has already answered.
fn settle_close<T>(outcome: T, exchange: &str, closed: Result<(), lapin::Error>) -> T {
    if let Err(e) = closed {
        log::warn!("Failed to close channel used for exchange '{}': {}", exchange, e);
    }
    outcome
}

fn is_not_found(error: &lapin::Error) -> bool {
    matches!(
        error,
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
    )
}

/// Rebuilds AMQP properties from the envelope, field for field.
///
/// Only properties the failed message actually carried are set; see
/// [`MessageProperties::present`].
pub fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(v) = props.present("ContentType", &props.content_type) {
        basic = basic.with_content_type(v.clone().into());
    }
    if let Some(v) = props.present("ContentEncoding", &props.content_encoding) {
        basic = basic.with_content_encoding(v.clone().into());
    }
    if !props.headers.is_empty() && !props.flagged_absent("Headers") {
        basic = basic.with_headers(to_field_table(&props.headers));
    }
    if let Some(&v) = props.present("DeliveryMode", &props.delivery_mode) {
        basic = basic.with_delivery_mode(v);
    }
    if let Some(&v) = props.present("Priority", &props.priority) {
        basic = basic.with_priority(v);
    }
    if let Some(v) = props.present("CorrelationId", &props.correlation_id) {
        basic = basic.with_correlation_id(v.clone().into());
    }
    if let Some(v) = props.present("ReplyTo", &props.reply_to) {
        basic = basic.with_reply_to(v.clone().into());
    }
    if let Some(v) = props.present("Expiration", &props.expiration) {
        basic = basic.with_expiration(v.clone().into());
    }
    if let Some(v) = props.present("MessageId", &props.message_id) {
        basic = basic.with_message_id(v.clone().into());
    }
    if let Some(&v) = props.present("Timestamp", &props.timestamp) {
        basic = basic.with_timestamp(v);
    }
    if let Some(v) = props.present("Type", &props.kind) {
        basic = basic.with_kind(v.clone().into());
    }
    if let Some(v) = props.present("UserId", &props.user_id) {
        basic = basic.with_user_id(v.clone().into());
    }
    if let Some(v) = props.present("AppId", &props.app_id) {
        basic = basic.with_app_id(v.clone().into());
    }
    if let Some(v) = props.present("ClusterId", &props.cluster_id) {
        basic = basic.with_cluster_id(v.clone().into());
    }
    basic
}

fn to_field_table(headers: &BTreeMap<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(key.clone().into(), to_amqp_value(value));
    }
    table
}

fn to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => {
            let mut array = FieldArray::default();
            for item in items {
                array.push(to_amqp_value(item));
            }
            AMQPValue::FieldArray(array)
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, value) in map {
                table.insert(key.clone().into(), to_amqp_value(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

/// A message recorded by [`InMemoryBroker`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct InMemoryState {
    exchanges: HashSet<String>,
    failing_exchanges: HashSet<String>,
    published: Vec<PublishedMessage>,
    verified: Vec<String>,
}

/// In-memory broker for local pipelines and tests.
///
/// Knows a fixed set of exchanges, records every publish, and can be told to fail
/// publishes to particular exchanges.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<InMemoryState>>,
    endpoint: BrokerEndpoint,
    latency: Duration,
}

impl InMemoryBroker {
    pub fn new<I, S>(exchanges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let state = InMemoryState {
            exchanges: exchanges.into_iter().map(Into::into).collect(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            endpoint: BrokerEndpoint {
                host: "in-memory".to_string(),
                vhost: "/".to_string(),
            },
            latency: Duration::ZERO,
        }
    }

    /// Delays every broker operation, simulating a network round trip.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes publishes to `exchange` fail with a transport error.
    pub async fn fail_publishes_to(&self, exchange: &str) {
        self.state.lock().await.failing_exchanges.insert(exchange.to_string());
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().await.published.clone()
    }

    /// Exchanges passed to [`Broker::verify_exchange`], in call order.
    pub async fn verified(&self) -> Vec<String> {
        self.state.lock().await.verified.clone()
    }

    async fn simulate_round_trip(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn verify_exchange(&self, exchange: &str) -> Result<ExchangeCheck, BrokerError> {
        self.simulate_round_trip().await;
        let mut state = self.state.lock().await;
        state.verified.push(exchange.to_string());
        if state.exchanges.contains(exchange) {
            Ok(ExchangeCheck::Exists)
        } else {
            Ok(ExchangeCheck::NotFound)
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        self.simulate_round_trip().await;
        let mut state = self.state.lock().await;
        if state.failing_exchanges.contains(exchange) {
            return Err(BrokerError::Transport(format!("connection reset while publishing to '{}'", exchange)));
        }
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory,
            properties: properties.clone(),
            body: body.to_vec(),
        });
        Ok(())
    }

    fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_properties_carry_every_field() {
        let mut props = MessageProperties {
            content_type: Some("application/json".into()),
            content_encoding: Some("utf-8".into()),
            delivery_mode: Some(2),
            priority: Some(5),
            correlation_id: Some("c0ffee".into()),
            reply_to: Some("replies".into()),
            expiration: Some("60000".into()),
            message_id: Some("m-1".into()),
            timestamp: Some(1_700_000_000),
            kind: Some("OrderCreated".into()),
            user_id: Some("guest".into()),
            app_id: Some("checkout".into()),
            cluster_id: Some("c1".into()),
            ..Default::default()
        };
        props.headers.insert("x-origin".into(), json!("checkout"));

        let basic = to_basic_properties(&props);
        assert_eq!(basic.content_type().as_ref().map(|s| s.as_str()), Some("application/json"));
        assert_eq!(basic.content_encoding().as_ref().map(|s| s.as_str()), Some("utf-8"));
        assert_eq!(*basic.delivery_mode(), Some(2));
        assert_eq!(*basic.priority(), Some(5));
        assert_eq!(basic.correlation_id().as_ref().map(|s| s.as_str()), Some("c0ffee"));
        assert_eq!(basic.reply_to().as_ref().map(|s| s.as_str()), Some("replies"));
        assert_eq!(basic.expiration().as_ref().map(|s| s.as_str()), Some("60000"));
        assert_eq!(basic.message_id().as_ref().map(|s| s.as_str()), Some("m-1"));
        assert_eq!(*basic.timestamp(), Some(1_700_000_000));
        assert_eq!(basic.kind().as_ref().map(|s| s.as_str()), Some("OrderCreated"));
        assert_eq!(basic.user_id().as_ref().map(|s| s.as_str()), Some("guest"));
        assert_eq!(basic.app_id().as_ref().map(|s| s.as_str()), Some("checkout"));
        assert_eq!(basic.cluster_id().as_ref().map(|s| s.as_str()), Some("c1"));

        let headers = basic.headers().as_ref().unwrap();
        assert!(matches!(headers.inner().get("x-origin"), Some(AMQPValue::LongString(_))));
    }

    #[test]
    fn test_unset_properties_from_error_queue_are_not_republished() {
        let document = json!({
            "Exchange": "orders",
            "RoutingKey": "orders.created",
            "Message": "{}",
            "BasicProperties": {
                "ContentType": "application/json", "ContentTypePresent": true,
                "ContentEncoding": null, "ContentEncodingPresent": false,
                "Headers": {}, "HeadersPresent": false,
                "DeliveryMode": 0, "DeliveryModePresent": false,
                "Priority": 0, "PriorityPresent": false,
                "CorrelationId": "c0ffee", "CorrelationIdPresent": true,
                "ReplyTo": null, "ReplyToPresent": false,
                "Expiration": null, "ExpirationPresent": false,
                "MessageId": null, "MessageIdPresent": false,
                "Timestamp": 0, "TimestampPresent": false,
                "Type": "OrderCreated", "TypePresent": true,
                "UserId": null, "UserIdPresent": false,
                "AppId": null, "AppIdPresent": false,
                "ClusterId": null, "ClusterIdPresent": false
            }
        });
        let envelope = crate::envelope::ErrorEnvelope::from_slice(&serde_json::to_vec(&document).unwrap()).unwrap();
        let basic = to_basic_properties(&envelope.basic_properties);

        assert_eq!(*basic.delivery_mode(), None);
        assert_eq!(*basic.priority(), None);
        assert_eq!(*basic.timestamp(), None);
        assert!(basic.headers().is_none());
        assert!(basic.content_encoding().is_none());
        assert_eq!(basic.content_type().as_ref().map(|s| s.as_str()), Some("application/json"));
        assert_eq!(basic.correlation_id().as_ref().map(|s| s.as_str()), Some("c0ffee"));
        assert_eq!(basic.kind().as_ref().map(|s| s.as_str()), Some("OrderCreated"));
    }

    #[test]
    fn test_present_flag_keeps_zero_values() {
        let mut props = MessageProperties {
            delivery_mode: Some(0),
            priority: Some(0),
            ..Default::default()
        };
        props.extra.insert("DeliveryModePresent".into(), json!(true));

        let basic = to_basic_properties(&props);
        assert_eq!(*basic.delivery_mode(), Some(0));
        // No flag at all: the written value is taken as set.
        assert_eq!(*basic.priority(), Some(0));
    }

    #[test]
    fn test_channel_close_failure_keeps_outcome() {
        let outcome = settle_close(ExchangeCheck::Exists, "orders", Err(lapin::Error::ChannelsLimitReached));
        assert_eq!(outcome, ExchangeCheck::Exists);
        assert!(!is_not_found(&lapin::Error::ChannelsLimitReached));
    }

    #[test]
    fn test_header_values_map_to_amqp_types() {
        assert_eq!(to_amqp_value(&json!(null)), AMQPValue::Void);
        assert_eq!(to_amqp_value(&json!(true)), AMQPValue::Boolean(true));
        assert_eq!(to_amqp_value(&json!(-7)), AMQPValue::LongLongInt(-7));
        assert_eq!(to_amqp_value(&json!(1.5)), AMQPValue::Double(1.5));
        assert!(matches!(to_amqp_value(&json!([1, "a"])), AMQPValue::FieldArray(_)));
        assert!(matches!(to_amqp_value(&json!({"k": 1})), AMQPValue::FieldTable(_)));
    }

    #[tokio::test]
    async fn test_in_memory_broker_records_publishes() {
        let broker = InMemoryBroker::new(["orders"]);
        assert_eq!(broker.verify_exchange("orders").await.unwrap(), ExchangeCheck::Exists);
        assert_eq!(broker.verify_exchange("missing").await.unwrap(), ExchangeCheck::NotFound);

        broker
            .publish("orders", "orders.created", false, &MessageProperties::default(), b"{}")
            .await
            .unwrap();
        broker.fail_publishes_to("orders").await;
        assert!(broker
            .publish("orders", "orders.created", false, &MessageProperties::default(), b"{}")
            .await
            .is_err());

        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key, "orders.created");
        assert_eq!(broker.verified().await, vec!["orders".to_string(), "missing".to_string()]);
    }
}
