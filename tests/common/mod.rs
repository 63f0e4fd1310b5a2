#![allow(dead_code)]

use async_trait::async_trait;
use hosepipe_retry::{Acknowledge, DeliverySource, ErrorEnvelope, InboundDelivery, MessageProperties, RetryError};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// What happened to a delivery once the pipeline was done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Acked,
    Rejected { requeue: bool },
}

#[derive(Clone, Default)]
pub struct AckLog(Arc<Mutex<Vec<(u64, Ack)>>>);

impl AckLog {
    pub fn entries(&self) -> Vec<(u64, Ack)> {
        let mut entries = self.0.lock().unwrap().clone();
        entries.sort_by_key(|(tag, _)| *tag);
        entries
    }

    pub fn count(&self, ack: Ack) -> usize {
        self.0.lock().unwrap().iter().filter(|(_, a)| *a == ack).count()
    }
}

struct RecordingAcker {
    tag: u64,
    log: AckLog,
}

#[async_trait]
impl Acknowledge for RecordingAcker {
    async fn ack(&self) -> Result<(), RetryError> {
        self.log.0.lock().unwrap().push((self.tag, Ack::Acked));
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), RetryError> {
        self.log.0.lock().unwrap().push((self.tag, Ack::Rejected { requeue }));
        Ok(())
    }
}

/// Delivery source fed from a channel, standing in for the error queue consumer.
pub struct ChannelSource {
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    next_tag: u64,
    log: AckLog,
}

#[async_trait]
impl DeliverySource for ChannelSource {
    async fn next_delivery(&mut self) -> Option<Result<InboundDelivery, RetryError>> {
        let payload = self.receiver.recv().await?;
        self.next_tag += 1;
        Some(Ok(InboundDelivery {
            delivery_tag: self.next_tag,
            payload,
            acker: Box::new(RecordingAcker {
                tag: self.next_tag,
                log: self.log.clone(),
            }),
        }))
    }
}

/// Returns a sender for raw payloads, the source reading them, and its ack log.
pub fn channel_source() -> (mpsc::UnboundedSender<Vec<u8>>, ChannelSource, AckLog) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let log = AckLog::default();
    let source = ChannelSource {
        receiver,
        next_tag: 0,
        log: log.clone(),
    };
    (sender, source, log)
}

/// A source that yields `payloads` and then ends.
pub fn finite_source(payloads: Vec<Vec<u8>>) -> (ChannelSource, AckLog) {
    let (sender, source, log) = channel_source();
    for payload in payloads {
        sender.send(payload).unwrap();
    }
    (source, log)
}

pub fn envelope(exchange: &str, routing_key: &str, body: &str) -> ErrorEnvelope {
    let mut properties = MessageProperties {
        content_type: Some("application/json".into()),
        delivery_mode: Some(2),
        message_id: Some(format!("{}-{}", exchange, body)),
        ..Default::default()
    };
    properties.headers.insert("x-origin".into(), json!("checkout"));
    properties.extra.insert("MessageIdPresent".into(), json!(true));
    ErrorEnvelope {
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
        message: body.to_string(),
        basic_properties: properties,
        exception: "System.Exception: handler failed".to_string(),
        date_time: None,
    }
}
