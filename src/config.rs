//! Retry pipeline configuration.

use crate::broker::BrokerEndpoint;
use crate::context::GLOBAL_CONTEXT_ID;
use crate::dispatcher::DispatcherConfig;
use crate::envelope::BodyEncoding;
use crate::error::RetryError;
use lapin::uri::AMQPUri;
use std::str::FromStr;

/// Queue the broker library writes failed messages to.
pub const DEFAULT_ERROR_QUEUE: &str = "EasyNetQ_Default_Error_Queue";

/// Configuration for the retry pipeline.
///
/// Use the `RetryConfig::builder()` method to construct this struct.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// The error queue to drain.
    pub error_queue: String,
    /// The AMQP URL for connecting to the RabbitMQ broker.
    pub rabbitmq_url: String,
    /// A unique identifier for the consumer on the error queue.
    pub consumer_tag: String,
    /// The number of messages to fetch from the server at a time (QoS prefetch count).
    pub prefetch_count: u16,
    /// Maximum number of envelopes republished concurrently.
    pub degree_of_parallelism: usize,
    /// Requested heartbeat, in seconds.
    pub heartbeat_secs: u16,
    /// Connection timeout, in seconds.
    pub timeout_secs: u16,
    /// How the error queue stores message bodies.
    pub body_encoding: BodyEncoding,
    /// Correlation id reported outside any dispatched message.
    pub global_context_id: String,
}

impl RetryConfig {
    /// Creates a new `RetryConfigBuilder`.
    ///
    /// # Arguments
    /// * `error_queue` - The name of the error queue to drain.
    /// * `rabbitmq_url` - The connection URL for the RabbitMQ broker.
    pub fn builder(error_queue: String, rabbitmq_url: String) -> RetryConfigBuilder {
        RetryConfigBuilder::new(error_queue, rabbitmq_url)
    }

    pub fn dispatcher_config(&self) -> Result<DispatcherConfig, RetryError> {
        DispatcherConfig::new(self.degree_of_parallelism)
    }

    /// The connection URL with `heartbeat` and `connection_timeout` appended unless
    /// the URL already sets them.
    pub fn amqp_uri(&self) -> String {
        let mut uri = self.rabbitmq_url.clone();
        let mut append = |key: &str, value: u64| {
            if query_sets(&uri, key) {
                return;
            }
            uri.push(if uri.contains('?') { '&' } else { '?' });
            uri.push_str(&format!("{}={}", key, value));
        };
        append("heartbeat", u64::from(self.heartbeat_secs));
        append("connection_timeout", u64::from(self.timeout_secs) * 1000);
        uri
    }

    /// Host and virtual host of the broker, for diagnostics.
    pub fn endpoint(&self) -> Result<BrokerEndpoint, RetryError> {
        let uri = AMQPUri::from_str(&self.rabbitmq_url)
            .map_err(|e| RetryError::from(format!("invalid AMQP URL '{}': {}", self.rabbitmq_url, e)))?;
        Ok(BrokerEndpoint {
            host: uri.authority.host,
            vhost: uri.vhost,
        })
    }
}

/// Whether the query string of `uri` names `key`. Userinfo and vhost are ignored.
fn query_sets(uri: &str, key: &str) -> bool {
    let Some((_, query)) = uri.split_once('?') else {
        return false;
    };
    query
        .split('&')
        .any(|pair| pair.split('=').next() == Some(key))
}

/// A builder for creating `RetryConfig` instances.
pub struct RetryConfigBuilder {
    error_queue: String,
    rabbitmq_url: String,
    consumer_tag: Option<String>,
    prefetch_count: Option<u16>,
    degree_of_parallelism: Option<usize>,
    heartbeat_secs: Option<u16>,
    timeout_secs: Option<u16>,
    body_encoding: Option<BodyEncoding>,
    global_context_id: Option<String>,
}

impl RetryConfigBuilder {
    fn new(error_queue: String, rabbitmq_url: String) -> Self {
        Self {
            error_queue,
            rabbitmq_url,
            consumer_tag: None,
            prefetch_count: None,
            degree_of_parallelism: None,
            heartbeat_secs: None,
            timeout_secs: None,
            body_encoding: None,
            global_context_id: None,
        }
    }

    /// Defaults to `{error_queue}_retry`.
    pub fn consumer_tag(mut self, consumer_tag: String) -> Self {
        self.consumer_tag = Some(consumer_tag);
        self
    }

    /// Defaults to 50.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count);
        self
    }

    /// Defaults to 2. Zero is rejected by [`RetryConfigBuilder::build`].
    pub fn degree_of_parallelism(mut self, dop: usize) -> Self {
        self.degree_of_parallelism = Some(dop);
        self
    }

    /// Defaults to 10 seconds.
    pub fn heartbeat_secs(mut self, secs: u16) -> Self {
        self.heartbeat_secs = Some(secs);
        self
    }

    /// Defaults to 10 seconds.
    pub fn timeout_secs(mut self, secs: u16) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Defaults to [`BodyEncoding::Utf8`].
    pub fn body_encoding(mut self, encoding: BodyEncoding) -> Self {
        self.body_encoding = Some(encoding);
        self
    }

    /// Defaults to `"global"`.
    pub fn global_context_id(mut self, id: String) -> Self {
        self.global_context_id = Some(id);
        self
    }

    /// Builds the final `RetryConfig`, applying defaults for any unset options.
    pub fn build(self) -> Result<RetryConfig, RetryError> {
        let degree_of_parallelism = self.degree_of_parallelism.unwrap_or(2);
        if degree_of_parallelism == 0 {
            return Err("degree of parallelism must be at least 1".into());
        }
        if self.error_queue.is_empty() {
            return Err("error queue name must not be empty".into());
        }
        let error_queue = self.error_queue;
        Ok(RetryConfig {
            consumer_tag: self.consumer_tag.unwrap_or_else(|| format!("{}_retry", error_queue)),
            prefetch_count: self.prefetch_count.unwrap_or(50),
            degree_of_parallelism,
            heartbeat_secs: self.heartbeat_secs.unwrap_or(10),
            timeout_secs: self.timeout_secs.unwrap_or(10),
            body_encoding: self.body_encoding.unwrap_or_default(),
            global_context_id: self.global_context_id.unwrap_or_else(|| GLOBAL_CONTEXT_ID.to_string()),
            error_queue,
            rabbitmq_url: self.rabbitmq_url,
        })
    }
}
