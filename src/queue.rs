//! RabbitMQ listener: consume one queue with auto-ack, and dispatch every
//! delivery in turn on a single worker.
//!
//! Deliveries are acknowledged by the broker as soon as they're delivered, so
//! a message whose mail command fails is lost (at-most-once delivery).

use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::{Stream, StreamExt};
use lapin::options::BasicConsumeOptions;
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{Connection, ConnectionProperties};
use tokio::sync::mpsc;

use crate::dispatch::Dispatcher;

/// Deliveries received but not yet picked up by the worker.
pub const WORK_QUEUE_DEPTH: usize = 64;

/// Broker connection settings, taken from `RABBITMQ_*` environment variables.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub vhost: String,
    /// name of the queue to consume
    pub topic: String,
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("topic", &self.topic)
            .finish()
    }
}

impl BrokerConfig {
    pub fn from_env() -> Result<BrokerConfig> {
        BrokerConfig::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`. Every variable except
    /// `RABBITMQ_PASSWORD` must be present and non-empty, and the port must be
    /// a valid port number.
    pub fn from_lookup<F>(lookup: F) -> Result<BrokerConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |var: &str, what: &str| -> Result<String> {
            match lookup(var) {
                Some(value) if !value.is_empty() => Ok(value),
                _ => bail!("{} can't be blank; no environment variable found", what),
            }
        };

        let username = required("RABBITMQ_USERNAME", "Username")?;
        let password = lookup("RABBITMQ_PASSWORD").unwrap_or_default();
        let host = required("RABBITMQ_HOST", "Host")?;
        let port = required("RABBITMQ_PORT", "Port")?;
        let vhost = required("RABBITMQ_VHOST", "Virtual host")?;
        let topic = required("RABBITMQ_TOPIC", "Topic")?;

        let port = port
            .parse::<u16>()
            .with_context(|| format!("Port '{}' is not a valid port number", port))?;

        Ok(BrokerConfig {
            username,
            password,
            host,
            port,
            vhost,
            topic,
        })
    }

    /// AMQP URI for the broker. Built field by field, so nothing in the
    /// settings needs escaping.
    ///
    /// The virtual host is `/` followed by `RABBITMQ_VHOST`: `mail` selects the
    /// vhost `/mail`, and `/` selects `//`.
    pub fn uri(&self) -> AMQPUri {
        let mut uri = AMQPUri::default();
        uri.authority.userinfo.username = self.username.clone();
        uri.authority.userinfo.password = self.password.clone();
        uri.authority.host = self.host.clone();
        uri.authority.port = self.port;
        uri.vhost = format!("/{}", self.vhost);
        uri
    }
}

/// Auto-ack, not exclusive, not no-local, and waiting for the broker's reply.
pub fn consume_options() -> BasicConsumeOptions {
    BasicConsumeOptions {
        no_local: false,
        no_ack: true,
        exclusive: false,
        nowait: false,
    }
}

/// Connect to the broker and consume `broker.topic` until the connection fails.
///
/// Only returns on error; a clean shutdown is the caller dropping this future.
pub async fn listen(broker: &BrokerConfig, dispatcher: Arc<Dispatcher>) -> Result<()> {
    log::debug!("Connecting to RabbitMQ: {:?}", broker);

    let connection = Connection::connect_uri(broker.uri(), ConnectionProperties::default())
        .await
        .context("Failed to connect to RabbitMQ")?;

    let channel = connection
        .create_channel()
        .await
        .context("Failed to open a channel")?;

    let consumer = channel
        .basic_consume(&broker.topic, "", consume_options(), FieldTable::default())
        .await
        .context("Failed to register a consumer")?;

    log::info!("Waiting for messages. To exit press CTRL+C");

    let deliveries = consumer.map(|delivery| delivery.map(|delivery| delivery.data));
    consume(deliveries, dispatcher).await
}

/// Feed `deliveries` through a bounded queue to a single worker, which
/// dispatches them one at a time, in order.
///
/// Dispatch outcomes never stop consumption. An error from the stream, or the
/// stream ending, is returned once the worker has dispatched everything
/// already received.
pub async fn consume<S, E>(deliveries: S, dispatcher: Arc<Dispatcher>) -> Result<()>
where
    S: Stream<Item = std::result::Result<Vec<u8>, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(WORK_QUEUE_DEPTH);
    let worker = tokio::spawn(run_worker(rx, dispatcher));

    // `forward` owns the sender, so the worker sees the queue close when it returns
    let forwarded = forward(deliveries, tx).await;

    worker.await.context("Queue worker panicked")?;
    forwarded
}

async fn forward<S, E>(deliveries: S, tx: mpsc::Sender<Vec<u8>>) -> Result<()>
where
    S: Stream<Item = std::result::Result<Vec<u8>, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    futures::pin_mut!(deliveries);

    while let Some(delivery) = deliveries.next().await {
        let payload = delivery.context("Lost connection to RabbitMQ")?;
        log::debug!("Delivery of {} bytes", payload.len());

        if tx.send(payload).await.is_err() {
            bail!("Queue worker stopped unexpectedly");
        }
    }

    bail!("RabbitMQ closed the consumer")
}

async fn run_worker(mut rx: mpsc::Receiver<Vec<u8>>, dispatcher: Arc<Dispatcher>) {
    while let Some(payload) = rx.recv().await {
        dispatcher.dispatch(&payload).await;
    }
    log::debug!("Queue worker finished");
}
