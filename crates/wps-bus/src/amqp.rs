use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use wps_config::BusConfig;

use crate::error::BusError;
use crate::event::decode_event;
use crate::publisher::{EventHandler, EventPublisher};

fn string_headers(delivery: &Delivery) -> HashMap<String, String> {
    delivery
        .properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| match value {
                    AMQPValue::LongString(s) => Some((
                        key.as_str().to_string(),
                        String::from_utf8_lossy(s.as_bytes()).into_owned(),
                    )),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

// ── Publisher ─────────────────────────────────────────────────────────────────

/// AMQP publisher for the shared events exchange.
///
/// Messages are persistent (`delivery_mode=2`) JSON. The channel is created
/// lazily and re-created after a broker error, so a publish after a
/// connection loss heals itself.
pub struct AmqpPublisher {
    url: String,
    exchange: String,
    // The connection handle must outlive its channels.
    state: Mutex<Option<(Connection, Channel)>>,
}

impl AmqpPublisher {
    pub fn new(url: impl Into<String>, exchange: impl Into<String>) -> Self {
        AmqpPublisher {
            url: url.into(),
            exchange: exchange.into(),
            state: Mutex::new(None),
        }
    }

    async fn channel(&self) -> Result<Channel, BusError> {
        let mut guard = self.state.lock().await;
        if let Some((_, channel)) = guard.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }
        let connection = Connection::connect(&self.url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        *guard = Some((connection, channel.clone()));
        Ok(channel)
    }
}

#[async_trait]
impl EventPublisher for AmqpPublisher {
    async fn publish(&self, routing_key: &str, payload: &Value) -> Result<(), BusError> {
        let body = serde_json::to_vec(payload)?;
        let channel = self.channel().await?;
        let result = channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await;
        match result {
            Ok(confirm) => {
                confirm.await?;
                debug!(routing_key = %routing_key, "published event");
                Ok(())
            }
            Err(err) => {
                // Drop the channel so the next publish reconnects.
                *self.state.lock().await = None;
                Err(err.into())
            }
        }
    }
}

// ── Consumer ──────────────────────────────────────────────────────────────────

/// Consumes permit events from a durable queue bound to the events
/// exchange and dispatches them, one at a time, to the handler.
///
/// Poison-message policy: deliveries that fail to decode, and events whose
/// handler errors, are negatively acknowledged without requeue. Connection
/// errors are never fatal; the loop reconnects with a fixed delay until
/// shutdown is signalled.
pub struct AmqpConsumer {
    bus: BusConfig,
    bindings: Vec<String>,
    reconnect_delay: Duration,
    handler: Arc<dyn EventHandler>,
}

impl AmqpConsumer {
    pub fn new(
        bus: BusConfig,
        bindings: Vec<String>,
        reconnect_delay: Duration,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        AmqpConsumer {
            bus,
            bindings,
            reconnect_delay,
            handler,
        }
    }

    /// Run until `shutdown` flips to true. The in-flight delivery always
    /// drains before this returns.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.consume(&mut shutdown).await {
                Ok(()) => break,
                Err(err) => {
                    error!(error = %err, "event bus connection lost; reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        info!("event consumer stopped");
    }

    async fn consume(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), BusError> {
        let connection =
            Connection::connect(&self.bus.url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(self.bus.prefetch, BasicQosOptions::default())
            .await?;
        channel
            .queue_declare(
                &self.bus.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        for binding in &self.bindings {
            channel
                .queue_bind(
                    &self.bus.queue,
                    &self.bus.exchange,
                    binding,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        let mut consumer = channel
            .basic_consume(
                &self.bus.queue,
                "wps-orchestrator",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        info!(queue = %self.bus.queue, prefetch = self.bus.prefetch, "connected to event bus");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else {
                        return Err(BusError::StreamClosed);
                    };
                    self.process(delivery?).await?;
                }
            }
        }
    }

    async fn process(&self, delivery: Delivery) -> Result<(), BusError> {
        let headers = string_headers(&delivery);
        match decode_event(&delivery.data, &headers) {
            Ok(event) => match self.handler.handle(event).await {
                Ok(()) => delivery.acker.ack(BasicAckOptions::default()).await?,
                Err(err) => {
                    error!(error = %err, "event handler failed; rejecting without requeue");
                    delivery
                        .acker
                        .nack(BasicNackOptions {
                            requeue: false,
                            ..Default::default()
                        })
                        .await?;
                }
            },
            Err(err) => {
                warn!(error = %err, "undecodable delivery; rejecting without requeue");
                delivery
                    .acker
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await?;
            }
        }
        Ok(())
    }
}
