//! AMQP 0-9-1 transport over `lapin`.

use super::transport::{Connector, Delivery, Result, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info, warn};

/// Persistent delivery mode.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Sorts a `lapin` error into "reconnect and carry on" and "give up".
pub fn classify(err: lapin::Error) -> TransportError {
    match err {
        lapin::Error::IOError(_)
        | lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::MissingHeartbeatError => TransportError::transient(err.to_string()),
        other => TransportError::fatal(other.to_string()),
    }
}

/// Parses `url` and fills in credentials supplied out of band.
pub fn broker_uri(url: &str, user: Option<&str>, password: Option<&str>) -> Result<AMQPUri> {
    let mut uri: AMQPUri = url
        .parse()
        .map_err(|e: String| TransportError::fatal(format!("invalid broker URL: {e}")))?;
    if let Some(user) = user {
        uri.authority.userinfo = AMQPUserInfo {
            username: user.to_string(),
            password: password.unwrap_or_default().to_string(),
        };
    }
    Ok(uri)
}

#[derive(Debug, Clone)]
pub struct AmqpConnector {
    uri: AMQPUri,
    prefetch: u16,
}

impl AmqpConnector {
    pub fn new(uri: AMQPUri, prefetch: u16) -> Self {
        Self { uri, prefetch }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let connection = Connection::connect_uri(self.uri.clone(), ConnectionProperties::default())
            .await
            .map_err(classify)?;
        let channel = connection.create_channel().await.map_err(classify)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(classify)?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(classify)?;

        info!(
            host = %self.uri.authority.host,
            vhost = %self.uri.vhost,
            prefetch = self.prefetch,
            "Connected to broker"
        );
        Ok(Box::new(AmqpTransport {
            connection,
            channel,
            deliveries: SelectAll::new(),
        }))
    }
}

type QueueStream = BoxStream<'static, (String, lapin::Result<lapin::message::Delivery>)>;

pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
    deliveries: SelectAll<QueueStream>,
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare(&mut self, queue: &str) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(classify)?;
        debug!(queue, "Queue declared");
        Ok(())
    }

    async fn consume(&mut self, queues: &[String]) -> Result<()> {
        let mut streams = Vec::with_capacity(queues.len());
        for queue in queues {
            let consumer = self
                .channel
                .basic_consume(
                    queue,
                    "",
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(classify)?;
            let name = queue.clone();
            streams.push(consumer.map(move |d| (name.clone(), d)).boxed());
        }
        self.deliveries = stream::select_all(streams);
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        match self.deliveries.next().await {
            Some((queue, Ok(delivery))) => Ok(Some(Delivery {
                queue,
                tag: delivery.delivery_tag,
                body: Bytes::from(delivery.data),
            })),
            Some((_, Err(err))) => Err(classify(err)),
            // A broker never ends a consumer it is still serving.
            None => Err(TransportError::transient("consumer stream ended")),
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        self.channel
            .basic_ack(delivery.tag, BasicAckOptions::default())
            .await
            .map_err(classify)
    }

    async fn publish(&mut self, queue: &str, body: &[u8]) -> Result<()> {
        let properties = BasicProperties::default()
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .with_content_type("application/json".into());
        let confirmation = self
            .channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
            .await
            .map_err(classify)?
            .await
            .map_err(classify)?;
        if confirmation.is_nack() {
            warn!(queue, "Broker rejected published message");
            return Err(TransportError::transient(format!(
                "publish to '{queue}' was not acknowledged"
            )));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.channel.close(200, "OK").await.map_err(classify)?;
        self.connection.close(200, "OK").await.map_err(classify)
    }
}
