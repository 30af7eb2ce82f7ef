use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::debug;

use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerTransport, Delivery, DeliveryAcker, DeliveryStream,
    QueueOptions, TransportError, TransportResult,
};

/// Reply code sent with a normal channel/connection close.
const REPLY_SUCCESS: u16 = 200;

/// RabbitMQ transport backed by `lapin`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpTransport;

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn connect(
        &self,
        uri: &str,
        connection_name: Option<&str>,
    ) -> TransportResult<Box<dyn BrokerConnection>> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = connection_name {
            properties = properties.with_connection_name(name.into());
        }

        let connection = Connection::connect(uri, properties).await?;
        Ok(Box::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> TransportResult<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;
        debug!(channel_id = channel.id(), "Opened AMQP channel");
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> TransportResult<()> {
        self.connection.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> TransportResult<()> {
        let declare = QueueDeclareOptions {
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            ..Default::default()
        };

        let queue = self
            .channel
            .queue_declare(name, declare, FieldTable::default())
            .await?;
        debug!(
            queue = name,
            messages = queue.message_count(),
            consumers = queue.consumer_count(),
            "Declared queue"
        );
        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        content_type: &str,
    ) -> TransportResult<()> {
        // The confirm future resolves to NotRequested unless the channel is in
        // confirm mode, which this client never enables.
        let _confirm = self
            .channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_content_type(content_type.into()),
            )
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> TransportResult<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> TransportResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let deliveries = consumer.map(|next| {
            next.map(|delivery| Delivery {
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                body: delivery.data,
                acker: Arc::new(AmqpAcker(delivery.acker)),
            })
            .map_err(TransportError::from)
        });
        Ok(deliveries.boxed())
    }

    async fn close(&self) -> TransportResult<()> {
        self.channel.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> TransportResult<()> {
        self.0.ack(BasicAckOptions { multiple: false }).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> TransportResult<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> TransportResult<()> {
        self.0.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}
