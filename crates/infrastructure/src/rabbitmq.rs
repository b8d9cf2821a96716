use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery as AmqpDelivery,
    options::*,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info};

use courier_core::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerCredentials, CourierError,
    CourierResult, Delivery, DeliveryStream, HeaderValue, MessageHeaders, PublishConfirm,
    PublishProperties, QueueDeclaration,
};

const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

/// 基于 lapin 的 RabbitMQ 连接工厂
#[derive(Debug, Clone, Default)]
pub struct RabbitMqConnector;

#[async_trait]
impl BrokerConnector for RabbitMqConnector {
    async fn connect(&self, credentials: &BrokerCredentials) -> CourierResult<Arc<dyn BrokerConnection>> {
        let connection = Connection::connect(&credentials.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(|e| {
                CourierError::Connection(format!("连接RabbitMQ失败 {}: {e}", credentials.redacted()))
            })?;

        info!("成功连接到RabbitMQ: {}", credentials.redacted());
        Ok(Arc::new(RabbitMqConnection { connection }))
    }
}

pub struct RabbitMqConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for RabbitMqConnection {
    async fn create_channel(&self) -> CourierResult<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| CourierError::Connection(format!("创建通道失败: {e}")))?;
        Ok(Arc::new(RabbitMqChannel { channel }))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> CourierResult<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| CourierError::Connection(format!("关闭连接失败: {e}")))
    }
}

pub struct RabbitMqChannel {
    channel: Channel,
}

impl RabbitMqChannel {
    fn channel_error(action: &str, e: lapin::Error) -> CourierError {
        CourierError::Channel(format!("{action}失败: {e}"))
    }
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    async fn declare_queue(&self, name: &str, declaration: &QueueDeclaration) -> CourierResult<u32> {
        let mut arguments = FieldTable::default();
        if let Some(target) = &declaration.dead_letter {
            arguments.insert(
                DEAD_LETTER_EXCHANGE_ARG.into(),
                AMQPValue::LongString(target.exchange.clone().into()),
            );
            arguments.insert(
                DEAD_LETTER_ROUTING_KEY_ARG.into(),
                AMQPValue::LongString(target.routing_key.clone().into()),
            );
        }

        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: declaration.passive,
                    durable: declaration.durable,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| {
                if declaration.passive {
                    Self::channel_error(&format!("被动声明队列 {name} "), e)
                } else {
                    CourierError::topology(name, e.to_string())
                }
            })?;

        debug!("队列 {} 声明成功, 就绪消息 {}", name, queue.message_count());
        Ok(queue.message_count())
    }

    async fn declare_exchange(&self, name: &str) -> CourierResult<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| CourierError::topology(name, format!("声明交换机失败: {e}")))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> CourierResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| CourierError::topology(queue, format!("绑定到交换机 {exchange} 失败: {e}")))
    }

    async fn set_prefetch(&self, count: u16) -> CourierResult<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| Self::channel_error("设置prefetch", e))
    }

    async fn enable_publisher_confirms(&self) -> CourierResult<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| Self::channel_error("开启发布确认", e))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> CourierResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Self::channel_error(&format!("创建消费者 {consumer_tag} "), e))?;

        debug!("为队列 {} 创建消费者: {}", queue, consumer_tag);
        Ok(consumer
            .map(|item| {
                item.map(convert_delivery)
                    .map_err(|e| CourierError::Connection(format!("消费流中断: {e}")))
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> CourierResult<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| Self::channel_error("取消消费者", e))
    }

    async fn ack(&self, delivery_tag: u64) -> CourierResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| Self::channel_error("确认消息", e))
    }

    async fn reject(&self, delivery_tag: u64) -> CourierResult<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| Self::channel_error("拒绝消息", e))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> CourierResult<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| Self::channel_error("nack消息", e))
    }

    async fn get(&self, queue: &str) -> CourierResult<Option<Delivery>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions::default())
            .await
            .map_err(|e| Self::channel_error(&format!("从队列 {queue} 拉取消息"), e))?;
        Ok(message.map(|m| convert_delivery(m.delivery)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> CourierResult<PublishConfirm> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                to_basic_properties(properties),
            )
            .await
            .map_err(|e| Self::channel_error(&format!("发布消息到 {exchange}/{routing_key} "), e))?;

        Ok(Box::pin(async move {
            match confirm.await {
                Ok(Confirmation::Nack(_)) => Err(CourierError::Channel("broker拒绝了消息(nack)".to_string())),
                Ok(_) => Ok(()),
                Err(e) => Err(CourierError::Channel(format!("消息发布确认失败: {e}"))),
            }
        }))
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> CourierResult<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| Self::channel_error("关闭通道", e))
    }
}

fn to_basic_properties(properties: &PublishProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if properties.persistent {
        basic = basic.with_delivery_mode(2);
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if !properties.headers.is_empty() {
        basic = basic.with_headers(encode_headers(&properties.headers));
    }
    basic
}

fn encode_headers(headers: &MessageHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        let value = match value {
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
            HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
            HeaderValue::Str(s) => AMQPValue::LongString(s.clone().into()),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}

fn decode_headers(table: &FieldTable) -> MessageHeaders {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
                AMQPValue::ShortShortInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::ShortShortUInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::ShortInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::ShortUInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::LongInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::LongUInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
                AMQPValue::ShortString(s) => HeaderValue::Str(s.as_str().to_string()),
                AMQPValue::LongString(s) => {
                    HeaderValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned())
                }
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

fn convert_delivery(delivery: AmqpDelivery) -> Delivery {
    let properties = &delivery.properties;
    Delivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        headers: properties
            .headers()
            .as_ref()
            .map(decode_headers)
            .unwrap_or_default(),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|content_type| content_type.as_str().to_string()),
        persistent: *properties.delivery_mode() == Some(2),
        data: delivery.data,
    }
}
