use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{
    models::{Delivery, PublishProperties, QueueDeclaration},
    CourierResult,
};

/// 消费者投递流；流结束或产生错误都意味着底层通道已经失效
pub type DeliveryStream = BoxStream<'static, CourierResult<Delivery>>;

/// 发布确认：完成时表示 broker 已接收消息
pub type PublishConfirm = BoxFuture<'static, CourierResult<()>>;

/// broker 连接凭据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerCredentials {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub vhost: String,
    /// 显式给出的完整 AMQP URI，优先于上面的分项
    pub url: Option<String>,
}

impl Default for BrokerCredentials {
    fn default() -> Self {
        Self {
            username: "guest".to_string(),
            password: "guest".to_string(),
            host: "localhost".to_string(),
            port: 5672,
            vhost: "/".to_string(),
            url: None,
        }
    }
}

impl BrokerCredentials {
    /// 拼接 AMQP URI，vhost "/" 需要编码为 %2f
    pub fn amqp_uri(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let vhost = if self.vhost == "/" {
            "%2f".to_string()
        } else {
            self.vhost.trim_start_matches('/').to_string()
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, vhost
        )
    }

    /// 用于日志的地址，不含密码
    pub fn redacted(&self) -> String {
        if let Some(url) = &self.url {
            return match url.rsplit_once('@') {
                Some((_, host)) => format!("amqp://***@{host}"),
                None => url.clone(),
            };
        }
        format!("amqp://{}@{}:{}", self.username, self.host, self.port)
    }
}

/// 建立 broker 连接的工厂
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, credentials: &BrokerCredentials)
        -> CourierResult<Arc<dyn BrokerConnection>>;
}

/// 一条逻辑连接
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> CourierResult<Arc<dyn BrokerChannel>>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> CourierResult<()>;
}

/// broker 通道抽象接口
///
/// 同一通道不会被两个调用方并发持有，但单个持有者可以在多个任务中
/// 并发调用 ack/reject（与AMQP通道语义一致）。
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// 声明队列，返回就绪消息数
    async fn declare_queue(&self, name: &str, declaration: &QueueDeclaration) -> CourierResult<u32>;

    /// 声明持久化的 direct 交换机
    async fn declare_exchange(&self, name: &str) -> CourierResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> CourierResult<()>;

    /// 设置未确认消息上限，0 表示不限制
    async fn set_prefetch(&self, count: u16) -> CourierResult<()>;

    async fn enable_publisher_confirms(&self) -> CourierResult<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> CourierResult<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> CourierResult<()>;

    async fn ack(&self, delivery_tag: u64) -> CourierResult<()>;

    /// 拒绝且不重新入队，消息经死信参数路由到死信队列
    async fn reject(&self, delivery_tag: u64) -> CourierResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> CourierResult<()>;

    /// 单条拉取，需要手动确认
    async fn get(&self, queue: &str) -> CourierResult<Option<Delivery>>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> CourierResult<PublishConfirm>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> CourierResult<()>;
}
