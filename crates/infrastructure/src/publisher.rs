use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, warn};

use courier_core::{CourierError, CourierResult, PublishProperties, PublishTarget};

use crate::channel_pool::{ChannelPool, ChannelPurpose};

/// 消息发布器
///
/// 复用连接池中的发布通道（已开启 publisher confirm）。确认超时或被 broker
/// 拒绝时直接把错误返回给调用方，是否重试由调用方决定。
#[derive(Clone)]
pub struct Publisher {
    pool: ChannelPool,
    confirm_timeout: Duration,
}

impl Publisher {
    pub fn new(pool: ChannelPool, confirm_timeout: Duration) -> Self {
        Self {
            pool,
            confirm_timeout,
        }
    }

    /// 序列化为 JSON 并以持久化消息发布
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        target: impl Into<PublishTarget>,
        payload: &T,
    ) -> CourierResult<()> {
        self.publish_with(target, payload, PublishProperties::default())
            .await
    }

    pub async fn publish_with<T: Serialize + ?Sized>(
        &self,
        target: impl Into<PublishTarget>,
        payload: &T,
        properties: PublishProperties,
    ) -> CourierResult<()> {
        let body = serde_json::to_vec(payload)?;
        self.publish_raw(&target.into(), &body, &properties).await
    }

    /// 发布已编码的消息体
    pub async fn publish_raw(
        &self,
        target: &PublishTarget,
        body: &[u8],
        properties: &PublishProperties,
    ) -> CourierResult<()> {
        let started = Instant::now();
        let channel = self.pool.acquire_channel(ChannelPurpose::Publish).await?;

        let confirm = channel
            .publish(target.exchange(), target.routing_key(), body, properties)
            .await
            .map_err(|e| {
                counter!("courier_publish_errors_total").increment(1);
                CourierError::Publish {
                    target: target.to_string(),
                    message: e.to_string(),
                }
            })?;

        match tokio::time::timeout(self.confirm_timeout, confirm).await {
            Ok(Ok(())) => {
                histogram!("courier_publish_duration_ms").record(started.elapsed().as_millis() as f64);
                counter!("courier_messages_published_total").increment(1);
                debug!("消息已发布并确认: {}", target);
                Ok(())
            }
            Ok(Err(e)) => {
                counter!("courier_publish_errors_total").increment(1);
                warn!("消息发布未被确认 {}: {}", target, e);
                Err(CourierError::Publish {
                    target: target.to_string(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                counter!("courier_publish_errors_total").increment(1);
                warn!("等待发布确认超时 {} ({:?})", target, self.confirm_timeout);
                // 确认状态未知的通道不再复用
                if let Err(e) = channel.close().await {
                    debug!("关闭超时通道失败: {}", e);
                }
                Err(CourierError::PublishNotConfirmed {
                    target: target.to_string(),
                    timeout: self.confirm_timeout,
                })
            }
        }
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory_broker::InMemoryBroker;
    use crate::reconnect::ReconnectPolicy;
    use crate::topology::TopologyManager;
    use courier_core::{header_flag, BrokerCredentials, QueueSpec};
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct XpGrant {
        user_id: u64,
        amount: i32,
    }

    async fn setup(broker: &InMemoryBroker) -> Publisher {
        let pool = ChannelPool::connect(
            Arc::new(broker.connector()),
            BrokerCredentials::default(),
            ReconnectPolicy::default(),
            1,
            1,
        )
        .await
        .unwrap();
        let channel = pool.acquire_channel(ChannelPurpose::Consume).await.unwrap();
        TopologyManager::declare(&*channel, &QueueSpec::new("api.xp.grant", 1))
            .await
            .unwrap();
        Publisher::new(pool, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_publish_serializes_payload() {
        let broker = InMemoryBroker::new();
        let publisher = setup(&broker).await;

        publisher
            .publish("api.xp.grant", &XpGrant { user_id: 7, amount: 50 })
            .await
            .unwrap();

        let stored = broker.ready_messages("api.xp.grant");
        assert_eq!(stored.len(), 1);
        assert!(stored[0].persistent);
        let decoded: XpGrant = serde_json::from_slice(&stored[0].data).unwrap();
        assert_eq!(decoded, XpGrant { user_id: 7, amount: 50 });
    }

    #[tokio::test]
    async fn test_publish_with_properties() {
        let broker = InMemoryBroker::new();
        let publisher = setup(&broker).await;

        let props = PublishProperties::default()
            .with_correlation_id("9b2c")
            .with_header("x-pytest-enabled", true);
        publisher
            .publish_with("api.xp.grant", &serde_json::json!({"user_id": 1}), props)
            .await
            .unwrap();

        let stored = broker.ready_messages("api.xp.grant");
        assert_eq!(stored[0].correlation_id.as_deref(), Some("9b2c"));
        assert!(header_flag(&stored[0].headers, "x-pytest-enabled"));
    }

    #[tokio::test]
    async fn test_missing_confirm_surfaces_distinct_error() {
        let broker = InMemoryBroker::new();
        let publisher = setup(&broker).await;
        broker.set_withhold_confirms(true);

        let result = publisher
            .publish("api.xp.grant", &XpGrant { user_id: 1, amount: 1 })
            .await;
        assert!(matches!(
            result,
            Err(CourierError::PublishNotConfirmed { .. })
        ));
        assert_eq!(publisher.pool().stats().idle_publish, 0);
    }

    #[tokio::test]
    async fn test_unknown_exchange_is_publish_error() {
        let broker = InMemoryBroker::new();
        let publisher = setup(&broker).await;

        let target = PublishTarget::Exchange {
            exchange: "missing".into(),
            routing_key: "rk".into(),
        };
        let result = publisher.publish(target, &1).await;
        assert!(matches!(result, Err(CourierError::Publish { .. })));
    }
}
