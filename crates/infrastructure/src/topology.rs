use tracing::{debug, info};

use courier_core::{BrokerChannel, CourierError, CourierResult, QueueDeclaration, QueueSpec};

/// 队列拓扑管理
///
/// 声明主队列及其死信队列。死信队列必须先于主队列存在，主队列的
/// `x-dead-letter-*` 参数才能指向它。所有声明都是幂等的，重连后可以重复执行。
pub struct TopologyManager;

impl TopologyManager {
    /// 声明一对队列，返回主队列当前就绪的消息数
    pub async fn declare(channel: &dyn BrokerChannel, spec: &QueueSpec) -> CourierResult<u32> {
        channel
            .declare_queue(&spec.dead_letter_queue_name, &Self::dead_letter_declaration(spec))
            .await
            .map_err(|e| Self::as_topology_error(&spec.dead_letter_queue_name, e))?;

        if !spec.uses_default_exchange() {
            channel.declare_exchange(&spec.dead_letter_exchange).await?;
            channel
                .bind_queue(
                    &spec.dead_letter_queue_name,
                    &spec.dead_letter_exchange,
                    &spec.dead_letter_queue_name,
                )
                .await?;
            debug!(
                "死信队列 {} 已绑定到交换机 {}",
                spec.dead_letter_queue_name, spec.dead_letter_exchange
            );
        }

        let ready = channel
            .declare_queue(&spec.name, &Self::primary_declaration(spec))
            .await
            .map_err(|e| Self::as_topology_error(&spec.name, e))?;

        info!(
            queue = %spec.name,
            dlq = %spec.dead_letter_queue_name,
            ready,
            "队列拓扑声明完成"
        );
        Ok(ready)
    }

    pub async fn declare_all(channel: &dyn BrokerChannel, specs: &[QueueSpec]) -> CourierResult<()> {
        for spec in specs {
            Self::declare(channel, spec).await?;
        }
        Ok(())
    }

    /// 重新声明主队列并读取就绪消息数，用于订阅前的积压快照
    pub async fn backlog_depth(channel: &dyn BrokerChannel, spec: &QueueSpec) -> CourierResult<u32> {
        channel
            .declare_queue(&spec.name, &Self::primary_declaration(spec))
            .await
    }

    pub fn primary_declaration(spec: &QueueSpec) -> QueueDeclaration {
        QueueDeclaration {
            durable: spec.durable,
            passive: false,
            dead_letter: Some(spec.dead_letter_target()),
        }
    }

    fn dead_letter_declaration(spec: &QueueSpec) -> QueueDeclaration {
        QueueDeclaration {
            durable: spec.durable,
            ..QueueDeclaration::default()
        }
    }

    fn as_topology_error(queue: &str, error: CourierError) -> CourierError {
        match error {
            CourierError::Topology { .. } => error,
            other => CourierError::topology(queue, other.to_string()),
        }
    }
}
