use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_config::DeadLetterSweepConfig;
use courier_core::{
    header_flag, BrokerChannel, CourierError, CourierResult, Delivery, PublishProperties,
    PublishTarget, QueueDeclaration, QueueSpec,
};
use courier_infrastructure::{ChannelPool, ChannelPurpose, Publisher};

/// 死信告警出口（例如 webhook）
#[async_trait]
pub trait DeadLetterNotifier: Send + Sync {
    async fn notify(&self, queue: &str, dead_letter_queue: &str, delivery: &Delivery) -> anyhow::Result<()>;
}

/// 一次巡检的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub inspected: u32,
    pub notified: u32,
    /// 已带通知标记而跳过的消息
    pub skipped: u32,
    pub failed: u32,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.inspected += other.inspected;
        self.notified += other.notified;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// 死信队列巡检器
///
/// 周期性拉取每个死信队列中的消息，对尚未通知过的消息调用告警出口，
/// 然后带上通知标记头重新发布回同一死信队列并确认原消息。死信消息本身
/// 从不删除，只由运维人员人工处理。
pub struct DeadLetterSweeper {
    pool: ChannelPool,
    publisher: Publisher,
    specs: Vec<QueueSpec>,
    notifier: Arc<dyn DeadLetterNotifier>,
    config: DeadLetterSweepConfig,
}

impl DeadLetterSweeper {
    pub fn new(
        pool: ChannelPool,
        publisher: Publisher,
        specs: Vec<QueueSpec>,
        notifier: Arc<dyn DeadLetterNotifier>,
        config: DeadLetterSweepConfig,
    ) -> Self {
        Self {
            pool,
            publisher,
            specs,
            notifier,
            config,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let period = Duration::from_secs(self.config.interval_seconds);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            queues = self.specs.len(),
            interval = ?period,
            "死信队列巡检已启动"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let result = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        result = self.sweep_once() => result,
                    };
                    match result {
                        Ok(report) if report.inspected > 0 => info!(
                            inspected = report.inspected,
                            notified = report.notified,
                            skipped = report.skipped,
                            failed = report.failed,
                            "死信队列巡检完成"
                        ),
                        Ok(_) => debug!("死信队列为空"),
                        Err(CourierError::PoolClosed) => break,
                        Err(e) => warn!("死信队列巡检失败: {}", e),
                    }
                }
            }
        }

        info!("死信队列巡检已停止");
    }

    /// 巡检所有死信队列一次
    pub async fn sweep_once(&self) -> CourierResult<SweepReport> {
        let channel = self.pool.acquire_channel(ChannelPurpose::Consume).await?;
        let mut total = SweepReport::default();

        for spec in &self.specs {
            match self.sweep_queue(&*channel, spec).await {
                Ok(report) => total.merge(report),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => warn!(dlq = %spec.dead_letter_queue_name, "巡检死信队列失败: {}", e),
            }
        }
        Ok(total)
    }

    /// 巡检单个死信队列，每次最多处理 `max_per_queue_tick` 条
    pub async fn sweep_queue(&self, channel: &dyn BrokerChannel, spec: &QueueSpec) -> CourierResult<SweepReport> {
        let dlq = spec.dead_letter_queue_name.as_str();
        let depth = channel.declare_queue(dlq, &QueueDeclaration::passive()).await?;
        let limit = depth.min(self.config.max_per_queue_tick);

        let mut report = SweepReport::default();
        // 本轮不再处理的消息先持有，结束时统一放回，避免同一轮内重复拉取
        let mut held = Vec::new();
        let mut failure = None;

        for _ in 0..limit {
            let delivery = match channel.get(dlq).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            report.inspected += 1;

            if header_flag(&delivery.headers, &self.config.header_key) {
                report.skipped += 1;
                held.push(delivery.delivery_tag);
                continue;
            }

            match self.process_one(channel, spec, &delivery).await {
                Ok(()) => {
                    report.notified += 1;
                    counter!("courier_dlq_notified_total", "queue" => spec.name.clone()).increment(1);
                }
                Err(e) if e.is_transient() => {
                    held.push(delivery.delivery_tag);
                    failure = Some(e);
                    break;
                }
                Err(e) => {
                    report.failed += 1;
                    held.push(delivery.delivery_tag);
                    warn!(
                        queue = %spec.name,
                        dlq,
                        correlation_id = ?delivery.correlation_id,
                        "死信消息通知失败，留待下次巡检: {}",
                        e
                    );
                }
            }
        }

        // 倒序放回才能保持原有顺序
        let mut requeue_error = None;
        for delivery_tag in held.into_iter().rev() {
            if let Err(e) = channel.nack(delivery_tag, true).await {
                requeue_error.get_or_insert(e);
            }
        }
        if let Some(e) = failure.or(requeue_error) {
            return Err(e);
        }

        if report.inspected > 0 {
            debug!(
                dlq,
                depth,
                inspected = report.inspected,
                notified = report.notified,
                "死信队列巡检"
            );
        }
        Ok(report)
    }

    async fn process_one(&self, channel: &dyn BrokerChannel, spec: &QueueSpec, delivery: &Delivery) -> CourierResult<()> {
        let dlq = &spec.dead_letter_queue_name;
        self.notifier
            .notify(&spec.name, dlq, delivery)
            .await
            .map_err(|e| CourierError::Handler {
                queue: dlq.clone(),
                message: format!("死信通知失败: {e:#}"),
            })?;

        let properties = PublishProperties::copied_from(delivery)
            .with_header(self.config.header_key.clone(), true)
            .with_header(format!("{}_at", self.config.header_key), Utc::now().timestamp());
        self.publisher
            .publish_raw(&PublishTarget::Queue(dlq.clone()), &delivery.data, &properties)
            .await?;

        channel.ack(delivery.delivery_tag).await
    }
}
