use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use courier_config::MessageQueueConfig;
use courier_core::{BrokerConnector, CourierError, CourierResult, PublishTarget, QueueSpec};
use courier_infrastructure::{
    ChannelPool, ChannelPoolStats, ChannelPurpose, Publisher, ReconnectPolicy, TopologyManager,
};

use crate::dispatcher::{DispatchShared, QueueConsumer};
use crate::dlq_sweeper::{DeadLetterNotifier, DeadLetterSweeper};
use crate::drain::DrainTracker;
use crate::job_status::JobStatusReporter;
use crate::registry::{HandlerRegistry, HandlerTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Running,
    Stopped,
}

/// 消息队列服务
///
/// 组合连接池、拓扑声明、每个队列的消费循环、排空跟踪以及死信巡检。
/// 启动时拓扑声明或任一队列订阅失败都视为致命错误；运行期间的断线由
/// 各消费循环自行重连恢复。
pub struct QueueService {
    config: MessageQueueConfig,
    pool: ChannelPool,
    publisher: Publisher,
    tracker: Arc<DrainTracker>,
    reporter: Option<Arc<dyn JobStatusReporter>>,
    notifier: Option<Arc<dyn DeadLetterNotifier>>,
    specs: Vec<QueueSpec>,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
    state: ServiceState,
}

impl QueueService {
    /// 建立到 broker 的连接，首次连接失败按配置的次数重试
    pub async fn connect(config: MessageQueueConfig, connector: Arc<dyn BrokerConnector>) -> CourierResult<Self> {
        let policy = ReconnectPolicy::from_config(&config.reconnect);
        let pool = ChannelPool::connect(
            connector,
            config.credentials.clone(),
            policy,
            config.consume_pool_size,
            config.publish_pool_size,
        )
        .await?;
        let publisher = Publisher::new(pool.clone(), config.confirm_timeout());

        Ok(Self {
            config,
            pool,
            publisher,
            tracker: Arc::new(DrainTracker::new()),
            reporter: None,
            notifier: None,
            specs: Vec::new(),
            shutdown: CancellationToken::new(),
            tasks: JoinSet::new(),
            state: ServiceState::Created,
        })
    }

    pub fn with_job_status_reporter(mut self, reporter: Arc<dyn JobStatusReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_dead_letter_notifier(mut self, notifier: Arc<dyn DeadLetterNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// 关闭注册表、声明拓扑并订阅所有已注册队列
    pub async fn start<C: 'static>(&mut self, registry: &mut HandlerRegistry<C>, context: &C) -> CourierResult<()> {
        if self.state != ServiceState::Created {
            return Err(CourierError::Internal("消息队列服务只能启动一次".to_string()));
        }

        let handlers = registry.finalize_queue_handlers(context)?;
        if let Err(e) = self.launch(handlers).await {
            error!("消息队列服务启动失败: {}", e);
            self.shutdown.cancel();
            self.tasks.abort_all();
            self.state = ServiceState::Stopped;
            if let Err(close_err) = self.pool.close().await {
                warn!("关闭通道池失败: {}", close_err);
            }
            return Err(e);
        }

        self.state = ServiceState::Running;
        info!(queues = self.specs.len(), "消息队列服务已启动");
        Ok(())
    }

    async fn launch(&mut self, handlers: HandlerTable) -> CourierResult<()> {
        let specs: Vec<QueueSpec> = handlers
            .iter()
            .map(|handler| {
                QueueSpec::new(handler.queue_name.clone(), self.config.prefetch_limit)
                    .with_dead_letter_exchange(self.config.dead_letter_exchange.clone())
            })
            .collect();

        let sweeper_enabled = self.config.dlq.enabled && self.notifier.is_some() && !specs.is_empty();
        let required = specs.len() + usize::from(sweeper_enabled);
        if required > self.config.consume_pool_size {
            return Err(CourierError::Configuration(format!(
                "consume_pool_size ({}) 小于所需的消费通道数 ({})",
                self.config.consume_pool_size, required
            )));
        }

        self.tracker
            .register_queues(specs.iter().map(|spec| spec.name.clone()))?;

        {
            let channel = self.pool.acquire_channel(ChannelPurpose::Consume).await?;
            TopologyManager::declare_all(&*channel, &specs).await?;
        }

        let shared = Arc::new(DispatchShared {
            pool: self.pool.clone(),
            tracker: self.tracker.clone(),
            reporter: self.reporter.clone(),
            probe_header: self.config.probe_header.clone(),
            shutdown_grace: self.config.shutdown_grace(),
        });

        let mut consumers = Vec::with_capacity(specs.len());
        for spec in &specs {
            let handler = handlers.get(&spec.name).cloned().ok_or_else(|| {
                CourierError::Internal(format!("队列 {} 缺少已绑定的处理器", spec.name))
            })?;
            let consumer = QueueConsumer::new(
                spec.clone(),
                handler,
                shared.clone(),
                self.shutdown.child_token(),
            );
            let subscription = consumer.subscribe().await?;
            consumers.push((consumer, subscription));
        }

        for (consumer, subscription) in consumers {
            self.tasks.spawn(consumer.run(subscription));
        }

        if let Some(notifier) = self.notifier.clone().filter(|_| sweeper_enabled) {
            let sweeper = DeadLetterSweeper::new(
                self.pool.clone(),
                self.publisher.clone(),
                specs.clone(),
                notifier,
                self.config.dlq.clone(),
            );
            self.tasks.spawn(sweeper.run(self.shutdown.child_token()));
        }

        self.specs = specs;
        Ok(())
    }

    /// 停止消费并关闭连接
    ///
    /// 在途消息有 `shutdown_grace_seconds` 的宽限期，超时后通道被关闭，
    /// 未确认的消息由 broker 重新投递。
    pub async fn stop(&mut self) -> CourierResult<()> {
        if self.state == ServiceState::Stopped {
            return Ok(());
        }
        self.state = ServiceState::Stopped;
        info!("正在停止消息队列服务");

        self.pool.stop_accepting();
        self.shutdown.cancel();

        let deadline = self.config.shutdown_grace() + Duration::from_secs(1);
        let tasks = &mut self.tasks;
        let joined = tokio::time::timeout(deadline, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    if !e.is_cancelled() {
                        error!("消费任务异常退出: {}", e);
                    }
                }
            }
        })
        .await;

        if joined.is_err() {
            warn!(remaining = self.tasks.len(), "消费任务未在 {:?} 内退出，强制中止", deadline);
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        self.pool.close().await?;
        info!("消息队列服务已停止");
        Ok(())
    }

    /// 等待所有队列的启动积压处理完毕
    pub async fn wait_until_drained(&self, timeout: Option<Duration>) -> CourierResult<()> {
        self.tracker.wait_until_drained(timeout).await
    }

    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        target: impl Into<PublishTarget>,
        payload: &T,
    ) -> CourierResult<()> {
        self.publisher.publish(target, payload).await
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn drain_tracker(&self) -> Arc<DrainTracker> {
        self.tracker.clone()
    }

    pub fn queues(&self) -> &[QueueSpec] {
        &self.specs
    }

    pub fn pool_stats(&self) -> ChannelPoolStats {
        self.pool.stats()
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }
}

impl Drop for QueueService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
