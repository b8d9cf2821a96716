use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{info, warn};

use courier_config::AppConfig;
use courier_core::Delivery;
use courier_dispatcher::{
    DeadLetterNotifier, HandlerRegistry, MessageContext, QueueHandler, QueueService,
};
use courier_infrastructure::{BrokerConnectorFactory, Publisher};

/// 日志中保留的负载长度
const ECHO_PREVIEW_CHARS: usize = 256;

/// 诊断模式的 echo 处理器：记录收到的每条消息并确认
#[derive(Default)]
pub struct EchoHandler {
    handled: AtomicU64,
}

impl EchoHandler {
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueHandler<serde_json::Value> for EchoHandler {
    async fn handle(&self, payload: serde_json::Value, context: MessageContext) -> anyhow::Result<()> {
        let handled = self.handled.fetch_add(1, Ordering::SeqCst) + 1;
        let mut preview = payload.to_string();
        if preview.len() > ECHO_PREVIEW_CHARS {
            preview = preview.chars().take(ECHO_PREVIEW_CHARS).collect();
        }
        info!(
            queue = %context.queue_name,
            delivery_tag = context.delivery_tag,
            correlation_id = ?context.correlation_id,
            redelivered = context.redelivered,
            handled,
            "收到消息: {}",
            preview
        );
        Ok(())
    }
}

/// 把死信写入日志的告警出口
pub struct LoggingDeadLetterNotifier;

#[async_trait]
impl DeadLetterNotifier for LoggingDeadLetterNotifier {
    async fn notify(&self, queue: &str, dead_letter_queue: &str, delivery: &Delivery) -> anyhow::Result<()> {
        warn!(
            queue,
            dead_letter_queue,
            correlation_id = ?delivery.correlation_id,
            "发现死信消息: {}",
            String::from_utf8_lossy(&delivery.data)
        );
        Ok(())
    }
}

/// 诊断模式的运行时上下文
pub struct DiagnosticContext {
    pub echo: Arc<EchoHandler>,
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    service: QueueService,
    context: DiagnosticContext,
}

impl Application {
    /// 连接 broker 并创建服务，尚未订阅任何队列
    pub async fn new(config: AppConfig) -> Result<Self> {
        let mq = &config.message_queue;
        info!(
            broker = mq.get_type_string(),
            queues = mq.queues.len(),
            "初始化应用程序"
        );

        let connector = BrokerConnectorFactory::create(mq);
        let service = QueueService::connect(mq.clone(), connector)
            .await
            .context("连接消息队列失败")?
            .with_dead_letter_notifier(Arc::new(LoggingDeadLetterNotifier));

        Ok(Self {
            config,
            service,
            context: DiagnosticContext {
                echo: Arc::new(EchoHandler::default()),
            },
        })
    }

    /// 为配置中的每个队列注册 echo 处理器并开始消费
    pub async fn start(&mut self) -> Result<()> {
        let mut registry: HandlerRegistry<DiagnosticContext> = HandlerRegistry::new();
        for queue in &self.config.message_queue.queues {
            registry
                .register_queue_handler(queue.clone())?
                .handled_by::<serde_json::Value, EchoHandler, _>(|ctx: &DiagnosticContext| {
                    Some(ctx.echo.clone())
                });
        }

        self.service
            .start(&mut registry, &self.context)
            .await
            .context("启动消息队列服务失败")?;

        if self.service.queues().is_empty() {
            warn!("未配置任何队列 (message_queue.queues)，仅保持连接");
        }
        Ok(())
    }

    /// 运行直到收到关闭信号，然后优雅停止
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let tracker = self.service.drain_tracker();
        let drain_watch = tokio::spawn(async move {
            if tracker.wait_until_drained(None).await.is_ok() {
                info!(queues = ?tracker.queue_names(), "启动积压已全部处理");
            }
        });

        let _ = shutdown_rx.recv().await;
        drain_watch.abort();

        info!("正在停止应用程序");
        self.service.stop().await.context("停止消息队列服务失败")?;
        info!(
            handled = self.context.echo.handled(),
            "应用程序已停止"
        );
        Ok(())
    }

    pub fn publisher(&self) -> &Publisher {
        self.service.publisher()
    }

    pub fn diagnostics(&self) -> &DiagnosticContext {
        &self.context
    }

    pub async fn wait_until_drained(&self, timeout: Duration) -> Result<()> {
        self.service
            .wait_until_drained(Some(timeout))
            .await
            .context("等待启动积压处理超时")
    }
}
