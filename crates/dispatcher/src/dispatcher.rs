use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use courier_core::{
    header_flag, BrokerChannel, CourierError, CourierResult, DeliveryStream, InFlightMessage,
    QueueSpec,
};
use courier_infrastructure::{ChannelPool, ChannelPurpose, PooledChannel, TopologyManager};

use crate::drain::DrainTracker;
use crate::job_status::{job_id_from, JobStatus, JobStatusReporter};
use crate::registry::{BoundHandler, MessageContext};

/// 日志中保留的负载预览长度
const PAYLOAD_PREVIEW_CHARS: usize = 512;

/// 单条消息的最终结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Acked,
    DeadLettered,
    /// 决策未能提交（通道已失效），由 broker 重新投递
    Abandoned,
}

impl MessageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageOutcome::Acked => "acked",
            MessageOutcome::DeadLettered => "dead_lettered",
            MessageOutcome::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Decision {
    Ack,
    DeadLetter,
}

/// 所有消费循环共享的依赖
pub(crate) struct DispatchShared {
    pub pool: ChannelPool,
    pub tracker: Arc<DrainTracker>,
    pub reporter: Option<Arc<dyn JobStatusReporter>>,
    pub probe_header: Option<String>,
    pub shutdown_grace: Duration,
}

/// 把一条投递转换为 ack/死信决策
#[derive(Clone)]
pub(crate) struct MessageProcessor {
    handler: BoundHandler,
    shared: Arc<DispatchShared>,
}

impl MessageProcessor {
    pub(crate) fn new(handler: BoundHandler, shared: Arc<DispatchShared>) -> Self {
        Self { handler, shared }
    }

    pub(crate) async fn process(&self, channel: Arc<dyn BrokerChannel>, message: InFlightMessage) -> MessageOutcome {
        if let Some(probe_header) = &self.shared.probe_header {
            if header_flag(&message.headers, probe_header) {
                debug!(
                    queue = %message.queue_name,
                    delivery_tag = message.delivery_tag,
                    "探测消息，直接确认"
                );
                return self.settle(channel.as_ref(), &message, Decision::Ack).await;
            }
        }

        let future = match self
            .handler
            .invoke(&message.raw_payload, MessageContext::from(&message))
        {
            Ok(future) => future,
            Err(e) => {
                error!(
                    queue = %message.queue_name,
                    delivery_tag = message.delivery_tag,
                    schema = self.handler.payload_schema,
                    payload = %message.payload_preview(PAYLOAD_PREVIEW_CHARS),
                    "消息反序列化失败，转入死信队列: {}",
                    e
                );
                counter!("courier_deserialization_errors_total", "queue" => message.queue_name.clone())
                    .increment(1);
                return self.settle(channel.as_ref(), &message, Decision::DeadLetter).await;
            }
        };

        let job_id = job_id_from(message.correlation_id.as_deref());
        self.report(job_id, JobStatus::Processing).await;

        let started = Instant::now();
        let result = AssertUnwindSafe(future).catch_unwind().await;
        histogram!("courier_handler_duration_ms", "queue" => message.queue_name.clone())
            .record(started.elapsed().as_millis() as f64);

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(("handler_error", format!("{e:#}"))),
            Err(panic) => Some(("handler_panic", panic_message(panic.as_ref()))),
        };

        match failure {
            None => {
                self.report(job_id, JobStatus::Succeeded).await;
                self.settle(channel.as_ref(), &message, Decision::Ack).await
            }
            Some((error_code, reason)) => {
                error!(
                    queue = %message.queue_name,
                    delivery_tag = message.delivery_tag,
                    correlation_id = ?message.correlation_id,
                    redelivered = message.redelivered,
                    error_code,
                    payload = %message.payload_preview(PAYLOAD_PREVIEW_CHARS),
                    "处理器执行失败，转入死信队列: {}",
                    reason
                );
                counter!("courier_handler_failures_total", "queue" => message.queue_name.clone())
                    .increment(1);
                self.report(job_id, JobStatus::failed(error_code, &reason)).await;
                self.settle(channel.as_ref(), &message, Decision::DeadLetter).await
            }
        }
    }

    async fn settle(&self, channel: &dyn BrokerChannel, message: &InFlightMessage, decision: Decision) -> MessageOutcome {
        let result = match decision {
            Decision::Ack => channel.ack(message.delivery_tag).await,
            Decision::DeadLetter => channel.reject(message.delivery_tag).await,
        };

        let outcome = match (result, decision) {
            (Ok(()), Decision::Ack) => MessageOutcome::Acked,
            (Ok(()), Decision::DeadLetter) => MessageOutcome::DeadLettered,
            (Err(e), _) => {
                warn!(
                    queue = %message.queue_name,
                    delivery_tag = message.delivery_tag,
                    "提交消息决策失败，等待broker重新投递: {}",
                    e
                );
                MessageOutcome::Abandoned
            }
        };

        if outcome != MessageOutcome::Abandoned {
            self.shared.tracker.record_ack(&message.queue_name);
        }
        counter!(
            "courier_messages_processed_total",
            "queue" => message.queue_name.clone(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        outcome
    }

    async fn report(&self, job_id: Option<Uuid>, status: JobStatus) {
        let (Some(reporter), Some(job_id)) = (&self.shared.reporter, job_id) else {
            return;
        };
        if let Err(e) = reporter.report(job_id, status.clone()).await {
            warn!(%job_id, %status, "上报任务状态失败: {:#}", e);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

pub(crate) struct Subscription {
    channel: PooledChannel,
    stream: DeliveryStream,
    consumer_tag: String,
}

/// 单个队列的消费循环
pub(crate) struct QueueConsumer {
    spec: QueueSpec,
    processor: MessageProcessor,
    shared: Arc<DispatchShared>,
    shutdown: CancellationToken,
}

impl QueueConsumer {
    pub(crate) fn new(
        spec: QueueSpec,
        handler: BoundHandler,
        shared: Arc<DispatchShared>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            spec,
            processor: MessageProcessor::new(handler, shared.clone()),
            shared,
            shutdown,
        }
    }

    /// 订阅队列：取积压深度、basic.consume，然后登记排空快照
    pub(crate) async fn subscribe(&self) -> CourierResult<Subscription> {
        let channel = self.shared.pool.acquire_channel(ChannelPurpose::Consume).await?;
        channel.set_prefetch(self.spec.prefetch_limit).await?;
        let backlog = TopologyManager::backlog_depth(&*channel, &self.spec).await?;

        let consumer_tag = format!("{}.{}", self.spec.name, Uuid::new_v4().simple());
        let stream = channel.consume(&self.spec.name, &consumer_tag).await?;
        self.shared.tracker.attach(&self.spec.name, u64::from(backlog))?;

        info!(
            queue = %self.spec.name,
            consumer_tag = %consumer_tag,
            backlog,
            prefetch = self.spec.prefetch_limit,
            "队列订阅成功"
        );
        Ok(Subscription {
            channel,
            stream,
            consumer_tag,
        })
    }

    pub(crate) async fn run(self, initial: Subscription) {
        let permits = Arc::new(Semaphore::new(usize::from(self.spec.prefetch_limit)));
        let mut in_flight: JoinSet<MessageOutcome> = JoinSet::new();
        let mut next = Some(initial);

        loop {
            let subscription = match next.take() {
                Some(subscription) => subscription,
                None => match self.resubscribe().await {
                    Some(subscription) => subscription,
                    None => break,
                },
            };
            if self.consume(subscription, &permits, &mut in_flight).await {
                break;
            }
        }

        info!(queue = %self.spec.name, "消费循环已退出");
    }

    /// 消费直到关闭或通道失效；返回 true 表示因关闭退出
    async fn consume(
        &self,
        subscription: Subscription,
        permits: &Arc<Semaphore>,
        in_flight: &mut JoinSet<MessageOutcome>,
    ) -> bool {
        let Subscription {
            channel,
            mut stream,
            consumer_tag,
        } = subscription;
        let broker_channel = channel.channel();

        let shutting_down = loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break true,

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join(&self.spec.name, joined);
                }

                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        let permit = tokio::select! {
                            _ = self.shutdown.cancelled() => break true,
                            permit = permits.clone().acquire_owned() => match permit {
                                Ok(permit) => permit,
                                Err(_) => break true,
                            },
                        };
                        let message = InFlightMessage::from_delivery(&self.spec.name, delivery);
                        let processor = self.processor.clone();
                        let channel = broker_channel.clone();
                        in_flight.spawn(async move {
                            let _permit = permit;
                            processor.process(channel, message).await
                        });
                    }
                    Some(Err(e)) => {
                        warn!(queue = %self.spec.name, "消费流中断: {}", e);
                        break false;
                    }
                    None => {
                        warn!(queue = %self.spec.name, "消费流已结束");
                        break false;
                    }
                },
            }
        };

        if shutting_down {
            if let Err(e) = channel.cancel(&consumer_tag).await {
                debug!(queue = %self.spec.name, "取消消费者失败: {}", e);
            }
        }
        drop(stream);

        // 通道已失效时在途消息的决定必然落空，立即重新订阅，旧任务留在同一个 JoinSet 里继续回收
        if shutting_down || channel.is_open() {
            self.finish_in_flight(in_flight, &channel).await;
        } else if !in_flight.is_empty() {
            debug!(
                queue = %self.spec.name,
                count = in_flight.len(),
                "通道已失效，在途消息将由 broker 重新投递"
            );
        }
        shutting_down
    }

    /// 在宽限期内等待在途消息完成，超时则中止并关闭通道
    async fn finish_in_flight(&self, in_flight: &mut JoinSet<MessageOutcome>, channel: &PooledChannel) {
        if in_flight.is_empty() {
            return;
        }

        let queue = self.spec.name.as_str();
        let grace = self.shared.shutdown_grace;
        debug!(queue, count = in_flight.len(), "等待在途消息处理完成");

        let finished = tokio::time::timeout(grace, async {
            while let Some(joined) = in_flight.join_next().await {
                log_join(queue, joined);
            }
        })
        .await;

        if finished.is_err() {
            warn!(
                queue,
                remaining = in_flight.len(),
                "在途消息未在 {:?} 内完成，强制关闭通道",
                grace
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
            if let Err(e) = channel.close().await {
                debug!(queue, "关闭通道失败: {}", e);
            }
        }
    }

    /// 以退避重试重新订阅，关闭时返回 None
    async fn resubscribe(&self) -> Option<Subscription> {
        let mut attempt: u32 = 0;
        loop {
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                result = self.subscribe() => result,
            };

            match result {
                Ok(subscription) => {
                    counter!("courier_consumer_resubscribes_total", "queue" => self.spec.name.clone())
                        .increment(1);
                    return Some(subscription);
                }
                Err(CourierError::PoolClosed) => return None,
                Err(e) => {
                    let delay = self.shared.pool.policy().delay_for(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        queue = %self.spec.name,
                        attempt,
                        "重新订阅失败: {}，{:?} 后重试",
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return None,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }
}

fn log_join(queue: &str, joined: Result<MessageOutcome, JoinError>) {
    match joined {
        Ok(outcome) => debug!(queue, outcome = outcome.as_str(), "消息处理完成"),
        Err(e) if e.is_cancelled() => debug!(queue, "消息处理任务被中止"),
        Err(e) => error!(queue, "消息处理任务异常退出: {}", e),
    }
}
