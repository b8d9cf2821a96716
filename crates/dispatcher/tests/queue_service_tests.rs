use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use courier_config::MessageQueueConfig;
use courier_core::{
    header_flag, BrokerConnector, BrokerCredentials, CourierError, Delivery, HeaderValue,
    PublishProperties, QueueDeclaration, QueueSpec,
};
use courier_dispatcher::{
    DeadLetterNotifier, HandlerRegistry, JobStatus, JobStatusReporter, MessageContext,
    QueueHandler, QueueService, ServiceState,
};
use courier_infrastructure::{InMemoryBroker, TopologyManager};

const QUEUE: &str = "api.xp.grant";
const DLQ: &str = "api.xp.grant.dlq";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct XpGrant {
    user_id: u64,
    amount: i64,
}

/// 测试用运行时上下文
struct AppContext {
    xp: Arc<XpHandler>,
}

/// amount < 0 返回错误，amount == 0 panic，其余成功
struct XpHandler {
    calls: AtomicUsize,
    seen: mpsc::UnboundedSender<XpGrant>,
}

#[async_trait]
impl QueueHandler<XpGrant> for XpHandler {
    async fn handle(&self, payload: XpGrant, _context: MessageContext) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if payload.amount == 0 {
            panic!("amount must not be zero");
        }
        if payload.amount < 0 {
            anyhow::bail!("negative amount for user {}", payload.user_id);
        }
        let _ = self.seen.send(payload);
        Ok(())
    }
}

fn test_config() -> MessageQueueConfig {
    let mut config = MessageQueueConfig::in_memory_default();
    config.consume_pool_size = 4;
    config.publish_pool_size = 2;
    config.prefetch_limit = 4;
    config.shutdown_grace_seconds = 1;
    config.reconnect.initial_interval_ms = 10;
    config.reconnect.max_interval_ms = 50;
    config.dlq.enabled = false;
    config
}

fn grant(user_id: u64, amount: i64) -> Vec<u8> {
    serde_json::to_vec(&XpGrant { user_id, amount }).unwrap()
}

/// 服务启动前在 broker 中预置积压
async fn seed_backlog(broker: &InMemoryBroker, bodies: &[Vec<u8>]) {
    let connection = broker
        .connector()
        .connect(&BrokerCredentials::default())
        .await
        .unwrap();
    let channel = connection.create_channel().await.unwrap();
    TopologyManager::declare(&*channel, &QueueSpec::new(QUEUE, 4))
        .await
        .unwrap();
    for body in bodies {
        broker.publish("", QUEUE, body, &PublishProperties::default());
    }
    connection.close().await.unwrap();
}

struct Harness {
    broker: InMemoryBroker,
    service: QueueService,
    handler: Arc<XpHandler>,
    seen: mpsc::UnboundedReceiver<XpGrant>,
}

async fn start_service(broker: InMemoryBroker, config: MessageQueueConfig) -> Harness {
    start_service_with(broker, config, |service| service).await
}

async fn start_service_with(
    broker: InMemoryBroker,
    config: MessageQueueConfig,
    customize: impl FnOnce(QueueService) -> QueueService,
) -> Harness {
    let (tx, seen) = mpsc::unbounded_channel();
    let handler = Arc::new(XpHandler {
        calls: AtomicUsize::new(0),
        seen: tx,
    });
    let context = AppContext { xp: handler.clone() };

    let mut registry: HandlerRegistry<AppContext> = HandlerRegistry::new();
    registry
        .register_queue_handler(QUEUE)
        .unwrap()
        .handled_by::<XpGrant, _, _>(|ctx: &AppContext| Some(ctx.xp.clone()));

    let service = QueueService::connect(config, Arc::new(broker.connector()))
        .await
        .unwrap();
    let mut service = customize(service);
    service.start(&mut registry, &context).await.unwrap();

    Harness {
        broker,
        service,
        handler,
        seen,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met within 5s");
}

#[tokio::test]
async fn test_backlog_is_drained_including_malformed_messages() {
    let broker = InMemoryBroker::new();
    seed_backlog(&broker, &[grant(1, 10), b"{not-json".to_vec(), grant(2, 20)]).await;

    let mut h = start_service(broker, test_config()).await;
    h.service
        .wait_until_drained(Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let snapshot = h.service.drain_tracker().snapshot(QUEUE).unwrap();
    assert_eq!(snapshot.backlog_snapshot, 3);
    assert_eq!(snapshot.acknowledged_count, 3);
    assert!(snapshot.drained);

    assert_eq!(h.handler.calls.load(Ordering::SeqCst), 2);
    let dead = h.broker.ready_messages(DLQ);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].data, b"{not-json");

    h.service.stop().await.unwrap();
}

#[tokio::test]
async fn test_empty_queue_is_drained_immediately() {
    let mut h = start_service(InMemoryBroker::new(), test_config()).await;

    h.service
        .wait_until_drained(Some(Duration::from_millis(100)))
        .await
        .unwrap();
    assert!(h.broker.queue_exists(QUEUE));
    assert!(h.broker.queue_exists(DLQ));

    h.service.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_failures_are_dead_lettered() {
    let broker = InMemoryBroker::new();
    seed_backlog(&broker, &[grant(1, -5), grant(2, 0), grant(3, 1)]).await;

    let mut h = start_service(broker, test_config()).await;
    h.service
        .wait_until_drained(Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let dead = h.broker.ready_messages(DLQ);
    assert_eq!(dead.len(), 2);
    assert!(dead.iter().all(|m| matches!(
        m.headers.get("x-first-death-queue"),
        Some(HeaderValue::Str(q)) if q == QUEUE
    )));
    assert_eq!(h.broker.ready_count(QUEUE), 0);
    assert_eq!(h.seen.recv().await.unwrap().user_id, 3);

    h.service.stop().await.unwrap();
}

#[tokio::test]
async fn test_live_traffic_after_drain() {
    let mut h = start_service(InMemoryBroker::new(), test_config()).await;
    h.service.wait_until_drained(None).await.unwrap();

    h.service
        .publish(QUEUE, &XpGrant { user_id: 9, amount: 90 })
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), h.seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, XpGrant { user_id: 9, amount: 90 });
    assert!(h.service.drain_tracker().is_drained());

    h.service.stop().await.unwrap();
}

#[tokio::test]
async fn test_probe_messages_are_acked_without_handler() {
    let mut h = start_service(InMemoryBroker::new(), test_config()).await;

    let properties = PublishProperties::default().with_header("x-pytest-enabled", true);
    h.service
        .publisher()
        .publish_raw(&QUEUE.into(), b"smoke", &properties)
        .await
        .unwrap();

    let tracker = h.service.drain_tracker();
    eventually(|| tracker.snapshot(QUEUE).unwrap().acknowledged_count == 1).await;
    assert_eq!(h.handler.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.broker.ready_count(DLQ), 0);

    h.service.stop().await.unwrap();
}

#[tokio::test]
async fn test_consumer_recovers_after_connection_loss() {
    let mut h = start_service(InMemoryBroker::new(), test_config()).await;
    h.service.wait_until_drained(None).await.unwrap();
    let generation_before = h.service.pool_stats().generation;

    h.broker.drop_connections();
    h.broker
        .publish("", QUEUE, &grant(5, 50), &PublishProperties::default());

    let received = tokio::time::timeout(Duration::from_secs(5), h.seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.user_id, 5);

    let stats = h.service.pool_stats();
    assert!(stats.reconnects >= 1);
    assert!(stats.generation > generation_before);

    h.service.stop().await.unwrap();
}

#[tokio::test]
async fn test_unacked_messages_are_redelivered_after_reconnect() {
    let broker = InMemoryBroker::new();
    seed_backlog(&broker, &[grant(1, 1)]).await;

    let gate = Arc::new(tokio::sync::Notify::new());
    let attempts = Arc::new(AtomicUsize::new(0));
    let redelivered = Arc::new(Mutex::new(Vec::new()));

    let mut registry: HandlerRegistry<()> = HandlerRegistry::new();
    {
        let gate = gate.clone();
        let attempts = attempts.clone();
        let redelivered = redelivered.clone();
        registry
            .register_queue_handler(QUEUE)
            .unwrap()
            .handled_by_fn(move |_grant: XpGrant, ctx: MessageContext| {
                let gate = gate.clone();
                let attempts = attempts.clone();
                let redelivered = redelivered.clone();
                async move {
                    redelivered.lock().push(ctx.redelivered);
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        gate.notified().await;
                    }
                    Ok(())
                }
            });
    }

    let mut service = QueueService::connect(test_config(), Arc::new(broker.connector()))
        .await
        .unwrap();
    service.start(&mut registry, &()).await.unwrap();

    eventually(|| attempts.load(Ordering::SeqCst) == 1).await;
    broker.drop_connections();
    gate.notify_one();

    eventually(|| attempts.load(Ordering::SeqCst) == 2).await;
    service
        .wait_until_drained(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(*redelivered.lock(), vec![false, true]);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_live_traffic_resumes_without_waiting_for_abandoned_handlers() {
    let broker = InMemoryBroker::new();
    seed_backlog(&broker, &[grant(1, 1)]).await;

    let slow_started = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(Mutex::new(Vec::new()));

    let mut registry: HandlerRegistry<()> = HandlerRegistry::new();
    {
        let slow_started = slow_started.clone();
        let handled = handled.clone();
        registry
            .register_queue_handler(QUEUE)
            .unwrap()
            .handled_by_fn(move |grant: XpGrant, _ctx: MessageContext| {
                let slow_started = slow_started.clone();
                let handled = handled.clone();
                async move {
                    if grant.user_id == 1 {
                        slow_started.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                    handled.lock().push(grant.user_id);
                    Ok(())
                }
            });
    }

    let mut config = test_config();
    config.shutdown_grace_seconds = 30;
    let mut service = QueueService::connect(config, Arc::new(broker.connector()))
        .await
        .unwrap();
    service.start(&mut registry, &()).await.unwrap();

    eventually(|| slow_started.load(Ordering::SeqCst) == 1).await;
    broker.drop_connections();
    let dropped_at = tokio::time::Instant::now();
    broker.publish("", QUEUE, &grant(2, 2), &PublishProperties::default());

    eventually(|| handled.lock().contains(&2)).await;
    assert!(
        dropped_at.elapsed() < Duration::from_secs(1),
        "live message waited {:?} for handlers on the dead channel",
        dropped_at.elapsed()
    );

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_handlers_are_bounded_by_prefetch() {
    let broker = InMemoryBroker::new();
    let backlog: Vec<Vec<u8>> = (1..=8).map(|user_id| grant(user_id, 1)).collect();
    seed_backlog(&broker, &backlog).await;

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut registry: HandlerRegistry<()> = HandlerRegistry::new();
    {
        let running = running.clone();
        let peak = peak.clone();
        registry
            .register_queue_handler(QUEUE)
            .unwrap()
            .handled_by_fn(move |_grant: XpGrant, _ctx: MessageContext| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            });
    }

    let mut config = test_config();
    config.prefetch_limit = 3;
    let mut service = QueueService::connect(config, Arc::new(broker.connector()))
        .await
        .unwrap();
    service.start(&mut registry, &()).await.unwrap();

    service
        .wait_until_drained(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(running.load(Ordering::SeqCst), 0);
    assert_eq!(broker.ready_count(QUEUE), 0);

    service.stop().await.unwrap();
}

#[derive(Default)]
struct RecordingReporter {
    statuses: Mutex<Vec<(Uuid, JobStatus)>>,
}

#[async_trait]
impl JobStatusReporter for RecordingReporter {
    async fn report(&self, job_id: Uuid, status: JobStatus) -> anyhow::Result<()> {
        self.statuses.lock().push((job_id, status));
        Ok(())
    }
}

#[tokio::test]
async fn test_job_status_is_reported_for_tracked_messages() {
    let broker = InMemoryBroker::new();
    let ok_job = Uuid::new_v4();
    let failed_job = Uuid::new_v4();
    {
        let connection = broker
            .connector()
            .connect(&BrokerCredentials::default())
            .await
            .unwrap();
        let channel = connection.create_channel().await.unwrap();
        TopologyManager::declare(&*channel, &QueueSpec::new(QUEUE, 4))
            .await
            .unwrap();
        broker.publish(
            "",
            QUEUE,
            &grant(1, 1),
            &PublishProperties::default().with_correlation_id(ok_job.to_string()),
        );
        broker.publish(
            "",
            QUEUE,
            &grant(2, -1),
            &PublishProperties::default().with_correlation_id(failed_job.to_string()),
        );
        broker.publish(
            "",
            QUEUE,
            &grant(3, 3),
            &PublishProperties::default().with_correlation_id("not-a-uuid"),
        );
        connection.close().await.unwrap();
    }

    let reporter = Arc::new(RecordingReporter::default());
    let reporter_handle = reporter.clone();
    let mut h = start_service_with(broker, test_config(), move |service| {
        service.with_job_status_reporter(reporter_handle)
    })
    .await;
    h.service
        .wait_until_drained(Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let statuses = reporter.statuses.lock().clone();
    assert_eq!(statuses.len(), 4);
    assert!(statuses.contains(&(ok_job, JobStatus::Succeeded)));
    assert!(statuses.contains(&(ok_job, JobStatus::Processing)));
    assert!(statuses.iter().any(|(id, status)| *id == failed_job
        && matches!(status, JobStatus::Failed { error_code, .. } if error_code == "handler_error")));

    h.service.stop().await.unwrap();
}

#[tokio::test]
async fn test_graceful_stop_waits_for_in_flight_handler() {
    let broker = InMemoryBroker::new();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let finished = Arc::new(AtomicUsize::new(0));

    let mut registry: HandlerRegistry<()> = HandlerRegistry::new();
    {
        let finished = finished.clone();
        registry
            .register_queue_handler(QUEUE)
            .unwrap()
            .handled_by_fn(move |_grant: XpGrant, _ctx: MessageContext| {
                let started_tx = started_tx.clone();
                let finished = finished.clone();
                async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
    }

    let mut service = QueueService::connect(test_config(), Arc::new(broker.connector()))
        .await
        .unwrap();
    service.start(&mut registry, &()).await.unwrap();
    service
        .publish(QUEUE, &XpGrant { user_id: 1, amount: 1 })
        .await
        .unwrap();

    started_rx.recv().await.unwrap();
    service.stop().await.unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(broker.ready_count(QUEUE), 0);
    assert_eq!(broker.ready_count(DLQ), 0);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(service.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn test_stop_abandons_handlers_exceeding_grace() {
    let broker = InMemoryBroker::new();
    seed_backlog(&broker, &[grant(1, 1)]).await;

    let mut registry: HandlerRegistry<()> = HandlerRegistry::new();
    registry
        .register_queue_handler(QUEUE)
        .unwrap()
        .handled_by_fn(|_grant: XpGrant, _ctx: MessageContext| async move {
            futures::future::pending::<()>().await;
            Ok(())
        });

    let mut service = QueueService::connect(test_config(), Arc::new(broker.connector()))
        .await
        .unwrap();
    service.start(&mut registry, &()).await.unwrap();

    let result = service
        .wait_until_drained(Some(Duration::from_millis(100)))
        .await;
    assert!(matches!(result, Err(CourierError::DrainTimeout(_))));

    service.stop().await.unwrap();

    // 未确认的消息回到主队列，没有进入死信队列
    let requeued = broker.ready_messages(QUEUE);
    assert_eq!(requeued.len(), 1);
    assert!(requeued[0].redelivered);
    assert_eq!(broker.ready_count(DLQ), 0);
}

#[tokio::test]
async fn test_publish_after_stop_is_rejected() {
    let mut h = start_service(InMemoryBroker::new(), test_config()).await;
    h.service.stop().await.unwrap();

    let result = h.service.publish(QUEUE, &XpGrant { user_id: 1, amount: 1 }).await;
    assert!(matches!(result, Err(CourierError::PoolClosed)));
    // 重复 stop 是空操作
    h.service.stop().await.unwrap();
}

#[tokio::test]
async fn test_conflicting_topology_fails_start() {
    let broker = InMemoryBroker::new();
    {
        let connection = broker
            .connector()
            .connect(&BrokerCredentials::default())
            .await
            .unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel
            .declare_queue(QUEUE, &QueueDeclaration::durable())
            .await
            .unwrap();
        connection.close().await.unwrap();
    }

    let mut registry: HandlerRegistry<()> = HandlerRegistry::new();
    registry
        .register_queue_handler(QUEUE)
        .unwrap()
        .handled_by_fn(|_grant: XpGrant, _ctx: MessageContext| async move { Ok(()) });

    let mut service = QueueService::connect(test_config(), Arc::new(broker.connector()))
        .await
        .unwrap();
    let result = service.start(&mut registry, &()).await;

    assert!(matches!(result, Err(CourierError::Topology { .. })));
    assert_eq!(service.state(), ServiceState::Stopped);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_start_requires_enough_consume_channels() {
    let mut config = test_config();
    config.consume_pool_size = 1;

    let mut registry: HandlerRegistry<()> = HandlerRegistry::new();
    for queue in ["api.a", "api.b"] {
        registry
            .register_queue_handler(queue)
            .unwrap()
            .handled_by_fn(|_payload: serde_json::Value, _ctx: MessageContext| async move { Ok(()) });
    }

    let mut service = QueueService::connect(config, Arc::new(InMemoryBroker::new().connector()))
        .await
        .unwrap();
    let result = service.start(&mut registry, &()).await;
    assert!(matches!(result, Err(CourierError::Configuration(_))));
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let mut h = start_service(InMemoryBroker::new(), test_config()).await;

    let mut registry: HandlerRegistry<()> = HandlerRegistry::new();
    let result = h.service.start(&mut registry, &()).await;
    assert!(matches!(result, Err(CourierError::Internal(_))));

    h.service.stop().await.unwrap();
}

#[tokio::test]
async fn test_unresolvable_handler_fails_start() {
    let mut registry: HandlerRegistry<Option<Arc<XpHandler>>> = HandlerRegistry::new();
    registry
        .register_queue_handler(QUEUE)
        .unwrap()
        .handled_by::<XpGrant, _, _>(|ctx: &Option<Arc<XpHandler>>| ctx.clone());

    let mut service = QueueService::connect(
        test_config(),
        Arc::new(InMemoryBroker::new().connector()),
    )
    .await
    .unwrap();
    let result = service.start(&mut registry, &None).await;
    assert!(matches!(result, Err(CourierError::HandlerResolution { .. })));
}

#[tokio::test]
async fn test_initial_connect_gives_up_after_configured_attempts() {
    let broker = InMemoryBroker::new();
    broker.refuse_next_connections(10);
    let mut config = test_config();
    config.reconnect.initial_connect_attempts = 3;

    let result = QueueService::connect(config, Arc::new(broker.connector())).await;
    assert!(matches!(result, Err(CourierError::Connection(_))));
    assert_eq!(broker.connect_attempts(), 3);
}

#[derive(Default)]
struct RecordingNotifier {
    notified: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl DeadLetterNotifier for RecordingNotifier {
    async fn notify(&self, queue: &str, _dead_letter_queue: &str, delivery: &Delivery) -> anyhow::Result<()> {
        self.notified.lock().push((queue.to_string(), delivery.data.clone()));
        Ok(())
    }
}

#[tokio::test]
async fn test_sweeper_notifies_dead_letters_once() {
    let broker = InMemoryBroker::new();
    seed_backlog(&broker, &[grant(1, -1)]).await;

    let mut config = test_config();
    config.dlq.enabled = true;
    config.dlq.interval_seconds = 1;

    let notifier = Arc::new(RecordingNotifier::default());
    let notifier_handle = notifier.clone();
    let mut h = start_service_with(broker, config, move |service| {
        service.with_dead_letter_notifier(notifier_handle)
    })
    .await;

    eventually(|| notifier.notified.lock().len() == 1).await;
    let broker = h.broker.clone();
    eventually(|| {
        broker
            .ready_messages(DLQ)
            .iter()
            .any(|m| header_flag(&m.headers, "dlq_notified"))
    })
    .await;

    // 下一轮巡检不会重复通知
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(notifier.notified.lock().len(), 1);
    assert_eq!(notifier.notified.lock()[0].0, QUEUE);
    assert_eq!(h.broker.ready_count(DLQ), 1);

    h.service.stop().await.unwrap();
}
