use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use courier_core::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerCredentials, CourierError,
    CourierResult, DeadLetterTarget, Delivery, DeliveryStream, HeaderValue, MessageHeaders,
    PublishConfirm, PublishProperties, QueueDeclaration,
};

/// 内存 broker 实现
///
/// 按 AMQP 0-9-1 的语义在进程内模拟队列、默认交换机与 direct 交换机路由、
/// 死信参数、按通道的 prefetch 和未确认消息跟踪。通道或连接关闭时未确认的
/// 消息重新入队并带上 `redelivered` 标记。适用于嵌入式部署和测试。
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    /// 接下来拒绝的连接次数
    refuse_connections: AtomicU32,
    /// 接下来拒绝的开通道次数
    refuse_channels: AtomicU32,
    /// 为 true 时发布确认永不完成
    withhold_confirms: AtomicBool,
    connect_attempts: AtomicU32,
}

/// broker 中保存的一条消息
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub data: Vec<u8>,
    pub headers: MessageHeaders,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub persistent: bool,
    pub redelivered: bool,
}

impl StoredMessage {
    fn from_publish(payload: &[u8], properties: &PublishProperties) -> Self {
        Self {
            data: payload.to_vec(),
            headers: properties.headers.clone(),
            correlation_id: properties.correlation_id.clone(),
            content_type: properties.content_type.clone(),
            persistent: properties.persistent,
            redelivered: false,
        }
    }

    fn to_delivery(&self, delivery_tag: u64) -> Delivery {
        Delivery {
            delivery_tag,
            redelivered: self.redelivered,
            data: self.data.clone(),
            headers: self.headers.clone(),
            correlation_id: self.correlation_id.clone(),
            content_type: self.content_type.clone(),
            persistent: self.persistent,
        }
    }
}

struct QueueState {
    durable: bool,
    dead_letter: Option<DeadLetterTarget>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

struct ConsumerEntry {
    tag: String,
    channel_id: u64,
    sender: mpsc::UnboundedSender<CourierResult<Delivery>>,
}

struct ChannelState {
    connection_id: u64,
    open: bool,
    prefetch: u16,
    unacked: HashMap<u64, (String, StoredMessage)>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    /// 交换机名 -> (队列, 路由键) 绑定
    exchanges: HashMap<String, Vec<(String, String)>>,
    channels: HashMap<u64, ChannelState>,
    connections: HashMap<u64, bool>,
    next_id: u64,
    next_delivery_tag: u64,
}

impl BrokerState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel_id: u64) -> bool {
        self.channels.get(&channel_id).is_some_and(|ch| {
            ch.open && self.connections.get(&ch.connection_id).copied().unwrap_or(false)
        })
    }

    fn ensure_open(&self, channel_id: u64) -> CourierResult<()> {
        if self.channel_open(channel_id) {
            Ok(())
        } else {
            Err(CourierError::Channel(format!("通道 {channel_id} 已关闭")))
        }
    }

    fn declare_queue(&mut self, name: &str, declaration: &QueueDeclaration) -> CourierResult<u32> {
        if let Some(existing) = self.queues.get(name) {
            if !declaration.passive
                && (existing.durable != declaration.durable
                    || existing.dead_letter != declaration.dead_letter)
            {
                return Err(CourierError::topology(
                    name,
                    "PRECONDITION_FAILED - 队列参数与已有声明不一致",
                ));
            }
            return Ok(existing.ready.len() as u32);
        }

        if declaration.passive {
            return Err(CourierError::Channel(format!(
                "NOT_FOUND - no queue '{name}'"
            )));
        }

        if let Some(target) = &declaration.dead_letter {
            let target_exists = if target.exchange.is_empty() {
                self.queues.contains_key(&target.routing_key)
            } else {
                self.exchanges.contains_key(&target.exchange)
            };
            if !target_exists {
                return Err(CourierError::topology(
                    name,
                    format!(
                        "死信目标不存在: exchange='{}' routing_key='{}'",
                        target.exchange, target.routing_key
                    ),
                ));
            }
        }

        self.queues.insert(
            name.to_string(),
            QueueState {
                durable: declaration.durable,
                dead_letter: declaration.dead_letter.clone(),
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        Ok(0)
    }

    /// 路由消息，返回接收到消息的队列
    fn route(&mut self, exchange: &str, routing_key: &str, message: StoredMessage) -> Vec<String> {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            self.exchanges
                .get(exchange)
                .map(|bindings| {
                    bindings
                        .iter()
                        .filter(|(_, key)| key == routing_key)
                        .map(|(queue, _)| queue.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut delivered = Vec::new();
        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.ready.push_back(message.clone());
                delivered.push(target);
            }
        }
        delivered
    }

    fn dead_letter(&mut self, queue: &str, mut message: StoredMessage) {
        let Some(target) = self.queues.get(queue).and_then(|q| q.dead_letter.clone()) else {
            debug!(queue, "队列未配置死信参数，丢弃被拒绝的消息");
            return;
        };
        message.redelivered = false;
        message
            .headers
            .insert("x-first-death-queue".to_string(), HeaderValue::Str(queue.to_string()));
        for touched in self.route(&target.exchange, &target.routing_key, message) {
            self.pump(&touched);
        }
    }

    fn take_unacked(&mut self, channel_id: u64, delivery_tag: u64) -> CourierResult<(String, StoredMessage)> {
        self.ensure_open(channel_id)?;
        self.channels
            .get_mut(&channel_id)
            .and_then(|ch| ch.unacked.remove(&delivery_tag))
            .ok_or_else(|| {
                CourierError::Channel(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"))
            })
    }

    /// 把就绪消息分发给有空闲 prefetch 额度的消费者（轮询）
    fn pump(&mut self, queue_name: &str) {
        let BrokerState {
            queues,
            channels,
            next_delivery_tag,
            ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() {
            queue.consumers.retain(|c| !c.sender.is_closed());
            let count = queue.consumers.len();
            if count == 0 {
                return;
            }

            let eligible = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&idx| {
                    channels
                        .get(&queue.consumers[idx].channel_id)
                        .is_some_and(|ch| {
                            ch.open && (ch.prefetch == 0 || ch.unacked.len() < ch.prefetch as usize)
                        })
                });
            let Some(idx) = eligible else {
                return;
            };
            queue.next_consumer = (idx + 1) % count;

            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            *next_delivery_tag += 1;
            let tag = *next_delivery_tag;

            let consumer = &queue.consumers[idx];
            if consumer.sender.unbounded_send(Ok(message.to_delivery(tag))).is_err() {
                queue.ready.push_front(message);
                queue.consumers.remove(idx);
                continue;
            }
            if let Some(channel) = channels.get_mut(&consumer.channel_id) {
                channel.unacked.insert(tag, (queue_name.to_string(), message));
            }
        }
    }

    /// 关闭通道：移除其消费者，未确认消息重新入队
    fn close_channel(&mut self, channel_id: u64, failure: Option<&str>) {
        let unacked = match self.channels.get_mut(&channel_id) {
            Some(channel) if channel.open => {
                channel.open = false;
                std::mem::take(&mut channel.unacked)
            }
            _ => return,
        };

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|consumer| {
                if consumer.channel_id != channel_id {
                    return true;
                }
                if let Some(reason) = failure {
                    let _ = consumer
                        .sender
                        .unbounded_send(Err(CourierError::Connection(reason.to_string())));
                }
                false
            });
        }

        let mut entries: Vec<_> = unacked.into_iter().collect();
        entries.sort_by_key(|(tag, _)| *tag);
        let mut touched = BTreeSet::new();
        for (_, (queue_name, mut message)) in entries.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                message.redelivered = true;
                queue.ready.push_front(message);
                touched.insert(queue_name);
            }
        }
        for queue_name in touched {
            self.pump(&queue_name);
        }
    }

    fn close_connection(&mut self, connection_id: u64, failure: Option<&str>) {
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channel_ids {
            self.close_channel(channel_id, failure);
        }
        self.connections.insert(connection_id, false);
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        info!("Creating in-memory message broker");
        Self::default()
    }

    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            broker: self.clone(),
        }
    }

    /// 模拟网络故障：断开所有连接，消费流收到连接错误
    pub fn drop_connections(&self) {
        let mut state = self.inner.state.lock();
        let open: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, open)| **open)
            .map(|(id, _)| *id)
            .collect();
        warn!(connections = open.len(), "模拟断开所有内存broker连接");
        for connection_id in open {
            state.close_connection(connection_id, Some("connection reset by peer"));
        }
    }

    /// 接下来 `count` 次连接尝试将失败
    pub fn refuse_next_connections(&self, count: u32) {
        self.inner.refuse_connections.store(count, Ordering::SeqCst);
    }

    /// 接下来 `count` 次开通道请求将失败，连接保持可用
    pub fn refuse_next_channels(&self, count: u32) {
        self.inner.refuse_channels.store(count, Ordering::SeqCst);
    }

    pub fn set_withhold_confirms(&self, withhold: bool) {
        self.inner.withhold_confirms.store(withhold, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.inner
            .state
            .lock()
            .connections
            .values()
            .filter(|open| **open)
            .count()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.state.lock().queues.contains_key(queue)
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.inner.state.lock().exchanges.contains_key(exchange)
    }

    /// 就绪（未投递）的消息数
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// 就绪消息的快照
    pub fn ready_messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 所有通道上已投递但未确认的消息数
    pub fn unacked_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .channels
            .values()
            .map(|ch| ch.unacked.len())
            .sum()
    }

    /// 绕过通道直接发布，用于预置积压消息
    pub fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8], properties: &PublishProperties) {
        let mut state = self.inner.state.lock();
        let message = StoredMessage::from_publish(payload, properties);
        for touched in state.route(exchange, routing_key, message) {
            state.pump(&touched);
        }
    }
}

/// 内存 broker 的连接工厂，忽略凭据
#[derive(Clone)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn connect(&self, credentials: &BrokerCredentials) -> CourierResult<Arc<dyn BrokerConnection>> {
        let inner = &self.broker.inner;
        inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let refused = inner
            .refuse_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(CourierError::Connection(format!(
                "connection refused: {}",
                credentials.redacted()
            )));
        }

        let mut state = inner.state.lock();
        let id = state.allocate_id();
        state.connections.insert(id, true);
        debug!(connection_id = id, "内存broker连接已建立");

        Ok(Arc::new(InMemoryConnection {
            broker: self.broker.clone(),
            id,
        }))
    }
}

pub struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn create_channel(&self) -> CourierResult<Arc<dyn BrokerChannel>> {
        let mut state = self.broker.inner.state.lock();
        if !state.connections.get(&self.id).copied().unwrap_or(false) {
            return Err(CourierError::Connection("连接已关闭".to_string()));
        }
        let refused = self
            .broker
            .inner
            .refuse_channels
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(CourierError::Channel("channel.open refused".to_string()));
        }
        let id = state.allocate_id();
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                open: true,
                prefetch: 0,
                unacked: HashMap::new(),
            },
        );
        Ok(Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn is_connected(&self) -> bool {
        self.broker
            .inner
            .state
            .lock()
            .connections
            .get(&self.id)
            .copied()
            .unwrap_or(false)
    }

    async fn close(&self) -> CourierResult<()> {
        self.broker.inner.state.lock().close_connection(self.id, None);
        Ok(())
    }
}

pub struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_queue(&self, name: &str, declaration: &QueueDeclaration) -> CourierResult<u32> {
        let mut state = self.broker.inner.state.lock();
        state.ensure_open(self.id)?;
        state.declare_queue(name, declaration)
    }

    async fn declare_exchange(&self, name: &str) -> CourierResult<()> {
        let mut state = self.broker.inner.state.lock();
        state.ensure_open(self.id)?;
        state.exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> CourierResult<()> {
        let mut state = self.broker.inner.state.lock();
        state.ensure_open(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(CourierError::topology(queue, "NOT_FOUND - 绑定的队列不存在"));
        }
        let bindings = state.exchanges.get_mut(exchange).ok_or_else(|| {
            CourierError::topology(queue, format!("NOT_FOUND - no exchange '{exchange}'"))
        })?;
        let binding = (queue.to_string(), routing_key.to_string());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> CourierResult<()> {
        let mut state = self.broker.inner.state.lock();
        state.ensure_open(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = count;
        }
        Ok(())
    }

    async fn enable_publisher_confirms(&self) -> CourierResult<()> {
        self.broker.inner.state.lock().ensure_open(self.id)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> CourierResult<DeliveryStream> {
        let mut state = self.broker.inner.state.lock();
        state.ensure_open(self.id)?;
        let (sender, receiver) = mpsc::unbounded();
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| CourierError::Channel(format!("NOT_FOUND - no queue '{queue}'")))?;
        queue_state.consumers.push(ConsumerEntry {
            tag: consumer_tag.to_string(),
            channel_id: self.id,
            sender,
        });
        state.pump(queue);
        Ok(receiver.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> CourierResult<()> {
        let mut state = self.broker.inner.state.lock();
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel_id == self.id && c.tag == consumer_tag));
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> CourierResult<()> {
        let mut state = self.broker.inner.state.lock();
        let (queue, _) = state.take_unacked(self.id, delivery_tag)?;
        state.pump(&queue);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64) -> CourierResult<()> {
        let mut state = self.broker.inner.state.lock();
        let (queue, message) = state.take_unacked(self.id, delivery_tag)?;
        state.dead_letter(&queue, message);
        state.pump(&queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> CourierResult<()> {
        let mut state = self.broker.inner.state.lock();
        let (queue, mut message) = state.take_unacked(self.id, delivery_tag)?;
        if requeue {
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_front(message);
            }
        } else {
            state.dead_letter(&queue, message);
        }
        state.pump(&queue);
        Ok(())
    }

    async fn get(&self, queue: &str) -> CourierResult<Option<Delivery>> {
        let mut state = self.broker.inner.state.lock();
        state.ensure_open(self.id)?;
        let message = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| CourierError::Channel(format!("NOT_FOUND - no queue '{queue}'")))?
            .ready
            .pop_front();
        let Some(message) = message else {
            return Ok(None);
        };
        state.next_delivery_tag += 1;
        let tag = state.next_delivery_tag;
        let delivery = message.to_delivery(tag);
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.unacked.insert(tag, (queue.to_string(), message));
        }
        Ok(Some(delivery))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> CourierResult<PublishConfirm> {
        {
            let mut state = self.broker.inner.state.lock();
            state.ensure_open(self.id)?;
            if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
                return Err(CourierError::Channel(format!(
                    "NOT_FOUND - no exchange '{exchange}'"
                )));
            }
            let message = StoredMessage::from_publish(payload, properties);
            for touched in state.route(exchange, routing_key, message) {
                state.pump(&touched);
            }
        }

        if self.broker.inner.withhold_confirms.load(Ordering::SeqCst) {
            Ok(Box::pin(futures::future::pending()))
        } else {
            Ok(Box::pin(futures::future::ready(Ok(()))))
        }
    }

    fn is_open(&self) -> bool {
        self.broker.inner.state.lock().channel_open(self.id)
    }

    async fn close(&self) -> CourierResult<()> {
        self.broker.inner.state.lock().close_channel(self.id, None);
        Ok(())
    }
}
