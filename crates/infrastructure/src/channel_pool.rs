use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_core::{BrokerChannel, BrokerConnection, BrokerConnector, BrokerCredentials, CourierError, CourierResult};

use crate::reconnect::ReconnectPolicy;

/// 通道用途，消费通道和发布通道分属两个子池
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPurpose {
    Consume,
    Publish,
}

impl fmt::Display for ChannelPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelPurpose::Consume => write!(f, "consume"),
            ChannelPurpose::Publish => write!(f, "publish"),
        }
    }
}

/// 连接池状态快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPoolStats {
    pub connected: bool,
    /// 每次成功（重）连接后递增
    pub generation: u64,
    pub reconnects: u64,
    pub consume_in_use: usize,
    pub publish_in_use: usize,
    pub idle_consume: usize,
    pub idle_publish: usize,
    pub accepting: bool,
}

struct IdleChannel {
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
}

struct SubPool {
    size: usize,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleChannel>>,
}

impl SubPool {
    fn new(size: usize) -> Self {
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            idle: Mutex::new(Vec::new()),
        }
    }

    fn take_idle(&self, generation: u64) -> Option<Arc<dyn BrokerChannel>> {
        let mut idle = self.idle.lock();
        while let Some(candidate) = idle.pop() {
            if candidate.generation == generation && candidate.channel.is_open() {
                return Some(candidate.channel);
            }
        }
        None
    }

    fn in_use(&self) -> usize {
        if self.semaphore.is_closed() {
            return 0;
        }
        self.size.saturating_sub(self.semaphore.available_permits())
    }
}

#[derive(Default)]
struct ConnectionSlot {
    connection: Option<Arc<dyn BrokerConnection>>,
    generation: u64,
}

struct PoolInner {
    connector: Arc<dyn BrokerConnector>,
    credentials: BrokerCredentials,
    policy: ReconnectPolicy,
    slot: tokio::sync::Mutex<ConnectionSlot>,
    /// 无锁读取的当前代数
    generation: AtomicU64,
    reconnects: AtomicU64,
    consume: SubPool,
    publish: SubPool,
    closing: CancellationToken,
}

impl PoolInner {
    fn sub_pool(&self, purpose: ChannelPurpose) -> &SubPool {
        match purpose {
            ChannelPurpose::Consume => &self.consume,
            ChannelPurpose::Publish => &self.publish,
        }
    }

    fn install(&self, slot: &mut ConnectionSlot, connection: Arc<dyn BrokerConnection>) -> u64 {
        slot.connection = Some(connection);
        slot.generation += 1;
        self.generation.store(slot.generation, Ordering::SeqCst);
        self.consume.idle.lock().clear();
        self.publish.idle.lock().clear();
        slot.generation
    }

    /// 返回当前可用连接，断线时进入不限次数的退避重连
    async fn ensure_connection(&self) -> CourierResult<(Arc<dyn BrokerConnection>, u64)> {
        let mut slot = self.slot.lock().await;
        if let Some(connection) = &slot.connection {
            if connection.is_connected() {
                return Ok((connection.clone(), slot.generation));
            }
            warn!("Broker连接已断开，开始重连: {}", self.credentials.redacted());
        }

        let mut attempt: u32 = 0;
        loop {
            if self.closing.is_cancelled() {
                return Err(CourierError::PoolClosed);
            }

            match self.connector.connect(&self.credentials).await {
                Ok(connection) => {
                    let generation = self.install(&mut slot, connection.clone());
                    self.reconnects.fetch_add(1, Ordering::SeqCst);
                    counter!("courier_broker_reconnects_total").increment(1);
                    info!(generation, attempts = attempt + 1, "Broker重连成功");
                    return Ok((connection, generation));
                }
                Err(e) => {
                    let delay = self.policy.delay_for(attempt);
                    attempt = attempt.saturating_add(1);
                    counter!("courier_broker_connect_errors_total").increment(1);
                    warn!(
                        "重连失败 (第 {} 次): {}，{:?} 后重试",
                        attempt, e, delay
                    );
                    tokio::select! {
                        _ = self.closing.cancelled() => return Err(CourierError::PoolClosed),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn open_channel(
        &self,
        connection: &Arc<dyn BrokerConnection>,
        purpose: ChannelPurpose,
    ) -> CourierResult<Arc<dyn BrokerChannel>> {
        let channel = connection.create_channel().await?;
        if purpose == ChannelPurpose::Publish {
            channel.enable_publisher_confirms().await?;
        }
        debug!("新建{}通道", purpose);
        Ok(channel)
    }

    fn give_back(&self, purpose: ChannelPurpose, channel: Arc<dyn BrokerChannel>, generation: u64) {
        if self.closing.is_cancelled()
            || !channel.is_open()
            || generation != self.generation.load(Ordering::SeqCst)
        {
            return;
        }
        self.sub_pool(purpose)
            .idle
            .lock()
            .push(IdleChannel { channel, generation });
    }
}

/// 连接与通道池
///
/// 持有一条逻辑连接，按用途划分两个有界子池。池耗尽时 `acquire_channel`
/// 挂起等待；连接断开后由下一次获取触发重连，旧连接上的通道全部作废。
#[derive(Clone)]
pub struct ChannelPool {
    inner: Arc<PoolInner>,
}

impl ChannelPool {
    /// 建立初始连接，最多尝试 `initial_connect_attempts` 次
    pub async fn connect(
        connector: Arc<dyn BrokerConnector>,
        credentials: BrokerCredentials,
        policy: ReconnectPolicy,
        consume_pool_size: usize,
        publish_pool_size: usize,
    ) -> CourierResult<Self> {
        let max_attempts = policy.initial_connect_attempts().max(1);
        let mut last_error = None;
        let mut connection = None;

        for attempt in 0..max_attempts {
            match connector.connect(&credentials).await {
                Ok(conn) => {
                    connection = Some(conn);
                    break;
                }
                Err(e) => {
                    if attempt + 1 < max_attempts {
                        let delay = policy.delay_for(attempt);
                        warn!(
                            "连接broker失败 (尝试 {}/{}): {}，{:?} 后重试",
                            attempt + 1,
                            max_attempts,
                            e,
                            delay
                        );
                        sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let Some(connection) = connection else {
            let message = format!(
                "连接broker {} 失败，已尝试 {} 次: {}",
                credentials.redacted(),
                max_attempts,
                last_error.map_or("Unknown".to_string(), |e| e.to_string())
            );
            error!("{}", message);
            return Err(CourierError::Connection(message));
        };

        let inner = PoolInner {
            connector,
            credentials,
            policy,
            slot: tokio::sync::Mutex::new(ConnectionSlot::default()),
            generation: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            consume: SubPool::new(consume_pool_size),
            publish: SubPool::new(publish_pool_size),
            closing: CancellationToken::new(),
        };
        {
            let mut slot = inner.slot.lock().await;
            inner.install(&mut slot, connection);
        }
        info!(
            consume_pool_size,
            publish_pool_size,
            "已连接到broker: {}",
            inner.credentials.redacted()
        );

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// 从对应子池获取通道，池耗尽时等待
    pub async fn acquire_channel(&self, purpose: ChannelPurpose) -> CourierResult<PooledChannel> {
        let sub_pool = self.inner.sub_pool(purpose);
        let permit = sub_pool
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CourierError::PoolClosed)?;

        let (connection, generation) = self.inner.ensure_connection().await?;
        let channel = match sub_pool.take_idle(generation) {
            Some(channel) => channel,
            None => self.inner.open_channel(&connection, purpose).await?,
        };

        gauge!("courier_channels_in_use", "purpose" => purpose.to_string())
            .set(sub_pool.in_use() as f64);

        Ok(PooledChannel {
            channel,
            purpose,
            generation,
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// 归还通道；直接丢弃 `PooledChannel` 效果相同
    pub fn release_channel(&self, channel: PooledChannel) {
        drop(channel);
    }

    /// 停止接受新的通道获取请求，已借出的通道不受影响
    pub fn stop_accepting(&self) {
        self.inner.consume.semaphore.close();
        self.inner.publish.semaphore.close();
        info!("通道池停止接受新的获取请求");
    }

    pub fn is_accepting(&self) -> bool {
        !self.inner.consume.semaphore.is_closed()
    }

    /// 关闭所有空闲通道和底层连接
    pub async fn close(&self) -> CourierResult<()> {
        self.stop_accepting();
        self.inner.closing.cancel();

        let idle: Vec<IdleChannel> = [&self.inner.consume, &self.inner.publish]
            .into_iter()
            .flat_map(|sub| std::mem::take(&mut *sub.idle.lock()))
            .collect();
        for entry in idle {
            if let Err(e) = entry.channel.close().await {
                debug!("关闭空闲通道失败: {}", e);
            }
        }

        let mut slot = self.inner.slot.lock().await;
        if let Some(connection) = slot.connection.take() {
            connection.close().await?;
        }
        info!("通道池已关闭");
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.inner.policy
    }

    pub fn stats(&self) -> ChannelPoolStats {
        let connected = self
            .inner
            .slot
            .try_lock()
            .map(|slot| slot.connection.as_ref().is_some_and(|c| c.is_connected()))
            .unwrap_or(false);
        ChannelPoolStats {
            connected,
            generation: self.generation(),
            reconnects: self.inner.reconnects.load(Ordering::SeqCst),
            consume_in_use: self.inner.consume.in_use(),
            publish_in_use: self.inner.publish.in_use(),
            idle_consume: self.inner.consume.idle.lock().len(),
            idle_publish: self.inner.publish.idle.lock().len(),
            accepting: self.is_accepting(),
        }
    }
}

/// 从池中借出的通道，drop 时归还
pub struct PooledChannel {
    channel: Arc<dyn BrokerChannel>,
    purpose: ChannelPurpose,
    generation: u64,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledChannel {
    pub fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.channel.clone()
    }

    pub fn purpose(&self) -> ChannelPurpose {
        self.purpose
    }

    /// 通道所属连接的代数，重连后旧代数的通道不再可用
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_stale(&self) -> bool {
        self.generation != self.pool.generation.load(Ordering::SeqCst)
            || !self.channel.is_open()
    }
}

impl std::ops::Deref for PooledChannel {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        self.pool
            .give_back(self.purpose, self.channel.clone(), self.generation);
    }
}

impl fmt::Debug for PooledChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledChannel")
            .field("purpose", &self.purpose)
            .field("generation", &self.generation)
            .finish()
    }
}
