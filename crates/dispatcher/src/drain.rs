use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::gauge;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use courier_core::{CourierError, CourierResult};

/// 单个队列的排空进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainSnapshot {
    pub attached: bool,
    pub backlog_snapshot: u64,
    pub acknowledged_count: u64,
    pub drained: bool,
}

struct DrainState {
    attached: AtomicBool,
    backlog_snapshot: AtomicU64,
    acknowledged_count: AtomicU64,
    drained: AtomicBool,
    signal: watch::Sender<bool>,
}

impl DrainState {
    fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            attached: AtomicBool::new(false),
            backlog_snapshot: AtomicU64::new(0),
            acknowledged_count: AtomicU64::new(0),
            drained: AtomicBool::new(false),
            signal,
        }
    }

    fn snapshot(&self) -> DrainSnapshot {
        DrainSnapshot {
            attached: self.attached.load(Ordering::SeqCst),
            backlog_snapshot: self.backlog_snapshot.load(Ordering::SeqCst),
            acknowledged_count: self.acknowledged_count.load(Ordering::SeqCst),
            drained: self.drained.load(Ordering::SeqCst),
        }
    }
}

/// 启动积压排空跟踪
///
/// 每个队列在订阅成功后记录一次积压快照，终态决策（ack 或死信）累计到
/// 快照数时该队列单向切换为已排空，之后即使持续有新消息也不会回退。
/// 全局闸门在所有已注册队列都排空后打开。
pub struct DrainTracker {
    queues: DashMap<String, Arc<DrainState>>,
    pending: AtomicUsize,
    registered: AtomicBool,
    gate: watch::Sender<bool>,
}

impl DrainTracker {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            queues: DashMap::new(),
            pending: AtomicUsize::new(0),
            registered: AtomicBool::new(false),
            gate,
        }
    }

    /// 登记参与全局闸门的队列，只能调用一次
    pub fn register_queues<I, S>(&self, queue_names: I) -> CourierResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.registered.swap(true, Ordering::SeqCst) {
            return Err(CourierError::Internal("排空跟踪的队列已经登记过".to_string()));
        }

        for name in queue_names {
            let name = name.into();
            if self.queues.insert(name, Arc::new(DrainState::new())).is_none() {
                self.pending.fetch_add(1, Ordering::SeqCst);
            }
        }

        let pending = self.pending.load(Ordering::SeqCst);
        gauge!("courier_drain_pending_queues").set(pending as f64);
        if pending == 0 {
            self.gate.send_replace(true);
        }
        Ok(())
    }

    /// 记录队列订阅成功时的积压深度；重新订阅时再次调用会被忽略
    pub fn attach(&self, queue_name: &str, backlog: u64) -> CourierResult<()> {
        let state = self.state(queue_name)?;
        if state.attached.load(Ordering::SeqCst) {
            debug!(queue = queue_name, "队列已记录过积压快照，忽略");
            return Ok(());
        }

        state.backlog_snapshot.store(backlog, Ordering::SeqCst);
        state.attached.store(true, Ordering::SeqCst);
        info!(queue = queue_name, backlog, "记录启动积压快照");

        if state.acknowledged_count.load(Ordering::SeqCst) >= backlog {
            self.mark_drained(queue_name, &state);
        }
        Ok(())
    }

    /// 记录一次终态决策（ack 或死信）
    pub fn record_ack(&self, queue_name: &str) {
        let Some(state) = self.queues.get(queue_name).map(|s| s.clone()) else {
            warn!(queue = queue_name, "未登记的队列，忽略排空计数");
            return;
        };

        let acknowledged = state.acknowledged_count.fetch_add(1, Ordering::SeqCst) + 1;
        if state.attached.load(Ordering::SeqCst)
            && !state.drained.load(Ordering::SeqCst)
            && acknowledged >= state.backlog_snapshot.load(Ordering::SeqCst)
        {
            self.mark_drained(queue_name, &state);
        }
    }

    fn mark_drained(&self, queue_name: &str, state: &DrainState) {
        if state
            .drained
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        state.signal.send_replace(true);

        let remaining = self.pending.fetch_sub(1, Ordering::SeqCst) - 1;
        gauge!("courier_drain_pending_queues").set(remaining as f64);
        info!(
            queue = queue_name,
            acknowledged = state.acknowledged_count.load(Ordering::SeqCst),
            remaining,
            "队列启动积压已排空"
        );
        if remaining == 0 {
            self.gate.send_replace(true);
            info!("所有队列的启动积压已排空");
        }
    }

    /// 等待所有已登记队列排空；给定超时且超时时返回 `DrainTimeout`
    pub async fn wait_until_drained(&self, timeout: Option<Duration>) -> CourierResult<()> {
        Self::wait_on(self.gate.subscribe(), timeout).await
    }

    /// 等待单个队列排空
    pub async fn wait_queue_drained(&self, queue_name: &str, timeout: Option<Duration>) -> CourierResult<()> {
        let receiver = self.state(queue_name)?.signal.subscribe();
        Self::wait_on(receiver, timeout).await
    }

    async fn wait_on(mut receiver: watch::Receiver<bool>, timeout: Option<Duration>) -> CourierResult<()> {
        let wait = async move {
            receiver
                .wait_for(|drained| *drained)
                .await
                .map(|_| ())
                .map_err(|_| CourierError::Internal("排空信号已关闭".to_string()))
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| CourierError::DrainTimeout(limit))?,
            None => wait.await,
        }
    }

    pub fn is_drained(&self) -> bool {
        *self.gate.borrow()
    }

    pub fn snapshot(&self, queue_name: &str) -> Option<DrainSnapshot> {
        self.queues.get(queue_name).map(|state| state.snapshot())
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    fn state(&self, queue_name: &str) -> CourierResult<Arc<DrainState>> {
        self.queues
            .get(queue_name)
            .map(|state| state.clone())
            .ok_or_else(|| CourierError::Internal(format!("队列 {queue_name} 未登记到排空跟踪")))
    }
}

impl Default for DrainTracker {
    fn default() -> Self {
        Self::new()
    }
}
