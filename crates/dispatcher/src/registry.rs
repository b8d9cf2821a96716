//! 处理器注册表
//!
//! 两阶段：开放阶段在运行时上下文存在之前收集未绑定的处理器描述，
//! `finalize_queue_handlers` 把每个描述绑定到上下文并关闭注册表。

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use courier_core::{CourierError, CourierResult, InFlightMessage, MessageHeaders};

/// 处理器执行结果的 future
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

type Invoker = Arc<dyn Fn(&[u8], MessageContext) -> Result<HandlerFuture, serde_json::Error> + Send + Sync>;

/// 传给处理器的消息元数据
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub queue_name: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub correlation_id: Option<String>,
    pub headers: MessageHeaders,
    pub received_at: DateTime<Utc>,
}

impl From<&InFlightMessage> for MessageContext {
    fn from(message: &InFlightMessage) -> Self {
        Self {
            queue_name: message.queue_name.clone(),
            delivery_tag: message.delivery_tag,
            redelivered: message.redelivered,
            correlation_id: message.correlation_id.clone(),
            headers: message.headers.clone(),
            received_at: message.received_at,
        }
    }
}

/// 队列消息处理器
///
/// 同一队列上最多会有 `prefetch_limit` 个调用并发执行，实现必须能承受并发调用和重复投递。
#[async_trait]
pub trait QueueHandler<P>: Send + Sync + 'static {
    async fn handle(&self, payload: P, context: MessageContext) -> anyhow::Result<()>;
}

/// 把异步闭包包装成处理器
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<P, F, Fut> QueueHandler<P> for FnHandler<F>
where
    P: Send + 'static,
    F: Fn(P, MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, payload: P, context: MessageContext) -> anyhow::Result<()> {
        (self.0)(payload, context).await
    }
}

/// 绑定到运行时上下文后的处理器
#[derive(Clone)]
pub struct BoundHandler {
    pub queue_name: String,
    /// 负载类型名，用于日志
    pub payload_schema: &'static str,
    invoker: Invoker,
}

impl BoundHandler {
    /// 按队列的负载类型反序列化；失败时不会调用处理器
    pub fn invoke(&self, raw_payload: &[u8], context: MessageContext) -> Result<HandlerFuture, serde_json::Error> {
        (self.invoker)(raw_payload, context)
    }
}

impl fmt::Debug for BoundHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundHandler")
            .field("queue_name", &self.queue_name)
            .field("payload_schema", &self.payload_schema)
            .finish()
    }
}

/// 队列名到已绑定处理器的映射，按队列名排序
#[derive(Debug, Clone, Default)]
pub struct HandlerTable {
    handlers: BTreeMap<String, BoundHandler>,
}

impl HandlerTable {
    pub fn get(&self, queue_name: &str) -> Option<&BoundHandler> {
        self.handlers.get(queue_name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoundHandler> {
        self.handlers.values()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

struct HandlerDescriptor<C> {
    queue_name: String,
    payload_schema: &'static str,
    resolve: Box<dyn Fn(&C) -> Option<BoundHandler> + Send + Sync>,
}

enum RegistryState<C> {
    Open(Vec<HandlerDescriptor<C>>),
    Closed,
}

pub struct HandlerRegistry<C> {
    state: RegistryState<C>,
}

impl<C: 'static> HandlerRegistry<C> {
    pub fn new() -> Self {
        Self {
            state: RegistryState::Open(Vec::new()),
        }
    }

    /// 开始为队列注册处理器；队列已注册或注册表已关闭时立即失败
    pub fn register_queue_handler(&mut self, queue_name: impl Into<String>) -> CourierResult<HandlerRegistration<'_, C>> {
        let queue_name = queue_name.into();
        let RegistryState::Open(descriptors) = &self.state else {
            return Err(CourierError::RegistryClosed);
        };
        if descriptors.iter().any(|d| d.queue_name == queue_name) {
            return Err(CourierError::DuplicateHandler { queue: queue_name });
        }
        Ok(HandlerRegistration {
            registry: self,
            queue_name,
        })
    }

    fn push(&mut self, descriptor: HandlerDescriptor<C>) {
        if let RegistryState::Open(descriptors) = &mut self.state {
            debug!(
                "注册队列处理器: {} ({})",
                descriptor.queue_name, descriptor.payload_schema
            );
            descriptors.push(descriptor);
        }
    }

    /// 把所有描述绑定到运行时上下文，之后注册表进入关闭状态
    pub fn finalize_queue_handlers(&mut self, context: &C) -> CourierResult<HandlerTable> {
        let descriptors = match std::mem::replace(&mut self.state, RegistryState::Closed) {
            RegistryState::Open(descriptors) => descriptors,
            RegistryState::Closed => return Err(CourierError::RegistryClosed),
        };

        let mut table = HandlerTable::default();
        for descriptor in descriptors {
            let bound = (descriptor.resolve)(context).ok_or_else(|| CourierError::HandlerResolution {
                queue: descriptor.queue_name.clone(),
                message: format!("运行时上下文中找不到 {} 的处理器", descriptor.payload_schema),
            })?;
            table.handlers.insert(descriptor.queue_name, bound);
        }

        info!("处理器注册表已关闭，共绑定 {} 个队列", table.len());
        Ok(table)
    }

    pub fn queue_names(&self) -> Vec<String> {
        match &self.state {
            RegistryState::Open(descriptors) => descriptors.iter().map(|d| d.queue_name.clone()).collect(),
            RegistryState::Closed => Vec::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, RegistryState::Closed)
    }
}

impl<C: 'static> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个队列的注册构建器
#[must_use = "调用 handled_by 才会完成注册"]
pub struct HandlerRegistration<'a, C> {
    registry: &'a mut HandlerRegistry<C>,
    queue_name: String,
}

impl<'a, C: 'static> HandlerRegistration<'a, C> {
    /// `locate` 在 finalize 时从上下文中取出处理器，返回 None 视为解析失败
    pub fn handled_by<P, H, L>(self, locate: L)
    where
        P: DeserializeOwned + Send + 'static,
        H: QueueHandler<P>,
        L: Fn(&C) -> Option<Arc<H>> + Send + Sync + 'static,
    {
        let queue_name = self.queue_name;
        let payload_schema = std::any::type_name::<P>();
        let bound_queue = queue_name.clone();

        let resolve = move |context: &C| -> Option<BoundHandler> {
            let handler = locate(context)?;
            let invoker: Invoker = Arc::new(move |raw: &[u8], message_context: MessageContext| {
                let payload: P = serde_json::from_slice(raw)?;
                let handler = handler.clone();
                let future: HandlerFuture =
                    Box::pin(async move { handler.handle(payload, message_context).await });
                Ok(future)
            });
            Some(BoundHandler {
                queue_name: bound_queue.clone(),
                payload_schema,
                invoker,
            })
        };

        self.registry.push(HandlerDescriptor {
            queue_name,
            payload_schema,
            resolve: Box::new(resolve),
        });
    }

    /// 注册不依赖上下文的闭包处理器
    pub fn handled_by_fn<P, F, Fut>(self, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = Arc::new(FnHandler(handler));
        self.handled_by::<P, _, _>(move |_: &C| Some(handler.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Deserialize)]
    struct XpGrant {
        user_id: u64,
    }

    #[derive(Default)]
    struct XpHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl QueueHandler<XpGrant> for XpHandler {
        async fn handle(&self, payload: XpGrant, _context: MessageContext) -> anyhow::Result<()> {
            assert_eq!(payload.user_id, 42);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Bot {
        xp: Option<Arc<XpHandler>>,
    }

    fn context(queue: &str) -> MessageContext {
        MessageContext {
            queue_name: queue.to_string(),
            delivery_tag: 1,
            redelivered: false,
            correlation_id: None,
            headers: MessageHeaders::new(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_duplicate_registration_fails_immediately() {
        let mut registry: HandlerRegistry<Bot> = HandlerRegistry::new();
        registry
            .register_queue_handler("api.xp.grant")
            .unwrap()
            .handled_by::<XpGrant, XpHandler, _>(|bot: &Bot| bot.xp.clone());

        let err = registry.register_queue_handler("api.xp.grant").err().unwrap();
        assert!(matches!(err, CourierError::DuplicateHandler { ref queue } if queue == "api.xp.grant"));
        assert_eq!(registry.queue_names(), vec!["api.xp.grant".to_string()]);
    }

    #[tokio::test]
    async fn test_finalize_binds_to_context() {
        let mut registry: HandlerRegistry<Bot> = HandlerRegistry::new();
        registry
            .register_queue_handler("api.xp.grant")
            .unwrap()
            .handled_by::<XpGrant, XpHandler, _>(|bot: &Bot| bot.xp.clone());

        let xp = Arc::new(XpHandler::default());
        let table = registry
            .finalize_queue_handlers(&Bot { xp: Some(xp.clone()) })
            .unwrap();
        assert_eq!(table.len(), 1);

        let bound = table.get("api.xp.grant").unwrap();
        assert!(bound.payload_schema.ends_with("XpGrant"));
        bound
            .invoke(br#"{"user_id":42}"#, context("api.xp.grant"))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(xp.calls.load(Ordering::SeqCst), 1);

        assert!(bound.invoke(b"not json", context("api.xp.grant")).is_err());
        assert_eq!(xp.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resolution_failure_names_queue() {
        let mut registry: HandlerRegistry<Bot> = HandlerRegistry::new();
        registry
            .register_queue_handler("api.xp.grant")
            .unwrap()
            .handled_by::<XpGrant, XpHandler, _>(|bot: &Bot| bot.xp.clone());

        let err = registry.finalize_queue_handlers(&Bot { xp: None }).unwrap_err();
        assert!(err.to_string().contains("api.xp.grant"));
    }

    #[test]
    fn test_finalize_twice_is_an_error() {
        let mut registry: HandlerRegistry<Bot> = HandlerRegistry::new();
        registry
            .register_queue_handler("q")
            .unwrap()
            .handled_by_fn(|_: serde_json::Value, _| async { Ok(()) });

        let bot = Bot { xp: None };
        assert!(registry.finalize_queue_handlers(&bot).is_ok());
        assert!(registry.is_closed());
        assert!(matches!(
            registry.finalize_queue_handlers(&bot),
            Err(CourierError::RegistryClosed)
        ));
        assert!(matches!(
            registry.register_queue_handler("late"),
            Err(CourierError::RegistryClosed)
        ));
    }
}
