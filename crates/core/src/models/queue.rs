use serde::{Deserialize, Serialize};

/// 死信队列名后缀
pub const DLQ_SUFFIX: &str = ".dlq";

/// 根据主队列名推导死信队列名
pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{queue}{DLQ_SUFFIX}")
}

/// 主队列及其死信配对的声明规格，每个进程生命周期内声明一次
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub dead_letter_queue_name: String,
    /// 死信交换机，空字符串表示默认交换机（按队列名路由）
    pub dead_letter_exchange: String,
    pub durable: bool,
    pub prefetch_limit: u16,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, prefetch_limit: u16) -> Self {
        let name = name.into();
        Self {
            dead_letter_queue_name: dead_letter_queue_name(&name),
            name,
            dead_letter_exchange: String::new(),
            durable: true,
            prefetch_limit,
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = exchange.into();
        self
    }

    /// 被拒绝消息的路由目标
    pub fn dead_letter_target(&self) -> DeadLetterTarget {
        DeadLetterTarget {
            exchange: self.dead_letter_exchange.clone(),
            routing_key: self.dead_letter_queue_name.clone(),
        }
    }

    pub fn uses_default_exchange(&self) -> bool {
        self.dead_letter_exchange.is_empty()
    }
}

/// `x-dead-letter-exchange` / `x-dead-letter-routing-key` 参数对
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterTarget {
    pub exchange: String,
    pub routing_key: String,
}

/// 单次 queue.declare 的参数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub durable: bool,
    pub passive: bool,
    pub dead_letter: Option<DeadLetterTarget>,
}

impl QueueDeclaration {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    /// 仅查询，不创建
    pub fn passive() -> Self {
        Self {
            passive: true,
            ..Default::default()
        }
    }

    pub fn with_dead_letter(mut self, target: DeadLetterTarget) -> Self {
        self.dead_letter = Some(target);
        self
    }
}

/// 发布目标：直接投递到队列（默认交换机），或经由具名交换机路由
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishTarget {
    Queue(String),
    Exchange {
        exchange: String,
        routing_key: String,
    },
}

impl PublishTarget {
    pub fn exchange(&self) -> &str {
        match self {
            PublishTarget::Queue(_) => "",
            PublishTarget::Exchange { exchange, .. } => exchange,
        }
    }

    pub fn routing_key(&self) -> &str {
        match self {
            PublishTarget::Queue(queue) => queue,
            PublishTarget::Exchange { routing_key, .. } => routing_key,
        }
    }
}

impl std::fmt::Display for PublishTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishTarget::Queue(queue) => write!(f, "queue:{queue}"),
            PublishTarget::Exchange {
                exchange,
                routing_key,
            } => write!(f, "exchange:{exchange}/{routing_key}"),
        }
    }
}

impl From<&str> for PublishTarget {
    fn from(queue: &str) -> Self {
        PublishTarget::Queue(queue.to_string())
    }
}

impl From<String> for PublishTarget {
    fn from(queue: String) -> Self {
        PublishTarget::Queue(queue)
    }
}
