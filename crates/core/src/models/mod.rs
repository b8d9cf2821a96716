//! # 数据模型
//!
//! 消息队列客户端的核心数据结构：队列声明规格、收到的投递与处理中的消息、
//! 消息头，以及发布目标与发布属性。
//!
//! ## 队列命名约定
//!
//! 每个主队列 `<queue>` 都配对一个死信队列 `<queue>.dlq`。被拒绝（不重新入队）的
//! 消息经由死信交换机路由到死信队列，供人工检查和重放。
//!
//! ## 消息生命周期
//!
//! ```text
//! received → deserializing → ack | dead-lettered   (终态)
//! received → abandoned                             (通道在决策前断开，由broker重投)
//! ```

pub mod message;
pub mod queue;

pub use message::*;
pub use queue::*;
