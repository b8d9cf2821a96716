//! 队列消费调度
//!
//! 处理器注册表、每队列消费循环、启动积压排空跟踪、死信巡检，
//! 以及把它们组合起来的 [`QueueService`]。

pub mod dispatcher;
pub mod dlq_sweeper;
pub mod drain;
pub mod job_status;
pub mod registry;
pub mod service;

pub use dispatcher::MessageOutcome;
pub use dlq_sweeper::{DeadLetterNotifier, DeadLetterSweeper, SweepReport};
pub use drain::{DrainSnapshot, DrainTracker};
pub use job_status::{job_id_from, JobStatus, JobStatusReporter};
pub use registry::{
    BoundHandler, FnHandler, HandlerFuture, HandlerRegistration, HandlerRegistry, HandlerTable,
    MessageContext, QueueHandler,
};
pub use service::{QueueService, ServiceState};
