use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

/// 上报失败原因时保留的最大字符数
pub const MAX_ERROR_MESSAGE_CHARS: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Processing,
    Succeeded,
    Failed {
        error_code: String,
        error_message: String,
    },
}

impl JobStatus {
    pub fn failed(error_code: impl Into<String>, error_message: &str) -> Self {
        JobStatus::Failed {
            error_code: error_code.into(),
            error_message: error_message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 异步任务状态上报
///
/// correlation_id 是 UUID 的消息被视为外部跟踪的任务。上报失败只记录日志，
/// 不影响消息的 ack/死信决策。
#[async_trait]
pub trait JobStatusReporter: Send + Sync {
    async fn report(&self, job_id: Uuid, status: JobStatus) -> anyhow::Result<()>;
}

/// 从 correlation_id 中解析任务 ID
pub fn job_id_from(correlation_id: Option<&str>) -> Option<Uuid> {
    correlation_id.and_then(|id| Uuid::parse_str(id.trim()).ok())
}
