use std::time::Duration;

use courier_core::BrokerCredentials;
use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerType {
    #[default]
    Rabbitmq,
    InMemory,
}

/// 断线重连的指数退避参数，重试次数不设上限
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
    /// 启动时首次连接的最大尝试次数，之后的重连不受此限制
    pub initial_connect_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            max_interval_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
            initial_connect_attempts: 5,
        }
    }
}

impl ConfigValidator for ReconnectConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.initial_interval_ms == 0 {
            return Err(crate::ConfigError::Validation(
                "message_queue.reconnect.initial_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_interval_ms < self.initial_interval_ms {
            return Err(crate::ConfigError::Validation(
                "message_queue.reconnect.max_interval_ms must be >= initial_interval_ms"
                    .to_string(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(crate::ConfigError::Validation(
                "message_queue.reconnect.multiplier must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(crate::ConfigError::Validation(
                "message_queue.reconnect.jitter_factor must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.initial_connect_attempts == 0 {
            return Err(crate::ConfigError::Validation(
                "message_queue.reconnect.initial_connect_attempts must be greater than 0"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// 死信队列巡检配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterSweepConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// 每个死信队列单次巡检处理的上限
    pub max_per_queue_tick: u32,
    /// 标记“已通知”的消息头
    pub header_key: String,
}

impl Default for DeadLetterSweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 60,
            max_per_queue_tick: 5000,
            header_key: "dlq_notified".to_string(),
        }
    }
}

impl ConfigValidator for DeadLetterSweepConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if !self.enabled {
            return Ok(());
        }
        ValidationUtils::validate_timeout(self.interval_seconds, "message_queue.dlq.interval_seconds")?;
        ValidationUtils::validate_count(
            self.max_per_queue_tick as usize,
            "message_queue.dlq.max_per_queue_tick",
            100_000,
        )?;
        ValidationUtils::validate_not_empty(&self.header_key, "message_queue.dlq.header_key")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageQueueConfig {
    pub broker: BrokerType,
    pub credentials: BrokerCredentials,
    /// 消费通道子池大小
    pub consume_pool_size: usize,
    /// 发布通道子池大小
    pub publish_pool_size: usize,
    /// 每个队列同时在途的未确认消息上限
    pub prefetch_limit: u16,
    /// 死信交换机，空字符串使用默认交换机
    pub dead_letter_exchange: String,
    pub confirm_timeout_ms: u64,
    pub shutdown_grace_seconds: u64,
    pub reconnect: ReconnectConfig,
    pub dlq: DeadLetterSweepConfig,
    /// 冒烟测试消息的标记头，值为 true 时直接确认而不调用处理器
    pub probe_header: Option<String>,
    /// 命令行诊断模式下订阅的队列
    pub queues: Vec<String>,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            broker: BrokerType::Rabbitmq,
            credentials: BrokerCredentials::default(),
            consume_pool_size: 10,
            publish_pool_size: 4,
            prefetch_limit: 10,
            dead_letter_exchange: String::new(),
            confirm_timeout_ms: 5_000,
            shutdown_grace_seconds: 30,
            reconnect: ReconnectConfig::default(),
            dlq: DeadLetterSweepConfig::default(),
            probe_header: Some("x-pytest-enabled".to_string()),
            queues: Vec::new(),
        }
    }
}

impl MessageQueueConfig {
    pub fn in_memory_default() -> Self {
        Self {
            broker: BrokerType::InMemory,
            confirm_timeout_ms: 1_000,
            shutdown_grace_seconds: 5,
            ..Self::default()
        }
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn get_type_string(&self) -> &'static str {
        match self.broker {
            BrokerType::Rabbitmq => "rabbitmq",
            BrokerType::InMemory => "in_memory",
        }
    }

    pub fn parse_type_string(type_str: &str) -> crate::ConfigResult<BrokerType> {
        match type_str.to_lowercase().as_str() {
            "rabbitmq" => Ok(BrokerType::Rabbitmq),
            "in_memory" => Ok(BrokerType::InMemory),
            _ => Err(crate::ConfigError::Validation(format!(
                "Unsupported broker type: {type_str}, supported types: rabbitmq, in_memory"
            ))),
        }
    }
}

impl ConfigValidator for MessageQueueConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.broker == BrokerType::Rabbitmq {
            match &self.credentials.url {
                Some(url) => ValidationUtils::validate_amqp_url(url, "message_queue.credentials.url")?,
                None => {
                    ValidationUtils::validate_not_empty(
                        &self.credentials.host,
                        "message_queue.credentials.host",
                    )?;
                    ValidationUtils::validate_port(self.credentials.port)?;
                    ValidationUtils::validate_not_empty(
                        &self.credentials.username,
                        "message_queue.credentials.username",
                    )?;
                }
            }
        }

        ValidationUtils::validate_count(self.consume_pool_size, "message_queue.consume_pool_size", 1024)?;
        ValidationUtils::validate_count(self.publish_pool_size, "message_queue.publish_pool_size", 1024)?;
        if self.prefetch_limit == 0 {
            return Err(crate::ConfigError::Validation(
                "message_queue.prefetch_limit must be greater than 0".to_string(),
            ));
        }
        if self.confirm_timeout_ms == 0 {
            return Err(crate::ConfigError::Validation(
                "message_queue.confirm_timeout_ms must be greater than 0".to_string(),
            ));
        }
        ValidationUtils::validate_timeout(self.shutdown_grace_seconds, "message_queue.shutdown_grace_seconds")?;

        if let Some(header) = &self.probe_header {
            ValidationUtils::validate_not_empty(header, "message_queue.probe_header")?;
        }
        for queue in &self.queues {
            ValidationUtils::validate_not_empty(queue, "message_queue.queues[]")?;
        }

        self.reconnect.validate()?;
        self.dlq.validate()?;
        Ok(())
    }
}
