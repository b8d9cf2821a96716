use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息头取值，对应AMQP的布尔、整数和字符串类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

pub type MessageHeaders = BTreeMap<String, HeaderValue>;

/// 检查消息头中某个标志是否为真值：`true`、非零整数或字符串 `"true"`/`"1"`
pub fn header_flag(headers: &MessageHeaders, key: &str) -> bool {
    match headers.get(key) {
        Some(HeaderValue::Bool(flag)) => *flag,
        Some(HeaderValue::Int(n)) => *n != 0,
        Some(HeaderValue::Str(s)) => s.eq_ignore_ascii_case("true") || s == "1",
        None => false,
    }
}

/// broker 投递给消费者（或 basic.get 拉取）的一条原始消息
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub headers: MessageHeaders,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub persistent: bool,
}

/// 从出队到 ack/reject 决策之间的消息，只归处理它的消费循环所有
#[derive(Debug, Clone)]
pub struct InFlightMessage {
    pub delivery_tag: u64,
    pub queue_name: String,
    pub raw_payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub redelivered: bool,
    pub headers: MessageHeaders,
    pub correlation_id: Option<String>,
}

impl InFlightMessage {
    pub fn from_delivery(queue_name: &str, delivery: Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            queue_name: queue_name.to_string(),
            raw_payload: delivery.data,
            received_at: Utc::now(),
            redelivered: delivery.redelivered,
            headers: delivery.headers,
            correlation_id: delivery.correlation_id,
        }
    }

    /// 用于日志的负载预览（有损UTF-8，按字符截断）
    pub fn payload_preview(&self, max_chars: usize) -> String {
        let text = String::from_utf8_lossy(&self.raw_payload);
        if text.chars().count() <= max_chars {
            text.into_owned()
        } else {
            let truncated: String = text.chars().take(max_chars).collect();
            format!("{truncated}…")
        }
    }
}

/// 发布时附带的消息属性
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    /// delivery_mode = 2
    pub persistent: bool,
    pub headers: MessageHeaders,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
}

impl Default for PublishProperties {
    fn default() -> Self {
        Self {
            persistent: true,
            headers: MessageHeaders::new(),
            correlation_id: None,
            content_type: Some("application/json".to_string()),
        }
    }
}

impl PublishProperties {
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// 以一条已投递消息为模板复制属性（用于死信重新发布）
    pub fn copied_from(delivery: &Delivery) -> Self {
        Self {
            persistent: delivery.persistent,
            headers: delivery.headers.clone(),
            correlation_id: delivery.correlation_id.clone(),
            content_type: delivery.content_type.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(data: &[u8]) -> Delivery {
        Delivery {
            delivery_tag: 7,
            redelivered: false,
            data: data.to_vec(),
            headers: MessageHeaders::new(),
            correlation_id: Some("abc".into()),
            content_type: Some("application/json".into()),
            persistent: true,
        }
    }

    #[test]
    fn test_header_flag() {
        let mut headers = MessageHeaders::new();
        assert!(!header_flag(&headers, "x-pytest-enabled"));

        headers.insert("x-pytest-enabled".into(), false.into());
        assert!(!header_flag(&headers, "x-pytest-enabled"));

        headers.insert("x-pytest-enabled".into(), true.into());
        assert!(header_flag(&headers, "x-pytest-enabled"));
    }

    #[test]
    fn test_header_flag_accepts_truthy_values() {
        let flag = |value: HeaderValue| {
            let mut headers = MessageHeaders::new();
            headers.insert("x-pytest-enabled".into(), value);
            header_flag(&headers, "x-pytest-enabled")
        };

        assert!(flag(HeaderValue::Int(1)));
        assert!(flag(HeaderValue::Int(-3)));
        assert!(!flag(HeaderValue::Int(0)));
        assert!(flag("true".into()));
        assert!(flag("True".into()));
        assert!(flag("1".into()));
        assert!(!flag("false".into()));
        assert!(!flag("".into()));
    }

    #[test]
    fn test_in_flight_message_from_delivery() {
        let msg = InFlightMessage::from_delivery("api.xp.grant", delivery(br#"{"user_id":1}"#));
        assert_eq!(msg.delivery_tag, 7);
        assert_eq!(msg.queue_name, "api.xp.grant");
        assert_eq!(msg.correlation_id.as_deref(), Some("abc"));
        assert_eq!(msg.payload_preview(100), r#"{"user_id":1}"#);
    }

    #[test]
    fn test_payload_preview_truncates() {
        let msg = InFlightMessage::from_delivery("q", delivery("数据数据数据".as_bytes()));
        assert_eq!(msg.payload_preview(2), "数据…");

        let msg = InFlightMessage::from_delivery("q", delivery(&[0xff, 0xfe]));
        assert!(!msg.payload_preview(10).is_empty());
    }

    #[test]
    fn test_copied_properties_keep_correlation() {
        let props = PublishProperties::copied_from(&delivery(b"{}")).with_header("dlq_notified", true);
        assert!(props.persistent);
        assert_eq!(props.correlation_id.as_deref(), Some("abc"));
        assert_eq!(props.content_type.as_deref(), Some("application/json"));
        assert!(header_flag(&props.headers, "dlq_notified"));
    }
}
