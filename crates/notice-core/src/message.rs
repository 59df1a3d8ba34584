//! 消息模型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 推送消息
///
/// Webhook 或 MQTT 发布者产生的通知单元，入口侧补齐时间戳后
/// 以 JSON 形式投递给订阅者。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushMessage {
    /// 标题（可选）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// 正文，必须非空
    pub content: String,
    /// 附加数据，任意 JSON 值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
    /// 入口侧赋值的 UTC 时间戳
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// 来源标记: web | android | cli | webhook | 其他
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

impl PushMessage {
    /// 以当前 UTC 时间构造一条消息
    pub fn now(
        title: Option<String>,
        content: impl Into<String>,
        extra: Option<serde_json::Value>,
        client: Option<String>,
    ) -> Self {
        Self {
            title,
            content: content.into(),
            extra,
            timestamp: Some(Utc::now()),
            client,
        }
    }
}

/// 落盘消息
///
/// PushMessage 加上租户内单调递增的 id 与发布主题，写入后不可变。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub id: u64,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}
