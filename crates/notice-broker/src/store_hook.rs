//! 消息历史钩子
//!
//! 消息完成路由后写入当前租户的历史库。载荷能解析成推送消息
//! 就按字段落盘, 否则按原始文本落盘。持久化失败只记日志, 不
//! 影响在线投递。

use std::sync::Arc;

use async_trait::async_trait;
use mqttbytes::v4::Publish;
use tracing::warn;

use notice_core::PushMessage;
use notice_store::StoreManager;

use crate::hooks::{ClientInfo, Hook, HookEvent};

pub struct MessageStoreHook {
    credential: String,
    store: Arc<StoreManager>,
}

impl MessageStoreHook {
    pub fn new(credential: String, store: Arc<StoreManager>) -> Self {
        Self { credential, store }
    }
}

#[async_trait]
impl Hook for MessageStoreHook {
    fn name(&self) -> &str {
        "message-store"
    }

    fn provides(&self, event: HookEvent) -> bool {
        matches!(event, HookEvent::Published)
    }

    async fn on_published(&self, _client: Option<&ClientInfo>, publish: &Publish) {
        // 系统主题不入历史
        if publish.topic.starts_with('$') {
            return;
        }

        let result = match serde_json::from_slice::<PushMessage>(&publish.payload) {
            Ok(msg) => self.store.save(
                &self.credential,
                &publish.topic,
                msg.title,
                msg.content,
                msg.extra,
            ),
            Err(_) => self.store.save(
                &self.credential,
                &publish.topic,
                None,
                String::from_utf8_lossy(&publish.payload).into_owned(),
                None,
            ),
        };
        if let Err(e) = result {
            warn!("保存消息历史失败 (topic {}): {}", publish.topic, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqttbytes::QoS;
    use notice_core::config::StorageConfig;

    fn hook_with_store(dir: &std::path::Path) -> (MessageStoreHook, Arc<StoreManager>) {
        let store = Arc::new(StoreManager::new(&StorageConfig {
            enabled: true,
            path: dir.to_string_lossy().into_owned(),
        }));
        (
            MessageStoreHook::new("token".into(), store.clone()),
            store,
        )
    }

    #[tokio::test]
    async fn test_structured_payload_saved_by_fields() {
        let dir = tempfile::tempdir().unwrap();
        let (hook, store) = hook_with_store(dir.path());

        let payload =
            serde_json::to_vec(&PushMessage::now(Some("t".into()), "hello", None, None)).unwrap();
        let publish = Publish::new("notice", QoS::AtLeastOnce, payload);
        hook.on_published(None, &publish).await;

        let page = store.list("token", 0, 10).unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].title.as_deref(), Some("t"));
        assert_eq!(page.messages[0].content, "hello");
        assert_eq!(page.messages[0].topic, "notice");
    }

    #[tokio::test]
    async fn test_raw_payload_saved_as_content() {
        let dir = tempfile::tempdir().unwrap();
        let (hook, store) = hook_with_store(dir.path());

        let publish = Publish::new("notice", QoS::AtMostOnce, b"plain text".to_vec());
        hook.on_published(None, &publish).await;

        let page = store.list("token", 0, 10).unwrap();
        assert_eq!(page.messages[0].content, "plain text");
        assert!(page.messages[0].title.is_none());
    }

    #[tokio::test]
    async fn test_system_topics_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (hook, store) = hook_with_store(dir.path());

        let publish = Publish::new("$SYS/broker", QoS::AtMostOnce, b"x".to_vec());
        hook.on_published(None, &publish).await;

        assert_eq!(store.count("token").unwrap(), 0);
    }
}
