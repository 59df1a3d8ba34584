//! 代理适配层
//!
//! 组装引擎与钩子流水线, 对外提供启动、内联发布、客户端计数
//! 与关闭。钩子注册顺序固定: 持久化 -> 认证 -> 日志 -> 历史。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mqttbytes::QoS;
use tracing::info;

use notice_core::{Config, NoticeError, PushMessage, RateLimiter, Result};
use notice_store::StoreManager;

use crate::auth_hook::AuthHook;
use crate::engine::{Engine, EngineConfig};
use crate::hooks::HookRegistry;
use crate::log_hook::LogHook;
use crate::persist_hook::SessionPersistHook;
use crate::store_hook::MessageStoreHook;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub tcp_bind: String,
    pub ws_bind: String,
    /// 租户访问令牌, 不允许为空
    pub credential: String,
    pub default_topic: String,
    pub session_expiry: u32,
    pub message_expiry: u32,
    pub persistence_enabled: bool,
    pub persistence_path: PathBuf,
}

impl BrokerConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            tcp_bind: format!("0.0.0.0:{}", cfg.mqtt.tcp_port),
            ws_bind: format!("0.0.0.0:{}", cfg.mqtt.ws_port),
            credential: cfg.auth.token.clone(),
            default_topic: cfg.mqtt.topic.clone(),
            session_expiry: cfg.mqtt.session_expiry,
            message_expiry: cfg.mqtt.message_expiry,
            persistence_enabled: cfg.storage.enabled,
            persistence_path: PathBuf::from(&cfg.storage.path),
        }
    }
}

pub struct BrokerAdapter {
    engine: Arc<Engine>,
    config: BrokerConfig,
}

impl std::fmt::Debug for BrokerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerAdapter")
            .field("config", &self.config)
            .finish()
    }
}

impl BrokerAdapter {
    /// 构造引擎并按固定顺序注册钩子
    ///
    /// 持久化钩子最先注册, 并在监听开始前完成会话与保留消息的
    /// 恢复; 任何钩子装配失败都是致命错误。
    pub fn new(
        config: BrokerConfig,
        store: Option<Arc<StoreManager>>,
        limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Self> {
        if config.credential.is_empty() {
            return Err(NoticeError::Config("访问令牌不能为空".to_string()));
        }

        let session_expiry = Duration::from_secs(config.session_expiry as u64);
        let message_expiry = Duration::from_secs(config.message_expiry as u64);

        let mut hooks = HookRegistry::new();
        let mut restored = None;
        if config.persistence_enabled {
            let persist =
                SessionPersistHook::open(&config.persistence_path.join("mqtt"), session_expiry)?;
            restored = Some(persist.load()?);
            hooks.add(Arc::new(persist));
        }
        hooks.add(Arc::new(AuthHook::new(config.credential.clone(), limiter)));
        hooks.add(Arc::new(LogHook::new()));
        if let Some(store) = store {
            if store.enabled() {
                hooks.add(Arc::new(MessageStoreHook::new(
                    config.credential.clone(),
                    store,
                )));
            }
        }

        let engine_config = EngineConfig {
            session_expiry,
            message_expiry,
            ..EngineConfig::default()
        };
        let engine = Arc::new(Engine::new(engine_config, hooks));
        if let Some((sessions, retained)) = restored {
            engine.restore(sessions, retained);
        }

        Ok(Self { engine, config })
    }

    /// 绑定 TCP 与 WebSocket 监听; 绑定失败是致命错误
    pub async fn start(&self) -> Result<()> {
        self.engine
            .start(&self.config.tcp_bind, &self.config.ws_bind)
            .await
    }

    /// 内联发布: QoS1, 非保留
    pub async fn publish(&self, topic: &str, msg: &PushMessage) -> Result<()> {
        let payload = serde_json::to_vec(msg)?;
        self.engine
            .publish(topic, payload, QoS::AtLeastOnce, false)
            .await
    }

    pub async fn publish_to_default(&self, msg: &PushMessage) -> Result<()> {
        let topic = self.config.default_topic.clone();
        self.publish(&topic, msg).await
    }

    pub fn default_topic(&self) -> &str {
        &self.config.default_topic
    }

    /// 实际绑定的 (TCP, WebSocket) 地址, 未启动时为 None
    pub fn local_addrs(&self) -> Option<(std::net::SocketAddr, std::net::SocketAddr)> {
        self.engine.local_addrs()
    }

    /// 活动客户端数, 不含内联发布与 $ 前缀客户端
    pub fn client_count(&self) -> usize {
        self.engine.client_count()
    }

    /// 停止接入循环并断开所有连接
    pub fn close(&self) {
        info!("closing mqtt broker");
        self.engine.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notice_core::config::StorageConfig;

    fn broker_config(dir: &std::path::Path) -> BrokerConfig {
        BrokerConfig {
            tcp_bind: "127.0.0.1:0".into(),
            ws_bind: "127.0.0.1:0".into(),
            credential: "secret".into(),
            default_topic: "notice".into(),
            session_expiry: 60,
            message_expiry: 60,
            persistence_enabled: true,
            persistence_path: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_empty_credential_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = broker_config(dir.path());
        cfg.credential = String::new();
        let err = BrokerAdapter::new(cfg, None, None).unwrap_err();
        assert!(matches!(err, NoticeError::Config(_)));
    }

    #[tokio::test]
    async fn test_inline_publish_reaches_store_hook() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StoreManager::new(&StorageConfig {
            enabled: true,
            path: dir.path().to_string_lossy().into_owned(),
        }));
        let adapter =
            BrokerAdapter::new(broker_config(dir.path()), Some(store.clone()), None).unwrap();

        let msg = PushMessage::now(Some("hi".into()), "content", None, Some("webhook".into()));
        adapter.publish_to_default(&msg).await.unwrap();

        let page = store.list("secret", 0, 10).unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].content, "content");
        assert_eq!(page.messages[0].topic, "notice");
        assert_eq!(adapter.client_count(), 0);
    }
}
