//! 钩子流水线
//!
//! 引擎事件按注册顺序广播给声明消费该事件的钩子。认证与 ACL
//! 事件取所有提供者的合取，其余事件只做通知。

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use mqttbytes::v4::{Connect, Publish};

/// 引擎事件种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    ConnectAuthenticate,
    AclCheck,
    Connect,
    SessionEstablished,
    Disconnect,
    Subscribed,
    Unsubscribed,
    Published,
    QosPublish,
    QosComplete,
}

/// 钩子可见的客户端信息
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_id: String,
    pub remote_addr: Option<SocketAddr>,
    pub username: Option<String>,
    pub clean_session: bool,
}

/// 引擎钩子
///
/// 所有方法都有空默认实现，钩子只需覆盖自己 provides 的事件。
#[async_trait]
pub trait Hook: Send + Sync {
    /// 钩子标识，用于日志
    fn name(&self) -> &str;

    /// 该钩子是否消费指定事件
    fn provides(&self, event: HookEvent) -> bool;

    /// CONNECT 认证，返回 false 拒绝连接
    async fn on_connect_authenticate(&self, _client: &ClientInfo, _connect: &Connect) -> bool {
        true
    }

    /// 发布/订阅 ACL，write 为 true 表示发布
    async fn on_acl_check(&self, _client: &ClientInfo, _topic: &str, _write: bool) -> bool {
        true
    }

    async fn on_connect(&self, _client: &ClientInfo) {}

    /// 会话建立；inflight 为恢复会话时待重发的消息数
    async fn on_session_established(&self, _client: &ClientInfo, _inflight: usize) {}

    async fn on_disconnect(&self, _client: &ClientInfo, _graceful: bool) {}

    async fn on_subscribed(&self, _client: &ClientInfo, _filters: &[(String, u8)]) {}

    async fn on_unsubscribed(&self, _client: &ClientInfo, _filters: &[String]) {}

    /// 消息完成路由后触发；client 为 None 表示服务端内联发布
    async fn on_published(&self, _client: Option<&ClientInfo>, _publish: &Publish) {}

    /// QoS>0 消息进入某会话的投递队列
    async fn on_qos_publish(&self, _client_id: &str, _publish: &Publish, _connected: bool) {}

    /// QoS 投递完成（收到最终确认）
    async fn on_qos_complete(&self, _client_id: &str, _pkid: u16) {}
}

/// 有序钩子注册表
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add(&mut self, hook: Arc<dyn Hook>) {
        tracing::debug!("registered hook: {}", hook.name());
        self.hooks.push(hook);
    }

    fn providers(&self, event: HookEvent) -> impl Iterator<Item = &Arc<dyn Hook>> {
        self.hooks.iter().filter(move |h| h.provides(event))
    }

    pub async fn connect_authenticate(&self, client: &ClientInfo, connect: &Connect) -> bool {
        for hook in self.providers(HookEvent::ConnectAuthenticate) {
            if !hook.on_connect_authenticate(client, connect).await {
                return false;
            }
        }
        true
    }

    pub async fn acl_check(&self, client: &ClientInfo, topic: &str, write: bool) -> bool {
        for hook in self.providers(HookEvent::AclCheck) {
            if !hook.on_acl_check(client, topic, write).await {
                return false;
            }
        }
        true
    }

    pub async fn connect(&self, client: &ClientInfo) {
        for hook in self.providers(HookEvent::Connect) {
            hook.on_connect(client).await;
        }
    }

    pub async fn session_established(&self, client: &ClientInfo, inflight: usize) {
        for hook in self.providers(HookEvent::SessionEstablished) {
            hook.on_session_established(client, inflight).await;
        }
    }

    pub async fn disconnect(&self, client: &ClientInfo, graceful: bool) {
        for hook in self.providers(HookEvent::Disconnect) {
            hook.on_disconnect(client, graceful).await;
        }
    }

    pub async fn subscribed(&self, client: &ClientInfo, filters: &[(String, u8)]) {
        for hook in self.providers(HookEvent::Subscribed) {
            hook.on_subscribed(client, filters).await;
        }
    }

    pub async fn unsubscribed(&self, client: &ClientInfo, filters: &[String]) {
        for hook in self.providers(HookEvent::Unsubscribed) {
            hook.on_unsubscribed(client, filters).await;
        }
    }

    pub async fn published(&self, client: Option<&ClientInfo>, publish: &Publish) {
        for hook in self.providers(HookEvent::Published) {
            hook.on_published(client, publish).await;
        }
    }

    pub async fn qos_publish(&self, client_id: &str, publish: &Publish, connected: bool) {
        for hook in self.providers(HookEvent::QosPublish) {
            hook.on_qos_publish(client_id, publish, connected).await;
        }
    }

    pub async fn qos_complete(&self, client_id: &str, pkid: u16) {
        for hook in self.providers(HookEvent::QosComplete) {
            hook.on_qos_complete(client_id, pkid).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook {
        allow: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Hook for CountingHook {
        fn name(&self) -> &str {
            "counting"
        }

        fn provides(&self, event: HookEvent) -> bool {
            matches!(event, HookEvent::ConnectAuthenticate | HookEvent::Published)
        }

        async fn on_connect_authenticate(&self, _c: &ClientInfo, _p: &Connect) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.allow
        }

        async fn on_published(&self, _c: Option<&ClientInfo>, _p: &Publish) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn client() -> ClientInfo {
        ClientInfo {
            client_id: "c1".into(),
            remote_addr: None,
            username: None,
            clean_session: true,
        }
    }

    #[tokio::test]
    async fn test_auth_is_conjunction() {
        let mut reg = HookRegistry::new();
        reg.add(Arc::new(CountingHook {
            allow: true,
            calls: AtomicUsize::new(0),
        }));
        reg.add(Arc::new(CountingHook {
            allow: false,
            calls: AtomicUsize::new(0),
        }));

        let connect = Connect::new("c1");
        assert!(!reg.connect_authenticate(&client(), &connect).await);
    }

    #[tokio::test]
    async fn test_no_provider_defaults_allow() {
        let reg = HookRegistry::new();
        let connect = Connect::new("c1");
        assert!(reg.connect_authenticate(&client(), &connect).await);
        assert!(reg.acl_check(&client(), "notice", true).await);
    }

    #[tokio::test]
    async fn test_events_reach_providers_in_order() {
        let h1 = Arc::new(CountingHook {
            allow: true,
            calls: AtomicUsize::new(0),
        });
        let h2 = Arc::new(CountingHook {
            allow: true,
            calls: AtomicUsize::new(0),
        });
        let mut reg = HookRegistry::new();
        reg.add(h1.clone());
        reg.add(h2.clone());

        let publish = Publish::new("notice", mqttbytes::QoS::AtMostOnce, vec![1u8]);
        reg.published(None, &publish).await;
        assert_eq!(h1.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h2.calls.load(Ordering::SeqCst), 1);
    }
}
