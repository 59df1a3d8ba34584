//! 代理事件日志钩子

use async_trait::async_trait;
use mqttbytes::v4::Publish;
use tracing::{debug, info};

use crate::hooks::{ClientInfo, Hook, HookEvent};

#[derive(Default)]
pub struct LogHook;

impl LogHook {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Hook for LogHook {
    fn name(&self) -> &str {
        "log"
    }

    fn provides(&self, event: HookEvent) -> bool {
        matches!(
            event,
            HookEvent::Connect
                | HookEvent::SessionEstablished
                | HookEvent::Disconnect
                | HookEvent::Subscribed
                | HookEvent::Published
                | HookEvent::QosPublish
                | HookEvent::QosComplete
        )
    }

    async fn on_connect(&self, client: &ClientInfo) {
        info!(
            "client connected: {} from {}",
            client.client_id,
            client
                .remote_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }

    async fn on_session_established(&self, client: &ClientInfo, inflight: usize) {
        if inflight > 0 {
            // 仅在有待重发消息时记录会话恢复
            info!(
                "session resumed: {} ({} inflight messages)",
                client.client_id, inflight
            );
        } else {
            debug!("session established: {}", client.client_id);
        }
    }

    async fn on_disconnect(&self, client: &ClientInfo, graceful: bool) {
        info!(
            "client disconnected: {} (graceful: {})",
            client.client_id, graceful
        );
    }

    async fn on_subscribed(&self, client: &ClientInfo, filters: &[(String, u8)]) {
        for (filter, qos) in filters {
            info!("client {} subscribed {} (qos {})", client.client_id, filter, qos);
        }
    }

    async fn on_published(&self, client: Option<&ClientInfo>, publish: &Publish) {
        let source = client.map(|c| c.client_id.as_str()).unwrap_or("inline");
        debug!(
            "published {} bytes to {} from {}",
            publish.payload.len(),
            publish.topic,
            source
        );
    }

    async fn on_qos_publish(&self, client_id: &str, publish: &Publish, connected: bool) {
        if !connected {
            // 仅对离线目标记录排队
            info!("offline message queued for {} on {}", client_id, publish.topic);
        }
    }

    async fn on_qos_complete(&self, client_id: &str, pkid: u16) {
        debug!("qos delivery complete for {} (pkid {})", client_id, pkid);
    }
}
