//! 连接认证钩子
//!
//! CONNECT 的用户名或密码二者之一等于访问令牌即放行; 比较使用
//! 常数时间实现。认证结果会汇入失败限流器。

use std::sync::Arc;

use async_trait::async_trait;
use mqttbytes::v4::Connect;
use tracing::{debug, warn};

use notice_core::{token::credential_eq, RateLimiter};

use crate::hooks::{ClientInfo, Hook, HookEvent};

pub struct AuthHook {
    credential: String,
    limiter: Option<Arc<RateLimiter>>,
}

impl AuthHook {
    pub fn new(credential: String, limiter: Option<Arc<RateLimiter>>) -> Self {
        Self { credential, limiter }
    }
}

#[async_trait]
impl Hook for AuthHook {
    fn name(&self) -> &str {
        "auth"
    }

    fn provides(&self, event: HookEvent) -> bool {
        matches!(event, HookEvent::ConnectAuthenticate | HookEvent::AclCheck)
    }

    async fn on_connect_authenticate(&self, client: &ClientInfo, connect: &Connect) -> bool {
        let ip = client.remote_addr.map(|a| a.ip().to_string());

        if let (Some(ip), Some(limiter)) = (&ip, &self.limiter) {
            if limiter.is_blocked(ip) {
                warn!("mqtt connect from blocked ip {} rejected", ip);
                return false;
            }
        }

        let ok = connect
            .login
            .as_ref()
            .map(|login| {
                credential_eq(&login.username, &self.credential)
                    || credential_eq(&login.password, &self.credential)
            })
            .unwrap_or(false);

        if let (Some(ip), Some(limiter)) = (&ip, &self.limiter) {
            if ok {
                limiter.record_success(ip);
            } else {
                limiter.record_failure(ip);
            }
        }
        if !ok {
            debug!("mqtt auth failed for client {}", client.client_id);
        }
        ok
    }

    /// 已认证客户端不再做更细粒度授权
    async fn on_acl_check(&self, _client: &ClientInfo, _topic: &str, _write: bool) -> bool {
        true
    }
}
