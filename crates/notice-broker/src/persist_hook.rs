//! 会话持久化钩子
//!
//! 把持久会话（订阅、过期时刻）与保留消息写入 <storage>/mqtt
//! 下的 sled 库, 重启后在监听开始前恢复。必须最先注册。

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mqttbytes::v4::Publish;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use notice_core::Result;

use crate::engine::{RestoredSession, RetainedMessage};
use crate::hooks::{ClientInfo, Hook, HookEvent};

const SESSION_PREFIX: &[u8] = b"session:";
const RETAINED_PREFIX: &[u8] = b"retained:";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedSession {
    client_id: String,
    subscriptions: Vec<(String, u8)>,
    /// 断开后过期时刻 (unix 秒); 0 表示记录时仍在线
    expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedRetained {
    topic: String,
    qos: u8,
    payload: Vec<u8>,
}

pub struct SessionPersistHook {
    db: sled::Db,
    session_expiry: Duration,
    /// 持久会话的内存镜像, 写通到 sled
    state: Mutex<HashMap<String, PersistedSession>>,
}

impl SessionPersistHook {
    pub fn open(path: &Path, session_expiry: Duration) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let db = sled::open(path)?;
        Ok(Self {
            db,
            session_expiry,
            state: Mutex::new(HashMap::new()),
        })
    }

    /// 读出未过期的持久会话与保留消息, 同时丢弃过期记录
    pub fn load(&self) -> Result<(Vec<RestoredSession>, Vec<RetainedMessage>)> {
        let now = Utc::now().timestamp();
        let mut sessions = Vec::new();
        let mut state = self.state.lock();

        for entry in self.db.scan_prefix(SESSION_PREFIX) {
            let (key, value) = entry?;
            let rec: PersistedSession = match serde_json::from_slice(&value) {
                Ok(rec) => rec,
                Err(_) => {
                    let _ = self.db.remove(&key);
                    continue;
                }
            };
            let expires_in = if rec.expires_at > 0 {
                let remaining = rec.expires_at - now;
                if remaining <= 0 {
                    let _ = self.db.remove(&key);
                    continue;
                }
                Duration::from_secs(remaining as u64)
            } else {
                // 上次进程退出时仍在线, 给满保留期
                self.session_expiry
            };
            sessions.push(RestoredSession {
                client_id: rec.client_id.clone(),
                subscriptions: rec.subscriptions.clone(),
                expires_in,
            });
            state.insert(rec.client_id.clone(), rec);
        }

        let mut retained = Vec::new();
        for entry in self.db.scan_prefix(RETAINED_PREFIX) {
            let (key, value) = entry?;
            match serde_json::from_slice::<PersistedRetained>(&value) {
                Ok(rec) => retained.push(RetainedMessage {
                    topic: rec.topic,
                    qos: mqttbytes::qos(rec.qos).unwrap_or(mqttbytes::QoS::AtMostOnce),
                    payload: rec.payload.into(),
                }),
                Err(_) => {
                    let _ = self.db.remove(&key);
                }
            }
        }
        Ok((sessions, retained))
    }

    fn session_key(client_id: &str) -> Vec<u8> {
        let mut key = SESSION_PREFIX.to_vec();
        key.extend_from_slice(client_id.as_bytes());
        key
    }

    fn retained_key(topic: &str) -> Vec<u8> {
        let mut key = RETAINED_PREFIX.to_vec();
        key.extend_from_slice(topic.as_bytes());
        key
    }

    fn write_record(&self, rec: &PersistedSession) {
        let key = Self::session_key(&rec.client_id);
        match serde_json::to_vec(rec) {
            Ok(value) => {
                if let Err(e) = self.db.insert(key, value) {
                    warn!("持久化会话 {} 失败: {}", rec.client_id, e);
                }
            }
            Err(e) => warn!("序列化会话 {} 失败: {}", rec.client_id, e),
        }
    }

    fn remove_record(&self, client_id: &str) {
        if let Err(e) = self.db.remove(Self::session_key(client_id)) {
            warn!("删除持久会话 {} 失败: {}", client_id, e);
        }
    }
}

#[async_trait]
impl Hook for SessionPersistHook {
    fn name(&self) -> &str {
        "session-persist"
    }

    fn provides(&self, event: HookEvent) -> bool {
        matches!(
            event,
            HookEvent::SessionEstablished
                | HookEvent::Subscribed
                | HookEvent::Unsubscribed
                | HookEvent::Disconnect
                | HookEvent::Published
        )
    }

    async fn on_session_established(&self, client: &ClientInfo, _inflight: usize) {
        let mut state = self.state.lock();
        if client.clean_session {
            if state.remove(&client.client_id).is_some() {
                self.remove_record(&client.client_id);
            }
            return;
        }
        let rec = state
            .entry(client.client_id.clone())
            .or_insert_with(|| PersistedSession {
                client_id: client.client_id.clone(),
                subscriptions: Vec::new(),
                expires_at: 0,
            });
        rec.expires_at = 0;
        self.write_record(&rec.clone());
    }

    async fn on_subscribed(&self, client: &ClientInfo, filters: &[(String, u8)]) {
        if client.clean_session {
            return;
        }
        let mut state = self.state.lock();
        let rec = state
            .entry(client.client_id.clone())
            .or_insert_with(|| PersistedSession {
                client_id: client.client_id.clone(),
                subscriptions: Vec::new(),
                expires_at: 0,
            });
        for (filter, qos) in filters {
            rec.subscriptions.retain(|(f, _)| f != filter);
            rec.subscriptions.push((filter.clone(), *qos));
        }
        self.write_record(&rec.clone());
    }

    async fn on_unsubscribed(&self, client: &ClientInfo, filters: &[String]) {
        if client.clean_session {
            return;
        }
        let mut state = self.state.lock();
        if let Some(rec) = state.get_mut(&client.client_id) {
            rec.subscriptions.retain(|(f, _)| !filters.contains(f));
            self.write_record(&rec.clone());
        }
    }

    async fn on_disconnect(&self, client: &ClientInfo, _graceful: bool) {
        let mut state = self.state.lock();
        if client.clean_session {
            if state.remove(&client.client_id).is_some() {
                self.remove_record(&client.client_id);
            }
            return;
        }
        if let Some(rec) = state.get_mut(&client.client_id) {
            rec.expires_at = Utc::now().timestamp() + self.session_expiry.as_secs() as i64;
            self.write_record(&rec.clone());
        }
    }

    async fn on_published(&self, _client: Option<&ClientInfo>, publish: &Publish) {
        if !publish.retain {
            return;
        }
        let key = Self::retained_key(&publish.topic);
        let result = if publish.payload.is_empty() {
            self.db.remove(key).map(|_| ())
        } else {
            let rec = PersistedRetained {
                topic: publish.topic.clone(),
                qos: publish.qos as u8,
                payload: publish.payload.to_vec(),
            };
            match serde_json::to_vec(&rec) {
                Ok(value) => self.db.insert(key, value).map(|_| ()),
                Err(e) => {
                    warn!("序列化保留消息失败: {}", e);
                    return;
                }
            }
        };
        if let Err(e) = result {
            warn!("持久化保留消息 (topic {}) 失败: {}", publish.topic, e);
        }
    }
}
