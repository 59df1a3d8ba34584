//! 会话状态
//!
//! cleanSession=false 的会话在断开后保留订阅并排队离线消息，
//! 直到会话过期；排队消息各自带投递期限。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use mqttbytes::v4::Publish;
use mqttbytes::QoS;
use parking_lot::RwLock;

/// 排队等待投递的离线消息
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub publish: Publish,
    pub expires_at: Instant,
}

/// 出站 QoS 消息的确认阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflightState {
    /// QoS 1, 等待 PUBACK
    AwaitingPuback,
    /// QoS 2, 等待 PUBREC
    AwaitingPubrec,
    /// QoS 2, 已发 PUBREL, 等待 PUBCOMP
    AwaitingPubcomp,
}

#[derive(Debug, Clone)]
pub struct Inflight {
    pub publish: Publish,
    pub state: InflightState,
}

pub struct Session {
    pub client_id: String,
    pub clean_session: bool,
    /// 过滤器 -> 授予的 QoS
    pub subscriptions: HashMap<String, QoS>,
    /// 离线排队消息
    pub queued: VecDeque<QueuedMessage>,
    /// 出站未确认消息, 按包 id 索引
    pub inflight: HashMap<u16, Inflight>,
    /// 入站 QoS2 已收到但未 PUBREL 的包 id
    pub incoming_rel: std::collections::HashSet<u16>,
    pub connected: bool,
    /// 断开后会话的过期时刻
    pub expires_at: Option<Instant>,
    /// 当前持有该会话的连接编号, 防止被顶替的旧连接误改状态
    pub owner: u64,
    next_pkid: u16,
}

impl Session {
    pub fn new(client_id: String, clean_session: bool) -> Self {
        Self {
            client_id,
            clean_session,
            subscriptions: HashMap::new(),
            queued: VecDeque::new(),
            inflight: HashMap::new(),
            incoming_rel: std::collections::HashSet::new(),
            connected: false,
            expires_at: None,
            owner: 0,
            next_pkid: 0,
        }
    }

    /// 分配下一个未占用的包 id (1..=65535 回绕)
    pub fn alloc_pkid(&mut self) -> u16 {
        loop {
            self.next_pkid = self.next_pkid.wrapping_add(1);
            if self.next_pkid == 0 {
                self.next_pkid = 1;
            }
            if !self.inflight.contains_key(&self.next_pkid) {
                return self.next_pkid;
            }
        }
    }

    /// 排队一条离线消息, 返回是否入队（超限则丢弃最旧的）
    pub fn queue_message(&mut self, publish: Publish, ttl: Duration, max_queued: usize) {
        if self.queued.len() >= max_queued {
            self.queued.pop_front();
        }
        self.queued.push_back(QueuedMessage {
            publish,
            expires_at: Instant::now() + ttl,
        });
    }

    /// 取出所有未过期的排队消息
    pub fn drain_queued(&mut self) -> Vec<Publish> {
        let now = Instant::now();
        self.queued
            .drain(..)
            .filter(|q| q.expires_at > now)
            .map(|q| q.publish)
            .collect()
    }

    pub fn expired(&self, now: Instant) -> bool {
        !self.connected && self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

/// 会话注册表
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, Arc<RwLock<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    pub fn insert(&self, session: Session) -> Arc<RwLock<Session>> {
        let id = session.client_id.clone();
        let session = Arc::new(RwLock::new(session));
        self.sessions.insert(id, session.clone());
        session
    }

    pub fn remove(&self, client_id: &str) {
        self.sessions.remove(client_id);
    }

    /// 仅当注册表仍指向给定会话实例时才移除, 返回是否移除
    ///
    /// 防止被顶替的旧连接误删新连接刚建立的同名会话。
    pub fn remove_entry(&self, client_id: &str, session: &Arc<RwLock<Session>>) -> bool {
        self.sessions
            .remove_if(client_id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// 移除已过期的断开会话, 返回被移除的客户端 id
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().read().expired(now))
            .map(|e| e.key().clone())
            .collect();
        for id in &expired {
            self.sessions.remove(id);
        }
        expired
    }
}
