//! MQTT 引擎
//!
//! 会话、订阅、路由与监听循环。协议编解码用 mqttbytes 的 v4
//! 实现，引擎本身只做 3.1.1 所需的会话语义。

pub mod session;
pub mod topic;

mod connection;
mod subs;
mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use mqttbytes::v4::Publish;
use mqttbytes::QoS;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use notice_core::{NoticeError, Result};

use crate::hooks::HookRegistry;
use session::{Session, SessionStore};
use subs::SubscriptionStore;

/// 引擎能力参数
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 单包上限
    pub max_packet_size: usize,
    /// 每会话出站未确认消息上限
    pub max_inflight: usize,
    /// 每连接待写队列上限, 溢出即丢弃该订阅者的消息
    pub write_queue: usize,
    /// 每连接入站 QoS2 未释放上限
    pub receive_maximum: usize,
    /// 读缓冲初始容量
    pub read_buffer: usize,
    /// 每会话离线队列上限
    pub max_queued: usize,
    /// 断开后会话保留时长
    pub session_expiry: Duration,
    /// 离线消息保留时长
    pub message_expiry: Duration,
    /// 过期会话清理间隔
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 1024 * 1024,
            max_inflight: 8192,
            write_queue: 1024,
            receive_maximum: 1024,
            read_buffer: 4096,
            max_queued: 1024,
            session_expiry: Duration::from_secs(86400),
            message_expiry: Duration::from_secs(86400),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// 保留消息
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
}

/// 重启后恢复的断开会话
pub struct RestoredSession {
    pub client_id: String,
    pub subscriptions: Vec<(String, u8)>,
    pub expires_in: Duration,
}

/// 发往连接任务的指令
pub(crate) enum Outgoing {
    Publish(Publish),
    /// 同 id 新连接上线, 旧连接退出
    Takeover,
}

pub(crate) struct ConnectionHandle {
    pub id: u64,
    pub sender: mpsc::Sender<Outgoing>,
}

pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) hooks: HookRegistry,
    pub(crate) sessions: SessionStore,
    pub(crate) subscriptions: SubscriptionStore,
    pub(crate) connections: DashMap<String, ConnectionHandle>,
    pub(crate) retained: DashMap<String, RetainedMessage>,
    shutdown: broadcast::Sender<()>,
    next_conn_id: AtomicU64,
    bound: parking_lot::Mutex<Option<(std::net::SocketAddr, std::net::SocketAddr)>>,
}

impl Engine {
    pub fn new(config: EngineConfig, hooks: HookRegistry) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            hooks,
            sessions: SessionStore::new(),
            subscriptions: SubscriptionStore::new(),
            connections: DashMap::new(),
            retained: DashMap::new(),
            shutdown,
            next_conn_id: AtomicU64::new(1),
            bound: parking_lot::Mutex::new(None),
        }
    }

    /// 注入持久化层恢复的会话与保留消息, 必须在监听前调用
    pub fn restore(&self, sessions: Vec<RestoredSession>, retained: Vec<RetainedMessage>) {
        for restored in sessions {
            let mut session = Session::new(restored.client_id.clone(), false);
            for (filter, qos) in &restored.subscriptions {
                let qos = mqttbytes::qos(*qos).unwrap_or(QoS::AtMostOnce);
                session.subscriptions.insert(filter.clone(), qos);
                self.subscriptions.add(filter, &restored.client_id, qos);
            }
            session.expires_at = Some(std::time::Instant::now() + restored.expires_in);
            self.sessions.insert(session);
        }
        let restored = self.sessions.len();
        for msg in retained {
            self.retained.insert(msg.topic.clone(), msg);
        }
        if restored > 0 || !self.retained.is_empty() {
            info!(
                "restored {} sessions, {} retained messages",
                restored,
                self.retained.len()
            );
        }
    }

    /// 绑定监听并启动接入循环, 绑定失败直接返回错误
    pub async fn start(self: &Arc<Self>, tcp_bind: &str, ws_bind: &str) -> Result<()> {
        let tcp = TcpListener::bind(tcp_bind)
            .await
            .map_err(|e| NoticeError::Broker(format!("绑定 MQTT TCP {} 失败: {}", tcp_bind, e)))?;
        let ws = TcpListener::bind(ws_bind)
            .await
            .map_err(|e| NoticeError::Broker(format!("绑定 MQTT WS {} 失败: {}", ws_bind, e)))?;
        let tcp_local = tcp.local_addr()?;
        let ws_local = ws.local_addr()?;
        *self.bound.lock() = Some((tcp_local, ws_local));
        info!("MQTT/TCP listening on {}", tcp_local);
        info!("MQTT/WebSocket listening on {}", ws_local);

        let engine = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = tcp.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let engine = engine.clone();
                            tokio::spawn(async move {
                                connection::handle(stream, addr, engine).await;
                            });
                        }
                        Err(e) => error!("accept MQTT/TCP failed: {}", e),
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        let engine = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = ws.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let engine = engine.clone();
                            tokio::spawn(async move {
                                match transport::WsByteStream::accept(stream).await {
                                    Ok(ws_stream) => {
                                        connection::handle(ws_stream, addr, engine).await;
                                    }
                                    Err(e) => debug!("WebSocket 握手失败 {}: {}", addr, e),
                                }
                            });
                        }
                        Err(e) => error!("accept MQTT/WS failed: {}", e),
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        // 过期会话清理
        let engine = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for client_id in engine.sessions.sweep_expired() {
                            engine.subscriptions.remove_client(&client_id);
                            debug!("session expired: {}", client_id);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Ok(())
    }

    /// 停止接入循环并断开全部连接
    pub fn close(&self) {
        let _ = self.shutdown.send(());
    }

    pub(crate) fn shutdown_rx(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::SeqCst)
    }

    /// 实际绑定的 (TCP, WebSocket) 地址
    pub fn local_addrs(&self) -> Option<(std::net::SocketAddr, std::net::SocketAddr)> {
        *self.bound.lock()
    }

    /// 活动客户端数, 不含服务端内联发布与 $ 前缀客户端
    pub fn client_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|e| !e.key().starts_with('$'))
            .count()
    }

    /// 服务端内联发布: 进入与客户端发布相同的路由与钩子路径
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()> {
        if !topic::valid_topic(topic) {
            return Err(NoticeError::Broker(format!("发布主题不合法: {}", topic)));
        }
        let mut publish = Publish::new(topic, qos, payload);
        publish.retain = retain;
        self.apply_retain(&publish);
        let events = self.route(&publish);
        self.dispatch_route_events(events).await;
        self.hooks.published(None, &publish).await;
        Ok(())
    }

    /// 保留标记处理: 空载荷清除保留, 否则覆盖
    pub(crate) fn apply_retain(&self, publish: &Publish) {
        if !publish.retain {
            return;
        }
        if publish.payload.is_empty() {
            self.retained.remove(&publish.topic);
        } else {
            self.retained.insert(
                publish.topic.clone(),
                RetainedMessage {
                    topic: publish.topic.clone(),
                    qos: publish.qos,
                    payload: publish.payload.clone(),
                },
            );
        }
    }

    /// 把消息投给所有命中的订阅者
    ///
    /// 在线客户端走其写队列, 队列满则丢弃该客户端的这条消息;
    /// 离线持久会话进离线队列。返回待广播的 QosPublish 事件,
    /// 由调用方在锁外派发。
    pub(crate) fn route(&self, publish: &Publish) -> Vec<(String, Publish, bool)> {
        let mut events = Vec::new();
        for (client_id, sub_qos) in self.subscriptions.matches(&publish.topic) {
            let qos = min_qos(publish.qos, sub_qos);
            let mut out = publish.clone();
            out.qos = qos;
            out.pkid = 0;
            out.dup = false;
            out.retain = false;

            let delivered_live = match self.connections.get(&client_id) {
                Some(handle) => match handle.sender.try_send(Outgoing::Publish(out.clone())) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("write queue full, dropping message for {}", client_id);
                        continue;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                },
                None => false,
            };

            if delivered_live {
                if qos != QoS::AtMostOnce {
                    events.push((client_id, out, true));
                }
                continue;
            }

            if let Some(session) = self.sessions.get(&client_id) {
                let mut s = session.write();
                if !s.clean_session && !s.connected {
                    s.queue_message(
                        out.clone(),
                        self.config.message_expiry,
                        self.config.max_queued,
                    );
                    drop(s);
                    events.push((client_id, out, false));
                }
            }
        }
        events
    }

    pub(crate) async fn dispatch_route_events(&self, events: Vec<(String, Publish, bool)>) {
        for (client_id, publish, connected) in events {
            self.hooks.qos_publish(&client_id, &publish, connected).await;
        }
    }

    /// 新订阅匹配到的保留消息
    pub(crate) fn retained_for(&self, filter: &str) -> Vec<RetainedMessage> {
        self.retained
            .iter()
            .filter(|e| topic::matches(e.key(), filter))
            .map(|e| e.value().clone())
            .collect()
    }
}

pub(crate) fn min_qos(a: QoS, b: QoS) -> QoS {
    if (a as u8) <= (b as u8) {
        a
    } else {
        b
    }
}
