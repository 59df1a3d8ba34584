//! 单连接处理
//!
//! 每个网络连接一个任务: 解析 CONNECT、建立或恢复会话、循环
//! 处理入站包与出站队列, 断开时按 cleanSession 决定会话去留。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mqttbytes::v4::{
    self, ConnAck, Connect, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, Publish,
    SubAck, Subscribe, SubscribeReasonCode, Unsubscribe,
};
use mqttbytes::QoS;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::hooks::ClientInfo;

use super::session::{Inflight, InflightState, Session};
use super::{min_qos, topic, Engine, ConnectionHandle, Outgoing};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// PINGRESP 固定报文
const PINGRESP: [u8; 2] = [0xD0, 0x00];

enum PacketOutcome {
    Continue,
    /// 客户端发送了 DISCONNECT
    Graceful,
    /// 协议违规, 直接断开
    Abort,
}

pub(crate) async fn handle<S>(stream: S, addr: SocketAddr, engine: Arc<Engine>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let max_packet = engine.config.max_packet_size;
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = BytesMut::with_capacity(engine.config.read_buffer);

    // 第一个包必须是 CONNECT
    let connect = match tokio::time::timeout(
        CONNECT_TIMEOUT,
        read_packet(&mut reader, &mut buf, max_packet),
    )
    .await
    {
        Ok(Ok(Packet::Connect(connect))) => connect,
        Ok(_) => {
            debug!("{}: expected CONNECT", addr);
            return;
        }
        Err(_) => {
            debug!("{}: CONNECT timeout", addr);
            return;
        }
    };

    let generated = connect.client_id.is_empty();
    let client_id = if generated {
        format!("auto-{}", uuid::Uuid::new_v4().simple())
    } else {
        connect.client_id.clone()
    };
    let clean_session = connect.clean_session || generated;
    let info = ClientInfo {
        client_id: client_id.clone(),
        remote_addr: Some(addr),
        username: connect.login.as_ref().map(|l| l.username.clone()),
        clean_session,
    };

    if !engine.hooks.connect_authenticate(&info, &connect).await {
        let mut out = BytesMut::new();
        let _ = ConnAck::new(ConnectReturnCode::NotAuthorized, false).write(&mut out);
        let _ = writer.write_all(&out).await;
        let _ = writer.flush().await;
        return;
    }

    // 建立或恢复会话
    let now = Instant::now();
    let (session, session_present) = match engine.sessions.get(&client_id) {
        Some(prev)
            if !clean_session && !prev.read().clean_session && !prev.read().expired(now) =>
        {
            (prev, true)
        }
        _ => {
            engine.subscriptions.remove_client(&client_id);
            (
                engine
                    .sessions
                    .insert(Session::new(client_id.clone(), clean_session)),
                false,
            )
        }
    };
    let conn_id = engine.next_conn_id();
    {
        let mut s = session.write();
        s.connected = true;
        s.expires_at = None;
        s.owner = conn_id;
    }

    // 顶替同 id 的旧连接
    if let Some(old) = engine.connections.get(&client_id) {
        let _ = old.sender.try_send(Outgoing::Takeover);
    }
    let (tx, mut rx) = mpsc::channel(engine.config.write_queue);
    engine.connections.insert(
        client_id.clone(),
        ConnectionHandle {
            id: conn_id,
            sender: tx,
        },
    );

    let mut task = ClientTask {
        engine: engine.clone(),
        info,
        session: session.clone(),
        write_buf: BytesMut::new(),
    };

    let _ = ConnAck::new(ConnectReturnCode::Success, session_present).write(&mut task.write_buf);

    // 恢复期: 重发未确认消息, 投递离线队列
    let (inflight_count, resend, queued) = {
        let mut s = session.write();
        let resend: Vec<(u16, Inflight)> =
            s.inflight.iter().map(|(k, v)| (*k, v.clone())).collect();
        let queued = s.drain_queued();
        (resend.len(), resend, queued)
    };
    engine.hooks.connect(&task.info).await;
    engine.hooks.session_established(&task.info, inflight_count).await;

    for (pkid, inflight) in resend {
        match inflight.state {
            InflightState::AwaitingPubcomp => {
                let _ = PubRel::new(pkid).write(&mut task.write_buf);
            }
            _ => {
                let mut publish = inflight.publish.clone();
                publish.dup = true;
                let _ = publish.write(&mut task.write_buf);
            }
        }
    }
    for publish in queued {
        task.send_publish(publish);
    }

    let keep_alive = connect.keep_alive;
    let idle = Duration::from_secs((keep_alive as u64).max(1) * 3 / 2);
    let mut deadline = tokio::time::Instant::now() + idle;
    let mut shutdown_rx = engine.shutdown_rx();
    let mut graceful = false;

    'main: loop {
        // 先榨干缓冲里已经完整的包
        loop {
            match v4::read(&mut buf, max_packet) {
                Ok(packet) => match task.on_packet(packet).await {
                    PacketOutcome::Continue => {}
                    PacketOutcome::Graceful => {
                        graceful = true;
                        break 'main;
                    }
                    PacketOutcome::Abort => break 'main,
                },
                Err(mqttbytes::Error::InsufficientBytes(_)) => break,
                Err(e) => {
                    debug!("{}: packet decode error: {:?}", client_id, e);
                    break 'main;
                }
            }
        }
        if flush(&mut writer, &mut task.write_buf).await.is_err() {
            break;
        }

        tokio::select! {
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break,
                Ok(_) => deadline = tokio::time::Instant::now() + idle,
                Err(e) => {
                    debug!("{}: read error: {}", client_id, e);
                    break;
                }
            },
            maybe = rx.recv() => match maybe {
                Some(Outgoing::Publish(publish)) => task.send_publish(publish),
                Some(Outgoing::Takeover) => {
                    debug!("{}: session taken over", client_id);
                    break;
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline), if keep_alive > 0 => {
                debug!("{}: keepalive timeout", client_id);
                break;
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    let _ = flush(&mut writer, &mut task.write_buf).await;
    let _ = writer.shutdown().await;

    // 清理: 仅当会话仍归本连接所有时更新其状态
    engine
        .connections
        .remove_if(&client_id, |_, handle| handle.id == conn_id);
    let mut remove_session = false;
    {
        let mut s = session.write();
        if s.owner == conn_id {
            s.connected = false;
            if s.clean_session {
                remove_session = true;
            } else {
                s.expires_at = Some(Instant::now() + engine.config.session_expiry);
            }
        }
    }
    if remove_session && engine.sessions.remove_entry(&client_id, &session) {
        engine.subscriptions.remove_client(&client_id);
    }

    // 非正常断开时发布遗嘱
    if !graceful {
        if let Some(will) = connect.last_will.as_ref() {
            let mut publish = Publish::new(&will.topic, will.qos, will.message.to_vec());
            publish.retain = will.retain;
            engine.apply_retain(&publish);
            let events = engine.route(&publish);
            engine.dispatch_route_events(events).await;
            engine.hooks.published(Some(&task.info), &publish).await;
        }
    }

    engine.hooks.disconnect(&task.info, graceful).await;
}

struct ClientTask {
    engine: Arc<Engine>,
    info: ClientInfo,
    session: Arc<RwLock<Session>>,
    write_buf: BytesMut,
}

impl ClientTask {
    async fn on_packet(&mut self, packet: Packet) -> PacketOutcome {
        match packet {
            Packet::Publish(publish) => self.on_publish(publish).await,
            Packet::PubAck(ack) => self.on_puback(ack.pkid).await,
            Packet::PubRec(rec) => self.on_pubrec(rec.pkid),
            Packet::PubRel(rel) => self.on_pubrel(rel.pkid),
            Packet::PubComp(comp) => self.on_pubcomp(comp.pkid).await,
            Packet::Subscribe(sub) => self.on_subscribe(sub).await,
            Packet::Unsubscribe(unsub) => self.on_unsubscribe(unsub).await,
            Packet::PingReq => {
                self.write_buf.extend_from_slice(&PINGRESP);
                PacketOutcome::Continue
            }
            Packet::Disconnect => PacketOutcome::Graceful,
            // 客户端不应发送的包型
            _ => PacketOutcome::Abort,
        }
    }

    async fn on_publish(&mut self, publish: Publish) -> PacketOutcome {
        if !topic::valid_topic(&publish.topic) {
            return PacketOutcome::Abort;
        }
        if !self
            .engine
            .hooks
            .acl_check(&self.info, &publish.topic, true)
            .await
        {
            debug!("{}: publish to {} denied", self.info.client_id, publish.topic);
            return PacketOutcome::Continue;
        }

        let mut duplicate = false;
        match publish.qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                let _ = PubAck::new(publish.pkid).write(&mut self.write_buf);
            }
            QoS::ExactlyOnce => {
                {
                    let mut s = self.session.write();
                    if s.incoming_rel.contains(&publish.pkid) {
                        duplicate = true;
                    } else {
                        if s.incoming_rel.len() >= self.engine.config.receive_maximum {
                            return PacketOutcome::Abort;
                        }
                        s.incoming_rel.insert(publish.pkid);
                    }
                }
                let _ = PubRec::new(publish.pkid).write(&mut self.write_buf);
            }
        }
        if duplicate {
            return PacketOutcome::Continue;
        }

        self.engine.apply_retain(&publish);
        let events = self.engine.route(&publish);
        self.engine.dispatch_route_events(events).await;
        self.engine.hooks.published(Some(&self.info), &publish).await;
        PacketOutcome::Continue
    }

    async fn on_puback(&mut self, pkid: u16) -> PacketOutcome {
        let completed = {
            let mut s = self.session.write();
            match s.inflight.get(&pkid) {
                Some(inflight) if inflight.state == InflightState::AwaitingPuback => {
                    s.inflight.remove(&pkid);
                    true
                }
                _ => false,
            }
        };
        if completed {
            self.engine.hooks.qos_complete(&self.info.client_id, pkid).await;
        }
        PacketOutcome::Continue
    }

    fn on_pubrec(&mut self, pkid: u16) -> PacketOutcome {
        let advance = {
            let mut s = self.session.write();
            match s.inflight.get_mut(&pkid) {
                Some(inflight) if inflight.state == InflightState::AwaitingPubrec => {
                    inflight.state = InflightState::AwaitingPubcomp;
                    true
                }
                _ => false,
            }
        };
        if advance {
            let _ = PubRel::new(pkid).write(&mut self.write_buf);
        }
        PacketOutcome::Continue
    }

    fn on_pubrel(&mut self, pkid: u16) -> PacketOutcome {
        self.session.write().incoming_rel.remove(&pkid);
        let _ = PubComp::new(pkid).write(&mut self.write_buf);
        PacketOutcome::Continue
    }

    async fn on_pubcomp(&mut self, pkid: u16) -> PacketOutcome {
        let completed = {
            let mut s = self.session.write();
            match s.inflight.get(&pkid) {
                Some(inflight) if inflight.state == InflightState::AwaitingPubcomp => {
                    s.inflight.remove(&pkid);
                    true
                }
                _ => false,
            }
        };
        if completed {
            self.engine.hooks.qos_complete(&self.info.client_id, pkid).await;
        }
        PacketOutcome::Continue
    }

    async fn on_subscribe(&mut self, sub: Subscribe) -> PacketOutcome {
        if sub.filters.is_empty() {
            return PacketOutcome::Abort;
        }
        let mut codes = Vec::with_capacity(sub.filters.len());
        let mut granted: Vec<(String, u8)> = Vec::new();
        for filter in &sub.filters {
            let allowed = topic::valid_filter(&filter.path)
                && self
                    .engine
                    .hooks
                    .acl_check(&self.info, &filter.path, false)
                    .await;
            if allowed {
                self.session
                    .write()
                    .subscriptions
                    .insert(filter.path.clone(), filter.qos);
                self.engine
                    .subscriptions
                    .add(&filter.path, &self.info.client_id, filter.qos);
                codes.push(SubscribeReasonCode::Success(filter.qos));
                granted.push((filter.path.clone(), filter.qos as u8));
            } else {
                codes.push(SubscribeReasonCode::Failure);
            }
        }
        let _ = SubAck::new(sub.pkid, codes).write(&mut self.write_buf);

        if !granted.is_empty() {
            self.engine.hooks.subscribed(&self.info, &granted).await;
            for (filter, sub_qos) in &granted {
                let sub_qos = mqttbytes::qos(*sub_qos).unwrap_or(QoS::AtMostOnce);
                for msg in self.engine.retained_for(filter) {
                    let mut publish =
                        Publish::new(&msg.topic, min_qos(msg.qos, sub_qos), msg.payload.to_vec());
                    publish.retain = true;
                    self.send_publish(publish);
                }
            }
        }
        PacketOutcome::Continue
    }

    async fn on_unsubscribe(&mut self, unsub: Unsubscribe) -> PacketOutcome {
        for filter in &unsub.topics {
            self.session.write().subscriptions.remove(filter);
            self.engine
                .subscriptions
                .remove(filter, &self.info.client_id);
        }
        let _ = v4::UnsubAck::new(unsub.pkid).write(&mut self.write_buf);
        self.engine.hooks.unsubscribed(&self.info, &unsub.topics).await;
        PacketOutcome::Continue
    }

    /// 出站发布: QoS0 直接写, QoS1/2 先登记 inflight 再写
    fn send_publish(&mut self, mut publish: Publish) {
        if publish.qos == QoS::AtMostOnce {
            let _ = publish.write(&mut self.write_buf);
            return;
        }
        {
            let mut s = self.session.write();
            if s.inflight.len() >= self.engine.config.max_inflight {
                warn!(
                    "inflight full, dropping message for {}",
                    self.info.client_id
                );
                return;
            }
            let pkid = s.alloc_pkid();
            publish.pkid = pkid;
            let state = if publish.qos == QoS::AtLeastOnce {
                InflightState::AwaitingPuback
            } else {
                InflightState::AwaitingPubrec
            };
            s.inflight.insert(
                pkid,
                Inflight {
                    publish: publish.clone(),
                    state,
                },
            );
        }
        let _ = publish.write(&mut self.write_buf);
    }
}

async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_packet: usize,
) -> std::io::Result<Packet> {
    loop {
        match v4::read(buf, max_packet) {
            Ok(packet) => return Ok(packet),
            Err(mqttbytes::Error::InsufficientBytes(_)) => {
                if reader.read_buf(buf).await? == 0 {
                    return Err(std::io::ErrorKind::UnexpectedEof.into());
                }
            }
            Err(e) => {
                return Err(std::io::Error::other(format!("bad packet: {:?}", e)));
            }
        }
    }
}

async fn flush<W: AsyncWrite + Unpin>(
    writer: &mut W,
    buf: &mut BytesMut,
) -> std::io::Result<()> {
    if !buf.is_empty() {
        writer.write_all(buf).await?;
        writer.flush().await?;
        buf.clear();
    }
    Ok(())
}
