//! WebSocket 字节流适配
//!
//! 把 WebSocket 二进制帧桥接成连续字节流，MQTT 编解码对两种
//! 传输使用同一套读写代码。

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub struct WsByteStream {
    inner: WebSocketStream<TcpStream>,
    read_buf: BytesMut,
}

impl WsByteStream {
    /// 完成 WebSocket 握手并协商 mqtt 子协议
    pub async fn accept(stream: TcpStream) -> io::Result<Self> {
        let inner = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, mut resp: Response| {
                let wants_mqtt = req
                    .headers()
                    .get("sec-websocket-protocol")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.split(',').any(|p| p.trim().eq_ignore_ascii_case("mqtt")))
                    .unwrap_or(false);
                if wants_mqtt {
                    resp.headers_mut()
                        .insert("sec-websocket-protocol", HeaderValue::from_static("mqtt"));
                }
                Ok(resp)
            },
        )
        .await
        .map_err(io::Error::other)?;
        Ok(Self {
            inner,
            read_buf: BytesMut::new(),
        })
    }
}

impl AsyncRead for WsByteStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                let chunk = this.read_buf.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    this.read_buf.extend_from_slice(&data);
                }
                // 关闭帧或流结束都按 EOF 处理
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(()));
                }
                // Ping/Pong 由 tungstenite 自动应答, 文本帧忽略
                Poll::Ready(Some(Ok(_))) => {}
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::other(e)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for WsByteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                let msg = Message::Binary(data.to_vec().into());
                Pin::new(&mut this.inner)
                    .start_send(msg)
                    .map_err(io::Error::other)?;
                Poll::Ready(Ok(data.len()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}
