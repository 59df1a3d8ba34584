//! Webhook 入口
//!
//! 流水线: 限流 -> 方法检查 -> 凭证校验 -> JSON 修复 -> 解析
//! 校验 -> 补时间戳 -> 交给代理发布。重复提交会重复投递, 不做
//! 去重。

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::debug;

use notice_core::{token::credential_eq, PushMessage};

use crate::auth::{client_ip, extract_credential};
use crate::jsonfix;
use crate::state::{fail, AppState};

#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub extra: Option<serde_json::Value>,
    #[serde(default)]
    pub client: Option<String>,
}

pub async fn handle(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ip = client_ip(&headers, peer);
    if state.limiter.is_blocked(&ip) {
        return fail(StatusCode::TOO_MANY_REQUESTS, "认证失败次数过多, 已被暂时封禁");
    }

    if method != Method::POST {
        return fail(StatusCode::METHOD_NOT_ALLOWED, "只支持 POST");
    }

    let authed = extract_credential(&headers, &query)
        .map(|cred| credential_eq(&cred, &state.config.auth.token))
        .unwrap_or(false);
    if !authed {
        state.limiter.record_failure(&ip);
        return fail(StatusCode::UNAUTHORIZED, "无效的访问令牌");
    }
    state.limiter.record_success(&ip);

    let repaired = jsonfix::repair(&body);
    let request: WebhookRequest = match serde_json::from_slice(&repaired) {
        Ok(request) => request,
        Err(e) => {
            debug!("webhook json parse failed: {}", e);
            return fail(StatusCode::BAD_REQUEST, format!("JSON 解析失败: {}", e));
        }
    };

    let content = request.content.unwrap_or_default();
    if content.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "content 不能为空");
    }

    let msg = PushMessage::now(
        request.title,
        content,
        request.extra,
        request.client.or_else(|| Some("webhook".to_string())),
    );
    let topic = request
        .topic
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| state.broker.default_topic().to_string());

    match state.broker.publish(&topic, &msg).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "message": "消息已推送",
                "clients": state.broker.client_count(),
            })),
        )
            .into_response(),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, format!("推送失败: {}", e)),
    }
}
