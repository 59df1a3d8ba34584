//! 消息历史查询
//!
//! 凭证既做认证也决定返回哪个租户的历史。

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

use notice_core::token::credential_eq;

use crate::auth::{client_ip, extract_credential};
use crate::state::{fail, AppState};

pub async fn handle(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers, peer);
    if state.limiter.is_blocked(&ip) {
        return fail(StatusCode::TOO_MANY_REQUESTS, "认证失败次数过多, 已被暂时封禁");
    }

    let credential = match extract_credential(&headers, &query) {
        Some(cred) if credential_eq(&cred, &state.config.auth.token) => cred,
        _ => {
            state.limiter.record_failure(&ip);
            return fail(StatusCode::UNAUTHORIZED, "无效的访问令牌");
        }
    };
    state.limiter.record_success(&ip);

    let before_id = query
        .get("before_id")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let page_size = query
        .get("page_size")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);

    match state.store.list(&credential, before_id, page_size) {
        Ok(result) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "data": result,
            })),
        )
            .into_response(),
        Err(e) => {
            warn!("查询消息历史失败: {}", e);
            fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
