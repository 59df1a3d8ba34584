//! 各处理器共享的应用状态

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use notice_broker::BrokerAdapter;
use notice_core::{Config, RateLimiter};
use notice_store::StoreManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiter>,
    pub broker: Arc<BrokerAdapter>,
    pub store: Arc<StoreManager>,
}

/// 统一的错误响应: { success: false, message }
pub(crate) fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "message": message.into(),
        })),
    )
        .into_response()
}
