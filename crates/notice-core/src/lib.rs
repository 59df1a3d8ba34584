//! notice-rust 核心类型
//!
//! 消息模型、配置、错误类型与租户凭证工具。

pub mod config;
pub mod error;
pub mod message;
pub mod ratelimit;
pub mod token;

pub use config::Config;
pub use error::{NoticeError, Result};
pub use message::{PushMessage, StoredMessage};
pub use ratelimit::RateLimiter;
