//! 内嵌 MQTT 代理
//!
//! 一个紧凑的 MQTT 3.1/3.1.1 引擎（TCP 与 WebSocket 传输），
//! 通过有序钩子流水线接入认证、日志、历史存储与会话持久化。

pub mod adapter;
pub mod engine;
pub mod hooks;

mod auth_hook;
mod log_hook;
mod persist_hook;
mod store_hook;

pub use adapter::{BrokerAdapter, BrokerConfig};
pub use auth_hook::AuthHook;
pub use hooks::{ClientInfo, Hook, HookEvent};
pub use log_hook::LogHook;
pub use persist_hook::SessionPersistHook;
pub use store_hook::MessageStoreHook;
