//! 统一错误处理

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NoticeError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("存储错误: {0}")]
    Storage(#[from] sled::Error),

    #[error("访问令牌哈希冲突: {0}")]
    TokenCollision(String),

    #[error("消息代理错误: {0}")]
    Broker(String),

    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("未知错误: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, NoticeError>;
