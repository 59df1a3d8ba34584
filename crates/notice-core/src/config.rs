//! 配置管理
//!
//! 配置来源优先级: 环境变量 > 配置文件 > 内置默认值。

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{NoticeError, Result};

/// 主配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP 服务配置
    #[serde(default)]
    pub http: HttpConfig,
    /// MQTT 代理配置
    #[serde(default)]
    pub mqtt: MqttConfig,
    /// 认证配置
    #[serde(default)]
    pub auth: AuthConfig,
    /// 失败限流配置
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// 消息历史存储配置
    #[serde(default)]
    pub storage: StorageConfig,
}

/// HTTP 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// 监听端口
    pub port: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: "9090".to_string(),
        }
    }
}

/// MQTT 代理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// TCP 监听端口
    pub tcp_port: String,
    /// WebSocket 监听端口
    pub ws_port: String,
    /// 默认发布主题
    pub topic: String,
    /// 会话保留时长（秒）
    pub session_expiry: u32,
    /// 离线消息保留时长（秒）
    pub message_expiry: u32,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            tcp_port: "9091".to_string(),
            ws_port: "9092".to_string(),
            topic: "notice".to_string(),
            session_expiry: 86400,
            message_expiry: 86400,
        }
    }
}

/// 认证配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// 租户访问令牌；留空则启动时自动生成
    #[serde(default)]
    pub token: String,
}

/// 失败限流配置
///
/// 零值或负值在构造限流器时回退到默认值。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 窗口内允许的最大失败次数
    pub max_failures: i64,
    /// 封禁时长（秒）
    pub block_time: i64,
    /// 计数窗口时长（秒）
    pub window_time: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            block_time: 900,
            window_time: 300,
        }
    }
}

/// 消息历史存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 是否持久化消息历史
    pub enabled: bool,
    /// 存储根目录
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "data".to_string(),
        }
    }
}

impl Config {
    /// 加载配置: 可选的 TOML 文件叠加环境变量覆盖
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(p) => builder.add_source(config::File::from(p).required(true)),
            None => builder.add_source(config::File::with_name("notice").required(false)),
        };
        let mut cfg: Config = builder
            .build()
            .map_err(|e| NoticeError::Config(format!("读取配置失败: {}", e)))?
            .try_deserialize()
            .map_err(|e| NoticeError::Config(format!("解析配置失败: {}", e)))?;
        cfg.apply_env()?;
        Ok(cfg)
    }

    /// 应用文档化的环境变量覆盖
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("HTTP_PORT") {
            self.http.port = v;
        }
        if let Ok(v) = std::env::var("MQTT_TCP_PORT") {
            self.mqtt.tcp_port = v;
        }
        if let Ok(v) = std::env::var("MQTT_WS_PORT") {
            self.mqtt.ws_port = v;
        }
        if let Ok(v) = std::env::var("MQTT_TOPIC") {
            self.mqtt.topic = v;
        }
        if let Ok(v) = std::env::var("MQTT_SESSION_EXPIRY") {
            self.mqtt.session_expiry = parse_env("MQTT_SESSION_EXPIRY", &v)?;
        }
        if let Ok(v) = std::env::var("MQTT_MESSAGE_EXPIRY") {
            self.mqtt.message_expiry = parse_env("MQTT_MESSAGE_EXPIRY", &v)?;
        }
        if let Ok(v) = std::env::var("AUTH_TOKEN") {
            self.auth.token = v;
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_MAX_FAILURES") {
            self.rate_limit.max_failures = parse_env("RATE_LIMIT_MAX_FAILURES", &v)?;
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_BLOCK_TIME") {
            self.rate_limit.block_time = parse_env("RATE_LIMIT_BLOCK_TIME", &v)?;
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_WINDOW_TIME") {
            self.rate_limit.window_time = parse_env("RATE_LIMIT_WINDOW_TIME", &v)?;
        }
        if let Ok(v) = std::env::var("STORAGE_ENABLED") {
            self.storage.enabled = parse_env("STORAGE_ENABLED", &v)?;
        }
        if let Ok(v) = std::env::var("STORAGE_PATH") {
            self.storage.path = v;
        }
        Ok(())
    }

    /// 确保访问令牌非空；返回 true 表示令牌是本次生成的
    pub fn ensure_token(&mut self) -> bool {
        if self.auth.token.is_empty() {
            self.auth.token = crate::token::generate_token();
            return true;
        }
        false
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| NoticeError::Config(format!("环境变量 {} 的值无效: {}", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    // Config::load 会读取进程环境，相关测试串行执行
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_config_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.http.port, "9090");
        assert_eq!(cfg.mqtt.tcp_port, "9091");
        assert_eq!(cfg.mqtt.ws_port, "9092");
        assert_eq!(cfg.mqtt.topic, "notice");
        assert_eq!(cfg.mqtt.session_expiry, 86400);
        assert_eq!(cfg.rate_limit.max_failures, 5);
        assert_eq!(cfg.rate_limit.block_time, 900);
        assert_eq!(cfg.rate_limit.window_time, 300);
        assert!(cfg.storage.enabled);
        assert_eq!(cfg.storage.path, "data");
        assert!(cfg.auth.token.is_empty());
    }

    #[test]
    fn test_config_from_file() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[http]\nport = \"8080\"\n\n[auth]\ntoken = \"abc\"\n\n[storage]\nenabled = false\npath = \"/tmp/notice\"\n"
        )
        .unwrap();

        let cfg = Config::load(Some(file.path())).unwrap();
        assert_eq!(cfg.http.port, "8080");
        assert_eq!(cfg.auth.token, "abc");
        assert!(!cfg.storage.enabled);
        // 文件未覆盖的部分保持默认值
        assert_eq!(cfg.mqtt.topic, "notice");
    }

    #[test]
    fn test_env_overrides_file() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "[mqtt]\ntopic = \"from-file\"\n").unwrap();

        std::env::set_var("MQTT_TOPIC", "from-env");
        let cfg = Config::load(Some(file.path())).unwrap();
        std::env::remove_var("MQTT_TOPIC");

        assert_eq!(cfg.mqtt.topic, "from-env");
    }

    #[test]
    fn test_env_malformed_value() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut cfg = Config::default();
        std::env::set_var("RATE_LIMIT_MAX_FAILURES", "not-a-number");
        let result = cfg.apply_env();
        std::env::remove_var("RATE_LIMIT_MAX_FAILURES");
        assert!(result.is_err());
    }

    #[test]
    fn test_ensure_token() {
        let mut cfg = Config::default();
        assert!(cfg.ensure_token());
        assert_eq!(cfg.auth.token.len(), 32);
        // 已有令牌不再生成
        assert!(!cfg.ensure_token());
    }
}
