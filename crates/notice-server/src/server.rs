//! 服务生命周期
//!
//! 启动顺序: 存储 -> 代理(含钩子与监听) -> 限流驱逐任务 ->
//! HTTP 监听。收到终止信号后: 停止接受请求 -> 关代理 -> 关存
//! 储; 整个停机有硬性时限。

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use notice_broker::{BrokerAdapter, BrokerConfig};
use notice_core::{ratelimit, Config, NoticeError, RateLimiter, Result};
use notice_store::StoreManager;

use crate::api::create_router;
use crate::state::AppState;

/// 停机硬时限
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

pub struct Server {
    config: Config,
    web_dir: PathBuf,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            web_dir: PathBuf::from("web"),
        }
    }

    pub fn with_web_dir(mut self, web_dir: impl Into<PathBuf>) -> Self {
        self.web_dir = web_dir.into();
        self
    }

    /// 启动全部子系统并阻塞直到收到终止信号
    pub async fn run(mut self) -> Result<()> {
        if self.config.ensure_token() {
            warn!("未配置访问令牌, 已自动生成: {}", self.config.auth.token);
        }
        let config = Arc::new(self.config);

        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let store = Arc::new(StoreManager::new(&config.storage));
        let broker = Arc::new(BrokerAdapter::new(
            BrokerConfig::from_config(&config),
            Some(store.clone()),
            Some(limiter.clone()),
        )?);
        broker.start().await?;

        // 限流记录周期性驱逐
        let evict_limiter = limiter.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ratelimit::EVICT_INTERVAL);
            loop {
                ticker.tick().await;
                evict_limiter.evict();
            }
        });

        let state = AppState {
            config: config.clone(),
            limiter,
            broker: broker.clone(),
            store: store.clone(),
        };
        let app = create_router(state, &self.web_dir);

        let addr: SocketAddr = format!("0.0.0.0:{}", config.http.port)
            .parse()
            .map_err(|e| NoticeError::Config(format!("HTTP 监听地址无效: {}", e)))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NoticeError::Config(format!("绑定 HTTP {} 失败: {}", addr, e)))?;
        info!("HTTP listening on {}", addr);

        // 信号广播: 一份给优雅停机, 一份给硬时限看门狗
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let signal_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("termination signal received");
            let _ = signal_tx.send(());
        });

        let mut graceful_rx = shutdown_tx.subscribe();
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = graceful_rx.recv().await;
        });

        let mut deadline_rx = shutdown_tx.subscribe();
        tokio::select! {
            result = serve => {
                result.map_err(|e| NoticeError::Unknown(format!("HTTP 服务异常退出: {}", e)))?;
            }
            _ = async {
                let _ = deadline_rx.recv().await;
                tokio::time::sleep(SHUTDOWN_DEADLINE).await;
            } => {
                warn!("停机超过 {:?}, 强制退出", SHUTDOWN_DEADLINE);
            }
        }

        info!("shutting down");
        broker.close();
        store.close();
        info!("bye");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("安装 Ctrl-C 处理失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("安装 SIGTERM 处理失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
