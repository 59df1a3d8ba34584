//! notice-rust 命令行入口

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use notice_core::Config;
use notice_server::Server;

#[derive(Parser)]
#[command(name = "notice")]
#[command(about = "Self-contained message push server over MQTT", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// 启动推送服务
    Serve {
        /// 配置文件路径 (TOML); 缺省时尝试当前目录的 notice.toml
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// 日志目录; 指定后启用按天滚动的文件日志
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// 静态控制台目录
        #[arg(long, default_value = "web")]
        web_dir: PathBuf,
    },
    /// 显示版本信息
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Serve {
        config: None,
        log_dir: None,
        web_dir: PathBuf::from("web"),
    });

    match command {
        Commands::Serve {
            config,
            log_dir,
            web_dir,
        } => {
            // 日志 guard 持有到进程结束, 退出时冲刷文件缓冲
            let _guard = init_logging(log_dir.as_deref());
            let config = Config::load(config.as_deref())?;
            Server::new(config).with_web_dir(web_dir).run().await?;
        }
        Commands::Version => {
            println!("notice-rust {}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}

fn init_logging(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    // sled 的调试输出太吵, 压到 info
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sled=info".into());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "notice.log");
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_writer)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    }
}
