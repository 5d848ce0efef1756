//! # AI Relay 主程序

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use ai_relay::{
    config::{ConfigManager, load_config},
    lerror,
    logging::{self, LogComponent, LogStage},
    server,
};

/// 命令行参数；参数错误时以退出码 2 结束
#[derive(Debug, Parser)]
#[command(name = "ai-relay", version, about = "Orchids / Warp / Grok 多租户反向代理")]
struct Cli {
    /// 配置文件路径（TOML），不存在时使用默认配置
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// 覆盖监听端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 调试模式（同时把日志级别降到 debug）
    #[arg(long)]
    debug: bool,

    /// 日志级别：trace / debug / info / warn / error
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match load_config(Some(&cli.config)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("配置加载失败: {e}");
            return ExitCode::from(1);
        }
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.debug {
        config.server.debug = true;
    }

    let level = cli.log_level.clone().unwrap_or_else(|| {
        if config.server.debug {
            "debug".to_string()
        } else {
            config.log.level.clone()
        }
    });
    logging::init_logging(Some(&level), config.log.json);

    if let Err(e) = server::run(Arc::new(ConfigManager::new(config))).await {
        lerror!(
            "system",
            LogStage::Shutdown,
            LogComponent::Main,
            "fatal",
            "服务异常退出",
            error = %e
        );
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}
