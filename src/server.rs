//! # 服务启动与优雅停机
//!
//! 启动顺序：组装上下文 → 恢复持久化配置 → 确保管理员密码 → 种子模型 →
//! 启动后台循环 → 监听端口。停机顺序：取消后台上下文 → 在排空时限内停止 HTTP → 关闭存储。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio_util::sync::CancellationToken;

use crate::app::{AppContext, AppTasks};
use crate::config::{AppConfig, CONFIG_SETTING_KEY, ConfigManager, MIN_ADMIN_PASS_LEN, apply_env_overrides};
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::router::create_router;
use crate::utils::mask_secret;
use crate::{lerror, linfo, lwarn};

/// 自动生成的管理员密码长度
const GENERATED_PASS_LEN: usize = 24;

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASS_LEN)
        .map(char::from)
        .collect()
}

/// 用 KV 中保存的配置覆盖启动配置
///
/// Redis 连接段保持启动时的值；环境变量在恢复之后重新生效。
pub async fn restore_persisted_config(ctx: &AppContext) -> Result<bool> {
    let Some(raw) = ctx.store.get_setting(CONFIG_SETTING_KEY).await? else {
        return Ok(false);
    };
    let bootstrap = ctx.config.get_config().await;
    let mut restored: AppConfig = match serde_json::from_str(&raw) {
        Ok(config) => config,
        Err(e) => {
            lwarn!(
                "system",
                LogStage::Startup,
                LogComponent::Config,
                "restore_config",
                "持久化配置无法解析，沿用启动配置",
                error = %e
            );
            return Ok(false);
        }
    };
    restored.redis = bootstrap.redis;
    restored.server.port = bootstrap.server.port;
    restored.server.host = bootstrap.server.host;
    apply_env_overrides(&mut restored)?;
    ctx.config.replace(restored).await?;
    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Config,
        "restore_config",
        "已恢复持久化配置"
    );
    Ok(true)
}

/// 管理员密码为空或过短时生成新密码并持久化
pub async fn ensure_admin_password(ctx: &AppContext) -> Result<Option<String>> {
    let mut config = ctx.config.get_config().await;
    if config.auth.admin_pass.chars().count() >= MIN_ADMIN_PASS_LEN {
        return Ok(None);
    }
    let password = generate_password();
    config.auth.admin_pass.clone_from(&password);
    ctx.config.replace(config.clone()).await?;
    ctx.store
        .set_setting(CONFIG_SETTING_KEY, &serde_json::to_string(&config)?)
        .await?;
    lwarn!(
        "system",
        LogStage::Startup,
        LogComponent::Auth,
        "admin_password",
        &format!(
            "管理员密码为空或少于 {MIN_ADMIN_PASS_LEN} 位，已生成新密码（仅显示一次）: {password}"
        ),
        admin_user = %config.auth.admin_user
    );
    Ok(Some(password))
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            lerror!(
                "system",
                LogStage::Shutdown,
                LogComponent::Main,
                "ctrl_c_error",
                "无法监听 Ctrl+C",
                error = %e
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => "Ctrl+C",
        () = terminate => "SIGTERM",
    }
}

/// 启动服务直到收到停机信号
pub async fn run(config: Arc<ConfigManager>) -> Result<()> {
    let ctx = Arc::new(AppContext::initialize(Arc::clone(&config)).await?);
    ctx.store.ping().await?;
    restore_persisted_config(&ctx).await?;
    ensure_admin_password(&ctx).await?;

    let seeded = ctx.store.seed_default_models().await?;
    if seeded > 0 {
        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Store,
            "seed_models",
            "已写入默认模型",
            count = seeded
        );
    }

    let cfg = ctx.config.get_config().await;
    let tasks = AppTasks::initialize(&ctx).await;
    tasks.start().await?;

    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ProxyError::server_start_with_source(format!("无法监听 {addr}"), e))?;
    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Main,
        "listen",
        "服务已启动",
        addr = %addr,
        providers = ?ctx.providers.names(),
        admin_user = %cfg.auth.admin_user,
        admin_pass = %mask_secret(&cfg.auth.admin_pass)
    );

    let app = create_router(Arc::clone(&ctx), &cfg.server);
    let stop = CancellationToken::new();
    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown({
            let stop = stop.clone();
            async move { stop.cancelled().await }
        });
    let mut server_task = tokio::spawn(async move { server.await });

    let reason = tokio::select! {
        reason = shutdown_signal() => reason.to_string(),
        result = &mut server_task => {
            let reason = match result {
                Ok(Ok(())) => "server exit".to_string(),
                Ok(Err(e)) => format!("server error: {e}"),
                Err(e) => format!("server panic: {e}"),
            };
            tasks.shutdown().await;
            ctx.close().await;
            return Err(ProxyError::internal(reason));
        }
    };

    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::Main,
        "shutdown",
        "开始优雅停机",
        reason = %reason
    );
    ctx.shutdown.cancel();
    stop.cancel();

    let drain = Duration::from_secs(cfg.server.shutdown_timeout_secs.max(1));
    match tokio::time::timeout(drain, &mut server_task).await {
        Ok(_) => {}
        Err(_) => {
            lwarn!(
                "system",
                LogStage::Shutdown,
                LogComponent::Main,
                "drain_timeout",
                "排空超时，强制关闭剩余连接",
                drain_secs = drain.as_secs()
            );
            server_task.abort();
        }
    }

    tasks.shutdown().await;
    ctx.close().await;
    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::Main,
        "shutdown",
        "服务已关闭"
    );
    Ok(())
}
