mod config;
mod engine;
mod error;
mod logs;
mod metrics;
mod pidfile;
mod progress;
mod state;
mod store;
mod supervisor;
mod web;

use clap::Parser;
use config::AppConfig;
use logs::LogSink;
use metrics::{probe_for, MetricsSampler};
use state::AppState;
use std::sync::Arc;
use store::{JobStore, JsonFileStore};
use supervisor::Supervisor;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// VTX Relay - Transcoding Job Supervisor
/// 解析命令行参数，加载配置，恢复上次运行的流，并启动HTTP服务及后台监控
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "vtx-relay.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统, RUST_LOG 优先
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let args = Args::parse();

    let config = Arc::new(AppConfig::load(&args.config)?);
    info!(
        "VTX Relay initialized. Data dir: {:?}, transcoder: {}",
        config.server.data_dir, config.transcoder.binary
    );

    // 初始化存储、日志与探针
    let store: Arc<dyn JobStore> = Arc::new(JsonFileStore::open(config.streams_file()).await?);
    let logs = Arc::new(LogSink::new(config.logs_dir(), config.logs.max_file_bytes));
    let probe = probe_for(config.metrics.probe);

    let supervisor = Arc::new(Supervisor::new(
        config.clone(),
        store.clone(),
        logs,
        probe.clone(),
    ));

    // 清理遗留进程并恢复 active 流
    supervisor.reconcile().await?;

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        supervisor: supervisor.clone(),
        sampler: MetricsSampler::new(supervisor.clone(), probe),
        shutdown: shutdown.clone(),
    });

    // 启动后台监控程序
    let monitor = tokio::spawn(supervisor.clone().run(shutdown.clone()));

    let app = web::router(state);

    // 启动HTTP服务，监听指定的地址和端口
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                shutdown_signal().await;
                // 先结束事件流, 否则长连接会阻塞退出
                shutdown.cancel();
            }
        })
        .await?;

    info!("Shutting down, stopping transcoders");
    shutdown.cancel();
    let _ = monitor.await;
    supervisor.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
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
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
