// src/main.rs

use axum::serve;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use ctv_adx::api::{self, AppState};
use ctv_adx::bidding::{AuctionEngine, HttpAuctionExecutor};
use ctv_adx::config::{ConfigManager, ConfigOverrides};
use ctv_adx::feature::FeatureCache;
use ctv_adx::logging::RuntimeLogger;
use ctv_adx::model::adapters::{ConfigStore, FileConfigStore};

#[derive(Parser, Debug)]
#[command(author = "whiteCcinn", version = "1.0", about = "CTV ad-pod decisioning server")]
struct CliArgs {
    #[arg(short, long)]
    port: Option<u16>,
    #[arg(long)]
    log_dir: Option<String>,
    /// JSON 配置文件
    #[arg(short, long)]
    config: Option<String>,
    /// 文件配置存储路径
    #[arg(long)]
    store: Option<String>,
}

#[tokio::main]
async fn main() {
    // 设置环境变量 TZ 为东八区
    std::env::set_var("TZ", "Asia/Shanghai");

    let args = CliArgs::parse();
    let config = ConfigManager::from_args(
        args.config.as_deref(),
        ConfigOverrides {
            port: args.port,
            log_dir: args.log_dir,
            store_path: args.store,
        },
    )
    .expect("Unable to load configuration");
    let settings = config.config().clone();

    // 初始化全局 tracing 日志
    let log_file = rolling::hourly(&settings.log_dir, "adx_log.json");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);
    let subscriber = Registry::default()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().json().with_writer(non_blocking));
    tracing::subscriber::set_global_default(subscriber).expect("Unable to set global tracing subscriber");
    info!(port = settings.port, "CTV ADX server starting");

    // 运行日志：每个请求一条聚合竞价记录
    let runtime_logger = RuntimeLogger::new(&settings.log_dir, "runtime", 1000, 100, 1000);
    runtime_logger.log("INFO", "CTV ADX server is starting...").await;

    let store: Arc<dyn ConfigStore> = Arc::new(FileConfigStore::new(&settings.store_path));
    let features = Arc::new(FeatureCache::new(
        store.clone(),
        config.refresh_interval(),
        &settings.analytics_throttle_default,
    ));
    features.start().await;

    let executor = Arc::new(HttpAuctionExecutor::new(config.active_demands()));
    let engine = AuctionEngine::new(Arc::new(config), store, features.clone(), executor)
        .with_runtime_logger(runtime_logger.clone());
    let state = Arc::new(AppState { engine, features: features.clone() });

    let addr = format!("0.0.0.0:{}", settings.port);
    let listener = TcpListener::bind(&addr).await.expect("Unable to bind listen address");
    runtime_logger.log("INFO", &format!("CTV ADX server running at http://{}", addr)).await;

    let server = serve(listener, api::router(state)).with_graceful_shutdown(async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
    });
    if let Err(e) = server.await {
        error!(error = %e, "server error");
    }

    runtime_logger.log("INFO", "Shutting down gracefully...").await;
    features.stop().await;
    runtime_logger.shutdown().await;
    info!("CTV ADX server shut down");
}
