use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chat_admin::{
    AppState,
    config::Config,
    database::{MemoryStore, PgStore, SeedData, Store},
    middleware::{RateLimiter, log_errors, rate_limit},
    routes,
    utils::hash_password,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 加载配置
    let config = Config::from_env().expect("Failed to load configuration");

    #[cfg(debug_assertions)]
    tracing::info!("Running in debug mode with CORS enabled");

    #[cfg(not(debug_assertions))]
    tracing::info!("Running in production mode with CORS disabled");

    // 选择存储实现
    let store: Arc<dyn Store> = if config.uses_memory_store() {
        tracing::warn!("Using the in-memory store, data is lost on restart");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(
            PgStore::connect(&config.database_url)
                .await
                .expect("Failed to connect to Postgres"),
        )
    };

    // 写入初始数据，已存在的记录保持不变
    let seed = SeedData::standard(
        &config.seed_admin_username,
        hash_password(&config.seed_admin_password).expect("Failed to hash seed admin password"),
        chrono::Utc::now(),
    );
    match store.seed(&seed).await {
        Ok(summary) => tracing::info!("Seed data ready: {}", summary),
        Err(e) => panic!("Failed to seed database: {e}"),
    }

    // 设置应用状态
    let state = AppState {
        store,
        config: config.clone(),
    };

    let router = routes::router(state.clone()).layer(axum::middleware::from_fn(log_errors));

    // 配置了 Redis 时启用限流
    let router = match &config.redis_url {
        Some(url) => {
            let redis_client = redis::Client::open(url.as_str()).expect("Failed to create Redis client");
            let rate_limiter = Arc::new(RateLimiter::new(redis_client, config.clone()));
            tracing::info!(
                "Rate limiting enabled: {} requests per {:?}",
                config.rate_limit_requests,
                config.rate_limit_window()
            );
            router.layer(axum::middleware::from_fn_with_state(rate_limiter, rate_limit))
        }
        None => {
            tracing::info!("REDIS_URL not set, rate limiting disabled");
            router
        }
    };

    // 根据编译模式决定是否添加CORS
    #[cfg(debug_assertions)]
    let router = {
        tracing::debug!("Adding CORS layer for development mode");
        router.layer(tower_http::cors::CorsLayer::permissive())
    };

    // 启动服务器
    let addr = SocketAddr::new(
        state.config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        state.config.server_port,
    );
    tracing::info!("Server listening on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind"),
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Failed to start server");
}
