mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use clipshare_codec::RoomCodec;
use clipshare_crypto::Cipher;
use clipshare_gateway::hub::Hub;
use clipshare_store::RoomStore;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clipshare_server=debug,clipshare_gateway=debug,clipshare_store=info,tower_http=debug".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {:#}", e);
            eprintln!("       Set it in your .env file and restart.");
            std::process::exit(1);
        }
    };

    let codec = match RoomCodec::new(&config.hash_salt) {
        Ok(codec) => codec,
        Err(e) => {
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };
    let cipher = Cipher::new(config.encryption_key);

    // Init database
    let db = clipshare_db::Database::open(&config.db_path)?;

    let store = RoomStore::new(db, codec, cipher)
        .with_room_ttl(chrono::Duration::days(config.room_ttl_days));
    let hub = Hub::new(Arc::new(store));

    let app = clipshare_gateway::router(hub)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Clipshare server listening on {}", addr);
    info!("Rooms expire after {} days", config.room_ttl_days);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    ctrl_c.await.ok();
                    info!("Received Ctrl+C, shutting down...");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
