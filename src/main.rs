use std::sync::Arc;

use anyhow::Context;
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::{EnvFilter, prelude::*};

use rhone_chat::api::anthropic::AnthropicTransport;
use rhone_chat::app::spawn_session;
use rhone_chat::config::Config;
use rhone_chat::server;
use rhone_chat::service::{ChatService, ChatSession};
use rhone_chat::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();

    let cfg = Config::from_env();

    let store = Arc::new(
        Store::open(&cfg.database_path)
            .await
            .with_context(|| format!("open store at {}", cfg.database_path.display()))?,
    );

    let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
        rhone_chat::Error::Configuration("ANTHROPIC_API_KEY must be set".to_string())
    })?;
    let transport = Arc::new(AnthropicTransport::new(&api_key));

    let service = Arc::new(ChatService::new(
        Arc::clone(&store),
        transport,
        cfg.clone(),
    ));
    let session = ChatSession::new(spawn_session(&cfg.default_model));
    server::seed_session(&service, &session)
        .await
        .context("seed session view")?;

    let app = server::router(Arc::clone(&service), Arc::clone(&session));
    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    info!(addr = %addr, dev_mode = cfg.dev_mode, "starting server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.close().await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rhone_chat=debug"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(filter)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
