use std::sync::Arc;

use coldstart_server::api::{self, ApiState};
use coldstart_server::auth::AuthKey;
use coldstart_server::config::Config;
use coldstart_server::store::MessageStore;
use coldstart_server::{serve_live, ServerState};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load();
    let auth = AuthKey::new(&config.auth_secret);

    let store = match MessageStore::open(&config.db_path) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open message store at {}: {}", config.db_path, e);
            std::process::exit(1);
        }
    };

    let live_state = Arc::new(
        ServerState::new()
            .with_auth(auth.clone())
            .require_join_token(config.require_join_token)
            .with_join_timeout(config.join_timeout),
    );

    let ws_listener = bind(&config.ws_addr).await;
    let http_listener = bind(&config.http_addr).await;

    info!("Live channel listening on {}", config.ws_addr);
    info!("REST API listening on {}", config.http_addr);

    let app = api::router(ApiState { store, auth });

    tokio::select! {
        _ = serve_live(ws_listener, live_state) => {}
        res = axum::serve(http_listener, app) => {
            if let Err(e) = res {
                error!("REST server stopped: {}", e);
            }
        }
    }
}

async fn bind(addr: &str) -> TcpListener {
    match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    }
}
