use std::sync::Arc;

use backend::config::Config;
use backend::store::{FileStore, GroupStore, MemoryStore};
use backend::{app, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();
    let store: Arc<dyn GroupStore> = match &config.persist_path {
        Some(path) => {
            info!(path = %path.display(), "using file-backed group store");
            Arc::new(
                FileStore::open(path.clone())
                    .await
                    .expect("open group store"),
            )
        }
        None => {
            info!("using in-memory group store");
            Arc::new(MemoryStore::default())
        }
    };

    let state = AppState::new(store);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .expect("bind");
    info!(port = config.port, "giftly backend listening");
    axum::serve(listener, app(state)).await.expect("server error");
}
