use std::env;
use std::path::PathBuf;

use devlife::backend::{app, BackendState};
use devlife::kv::SqliteKv;

#[tokio::main]
async fn main() {
    devlife::logging::init();

    let state = match env::var("DEVLIFE_BACKEND_DB").ok().map(PathBuf::from) {
        Some(path) => {
            let kv = SqliteKv::open(&path)
                .unwrap_or_else(|error| panic!("failed to open {}: {error}", path.display()));
            devlife::tlog!("backend: rows persisted to {}", path.display());
            BackendState::persistent(kv)
        }
        None => {
            devlife::tlog!("backend: DEVLIFE_BACKEND_DB not set, rows kept in memory");
            BackendState::in_memory()
        }
    };

    let bind = env::var("DEVLIFE_BACKEND_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .unwrap_or_else(|error| panic!("failed to bind {bind}: {error}"));
    devlife::tlog!("backend: listening on {}", bind);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .unwrap_or_else(|error| panic!("server error: {error}"));
}
