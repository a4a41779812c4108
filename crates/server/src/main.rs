// proctord main.rs
// HTTP API for the interview integrity guardrail

use proctor_server::{build_router, AppState};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proctord=info,proctor_guardrail=info".into()),
        )
        .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    // Get port from CLI args or environment
    let port: u16 = args
        .iter()
        .position(|a| a == "--port" || a == "-p")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
        .or_else(|| {
            std::env::var("PROCTOR_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
        })
        .unwrap_or(3400);

    // Get data directory from CLI args or environment
    let data_dir: std::path::PathBuf = args
        .iter()
        .position(|a| a == "--data-dir" || a == "-d")
        .and_then(|i| args.get(i + 1))
        .map(std::path::PathBuf::from)
        .or_else(|| {
            std::env::var("PROCTOR_DATA_DIR")
                .ok()
                .map(std::path::PathBuf::from)
        })
        .unwrap_or_else(|| std::path::PathBuf::from("./proctor-data"));

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!("failed to create data directory {:?}: {}", data_dir, e);
        std::process::exit(1);
    }

    tracing::info!("data directory: {:?}", data_dir);
    tracing::info!("port: {}", port);

    let state = match AppState::open(&data_dir) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("failed to open stores: {}", e);
            std::process::exit(1);
        }
    };

    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("listening on {}", addr);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("server error: {}", e);
    }
}
