use std::sync::Arc;

use promptgate::api::router;
use promptgate::config::{load_config, AppConfig};
use promptgate::observability::init_tracing;
use promptgate::state::AppState;
use promptgate::transport::HttpTransport;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";

fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = load_config(&config_path).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration from '{config_path}': {e}");
        eprintln!("Please copy 'config.example.yaml' to 'config.yaml' and modify as needed.");
        std::process::exit(1);
    });

    init_tracing(&config.features.log_level, &config.features.log_format);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Failed to initialize Tokio runtime: {e}");
            std::process::exit(1);
        });
    runtime.block_on(run(config));
}

async fn run(config: AppConfig) {
    let host = config.server.host.clone();
    let port = config.server.port;
    let transport = HttpTransport::new(&config.server).unwrap_or_else(|e| {
        eprintln!("{e}");
        std::process::exit(1);
    });
    let supplier_count = config.suppliers.len();
    let state = Arc::new(AppState::new(config, transport));

    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}"))
        .await
        .unwrap_or_else(|err| {
            eprintln!("Failed to bind to {host}:{port}: {err}");
            std::process::exit(1);
        });
    tracing::info!(host = %host, port, suppliers = supplier_count, "promptgate listening");

    if let Err(err) = axum::serve(listener, router(state)).await {
        tracing::error!(error = %err, "server stopped");
        std::process::exit(1);
    }
}
