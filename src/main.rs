use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use final_words::{broadcaster, config::Config, consumer, langs, server};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "final-words starting");

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    info!(
        env = %cfg.env,
        jetstream = %cfg.jetstream_url,
        db_path = %cfg.db_path.display(),
        workers = cfg.workers,
        "config loaded"
    );

    let cancel = CancellationToken::new();

    let (deletions, languages) = match consumer::consume(&cfg, cancel.clone()) {
        Ok(channels) => channels,
        Err(e) => {
            eprintln!("FATAL: failed to start consumer: {e}");
            std::process::exit(1);
        }
    };
    let top_langs = langs::count_langs(languages, cancel.clone());

    let known_langs = broadcaster::known_langs();
    let (observers_tx, observers_rx) = mpsc::channel(16);
    tokio::spawn(broadcaster::run(
        deletions,
        observers_rx,
        top_langs,
        Arc::clone(&known_langs),
        cancel.clone(),
    ));

    let state = server::AppState {
        observers: observers_tx,
        known_langs,
        host: cfg.host.clone(),
    };
    let router = server::build_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.port))
        .await
        .expect("failed to bind");
    info!(port = cfg.port, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await
        .expect("server error");
    info!("shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C, then cancels every worker and lets axum
/// finish in-flight requests.
async fn shutdown_signal(cancel: CancellationToken) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); }
        _ = terminate => { info!("received SIGTERM, shutting down"); }
    }
    cancel.cancel();
}
