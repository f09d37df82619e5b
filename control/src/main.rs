use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use deployer_control::config::Args;
use deployer_control::db::{self, execute_async, now_secs};
use deployer_control::services::{auth, heartbeat_monitor};
use deployer_control::{api, build_state, tls};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(log_level.into()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting node deployer control plane");

    // Initialize database
    let db = db::init_db(args.db_path.clone())?;

    let purged = execute_async(&db, |conn| auth::purge_expired_sessions(conn, now_secs())).await?;
    if purged > 0 {
        info!("Purged {} expired session(s)", purged);
    }

    let state = build_state(&args, db.clone())?;

    // Deployments left pending by a previous process have no driver anymore
    state
        .orchestrator
        .recover_interrupted()
        .await
        .context("Failed to recover interrupted deployments")?;

    // Liveness sweep
    let sweep_db = db.clone();
    let (sweep_interval, window) = (args.sweep_interval(), args.liveness_window());
    tokio::spawn(async move {
        if let Err(e) = heartbeat_monitor(sweep_db, sweep_interval, window).await {
            error!("Liveness sweep failed: {}", e);
        }
    });

    // Reconciliation loops
    tokio::spawn(state.collector.clone().run_cluster_loop());
    tokio::spawn(state.collector.clone().run_deployment_loop());

    let app = api::create_router(state);

    let addr: SocketAddr = args.bind.parse().context("Invalid bind address")?;

    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let config = tls::rustls_config(cert, key)?;
            let handle = axum_server::Handle::new();
            let shutdown = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown.graceful_shutdown(Some(Duration::from_secs(10)));
            });

            info!("Listening on https://{}", addr);
            axum_server::bind_rustls(addr, config)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        _ => {
            info!("Listening on http://{}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
    }

    info!("Control plane stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
