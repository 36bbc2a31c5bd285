// ABOUTME: codexd daemon entry point: wire the stack, serve /v1, shut down cleanly

use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware;
use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use codexd_agent::{AgentProvider, CodexRuntime, CodexRuntimeConfig, RuntimeState};
use codexd_api::{create_router, AppState, ServerInfo};
use codexd_core::MonotonicClock;
use codexd_events::{EventBroadcaster, NotificationBacklog, RollupWriter};
use codexd_runs::{ExecutorConfig, RunManager};
use codexd_storage::{RunStore, RunStoreOptions};

mod auth;
mod config;
mod discovery;
mod identity;

use auth::{bearer_auth_middleware, AuthState};
use config::{Cli, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("codexd=info")),
        )
        .init();

    let config = Config::from_cli(cli);
    tokio::fs::create_dir_all(&config.state_dir).await?;
    let identity = identity::load_or_create(&config.state_dir).await?;
    let started_at = Utc::now();

    let store = Arc::new(RunStore::new(
        &config.state_dir,
        RunStoreOptions {
            persist_raw_events: config.persist_raw_events,
        },
    ));
    let clock = Arc::new(MonotonicClock::new());
    let broadcaster = Arc::new(EventBroadcaster::new());
    let backlog = Arc::new(NotificationBacklog::new());
    let rollup = Arc::new(RollupWriter::new(Arc::clone(&store), Arc::clone(&clock)));

    let runtime = CodexRuntime::start(CodexRuntimeConfig {
        enabled: config.codex_runtime_enabled,
        binary: config.codex_binary.clone(),
        args: vec!["app-server".to_string()],
        max_restart_attempts: 5,
    });

    let manager = RunManager::new(
        Arc::clone(&store),
        Arc::clone(&broadcaster),
        Arc::clone(&backlog),
        rollup,
        Arc::clone(&runtime) as Arc<dyn AgentProvider>,
        clock,
        CancellationToken::new(),
        ExecutorConfig {
            codex_binary: config.codex_binary.clone(),
        },
    );

    // An agent connection lost mid-run pauses every in-progress exec run.
    {
        let manager = Arc::clone(&manager);
        let mut state_rx = runtime.subscribe_state();
        tokio::spawn(async move {
            let mut was_ready = false;
            loop {
                let state = *state_rx.borrow_and_update();
                if was_ready
                    && matches!(state, RuntimeState::Restarting | RuntimeState::Faulted)
                {
                    warn!("codex runtime disconnected; pausing in-progress runs");
                    manager
                        .pause_all_in_progress("codex runtime disconnected")
                        .await;
                }
                was_ready = state == RuntimeState::Ready;
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    let reconciled = manager.reconcile_orphans(started_at).await;
    if reconciled > 0 {
        info!(count = reconciled, "paused orphaned runs from a previous instance");
    }

    let addr: SocketAddr = format!("{}:{}", config.listen, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let base_url = format!("http://{}:{}", config.listen, local_addr.port());

    let version = env!("CARGO_PKG_VERSION").to_string();
    let informational_version = option_env!("CODEXD_BUILD_SHA")
        .map(|sha| format!("{version}+{sha}"))
        .unwrap_or_else(|| version.clone());
    let info = Arc::new(ServerInfo {
        started_at_utc: started_at,
        runner_id: identity.runner_id.clone(),
        version,
        informational_version,
        listen: config.listen.clone(),
        port: local_addr.port(),
        require_auth: config.require_auth,
        state_dir: config.state_dir.to_string_lossy().to_string(),
        base_url: base_url.clone(),
    });

    discovery::write_runtime_file(
        &config.state_dir,
        &discovery::RuntimeFile {
            base_url: base_url.clone(),
            port: local_addr.port(),
            pid: std::process::id(),
            started_at_utc: started_at,
            state_dir: config.state_dir.to_string_lossy().to_string(),
            version: info.version.clone(),
        },
    )
    .await?;

    let app_state = AppState {
        manager: Arc::clone(&manager),
        store,
        broadcaster,
        backlog,
        runtime_state: runtime.subscribe_state(),
        info,
    };
    let auth_state = AuthState::new(config.require_auth, &identity.token);
    let app = create_router(app_state)
        .layer(middleware::from_fn_with_state(auth_state, bearer_auth_middleware))
        .layer(TraceLayer::new_for_http());

    info!(
        runner_id = %identity.runner_id,
        %base_url,
        state_dir = %config.state_dir.display(),
        "codexd listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down; pausing in-progress runs");
    manager.pause_all_in_progress("runner shutting down").await;
    manager.fail_all_in_progress("runner shutting down").await;
    runtime.dispose();
    discovery::remove_runtime_file(&config.state_dir).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
