//! Hookgate Server
//!
//! Verified, deduplicated webhook ingress for a multi-tenant Slack app:
//! - Slack ingress: `/slack/events`, `/slack/commands`, `/slack/interactive`
//! - Install flow: `/slack/install`, `/slack/oauth/callback`
//! - Ops listener: `/metrics`, `/health`
//!
//! ## Configuration
//!
//! A TOML file named by `HG_CONFIG` (or the first argument), overlaid with
//! `HG_*` environment variables.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `HG_CONFIG` | - | Path to TOML config file |
//! | `HG_BIND_ADDR` | `0.0.0.0` | Listen address for both listeners |
//! | `HG_PORT` | `3000` | HTTP API port |
//! | `HG_OPS_PORT` | `9090` | Metrics/health port |
//! | `HG_JSON_LOGS` | `false` | Emit JSON log lines |
//! | `HG_SLACK_SIGNING_SECRET` | - | Slack signing secret (required) |
//! | `HG_SLACK_CLIENT_ID` | - | OAuth client id; install flow disabled when unset |
//! | `HG_SLACK_CLIENT_SECRET` | - | OAuth client secret |
//! | `HG_SLACK_REDIRECT_URI` | - | OAuth redirect URI sent on authorize and exchange |
//! | `HG_VERIFIER_TOLERANCE_SECS` | `300` | Accepted request timestamp skew |
//! | `HG_DISPATCH_CONCURRENCY` | `32` | Background worker count |
//! | `HG_REDIS_URL` | - | Redis URL; in-memory store when unset |
//! | `HG_DATABASE_URL` | - | PostgreSQL URL; in-memory installations when unset |
//! | `RUST_LOG` | `info` | Log level |

mod handler;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sqlx::postgres::PgPoolOptions;
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use hg_api::{create_router, AppState};
use hg_common::logging::init_logging;
use hg_config::HookgateConfig;
use hg_dispatch::{
    Collaborators, CredentialExchange, DelayedResponder, DispatchCoordinator, DispatchSettings,
    ExchangeConfig, IdempotencyLedger, InstallationStore, ResponderConfig, SignatureVerifier,
    WorkerPool,
};
use hg_store::{
    InstallationRepository, KvStore, MemoryInstallationRepository, MemoryKvStore,
    PostgresInstallationRepository, RedisKvStore,
};

use crate::handler::SlashCommandEcho;

fn config_path() -> Option<PathBuf> {
    std::env::var("HG_CONFIG")
        .ok()
        .or_else(|| std::env::args().nth(1))
        .map(PathBuf::from)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = HookgateConfig::load(config_path().as_deref()).context("Invalid configuration")?;

    init_logging(config.server.json_logs);
    info!("Starting Hookgate Server");

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics recorder: {e}"))?;

    let kv = create_kv_store(&config).await?;
    let repository = create_installation_repository(&config).await?;

    let installations = Arc::new(InstallationStore::new(
        repository,
        kv.clone(),
        config.cache.installation_ttl(),
    ));
    let ledger = Arc::new(IdempotencyLedger::new(
        kv.clone(),
        config.ledger.processing_ttl(),
        config.ledger.completed_ttl(),
    ));
    let pool = Arc::new(WorkerPool::from_config(&config.dispatch));
    let responder = Arc::new(DelayedResponder::new(ResponderConfig::from(&config.delayed_response))?);

    let parts = Collaborators {
        verifier: Arc::new(SignatureVerifier::new(
            config.slack.signing_secret.clone(),
            config.verifier.tolerance(),
        )),
        ledger,
        installations: installations.clone(),
        handler: Arc::new(SlashCommandEcho),
        responder,
        pool: pool.clone(),
    };
    let settings = DispatchSettings::from_config(&config.dispatch, config.ledger.processing_ttl());
    let coordinator = Arc::new(DispatchCoordinator::new(parts, settings));

    let mut state = AppState::new(coordinator);
    match ExchangeConfig::from_config(&config.slack, &config.oauth) {
        Some(exchange_config) => {
            let exchange = CredentialExchange::new(exchange_config, kv, installations)?;
            state = state.with_exchange(Arc::new(exchange));
            info!("OAuth install flow enabled");
        }
        None => info!("OAuth client credentials not set, install flow disabled"),
    }

    let app = create_router(state).layer(TraceLayer::new_for_http());

    // Start API server
    let api_addr = format!("{}:{}", config.server.bind_addr, config.server.port);
    info!("API server listening on http://{}", api_addr);
    let api_listener = TcpListener::bind(&api_addr).await?;

    // Start ops server
    let ops_addr = format!("{}:{}", config.server.bind_addr, config.server.ops_port);
    info!("Ops server listening on http://{}/metrics", ops_addr);
    let ops_app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics_handle);
    let ops_listener = TcpListener::bind(&ops_addr).await?;
    let ops_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(ops_listener, ops_app).await {
            warn!(error = %e, "Ops server stopped");
        }
    });

    info!("Hookgate Server started");

    axum::serve(api_listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Shutdown signal received, draining background work...");

    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    if !pool.drain(grace).await {
        warn!("Abandoned in-flight tasks; their ledger entries expire with the processing TTL");
    }
    ops_task.abort();

    info!("Hookgate Server shutdown complete");
    Ok(())
}

async fn create_kv_store(config: &HookgateConfig) -> Result<Arc<dyn KvStore>> {
    match config.storage.redis_url {
        Some(ref url) => {
            let store = RedisKvStore::connect(url)
                .await
                .context("Failed to connect to Redis")?;
            store.ping().await.context("Redis ping failed")?;
            info!("Using Redis key-value store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No redis_url configured, using in-memory store (single instance only)");
            let store = Arc::new(MemoryKvStore::new());
            spawn_purge_task(store.clone());
            Ok(store)
        }
    }
}

async fn create_installation_repository(
    config: &HookgateConfig,
) -> Result<Arc<dyn InstallationRepository>> {
    match config.storage.database_url {
        Some(ref url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            let repo = PostgresInstallationRepository::new(pool);
            repo.init_schema().await?;
            info!("Using PostgreSQL installation repository");
            Ok(Arc::new(repo))
        }
        None => {
            warn!("No database_url configured, installations are not durable");
            Ok(Arc::new(MemoryInstallationRepository::new()))
        }
    }
}

fn spawn_purge_task(store: Arc<MemoryKvStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "Purged expired entries");
            }
        }
    });
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    )
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeSet;

    fn documented_variables() -> BTreeSet<String> {
        include_str!("main.rs")
            .lines()
            .filter_map(|line| line.strip_prefix("//! | `"))
            .filter_map(|rest| rest.split('`').next())
            .filter(|name| name.starts_with("HG_") && *name != "HG_CONFIG")
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_documented_variables_match_env_overlay() {
        let requested = RefCell::new(BTreeSet::new());
        let mut config = HookgateConfig::default();
        config
            .apply_env(|key| {
                requested.borrow_mut().insert(key.to_string());
                None
            })
            .unwrap();

        let documented = documented_variables();
        assert!(documented.contains("HG_SLACK_SIGNING_SECRET"));
        assert_eq!(documented, requested.into_inner());
    }

    const MANIFESTS: &[(&str, &str)] = &[
        ("workspace", include_str!("../../../Cargo.toml")),
        ("hg-common", include_str!("../../../crates/hg-common/Cargo.toml")),
        ("hg-config", include_str!("../../../crates/hg-config/Cargo.toml")),
        ("hg-store", include_str!("../../../crates/hg-store/Cargo.toml")),
        ("hg-dispatch", include_str!("../../../crates/hg-dispatch/Cargo.toml")),
        ("hg-api", include_str!("../../../crates/hg-api/Cargo.toml")),
        ("hg-server", include_str!("../Cargo.toml")),
    ];

    fn table<'a>(manifest: &'a toml::Table, path: &[&str]) -> Option<&'a toml::Table> {
        path.iter()
            .try_fold(manifest, |t, key| t.get(*key).and_then(toml::Value::as_table))
    }

    #[test]
    fn test_manifests_declare_no_unused_test_helpers() {
        for (name, raw) in MANIFESTS {
            let manifest: toml::Table = raw.parse().unwrap();
            for section in [
                &["dependencies"][..],
                &["dev-dependencies"][..],
                &["workspace", "dependencies"][..],
            ] {
                if let Some(deps) = table(&manifest, section) {
                    assert!(
                        !deps.contains_key("tokio-test"),
                        "{} declares tokio-test in {:?}",
                        name,
                        section
                    );
                }
            }
        }
    }

    #[test]
    fn test_store_runtime_is_test_only() {
        let manifest: toml::Table = MANIFESTS
            .iter()
            .find(|(name, _)| *name == "hg-store")
            .map(|(_, raw)| raw.parse().unwrap())
            .unwrap();

        assert!(!table(&manifest, &["dependencies"]).unwrap().contains_key("tokio"));
        assert!(table(&manifest, &["dev-dependencies"]).unwrap().contains_key("tokio"));
    }
}
