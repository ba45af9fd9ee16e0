use std::net::SocketAddr;
use std::sync::Arc;

use wdingo_authority::{
    api, config::Settings, db, dingo::DingoClient, evm::EvmClient, metrics, state::AppState,
};

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting wDingocoin authority node");

    let settings_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("WDINGO_SETTINGS").ok())
        .unwrap_or_else(|| "settings".to_string());
    let settings = Settings::load(&settings_path)?;
    tracing::info!(
        authorities = settings.public_settings.authority_nodes.len(),
        threshold = settings.public_settings.authority_threshold,
        coordinator = settings.public_settings.payout_coordinator,
        "configuration loaded"
    );

    let wallet_key = settings.load_wallet_key()?;

    let pool = db::create_pool(&settings.node_settings.database_path).await?;
    db::run_migrations(&pool).await?;
    tracing::info!(path = %settings.node_settings.database_path, "store ready");

    let dingo = DingoClient::new(
        &settings.dingo_settings.rpc_url,
        &settings.dingo_settings.rpc_user,
        &settings.dingo_settings.rpc_password,
    )?;
    let evm = EvmClient::new(
        &settings.smart_contract_settings.provider,
        settings.smart_contract_settings.chain_id,
        &settings.smart_contract_settings.contract_address,
        &wallet_key,
    )?;

    let metrics_port = settings.node_settings.metrics_port;
    let bind_address = settings.node_settings.bind_address.clone();
    let state = Arc::new(AppState::new(settings, pool, dingo, evm)?);
    tracing::info!(
        index = state.self_index,
        coordinator = state.is_coordinator(),
        "authority identity resolved"
    );

    if let Some(port) = metrics_port {
        let addr: SocketAddr = format!("{bind_address}:{port}")
            .parse()
            .map_err(|e| eyre::eyre!("invalid metrics bind address: {e}"))?;
        tokio::spawn(async move {
            if let Err(e) = api::serve_health(addr).await {
                tracing::error!(error = %e, "health server error");
            }
        });
    }

    metrics::UP.set(1.0);

    tokio::select! {
        result = api::serve(state) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "API server error");
            }
        }
        _ = wait_for_shutdown_signal() => {}
    }

    tracing::info!("wDingocoin authority node stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,wdingo_authority=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }
}
