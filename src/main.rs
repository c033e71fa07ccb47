mod account;
mod alerts;
mod api;
mod config;
mod contracts;
mod db;
mod errors;
mod matcher;
mod metrics;
mod rates;
mod reconciler;
mod rules;
mod sequencer;
mod store;
mod types;

use std::sync::Arc;

use account::AccountManager;
use alerts::{Alerts, LogAlerts, TelegramAlerts};
use config::Config;
use matcher::cache::MemoryMatchCache;
use matcher::{Matcher, MatcherManager};
use rates::{FixedRateProvider, HttpRateProvider, RateProvider};
use rules::evaluator::RuleEvaluator;
use rules::{JsonRuleGraph, RuleSet, TokenRegistry};
use sequencer::Sequencer;
use store::Store;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    // Run the async main
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    // Initialize logging
    init_logging();

    tracing::info!(app = config::APP_NAME, "Starting settlement engine");

    // Load configuration
    let config = Config::load()?;
    tracing::info!(
        chains = config.chains.len(),
        makers = config.makers.private_keys.len(),
        port = config.server.port,
        "Configuration loaded"
    );

    // Connect to database
    let db = db::create_pool(&config.database.url).await?;
    tracing::info!("Database connected");

    // Run migrations
    db::run_migrations(&db).await?;
    tracing::info!("Database migrations complete");

    // Rule configuration
    let rule_set = Arc::new(RuleSet::load_dir(&config.rules.rule_dir)?);
    let tokens = Arc::new(TokenRegistry::load_file(&config.rules.token_registry_file)?);
    let graph = Arc::new(JsonRuleGraph::load_file(&config.rules.rule_graph_file)?);
    let evaluator = Arc::new(RuleEvaluator::new(
        Arc::clone(&rule_set),
        Arc::clone(&tokens),
        graph,
    ));

    // Shared state and collaborators
    let store = Arc::new(Store::new(db.clone()));
    let accounts = Arc::new(AccountManager::new(
        &config.chains,
        &config.makers.private_keys,
    )?);
    let alerts: Arc<dyn Alerts> = match (&config.alerts.tg_bot_token, &config.alerts.tg_chat_id) {
        (Some(token), Some(chat)) => Arc::new(TelegramAlerts::new(token.clone(), chat.clone())),
        _ => Arc::new(LogAlerts),
    };
    let rates: Arc<dyn RateProvider> = match &config.settlement.rate_url {
        Some(url) => Arc::new(HttpRateProvider::new(url.clone())),
        // Same-asset bridging only without a quote service; the bound
        // degenerates to a raw amount comparison at rate 1.
        None => {
            tracing::warn!("RATE_URL not set, using unit rates for the value bound");
            Arc::new(
                FixedRateProvider::default()
                    .with_price("ETH", "1")
                    .with_price("USDC", "1")
                    .with_price("USDT", "1")
                    .with_price("DAI", "1"),
            )
        }
    };

    // Recover interrupted payouts and rebuild the in-flight queue before
    // anything else runs.
    reconciler::reconcile_on_startup(&db, &store, &accounts, &tokens).await?;
    tracing::info!("Startup reconciliation complete");

    // Create shutdown channels
    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let (shutdown_tx2, shutdown_rx2) = tokio::sync::mpsc::channel::<()>(1);

    // Setup signal handlers
    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx_signal.send(()).await;
        let _ = shutdown_tx2.send(()).await;
    });

    // Create managers
    let match_cache = Arc::new(MemoryMatchCache::default());
    let matcher = Arc::new(Matcher::new(
        db.clone(),
        evaluator,
        match_cache,
        Arc::clone(&store),
        Arc::clone(&tokens),
    ));
    let mut matcher_manager = MatcherManager::new(matcher);
    let sequencer = Sequencer::new(
        db.clone(),
        Arc::clone(&store),
        accounts,
        alerts,
        rates,
        config.settlement.max_value_loss_bps,
        std::time::Duration::from_millis(config.settlement.sequencer_poll_ms),
    );

    tracing::info!("Managers initialized, starting processing");

    // Start status/metrics server
    let api_addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let api_db = db.clone();
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_addr, api_db).await {
            tracing::error!(error = %e, "Status server error");
        }
    });

    // Run matcher and sequencer concurrently
    tokio::select! {
        result = matcher_manager.run(shutdown_rx) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Matcher manager error");
            }
        }
        result = sequencer.run(shutdown_rx2) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Sequencer error");
            }
        }
    }

    tracing::info!("Settlement engine stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_settler=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
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
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
