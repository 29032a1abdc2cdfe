// ===============================
// src/main.rs
// ===============================
/*
 curl -s localhost:9898/metrics | egrep '^(feed_connected|book_updates_total)'
 curl -s localhost:9898/metrics | grep '^spread_'
*/
mod calculator;
mod config;
mod contract_code;
mod domain;
mod exchange_feed;
mod fix_codec;
mod fix_session;
mod metrics;
mod registry;
mod store;
mod supervisor;
mod token;

use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::calculator::ArbitrageCalculator;
use crate::config::{Args, ConfigError};
use crate::exchange_feed::ExchangeFeedClient;
use crate::fix_session::FixClient;
use crate::registry::SubscriptionRegistry;
use crate::store::OrderBookStore;
use crate::supervisor::Supervisor;
use crate::token::{HttpTokenRefresher, TokenCache};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::load();

    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(args).await {
        error!(%e, "startup failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), ConfigError> {
    // ---- Static configuration ----
    let creds = config::load_credentials(&args.credentials)?;
    let universe = config::load_universe(&args.assets)?;
    let exchange_symbols = universe.exchange_symbols(Local::now().naive_local())?;
    let lots = universe.lot_table();

    info!(
        exchange = ?exchange_symbols,
        forex = ?universe.forex_symbols(),
        lot_multipliers = lots.len(),
        fix = %format!("{}:{}", args.fix_host, args.fix_port),
        depth_policy = ?args.depth_policy,
        "startup config"
    );

    metrics::init();

    // ---- Shared state ----
    let registry = Arc::new(SubscriptionRegistry::new());
    let store = Arc::new(OrderBookStore::new());

    let feed = ExchangeFeedClient::new(
        args.exchange_ws_url.clone(),
        exchange_symbols,
        registry.clone(),
        store.clone(),
        TokenCache::new(HttpTokenRefresher::new(args.oauth_url.clone(), creds.refresh_token.clone())),
    );
    let feed_up = feed.subscribe_connected();
    let fix = FixClient::new(args.fix_config(&creds, &universe), registry.clone(), store.clone());
    let fix_state = fix.subscribe_state();
    let calc = ArbitrageCalculator::new(registry, store, universe.resolver(), lots, args.depth_policy);

    // ---- Tasks ----
    let mut sup = Supervisor::new();
    let stop = sup.shutdown_signal();
    sup.spawn("metrics", metrics::serve_metrics(args.metrics_port, stop.clone()));
    sup.spawn("exchange_feed", feed.run(stop.clone()));
    sup.spawn("fix_market_data", fix.run(stop.clone()));
    sup.spawn("fix_state", fix_session::log_state_changes(fix_state, stop.clone()));
    sup.spawn(
        "spread_poll",
        supervisor::poll_spreads(calc, args.orders.clone(), args.poll_interval(), feed_up, stop),
    );

    // venues do not reconnect: an ended task is reported and the rest keep going
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        select! {
            res = &mut ctrl_c => {
                if let Err(e) = res {
                    error!(%e, "ctrl-c handler failed");
                }
                info!("ctrl-c received");
                break;
            }
            next = sup.join_next() => match next {
                Some(task) => warn!(task, remaining = sup.len(), "task ended"),
                None => break,
            },
        }
    }

    sup.shutdown(SHUTDOWN_GRACE).await;
    info!("screener stopped");
    Ok(())
}
