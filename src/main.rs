//! Binary entry point (§4.6.1): loads `.env`, initialises logging, selects
//! `SimExchange` or the reference `LiveExchange`, wires the Bot Controller,
//! and runs it until a Ctrl-C shutdown signal.
//!
//! Grounded on the teacher's own `main.rs` entry-point shell.

mod controller;
mod error;
mod exchange;
mod execution;
mod ingestion;
mod market_data;
mod monitor;
mod patient;
mod risk;
mod stoikov;
mod venue;

use controller::{BotController, ControllerConfig, OrderUpdate};
use exchange::{LiveExchange, SimExchange};
use execution::ExecutionConfig;
use ingestion::{FrameParser, MarketDataEvent};
use market_data::MdpConfig;
use monitor::MonitorConfig;
use patient::PatientConfig;
use risk::RiskLimits;
use stoikov::{StoikovConfig, TimezoneProfile};
use venue::SymbolFilter;

use tokio::sync::{mpsc, watch};

struct NullParser;

impl FrameParser for NullParser {
    fn parse(&self, _text: &str) -> Option<MarketDataEvent> {
        None
    }
}

fn load_config(symbol: String) -> ControllerConfig {
    ControllerConfig {
        symbol,
        mdp: MdpConfig::default(),
        stoikov: StoikovConfig {
            gamma: std::env::var("MM_GAMMA").ok().and_then(|v| v.parse().ok()).unwrap_or(0.6),
            volatility_window_ms: 60_000,
            intensity_window_ms: 60_000,
            max_inventory_pct: std::env::var("MM_MAX_INVENTORY_PCT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2.0),
            post_only_offset_ticks: 1.0,
            tick_size: 0.01,
            ladder_levels: 3,
            alpha_size_ratio: 1.0,
            base_notional: 100.0,
            microprice_bias: true,
            vol_regime_scaler: 1.0,
            timezone_profile: TimezoneProfile::Global,
        },
        risk: RiskLimits::default(),
        monitor: MonitorConfig::default(),
        execution: ExecutionConfig {
            ladder_levels: 3,
            post_only_offset_ticks: 1.0,
            tick_size: 0.01,
            ttl_ms: 5_000,
            repost_ms: 250,
            max_retries: 3,
            partial_fill_threshold_pct: 50.0,
            cooldown_ms: 2_000,
            flatten_timeout_ms: 10_000,
            max_improvements: 2,
            improvement_ticks: 1.0,
        },
        patient: PatientConfig {
            top_n_threshold: 5,
            queue_ahead_threshold_ratio: 2.0,
            drift_check_interval_ms: 500,
            drift_threshold_bps: 25.0,
            max_session_ttl_ms: 120_000,
            level_ttl_ms: 15_000,
            min_requote_interval_ms: 1_000,
            jitter_ms: 500,
        },
        initial_volatility: 0.3,
        flatten_on_shutdown_eps: 1e-3,
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();
    log::info!("stoikov-mm-rs starting");

    let symbol = std::env::var("MM_SYMBOL").unwrap_or_else(|_| "BTC-USD".to_string());
    let shadow_mode = std::env::var("MM_SHADOW_MODE")
        .map(|v| v != "false" && v != "0")
        .unwrap_or(true);

    let config = load_config(symbol.clone());
    let filter = SymbolFilter { tick_size: 0.01, lot_step: 0.001, min_notional: Some(10.0) };

    let (market_data_tx, market_data_rx) = mpsc::channel::<MarketDataEvent>(1024);
    let (order_update_tx, order_update_rx) = mpsc::channel::<OrderUpdate>(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    drop(order_update_tx);

    if shadow_mode {
        log::info!("running in shadow mode against SimExchange");
        let exchange = SimExchange::new(10_000.0, 0.0002);
        let mut controller = BotController::new(config, exchange, filter).expect("controller config invalid");

        let ingestion_config = ingestion::IngestionConfig {
            ws_url: std::env::var("MM_WS_URL").unwrap_or_else(|_| "wss://example.invalid/ws".to_string()),
            subscriptions: vec![],
            max_backoff_secs: 32,
        };
        let stall_flag = ingestion::new_stall_flag();
        tokio::spawn(ingestion::run(
            ingestion_config,
            std::sync::Arc::new(NullParser),
            market_data_tx,
            stall_flag,
        ));

        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(true);
        });

        controller.run(market_data_rx, order_update_rx, shutdown_rx).await;
    } else {
        let base_url = std::env::var("MM_VENUE_URL").expect("MM_VENUE_URL must be set in live mode");
        let api_key = std::env::var("MM_API_KEY").expect("MM_API_KEY must be set in live mode");
        let exchange = LiveExchange::new(base_url, api_key);
        let mut controller = BotController::new(config, exchange, filter).expect("controller config invalid");

        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(true);
        });

        controller.run(market_data_rx, order_update_rx, shutdown_rx).await;
    }
}
