//! Bot Controller: wires MDP/SE/RM/EE/PED for one symbol on one venue,
//! translating venue order updates into the EE vocabulary and applying RM's
//! multipliers to SE's quotes before handing them to EE (§4.6).
//!
//! Grounded on the teacher's `main.rs` quoting loop, restructured around the
//! channel topology of §5.1: a single `tokio::select!` owns every component
//! outright, with no `Arc<Mutex<_>>` around core state.

use std::time::{Duration, Instant};

use chrono::Timelike;
use tokio::sync::{mpsc, watch};

use crate::error::{EngineError, RiskBreach};
use crate::exchange::{Exchange, OrderRequest, OrderStatus, OrderType, TimeInForce};
use crate::execution::{map_venue_rejection, ExecutionConfig, ExecutionEngine, OrderState};
use crate::ingestion::MarketDataEvent;
use crate::market_data::{InventoryState, MarketDataProcessor, MdpConfig, Side};
use crate::monitor::{MonitorConfig, PerformanceMonitor};
use crate::patient::{PatientConfig, PatientEvent, PatientEventDetector, QuoteSnapshot};
use crate::risk::{RiskLimits, RiskManager};
use crate::stoikov::{StoikovConfig, StoikovEngine};
use crate::venue::{apply_filters, SymbolFilter};

pub struct ControllerConfig {
    pub symbol: String,
    pub mdp: MdpConfig,
    pub stoikov: StoikovConfig,
    pub risk: RiskLimits,
    pub monitor: MonitorConfig,
    pub execution: ExecutionConfig,
    pub patient: PatientConfig,
    pub initial_volatility: f64,
    pub flatten_on_shutdown_eps: f64,
}

/// Translated venue order-update vocabulary consumed by the EE state
/// machine, per §4.6 ("Translates Exchange order updates ... into the EE
/// state machine vocabulary").
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub side: Side,
    pub level: usize,
    pub status: OrderStatus,
    pub exchange_id: Option<String>,
    pub filled_delta: f64,
}

pub struct BotController<E: Exchange> {
    config: ControllerConfig,
    exchange: E,
    mdp: MarketDataProcessor,
    se: StoikovEngine,
    rm: RiskManager,
    ee: ExecutionEngine,
    ped: PatientEventDetector,
    monitor: PerformanceMonitor,
    filter: SymbolFilter,
    inventory: InventoryState,
    in_session: bool,
}

impl<E: Exchange> BotController<E> {
    pub fn new(config: ControllerConfig, exchange: E, filter: SymbolFilter) -> Result<Self, EngineError> {
        let se = StoikovEngine::new(config.stoikov, config.initial_volatility)?;
        let rm = RiskManager::new(config.risk);
        let ee = ExecutionEngine::new(config.execution);
        let ped = PatientEventDetector::new(config.patient);
        let monitor = PerformanceMonitor::new(config.monitor);
        let mdp = MarketDataProcessor::new(MdpConfig {
            top_n_depth: config.mdp.top_n_depth,
            microprice_levels: config.mdp.microprice_levels,
            tick_size: config.mdp.tick_size,
        });
        Ok(Self {
            config,
            exchange,
            mdp,
            se,
            rm,
            ee,
            ped,
            monitor,
            filter,
            inventory: InventoryState {
                position: 0.0,
                nav_pct: 0.0,
                entry_price: 0.0,
                unrealized_pnl: 0.0,
                drift_bps: 0.0,
            },
            in_session: true,
        })
    }

    /// Drives the single cooperative task loop of §5 until `shutdown_rx`
    /// flips, then flattens if `|position| >= eps`.
    pub async fn run(
        &mut self,
        mut market_data_rx: mpsc::Receiver<MarketDataEvent>,
        mut order_update_rx: mpsc::Receiver<OrderUpdate>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        self.ped.start_session(Instant::now());
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.on_tick(Instant::now()).await;
                }
                Some(event) = market_data_rx.recv() => {
                    self.on_market_data(event).await;
                }
                Some(update) = order_update_rx.recv() => {
                    self.on_order_update(update, Instant::now()).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        self.shutdown().await;
                        break;
                    }
                }
                else => break,
            }
        }
    }

    async fn on_market_data(&mut self, event: MarketDataEvent) {
        match event {
            MarketDataEvent::Book(book) => match self.mdp.process_book(book) {
                Ok((_, state)) => {
                    self.se.on_mid_update(state.mid, Instant::now());
                    let drift_events = self.ped.check_drift(state.mid, Instant::now());
                    self.handle_patient_events(drift_events, Instant::now()).await;
                }
                Err(e) => log::warn!("controller: dropping invalid book for {}: {}", self.config.symbol, e),
            },
            MarketDataEvent::Trade(trade) => {
                self.se.on_trade(Instant::now());
                let _ = trade;
            }
        }
    }

    async fn on_tick(&mut self, now: Instant) {
        self.refresh_inventory_from_venue().await;
        let utc_now = chrono::Utc::now();
        self.rm.maybe_roll_daily(utc_now);
        self.in_session = self.config.stoikov.timezone_profile.is_in_session(utc_now.hour());
        self.rm.record_volatility_sample(self.se.current_volatility(), now);

        let (metrics, events) = self.rm.evaluate(&self.inventory, self.se.current_volatility(), now);
        for event in &events {
            if let Some(breach) = self.rm.to_breach(*event, &metrics) {
                log::warn!("controller: risk breach for {}: {}", self.config.symbol, breach);
                self.flatten(now).await;
                return;
            }
        }

        self.ee.maybe_exit_cooldown(now);
        if !self.rm.can_trade(now) || self.ee.in_cooldown(now) {
            return;
        }

        let mut patient_events = self.ped.check_level_ttl(now);
        patient_events.extend(self.ped.check_session_ttl_and_restart(now));

        let Some(book) = self.mdp.latest_book().cloned() else {
            self.handle_patient_events(patient_events, now).await;
            return;
        };
        let Some(market) = self.mdp.latest_state() else {
            self.handle_patient_events(patient_events, now).await;
            return;
        };

        let tick = self.config.execution.tick_size;
        let bid_prices: Vec<f64> = book.bids.iter().map(|l| l.price).collect();
        let ask_prices: Vec<f64> = book.asks.iter().map(|l| l.price).collect();
        patient_events.extend(self.ped.check_top_n_exit(Side::Buy, &bid_prices, tick, now));
        patient_events.extend(self.ped.check_top_n_exit(Side::Sell, &ask_prices, tick, now));

        for snap in self.ped.tracked() {
            let (levels, top_of_book_depth) = match snap.side {
                Side::Buy => (&book.bids, market.top_bid_depth),
                Side::Sell => (&book.asks, market.top_ask_depth),
            };
            let resting_at_price: f64 = levels.iter().filter(|l| (l.price - snap.price).abs() <= tick).map(|l| l.size).sum();
            if let Some(event) = self.ped.check_queue_ahead(resting_at_price, top_of_book_depth, snap.side, snap.level, now) {
                patient_events.push(event);
            }
        }

        self.handle_patient_events(patient_events, now).await;

        if !self.ee.can_repost(now) {
            return;
        }

        let Some(quotes) = self.se.quote(&market, self.inventory.position, self.inventory.nav_pct, now, self.in_session) else {
            return;
        };

        let rm_size_mult = self.rm.size_multiplier(metrics.risk_level);
        let advisory_mult = self.monitor.get_metrics().suggested_action.size_multiplier();
        let size_mult = rm_size_mult.min(advisory_mult);
        let spread_mult = self.rm.spread_multiplier(metrics.vol_spike_ratio, metrics.risk_level);

        let half_spread = quotes.half_spread * spread_mult;
        let bid = quotes.reservation_price - half_spread;
        let ask = quotes.reservation_price + half_spread;
        let bid_size = quotes.bid_size * size_mult;
        let ask_size = quotes.ask_size * size_mult;

        self.place_ladder(Side::Buy, bid, bid_size, market.mid, now).await;
        self.place_ladder(Side::Sell, ask, ask_size, market.mid, now).await;
    }

    async fn place_ladder(&mut self, side: Side, quote_price: f64, base_size: f64, mid: f64, now: Instant) {
        if base_size <= 0.0 {
            return;
        }
        let ladder = self.ee.ladder_prices(quote_price, side, base_size);
        for (level, (price, size)) in ladder.into_iter().enumerate() {
            let Ok((rounded_price, rounded_size)) = apply_filters(price, size, side, self.filter) else {
                continue;
            };
            if self.ee.order_state(side, level) == Some(OrderState::Error) {
                self.ee.recover(side, level);
            }
            self.rm.record_order_attempt(now);
            self.ee.begin_place(side, level, rounded_price, rounded_size, now);
            let request = OrderRequest {
                symbol: self.config.symbol.clone(),
                side,
                order_type: OrderType::Limit,
                amount: rounded_size,
                price: Some(rounded_price),
                time_in_force: TimeInForce::Gtx,
                post_only: true,
                client_id: None,
            };
            match self.exchange.place_order(request).await {
                Ok(order) => {
                    self.ee.on_ack(side, level, order.exchange_id, now);
                    self.ped.track(QuoteSnapshot::new(side, level, rounded_price, mid, now, Duration::from_millis(10_000)));
                }
                Err(e) => {
                    log::warn!("controller: order placement failed: {}", e);
                    self.rm.record_failure(now);
                    if map_venue_rejection(&e) {
                        self.ee.on_reject(side, level);
                    }
                }
            }
        }
    }

    /// Drains a single `Replacing` level: a patient in-place improvement
    /// when the order still has improvement budget, otherwise a cancel that
    /// leaves the level free for the next ladder post to re-center.
    async fn replace_level(&mut self, side: Side, level: usize, now: Instant) {
        let Some(order) = self.ee.order(side, level) else { return };
        let remaining = order.remaining();
        if remaining <= 0.0 {
            return;
        }
        let exchange_id = order.exchange_id.clone();

        let Some(improved_price) = self.ee.try_improve(side, level, now) else {
            if let Some(id) = exchange_id {
                self.ee.begin_cancel(side, level);
                if let Err(e) = self.exchange.cancel_order(&id, &self.config.symbol).await {
                    log::warn!("controller: requote cancel failed for {}/{}: {}", self.config.symbol, level, e);
                    return;
                }
            }
            self.ee.recover(side, level);
            self.ped.untrack(side, level);
            return;
        };

        if let Some(id) = &exchange_id {
            self.ee.begin_cancel(side, level);
            if let Err(e) = self.exchange.cancel_order(id, &self.config.symbol).await {
                log::warn!("controller: improvement cancel failed for {}/{}: {}", self.config.symbol, level, e);
                return;
            }
        }
        let Ok((rounded_price, rounded_size)) = apply_filters(improved_price, remaining, side, self.filter) else {
            return;
        };
        let request = OrderRequest {
            symbol: self.config.symbol.clone(),
            side,
            order_type: OrderType::Limit,
            amount: rounded_size,
            price: Some(rounded_price),
            time_in_force: TimeInForce::Gtx,
            post_only: true,
            client_id: None,
        };
        match self.exchange.place_order(request).await {
            Ok(new_order) => self.ee.on_replace_ack(side, level, new_order.exchange_id, now),
            Err(e) => {
                log::warn!("controller: improvement re-place failed for {}/{}: {}", self.config.symbol, level, e);
                self.rm.record_failure(now);
                if map_venue_rejection(&e) {
                    self.ee.on_reject(side, level);
                }
            }
        }
    }

    async fn on_order_update(&mut self, update: OrderUpdate, now: Instant) {
        match update.status {
            OrderStatus::New | OrderStatus::PartiallyFilled => {
                if let Some(id) = update.exchange_id {
                    self.ee.on_ack(update.side, update.level, id, now);
                }
                if update.filled_delta > 0.0 {
                    self.ee.on_fill(update.side, update.level, update.filled_delta, now);
                }
            }
            OrderStatus::Filled => {
                self.ee.on_fill(update.side, update.level, update.filled_delta, now);
                self.monitor.record_trade(self.inventory.unrealized_pnl);
                self.rm.record_success();
                self.refresh_inventory_from_venue().await;
            }
            OrderStatus::Canceled | OrderStatus::Expired => {
                self.ped.untrack(update.side, update.level);
            }
            OrderStatus::Rejected => {
                self.rm.record_failure(now);
                self.ee.on_reject(update.side, update.level);
            }
        }
    }

    async fn handle_patient_events(&mut self, events: Vec<PatientEvent>, now: Instant) {
        for event in events {
            self.ee.enqueue_requote(event.side, event.level, event.priority, now);
        }
        while let Some(req) = self.ee.next_requote() {
            log::debug!("controller: draining requote {:?} for {}/{}", req.priority, self.config.symbol, req.level);
            self.replace_level(req.side, req.level, now).await;
        }
    }

    async fn refresh_inventory_from_venue(&mut self) {
        if let Ok(positions) = self.exchange.get_positions().await {
            if let Some(pos) = positions.get(&self.config.symbol) {
                self.inventory.position = pos.size;
                self.inventory.entry_price = pos.entry_price;
                self.inventory.unrealized_pnl = pos.unrealized_pnl;
            }
        }
        if let Ok(balance) = self.exchange.get_balance().await {
            if balance > 0.0 {
                self.inventory.nav_pct = self.inventory.position.abs() * self.inventory.entry_price / balance * 100.0;
            }
        }
        // Signed deviation of the live mid from entry, per §3's drift_bps definition.
        if self.inventory.entry_price > 0.0 {
            if let Some(state) = self.mdp.latest_state() {
                self.inventory.drift_bps = (state.mid - self.inventory.entry_price) / self.inventory.entry_price * 1e4;
            }
        }
    }

    async fn flatten(&mut self, now: Instant) {
        let flatten_size = self.ee.begin_flatten(now);
        if flatten_size.abs() > self.config.flatten_on_shutdown_eps {
            let side = if flatten_size > 0.0 { Side::Buy } else { Side::Sell };
            let request = OrderRequest {
                symbol: self.config.symbol.clone(),
                side,
                order_type: OrderType::Market,
                amount: flatten_size.abs(),
                price: None,
                time_in_force: TimeInForce::Ioc,
                post_only: false,
                client_id: None,
            };
            if let Err(e) = self.exchange.place_order(request).await {
                log::error!("controller: flatten order failed: {}", e);
                self.rm.trigger_emergency_stop();
            }
        }
        self.ee.complete_flatten(now);
    }

    async fn shutdown(&mut self) {
        log::info!("controller: shutdown signal received for {}", self.config.symbol);
        if self.inventory.position.abs() >= self.config.flatten_on_shutdown_eps {
            self.flatten(Instant::now()).await;
        }
    }
}

pub fn inventory_breach_is_fatal(breach: &RiskBreach) -> bool {
    matches!(breach, RiskBreach::EmergencyStop | RiskBreach::DailyDrawdown { .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::SimExchange;
    use crate::stoikov::TimezoneProfile;

    fn cfg() -> ControllerConfig {
        ControllerConfig {
            symbol: "BTC-USD".into(),
            mdp: MdpConfig::default(),
            stoikov: StoikovConfig {
                gamma: 0.6,
                volatility_window_ms: 60_000,
                intensity_window_ms: 60_000,
                max_inventory_pct: 2.0,
                post_only_offset_ticks: 1.0,
                tick_size: 0.01,
                ladder_levels: 1,
                alpha_size_ratio: 1.0,
                base_notional: 100.0,
                microprice_bias: false,
                vol_regime_scaler: 1.0,
                timezone_profile: TimezoneProfile::Global,
            },
            risk: RiskLimits::default(),
            monitor: MonitorConfig::default(),
            execution: ExecutionConfig {
                ladder_levels: 1,
                post_only_offset_ticks: 1.0,
                tick_size: 0.01,
                ttl_ms: 5_000,
                repost_ms: 100,
                max_retries: 3,
                partial_fill_threshold_pct: 50.0,
                cooldown_ms: 1_000,
                flatten_timeout_ms: 5_000,
                max_improvements: 2,
                improvement_ticks: 1.0,
            },
            patient: PatientConfig {
                top_n_threshold: 3,
                queue_ahead_threshold_ratio: 2.0,
                drift_check_interval_ms: 500,
                drift_threshold_bps: 50.0,
                max_session_ttl_ms: 60_000,
                level_ttl_ms: 10_000,
                min_requote_interval_ms: 1_000,
                jitter_ms: 200,
            },
            initial_volatility: 0.3,
            flatten_on_shutdown_eps: 1e-3,
        }
    }

    #[tokio::test]
    async fn constructs_with_sim_exchange() {
        let exchange = SimExchange::new(10_000.0, 0.0002);
        let filter = SymbolFilter { tick_size: 0.01, lot_step: 0.001, min_notional: None };
        let controller = BotController::new(cfg(), exchange, filter);
        assert!(controller.is_ok());
    }

    #[tokio::test]
    async fn flatten_is_noop_when_already_flat() {
        let exchange = SimExchange::new(10_000.0, 0.0002);
        let filter = SymbolFilter { tick_size: 0.01, lot_step: 0.001, min_notional: None };
        let mut controller = BotController::new(cfg(), exchange, filter).unwrap();
        controller.flatten(Instant::now()).await;
        assert_eq!(controller.ee.position(), 0.0);
    }

    #[tokio::test]
    async fn on_tick_without_a_book_only_drains_patient_events() {
        let exchange = SimExchange::new(10_000.0, 0.0002);
        let filter = SymbolFilter { tick_size: 0.01, lot_step: 0.001, min_notional: None };
        let mut controller = BotController::new(cfg(), exchange, filter).unwrap();
        controller.ped.start_session(Instant::now());
        controller.on_tick(Instant::now()).await;
        assert_eq!(controller.ee.position(), 0.0);
    }

    #[tokio::test]
    async fn replace_level_improves_price_in_place_when_budget_allows() {
        let exchange = SimExchange::new(10_000.0, 0.0002);
        let filter = SymbolFilter { tick_size: 0.01, lot_step: 0.001, min_notional: None };
        let mut controller = BotController::new(cfg(), exchange, filter).unwrap();
        let now = Instant::now();
        controller.ee.begin_place(Side::Buy, 0, 100.0, 1.0, now);
        controller.ee.on_ack(Side::Buy, 0, "ex-1".into(), now);
        controller.replace_level(Side::Buy, 0, now).await;
        assert_eq!(controller.ee.order_state(Side::Buy, 0), Some(OrderState::MakerPlaced));
    }

    #[tokio::test]
    async fn replace_level_cancels_once_improvement_budget_is_exhausted() {
        let exchange = SimExchange::new(10_000.0, 0.0002);
        let filter = SymbolFilter { tick_size: 0.01, lot_step: 0.001, min_notional: None };
        let mut controller = BotController::new(cfg(), exchange, filter).unwrap();
        let now = Instant::now();
        controller.ee.begin_place(Side::Buy, 0, 100.0, 1.0, now);
        controller.ee.on_ack(Side::Buy, 0, "ex-1".into(), now);
        controller.ee.try_improve(Side::Buy, 0, now);
        let later = now + Duration::from_secs(6);
        controller.ee.try_improve(Side::Buy, 0, later);
        let even_later = later + Duration::from_secs(6);
        controller.replace_level(Side::Buy, 0, even_later).await;
        assert_eq!(controller.ee.order_state(Side::Buy, 0), Some(OrderState::Idle));
    }
}
