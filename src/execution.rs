//! Execution Engine: owns the ladder of `ManagedOrder`s and drives the
//! per-order state machine of §4.4.
//!
//! Grounded on the teacher's `MmExecutionEngine` (session stats, halted
//! flag, rate-gated posting) generalized from a Hyperliquid-specific
//! cancel/OFI/drawdown guard into the venue-neutral order-level state
//! machine the specification describes.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::VenueError;
use crate::market_data::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Idle,
    Placing,
    MakerPlaced,
    PartialFilled,
    Filled,
    Cancelling,
    Replacing,
    Flattening,
    Cooldown,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub ladder_levels: usize,
    pub post_only_offset_ticks: f64,
    pub tick_size: f64,
    pub ttl_ms: u64,
    pub repost_ms: u64,
    pub max_retries: u32,
    pub partial_fill_threshold_pct: f64,
    pub cooldown_ms: u64,
    pub flatten_timeout_ms: u64,
    pub max_improvements: u32,
    pub improvement_ticks: f64,
}

#[derive(Debug, Clone)]
pub struct ManagedOrder {
    pub client_id: String,
    pub exchange_id: Option<String>,
    pub side: Side,
    pub level: usize,
    pub price: f64,
    pub original_size: f64,
    pub filled_size: f64,
    pub state: OrderState,
    pub retries: u32,
    pub improvement_count: u32,
    pub last_improvement: Option<Instant>,
    pub placed_at: Option<Instant>,
    pub ttl_deadline: Option<Instant>,
}

impl ManagedOrder {
    fn new(side: Side, level: usize, price: f64, size: f64) -> Self {
        Self {
            client_id: Uuid::new_v4().to_string(),
            exchange_id: None,
            side,
            level,
            price,
            original_size: size,
            filled_size: 0.0,
            state: OrderState::Idle,
            retries: 0,
            improvement_count: 0,
            last_improvement: None,
            placed_at: None,
            ttl_deadline: None,
        }
    }

    pub fn remaining(&self) -> f64 {
        (self.original_size - self.filled_size).max(0.0)
    }

    pub fn fill_pct(&self) -> f64 {
        if self.original_size <= 0.0 {
            0.0
        } else {
            self.filled_size / self.original_size
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequotePriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone)]
pub struct RequoteRequest {
    pub side: Side,
    pub level: usize,
    pub priority: RequotePriority,
    pub queued_at: Instant,
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub placed: u64,
    pub filled: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub reposts: u64,
    fill_latencies_us: [u64; 100],
    fill_latency_idx: usize,
    fill_latency_count: usize,
}

impl ExecutionStats {
    pub fn fill_ratio(&self) -> f64 {
        if self.placed == 0 {
            0.0
        } else {
            self.filled as f64 / self.placed as f64
        }
    }

    pub fn rejection_rate(&self) -> f64 {
        if self.placed == 0 {
            0.0
        } else {
            self.failed as f64 / self.placed as f64
        }
    }

    pub fn repost_rate(&self) -> f64 {
        if self.placed == 0 {
            0.0
        } else {
            self.reposts as f64 / self.placed as f64
        }
    }

    fn record_fill_latency(&mut self, latency_us: u64) {
        self.fill_latencies_us[self.fill_latency_idx] = latency_us;
        self.fill_latency_idx = (self.fill_latency_idx + 1) % self.fill_latencies_us.len();
        self.fill_latency_count = (self.fill_latency_count + 1).min(self.fill_latencies_us.len());
    }

    pub fn mean_fill_latency_us(&self) -> f64 {
        if self.fill_latency_count == 0 {
            0.0
        } else {
            self.fill_latencies_us[..self.fill_latency_count].iter().sum::<u64>() as f64
                / self.fill_latency_count as f64
        }
    }
}

/// Owns the live ladder and the rate-gated repost queue. Pure state machine:
/// callers feed venue acks/fills/rejects in and drain placement/cancel
/// intents out; no network I/O lives here.
pub struct ExecutionEngine {
    config: ExecutionConfig,
    orders: HashMap<(Side, usize), ManagedOrder>,
    repost_queue: VecDeque<RequoteRequest>,
    last_repost: Option<Instant>,
    position: f64,
    stats: ExecutionStats,
    cooldown_until: Option<Instant>,
}

impl ExecutionEngine {
    pub fn new(config: ExecutionConfig) -> Self {
        Self {
            config,
            orders: HashMap::new(),
            repost_queue: VecDeque::new(),
            last_repost: None,
            position: 0.0,
            stats: ExecutionStats::default(),
            cooldown_until: None,
        }
    }

    pub fn stats(&self) -> ExecutionStats {
        self.stats
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    /// Computes the `ladder_levels` prices/sizes for one side around a quote
    /// price per §4.4's "Ladder placement" rule.
    pub fn ladder_prices(&self, quote_price: f64, side: Side, base_size: f64) -> Vec<(f64, f64)> {
        let n = self.config.ladder_levels.max(1);
        let per_level_size = base_size / n as f64;
        (0..n)
            .map(|level| {
                let offset = if level == 0 {
                    0.0
                } else {
                    self.config.tick_size * (level as f64 + 1.0) * self.config.post_only_offset_ticks
                };
                let price = match side {
                    Side::Buy => quote_price - offset,
                    Side::Sell => quote_price + offset,
                };
                (price, per_level_size)
            })
            .collect()
    }

    /// Returns true only when `now - last_repost >= repostMs`.
    pub fn can_repost(&self, now: Instant) -> bool {
        self.last_repost
            .map(|t| now.duration_since(t) >= Duration::from_millis(self.config.repost_ms))
            .unwrap_or(true)
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.map(|t| now < t).unwrap_or(false)
    }

    /// Places a fresh ladder level: Idle -> Placing.
    pub fn begin_place(&mut self, side: Side, level: usize, price: f64, size: f64, now: Instant) {
        let mut order = self.orders.remove(&(side, level)).unwrap_or_else(|| ManagedOrder::new(side, level, price, size));
        order.price = price;
        order.original_size = size;
        order.filled_size = 0.0;
        order.state = OrderState::Placing;
        order.placed_at = Some(now);
        self.orders.insert((side, level), order);
        self.last_repost = Some(now);
        self.stats.placed += 1;
    }

    /// Placing -> MakerPlaced on venue ack.
    pub fn on_ack(&mut self, side: Side, level: usize, exchange_id: String, now: Instant) {
        if let Some(order) = self.orders.get_mut(&(side, level)) {
            order.exchange_id = Some(exchange_id);
            order.state = OrderState::MakerPlaced;
            order.ttl_deadline = Some(now + Duration::from_millis(self.config.ttl_ms));
        }
    }

    /// Placing -> Error on venue reject, with the retry-with-backoff policy.
    pub fn on_reject(&mut self, side: Side, level: usize) -> Option<Duration> {
        let order = self.orders.get_mut(&(side, level))?;
        order.retries += 1;
        self.stats.failed += 1;
        if order.retries > self.config.max_retries {
            order.state = OrderState::Error;
            None
        } else {
            order.state = OrderState::Error;
            Some(Duration::from_secs(order.retries as u64))
        }
    }

    /// MakerPlaced/PartialFilled -> Filled/PartialFilled on a fill event.
    pub fn on_fill(&mut self, side: Side, level: usize, fill_size: f64, now: Instant) -> bool {
        let Some(order) = self.orders.get_mut(&(side, level)) else { return false };
        order.filled_size += fill_size;
        match order.side {
            Side::Buy => self.position += fill_size,
            Side::Sell => self.position -= fill_size,
        }
        if let Some(placed_at) = order.placed_at {
            self.stats.record_fill_latency(now.duration_since(placed_at).as_micros() as u64);
        }

        let threshold = self.config.partial_fill_threshold_pct / 100.0;
        if order.remaining() <= 1e-9 {
            order.state = OrderState::Filled;
            self.stats.filled += 1;
            true
        } else if order.fill_pct() >= threshold {
            order.state = OrderState::PartialFilled;
            self.enqueue_requote(side, level, RequotePriority::Medium, now);
            false
        } else {
            false
        }
    }

    /// MakerPlaced -> Replacing on TTL expiry / book move / queue-ahead breach.
    pub fn enqueue_requote(&mut self, side: Side, level: usize, priority: RequotePriority, now: Instant) {
        if let Some(order) = self.orders.get_mut(&(side, level)) {
            order.state = OrderState::Replacing;
        }
        self.repost_queue.push_back(RequoteRequest { side, level, priority, queued_at: now });
        self.stats.reposts += 1;
    }

    /// Drains the repost queue in priority order, ties by arrival time.
    pub fn next_requote(&mut self) -> Option<RequoteRequest> {
        if self.repost_queue.is_empty() {
            return None;
        }
        let mut best_idx = 0;
        for (i, req) in self.repost_queue.iter().enumerate() {
            let best = &self.repost_queue[best_idx];
            let better = priority_rank(req.priority) < priority_rank(best.priority)
                || (priority_rank(req.priority) == priority_rank(best.priority) && req.queued_at < best.queued_at);
            if better {
                best_idx = i;
            }
        }
        self.repost_queue.remove(best_idx)
    }

    /// Replacing -> MakerPlaced on replace ack.
    pub fn on_replace_ack(&mut self, side: Side, level: usize, exchange_id: String, now: Instant) {
        self.on_ack(side, level, exchange_id, now);
    }

    /// MakerPlaced/PartialFilled/Replacing -> Cancelling: a cancel request is
    /// in flight at the venue (either as part of a patient improvement's
    /// cancel/replace, or a give-up requote).
    pub fn begin_cancel(&mut self, side: Side, level: usize) {
        if let Some(order) = self.orders.get_mut(&(side, level)) {
            order.state = OrderState::Cancelling;
        }
    }

    /// Attempts a patient level improvement: only if `improvement_count <
    /// max_improvements` and `now - last_improvement >= 5s`. Returns the
    /// improved price if eligible.
    pub fn try_improve(&mut self, side: Side, level: usize, now: Instant) -> Option<f64> {
        let order = self.orders.get_mut(&(side, level))?;
        if order.improvement_count >= self.config.max_improvements {
            return None;
        }
        if let Some(last) = order.last_improvement {
            if now.duration_since(last) < Duration::from_secs(5) {
                return None;
            }
        }
        let improved = match side {
            Side::Buy => order.price + self.config.improvement_ticks * self.config.tick_size,
            Side::Sell => order.price - self.config.improvement_ticks * self.config.tick_size,
        };
        order.improvement_count += 1;
        order.last_improvement = Some(now);
        Some(improved)
    }

    /// MakerPlaced -> Flattening on drift/DD breach. Cancels every live order
    /// and signals a single IOC/market order for `-position`.
    pub fn begin_flatten(&mut self, now: Instant) -> f64 {
        for order in self.orders.values_mut() {
            if matches!(
                order.state,
                OrderState::MakerPlaced | OrderState::PartialFilled | OrderState::Replacing | OrderState::Cancelling
            ) {
                order.state = OrderState::Flattening;
                self.stats.cancelled += 1;
            }
        }
        self.last_repost = Some(now);
        -self.position
    }

    /// Flattening -> Cooldown once the flatten order completes.
    pub fn complete_flatten(&mut self, now: Instant) {
        self.orders.clear();
        self.position = 0.0;
        self.cooldown_until = Some(now + Duration::from_millis(self.config.cooldown_ms));
    }

    /// Cooldown -> Idle once the cooldown timer expires.
    pub fn maybe_exit_cooldown(&mut self, now: Instant) -> bool {
        if let Some(t) = self.cooldown_until {
            if now >= t {
                self.cooldown_until = None;
                return true;
            }
        }
        false
    }

    /// Error -> Idle once the caller acknowledges recovery.
    pub fn recover(&mut self, side: Side, level: usize) {
        if let Some(order) = self.orders.get_mut(&(side, level)) {
            order.state = OrderState::Idle;
            order.retries = 0;
        }
    }

    pub fn order_state(&self, side: Side, level: usize) -> Option<OrderState> {
        self.orders.get(&(side, level)).map(|o| o.state)
    }

    pub fn order(&self, side: Side, level: usize) -> Option<&ManagedOrder> {
        self.orders.get(&(side, level))
    }
}

fn priority_rank(p: RequotePriority) -> u8 {
    match p {
        RequotePriority::High => 0,
        RequotePriority::Medium => 1,
        RequotePriority::Low => 2,
    }
}

pub fn map_venue_rejection(err: &VenueError) -> bool {
    matches!(err, VenueError::Rejected(_) | VenueError::RateLimited | VenueError::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ExecutionConfig {
        ExecutionConfig {
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
        }
    }

    #[test]
    fn ladder_prices_step_away_from_quote() {
        let ee = ExecutionEngine::new(cfg());
        let bids = ee.ladder_prices(100.0, Side::Buy, 3.0);
        assert_eq!(bids.len(), 3);
        assert_eq!(bids[0].0, 100.0);
        assert!(bids[1].0 < bids[0].0);
        assert!(bids[2].0 < bids[1].0);
    }

    #[test]
    fn place_ack_fill_transitions() {
        let mut ee = ExecutionEngine::new(cfg());
        let now = Instant::now();
        ee.begin_place(Side::Buy, 0, 100.0, 1.0, now);
        assert_eq!(ee.order_state(Side::Buy, 0), Some(OrderState::Placing));
        ee.on_ack(Side::Buy, 0, "ex-1".into(), now);
        assert_eq!(ee.order_state(Side::Buy, 0), Some(OrderState::MakerPlaced));
        let full = ee.on_fill(Side::Buy, 0, 1.0, now);
        assert!(full);
        assert_eq!(ee.order_state(Side::Buy, 0), Some(OrderState::Filled));
        assert_eq!(ee.position(), 1.0);
    }

    #[test]
    fn partial_fill_above_threshold_reposts() {
        let mut ee = ExecutionEngine::new(cfg());
        let now = Instant::now();
        ee.begin_place(Side::Sell, 0, 100.0, 2.0, now);
        ee.on_ack(Side::Sell, 0, "ex-2".into(), now);
        let full = ee.on_fill(Side::Sell, 0, 1.2, now);
        assert!(!full);
        assert_eq!(ee.order_state(Side::Sell, 0), Some(OrderState::PartialFilled));
        assert!(ee.next_requote().is_some());
    }

    #[test]
    fn begin_cancel_marks_in_flight_cancel_then_replace_ack_restores_maker_placed() {
        let mut ee = ExecutionEngine::new(cfg());
        let now = Instant::now();
        ee.begin_place(Side::Buy, 0, 100.0, 1.0, now);
        ee.on_ack(Side::Buy, 0, "ex-1".into(), now);
        ee.begin_cancel(Side::Buy, 0);
        assert_eq!(ee.order_state(Side::Buy, 0), Some(OrderState::Cancelling));
        ee.on_replace_ack(Side::Buy, 0, "ex-2".into(), now);
        assert_eq!(ee.order_state(Side::Buy, 0), Some(OrderState::MakerPlaced));
    }

    #[test]
    fn requote_queue_drains_high_priority_first() {
        let mut ee = ExecutionEngine::new(cfg());
        let now = Instant::now();
        ee.begin_place(Side::Buy, 0, 100.0, 1.0, now);
        ee.begin_place(Side::Buy, 1, 99.0, 1.0, now);
        ee.enqueue_requote(Side::Buy, 1, RequotePriority::Low, now);
        ee.enqueue_requote(Side::Buy, 0, RequotePriority::High, now);
        let first = ee.next_requote().unwrap();
        assert_eq!(first.level, 0);
        assert_eq!(first.priority, RequotePriority::High);
    }

    #[test]
    fn flatten_then_cooldown_then_idle() {
        let mut ee = ExecutionEngine::new(cfg());
        let now = Instant::now();
        ee.begin_place(Side::Buy, 0, 100.0, 1.0, now);
        ee.on_ack(Side::Buy, 0, "ex-3".into(), now);
        ee.on_fill(Side::Buy, 0, 1.0, now);
        let flatten_size = ee.begin_flatten(now);
        assert_eq!(flatten_size, -1.0);
        ee.complete_flatten(now);
        assert!(!ee.maybe_exit_cooldown(now));
        let later = now + Duration::from_millis(2_100);
        assert!(ee.maybe_exit_cooldown(later));
    }

    #[test]
    fn repost_rate_gated() {
        let mut ee = ExecutionEngine::new(cfg());
        let now = Instant::now();
        ee.begin_place(Side::Buy, 0, 100.0, 1.0, now);
        assert!(!ee.can_repost(now));
        assert!(ee.can_repost(now + Duration::from_millis(300)));
    }
}
