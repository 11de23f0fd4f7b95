//! Risk Manager: aggregates inventory, PnL, drift and volatility signals
//! into a trade gate plus size/spread multipliers, and forces flatten/stop.
//!
//! Grounded on the teacher's `RiskManager`/`RiskConfig`/`RiskState` (kill
//! switch, daily-drawdown halt, consecutive-loss tracking), expanded to the
//! full limit-evaluation table of the specification. The high-water-mark
//! drawdown shape additionally follows the `DrawdownMonitor` structure in
//! `examples/cooprefr-bettersys/rust-backend/src/risk.rs`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::RiskBreach;
use crate::market_data::InventoryState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_inventory_pct: f64,
    pub drift_cut_bps: f64,
    pub session_dd_limit_pct: f64,
    pub daily_dd_limit_pct: f64,
    pub max_consecutive_fails: u32,
    pub max_orders_per_second: u32,
    pub max_spread_multiplier: f64,
    pub vol_spike_threshold_pct: f64,
    pub vol_spike_cooldown_ms: u64,
    /// Warning fraction applied to every limit above (e.g. 80.0 = warn at 80%
    /// of the limit, before the hard breach).
    pub warning_fraction_pct: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_inventory_pct: 2.0,
            drift_cut_bps: 50.0,
            session_dd_limit_pct: 5.0,
            daily_dd_limit_pct: 10.0,
            max_consecutive_fails: 5,
            max_orders_per_second: 10,
            max_spread_multiplier: 3.0,
            vol_spike_threshold_pct: 150.0,
            vol_spike_cooldown_ms: 60_000,
            warning_fraction_pct: 80.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub inventory_pct: f64,
    pub drift_bps: f64,
    pub session_dd_pct: f64,
    pub daily_dd_pct: f64,
    pub consecutive_failures: u32,
    pub orders_per_second: f64,
    pub vol_spike_ratio: f64,
    pub overall_risk_score: f64,
    pub risk_level: RiskLevel,
    pub is_flat: bool,
    pub in_cooldown: bool,
    pub emergency_stopped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskEventKind {
    InventoryLimit,
    DriftLimit,
    SessionDrawdown,
    DailyDrawdown,
    ConsecutiveFailures,
    VolSpike,
    RateLimit,
    EmergencyStop,
    NewsStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskAction {
    Flatten,
    Stop,
    ReduceSizeAndCooldown,
    Warn,
    Pause,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskEvent {
    pub kind: RiskEventKind,
    pub action: RiskAction,
    pub is_warning: bool,
}

pub struct RiskManager {
    limits: RiskLimits,
    session_pnl_hwm: f64,
    session_pnl: f64,
    daily_pnl_hwm: f64,
    daily_pnl: f64,
    last_daily_reset: chrono::DateTime<chrono::Utc>,
    consecutive_failures: u32,
    failure_times: VecDeque<Instant>,
    order_times: VecDeque<Instant>,
    vol_samples: VecDeque<(Instant, f64)>,
    cooldown_until: Option<Instant>,
    emergency_stopped: bool,
    news_paused_until: Option<Instant>,
}

const FAILURE_WINDOW: Duration = Duration::from_secs(5 * 60);
const ORDER_RATE_WINDOW: Duration = Duration::from_secs(1);
const VOL_BASELINE_WINDOW: Duration = Duration::from_secs(60 * 60);

impl RiskManager {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            session_pnl_hwm: 0.0,
            session_pnl: 0.0,
            daily_pnl_hwm: 0.0,
            daily_pnl: 0.0,
            last_daily_reset: chrono::Utc::now(),
            consecutive_failures: 0,
            failure_times: VecDeque::new(),
            order_times: VecDeque::new(),
            vol_samples: VecDeque::new(),
            cooldown_until: None,
            emergency_stopped: false,
            news_paused_until: None,
        }
    }

    pub fn record_pnl(&mut self, session_pnl: f64, daily_pnl: f64) {
        self.session_pnl = session_pnl;
        self.daily_pnl = daily_pnl;
        if session_pnl > self.session_pnl_hwm {
            self.session_pnl_hwm = session_pnl;
        }
        if daily_pnl > self.daily_pnl_hwm {
            self.daily_pnl_hwm = daily_pnl;
        }
    }

    pub fn record_volatility_sample(&mut self, sigma: f64, now: Instant) {
        self.vol_samples.push_back((now, sigma));
        while let Some(&(t, _)) = self.vol_samples.front() {
            if now.duration_since(t) > VOL_BASELINE_WINDOW {
                self.vol_samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_order_attempt(&mut self, now: Instant) {
        self.order_times.push_back(now);
        while let Some(&t) = self.order_times.front() {
            if now.duration_since(t) > ORDER_RATE_WINDOW {
                self.order_times.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        self.failure_times.push_back(now);
        while let Some(&t) = self.failure_times.front() {
            if now.duration_since(t) > FAILURE_WINDOW {
                self.failure_times.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn trigger_emergency_stop(&mut self) {
        self.emergency_stopped = true;
        log::error!("RISK: emergency stop engaged");
    }

    pub fn reset_emergency_stop(&mut self) {
        self.emergency_stopped = false;
        self.cooldown_until = None;
        log::info!("RISK: emergency stop cleared");
    }

    pub fn trigger_news_pause(&mut self, duration: Duration, now: Instant) {
        self.news_paused_until = Some(now + duration);
        log::warn!("RISK: news pause engaged for {:?}", duration);
    }

    fn start_cooldown(&mut self, now: Instant) {
        self.cooldown_until = Some(now + Duration::from_millis(self.limits.vol_spike_cooldown_ms));
    }

    /// Midnight UTC daily reset of the daily watermark/PnL.
    pub fn maybe_roll_daily(&mut self, now_utc: chrono::DateTime<chrono::Utc>) {
        if now_utc.date_naive() > self.last_daily_reset.date_naive() {
            self.daily_pnl = 0.0;
            self.daily_pnl_hwm = 0.0;
            self.last_daily_reset = now_utc;
            log::info!("RISK: daily watermark reset");
        }
    }

    fn session_dd_pct(&self) -> f64 {
        if self.session_pnl_hwm <= 0.0 {
            return 0.0;
        }
        (0.0_f64).max((self.session_pnl_hwm - self.session_pnl) / self.session_pnl_hwm.abs() * 100.0)
    }

    fn daily_dd_pct(&self) -> f64 {
        if self.daily_pnl_hwm <= 0.0 {
            return 0.0;
        }
        (0.0_f64).max((self.daily_pnl_hwm - self.daily_pnl) / self.daily_pnl_hwm.abs() * 100.0)
    }

    fn vol_baseline(&self) -> f64 {
        if self.vol_samples.is_empty() {
            return 0.0;
        }
        self.vol_samples.iter().map(|(_, s)| *s).sum::<f64>() / self.vol_samples.len() as f64
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.map(|t| now < t).unwrap_or(false)
    }

    fn news_paused(&self, now: Instant) -> bool {
        self.news_paused_until.map(|t| now < t).unwrap_or(false)
    }

    pub fn can_trade(&self, now: Instant) -> bool {
        !self.emergency_stopped && !self.news_paused(now) && !self.in_cooldown(now)
    }

    /// Evaluates every limit from §4.3's table against current signals.
    /// Returns the derived `RiskMetrics` plus any raised events (limit or
    /// warning), in table order.
    pub fn evaluate(
        &mut self,
        inventory: &InventoryState,
        current_volatility: f64,
        now: Instant,
    ) -> (RiskMetrics, Vec<RiskEvent>) {
        let mut events = Vec::new();
        let w = self.limits.warning_fraction_pct / 100.0;

        let inventory_pct = inventory.nav_pct.abs();
        raise_if_breached(
            &mut events,
            RiskEventKind::InventoryLimit,
            RiskAction::Flatten,
            inventory_pct,
            self.limits.max_inventory_pct,
            w,
        );

        let drift_bps = inventory.drift_bps.abs();
        raise_if_breached(
            &mut events,
            RiskEventKind::DriftLimit,
            RiskAction::Flatten,
            drift_bps,
            self.limits.drift_cut_bps,
            w,
        );

        let session_dd_pct = self.session_dd_pct();
        raise_if_breached(
            &mut events,
            RiskEventKind::SessionDrawdown,
            RiskAction::Flatten,
            session_dd_pct,
            self.limits.session_dd_limit_pct,
            w,
        );

        let daily_dd_pct = self.daily_dd_pct();
        if raise_if_breached(
            &mut events,
            RiskEventKind::DailyDrawdown,
            RiskAction::Stop,
            daily_dd_pct,
            self.limits.daily_dd_limit_pct,
            w,
        ) {
            self.trigger_emergency_stop();
        }

        if self.consecutive_failures >= self.limits.max_consecutive_fails {
            events.push(RiskEvent {
                kind: RiskEventKind::ConsecutiveFailures,
                action: RiskAction::Flatten,
                is_warning: false,
            });
        }

        let baseline = self.vol_baseline();
        let vol_spike_ratio = if baseline > 0.0 { current_volatility / baseline } else { 1.0 };
        if vol_spike_ratio * 100.0 > self.limits.vol_spike_threshold_pct {
            events.push(RiskEvent {
                kind: RiskEventKind::VolSpike,
                action: RiskAction::ReduceSizeAndCooldown,
                is_warning: false,
            });
            self.start_cooldown(now);
        }

        let orders_per_second = self.order_times.len() as f64;
        if orders_per_second > self.limits.max_orders_per_second as f64 {
            events.push(RiskEvent {
                kind: RiskEventKind::RateLimit,
                action: RiskAction::Warn,
                is_warning: true,
            });
        }

        if self.emergency_stopped {
            events.push(RiskEvent {
                kind: RiskEventKind::EmergencyStop,
                action: RiskAction::Stop,
                is_warning: false,
            });
        }
        if self.news_paused(now) {
            events.push(RiskEvent {
                kind: RiskEventKind::NewsStop,
                action: RiskAction::Pause,
                is_warning: false,
            });
        }

        let inv_score = (inventory_pct / self.limits.max_inventory_pct).clamp(0.0, 1.0);
        let drift_score = (drift_bps / self.limits.drift_cut_bps).clamp(0.0, 1.0);
        let dd_score = (session_dd_pct.max(daily_dd_pct)
            / self.limits.session_dd_limit_pct.max(self.limits.daily_dd_limit_pct).max(1e-9))
        .clamp(0.0, 1.0);
        let overall_risk_score = 0.4 * inv_score + 0.3 * drift_score + 0.3 * dd_score;

        let risk_level = if overall_risk_score >= 0.8 {
            RiskLevel::Critical
        } else if overall_risk_score >= 0.6 {
            RiskLevel::High
        } else if overall_risk_score >= 0.3 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        let metrics = RiskMetrics {
            inventory_pct,
            drift_bps,
            session_dd_pct,
            daily_dd_pct,
            consecutive_failures: self.consecutive_failures,
            orders_per_second,
            vol_spike_ratio,
            overall_risk_score,
            risk_level,
            is_flat: inventory.is_flat(),
            in_cooldown: self.in_cooldown(now),
            emergency_stopped: self.emergency_stopped,
        };

        (metrics, events)
    }

    /// `size_multiplier` per risk level: critical 0, high 0.5, medium 0.8, else 1.0.
    pub fn size_multiplier(&self, level: RiskLevel) -> f64 {
        match level {
            RiskLevel::Critical => 0.0,
            RiskLevel::High => 0.5,
            RiskLevel::Medium => 0.8,
            RiskLevel::Low => 1.0,
        }
    }

    /// `spread_multiplier = min(max_spread_mult, base * extra)`.
    pub fn spread_multiplier(&self, vol_spike_ratio: f64, level: RiskLevel) -> f64 {
        let base = if vol_spike_ratio > 1.5 { vol_spike_ratio.max(1.0) } else { 1.0 };
        let extra = match level {
            RiskLevel::Critical => 2.0,
            RiskLevel::High => 1.5,
            _ => 1.0,
        };
        (base * extra).min(self.limits.max_spread_multiplier)
    }

    /// Converts a raised flatten/stop event into a propagating `RiskBreach`,
    /// per §7's propagation rule ("RM's RiskBreach is never recoverable
    /// locally and always propagates").
    pub fn to_breach(&self, event: RiskEvent, metrics: &RiskMetrics) -> Option<RiskBreach> {
        match event.kind {
            RiskEventKind::InventoryLimit => Some(RiskBreach::InventoryLimit {
                nav_pct: metrics.inventory_pct,
                max_pct: self.limits.max_inventory_pct,
            }),
            RiskEventKind::DriftLimit => Some(RiskBreach::DriftLimit {
                drift_bps: metrics.drift_bps,
                cut_bps: self.limits.drift_cut_bps,
            }),
            RiskEventKind::SessionDrawdown => Some(RiskBreach::SessionDrawdown {
                session_dd_pct: metrics.session_dd_pct,
                limit_pct: self.limits.session_dd_limit_pct,
            }),
            RiskEventKind::DailyDrawdown => Some(RiskBreach::DailyDrawdown {
                daily_dd_pct: metrics.daily_dd_pct,
                limit_pct: self.limits.daily_dd_limit_pct,
            }),
            RiskEventKind::ConsecutiveFailures => Some(RiskBreach::ConsecutiveFailures {
                count: metrics.consecutive_failures,
                max: self.limits.max_consecutive_fails,
            }),
            RiskEventKind::EmergencyStop => Some(RiskBreach::EmergencyStop),
            RiskEventKind::NewsStop => Some(RiskBreach::NewsStop {
                duration_ms: self.limits.vol_spike_cooldown_ms,
            }),
            RiskEventKind::VolSpike | RiskEventKind::RateLimit => None,
        }
    }
}

fn raise_if_breached(
    events: &mut Vec<RiskEvent>,
    kind: RiskEventKind,
    action: RiskAction,
    value: f64,
    limit: f64,
    warning_fraction: f64,
) -> bool {
    if value > limit {
        events.push(RiskEvent { kind, action, is_warning: false });
        true
    } else if value > limit * warning_fraction {
        events.push(RiskEvent { kind, action, is_warning: true });
        false
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inv(nav_pct: f64) -> InventoryState {
        InventoryState {
            position: 1.0,
            nav_pct,
            entry_price: 100.0,
            unrealized_pnl: 0.0,
            drift_bps: 0.0,
        }
    }

    #[test]
    fn s5_inventory_cap_raises_flatten() {
        let mut rm = RiskManager::new(RiskLimits { max_inventory_pct: 2.0, ..Default::default() });
        let (_, events) = rm.evaluate(&inv(2.5), 0.3, Instant::now());
        assert!(events
            .iter()
            .any(|e| e.kind == RiskEventKind::InventoryLimit && e.action == RiskAction::Flatten && !e.is_warning));
    }

    #[test]
    fn drawdown_zero_while_hwm_non_positive() {
        let rm = RiskManager::new(RiskLimits::default());
        assert_eq!(rm.session_dd_pct(), 0.0);
        assert_eq!(rm.daily_dd_pct(), 0.0);
    }

    #[test]
    fn overall_risk_score_monotonic_in_inventory() {
        let mut rm = RiskManager::new(RiskLimits::default());
        let (low, _) = rm.evaluate(&inv(0.1), 0.1, Instant::now());
        let (high, _) = rm.evaluate(&inv(1.9), 0.1, Instant::now());
        assert!(high.overall_risk_score >= low.overall_risk_score);
    }

    #[test]
    fn size_multiplier_zero_at_critical() {
        let rm = RiskManager::new(RiskLimits::default());
        assert_eq!(rm.size_multiplier(RiskLevel::Critical), 0.0);
        assert_eq!(rm.size_multiplier(RiskLevel::Low), 1.0);
    }

    #[test]
    fn consecutive_failures_triggers_flatten() {
        let mut rm = RiskManager::new(RiskLimits { max_consecutive_fails: 2, ..Default::default() });
        let now = Instant::now();
        rm.record_failure(now);
        rm.record_failure(now);
        let (_, events) = rm.evaluate(&inv(0.0), 0.1, now);
        assert!(events.iter().any(|e| e.kind == RiskEventKind::ConsecutiveFailures));
    }

    proptest::proptest! {
        #[test]
        fn invariant_risk_score_non_decreasing_in_inventory(
            nav_a in 0.0f64..2.0,
            nav_delta in 0.0f64..2.0,
        ) {
            let mut rm = RiskManager::new(RiskLimits::default());
            let now = Instant::now();
            let (m_a, _) = rm.evaluate(&inv(nav_a), 0.1, now);
            let (m_b, _) = rm.evaluate(&inv(nav_a + nav_delta), 0.1, now);
            prop_assert!(m_b.overall_risk_score >= m_a.overall_risk_score - 1e-12);
        }
    }
}
