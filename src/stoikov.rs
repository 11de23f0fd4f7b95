//! Stoikov Engine: rolling volatility/intensity estimators plus on-demand
//! reservation-price / half-spread / ladder-size quote derivation.
//!
//! Grounded directly on the formulas in the engine specification, and on the
//! canonical `reservation_price`/`optimal_spread`/`quotes` call shape from
//! the Avellaneda-Stoikov reference simulation in this retrieval pack
//! (`other_examples/5d8ca82b_Alfagov-avellaneda-stokov-rs__src-sim.rs.rs`).

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::ValidationError;
use crate::market_data::MarketState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimezoneProfile {
    Asia,
    Eu,
    Us,
    Global,
}

impl TimezoneProfile {
    /// True if `utc_hour` (0-23) falls inside this profile's session window
    /// (Asia 00-08, EU 07-16, US 13-22, Global always-on).
    pub fn is_in_session(&self, utc_hour: u32) -> bool {
        match self {
            TimezoneProfile::Asia => utc_hour < 8,
            TimezoneProfile::Eu => (7..16).contains(&utc_hour),
            TimezoneProfile::Us => (13..22).contains(&utc_hour),
            TimezoneProfile::Global => true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StoikovConfig {
    pub gamma: f64,
    pub volatility_window_ms: u64,
    pub intensity_window_ms: u64,
    pub max_inventory_pct: f64,
    pub post_only_offset_ticks: f64,
    pub tick_size: f64,
    pub ladder_levels: u32,
    pub alpha_size_ratio: f64,
    pub base_notional: f64,
    pub microprice_bias: bool,
    pub vol_regime_scaler: f64,
    pub timezone_profile: TimezoneProfile,
}

impl StoikovConfig {
    /// Validates the construction-time parameter ranges from §4.2. Invalid
    /// parameters are a fatal configuration error, never a runtime one.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_range("gamma", self.gamma, 1e-9, 5.0)?;
        check_range(
            "volatility_window_ms",
            self.volatility_window_ms as f64,
            1_000.0,
            600_000.0,
        )?;
        check_range("max_inventory_pct", self.max_inventory_pct, 1e-9, 50.0)?;
        Ok(())
    }
}

fn check_range(name: &'static str, value: f64, low: f64, high: f64) -> Result<(), ValidationError> {
    if value < low || value > high {
        return Err(ValidationError::ParamOutOfRange { name, value, low, high });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StoikovQuotes {
    pub reservation_price: f64,
    pub half_spread: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    pub skew_factor: f64,
    pub regime_multiplier: f64,
}

/// EWMA volatility estimator over log-return squares, annualised.
struct VolatilityEstimator {
    window: Duration,
    alpha: f64,
    variance: f64,
    last_mid: Option<f64>,
    last_update: Option<Instant>,
    samples: VecDeque<Instant>,
    initialized: bool,
}

impl VolatilityEstimator {
    fn new(window_ms: u64, initial_annualized: f64) -> Self {
        let window_secs = window_ms as f64 / 1000.0;
        let alpha = 2.0 / (window_secs + 1.0);
        let initial_variance = (initial_annualized * initial_annualized) / (252.0 * 86400.0);
        Self {
            window: Duration::from_millis(window_ms),
            alpha,
            variance: initial_variance,
            last_mid: None,
            last_update: None,
            samples: VecDeque::new(),
            initialized: true,
        }
    }

    fn update(&mut self, mid: f64, now: Instant) {
        if let Some(prev) = self.last_mid {
            if prev > 0.0 && mid > 0.0 {
                let r = (mid / prev).ln();
                let r_sq = r * r;
                self.variance = self.alpha * r_sq + (1.0 - self.alpha) * self.variance;
            }
        }
        self.last_mid = Some(mid);
        self.last_update = Some(now);
        self.samples.push_back(now);
        while let Some(&front) = self.samples.front() {
            if now.duration_since(front) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn annualized(&self) -> f64 {
        (self.variance * 252.0 * 86400.0).sqrt()
    }
}

/// Counts trades over a sliding window to derive arrival intensity k.
struct IntensityEstimator {
    window: Duration,
    trade_times: VecDeque<Instant>,
}

impl IntensityEstimator {
    fn new(window_ms: u64) -> Self {
        Self {
            window: Duration::from_millis(window_ms),
            trade_times: VecDeque::new(),
        }
    }

    fn record_trade(&mut self, now: Instant) {
        self.trade_times.push_back(now);
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.trade_times.front() {
            if now.duration_since(front) > self.window {
                self.trade_times.pop_front();
            } else {
                break;
            }
        }
    }

    fn intensity(&self, now: Instant) -> f64 {
        let mut count = 0usize;
        for &t in &self.trade_times {
            if now.duration_since(t) <= self.window {
                count += 1;
            }
        }
        let window_secs = self.window.as_secs_f64().max(1e-9);
        (count as f64 / window_secs).max(0.1)
    }
}

/// Owns the rolling estimators exclusively; other components only ever see
/// a `StoikovQuotes` snapshot.
pub struct StoikovEngine {
    config: StoikovConfig,
    volatility: VolatilityEstimator,
    intensity: IntensityEstimator,
}

impl StoikovEngine {
    pub fn new(config: StoikovConfig, initial_volatility_annualized: f64) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(Self {
            volatility: VolatilityEstimator::new(config.volatility_window_ms, initial_volatility_annualized),
            intensity: IntensityEstimator::new(config.intensity_window_ms),
            config,
        })
    }

    pub fn on_mid_update(&mut self, mid: f64, now: Instant) {
        self.volatility.update(mid, now);
    }

    pub fn on_trade(&mut self, now: Instant) {
        self.intensity.record_trade(now);
    }

    pub fn current_volatility(&self) -> f64 {
        self.volatility.annualized()
    }

    /// Computes quotes for the current market/inventory state. Returns
    /// `None` if either input is missing, per §4.2.
    pub fn quote(
        &self,
        market: &MarketState,
        position: f64,
        nav_pct: f64,
        now: Instant,
        in_session: bool,
    ) -> Option<StoikovQuotes> {
        let sigma = self.current_volatility();
        let k = self.intensity.intensity(now);
        let gamma = self.config.gamma;

        let r0 = if self.config.microprice_bias { market.microprice } else { market.mid };

        // Inventory shift.
        let r_shifted = r0 - gamma * sigma * sigma * position;

        // Optimal half-spread with floor.
        let delta0 = (gamma * sigma * sigma) / (2.0 * k) + (1.0 + gamma / k).ln() / gamma;
        let floor = (0.3 * market.spread).max(self.config.post_only_offset_ticks * self.config.tick_size);
        let delta = delta0.max(floor);

        // Inventory skew: magnitude from the unsigned NAV ratio, sign from
        // the direction the engine wants to unload (opposite the position).
        let rho = nav_pct / self.config.max_inventory_pct;
        let skew_sign = -position.signum();
        let skew = skew_sign * (2.0 * rho).tanh() * 0.001;
        let r = r_shifted + skew;

        // Regime multiplier, multiplicative with the timezone factor.
        let sigma_ref = 0.3;
        let regime_base = 1.0 + (sigma / sigma_ref - 1.0) * self.config.vol_regime_scaler;
        let timezone_factor = if in_session { 1.0 } else { 1.2 };
        let regime_multiplier = regime_base * timezone_factor;
        let delta_adjusted = delta * regime_multiplier;
        let half_spread = delta_adjusted / 2.0;

        let bid_price = r - half_spread;
        let ask_price = r + half_spread;

        // Sizing.
        let base = self.config.base_notional * self.config.alpha_size_ratio;
        let shrink = 1.0 - 0.5 * rho.abs().min(1.0);
        let sized = base * shrink;
        let (bid_mult, ask_mult) = if position > 0.0 {
            (0.7, 1.3)
        } else if position < 0.0 {
            (1.3, 0.7)
        } else {
            (1.0, 1.0)
        };
        let ladder = (self.config.ladder_levels.max(1)) as f64;
        let bid_size = sized * bid_mult / ladder;
        let ask_size = sized * ask_mult / ladder;

        Some(StoikovQuotes {
            reservation_price: r,
            half_spread,
            bid_price,
            ask_price,
            bid_size,
            ask_size,
            skew_factor: skew,
            regime_multiplier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn cfg() -> StoikovConfig {
        StoikovConfig {
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
        }
    }

    fn market(mid: f64, spread: f64) -> MarketState {
        MarketState {
            mid,
            microprice: mid,
            spread,
            spread_bps: spread / mid * 10_000.0,
            obi: 0.0,
            top_bid_depth: 10.0,
            top_ask_depth: 10.0,
            weighted_mid: mid,
            impact_bid: mid,
            impact_ask: mid,
            volatility: Some(0.3),
            intensity: Some(2.0),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn s1_symmetric_quote_zero_inventory() {
        let engine = StoikovEngine::new(cfg(), 0.3).unwrap();
        let m = market(100.05, 0.10);
        let now = Instant::now();
        let q = engine.quote(&m, 0.0, 0.0, now, true).unwrap();
        assert!((q.reservation_price - 100.05).abs() < 0.01);
        assert!(q.half_spread * 2.0 >= 0.3 * 0.10 - 1e-9);
        assert!(q.bid_price <= 100.02 + 1e-9);
        assert!(q.ask_price >= 100.08 - 1e-9);
        assert!(q.bid_price < q.ask_price);
    }

    #[test]
    fn s2_positive_inventory_skews_reservation_down() {
        let engine = StoikovEngine::new(cfg(), 0.5).unwrap();
        let m = market(100.05, 0.10);
        let now = Instant::now();
        let q = engine.quote(&m, 1.0, 10.0, now, true).unwrap();
        assert!(q.reservation_price < m.mid);
        assert!(q.bid_size < q.ask_size);
    }

    #[test]
    fn skew_sign_follows_position_direction_not_magnitude() {
        // Position near zero so the dominant `r_shifted` term is negligible
        // and the sign of the reservation shift isolates the skew term.
        let engine = StoikovEngine::new(cfg(), 0.3).unwrap();
        let m = market(100.05, 0.10);
        let now = Instant::now();
        let long_tiny = engine.quote(&m, 1e-6, 10.0, now, true).unwrap();
        let short_tiny = engine.quote(&m, -1e-6, 10.0, now, true).unwrap();
        assert!(long_tiny.reservation_price < m.mid, "long inventory should push reservation down to unload");
        assert!(short_tiny.reservation_price > m.mid, "short inventory should push reservation up to unload");
    }

    #[test]
    fn invariant_bid_below_ask() {
        let engine = StoikovEngine::new(cfg(), 0.4).unwrap();
        let m = market(50.0, 0.05);
        let q = engine.quote(&m, -0.5, 5.0, Instant::now(), true).unwrap();
        assert!(q.bid_price < q.ask_price);
    }

    #[test]
    fn invalid_gamma_rejected_at_construction() {
        let mut c = cfg();
        c.gamma = 10.0;
        assert!(StoikovEngine::new(c, 0.3).is_err());
    }

    proptest::proptest! {
        #[test]
        fn invariant_inventory_monotonicity(
            q_small in -1.0f64..1.0,
            q_delta in 0.01f64..1.0,
        ) {
            let engine = StoikovEngine::new(cfg(), 0.3).unwrap();
            let m = market(100.0, 0.05);
            let now = Instant::now();
            let quote_small = engine.quote(&m, q_small, 0.0, now, true).unwrap();
            let quote_larger = engine.quote(&m, q_small + q_delta, 0.0, now, true).unwrap();
            prop_assert!(quote_larger.reservation_price < quote_small.reservation_price);
            prop_assert!(quote_larger.bid_price < quote_small.bid_price);
            prop_assert!(quote_larger.ask_price < quote_small.ask_price);
        }

        #[test]
        fn invariant_size_shrinks_with_nav_pct(
            nav_small in 0.0f64..1.0,
            nav_delta in 0.01f64..0.9,
        ) {
            let engine = StoikovEngine::new(cfg(), 0.3).unwrap();
            let m = market(100.0, 0.05);
            let now = Instant::now();
            let small = engine.quote(&m, 0.0, nav_small, now, true).unwrap();
            let larger = engine.quote(&m, 0.0, nav_small + nav_delta, now, true).unwrap();
            prop_assert!(larger.bid_size <= small.bid_size + 1e-12);
            prop_assert!(larger.ask_size <= small.ask_size + 1e-12);
        }
    }
}
