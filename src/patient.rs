//! Patient Event Detector: watches a resting `QuoteSnapshot` against the
//! live book and raises jittered, rate-limited requote events (§4.5).
//!
//! The priority/jitter/rate-gate shape has no direct teacher counterpart —
//! it is new functionality required by the specification — so it is built
//! in the idiom of the teacher's other watchdog loops (`ingestor::
//! LatencyAuditor`'s rolling-window style) and tested the same direct way.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::execution::RequotePriority;
use crate::market_data::Side;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PatientConfig {
    pub top_n_threshold: usize,
    pub queue_ahead_threshold_ratio: f64,
    pub drift_check_interval_ms: u64,
    pub drift_threshold_bps: f64,
    pub max_session_ttl_ms: u64,
    pub level_ttl_ms: u64,
    pub min_requote_interval_ms: u64,
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatientEventKind {
    TopNExit,
    QueueAhead,
    Drift,
    LevelTtl,
    SessionTtl,
}

#[derive(Debug, Clone, Copy)]
pub struct PatientEvent {
    pub kind: PatientEventKind,
    pub side: Side,
    pub level: usize,
    pub priority: RequotePriority,
}

/// One resting level's posted context, snapshotted at post time.
#[derive(Debug, Clone, Copy)]
pub struct QuoteSnapshot {
    pub side: Side,
    pub level: usize,
    pub price: f64,
    pub mid_at_post: f64,
    pub posted_at: Instant,
    pub level_deadline: Instant,
}

impl QuoteSnapshot {
    pub fn new(side: Side, level: usize, price: f64, mid_at_post: f64, now: Instant, level_ttl: Duration) -> Self {
        Self { side, level, price, mid_at_post, posted_at: now, level_deadline: now + level_ttl }
    }
}

pub struct PatientEventDetector {
    config: PatientConfig,
    snapshots: HashMap<(Side, usize), QuoteSnapshot>,
    session_deadline: Option<Instant>,
    last_emitted: HashMap<(Side, usize), Instant>,
}

impl PatientEventDetector {
    pub fn new(config: PatientConfig) -> Self {
        Self { config, snapshots: HashMap::new(), session_deadline: None, last_emitted: HashMap::new() }
    }

    /// Starts (or restarts) the single session timer, jittered by `U(0, jitter_ms)`.
    pub fn start_session(&mut self, now: Instant) {
        let jitter = rand::thread_rng().gen_range(0..=self.config.jitter_ms.max(1));
        self.session_deadline = Some(now + Duration::from_millis(self.config.max_session_ttl_ms + jitter));
    }

    pub fn track(&mut self, snapshot: QuoteSnapshot) {
        self.snapshots.insert((snapshot.side, snapshot.level), snapshot);
    }

    pub fn untrack(&mut self, side: Side, level: usize) {
        self.snapshots.remove(&(side, level));
    }

    pub fn tracked(&self) -> Vec<QuoteSnapshot> {
        self.snapshots.values().copied().collect()
    }

    fn rate_gate(&mut self, side: Side, level: usize, now: Instant) -> bool {
        let key = (side, level);
        let allowed = self
            .last_emitted
            .get(&key)
            .map(|t| now.duration_since(*t) >= Duration::from_millis(self.config.min_requote_interval_ms))
            .unwrap_or(true);
        if allowed {
            self.last_emitted.insert(key, now);
        }
        allowed
    }

    /// Top-N exit: our price no longer appears among the top-N levels on its
    /// own side, within one tick's tolerance. `top_n_prices` must already be
    /// the book prices for `side`.
    pub fn check_top_n_exit(&mut self, side: Side, top_n_prices: &[f64], tick: f64, now: Instant) -> Vec<PatientEvent> {
        let mut events = Vec::new();
        let keys: Vec<usize> = self
            .snapshots
            .keys()
            .filter(|(s, _)| *s == side)
            .map(|(_, level)| *level)
            .collect();
        for level in keys {
            let snap = self.snapshots[&(side, level)];
            let present = top_n_prices.iter().take(self.config.top_n_threshold).any(|p| (p - snap.price).abs() <= tick);
            if !present && self.rate_gate(side, level, now) {
                events.push(PatientEvent { kind: PatientEventKind::TopNExit, side, level, priority: RequotePriority::High });
            }
        }
        events
    }

    /// Queue-ahead: resting size at our exact price exceeds
    /// `queue_ahead_ratio * top_of_book_depth_our_side`.
    pub fn check_queue_ahead(&mut self, resting_size_at_price: f64, top_of_book_depth: f64, side: Side, level: usize, now: Instant) -> Option<PatientEvent> {
        if !self.snapshots.contains_key(&(side, level)) {
            return None;
        }
        let threshold = self.config.queue_ahead_threshold_ratio * top_of_book_depth;
        if resting_size_at_price > threshold && self.rate_gate(side, level, now) {
            Some(PatientEvent { kind: PatientEventKind::QueueAhead, side, level, priority: RequotePriority::Medium })
        } else {
            None
        }
    }

    /// Drift: `|mid_now - mid_at_post| / mid_at_post * 1e4 > drift_threshold_bps`.
    pub fn check_drift(&mut self, mid_now: f64, now: Instant) -> Vec<PatientEvent> {
        let mut events = Vec::new();
        let keys: Vec<(Side, usize)> = self.snapshots.keys().copied().collect();
        for (side, level) in keys {
            let snap = self.snapshots[&(side, level)];
            if snap.mid_at_post <= 0.0 {
                continue;
            }
            let drift_bps = (mid_now - snap.mid_at_post).abs() / snap.mid_at_post * 1e4;
            if drift_bps > self.config.drift_threshold_bps && self.rate_gate(side, level, now) {
                events.push(PatientEvent { kind: PatientEventKind::Drift, side, level, priority: RequotePriority::High });
            }
        }
        events
    }

    /// Per-level TTL expiry.
    pub fn check_level_ttl(&mut self, now: Instant) -> Vec<PatientEvent> {
        let mut events = Vec::new();
        let keys: Vec<(Side, usize)> = self.snapshots.keys().copied().collect();
        for (side, level) in keys {
            let snap = self.snapshots[&(side, level)];
            if now >= snap.level_deadline && self.rate_gate(side, level, now) {
                events.push(PatientEvent { kind: PatientEventKind::LevelTtl, side, level, priority: RequotePriority::Low });
            }
        }
        events
    }

    /// Single session-wide timer, jittered at `start_session`.
    pub fn check_session_ttl(&self, now: Instant) -> bool {
        self.session_deadline.map(|d| now >= d).unwrap_or(false)
    }

    /// If the session timer has expired, requotes every tracked level at
    /// medium priority and restarts the (jittered) session timer.
    pub fn check_session_ttl_and_restart(&mut self, now: Instant) -> Vec<PatientEvent> {
        if !self.check_session_ttl(now) {
            return Vec::new();
        }
        let events = self
            .snapshots
            .keys()
            .copied()
            .map(|(side, level)| PatientEvent { kind: PatientEventKind::SessionTtl, side, level, priority: RequotePriority::Medium })
            .collect();
        self.start_session(now);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> PatientConfig {
        PatientConfig {
            top_n_threshold: 3,
            queue_ahead_threshold_ratio: 2.0,
            drift_check_interval_ms: 500,
            drift_threshold_bps: 5.0,
            max_session_ttl_ms: 60_000,
            level_ttl_ms: 10_000,
            min_requote_interval_ms: 1_000,
            jitter_ms: 500,
        }
    }

    #[test]
    fn top_n_exit_raised_when_price_not_in_top_levels() {
        let mut ped = PatientEventDetector::new(cfg());
        let now = Instant::now();
        ped.track(QuoteSnapshot::new(Side::Buy, 0, 100.0, 100.05, now, Duration::from_secs(10)));
        let events = ped.check_top_n_exit(Side::Buy, &[99.0, 98.5, 98.0], 0.01, now);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, PatientEventKind::TopNExit);
    }

    #[test]
    fn top_n_exit_not_raised_when_present() {
        let mut ped = PatientEventDetector::new(cfg());
        let now = Instant::now();
        ped.track(QuoteSnapshot::new(Side::Buy, 0, 100.0, 100.05, now, Duration::from_secs(10)));
        let events = ped.check_top_n_exit(Side::Buy, &[100.0, 99.5, 99.0], 0.01, now);
        assert!(events.is_empty());
    }

    #[test]
    fn queue_ahead_raised_past_threshold() {
        let mut ped = PatientEventDetector::new(cfg());
        let now = Instant::now();
        ped.track(QuoteSnapshot::new(Side::Buy, 0, 100.0, 100.0, now, Duration::from_secs(10)));
        let event = ped.check_queue_ahead(25.0, 10.0, Side::Buy, 0, now);
        assert!(event.is_some());
    }

    #[test]
    fn drift_raised_past_threshold_bps() {
        let mut ped = PatientEventDetector::new(cfg());
        let now = Instant::now();
        ped.track(QuoteSnapshot::new(Side::Buy, 0, 100.0, 100.0, now, Duration::from_secs(10)));
        let events = ped.check_drift(100.2, now);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, PatientEventKind::Drift);
    }

    #[test]
    fn rate_gate_suppresses_repeat_events() {
        let mut ped = PatientEventDetector::new(cfg());
        let now = Instant::now();
        ped.track(QuoteSnapshot::new(Side::Buy, 0, 100.0, 100.0, now, Duration::from_secs(10)));
        let first = ped.check_drift(100.2, now);
        assert_eq!(first.len(), 1);
        let second = ped.check_drift(100.2, now + Duration::from_millis(100));
        assert!(second.is_empty());
        let third = ped.check_drift(100.2, now + Duration::from_millis(1_100));
        assert_eq!(third.len(), 1);
    }

    #[test]
    fn level_ttl_expires() {
        let mut ped = PatientEventDetector::new(cfg());
        let now = Instant::now();
        ped.track(QuoteSnapshot::new(Side::Sell, 1, 101.0, 100.5, now, Duration::from_millis(100)));
        assert!(ped.check_level_ttl(now).is_empty());
        let events = ped.check_level_ttl(now + Duration::from_millis(150));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, PatientEventKind::LevelTtl);
    }

    #[test]
    fn session_ttl_includes_jitter() {
        let mut ped = PatientEventDetector::new(cfg());
        let now = Instant::now();
        ped.start_session(now);
        assert!(!ped.check_session_ttl(now + Duration::from_millis(59_000)));
        assert!(ped.check_session_ttl(now + Duration::from_millis(61_000)));
    }

    #[test]
    fn session_ttl_restart_requotes_tracked_levels() {
        let mut ped = PatientEventDetector::new(cfg());
        let now = Instant::now();
        ped.start_session(now);
        ped.track(QuoteSnapshot::new(Side::Buy, 0, 100.0, 100.0, now, Duration::from_secs(60)));
        assert!(ped.check_session_ttl_and_restart(now + Duration::from_millis(30_000)).is_empty());
        let events = ped.check_session_ttl_and_restart(now + Duration::from_millis(61_000));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, PatientEventKind::SessionTtl);
        assert!(!ped.check_session_ttl(now + Duration::from_millis(61_100)));
    }
}
