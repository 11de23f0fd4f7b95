//! Market-Data Processor: validates raw L2 books/trades and derives the
//! microstructure features the rest of the engine quotes against.
//!
//! Grounded on the teacher's `ingestor::L2BookSnapshot` (mid/spread/spread_bps)
//! generalized to a venue-neutral book shape, plus the microprice/OBI/impact
//! formulas from the engine specification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::MarketDataError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L2Book {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl L2Book {
    pub fn top_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    pub fn top_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    fn sort(&mut self) {
        self.bids
            .sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        self.asks
            .sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Trade {
    pub price: f64,
    pub size: f64,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
}

/// Signed position and drift vs. entry, refreshed from venue truth after
/// every fill and at periodic sync intervals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InventoryState {
    pub position: f64,
    pub nav_pct: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub drift_bps: f64,
}

/// Base-unit tolerance below which a position is considered flat.
pub const EPS_POSITION: f64 = 1e-3;

impl InventoryState {
    pub fn is_flat(&self) -> bool {
        self.position.abs() < EPS_POSITION
    }
}

/// Derived, published snapshot. `volatility`/`intensity` are left `None`
/// here and filled in by the Stoikov Engine before quoting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarketState {
    pub mid: f64,
    pub microprice: f64,
    pub spread: f64,
    pub spread_bps: f64,
    pub obi: f64,
    pub top_bid_depth: f64,
    pub top_ask_depth: f64,
    pub weighted_mid: f64,
    pub impact_bid: f64,
    pub impact_ask: f64,
    pub volatility: Option<f64>,
    pub intensity: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

pub struct MdpConfig {
    pub top_n_depth: usize,
    pub microprice_levels: usize,
    pub tick_size: f64,
}

impl Default for MdpConfig {
    fn default() -> Self {
        Self {
            top_n_depth: 5,
            microprice_levels: 5,
            tick_size: 0.01,
        }
    }
}

/// Validates books in sequence order and derives `MarketState`. Owns the
/// latest validated book exclusively; no other component mutates it.
pub struct MarketDataProcessor {
    config: MdpConfig,
    expected_sequence: Option<u64>,
    last_gap_logged_at: Option<Instant>,
    latest_book: Option<L2Book>,
    latest_state: Option<MarketState>,
}

impl MarketDataProcessor {
    pub fn new(config: MdpConfig) -> Self {
        Self {
            config,
            expected_sequence: None,
            last_gap_logged_at: None,
            latest_book: None,
            latest_state: None,
        }
    }

    pub fn latest_book(&self) -> Option<&L2Book> {
        self.latest_book.as_ref()
    }

    /// The `MarketState` derived from the most recently validated book.
    /// Safe to poll repeatedly (e.g. once per tick) without re-running
    /// sequence tracking, which only a freshly arrived raw book should do.
    pub fn latest_state(&self) -> Option<MarketState> {
        self.latest_state
    }

    /// Processes one raw book: sequence check, validation, metric derivation.
    /// Returns the validated (sorted) book and its `MarketState`, or a
    /// `MarketDataError` if the book is crossed/empty (dropped, not retried).
    pub fn process_book(&mut self, mut book: L2Book) -> Result<(L2Book, MarketState), MarketDataError> {
        self.check_sequence(book.sequence);
        book.sort();
        self.validate(&book)?;

        let state = self.derive_state(&book);
        self.latest_book = Some(book.clone());
        self.latest_state = Some(state);
        Ok((book, state))
    }

    fn check_sequence(&mut self, sequence: u64) {
        if let Some(expected) = self.expected_sequence {
            if sequence != expected {
                let should_log = match self.last_gap_logged_at {
                    None => true,
                    Some(t) => t.elapsed().as_secs() >= 1,
                };
                if should_log {
                    log::warn!(
                        "market data sequence gap: expected {}, got {}",
                        expected,
                        sequence
                    );
                    self.last_gap_logged_at = Some(Instant::now());
                }
            }
        }
        self.expected_sequence = Some(sequence + 1);
    }

    fn validate(&self, book: &L2Book) -> Result<(), MarketDataError> {
        let top_bid = book.top_bid();
        let top_ask = book.top_ask();
        match (top_bid, top_ask) {
            (Some(bid), Some(ask)) => {
                if bid.price >= ask.price {
                    return Err(MarketDataError::CrossedBook {
                        top_bid: bid.price,
                        top_ask: ask.price,
                    });
                }
                Ok(())
            }
            _ => Err(MarketDataError::CrossedBook {
                top_bid: top_bid.map(|l| l.price).unwrap_or(0.0),
                top_ask: top_ask.map(|l| l.price).unwrap_or(0.0),
            }),
        }
    }

    fn derive_state(&self, book: &L2Book) -> MarketState {
        let top_bid = book.top_bid().expect("validated");
        let top_ask = book.top_ask().expect("validated");

        let mid = (top_bid.price + top_ask.price) / 2.0;
        let spread = top_ask.price - top_bid.price;
        let spread_bps = if mid > 0.0 { spread / mid * 10_000.0 } else { 0.0 };

        let n = self.config.top_n_depth.max(1);
        let top_bid_depth: f64 = book.bids.iter().take(n).map(|l| l.size).sum();
        let top_ask_depth: f64 = book.asks.iter().take(n).map(|l| l.size).sum();

        let obi = if top_bid_depth + top_ask_depth > 0.0 {
            (top_bid_depth - top_ask_depth) / (top_bid_depth + top_ask_depth)
        } else {
            0.0
        };

        let microprice = compute_microprice(book, self.config.microprice_levels, mid);

        let weighted_mid = if top_bid.size + top_ask.size > 0.0 {
            (top_bid.price * top_ask.size + top_ask.price * top_bid.size)
                / (top_bid.size + top_ask.size)
        } else {
            mid
        };

        MarketState {
            mid,
            microprice,
            spread,
            spread_bps,
            obi,
            top_bid_depth,
            top_ask_depth,
            weighted_mid,
            impact_bid: compute_impact(&book.bids, top_bid_depth * top_bid.price),
            impact_ask: compute_impact(&book.asks, top_ask_depth * top_ask.price),
            volatility: None,
            intensity: None,
            timestamp: book.timestamp,
        }
    }
}

/// Size-weighted midpoint across the top `levels` on each side. Pressure
/// follows the larger side: `avg_bid_price` is weighted by ask volume and
/// vice versa. Falls back to `mid` if either side has zero volume.
fn compute_microprice(book: &L2Book, levels: usize, mid: f64) -> f64 {
    let n = levels.max(1);
    let vb: f64 = book.bids.iter().take(n).map(|l| l.size).sum();
    let va: f64 = book.asks.iter().take(n).map(|l| l.size).sum();
    if vb <= 0.0 || va <= 0.0 {
        return mid;
    }
    let avg_bid = book.bids.iter().take(n).map(|l| l.price * l.size).sum::<f64>() / vb;
    let avg_ask = book.asks.iter().take(n).map(|l| l.price * l.size).sum::<f64>() / va;
    (avg_bid * va + avg_ask * vb) / (vb + va)
}

/// Notional-weighted average fill price walking the book for notional `q`.
/// Returns 0 if the book side cannot absorb the full notional.
pub fn compute_impact(levels: &[PriceLevel], notional: f64) -> f64 {
    if notional <= 0.0 {
        return 0.0;
    }
    let mut remaining = notional;
    let mut filled_notional = 0.0;
    let mut filled_units = 0.0;
    for level in levels {
        let level_notional = level.price * level.size;
        if remaining <= level_notional {
            let units = remaining / level.price;
            filled_units += units;
            filled_notional += remaining;
            remaining = 0.0;
            break;
        } else {
            filled_units += level.size;
            filled_notional += level_notional;
            remaining -= level_notional;
        }
    }
    if remaining > 0.0 || filled_units <= 0.0 {
        0.0
    } else {
        filled_notional / filled_units
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn book(bids: Vec<(f64, f64)>, asks: Vec<(f64, f64)>, sequence: u64) -> L2Book {
        L2Book {
            bids: bids.into_iter().map(|(price, size)| PriceLevel { price, size }).collect(),
            asks: asks.into_iter().map(|(price, size)| PriceLevel { price, size }).collect(),
            sequence,
            timestamp: ts(),
        }
    }

    #[test]
    fn s1_symmetric_quote_book_metrics() {
        let mut mdp = MarketDataProcessor::new(MdpConfig::default());
        let b = book(vec![(100.00, 10.0)], vec![(100.10, 10.0)], 1);
        let (_, state) = mdp.process_book(b).unwrap();
        assert!((state.mid - 100.05).abs() < 1e-9);
        assert!((state.microprice - 100.05).abs() < 1e-9);
        assert!((state.obi - 0.0).abs() < 1e-9);
    }

    #[test]
    fn s3_crossed_book_is_rejected() {
        let mut mdp = MarketDataProcessor::new(MdpConfig::default());
        let b = book(vec![(100.20, 5.0)], vec![(100.10, 5.0)], 1);
        let result = mdp.process_book(b);
        assert!(matches!(result, Err(MarketDataError::CrossedBook { .. })));
    }

    #[test]
    fn empty_side_is_rejected() {
        let mut mdp = MarketDataProcessor::new(MdpConfig::default());
        let b = book(vec![], vec![(100.10, 5.0)], 1);
        assert!(mdp.process_book(b).is_err());
    }

    #[test]
    fn idempotent_processing_same_book_same_state() {
        let mut mdp = MarketDataProcessor::new(MdpConfig::default());
        let b1 = book(vec![(100.00, 10.0), (99.90, 5.0)], vec![(100.10, 10.0), (100.20, 5.0)], 1);
        let b2 = b1.clone();
        let (_, s1) = mdp.process_book(b1).unwrap();

        // Re-process the same raw snapshot through a fresh processor instance
        // to isolate sequence-tracking state from the metric derivation being tested.
        let mut mdp2 = MarketDataProcessor::new(MdpConfig::default());
        let (_, s2) = mdp2.process_book(b2).unwrap();

        assert_eq!(s1.mid, s2.mid);
        assert_eq!(s1.microprice, s2.microprice);
        assert_eq!(s1.obi, s2.obi);
    }

    #[test]
    fn impact_walks_multiple_levels() {
        let levels = vec![
            PriceLevel { price: 100.0, size: 1.0 },
            PriceLevel { price: 100.1, size: 1.0 },
        ];
        // Notional 150 needs 1.0 unit at 100 (100 notional) then 0.5 at 100.1 (50 notional).
        let avg = compute_impact(&levels, 150.0);
        assert!(avg > 100.0 && avg < 100.1);
    }

    #[test]
    fn impact_zero_when_book_cannot_absorb() {
        let levels = vec![PriceLevel { price: 100.0, size: 1.0 }];
        assert_eq!(compute_impact(&levels, 1_000.0), 0.0);
    }

    proptest::proptest! {
        #[test]
        fn invariant_validated_book_never_crossed(
            top_bid in 1.0f64..1_000.0,
            spread in 0.01f64..10.0,
            bid_size in 0.01f64..100.0,
            ask_size in 0.01f64..100.0,
        ) {
            let mut mdp = MarketDataProcessor::new(MdpConfig::default());
            let b = book(vec![(top_bid, bid_size)], vec![(top_bid + spread, ask_size)], 1);
            let (validated, _) = mdp.process_book(b).unwrap();
            let bid = validated.top_bid().unwrap();
            let ask = validated.top_ask().unwrap();
            prop_assert!(bid.price < ask.price);
        }

        #[test]
        fn invariant_idempotent_state(
            top_bid in 1.0f64..1_000.0,
            spread in 0.01f64..10.0,
        ) {
            let b1 = book(vec![(top_bid, 1.0)], vec![(top_bid + spread, 1.0)], 1);
            let b2 = b1.clone();
            let mut m1 = MarketDataProcessor::new(MdpConfig::default());
            let mut m2 = MarketDataProcessor::new(MdpConfig::default());
            let (_, s1) = m1.process_book(b1).unwrap();
            let (_, s2) = m2.process_book(b2).unwrap();
            prop_assert_eq!(s1.mid, s2.mid);
            prop_assert_eq!(s1.obi, s2.obi);
        }
    }
}
