//! Typed failure taxonomy for the engine core.
//!
//! The core never prints or formats log lines as part of its contract; it
//! only returns these types. Callers decide how to log/report them.

use thiserror::Error;

/// Invalid configuration or invalid order/book parameters. Local to the
/// caller; never triggers an engine state change.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("non-finite price: {0}")]
    NonFinitePrice(f64),
    #[error("non-finite size: {0}")]
    NonFiniteSize(f64),
    #[error("negative amount: {0}")]
    NegativeAmount(f64),
    #[error("book side empty: {0}")]
    EmptyBookSide(&'static str),
    #[error("crossed book: top_bid {top_bid} >= top_ask {top_ask}")]
    CrossedBook { top_bid: f64, top_ask: f64 },
    #[error("parameter {name} out of range: {value} not in {low}..={high}")]
    ParamOutOfRange {
        name: &'static str,
        value: f64,
        low: f64,
        high: f64,
    },
}

/// Rejected order, network failure, rate-limit, or timeout from the venue.
/// Counted toward `consecutiveFailures`; retried with backoff up to a cap.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VenueError {
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited")]
    RateLimited,
    #[error("request timed out")]
    Timeout,
    #[error("insufficient margin")]
    InsufficientMargin,
    #[error("unknown order: {0}")]
    UnknownOrder(String),
}

/// Inventory/drift/drawdown/vol-spike limit breaches. Never retried locally;
/// always forces a `flatten` or `stop` signal upward.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RiskBreach {
    #[error("inventory limit breached: nav_pct={nav_pct} max={max_pct}")]
    InventoryLimit { nav_pct: f64, max_pct: f64 },
    #[error("drift limit breached: drift_bps={drift_bps} cut={cut_bps}")]
    DriftLimit { drift_bps: f64, cut_bps: f64 },
    #[error("session drawdown limit breached: {session_dd_pct}% > {limit_pct}%")]
    SessionDrawdown { session_dd_pct: f64, limit_pct: f64 },
    #[error("daily drawdown limit breached: {daily_dd_pct}% > {limit_pct}%")]
    DailyDrawdown { daily_dd_pct: f64, limit_pct: f64 },
    #[error("{count} consecutive failures >= {max}")]
    ConsecutiveFailures { count: u32, max: u32 },
    #[error("emergency stop engaged")]
    EmergencyStop,
    #[error("news pause engaged for {duration_ms}ms")]
    NewsStop { duration_ms: u64 },
}

/// Market-data integrity failures. Logged at most once per second; the
/// affected update is dropped with no trading state change.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarketDataError {
    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },
    #[error("crossed book: top_bid {top_bid} >= top_ask {top_ask}")]
    CrossedBook { top_bid: f64, top_ask: f64 },
}

/// Top-level engine error. Fatal variants should terminate the bot after a
/// flatten attempt.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),
    #[error("venue: {0}")]
    Venue(#[from] VenueError),
    #[error("risk breach: {0}")]
    Risk(#[from] RiskBreach),
    #[error("market data: {0}")]
    MarketData(#[from] MarketDataError),
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
