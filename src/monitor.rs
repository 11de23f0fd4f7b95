//! Rolling trade-outcome performance feedback (§4.3.1), advisory to the
//! Risk Manager's size multiplier. Kept close to the teacher's
//! `PerformanceMonitor`, which already implements this window/profit-factor
//! shape unchanged.

use std::collections::VecDeque;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub window_size: usize,        // e.g. 100 trades
    pub min_trades_for_action: usize, // e.g. 20
    pub pf_threshold_warning: f64, // e.g. 1.0 -> reduce size
    pub pf_threshold_critical: f64, // e.g. 0.8 -> stop trading
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            min_trades_for_action: 20,
            pf_threshold_warning: 1.0,
            pf_threshold_critical: 0.8,
        }
    }
}

pub struct PerformanceMonitor {
    config: MonitorConfig,
    history: VecDeque<TradeResult>,
}

#[derive(Debug, Clone)]
struct TradeResult {
    pub pnl: f64,
    pub is_win: bool,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            history: VecDeque::new(),
        }
    }

    pub fn record_trade(&mut self, pnl: f64) {
        if self.history.len() >= self.config.window_size {
            self.history.pop_front();
        }
        self.history.push_back(TradeResult {
            pnl,
            is_win: pnl > 0.0,
        });
    }

    pub fn get_metrics(&self) -> PerformanceMetrics {
        if self.history.is_empty() {
            return PerformanceMetrics::default();
        }

        let total_trades = self.history.len();
        let wins = self.history.iter().filter(|t| t.is_win).count();
        let win_rate = wins as f64 / total_trades as f64 * 100.0;
        
        let gross_profit: f64 = self.history.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).sum();
        let gross_loss: f64 = self.history.iter().filter(|t| t.pnl < 0.0).map(|t| t.pnl.abs()).sum();
        
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            100.0 
        } else {
            0.0
        };

        PerformanceMetrics {
            win_rate,
            profit_factor,
            trade_count: total_trades,
            suggested_action: self.evaluate_action(profit_factor, total_trades),
        }
    }

    fn evaluate_action(&self, pf: f64, count: usize) -> FeedbackAction {
        if count < self.config.min_trades_for_action {
            return FeedbackAction::None;
        }

        if pf < self.config.pf_threshold_critical {
            FeedbackAction::HaltTrading
        } else if pf < self.config.pf_threshold_warning {
            FeedbackAction::ReduceSize(0.5) // Cut size in half
        } else {
            FeedbackAction::None
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.history.is_empty() {
            0.0
        } else {
            let total_trades = self.history.len();
            let wins = self.history.iter().filter(|t| t.is_win).count();
            wins as f64 / total_trades as f64 * 100.0
        }
    }
}

#[derive(Debug, Default)]
pub struct PerformanceMetrics {
    pub win_rate: f64,
    pub profit_factor: f64,
    pub trade_count: usize,
    pub suggested_action: FeedbackAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackAction {
    None,
    ReduceSize(f64), // Multiplier, e.g. 0.5
    HaltTrading,
}

impl Default for FeedbackAction {
    fn default() -> Self {
        Self::None
    }
}

impl FeedbackAction {
    /// Advisory size multiplier this feedback action suggests. The Risk
    /// Manager takes the minimum of this and its own `size_multiplier`.
    pub fn size_multiplier(&self) -> f64 {
        match self {
            FeedbackAction::None => 1.0,
            FeedbackAction::ReduceSize(mult) => *mult,
            FeedbackAction::HaltTrading => 0.0,
        }
    }
}
