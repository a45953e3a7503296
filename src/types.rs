use serde::{Deserialize, Serialize};

/// One OHLCV candle. Immutable once produced; sequences are ordered by
/// `open_time` (oldest first) with no gaps within a timeframe.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64, // Unix seconds
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn total_range(&self) -> f64 {
        self.high - self.low
    }

    pub fn upper_wick(&self) -> f64 {
        self.high - self.open.max(self.close)
    }

    pub fn lower_wick(&self) -> f64 {
        self.open.min(self.close) - self.low
    }
}

/// Position direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for long, -1.0 for short. Multiplying price deltas by this folds
    /// the long/short cases into one arithmetic path.
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "Long"),
            Side::Short => write!(f, "Short"),
        }
    }
}

/// ADX-based market regime label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    Trending,
    Ranging,
    Indeterminate,
}

/// Why a position (fully) left the book.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TimeLimit,
    Reversal,
    /// Final profit tier filled, closing the remainder.
    ProfitTarget,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop-loss",
            ExitReason::TimeLimit => "time-exit",
            ExitReason::Reversal => "reversal",
            ExitReason::ProfitTarget => "profit-target",
        };
        write!(f, "{}", s)
    }
}

/// Immutable record of a fully closed position. Created only when the
/// remaining quantity reaches zero; consumed by the analytics recorder and
/// the append-only trade log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Trade {
    pub pair: String,
    pub side: Side,
    pub entry_price: f64,
    /// Volume-weighted average across all partial and final exits.
    pub avg_exit_price: f64,
    pub quantity: f64,
    pub entry_time: i64,
    pub exit_time: i64,
    pub realized_pnl: f64,
    pub pnl_pct: f64,
    pub exit_reason: ExitReason,
    pub tiers_filled: Vec<u8>,
}

impl Trade {
    pub fn duration_secs(&self) -> i64 {
        self.exit_time - self.entry_time
    }
}

/// One sample of the append-only equity series.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: i64,
    pub equity: f64,
}

/// Top-of-book plus aggregate depth, as consumed by signal fusion.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OrderBookView {
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_depth: f64,
    pub ask_depth: f64,
}

/// Ticker fields used by fusion: last price and the 24h extremes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TickerView {
    pub last_price: f64,
    pub high_24h: f64,
    pub low_24h: f64,
}
