use crate::error::EngineError;

// ─── Venue ────────────────────────────────────────────────────────────────────
pub const KRAKEN_REST_URL: &str = "https://api.kraken.com";
// KRAKEN_API_KEY, KRAKEN_API_SECRET, TELEGRAM_TOKEN, TELEGRAM_CHAT_ID
// are read from environment variables at runtime.

// ─── Instrument & cadence ─────────────────────────────────────────────────────
pub const TRADING_PAIR: &str = "BTCUSDT";
pub const TICK_INTERVAL_SECS: u64 = 300;

/// Primary (entry) timeframe in minutes and the higher trend timeframe.
pub const TF_PRIMARY_MIN: u32 = 5;
pub const TF_TREND_MIN: u32 = 15;

// ─── Defaults (see `Config` for the validated runtime form) ───────────────────
pub const SMA_PERIOD: usize = 20;
pub const ATR_PERIOD: usize = 14;
pub const RSI_PERIOD: usize = 14;
pub const ADX_PERIOD: usize = 14;
pub const ADX_TREND_THRESHOLD: f64 = 25.0;

pub const MAX_RISK_PER_TRADE_PCT: f64 = 0.02;
pub const ATR_STOP_MULTIPLIER: f64 = 2.0;
pub const MAX_DRAWDOWN_PCT: f64 = 0.05;
pub const MAX_CONCURRENT_TRADES: usize = 2;

/// How `highest_favorable_price` behaves across partial exits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MfeTracking {
    /// Track from original entry, never reset.
    Continuous,
    /// Restart tracking from the current price after each partial exit.
    ResetOnPartialExit,
}

/// What to do when a fill's realized slippage exceeds tolerance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlippagePolicy {
    /// Reject the fill and retry at the revised (observed) price.
    RetryAdjusted,
    /// Reject the fill and abandon the order.
    Abort,
}

/// Runtime configuration. `validate()` runs once at startup; a bad config is
/// fatal then, never discovered mid-tick.
#[derive(Clone, Debug)]
pub struct Config {
    pub pair: String,
    pub tick_interval_secs: u64,

    // Indicators
    pub sma_period: usize,
    pub atr_period: usize,
    pub rsi_period: usize,
    pub adx_period: usize,
    pub adx_trend_threshold: f64,
    pub sr_window: usize,
    pub sr_proximity_pct: f64,
    pub volume_spike_mult: f64,
    /// Minimum primary-timeframe candles required before any decision.
    pub min_candles: usize,
    pub min_trend_candles: usize,

    // Fusion
    pub entry_threshold: f64,
    /// Opposing-score magnitude that forces a full exit. Independent from
    /// `entry_threshold`; may fire before any profit tier is reached.
    pub reversal_threshold: f64,

    // Risk
    pub risk_per_trade_pct: f64,
    pub atr_stop_multiplier: f64,
    pub max_drawdown_pct: f64,
    pub max_concurrent_trades: usize,
    /// Fraction of equity usable for a single entry (keeps a cash buffer).
    pub equity_buffer: f64,
    pub quantity_step: f64,
    pub min_order_quantity: f64,

    // Position lifecycle
    pub tier_thresholds: [f64; 3],
    pub tier_fractions: [f64; 3],
    pub breakeven_buffer_pct: f64,
    pub trailing_atr_multiplier: f64,
    pub max_hold_ticks: u64,
    pub mfe_tracking: MfeTracking,

    // Execution
    pub max_order_retries: u32,
    pub order_timeout_secs: u64,
    pub slippage_tolerance_pct: f64,
    pub slippage_policy: SlippagePolicy,
    pub retry_backoff_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pair: TRADING_PAIR.to_string(),
            tick_interval_secs: TICK_INTERVAL_SECS,

            sma_period: SMA_PERIOD,
            atr_period: ATR_PERIOD,
            rsi_period: RSI_PERIOD,
            adx_period: ADX_PERIOD,
            adx_trend_threshold: ADX_TREND_THRESHOLD,
            sr_window: 50,
            sr_proximity_pct: 0.005,
            volume_spike_mult: 2.0,
            min_candles: 40,
            min_trend_candles: 5,

            entry_threshold: 2.0,
            reversal_threshold: 2.0,

            risk_per_trade_pct: MAX_RISK_PER_TRADE_PCT,
            atr_stop_multiplier: ATR_STOP_MULTIPLIER,
            max_drawdown_pct: MAX_DRAWDOWN_PCT,
            max_concurrent_trades: MAX_CONCURRENT_TRADES,
            equity_buffer: 0.95,
            quantity_step: 0.0001,
            min_order_quantity: 0.0001,

            tier_thresholds: [0.02, 0.04, 0.06],
            tier_fractions: [0.5, 0.3, 0.2],
            breakeven_buffer_pct: 0.001,
            trailing_atr_multiplier: 1.5,
            max_hold_ticks: 96,
            mfe_tracking: MfeTracking::Continuous,

            max_order_retries: 3,
            order_timeout_secs: 30,
            slippage_tolerance_pct: 0.001,
            slippage_policy: SlippagePolicy::RetryAdjusted,
            retry_backoff_secs: 1,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), EngineError> {
        let fail = |msg: String| Err(EngineError::InvalidConfiguration(msg));

        if self.pair.is_empty() {
            return fail("trading pair is empty".into());
        }
        if self.tick_interval_secs == 0 {
            return fail("tick_interval_secs must be positive".into());
        }
        for (name, period) in [
            ("sma_period", self.sma_period),
            ("atr_period", self.atr_period),
            ("rsi_period", self.rsi_period),
            ("adx_period", self.adx_period),
        ] {
            if period < 2 {
                return fail(format!("{} must be >= 2, got {}", name, period));
            }
        }
        if self.min_candles <= self.sma_period.max(self.atr_period) {
            return fail(format!(
                "min_candles ({}) must exceed the longest indicator period",
                self.min_candles
            ));
        }
        if self.entry_threshold <= 0.0 || self.reversal_threshold <= 0.0 {
            return fail("entry/reversal thresholds must be positive".into());
        }
        if !(0.0..1.0).contains(&self.risk_per_trade_pct) || self.risk_per_trade_pct == 0.0 {
            return fail(format!(
                "risk_per_trade_pct must be in (0, 1), got {}",
                self.risk_per_trade_pct
            ));
        }
        if !(0.0..1.0).contains(&self.max_drawdown_pct) || self.max_drawdown_pct == 0.0 {
            return fail(format!(
                "max_drawdown_pct must be in (0, 1), got {}",
                self.max_drawdown_pct
            ));
        }
        if self.max_concurrent_trades == 0 {
            return fail("max_concurrent_trades must be at least 1".into());
        }
        if self.atr_stop_multiplier <= 0.0 || self.trailing_atr_multiplier <= 0.0 {
            return fail("ATR multipliers must be positive".into());
        }

        let fraction_sum: f64 = self.tier_fractions.iter().sum();
        if (fraction_sum - 1.0).abs() > 1e-9 {
            return fail(format!(
                "tier fractions must sum to 1.0, got {}",
                fraction_sum
            ));
        }
        if self.tier_fractions.iter().any(|&f| f <= 0.0) {
            return fail("tier fractions must all be positive".into());
        }
        let mut prev = 0.0;
        for &t in &self.tier_thresholds {
            if t <= prev {
                return fail("tier thresholds must be strictly increasing and positive".into());
            }
            prev = t;
        }
        if self.max_hold_ticks == 0 {
            return fail("max_hold_ticks must be positive".into());
        }

        if self.max_order_retries == 0 {
            return fail("max_order_retries must be at least 1".into());
        }
        if self.order_timeout_secs == 0 {
            return fail("order_timeout_secs must be positive".into());
        }
        if self.slippage_tolerance_pct < 0.0 {
            return fail("slippage_tolerance_pct must be non-negative".into());
        }
        if self.quantity_step <= 0.0 || self.min_order_quantity <= 0.0 {
            return fail("quantity_step and min_order_quantity must be positive".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn tier_fractions_must_sum_to_one() {
        let mut cfg = Config::default();
        cfg.tier_fractions = [0.5, 0.3, 0.3];
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfiguration(_)));
    }

    #[test]
    fn tier_thresholds_must_increase() {
        let mut cfg = Config::default();
        cfg.tier_thresholds = [0.04, 0.02, 0.06];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_tick_interval_rejected() {
        let mut cfg = Config::default();
        cfg.tick_interval_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_retry_budget_rejected() {
        let mut cfg = Config::default();
        cfg.max_order_retries = 0;
        assert!(cfg.validate().is_err());
    }
}
