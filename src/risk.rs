//! Admission control: circuit breaker, concurrency cap, and volatility-based
//! sizing. All `RiskState` mutation goes through one mutex, and slot
//! reservation is a check-and-increment under that lock, so concurrent entry
//! attempts can never overshoot the concurrency limit.

use std::sync::Mutex;

use crate::config::Config;
use crate::types::Side;

/// Process-wide risk state, single-writer via `RiskGate`.
#[derive(Clone, Debug)]
pub struct RiskState {
    pub initial_equity: f64,
    pub peak_equity: f64,
    pub current_equity: f64,
    /// 1 − equity/peak, recomputed after every equity-affecting event.
    pub drawdown_pct: f64,
    pub max_drawdown_seen: f64,
    /// Sticky: set exactly when drawdown reaches the limit, cleared only by
    /// `reset_circuit_breaker`.
    pub circuit_breaker_tripped: bool,
    pub open_positions: usize,
}

/// Outcome of an entry request.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Admission {
    /// Slot reserved; caller must `release_slot` if the entry order fails.
    Granted { quantity: f64, stop_price: f64 },
    Denied(DenialReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenialReason {
    CircuitBreaker,
    MaxConcurrent,
    ZeroSize,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DenialReason::CircuitBreaker => "circuit-breaker",
            DenialReason::MaxConcurrent => "max-concurrent-trades",
            DenialReason::ZeroSize => "size-rounds-to-zero",
        };
        write!(f, "{}", s)
    }
}

pub struct RiskGate {
    state: Mutex<RiskState>,
    risk_per_trade_pct: f64,
    atr_stop_multiplier: f64,
    max_drawdown_pct: f64,
    max_concurrent_trades: usize,
    equity_buffer: f64,
    quantity_step: f64,
    min_order_quantity: f64,
}

impl RiskGate {
    pub fn new(cfg: &Config, initial_equity: f64) -> Self {
        RiskGate {
            state: Mutex::new(RiskState {
                initial_equity,
                peak_equity: initial_equity,
                current_equity: initial_equity,
                drawdown_pct: 0.0,
                max_drawdown_seen: 0.0,
                circuit_breaker_tripped: false,
                open_positions: 0,
            }),
            risk_per_trade_pct: cfg.risk_per_trade_pct,
            atr_stop_multiplier: cfg.atr_stop_multiplier,
            max_drawdown_pct: cfg.max_drawdown_pct,
            max_concurrent_trades: cfg.max_concurrent_trades,
            equity_buffer: cfg.equity_buffer,
            quantity_step: cfg.quantity_step,
            min_order_quantity: cfg.min_order_quantity,
        }
    }

    /// Evaluate a new entry. On grant, the position slot is reserved
    /// atomically with the checks; a failed entry order must call
    /// `release_slot`, a successful close calls it via `close_position`.
    pub fn request_entry(
        &self,
        side: Side,
        price: f64,
        atr: f64,
        volatility_factor: f64,
    ) -> Admission {
        let mut state = self.state.lock().unwrap();

        if state.circuit_breaker_tripped {
            return Admission::Denied(DenialReason::CircuitBreaker);
        }
        if state.open_positions >= self.max_concurrent_trades {
            return Admission::Denied(DenialReason::MaxConcurrent);
        }

        let quantity = self.position_size(state.current_equity, price, atr, volatility_factor);
        if quantity < self.min_order_quantity {
            return Admission::Denied(DenialReason::ZeroSize);
        }

        let stop_distance = atr * self.atr_stop_multiplier;
        let stop_price = price - side.sign() * stop_distance;

        state.open_positions += 1;
        Admission::Granted {
            quantity,
            stop_price,
        }
    }

    /// `risk budget / stop distance`, scaled by the volatility factor and
    /// clamped so a single entry never consumes more than the buffered share
    /// of equity. Rounded down to the venue quantity step.
    fn position_size(&self, equity: f64, price: f64, atr: f64, volatility_factor: f64) -> f64 {
        if atr <= 0.0 || price <= 0.0 || equity <= 0.0 {
            return 0.0;
        }
        let risk_amount = equity * self.risk_per_trade_pct;
        let stop_distance = atr * self.atr_stop_multiplier;
        let raw = risk_amount / stop_distance * volatility_factor;
        let max_affordable = equity / price * self.equity_buffer;
        let capped = raw.min(max_affordable);
        (capped / self.quantity_step).floor() * self.quantity_step
    }

    /// Release a reserved slot (failed entry, or final close).
    pub fn release_slot(&self) {
        let mut state = self.state.lock().unwrap();
        state.open_positions = state.open_positions.saturating_sub(1);
    }

    /// Fold a new equity reading into the state: peak, drawdown, breaker.
    /// Returns the recomputed drawdown fraction.
    pub fn report_equity(&self, new_equity: f64) -> f64 {
        let mut state = self.state.lock().unwrap();
        state.current_equity = new_equity;
        if new_equity > state.peak_equity {
            state.peak_equity = new_equity;
        }
        let drawdown = if state.peak_equity > 0.0 {
            1.0 - new_equity / state.peak_equity
        } else {
            0.0
        };
        state.drawdown_pct = drawdown;
        if drawdown > state.max_drawdown_seen {
            state.max_drawdown_seen = drawdown;
        }
        if drawdown >= self.max_drawdown_pct && !state.circuit_breaker_tripped {
            state.circuit_breaker_tripped = true;
            log::warn!(
                "Circuit breaker TRIPPED: drawdown {:.2}% >= limit {:.2}%. New entries halted.",
                drawdown * 100.0,
                self.max_drawdown_pct * 100.0
            );
        }
        drawdown
    }

    /// Apply a realized PnL delta from a closed or partially closed position.
    pub fn apply_pnl(&self, pnl: f64) -> f64 {
        let equity = {
            let state = self.state.lock().unwrap();
            state.current_equity + pnl
        };
        self.report_equity(equity)
    }

    /// The only way a tripped breaker clears. Explicit operator action;
    /// resets the peak to current equity so the halt does not re-trip on the
    /// next reading.
    pub fn reset_circuit_breaker(&self) {
        let mut state = self.state.lock().unwrap();
        state.circuit_breaker_tripped = false;
        state.peak_equity = state.current_equity;
        state.drawdown_pct = 0.0;
        log::warn!("Circuit breaker RESET by operator. Trading can resume.");
    }

    pub fn snapshot(&self) -> RiskState {
        self.state.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn gate(initial_equity: f64) -> RiskGate {
        RiskGate::new(&Config::default(), initial_equity)
    }

    #[test]
    fn sizing_follows_risk_budget_over_stop_distance() {
        let g = gate(10_000.0);
        // risk = 200, stop distance = 2 * 50 = 100 → 2.0 units. The
        // affordability cap (0.95 * 10000 / 200 = 47.5) does not bind here.
        match g.request_entry(Side::Long, 200.0, 50.0, 1.0) {
            Admission::Granted {
                quantity,
                stop_price,
            } => {
                assert!((quantity - 2.0).abs() < 1e-9, "quantity {quantity}");
                assert!((stop_price - 100.0).abs() < 1e-9);
            }
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[test]
    fn sizing_clamps_to_buffered_equity() {
        let g = gate(10_000.0);
        // Tiny ATR would size huge; affordability cap kicks in: 0.95 * 10000/100 = 95
        match g.request_entry(Side::Long, 100.0, 0.01, 1.0) {
            Admission::Granted { quantity, .. } => {
                assert!(quantity <= 95.0 + 1e-9, "quantity {quantity}");
            }
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[test]
    fn zero_atr_denied_as_zero_size() {
        let g = gate(10_000.0);
        assert_eq!(
            g.request_entry(Side::Long, 50_000.0, 0.0, 1.0),
            Admission::Denied(DenialReason::ZeroSize)
        );
    }

    #[test]
    fn breaker_trips_at_exact_threshold_and_is_sticky() {
        let g = gate(10_000.0);
        // Exactly 5% drawdown trips (>=, not >).
        g.report_equity(9_500.0);
        assert!(g.snapshot().circuit_breaker_tripped);

        // Recovery does not clear it.
        g.report_equity(10_000.0);
        assert!(g.snapshot().circuit_breaker_tripped);
        assert_eq!(
            g.request_entry(Side::Long, 50_000.0, 100.0, 1.0),
            Admission::Denied(DenialReason::CircuitBreaker)
        );

        // Only the explicit reset clears it.
        g.reset_circuit_breaker();
        assert!(!g.snapshot().circuit_breaker_tripped);
        assert!(matches!(
            g.request_entry(Side::Long, 50_000.0, 100.0, 1.0),
            Admission::Granted { .. }
        ));
    }

    #[test]
    fn breaker_does_not_trip_below_threshold() {
        let g = gate(10_000.0);
        g.report_equity(9_501.0); // 4.99%
        assert!(!g.snapshot().circuit_breaker_tripped);
    }

    #[test]
    fn drawdown_recomputed_from_running_peak() {
        let g = gate(10_000.0);
        g.report_equity(12_000.0);
        let dd = g.report_equity(11_400.0);
        assert!((dd - 0.05).abs() < 1e-9, "drawdown {dd}");
        assert!((g.snapshot().peak_equity - 12_000.0).abs() < 1e-9);
    }

    #[test]
    fn concurrency_cap_is_exact() {
        let g = gate(10_000.0);
        assert!(matches!(
            g.request_entry(Side::Long, 50_000.0, 100.0, 1.0),
            Admission::Granted { .. }
        ));
        assert!(matches!(
            g.request_entry(Side::Long, 50_000.0, 100.0, 1.0),
            Admission::Granted { .. }
        ));
        assert_eq!(
            g.request_entry(Side::Long, 50_000.0, 100.0, 1.0),
            Admission::Denied(DenialReason::MaxConcurrent)
        );
        g.release_slot();
        assert!(matches!(
            g.request_entry(Side::Long, 50_000.0, 100.0, 1.0),
            Admission::Granted { .. }
        ));
    }

    #[test]
    fn concurrent_entry_attempts_never_overshoot() {
        let g = Arc::new(gate(1_000_000.0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let g = Arc::clone(&g);
            handles.push(std::thread::spawn(move || {
                matches!(
                    g.request_entry(Side::Long, 50_000.0, 100.0, 1.0),
                    Admission::Granted { .. }
                )
            }));
        }
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();
        assert_eq!(granted, Config::default().max_concurrent_trades);
        assert_eq!(g.snapshot().open_positions, granted);
    }

    #[test]
    fn short_entry_stop_sits_above_price() {
        let g = gate(10_000.0);
        match g.request_entry(Side::Short, 50_000.0, 100.0, 1.0) {
            Admission::Granted { stop_price, .. } => {
                assert!((stop_price - 50_200.0).abs() < 1e-9);
            }
            other => panic!("expected grant, got {other:?}"),
        }
    }
}
