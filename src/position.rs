//! Position lifecycle: a per-position state machine evaluated once per tick.
//!
//! Planning and mutation are split: `plan_tick` is pure and returns the single
//! transition the tick calls for; the engine only applies it after the
//! corresponding order actually fills. A failed exit order leaves the
//! position untouched; whatever quantity the venue did fill is folded into
//! the book first, and only the residual is re-planned next tick.

use crate::config::{Config, MfeTracking};
use crate::types::{ExitReason, Side, Trade};
use crate::venue::VenueFill;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PositionState {
    /// Entry order submitted, not yet filled.
    Opening,
    Active,
    PartiallyExited,
    /// Exit order in flight. At most one order in flight per position.
    Closing,
    Closed,
}

/// The one transition this tick calls for. Priority is fixed: stop, then
/// time, then reversal, then next profit tier, then trailing maintenance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PositionAction {
    Hold,
    /// Trailing maintenance: no order needed, applied directly.
    UpdateStop {
        new_stop: f64,
        favorable_extreme: f64,
    },
    PartialExit {
        tier: u8,
        quantity: f64,
    },
    FullExit {
        reason: ExitReason,
    },
}

#[derive(Clone, Debug)]
pub struct Position {
    pub pair: String,
    pub side: Side,
    pub entry_price: f64,
    pub entry_time: i64,
    pub original_quantity: f64,
    pub remaining_quantity: f64,
    /// Only ever tightens: break-even arming and trailing updates move it
    /// toward profit, never away.
    pub stop_price: f64,
    /// Grows monotonically; tiers fill in order, never refill.
    pub tiers_filled: Vec<u8>,
    pub break_even_armed: bool,
    pub trailing_armed: bool,
    /// Most favorable price seen since entry (lowest for shorts).
    pub favorable_extreme: f64,
    pub state: PositionState,
    pub age_ticks: u64,
    exit_fills: Vec<(f64, f64)>, // (quantity, price)
}

impl Position {
    /// A position whose entry order has been submitted but not yet filled.
    pub fn pending(pair: &str, side: Side, stop_price: f64) -> Self {
        Position {
            pair: pair.to_string(),
            side,
            entry_price: 0.0,
            entry_time: 0,
            original_quantity: 0.0,
            remaining_quantity: 0.0,
            stop_price,
            tiers_filled: Vec::new(),
            break_even_armed: false,
            trailing_armed: false,
            favorable_extreme: 0.0,
            state: PositionState::Opening,
            age_ticks: 0,
            exit_fills: Vec::new(),
        }
    }

    /// Record the entry fill; the position starts aging from here.
    pub fn activate(&mut self, fill: &VenueFill, entry_time: i64) {
        self.entry_price = fill.avg_fill_price;
        self.entry_time = entry_time;
        self.original_quantity = fill.filled_quantity;
        self.remaining_quantity = fill.filled_quantity;
        self.favorable_extreme = fill.avg_fill_price;
        self.state = PositionState::Active;
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            PositionState::Active | PositionState::PartiallyExited | PositionState::Closing
        )
    }

    pub fn advance_age(&mut self) {
        self.age_ticks += 1;
    }

    /// Signed profit fraction at `price` (positive = favorable).
    pub fn profit_pct(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) / self.entry_price
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) * self.remaining_quantity
    }

    /// Decide this tick's transition. First match wins; at most one
    /// transition per tick.
    pub fn plan_tick(
        &self,
        price: f64,
        composite_score: f64,
        atr: f64,
        cfg: &Config,
    ) -> PositionAction {
        let sign = self.side.sign();

        // 1. Hard stop.
        if sign * (price - self.stop_price) <= 0.0 {
            return PositionAction::FullExit {
                reason: ExitReason::StopLoss,
            };
        }

        // 2. Maximum hold time.
        if self.age_ticks >= cfg.max_hold_ticks {
            return PositionAction::FullExit {
                reason: ExitReason::TimeLimit,
            };
        }

        // 3. Signal reversal: a strong enough score against the position.
        if -sign * composite_score >= cfg.reversal_threshold {
            return PositionAction::FullExit {
                reason: ExitReason::Reversal,
            };
        }

        // 4. Next unfilled profit tier. Tiers fill strictly in order even if
        // price gaps over several thresholds at once.
        let profit = self.profit_pct(price);
        let last_tier = cfg.tier_thresholds.len() as u8;
        for (i, &threshold) in cfg.tier_thresholds.iter().enumerate() {
            let tier = (i + 1) as u8;
            if self.tiers_filled.contains(&tier) {
                continue;
            }
            if profit >= threshold {
                // Fractions apply to the ORIGINAL quantity; the last tier
                // takes whatever remains so the fractions sum exactly.
                let quantity = if tier == last_tier {
                    self.remaining_quantity
                } else {
                    cfg.tier_fractions[i] * self.original_quantity
                };
                return PositionAction::PartialExit { tier, quantity };
            }
            break;
        }

        // 5. Trailing maintenance.
        if self.trailing_armed {
            let extreme = if sign > 0.0 {
                self.favorable_extreme.max(price)
            } else {
                self.favorable_extreme.min(price)
            };
            let candidate = extreme - sign * cfg.trailing_atr_multiplier * atr;
            let tightened = sign * (candidate - self.stop_price) > 0.0;
            if tightened || extreme != self.favorable_extreme {
                let new_stop = if tightened { candidate } else { self.stop_price };
                return PositionAction::UpdateStop {
                    new_stop,
                    favorable_extreme: extreme,
                };
            }
        }

        PositionAction::Hold
    }

    pub fn apply_stop_update(&mut self, new_stop: f64, favorable_extreme: f64) {
        self.stop_price = new_stop;
        self.favorable_extreme = favorable_extreme;
    }

    /// Fold a filled tier exit into the position. Tier 1 arms break-even and
    /// trailing. Returns the closed `Trade` when the last unit leaves.
    pub fn apply_partial_fill(
        &mut self,
        tier: u8,
        fill: &VenueFill,
        exit_time: i64,
        cfg: &Config,
    ) -> Option<Trade> {
        self.exit_fills
            .push((fill.filled_quantity, fill.avg_fill_price));
        self.remaining_quantity = (self.remaining_quantity - fill.filled_quantity).max(0.0);
        self.tiers_filled.push(tier);

        if tier == 1 && !self.break_even_armed {
            self.break_even_armed = true;
            self.trailing_armed = true;
            let sign = self.side.sign();
            let breakeven = self.entry_price * (1.0 + sign * cfg.breakeven_buffer_pct);
            if sign * (breakeven - self.stop_price) > 0.0 {
                self.stop_price = breakeven;
            }
        }

        if cfg.mfe_tracking == MfeTracking::ResetOnPartialExit {
            self.favorable_extreme = fill.avg_fill_price;
        }

        if self.remaining_quantity <= 1e-12 {
            self.state = PositionState::Closed;
            Some(self.build_trade(ExitReason::ProfitTarget, exit_time))
        } else {
            self.state = PositionState::PartiallyExited;
            None
        }
    }

    pub fn begin_close(&mut self) {
        self.state = PositionState::Closing;
    }

    /// Exit order failed; restore the pre-close state so the transition is
    /// re-planned next tick.
    pub fn abort_close(&mut self) {
        self.state = if self.tiers_filled.is_empty() {
            PositionState::Active
        } else {
            PositionState::PartiallyExited
        };
    }

    /// Book a fill from an exit order that ended short of its quantity. The
    /// residual stays on the book so the next plan sees what is actually
    /// left at the venue.
    pub fn apply_exit_fill(&mut self, fill: &VenueFill) {
        self.exit_fills
            .push((fill.filled_quantity, fill.avg_fill_price));
        self.remaining_quantity = (self.remaining_quantity - fill.filled_quantity).max(0.0);
    }

    pub fn apply_full_close(
        &mut self,
        reason: ExitReason,
        fill: &VenueFill,
        exit_time: i64,
    ) -> Trade {
        self.apply_exit_fill(fill);
        self.finish_close(reason, exit_time)
    }

    /// Close out a position whose exit quantity has fully left the book.
    pub fn finish_close(&mut self, reason: ExitReason, exit_time: i64) -> Trade {
        self.remaining_quantity = 0.0;
        self.state = PositionState::Closed;
        self.build_trade(reason, exit_time)
    }

    fn build_trade(&self, exit_reason: ExitReason, exit_time: i64) -> Trade {
        let exit_qty: f64 = self.exit_fills.iter().map(|(q, _)| q).sum();
        let avg_exit_price = if exit_qty > 0.0 {
            self.exit_fills.iter().map(|(q, p)| q * p).sum::<f64>() / exit_qty
        } else {
            self.entry_price
        };
        let sign = self.side.sign();
        let realized_pnl: f64 = self
            .exit_fills
            .iter()
            .map(|(q, p)| sign * q * (p - self.entry_price))
            .sum();
        Trade {
            pair: self.pair.clone(),
            side: self.side,
            entry_price: self.entry_price,
            avg_exit_price,
            quantity: self.original_quantity,
            entry_time: self.entry_time,
            exit_time,
            realized_pnl,
            pnl_pct: sign * (avg_exit_price - self.entry_price) / self.entry_price,
            exit_reason,
            tiers_filled: self.tiers_filled.clone(),
        }
    }
}
