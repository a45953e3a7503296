//! Tick orchestrator: one fixed-interval loop driving data fetch, fusion,
//! position management, risk-gated entries and analytics. Failures inside a
//! tick are logged and isolated; the loop itself never dies. Shutdown is
//! observed at tick boundaries only, so an in-flight tick (and any order it
//! placed) always completes.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;

use crate::analytics::{AnalyticsRecorder, PerformanceSummary};
use crate::config::Config;
use crate::error::EngineError;
use crate::execution::{ExecutionLayer, OrderRequest};
use crate::indicators::IndicatorSnapshot;
use crate::position::{Position, PositionAction};
use crate::risk::{Admission, RiskGate, RiskState};
use crate::signals::{fuse, SignalVector};
use crate::telegram::TelegramBot;
use crate::types::{ExitReason, Side, Trade};
use crate::venue::{AccountSource, ExecutionVenue, MarketDataSource, OrderSide};

/// Reporting surface: everything an operator needs in one read.
#[derive(Clone, Debug)]
pub struct EngineSnapshot {
    pub risk: RiskState,
    pub open_positions: Vec<Position>,
    pub performance: PerformanceSummary,
}

pub struct Engine<M, A, V>
where
    M: MarketDataSource,
    A: AccountSource,
    V: ExecutionVenue,
{
    cfg: Config,
    market: M,
    account: A,
    execution: ExecutionLayer<V>,
    risk: RiskGate,
    analytics: AnalyticsRecorder,
    telegram: Option<TelegramBot>,
    positions: Vec<Position>,
    tick_count: u64,
}

impl<M, A, V> Engine<M, A, V>
where
    M: MarketDataSource,
    A: AccountSource,
    V: ExecutionVenue,
{
    pub fn new(
        cfg: Config,
        market: M,
        account: A,
        venue: V,
        telegram: Option<TelegramBot>,
        initial_equity: f64,
        trade_log: Option<PathBuf>,
    ) -> Result<Self, EngineError> {
        cfg.validate()?;
        let execution = ExecutionLayer::new(venue, &cfg);
        let risk = RiskGate::new(&cfg, initial_equity);
        let analytics = AnalyticsRecorder::new(initial_equity, trade_log);
        Ok(Engine {
            cfg,
            market,
            account,
            execution,
            risk,
            analytics,
            telegram,
            positions: Vec::new(),
            tick_count: 0,
        })
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            risk: self.risk.snapshot(),
            open_positions: self.positions.clone(),
            performance: self.analytics.summary(),
        }
    }

    pub fn reset_circuit_breaker(&self) {
        self.risk.reset_circuit_breaker();
    }

    /// Main loop. `shutdown` flips to true to stop; the current tick always
    /// finishes first.
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        log::info!(
            "[{}] engine started: tick every {}s",
            self.cfg.pair,
            self.cfg.tick_interval_secs
        );
        if let Some(tg) = &self.telegram {
            tg.notify_start(&self.cfg.pair, self.risk.snapshot().current_equity)
                .await;
        }

        loop {
            self.run_tick().await;

            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.cfg.tick_interval_secs)) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        log::info!("[{}] engine stopped after {} ticks", self.cfg.pair, self.tick_count);
        self.analytics.log_summary();
        if let Some(tg) = &self.telegram {
            tg.notify_performance(&self.analytics.summary(), self.risk.snapshot().current_equity)
                .await;
        }
    }

    /// One scheduled evaluation. Every failure path logs and returns; the
    /// worst a bad tick can do is nothing.
    pub async fn run_tick(&mut self) {
        self.tick_count += 1;
        let now = Utc::now().timestamp();

        let depth = self.cfg.min_candles.max(self.cfg.sr_window) + 10;
        let primary = match self
            .market
            .fetch_candles(&self.cfg.pair, crate::config::TF_PRIMARY_MIN, depth)
            .await
        {
            Ok(c) => c,
            Err(EngineError::DataUnavailable { needed, have }) => {
                log::info!(
                    "[{}] tick {}: insufficient primary candles ({}/{}), no action",
                    self.cfg.pair,
                    self.tick_count,
                    have,
                    needed
                );
                return;
            }
            Err(e) => {
                log::warn!("[{}] primary candle fetch failed: {}", self.cfg.pair, e);
                return;
            }
        };
        let trend = match self
            .market
            .fetch_candles(
                &self.cfg.pair,
                crate::config::TF_TREND_MIN,
                self.cfg.min_trend_candles.max(10),
            )
            .await
        {
            Ok(c) => c,
            Err(e) => {
                log::warn!("[{}] trend candle fetch failed: {}", self.cfg.pair, e);
                return;
            }
        };

        let indicator_snapshot = match IndicatorSnapshot::compute(&primary, &trend, &self.cfg) {
            Ok(s) => s,
            Err(EngineError::DataUnavailable { needed, have }) => {
                log::info!(
                    "[{}] tick {}: indicators need {} candles, have {}; no action",
                    self.cfg.pair,
                    self.tick_count,
                    needed,
                    have
                );
                return;
            }
            Err(e) => {
                log::warn!("[{}] indicator computation failed: {}", self.cfg.pair, e);
                return;
            }
        };

        // Optional views: fusion degrades gracefully without them.
        let book = match self.market.fetch_order_book(&self.cfg.pair).await {
            Ok(b) => Some(b),
            Err(e) => {
                log::warn!("[{}] order book fetch failed: {}", self.cfg.pair, e);
                None
            }
        };
        let ticker = match self.market.fetch_ticker(&self.cfg.pair).await {
            Ok(t) => Some(t),
            Err(e) => {
                log::warn!("[{}] ticker fetch failed: {}", self.cfg.pair, e);
                None
            }
        };

        let was_tripped = self.risk.snapshot().circuit_breaker_tripped;
        let equity = match self.account.fetch_equity().await {
            Ok(eq) => {
                self.risk.report_equity(eq);
                eq
            }
            Err(e) => {
                log::warn!("[{}] equity fetch failed: {}", self.cfg.pair, e);
                self.risk.snapshot().current_equity
            }
        };
        self.notify_if_breaker_tripped(was_tripped).await;

        let signal = fuse(&indicator_snapshot, book.as_ref(), ticker.as_ref(), &self.cfg);
        log::info!(
            "[{}] tick {}: price={:.2} composite={:.2} aligned={} regime={:?} open={}",
            self.cfg.pair,
            self.tick_count,
            indicator_snapshot.price,
            signal.composite_score,
            signal.trend_aligned,
            indicator_snapshot.regime,
            self.positions.len()
        );

        // Exits before entries: freed slots are usable this same tick.
        self.manage_positions(&indicator_snapshot, &signal, now).await;
        self.try_enter(&indicator_snapshot, &signal, now).await;

        self.analytics.record_equity(now, equity);
    }

    async fn manage_positions(
        &mut self,
        snapshot: &IndicatorSnapshot,
        signal: &SignalVector,
        now: i64,
    ) {
        let price = snapshot.price;
        let mut closed: Vec<Trade> = Vec::new();

        for i in 0..self.positions.len() {
            self.positions[i].advance_age();
            let action =
                self.positions[i].plan_tick(price, signal.composite_score, snapshot.atr, &self.cfg);
            match action {
                PositionAction::Hold => {}
                PositionAction::UpdateStop {
                    new_stop,
                    favorable_extreme,
                } => {
                    log::info!(
                        "[{}] trailing stop {:.2} -> {:.2}",
                        self.cfg.pair,
                        self.positions[i].stop_price,
                        new_stop
                    );
                    self.positions[i].apply_stop_update(new_stop, favorable_extreme);
                }
                PositionAction::PartialExit { tier, quantity } => {
                    if let Some(trade) = self.execute_partial_exit(i, tier, quantity, price, now).await
                    {
                        closed.push(trade);
                    }
                }
                PositionAction::FullExit { reason } => {
                    if let Some(trade) = self.execute_full_exit(i, reason, price, now).await {
                        closed.push(trade);
                    }
                }
            }
        }

        self.positions.retain(|p| p.is_open());

        for trade in closed {
            let was_tripped = self.risk.snapshot().circuit_breaker_tripped;
            self.risk.release_slot();
            self.risk.apply_pnl(trade.realized_pnl);
            log::info!(
                "[{}] trade closed: {} pnl={:+.2} ({:+.2}%) reason={} tiers={:?}",
                self.cfg.pair,
                trade.side,
                trade.realized_pnl,
                trade.pnl_pct * 100.0,
                trade.exit_reason,
                trade.tiers_filled
            );
            if let Some(tg) = &self.telegram {
                tg.notify_trade_close(&trade).await;
            }
            self.analytics.record_trade(trade);
            self.notify_if_breaker_tripped(was_tripped).await;
        }
    }

    async fn execute_partial_exit(
        &mut self,
        index: usize,
        tier: u8,
        quantity: f64,
        price: f64,
        now: i64,
    ) -> Option<Trade> {
        let side = exit_order_side(self.positions[index].side);
        let request = OrderRequest {
            pair: self.cfg.pair.clone(),
            side,
            quantity,
            price_hint: Some(price),
        };
        let outcome = self.execution.submit(&request).await;
        if outcome.filled_quantity <= 0.0 {
            log::warn!(
                "[{}] tier {} exit incomplete ({:?}); retrying next tick",
                self.cfg.pair,
                tier,
                outcome.status
            );
            return None;
        }
        if !outcome.is_complete() {
            // The tier counts as taken at the quantity the venue actually
            // sold; the shortfall stays in the position and leaves with a
            // later exit (the final tier takes the exact remainder).
            log::warn!(
                "[{}] tier {} exit filled {:.6} of {:.6} ({:?}); shortfall leaves with a later exit",
                self.cfg.pair,
                tier,
                outcome.filled_quantity,
                quantity,
                outcome.status
            );
        }

        let fill = outcome.fill();
        let position = &mut self.positions[index];
        let remaining_after = position.remaining_quantity - fill.filled_quantity;
        log::info!(
            "[{}] tier {} filled: {:.4} @ {:.2}",
            self.cfg.pair,
            tier,
            fill.filled_quantity,
            fill.avg_fill_price
        );
        if let Some(tg) = &self.telegram {
            tg.notify_partial_exit(
                &self.cfg.pair,
                tier,
                fill.filled_quantity,
                fill.avg_fill_price,
                remaining_after.max(0.0),
            )
            .await;
        }
        self.positions[index].apply_partial_fill(tier, &fill, now, &self.cfg)
    }

    async fn execute_full_exit(
        &mut self,
        index: usize,
        reason: ExitReason,
        price: f64,
        now: i64,
    ) -> Option<Trade> {
        let (side, quantity) = {
            let p = &mut self.positions[index];
            p.begin_close();
            (exit_order_side(p.side), p.remaining_quantity)
        };
        let request = OrderRequest {
            pair: self.cfg.pair.clone(),
            side,
            quantity,
            price_hint: Some(price),
        };
        let outcome = self.execution.submit(&request).await;
        if !outcome.is_complete() {
            if outcome.filled_quantity > 0.0 {
                // The venue sold part of the exit before the budget ran out;
                // book it so next tick plans against what is actually left.
                self.positions[index].apply_exit_fill(&outcome.fill());
                if self.positions[index].remaining_quantity <= 1e-12 {
                    return Some(self.positions[index].finish_close(reason, now));
                }
                log::warn!(
                    "[{}] {} exit filled {:.6} of {:.6} ({:?}); residual retried next tick",
                    self.cfg.pair,
                    reason,
                    outcome.filled_quantity,
                    quantity,
                    outcome.status
                );
            } else {
                log::warn!(
                    "[{}] {} exit incomplete ({:?}); retrying next tick",
                    self.cfg.pair,
                    reason,
                    outcome.status
                );
            }
            self.positions[index].abort_close();
            return None;
        }
        Some(self.positions[index].apply_full_close(reason, &outcome.fill(), now))
    }

    async fn try_enter(&mut self, snapshot: &IndicatorSnapshot, signal: &SignalVector, now: i64) {
        let side = match signal.entry_direction() {
            Some(s) => s,
            None => return,
        };

        let admission = self
            .risk
            .request_entry(side, snapshot.price, snapshot.atr, 1.0);
        let (quantity, stop_price) = match admission {
            Admission::Granted {
                quantity,
                stop_price,
            } => (quantity, stop_price),
            Admission::Denied(reason) => {
                log::info!(
                    "[{}] entry {} denied: {}",
                    self.cfg.pair,
                    side,
                    reason
                );
                return;
            }
        };

        let request = OrderRequest {
            pair: self.cfg.pair.clone(),
            side: entry_order_side(side),
            quantity,
            price_hint: Some(snapshot.price),
        };
        let mut position = Position::pending(&self.cfg.pair, side, stop_price);
        let outcome = self.execution.submit(&request).await;
        if outcome.filled_quantity <= 0.0 {
            log::warn!(
                "[{}] entry order failed ({:?}); slot released",
                self.cfg.pair,
                outcome.status
            );
            self.risk.release_slot();
            return;
        }

        position.activate(&outcome.fill(), now);
        log::info!(
            "[{}] opened {} {:.4} @ {:.2} stop={:.2} (composite {:+.2})",
            self.cfg.pair,
            side,
            position.original_quantity,
            position.entry_price,
            position.stop_price,
            signal.composite_score
        );
        if let Some(tg) = &self.telegram {
            tg.notify_trade_open(
                &self.cfg.pair,
                side,
                position.original_quantity,
                position.entry_price,
                position.stop_price,
            )
            .await;
        }
        self.positions.push(position);
    }

    async fn notify_if_breaker_tripped(&self, was_tripped: bool) {
        let state = self.risk.snapshot();
        if state.circuit_breaker_tripped && !was_tripped {
            if let Some(tg) = &self.telegram {
                tg.notify_circuit_breaker(state.drawdown_pct).await;
            }
        }
    }
}

fn entry_order_side(side: Side) -> OrderSide {
    match side {
        Side::Long => OrderSide::Buy,
        Side::Short => OrderSide::Sell,
    }
}

fn exit_order_side(side: Side) -> OrderSide {
    match side {
        Side::Long => OrderSide::Sell,
        Side::Short => OrderSide::Buy,
    }
}
