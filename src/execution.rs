//! Order submission with a bounded retry budget, per-attempt timeouts, and
//! slippage validation. Venue faults surface as terminal statuses, never as
//! panics or engine aborts.

use std::time::Duration;

use crate::config::{Config, SlippagePolicy};
use crate::venue::{ExecutionVenue, OrderSide, VenueFill};

#[derive(Clone, Debug, PartialEq)]
pub struct OrderRequest {
    pub pair: String,
    pub side: OrderSide,
    pub quantity: f64,
    /// Decision-time reference price; fills are slippage-checked against it.
    pub price_hint: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderStatus {
    Filled,
    /// Budget ran out with some quantity done.
    PartiallyFilled,
    Rejected,
    TimedOut,
}

/// Terminal result of `submit`: accumulated fills plus how it ended.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderOutcome {
    pub status: OrderStatus,
    pub filled_quantity: f64,
    /// Volume-weighted across partial fills; 0.0 when nothing filled.
    pub avg_fill_price: f64,
    pub attempts: u32,
}

impl OrderOutcome {
    pub fn is_complete(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    pub fn fill(&self) -> VenueFill {
        VenueFill {
            order_id: String::new(),
            filled_quantity: self.filled_quantity,
            avg_fill_price: self.avg_fill_price,
        }
    }
}

pub struct ExecutionLayer<V: ExecutionVenue> {
    venue: V,
    max_retries: u32,
    timeout: Duration,
    slippage_tolerance_pct: f64,
    slippage_policy: SlippagePolicy,
    backoff_secs: u64,
}

impl<V: ExecutionVenue> ExecutionLayer<V> {
    pub fn new(venue: V, cfg: &Config) -> Self {
        ExecutionLayer {
            venue,
            max_retries: cfg.max_order_retries,
            timeout: Duration::from_secs(cfg.order_timeout_secs),
            slippage_tolerance_pct: cfg.slippage_tolerance_pct,
            slippage_policy: cfg.slippage_policy,
            backoff_secs: cfg.retry_backoff_secs,
        }
    }

    pub fn venue(&self) -> &V {
        &self.venue
    }

    /// Drive `request` to a terminal outcome within the retry budget. Each
    /// attempt gets its own timeout; timeouts, transient errors, excessive
    /// slippage and partial fills all consume budget.
    pub async fn submit(&self, request: &OrderRequest) -> OrderOutcome {
        let mut remaining = request.quantity;
        let mut filled = 0.0_f64;
        let mut notional = 0.0_f64;
        let mut price_hint = request.price_hint;
        let mut attempts = 0_u32;
        let mut backoff = self.backoff_secs;

        while attempts < self.max_retries && remaining > 1e-12 {
            attempts += 1;
            let attempt = self
                .venue
                .place_order(&request.pair, request.side, remaining, price_hint);

            match tokio::time::timeout(self.timeout, attempt).await {
                Err(_) => {
                    log::warn!(
                        "[{}] order attempt {}/{} timed out after {:?}",
                        request.pair,
                        attempts,
                        self.max_retries,
                        self.timeout
                    );
                }
                Ok(Err(err)) if err.is_retryable() => {
                    log::warn!(
                        "[{}] order attempt {}/{} failed: {}",
                        request.pair,
                        attempts,
                        self.max_retries,
                        err
                    );
                }
                Ok(Err(err)) => {
                    // Permanent rejection: retrying cannot help.
                    log::error!("[{}] order rejected: {}", request.pair, err);
                    return OrderOutcome {
                        status: OrderStatus::Rejected,
                        filled_quantity: filled,
                        avg_fill_price: vwap(notional, filled),
                        attempts,
                    };
                }
                Ok(Ok(venue_fill)) => {
                    if let Some(hint) = price_hint {
                        let slip = adverse_slippage_pct(request.side, hint, venue_fill.avg_fill_price);
                        if slip > self.slippage_tolerance_pct {
                            log::warn!(
                                "[{}] fill at {:.2} slipped {:.3}% past hint {:.2} (limit {:.3}%), fill rejected",
                                request.pair,
                                venue_fill.avg_fill_price,
                                slip * 100.0,
                                hint,
                                self.slippage_tolerance_pct * 100.0
                            );
                            match self.slippage_policy {
                                SlippagePolicy::RetryAdjusted => {
                                    // Re-anchor on the observed price and
                                    // spend an attempt on the retry.
                                    price_hint = Some(venue_fill.avg_fill_price);
                                    continue;
                                }
                                SlippagePolicy::Abort => {
                                    return OrderOutcome {
                                        status: OrderStatus::Rejected,
                                        filled_quantity: filled,
                                        avg_fill_price: vwap(notional, filled),
                                        attempts,
                                    };
                                }
                            }
                        }
                    }

                    filled += venue_fill.filled_quantity;
                    notional += venue_fill.filled_quantity * venue_fill.avg_fill_price;
                    remaining -= venue_fill.filled_quantity;

                    if remaining <= 1e-12 {
                        return OrderOutcome {
                            status: OrderStatus::Filled,
                            filled_quantity: filled,
                            avg_fill_price: vwap(notional, filled),
                            attempts,
                        };
                    }
                    // Partial fill: re-queue the residual as a fresh attempt.
                    log::info!(
                        "[{}] partial fill {:.6}, re-queueing residual {:.6}",
                        request.pair,
                        venue_fill.filled_quantity,
                        remaining
                    );
                    continue;
                }
            }

            if attempts < self.max_retries && backoff > 0 {
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff *= 2;
            }
        }

        let status = if filled > 1e-12 {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::TimedOut
        };
        OrderOutcome {
            status,
            filled_quantity: filled,
            avg_fill_price: vwap(notional, filled),
            attempts,
        }
    }
}

fn vwap(notional: f64, quantity: f64) -> f64 {
    if quantity > 0.0 {
        notional / quantity
    } else {
        0.0
    }
}

/// Slippage counts only when it hurts: buys filled above the hint, sells
/// filled below it. Favorable deviation passes at any size.
fn adverse_slippage_pct(side: OrderSide, hint: f64, fill_price: f64) -> f64 {
    let signed = match side {
        OrderSide::Buy => fill_price - hint,
        OrderSide::Sell => hint - fill_price,
    };
    (signed / hint).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted venue: pops one response per `place_order` call.
    struct ScriptedVenue {
        script: Mutex<Vec<Result<VenueFill, EngineError>>>,
    }

    impl ScriptedVenue {
        fn new(mut responses: Vec<Result<VenueFill, EngineError>>) -> Self {
            responses.reverse();
            ScriptedVenue {
                script: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl ExecutionVenue for ScriptedVenue {
        async fn place_order(
            &self,
            _pair: &str,
            _side: OrderSide,
            quantity: f64,
            _price_hint: Option<f64>,
        ) -> Result<VenueFill, EngineError> {
            let next = self.script.lock().unwrap().pop();
            match next {
                Some(Ok(mut fill)) => {
                    // A scripted quantity of 0.0 means "fill whatever was asked".
                    if fill.filled_quantity == 0.0 {
                        fill.filled_quantity = quantity;
                    }
                    Ok(fill)
                }
                Some(Err(e)) => Err(e),
                None => Err(EngineError::Transient("script exhausted".into())),
            }
        }

        async fn cancel_order(&self, _order_id: &str) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn layer(venue: ScriptedVenue) -> ExecutionLayer<ScriptedVenue> {
        let mut cfg = Config::default();
        cfg.retry_backoff_secs = 0; // no sleeping in tests
        ExecutionLayer::new(venue, &cfg)
    }

    fn ok_fill(quantity: f64, price: f64) -> Result<VenueFill, EngineError> {
        Ok(VenueFill {
            order_id: "OID".into(),
            filled_quantity: quantity,
            avg_fill_price: price,
        })
    }

    fn request(quantity: f64, hint: Option<f64>) -> OrderRequest {
        OrderRequest {
            pair: "BTCUSDT".into(),
            side: OrderSide::Buy,
            quantity,
            price_hint: hint,
        }
    }

    #[tokio::test]
    async fn third_attempt_succeeds_within_budget() {
        let venue = ScriptedVenue::new(vec![
            Err(EngineError::Transient("down".into())),
            Err(EngineError::RateLimited { retry_after: 1 }),
            ok_fill(0.0, 50_000.0),
        ]);
        let outcome = layer(venue).submit(&request(1.0, Some(50_000.0))).await;
        assert_eq!(outcome.status, OrderStatus::Filled);
        assert_eq!(outcome.attempts, 3);
        assert!((outcome.filled_quantity - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn budget_exhaustion_is_terminal() {
        let venue = ScriptedVenue::new(vec![
            Err(EngineError::Transient("down".into())),
            Err(EngineError::Transient("down".into())),
            Err(EngineError::Transient("down".into())),
        ]);
        let outcome = layer(venue).submit(&request(1.0, None)).await;
        assert_eq!(outcome.status, OrderStatus::TimedOut);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.filled_quantity, 0.0);
    }

    #[tokio::test]
    async fn permanent_rejection_does_not_retry() {
        let venue = ScriptedVenue::new(vec![
            Err(EngineError::Permanent("insufficient funds".into())),
            ok_fill(0.0, 50_000.0),
        ]);
        let outcome = layer(venue).submit(&request(1.0, None)).await;
        assert_eq!(outcome.status, OrderStatus::Rejected);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn adverse_slippage_rejected_then_retried_at_revised_price() {
        // 0.2% above the hint, tolerance is 0.1%: first fill is rejected and
        // the retry is anchored on the observed price.
        let venue = ScriptedVenue::new(vec![
            ok_fill(0.0, 50_100.0),
            ok_fill(0.0, 50_100.0),
        ]);
        let outcome = layer(venue).submit(&request(1.0, Some(50_000.0))).await;
        assert_eq!(outcome.status, OrderStatus::Filled);
        assert_eq!(outcome.attempts, 2);
        assert!((outcome.avg_fill_price - 50_100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn favorable_deviation_is_not_slippage() {
        // A buy filled BELOW the hint passes at any size.
        let venue = ScriptedVenue::new(vec![ok_fill(0.0, 49_000.0)]);
        let outcome = layer(venue).submit(&request(1.0, Some(50_000.0))).await;
        assert_eq!(outcome.status, OrderStatus::Filled);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn abort_policy_stops_on_first_slip() {
        let venue = ScriptedVenue::new(vec![ok_fill(0.0, 50_100.0)]);
        let mut cfg = Config::default();
        cfg.retry_backoff_secs = 0;
        cfg.slippage_policy = SlippagePolicy::Abort;
        let layer = ExecutionLayer::new(venue, &cfg);
        let outcome = layer.submit(&request(1.0, Some(50_000.0))).await;
        assert_eq!(outcome.status, OrderStatus::Rejected);
        assert_eq!(outcome.filled_quantity, 0.0);
    }

    #[tokio::test]
    async fn partial_fills_accumulate_and_residual_requeues() {
        let venue = ScriptedVenue::new(vec![
            ok_fill(0.6, 50_000.0),
            ok_fill(0.4, 50_020.0),
        ]);
        let outcome = layer(venue).submit(&request(1.0, Some(50_000.0))).await;
        assert_eq!(outcome.status, OrderStatus::Filled);
        assert_eq!(outcome.attempts, 2);
        assert!((outcome.filled_quantity - 1.0).abs() < 1e-12);
        // VWAP of 0.6@50000 + 0.4@50020
        assert!((outcome.avg_fill_price - 50_008.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn partial_fill_with_exhausted_budget_reports_partially_filled() {
        let venue = ScriptedVenue::new(vec![
            ok_fill(0.5, 50_000.0),
            Err(EngineError::Transient("down".into())),
            Err(EngineError::Transient("down".into())),
        ]);
        let outcome = layer(venue).submit(&request(1.0, Some(50_000.0))).await;
        assert_eq!(outcome.status, OrderStatus::PartiallyFilled);
        assert_eq!(outcome.attempts, 3);
        assert!((outcome.filled_quantity - 0.5).abs() < 1e-12);
    }
}
