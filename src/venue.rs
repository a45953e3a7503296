//! Trait seams between the engine and the exchange. The live implementation
//! is `KrakenClient`; tests plug in scripted mocks.

use async_trait::async_trait;

use crate::error::EngineError;
use crate::types::{Candle, OrderBookView, TickerView};

/// Order direction at the venue level. Distinct from `Side`: closing a long
/// position sells, closing a short buys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// A fill (possibly partial) reported by the venue.
#[derive(Clone, Debug, PartialEq)]
pub struct VenueFill {
    pub order_id: String,
    pub filled_quantity: f64,
    pub avg_fill_price: f64,
}

/// Read-only market data: candles, ticker, order book.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Most recent `count` closed candles for `pair` at `timeframe_min`,
    /// oldest first.
    async fn fetch_candles(
        &self,
        pair: &str,
        timeframe_min: u32,
        count: usize,
    ) -> Result<Vec<Candle>, EngineError>;

    async fn fetch_ticker(&self, pair: &str) -> Result<TickerView, EngineError>;

    async fn fetch_order_book(&self, pair: &str) -> Result<OrderBookView, EngineError>;
}

/// Account state: total equity in quote currency.
#[async_trait]
pub trait AccountSource: Send + Sync {
    async fn fetch_equity(&self) -> Result<f64, EngineError>;
}

/// Order placement. One call is one attempt; retry budgets and timeouts live
/// in the execution layer, not here.
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    async fn place_order(
        &self,
        pair: &str,
        side: OrderSide,
        quantity: f64,
        price_hint: Option<f64>,
    ) -> Result<VenueFill, EngineError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), EngineError>;
}
