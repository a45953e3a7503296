use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::config::KRAKEN_REST_URL;
use crate::error::EngineError;
use crate::types::{Candle, OrderBookView, TickerView};
use crate::venue::{AccountSource, ExecutionVenue, MarketDataSource, OrderSide, VenueFill};

type HmacSha512 = Hmac<Sha512>;

// ── Error classification ──────────────────────────────────────────────────────

/// Map a Kraken error string ("EAPI:Rate limit", "EOrder:Insufficient funds",
/// ...) onto the engine's retryable/permanent split.
fn classify_error(msg: &str) -> EngineError {
    if msg.contains("Rate limit") {
        EngineError::RateLimited { retry_after: 10 }
    } else if msg.starts_with("EService")
        || msg.contains("Temporary")
        || msg.contains("Unavailable")
        || msg.contains("Timeout")
    {
        EngineError::Transient(msg.to_string())
    } else {
        EngineError::Permanent(msg.to_string())
    }
}

/// Generic retry wrapper with exponential backoff.
async fn with_retry<F, Fut, T>(operation: F, max_retries: u32) -> Result<T, EngineError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut retries = 0;
    let mut delay: u64 = 1;
    loop {
        match operation().await {
            Ok(r) => return Ok(r),
            Err(EngineError::RateLimited { retry_after }) => {
                if retries >= max_retries {
                    return Err(EngineError::RateLimited { retry_after });
                }
                log::warn!(
                    "Rate limited — sleeping {}s (attempt {}/{})",
                    retry_after,
                    retries + 1,
                    max_retries
                );
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                retries += 1;
            }
            Err(EngineError::Transient(msg)) => {
                if retries >= max_retries {
                    return Err(EngineError::Transient(msg));
                }
                log::warn!(
                    "Transient error: {} — retry in {}s ({}/{})",
                    msg,
                    delay,
                    retries + 1,
                    max_retries
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;
                delay = (delay * 2).min(60);
                retries += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct KrakenClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    /// Balance keys for the traded pair, e.g. ("BTC", "USDT").
    base_asset: String,
    quote_asset: String,
}

impl KrakenClient {
    /// Credentials come from `KRAKEN_API_KEY` / `KRAKEN_API_SECRET`.
    pub fn from_env(base_asset: &str, quote_asset: &str) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| EngineError::InvalidConfiguration(format!("HTTP client: {}", e)))?;

        let api_key = std::env::var("KRAKEN_API_KEY")
            .map_err(|_| EngineError::InvalidConfiguration("KRAKEN_API_KEY not set".into()))?;
        let api_secret = std::env::var("KRAKEN_API_SECRET")
            .map_err(|_| EngineError::InvalidConfiguration("KRAKEN_API_SECRET not set".into()))?;

        Ok(KrakenClient {
            client,
            base_url: KRAKEN_REST_URL.to_string(),
            api_key,
            api_secret,
            base_asset: base_asset.to_string(),
            quote_asset: quote_asset.to_string(),
        })
    }

    fn nonce() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// HMAC-SHA512 over `uri_path || SHA256(nonce || postdata)`, keyed with
    /// the base64-decoded secret.
    fn sign(&self, uri_path: &str, nonce: u64, postdata: &str) -> Result<String, EngineError> {
        let secret = base64::engine::general_purpose::STANDARD
            .decode(&self.api_secret)
            .map_err(|_| {
                EngineError::InvalidConfiguration("KRAKEN_API_SECRET is not base64".into())
            })?;

        let mut sha = Sha256::new();
        sha.update(format!("{}{}", nonce, postdata).as_bytes());
        let digest = sha.finalize();

        let mut mac = HmacSha512::new_from_slice(&secret)
            .map_err(|_| EngineError::InvalidConfiguration("HMAC init failed".into()))?;
        mac.update(uri_path.as_bytes());
        mac.update(&digest);
        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Signed POST to a private endpoint; returns the `result` object.
    async fn private_request(
        &self,
        uri_path: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, EngineError> {
        let nonce = Self::nonce();
        let mut postdata = format!("nonce={}", nonce);
        for (k, v) in params {
            postdata.push_str(&format!("&{}={}", k, v));
        }
        let signature = self.sign(uri_path, nonce, &postdata)?;

        let url = format!("{}{}", self.base_url, uri_path);
        let resp = self
            .client
            .post(&url)
            .header("API-Key", &self.api_key)
            .header("API-Sign", signature)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(postdata)
            .send()
            .await
            .map_err(|e| EngineError::Transient(format!("HTTP error: {}", e)))?;

        if resp.status().as_u16() == 429 {
            return Err(EngineError::RateLimited { retry_after: 10 });
        }
        if resp.status().is_server_error() {
            return Err(EngineError::Transient(format!("HTTP {}", resp.status())));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Transient(format!("Parse error: {}", e)))?;

        if let Some(err) = first_error(&json) {
            return Err(classify_error(&err));
        }
        Ok(json["result"].clone())
    }

    /// GET to a public endpoint; returns the `result` object.
    async fn public_request(
        &self,
        uri_path: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, EngineError> {
        let url = format!("{}{}", self.base_url, uri_path);
        let resp = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| EngineError::Transient(format!("HTTP error: {}", e)))?;

        if resp.status().as_u16() == 429 {
            return Err(EngineError::RateLimited { retry_after: 10 });
        }
        if resp.status().is_server_error() {
            return Err(EngineError::Transient(format!("HTTP {}", resp.status())));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Transient(format!("Parse error: {}", e)))?;

        if let Some(err) = first_error(&json) {
            return Err(classify_error(&err));
        }
        Ok(json["result"].clone())
    }

    // ── Internal raw methods (no retry) ──────────────────────────────────────

    async fn fetch_candles_raw(
        &self,
        pair: &str,
        timeframe_min: u32,
        count: usize,
    ) -> Result<Vec<Candle>, EngineError> {
        let result = self
            .public_request(
                "/0/public/OHLC",
                &[
                    ("pair", pair.to_string()),
                    ("interval", timeframe_min.to_string()),
                ],
            )
            .await?;

        let rows = pair_entry(&result)
            .and_then(|v| v.as_array().cloned())
            .ok_or_else(|| EngineError::Transient("OHLC: missing pair data".into()))?;

        let mut candles: Vec<Candle> = rows.iter().filter_map(parse_ohlc_row).collect();
        // The newest row is the still-forming candle; decisions use closed
        // candles only.
        candles.pop();
        if candles.len() < count {
            return Err(EngineError::DataUnavailable {
                needed: count,
                have: candles.len(),
            });
        }
        let start = candles.len() - count;
        Ok(candles.split_off(start))
    }

    async fn fetch_ticker_raw(&self, pair: &str) -> Result<TickerView, EngineError> {
        let result = self
            .public_request("/0/public/Ticker", &[("pair", pair.to_string())])
            .await?;
        let entry = pair_entry(&result)
            .ok_or_else(|| EngineError::Transient("Ticker: missing pair data".into()))?;

        // c = [last, lot], h/l = [today, last24h]
        let last_price = str_field(entry, "c", 0)?;
        let high_24h = str_field(entry, "h", 1)?;
        let low_24h = str_field(entry, "l", 1)?;
        Ok(TickerView {
            last_price,
            high_24h,
            low_24h,
        })
    }

    async fn fetch_order_book_raw(
        &self,
        pair: &str,
        depth: usize,
    ) -> Result<OrderBookView, EngineError> {
        let result = self
            .public_request(
                "/0/public/Depth",
                &[("pair", pair.to_string()), ("count", depth.to_string())],
            )
            .await?;
        let entry = pair_entry(&result)
            .ok_or_else(|| EngineError::Transient("Depth: missing pair data".into()))?;

        let parse_side = |key: &str| -> Result<(f64, f64), EngineError> {
            let levels = entry[key]
                .as_array()
                .ok_or_else(|| EngineError::Transient(format!("Depth: missing {}", key)))?;
            let best = levels
                .first()
                .and_then(|l| l.as_array())
                .and_then(|l| l.first())
                .and_then(parse_num)
                .ok_or_else(|| EngineError::Transient(format!("Depth: empty {}", key)))?;
            let total: f64 = levels
                .iter()
                .filter_map(|l| l.as_array().and_then(|l| l.get(1)).and_then(parse_num))
                .sum();
            Ok((best, total))
        };

        let (best_bid, bid_depth) = parse_side("bids")?;
        let (best_ask, ask_depth) = parse_side("asks")?;
        Ok(OrderBookView {
            best_bid,
            best_ask,
            bid_depth,
            ask_depth,
        })
    }

    async fn fetch_equity_raw(&self) -> Result<f64, EngineError> {
        let balances = self.private_request("/0/private/Balance", &[]).await?;
        let amount = |asset: &str| -> f64 {
            balances[asset]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0)
        };
        let quote = amount(&self.quote_asset);
        let base = amount(&self.base_asset);
        if base == 0.0 {
            return Ok(quote);
        }
        let pair = format!("{}{}", self.base_asset, self.quote_asset);
        let ticker = self.fetch_ticker_raw(&pair).await?;
        Ok(quote + base * ticker.last_price)
    }

    async fn place_order_raw(
        &self,
        pair: &str,
        side: OrderSide,
        quantity: f64,
    ) -> Result<String, EngineError> {
        let result = self
            .private_request(
                "/0/private/AddOrder",
                &[
                    ("pair", pair.to_string()),
                    ("type", side.to_string()),
                    ("ordertype", "market".to_string()),
                    ("volume", format!("{:.4}", quantity)),
                ],
            )
            .await?;

        let txid = result["txid"]
            .as_array()
            .and_then(|a| a.first())
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Transient("AddOrder: missing txid".into()))?
            .to_string();
        log::info!(
            "[{}] order placed: {} {:.4} txid={}",
            pair,
            side,
            quantity,
            txid
        );
        Ok(txid)
    }

    /// Poll QueryOrders until the order closes. The caller bounds the wait
    /// with its own timeout; a cancel while polling is a rejection.
    async fn await_fill(&self, txid: &str) -> Result<VenueFill, EngineError> {
        loop {
            let result = self
                .private_request("/0/private/QueryOrders", &[("txid", txid.to_string())])
                .await?;
            let order = &result[txid];
            match order["status"].as_str() {
                Some("closed") => {
                    let filled_quantity = order["vol_exec"]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0.0);
                    let avg_fill_price = order["price"]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0.0);
                    return Ok(VenueFill {
                        order_id: txid.to_string(),
                        filled_quantity,
                        avg_fill_price,
                    });
                }
                Some("canceled") | Some("expired") => {
                    return Err(EngineError::OrderRejected(format!(
                        "order {} canceled before fill",
                        txid
                    )));
                }
                _ => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        }
    }

    // ── Public methods with retry ─────────────────────────────────────────────

    pub async fn fetch_candles(
        &self,
        pair: &str,
        timeframe_min: u32,
        count: usize,
    ) -> Result<Vec<Candle>, EngineError> {
        let s = self.clone();
        let p = pair.to_string();
        with_retry(
            || {
                let s = s.clone();
                let p = p.clone();
                async move { s.fetch_candles_raw(&p, timeframe_min, count).await }
            },
            3,
        )
        .await
    }

    pub async fn fetch_ticker(&self, pair: &str) -> Result<TickerView, EngineError> {
        let s = self.clone();
        let p = pair.to_string();
        with_retry(
            || {
                let s = s.clone();
                let p = p.clone();
                async move { s.fetch_ticker_raw(&p).await }
            },
            3,
        )
        .await
    }

    pub async fn fetch_order_book(&self, pair: &str) -> Result<OrderBookView, EngineError> {
        let s = self.clone();
        let p = pair.to_string();
        with_retry(
            || {
                let s = s.clone();
                let p = p.clone();
                async move { s.fetch_order_book_raw(&p, 5).await }
            },
            3,
        )
        .await
    }

    pub async fn fetch_equity(&self) -> Result<f64, EngineError> {
        let s = self.clone();
        with_retry(
            || {
                let s = s.clone();
                async move { s.fetch_equity_raw().await }
            },
            3,
        )
        .await
    }
}

/// Kraken reports errors as a (possibly empty) string array.
fn first_error(json: &serde_json::Value) -> Option<String> {
    json["error"]
        .as_array()
        .and_then(|a| a.first())
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// The `result` object keys responses by Kraken's own pair alias; take the
/// first non-meta entry rather than guessing the alias.
fn pair_entry(result: &serde_json::Value) -> Option<&serde_json::Value> {
    result
        .as_object()?
        .iter()
        .find(|(k, _)| k.as_str() != "last")
        .map(|(_, v)| v)
}

fn parse_num(v: &serde_json::Value) -> Option<f64> {
    v.as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| v.as_f64())
}

/// Ticker fields are string arrays (`c` = [last, lot], `h`/`l` = [today,
/// last24h]); pick one element and parse it.
fn str_field(entry: &serde_json::Value, key: &str, index: usize) -> Result<f64, EngineError> {
    entry[key]
        .get(index)
        .and_then(parse_num)
        .ok_or_else(|| EngineError::Transient(format!("Ticker: missing {}[{}]", key, index)))
}

/// OHLC row: [time, open, high, low, close, vwap, volume, count].
fn parse_ohlc_row(row: &serde_json::Value) -> Option<Candle> {
    let arr = row.as_array()?;
    Some(Candle {
        open_time: arr.first()?.as_i64()?,
        open: parse_num(arr.get(1)?)?,
        high: parse_num(arr.get(2)?)?,
        low: parse_num(arr.get(3)?)?,
        close: parse_num(arr.get(4)?)?,
        volume: parse_num(arr.get(6)?)?,
    })
}

// ── Trait adapters ────────────────────────────────────────────────────────────

#[async_trait]
impl MarketDataSource for KrakenClient {
    async fn fetch_candles(
        &self,
        pair: &str,
        timeframe_min: u32,
        count: usize,
    ) -> Result<Vec<Candle>, EngineError> {
        KrakenClient::fetch_candles(self, pair, timeframe_min, count).await
    }

    async fn fetch_ticker(&self, pair: &str) -> Result<TickerView, EngineError> {
        KrakenClient::fetch_ticker(self, pair).await
    }

    async fn fetch_order_book(&self, pair: &str) -> Result<OrderBookView, EngineError> {
        KrakenClient::fetch_order_book(self, pair).await
    }
}

#[async_trait]
impl AccountSource for KrakenClient {
    async fn fetch_equity(&self) -> Result<f64, EngineError> {
        KrakenClient::fetch_equity(self).await
    }
}

#[async_trait]
impl ExecutionVenue for KrakenClient {
    /// One attempt: place the market order and wait for its fill. Retry
    /// budgets and the attempt timeout belong to the execution layer.
    async fn place_order(
        &self,
        pair: &str,
        side: OrderSide,
        quantity: f64,
        _price_hint: Option<f64>,
    ) -> Result<VenueFill, EngineError> {
        let txid = self.place_order_raw(pair, side, quantity).await?;
        self.await_fill(&txid).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), EngineError> {
        self.private_request("/0/private/CancelOrder", &[("txid", order_id.to_string())])
            .await?;
        log::info!("order {} cancelled", order_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_errors_are_retryable() {
        let err = classify_error("EAPI:Rate limit exceeded");
        assert!(matches!(err, EngineError::RateLimited { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn service_errors_are_transient() {
        assert!(classify_error("EService:Unavailable").is_retryable());
        assert!(classify_error("EService:Busy").is_retryable());
    }

    #[test]
    fn order_errors_are_permanent() {
        assert!(!classify_error("EOrder:Insufficient funds").is_retryable());
        assert!(!classify_error("EGeneral:Invalid arguments").is_retryable());
    }

    #[test]
    fn ohlc_row_parses_string_fields() {
        let row = serde_json::json!([
            1_700_000_000,
            "60000.1",
            "60100.0",
            "59900.5",
            "60050.0",
            "60010.0",
            "12.345",
            42
        ]);
        let c = parse_ohlc_row(&row).unwrap();
        assert_eq!(c.open_time, 1_700_000_000);
        assert!((c.open - 60_000.1).abs() < 1e-9);
        assert!((c.volume - 12.345).abs() < 1e-9);
    }

    #[test]
    fn pair_entry_skips_last_marker() {
        let result = serde_json::json!({
            "last": 1_700_000_000,
            "XBTUSDT": [[1, "2", "3", "1", "2", "2", "5", 1]]
        });
        let entry = pair_entry(&result).unwrap();
        assert!(entry.is_array());
    }

    #[test]
    fn ticker_fields_parse_from_string_arrays() {
        let entry = serde_json::json!({
            "c": ["50000.1", "0.01"],
            "h": ["50500.0", "51000.0"],
            "l": ["49500.0", "49000.0"]
        });
        assert!((str_field(&entry, "c", 0).unwrap() - 50_000.1).abs() < 1e-9);
        assert!((str_field(&entry, "h", 1).unwrap() - 51_000.0).abs() < 1e-9);
        assert!((str_field(&entry, "l", 1).unwrap() - 49_000.0).abs() < 1e-9);
        assert!(str_field(&entry, "x", 0).is_err());
    }

    #[test]
    fn kraken_error_array_surfaces_first_entry() {
        let json = serde_json::json!({ "error": ["EAPI:Rate limit exceeded"] });
        assert_eq!(
            first_error(&json).as_deref(),
            Some("EAPI:Rate limit exceeded")
        );
        let ok = serde_json::json!({ "error": [], "result": {} });
        assert!(first_error(&ok).is_none());
    }
}
