use crate::analytics::PerformanceSummary;
use crate::types::{Side, Trade};

const BASE_URL: &str = "https://api.telegram.org";

#[derive(Clone)]
pub struct TelegramBot {
    client: reqwest::Client,
    url: String,
    chat_id: String,
}

impl TelegramBot {
    /// `None` when `TELEGRAM_TOKEN`/`TELEGRAM_CHAT_ID` are not configured;
    /// the engine runs fine without notifications.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("TELEGRAM_TOKEN").ok()?;
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok()?;
        Some(TelegramBot {
            client: reqwest::Client::new(),
            url: format!("{}/bot{}/sendMessage", BASE_URL, token),
            chat_id,
        })
    }

    /// Delivery failures are logged and swallowed; notifications never stall
    /// a tick.
    pub async fn send(&self, text: &str) {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML"
        });

        match self.client.post(&self.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                let preview: String = text.chars().take(80).collect();
                log::info!("Telegram sent: {}", preview.replace('\n', " "));
            }
            Ok(resp) => {
                log::warn!("Telegram error status: {}", resp.status());
            }
            Err(e) => {
                log::warn!("Telegram send failed: {}", e);
            }
        }
    }

    // ── Convenience helpers ──────────────────────────────────────────────────

    pub async fn notify_start(&self, pair: &str, equity: f64) {
        let msg = format!(
            "🤖 <b>Engine started</b>\nPair: {pair} | Tick: 5m | Equity: <code>${equity:.2}</code>",
        );
        self.send(&msg).await;
    }

    pub async fn notify_trade_open(
        &self,
        pair: &str,
        side: Side,
        qty: f64,
        entry: f64,
        stop: f64,
    ) {
        let emoji = if side == Side::Long { "🟢" } else { "🔴" };
        let msg = format!(
            "{emoji} <b>Trade Opened — {side} {pair}</b>\n\
             Qty:   <code>{qty:.4}</code>\n\
             Entry: <code>{entry:.2}</code>\n\
             Stop:  <code>{stop:.2}</code>",
        );
        self.send(&msg).await;
    }

    pub async fn notify_partial_exit(
        &self,
        pair: &str,
        tier: u8,
        qty: f64,
        price: f64,
        remaining: f64,
    ) {
        let msg = format!(
            "🎯 <b>Tier {tier} filled — {pair}</b>\n\
             Sold:      <code>{qty:.4}</code> @ <code>{price:.2}</code>\n\
             Remaining: <code>{remaining:.4}</code>",
        );
        self.send(&msg).await;
    }

    pub async fn notify_trade_close(&self, trade: &Trade) {
        let emoji = if trade.realized_pnl >= 0.0 { "✅" } else { "❌" };
        let msg = format!(
            "{emoji} <b>Trade Closed — {} {}</b>\n\
             Entry: <code>{:.2}</code>  Exit: <code>{:.2}</code>\n\
             PnL:   <code>{:+.2} USDT ({:+.2}%)</code>\n\
             Reason: {}",
            trade.side,
            trade.pair,
            trade.entry_price,
            trade.avg_exit_price,
            trade.realized_pnl,
            trade.pnl_pct * 100.0,
            trade.exit_reason,
        );
        self.send(&msg).await;
    }

    pub async fn notify_circuit_breaker(&self, drawdown_pct: f64) {
        let msg = format!(
            "🛑 <b>Circuit breaker tripped</b>\n\
             Drawdown: <code>{:.2}%</code>\n\
             New entries halted until manual reset.",
            drawdown_pct * 100.0
        );
        self.send(&msg).await;
    }

    pub async fn notify_risk_alert(&self, message: &str) {
        let msg = format!("⚠️ <b>Risk Alert</b>\n{message}");
        self.send(&msg).await;
    }

    pub async fn notify_performance(&self, summary: &PerformanceSummary, equity: f64) {
        let sharpe = summary
            .sharpe_ratio
            .map(|v| format!("{:.2}", v))
            .unwrap_or_else(|| "n/a".into());
        let msg = format!(
            "📊 <b>Performance</b>\n\
             Trades: <code>{}</code>  WR: <code>{:.1}%</code>  PF: <code>{}</code>\n\
             Sharpe: <code>{}</code>  MaxDD: <code>{:.2}%</code>\n\
             PnL: <code>{:+.2}</code>  Equity: <code>${:.2}</code>",
            summary.total_trades,
            summary.win_rate * 100.0,
            summary.profit_factor,
            sharpe,
            summary.max_drawdown_pct * 100.0,
            summary.total_pnl,
            equity,
        );
        self.send(&msg).await;
    }
}
