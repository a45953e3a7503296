#[cfg(feature = "jemalloc")]
use tikv_jemallocator::Jemalloc;
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;

use fusion_trader::config::Config;
use fusion_trader::engine::Engine;
use fusion_trader::kraken_api::KrakenClient;
use fusion_trader::telegram::TelegramBot;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // A bad config is fatal at startup, never discovered mid-tick.
    let cfg = Config::default();
    cfg.validate()?;

    let kraken = KrakenClient::from_env("BTC", "USDT")?;
    let telegram = TelegramBot::from_env();
    if telegram.is_none() {
        log::info!("Telegram not configured; running without notifications");
    }

    let initial_equity = kraken.fetch_equity().await?;
    log::info!("[{}] starting equity: {:.2} USDT", cfg.pair, initial_equity);

    let trade_log = PathBuf::from(
        std::env::var("TRADE_LOG_PATH").unwrap_or_else(|_| "trades.jsonl".to_string()),
    );

    let engine = Engine::new(
        cfg,
        kraken.clone(),
        kraken.clone(),
        kraken,
        telegram,
        initial_equity,
        Some(trade_log),
    )?;

    // Ctrl-C requests shutdown; the engine finishes its in-flight tick first.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown requested; finishing current tick");
            let _ = shutdown_tx.send(true);
        }
    });

    engine.run(shutdown_rx).await;
    Ok(())
}
