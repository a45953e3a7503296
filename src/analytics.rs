//! Performance tracking: consumes closed trades and equity samples, keeps
//! running aggregates, and appends to a JSONL trade log. Metrics are pure
//! functions of the recorded history, so replaying the same history gives
//! identical numbers.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use serde::Serialize;

use crate::types::{EquityPoint, Trade};

const RISK_FREE_RATE: f64 = 0.02;
const PERIODS_PER_YEAR: f64 = 252.0;

/// Profit factor with its degenerate cases spelled out instead of hidden in
/// a float: no trades at all, or profits with zero losses.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub enum ProfitFactor {
    /// No losing trades and no winning trades.
    Undefined,
    /// Gross profit with zero gross loss.
    Infinite,
    Ratio(f64),
}

impl std::fmt::Display for ProfitFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProfitFactor::Undefined => write!(f, "n/a"),
            ProfitFactor::Infinite => write!(f, "inf"),
            ProfitFactor::Ratio(r) => write!(f, "{:.2}", r),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PerformanceSummary {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub profit_factor: ProfitFactor,
    pub sharpe_ratio: Option<f64>,
    pub max_drawdown_pct: f64,
    pub total_pnl: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub avg_duration_secs: f64,
    pub roi_pct: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct DailySummary {
    pub date: String,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
}

pub struct AnalyticsRecorder {
    initial_equity: f64,
    trades: Vec<Trade>,
    equity_curve: Vec<EquityPoint>,
    /// Append-only JSONL sink; `None` disables persistence.
    log_path: Option<PathBuf>,
}

impl AnalyticsRecorder {
    pub fn new(initial_equity: f64, log_path: Option<PathBuf>) -> Self {
        AnalyticsRecorder {
            initial_equity,
            trades: Vec::new(),
            equity_curve: Vec::new(),
            log_path,
        }
    }

    /// Record a closed trade and append it to the log. A failed write is
    /// logged and swallowed; persistence is not worth halting trading over.
    pub fn record_trade(&mut self, trade: Trade) {
        if let Some(path) = &self.log_path {
            match serde_json::to_string(&trade) {
                Ok(line) => {
                    let result = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .and_then(|mut f| writeln!(f, "{}", line));
                    if let Err(e) = result {
                        log::warn!("failed to append trade log {}: {}", path.display(), e);
                    }
                }
                Err(e) => log::warn!("failed to serialize trade: {}", e),
            }
        }
        self.trades.push(trade);
    }

    pub fn record_equity(&mut self, timestamp: i64, equity: f64) {
        self.equity_curve.push(EquityPoint { timestamp, equity });
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades.is_empty() {
            return 0.0;
        }
        let winners = self.trades.iter().filter(|t| t.realized_pnl > 0.0).count();
        winners as f64 / self.trades.len() as f64
    }

    pub fn profit_factor(&self) -> ProfitFactor {
        let gross_profit: f64 = self
            .trades
            .iter()
            .filter(|t| t.realized_pnl > 0.0)
            .map(|t| t.realized_pnl)
            .sum();
        let gross_loss: f64 = self
            .trades
            .iter()
            .filter(|t| t.realized_pnl < 0.0)
            .map(|t| -t.realized_pnl)
            .sum();
        if gross_loss == 0.0 {
            if gross_profit > 0.0 {
                ProfitFactor::Infinite
            } else {
                ProfitFactor::Undefined
            }
        } else {
            ProfitFactor::Ratio(gross_profit / gross_loss)
        }
    }

    /// Annualized Sharpe over per-trade returns; `None` below two trades or
    /// with zero variance.
    pub fn sharpe_ratio(&self) -> Option<f64> {
        if self.trades.len() < 2 {
            return None;
        }
        let returns: Vec<f64> = self.trades.iter().map(|t| t.pnl_pct).collect();
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        let std = variance.sqrt();
        if std == 0.0 {
            return None;
        }
        let excess = mean - RISK_FREE_RATE / PERIODS_PER_YEAR;
        Some(excess / std * PERIODS_PER_YEAR.sqrt())
    }

    /// Largest peak-to-trough fall of the recorded equity curve.
    pub fn max_drawdown(&self) -> f64 {
        if self.equity_curve.len() < 2 {
            return 0.0;
        }
        let mut peak = self.equity_curve[0].equity;
        let mut max_dd = 0.0_f64;
        for point in &self.equity_curve {
            if point.equity > peak {
                peak = point.equity;
            }
            let dd = (peak - point.equity) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
        max_dd
    }

    pub fn avg_trade_duration_secs(&self) -> f64 {
        if self.trades.is_empty() {
            return 0.0;
        }
        let total: i64 = self.trades.iter().map(|t| t.duration_secs()).sum();
        total as f64 / self.trades.len() as f64
    }

    pub fn summary(&self) -> PerformanceSummary {
        let winners: Vec<&Trade> = self.trades.iter().filter(|t| t.realized_pnl > 0.0).collect();
        let losers: Vec<&Trade> = self.trades.iter().filter(|t| t.realized_pnl <= 0.0).collect();
        let total_pnl: f64 = self.trades.iter().map(|t| t.realized_pnl).sum();
        let avg = |ts: &[&Trade]| {
            if ts.is_empty() {
                0.0
            } else {
                ts.iter().map(|t| t.realized_pnl).sum::<f64>() / ts.len() as f64
            }
        };
        PerformanceSummary {
            total_trades: self.trades.len(),
            winning_trades: winners.len(),
            losing_trades: losers.len(),
            win_rate: self.win_rate(),
            profit_factor: self.profit_factor(),
            sharpe_ratio: self.sharpe_ratio(),
            max_drawdown_pct: self.max_drawdown(),
            total_pnl,
            avg_win: avg(&winners),
            avg_loss: avg(&losers),
            avg_duration_secs: self.avg_trade_duration_secs(),
            roi_pct: if self.initial_equity > 0.0 {
                total_pnl / self.initial_equity
            } else {
                0.0
            },
        }
    }

    /// Trades whose exit landed on `date` (UTC, "YYYY-MM-DD"); `None` when
    /// the day had no closes.
    pub fn daily_summary(&self, date: &str) -> Option<DailySummary> {
        let daily: Vec<&Trade> = self
            .trades
            .iter()
            .filter(|t| {
                Utc.timestamp_opt(t.exit_time, 0)
                    .single()
                    .map(|dt| dt.format("%Y-%m-%d").to_string() == date)
                    .unwrap_or(false)
            })
            .collect();
        if daily.is_empty() {
            return None;
        }
        let total_pnl: f64 = daily.iter().map(|t| t.realized_pnl).sum();
        let winning = daily.iter().filter(|t| t.realized_pnl > 0.0).count();
        Some(DailySummary {
            date: date.to_string(),
            total_trades: daily.len(),
            winning_trades: winning,
            losing_trades: daily.len() - winning,
            win_rate: winning as f64 / daily.len() as f64,
            total_pnl,
            avg_pnl: total_pnl / daily.len() as f64,
        })
    }

    pub fn log_summary(&self) {
        if self.trades.is_empty() {
            log::info!("no trades recorded yet");
            return;
        }
        let s = self.summary();
        log::info!(
            "performance: trades={} win_rate={:.1}% pf={} sharpe={} max_dd={:.2}% pnl={:.2} roi={:.2}%",
            s.total_trades,
            s.win_rate * 100.0,
            s.profit_factor,
            s.sharpe_ratio
                .map(|v| format!("{:.2}", v))
                .unwrap_or_else(|| "n/a".into()),
            s.max_drawdown_pct * 100.0,
            s.total_pnl,
            s.roi_pct * 100.0
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitReason, Side};

    fn trade(pnl: f64, pnl_pct: f64, exit_time: i64) -> Trade {
        Trade {
            pair: "BTCUSDT".into(),
            side: Side::Long,
            entry_price: 60_000.0,
            avg_exit_price: 60_000.0 * (1.0 + pnl_pct),
            quantity: 1.0,
            entry_time: exit_time - 3_600,
            exit_time,
            realized_pnl: pnl,
            pnl_pct,
            exit_reason: ExitReason::ProfitTarget,
            tiers_filled: vec![1, 2, 3],
        }
    }

    #[test]
    fn win_rate_counts_only_positive_pnl() {
        let mut rec = AnalyticsRecorder::new(10_000.0, None);
        rec.record_trade(trade(100.0, 0.01, 1_700_000_000));
        rec.record_trade(trade(-50.0, -0.005, 1_700_003_600));
        rec.record_trade(trade(0.0, 0.0, 1_700_007_200));
        // Breakeven is not a win.
        assert!((rec.win_rate() - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn profit_factor_degenerate_cases_are_explicit() {
        let mut rec = AnalyticsRecorder::new(10_000.0, None);
        assert_eq!(rec.profit_factor(), ProfitFactor::Undefined);

        rec.record_trade(trade(100.0, 0.01, 1_700_000_000));
        assert_eq!(rec.profit_factor(), ProfitFactor::Infinite);

        rec.record_trade(trade(-50.0, -0.005, 1_700_003_600));
        match rec.profit_factor() {
            ProfitFactor::Ratio(r) => assert!((r - 2.0).abs() < 1e-12),
            other => panic!("expected ratio, got {other:?}"),
        }
    }

    #[test]
    fn sharpe_needs_two_trades_and_variance() {
        let mut rec = AnalyticsRecorder::new(10_000.0, None);
        assert!(rec.sharpe_ratio().is_none());

        rec.record_trade(trade(100.0, 0.01, 1_700_000_000));
        assert!(rec.sharpe_ratio().is_none());

        // Identical returns: zero variance, still undefined.
        rec.record_trade(trade(100.0, 0.01, 1_700_003_600));
        assert!(rec.sharpe_ratio().is_none());

        rec.record_trade(trade(-50.0, -0.005, 1_700_007_200));
        let sharpe = rec.sharpe_ratio().unwrap();
        assert!(sharpe.is_finite());
        assert!(sharpe > 0.0);
    }

    #[test]
    fn max_drawdown_tracks_running_peak() {
        let mut rec = AnalyticsRecorder::new(10_000.0, None);
        for (i, eq) in [10_000.0, 12_000.0, 9_000.0, 11_000.0, 10_500.0]
            .iter()
            .enumerate()
        {
            rec.record_equity(i as i64, *eq);
        }
        // Worst fall: 12000 → 9000.
        assert!((rec.max_drawdown() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn replaying_history_yields_identical_metrics() {
        let history = vec![
            trade(120.0, 0.012, 1_700_000_000),
            trade(-60.0, -0.006, 1_700_003_600),
            trade(80.0, 0.008, 1_700_007_200),
        ];
        let mut a = AnalyticsRecorder::new(10_000.0, None);
        let mut b = AnalyticsRecorder::new(10_000.0, None);
        for t in &history {
            a.record_trade(t.clone());
            b.record_trade(t.clone());
        }
        for (i, eq) in [10_000.0, 10_120.0, 10_060.0, 10_140.0].iter().enumerate() {
            a.record_equity(i as i64, *eq);
            b.record_equity(i as i64, *eq);
        }
        let sa = a.summary();
        let sb = b.summary();
        assert_eq!(sa.total_trades, sb.total_trades);
        assert_eq!(sa.win_rate, sb.win_rate);
        assert_eq!(sa.sharpe_ratio, sb.sharpe_ratio);
        assert_eq!(sa.max_drawdown_pct, sb.max_drawdown_pct);
        assert_eq!(sa.total_pnl, sb.total_pnl);
    }

    #[test]
    fn trade_log_appends_one_json_line_per_trade() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.jsonl");
        let mut rec = AnalyticsRecorder::new(10_000.0, Some(path.clone()));
        rec.record_trade(trade(100.0, 0.01, 1_700_000_000));
        rec.record_trade(trade(-50.0, -0.005, 1_700_003_600));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Trade = serde_json::from_str(lines[0]).unwrap();
        assert!((parsed.realized_pnl - 100.0).abs() < 1e-12);
    }

    #[test]
    fn daily_summary_groups_by_utc_exit_date() {
        let mut rec = AnalyticsRecorder::new(10_000.0, None);
        // 2023-11-14 and 2023-11-15 UTC.
        rec.record_trade(trade(100.0, 0.01, 1_699_999_200));
        rec.record_trade(trade(-30.0, -0.003, 1_700_000_400));
        rec.record_trade(trade(50.0, 0.005, 1_700_086_800));

        let day = rec.daily_summary("2023-11-14").unwrap();
        assert_eq!(day.total_trades, 2);
        assert_eq!(day.winning_trades, 1);
        assert!((day.total_pnl - 70.0).abs() < 1e-12);
        assert!(rec.daily_summary("2020-01-01").is_none());
    }
}
