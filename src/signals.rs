//! Signal fusion: named directional sources folded into one composite score.
//!
//! Each source yields a value in [-1, 1] (most are exactly -1/0/+1). Sources
//! are aggregated by membership, not by position: the composite is the sum of
//! every source flagged `in_composite`, so new sources slot in without
//! touching the fusion logic. The higher-timeframe trend and the 24h-extreme
//! proximity stay out of the composite — the former gates alignment, the
//! latter is a standalone warning filter.

use crate::config::Config;
use crate::indicators::{near_support_resistance, IndicatorSnapshot};
use crate::types::{OrderBookView, Regime, Side, TickerView};

pub const SRC_CANDLE: &str = "candle";
pub const SRC_HT_TREND: &str = "ht_trend";
pub const SRC_RSI: &str = "rsi";
pub const SRC_MACD: &str = "macd";
pub const SRC_SMA_POS: &str = "sma_pos";
pub const SRC_SR: &str = "sr";
pub const SRC_BOOK_SPREAD: &str = "book_spread";
pub const SRC_VOLUME: &str = "volume";
pub const SRC_DEPTH: &str = "depth";
pub const SRC_RANGE_EDGE: &str = "range_edge";
pub const SRC_REGIME: &str = "regime";

/// A wide spread (above this fraction of the bid) reads as thin liquidity.
const MAX_TIGHT_SPREAD_PCT: f64 = 0.001;
/// Depth imbalance must exceed this ratio before it counts.
const DEPTH_IMBALANCE_RATIO: f64 = 1.2;
/// Proximity to the 24h high/low that triggers the range-edge warning.
const RANGE_EDGE_PROXIMITY: f64 = 0.005;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SignalSource {
    pub name: &'static str,
    pub value: f64,
    pub in_composite: bool,
}

/// Fused per-tick decision input.
#[derive(Clone, Debug)]
pub struct SignalVector {
    pub sources: Vec<SignalSource>,
    pub composite_score: f64,
    /// Primary proposal sign agrees with the higher timeframe. A neutral
    /// higher timeframe never aligns.
    pub trend_aligned: bool,
    /// Direction implied by the composite, before the alignment veto.
    pub proposal: Option<Side>,
}

impl SignalVector {
    pub fn source(&self, name: &str) -> Option<f64> {
        self.sources
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.value)
    }

    /// The admitted entry direction: threshold crossed AND timeframes agree.
    /// A composite of exactly zero, or any timeframe disagreement, yields
    /// `None` — the deliberate bias toward sitting out.
    pub fn entry_direction(&self) -> Option<Side> {
        if self.trend_aligned {
            self.proposal
        } else {
            None
        }
    }
}

/// Combine all sources for one tick. Order book and ticker views are optional
/// collaborators: when absent their sources contribute zero.
pub fn fuse(
    snapshot: &IndicatorSnapshot,
    book: Option<&OrderBookView>,
    ticker: Option<&TickerView>,
    cfg: &Config,
) -> SignalVector {
    let mut sources = Vec::with_capacity(11);
    let mut push = |name: &'static str, value: f64, in_composite: bool| {
        sources.push(SignalSource {
            name,
            value,
            in_composite,
        });
    };

    // Candlestick patterns on the primary timeframe.
    push(SRC_CANDLE, snapshot.candle_signal, true);

    // Higher-timeframe trend: drives alignment, not the composite.
    push(SRC_HT_TREND, snapshot.higher_tf_trend as f64, false);

    // RSI zones: hard at 30/70, soft lean at 45/55.
    let rsi_value = if snapshot.rsi < 30.0 {
        1.0
    } else if snapshot.rsi > 70.0 {
        -1.0
    } else if snapshot.rsi < 45.0 {
        0.5
    } else if snapshot.rsi > 55.0 {
        -0.5
    } else {
        0.0
    };
    push(SRC_RSI, rsi_value, true);

    // MACD histogram sign.
    let macd_value = if snapshot.macd_hist > 0.0 {
        1.0
    } else if snapshot.macd_hist < 0.0 {
        -1.0
    } else {
        0.0
    };
    push(SRC_MACD, macd_value, true);

    // Price relative to the SMA.
    let sma_value = if snapshot.price > snapshot.sma {
        1.0
    } else if snapshot.price < snapshot.sma {
        -1.0
    } else {
        0.0
    };
    push(SRC_SMA_POS, sma_value, true);

    // Support/resistance proximity.
    push(
        SRC_SR,
        near_support_resistance(
            snapshot.price,
            &snapshot.supports,
            &snapshot.resistances,
            cfg.sr_proximity_pct,
        ),
        true,
    );

    // Order-book spread: tight is constructive, wide reads bearish.
    let spread_value = match book {
        Some(b) if b.best_ask > b.best_bid && b.best_bid > 0.0 => {
            if (b.best_ask - b.best_bid) / b.best_bid < MAX_TIGHT_SPREAD_PCT {
                1.0
            } else {
                -1.0
            }
        }
        _ => 0.0,
    };
    push(SRC_BOOK_SPREAD, spread_value, true);

    // Volume spike confirms the current candle's direction.
    let volume_value = if snapshot.volume.spike {
        snapshot.candle_direction()
    } else {
        0.0
    };
    push(SRC_VOLUME, volume_value, true);

    // Depth-of-market imbalance.
    let depth_value = match book {
        Some(b) if b.bid_depth > b.ask_depth * DEPTH_IMBALANCE_RATIO => 1.0,
        Some(b) if b.ask_depth > b.bid_depth * DEPTH_IMBALANCE_RATIO => -1.0,
        _ => 0.0,
    };
    push(SRC_DEPTH, depth_value, true);

    // Proximity to the 24h extremes: a warning filter, outside the composite.
    let range_edge_value = match ticker {
        Some(t) if t.high_24h > 0.0 && snapshot.price >= t.high_24h * (1.0 - RANGE_EDGE_PROXIMITY) => {
            -1.0
        }
        Some(t) if t.low_24h > 0.0 && snapshot.price <= t.low_24h * (1.0 + RANGE_EDGE_PROXIMITY) => {
            1.0
        }
        _ => 0.0,
    };
    push(SRC_RANGE_EDGE, range_edge_value, false);

    // Regime: in a trending market, lean half a point with the MACD.
    let regime_value = if snapshot.regime == Regime::Trending {
        0.5 * macd_value
    } else {
        0.0
    };
    push(SRC_REGIME, regime_value, true);

    let composite_score: f64 = sources
        .iter()
        .filter(|s| s.in_composite)
        .map(|s| s.value)
        .sum();

    let proposal = if composite_score >= cfg.entry_threshold {
        Some(Side::Long)
    } else if composite_score <= -cfg.entry_threshold {
        Some(Side::Short)
    } else {
        None
    };

    let trend_aligned = match proposal {
        Some(Side::Long) => snapshot.higher_tf_trend > 0,
        Some(Side::Short) => snapshot.higher_tf_trend < 0,
        None => false,
    };

    SignalVector {
        sources,
        composite_score,
        trend_aligned,
        proposal,
    }
}

impl IndicatorSnapshot {
    /// Direction of the latest primary candle reading: +1 bullish, -1 bearish.
    /// Reuses the collapsed pattern score so volume confirmation and pattern
    /// reading cannot disagree.
    fn candle_direction(&self) -> f64 {
        if self.candle_signal > 0.0 {
            1.0
        } else if self.candle_signal < 0.0 {
            -1.0
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::VolumeStats;

    fn snapshot(price: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            price,
            sma: price,
            atr: 100.0,
            rsi: 50.0,
            macd: 0.0,
            macd_signal: 0.0,
            macd_hist: 0.0,
            adx: 10.0,
            regime: Regime::Ranging,
            supports: vec![],
            resistances: vec![],
            volume: VolumeStats {
                average: 100.0,
                current: 100.0,
                spike: false,
            },
            candle_signal: 0.0,
            higher_tf_trend: 0,
        }
    }

    fn bullish_snapshot() -> IndicatorSnapshot {
        let mut s = snapshot(50_000.0);
        s.candle_signal = 1.0;
        s.rsi = 25.0; // oversold → +1
        s.macd_hist = 4.0; // +1
        s.sma = 49_000.0; // price above SMA → +1
        s.higher_tf_trend = 1;
        s
    }

    #[test]
    fn neutral_inputs_score_zero_and_never_enter() {
        let cfg = Config::default();
        let v = fuse(&snapshot(50_000.0), None, None, &cfg);
        assert_eq!(v.composite_score, 0.0);
        assert_eq!(v.proposal, None);
        assert!(!v.trend_aligned);
        assert_eq!(v.entry_direction(), None);
    }

    #[test]
    fn eleven_named_sources_present() {
        let cfg = Config::default();
        let v = fuse(&snapshot(50_000.0), None, None, &cfg);
        assert_eq!(v.sources.len(), 11);
        for name in [
            SRC_CANDLE,
            SRC_HT_TREND,
            SRC_RSI,
            SRC_MACD,
            SRC_SMA_POS,
            SRC_SR,
            SRC_BOOK_SPREAD,
            SRC_VOLUME,
            SRC_DEPTH,
            SRC_RANGE_EDGE,
            SRC_REGIME,
        ] {
            assert!(v.source(name).is_some(), "missing source {name}");
        }
    }

    #[test]
    fn aligned_bullish_inputs_propose_long() {
        let cfg = Config::default();
        let v = fuse(&bullish_snapshot(), None, None, &cfg);
        assert!(v.composite_score >= cfg.entry_threshold);
        assert_eq!(v.proposal, Some(Side::Long));
        assert!(v.trend_aligned);
        assert_eq!(v.entry_direction(), Some(Side::Long));
    }

    #[test]
    fn timeframe_disagreement_vetoes_entry() {
        let cfg = Config::default();
        let mut s = bullish_snapshot();
        s.higher_tf_trend = -1; // strong score, opposing higher timeframe
        let v = fuse(&s, None, None, &cfg);
        assert_eq!(v.proposal, Some(Side::Long));
        assert!(!v.trend_aligned);
        assert_eq!(v.entry_direction(), None);
    }

    #[test]
    fn neutral_higher_timeframe_vetoes_entry() {
        let cfg = Config::default();
        let mut s = bullish_snapshot();
        s.higher_tf_trend = 0;
        let v = fuse(&s, None, None, &cfg);
        assert_eq!(v.entry_direction(), None);
    }

    #[test]
    fn ht_trend_and_range_edge_stay_out_of_composite() {
        let cfg = Config::default();
        let mut s = snapshot(50_000.0);
        s.higher_tf_trend = 1;
        let ticker = TickerView {
            last_price: 50_000.0,
            high_24h: 50_000.0, // at the 24h high → range_edge = -1
            low_24h: 40_000.0,
        };
        let v = fuse(&s, None, Some(&ticker), &cfg);
        assert_eq!(v.source(SRC_HT_TREND), Some(1.0));
        assert_eq!(v.source(SRC_RANGE_EDGE), Some(-1.0));
        assert_eq!(v.composite_score, 0.0);
    }

    #[test]
    fn order_book_sources_contribute() {
        let cfg = Config::default();
        let book = OrderBookView {
            best_bid: 50_000.0,
            best_ask: 50_010.0, // 0.02% spread → tight
            bid_depth: 130.0,
            ask_depth: 100.0, // 1.3x imbalance toward bids
        };
        let v = fuse(&snapshot(50_000.0), Some(&book), None, &cfg);
        assert_eq!(v.source(SRC_BOOK_SPREAD), Some(1.0));
        assert_eq!(v.source(SRC_DEPTH), Some(1.0));
        assert_eq!(v.composite_score, 2.0);
    }

    #[test]
    fn volume_spike_confirms_candle_direction() {
        let cfg = Config::default();
        let mut s = snapshot(50_000.0);
        s.volume.spike = true;
        s.candle_signal = -1.0;
        let v = fuse(&s, None, None, &cfg);
        assert_eq!(v.source(SRC_VOLUME), Some(-1.0));
    }

    #[test]
    fn regime_leans_with_macd_only_when_trending() {
        let cfg = Config::default();
        let mut s = snapshot(50_000.0);
        s.macd_hist = 2.0;
        s.regime = Regime::Trending;
        let v = fuse(&s, None, None, &cfg);
        assert_eq!(v.source(SRC_REGIME), Some(0.5));

        s.regime = Regime::Ranging;
        let v = fuse(&s, None, None, &cfg);
        assert_eq!(v.source(SRC_REGIME), Some(0.0));
    }

    #[test]
    fn bearish_composite_proposes_short_when_aligned() {
        let cfg = Config::default();
        let mut s = snapshot(50_000.0);
        s.candle_signal = -1.0;
        s.rsi = 75.0; // overbought → -1
        s.macd_hist = -3.0;
        s.sma = 51_000.0; // price below SMA
        s.higher_tf_trend = -1;
        let v = fuse(&s, None, None, &cfg);
        assert!(v.composite_score <= -cfg.entry_threshold);
        assert_eq!(v.entry_direction(), Some(Side::Short));
    }
}
