//! Indicator computations over an ordered candle window.
//!
//! Everything here is a pure function of its input slice: no state survives
//! between calls, so a given window always reproduces the same snapshot.
//! Individual helpers return `None` on short input; `IndicatorSnapshot::compute`
//! is the strict entry point that turns short input into `DataUnavailable`.

use crate::config::Config;
use crate::error::EngineError;
use crate::types::{Candle, Regime};

const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;
const VOLUME_AVG_PERIOD: usize = 20;
const SR_CLUSTER_PCT: f64 = 0.002;

/// Simple moving average of close prices.
pub fn sma(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period || period == 0 {
        return None;
    }
    let sum: f64 = candles.iter().rev().take(period).map(|c| c.close).sum();
    Some(sum / period as f64)
}

/// Average True Range, SMA-smoothed over the trailing `period` true ranges.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period + 1 {
        return None;
    }
    let start = candles.len() - period - 1;
    let mut tr_sum = 0.0;
    for i in (start + 1)..candles.len() {
        let curr = &candles[i];
        let prev = &candles[i - 1];
        let tr = (curr.high - curr.low)
            .max((curr.high - prev.close).abs())
            .max((curr.low - prev.close).abs());
        tr_sum += tr;
    }
    Some(tr_sum / period as f64)
}

/// RSI with Wilder smoothing. 0..100; no losses → 100, no gains → 0,
/// no movement at all → 50.
pub fn rsi(candles: &[Candle], period: usize) -> Option<f64> {
    let n = candles.len();
    if n < period + 1 {
        return None;
    }

    let changes: Vec<f64> = (1..n)
        .map(|i| candles[i].close - candles[i - 1].close)
        .collect();

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for &ch in &changes[..period] {
        if ch > 0.0 {
            avg_gain += ch;
        } else {
            avg_loss -= ch;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    let alpha = 1.0 / period as f64;
    for &ch in &changes[period..] {
        let gain = if ch > 0.0 { ch } else { 0.0 };
        let loss = if ch < 0.0 { -ch } else { 0.0 };
        avg_gain = alpha * gain + (1.0 - alpha) * avg_gain;
        avg_loss = alpha * loss + (1.0 - alpha) * avg_loss;
    }

    Some(if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    })
}

/// EMA series seeded with the SMA of the first `period` values.
/// Entries before the seed index are NaN.
fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if n < period || period == 0 {
        return out;
    }
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = seed;
    let k = 2.0 / (period as f64 + 1.0);
    let mut prev = seed;
    for i in period..n {
        prev = values[i] * k + prev * (1.0 - k);
        out[i] = prev;
    }
    out
}

/// MACD(12, 26, 9): returns (macd line, signal line, histogram) at the latest
/// candle.
pub fn macd(candles: &[Candle]) -> Option<(f64, f64, f64)> {
    let n = candles.len();
    if n < MACD_SLOW + MACD_SIGNAL {
        return None;
    }
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let fast = ema_series(&closes, MACD_FAST);
    let slow = ema_series(&closes, MACD_SLOW);

    let macd_line: Vec<f64> = (MACD_SLOW - 1..n).map(|i| fast[i] - slow[i]).collect();
    let signal = ema_series(&macd_line, MACD_SIGNAL);

    let m = *macd_line.last()?;
    let s = *signal.last()?;
    if m.is_nan() || s.is_nan() {
        return None;
    }
    Some((m, s, m - s))
}

/// ADX (Wilder): smoothed ±DM/TR → DI → DX → ADX. Needs 2×period+1 candles.
pub fn adx(candles: &[Candle], period: usize) -> Option<f64> {
    let n = candles.len();
    if n < 2 * period + 1 {
        return None;
    }

    // Per-step TR and directional movement, defined from the second candle on.
    let steps = n - 1;
    let mut tr = vec![0.0; steps];
    let mut plus_dm = vec![0.0; steps];
    let mut minus_dm = vec![0.0; steps];
    for i in 1..n {
        let curr = &candles[i];
        let prev = &candles[i - 1];
        tr[i - 1] = (curr.high - curr.low)
            .max((curr.high - prev.close).abs())
            .max((curr.low - prev.close).abs());

        let up = curr.high - prev.high;
        let down = prev.low - curr.low;
        if up > down && up > 0.0 {
            plus_dm[i - 1] = up;
        }
        if down > up && down > 0.0 {
            minus_dm[i - 1] = down;
        }
    }

    // Wilder running sums seeded over the first `period` steps.
    let mut tr_s: f64 = tr[..period].iter().sum();
    let mut plus_s: f64 = plus_dm[..period].iter().sum();
    let mut minus_s: f64 = minus_dm[..period].iter().sum();

    let dx_at = |tr_s: f64, plus_s: f64, minus_s: f64| -> f64 {
        if tr_s == 0.0 {
            return 0.0;
        }
        let plus_di = 100.0 * plus_s / tr_s;
        let minus_di = 100.0 * minus_s / tr_s;
        let di_sum = plus_di + minus_di;
        if di_sum == 0.0 {
            0.0
        } else {
            100.0 * (plus_di - minus_di).abs() / di_sum
        }
    };

    let mut dx_values = vec![dx_at(tr_s, plus_s, minus_s)];
    for i in period..steps {
        tr_s = tr_s - tr_s / period as f64 + tr[i];
        plus_s = plus_s - plus_s / period as f64 + plus_dm[i];
        minus_s = minus_s - minus_s / period as f64 + minus_dm[i];
        dx_values.push(dx_at(tr_s, plus_s, minus_s));
    }

    if dx_values.len() < period {
        return None;
    }
    let mut adx: f64 = dx_values[..period].iter().sum::<f64>() / period as f64;
    for &dx in &dx_values[period..] {
        adx = (adx * (period as f64 - 1.0) + dx) / period as f64;
    }
    Some(adx)
}

/// Three-way regime label from ADX versus the configured threshold.
pub fn classify_regime(adx_value: Option<f64>, threshold: f64) -> Regime {
    match adx_value {
        Some(v) if v >= threshold => Regime::Trending,
        Some(v) if v <= threshold * 0.8 => Regime::Ranging,
        Some(_) => Regime::Indeterminate,
        None => Regime::Indeterminate,
    }
}

/// Support and resistance bands from local extrema over the trailing `window`
/// candles. A pivot is a low (high) strictly below (above) its two neighbors
/// on each side; nearby pivots are merged into one band.
pub fn support_resistance(candles: &[Candle], window: usize) -> (Vec<f64>, Vec<f64>) {
    let start = candles.len().saturating_sub(window);
    let slice = &candles[start..];
    let m = slice.len();
    let mut supports: Vec<f64> = Vec::new();
    let mut resistances: Vec<f64> = Vec::new();
    if m < 5 {
        return (supports, resistances);
    }

    for i in 2..m - 2 {
        let c = &slice[i];
        let is_pivot_low = c.low < slice[i - 1].low
            && c.low < slice[i - 2].low
            && c.low < slice[i + 1].low
            && c.low < slice[i + 2].low;
        if is_pivot_low {
            merge_level(&mut supports, c.low);
        }
        let is_pivot_high = c.high > slice[i - 1].high
            && c.high > slice[i - 2].high
            && c.high > slice[i + 1].high
            && c.high > slice[i + 2].high;
        if is_pivot_high {
            merge_level(&mut resistances, c.high);
        }
    }

    supports.sort_by(|a, b| a.total_cmp(b));
    resistances.sort_by(|a, b| a.total_cmp(b));
    (supports, resistances)
}

fn merge_level(levels: &mut Vec<f64>, price: f64) {
    for level in levels.iter_mut() {
        if ((*level - price) / price).abs() < SR_CLUSTER_PCT {
            *level = (*level + price) / 2.0;
            return;
        }
    }
    levels.push(price);
}

/// +1 near a support band (bounce zone), -1 near resistance, 0 otherwise.
pub fn near_support_resistance(
    price: f64,
    supports: &[f64],
    resistances: &[f64],
    proximity_pct: f64,
) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    if supports
        .iter()
        .any(|&s| ((price - s) / price).abs() <= proximity_pct)
    {
        return 1.0;
    }
    if resistances
        .iter()
        .any(|&r| ((price - r) / price).abs() <= proximity_pct)
    {
        return -1.0;
    }
    0.0
}

/// Rolling volume average versus the current candle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VolumeStats {
    pub average: f64,
    pub current: f64,
    pub spike: bool,
}

pub fn volume_stats(candles: &[Candle], spike_mult: f64) -> VolumeStats {
    let current = candles.last().map(|c| c.volume).unwrap_or(0.0);
    // Average excludes the current candle so a spike compares against history.
    let prior = &candles[..candles.len().saturating_sub(1)];
    let n = prior.len().min(VOLUME_AVG_PERIOD);
    let average = if n == 0 {
        0.0
    } else {
        prior.iter().rev().take(n).map(|c| c.volume).sum::<f64>() / n as f64
    };
    VolumeStats {
        average,
        current,
        spike: average > 0.0 && current > average * spike_mult,
    }
}

/// Candlestick pattern score over the last two candles, collapsed to
/// {-1, 0, 1}. Marubozu, hammer/shooting star, engulfing, and
/// piercing/dark-cloud all contribute before the final cut-off.
pub fn candlestick_signal(candles: &[Candle]) -> f64 {
    let Some(current) = candles.last() else {
        return 0.0;
    };
    let mut score = 0.0;
    let range = current.total_range();

    // Marubozu: body dominates the range, high conviction.
    if range > 0.0 && current.body() / range > 0.8 {
        score += if current.is_bullish() { 1.0 } else { -1.0 };
    }

    // Hammer (long lower wick) / shooting star (long upper wick).
    if current.upper_wick() > 0.0
        && current.lower_wick() > 2.0 * current.upper_wick()
        && current.body() < 0.3 * range
    {
        score += 1.0;
    } else if current.lower_wick() > 0.0
        && current.upper_wick() > 2.0 * current.lower_wick()
        && current.body() < 0.3 * range
    {
        score -= 1.0;
    }

    if current.is_bullish() {
        score += 0.5;
    } else if current.is_bearish() {
        score -= 0.5;
    }

    if candles.len() >= 2 {
        let previous = &candles[candles.len() - 2];
        let prev_mid = (previous.open + previous.close) / 2.0;

        if previous.is_bearish()
            && current.is_bullish()
            && current.close > previous.open
            && current.open < previous.close
        {
            score += 1.5; // bullish engulfing
        } else if previous.is_bullish()
            && current.is_bearish()
            && current.close < previous.open
            && current.open > previous.close
        {
            score -= 1.5; // bearish engulfing
        } else if previous.is_bearish()
            && current.is_bullish()
            && current.close > prev_mid
            && current.open < previous.close
        {
            score += 1.0; // piercing line
        } else if previous.is_bullish()
            && current.is_bearish()
            && current.close < prev_mid
            && current.open > previous.close
        {
            score -= 1.0; // dark cloud cover
        }
    }

    if score >= 1.0 {
        1.0
    } else if score <= -1.0 {
        -1.0
    } else {
        0.0
    }
}

/// Higher-timeframe trend from the latest trend-TF candle: a body covering
/// more than half the range signals conviction in that direction.
pub fn higher_tf_trend(candles: &[Candle]) -> i8 {
    let Some(last) = candles.last() else {
        return 0;
    };
    let range = last.total_range();
    if range <= 0.0 {
        return 0;
    }
    if last.is_bullish() && last.body() / range > 0.5 {
        1
    } else if last.is_bearish() && last.body() / range > 0.5 {
        -1
    } else {
        0
    }
}

/// Derived values for one tick, recomputed from scratch every cycle.
#[derive(Clone, Debug)]
pub struct IndicatorSnapshot {
    pub price: f64,
    pub sma: f64,
    pub atr: f64,
    pub rsi: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_hist: f64,
    pub adx: f64,
    pub regime: Regime,
    pub supports: Vec<f64>,
    pub resistances: Vec<f64>,
    pub volume: VolumeStats,
    pub candle_signal: f64,
    pub higher_tf_trend: i8,
}

impl IndicatorSnapshot {
    /// Strict computation: fails with `DataUnavailable` rather than degrading
    /// when either window is shorter than the configured minimum.
    pub fn compute(
        primary: &[Candle],
        trend: &[Candle],
        cfg: &Config,
    ) -> Result<IndicatorSnapshot, EngineError> {
        if primary.len() < cfg.min_candles {
            return Err(EngineError::DataUnavailable {
                needed: cfg.min_candles,
                have: primary.len(),
            });
        }
        if trend.len() < cfg.min_trend_candles {
            return Err(EngineError::DataUnavailable {
                needed: cfg.min_trend_candles,
                have: trend.len(),
            });
        }

        let unavailable = || EngineError::DataUnavailable {
            needed: cfg.min_candles,
            have: primary.len(),
        };

        let price = primary.last().ok_or_else(unavailable)?.close;
        let sma = sma(primary, cfg.sma_period).ok_or_else(unavailable)?;
        let atr = atr(primary, cfg.atr_period).ok_or_else(unavailable)?;
        let rsi = rsi(primary, cfg.rsi_period).ok_or_else(unavailable)?;
        let (macd, macd_signal, macd_hist) = macd(primary).ok_or_else(unavailable)?;
        let adx_value = adx(primary, cfg.adx_period);
        let regime = classify_regime(adx_value, cfg.adx_trend_threshold);
        let (supports, resistances) = support_resistance(primary, cfg.sr_window);
        let volume = volume_stats(primary, cfg.volume_spike_mult);

        Ok(IndicatorSnapshot {
            price,
            sma,
            atr,
            rsi,
            macd,
            macd_signal,
            macd_hist,
            adx: adx_value.unwrap_or(0.0),
            regime,
            supports,
            resistances,
            volume,
            candle_signal: candlestick_signal(primary),
            higher_tf_trend: higher_tf_trend(trend),
        })
    }
}
