use common::{round_to, Error, InstrumentClass, Position, Result, SymbolInfo, Tick};
use policy::ProtectionPolicy;

/// Stop-loss and take-profit prices. `0.0` means unset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Levels {
    pub sl: f64,
    pub tp: f64,
}

impl Levels {
    pub fn of(position: &Position) -> Self {
        Self {
            sl: position.sl,
            tp: position.tp,
        }
    }
}

/// Price distance of one pip: one point for metals and crypto, ten points
/// for currency pairs.
pub fn pip_value(symbol: &str, point: f64) -> f64 {
    point * InstrumentClass::of(symbol).points_per_pip()
}

/// Everything the level computation reads from the venue.
#[derive(Debug, Clone, Copy)]
pub struct MarketContext<'a> {
    pub symbol: &'a SymbolInfo,
    pub tick: Tick,
    /// Account balance; only read by the percent-of-balance mode.
    pub balance: f64,
}

/// Compute the protective levels `position` should carry.
///
/// The stop never moves against the position: if the position already has a
/// stop and the computed one is looser, the current stop is kept. Results are
/// rounded to the symbol's price precision.
pub fn target_levels(
    policy: &ProtectionPolicy,
    position: &Position,
    market: &MarketContext<'_>,
) -> Result<Levels> {
    let entry = position.open_price;
    let sign = position.side.sign();
    let current = market.tick.exit_price(position.side);
    let info = market.symbol;

    let (mut sl, tp) = match *policy {
        ProtectionPolicy::FixedPips {
            sl_pips,
            tp_pips,
            trailing,
        } => {
            let pip = pip_value(&position.symbol, info.point);
            if !(pip > 0.0) {
                return Err(market_fault(position, "point size unavailable"));
            }
            let mut sl = entry - sign * sl_pips * pip;
            let tp = entry + sign * tp_pips * pip;
            if let Some(trailing) = trailing {
                let profit_pips = sign * (current - entry) / pip;
                if profit_pips >= trailing.activate_at_pips {
                    let lock = entry + sign * trailing.lock_pips * pip;
                    sl = tighter(sl, lock, sign);
                }
            }
            (sl, tp)
        }
        ProtectionPolicy::PercentBalance {
            sl_percent,
            tp_percent,
            breakeven_at,
        } => {
            let per_point = info.tick_value * position.volume;
            if !(per_point > 0.0) || !(info.point > 0.0) {
                return Err(market_fault(position, "tick value unavailable"));
            }
            if !(market.balance > 0.0) {
                return Err(market_fault(position, "balance unavailable"));
            }
            let risk = market.balance * sl_percent / 100.0;
            let reward = market.balance * tp_percent / 100.0;
            let mut sl = entry - sign * risk / per_point * info.point;
            let tp = entry + sign * reward / per_point * info.point;
            // A target at the entry has no progress to measure.
            let span = tp - entry;
            if let Some(threshold) = breakeven_at.filter(|_| span != 0.0) {
                if (current - entry) / span >= threshold {
                    sl = tighter(sl, entry, sign);
                }
            }
            (sl, tp)
        }
    };

    if position.sl != 0.0 {
        sl = tighter(sl, position.sl, sign);
    }

    Ok(Levels {
        sl: round_to(sl, info.digits),
        tp: round_to(tp, info.digits),
    })
}

/// True if either level moved by more than `noop_ticks` points.
pub fn needs_update(current: Levels, target: Levels, point: f64, noop_ticks: u32) -> bool {
    let tolerance = point * f64::from(noop_ticks);
    (target.sl - current.sl).abs() > tolerance || (target.tp - current.tp).abs() > tolerance
}

/// The more risk-reducing of two stops for a position with direction `sign`.
fn tighter(a: f64, b: f64, sign: f64) -> f64 {
    if sign * (b - a) > 0.0 {
        b
    } else {
        a
    }
}

fn market_fault(position: &Position, reason: &str) -> Error {
    Error::MarketData {
        symbol: position.symbol.clone(),
        reason: reason.to_string(),
    }
}
