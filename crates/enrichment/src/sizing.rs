use common::{round_to, Error, InstrumentClass, Result};

/// Upper bound on any computed order size, in lots.
pub const MAX_LOTS: f64 = 100.0;

/// Fixed-mode size: the configured constant at lot precision.
pub fn fixed_lots(lots: f64) -> f64 {
    round_to(lots, 2)
}

/// Inputs of the percent-of-balance formula.
#[derive(Debug, Clone, Copy)]
pub struct BalanceRisk {
    pub balance: f64,
    pub leverage: f64,
    pub risk_percent: f64,
    pub reference_price: f64,
    pub contract_multiplier: f64,
    /// Smallest volume the venue accepts for the instrument.
    pub instrument_min_lot: f64,
}

impl BalanceRisk {
    pub fn contract_multiplier_for(symbol: &str) -> f64 {
        InstrumentClass::of(symbol).contract_multiplier()
    }
}

/// `(balance × leverage × risk%/100) / (price × contract multiplier)`,
/// clamped to `[instrument_min_lot, MAX_LOTS]` and rounded to 2 decimals.
pub fn percent_of_balance_lots(input: &BalanceRisk) -> Result<f64> {
    if !(input.balance > 0.0) {
        return Err(Error::Other(format!("unusable balance {}", input.balance)));
    }
    if !(input.reference_price > 0.0) || !(input.contract_multiplier > 0.0) {
        return Err(Error::Other(format!(
            "unusable price {} x multiplier {}",
            input.reference_price, input.contract_multiplier
        )));
    }
    let notional_risk = input.balance * input.leverage * input.risk_percent / 100.0;
    let raw = notional_risk / (input.reference_price * input.contract_multiplier);
    let floor = input.instrument_min_lot.clamp(0.0, MAX_LOTS);
    Ok(round_to(raw.clamp(floor, MAX_LOTS), 2))
}
