//! Fixed-point monetary arithmetic.
//!
//! All balances are satoshis (`Amount`, i128) and all multipliers are
//! 1e8-scaled rates (`Rate`, i128) from ingestion to reduction. Floating
//! point only appears at the report-formatting boundary, so the corruption
//! guard is checked integer arithmetic instead of NaN propagation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Satoshi amount. 1 BTC = 100_000_000 units.
pub type Amount = i128;

/// Conversion factor between BTC and satoshis.
pub const SATS_PER_BTC: i128 = 100_000_000;

/// 1e8-scaled multiplier (interest, fee fractions).
pub type Rate = i128;

/// Scale of `Rate`: a multiplier of 1.0.
pub const RATE_ONE: i128 = 100_000_000;

/// Performance index values arrive as percent * 1e8, so applying one
/// means dividing by 100 * 1e8.
const PCT_DENOM: i128 = 100 * RATE_ONE;

/// Fatal data-corruption marker. Surfacing one of these aborts the whole
/// batch before any report file is written.
#[derive(Debug)]
pub struct DataCorruption(pub String);

impl fmt::Display for DataCorruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data corruption: {}", self.0)
    }
}

impl std::error::Error for DataCorruption {}

/// Exact rational fee share (e.g. 2/10 for a 20% referral share).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeShare {
    pub numerator: u32,
    pub denominator: u32,
}

impl FeeShare {
    pub fn new(numerator: u32, denominator: u32) -> anyhow::Result<Self> {
        if denominator == 0 || numerator >= denominator {
            anyhow::bail!("invalid fee share {}/{}", numerator, denominator);
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    /// Gross-up increment: delta / (1 - share) * share == delta * n / (d - n).
    pub fn gross_up(&self, delta: Rate) -> Rate {
        mul_div_round(
            delta,
            self.numerator as i128,
            (self.denominator - self.numerator) as i128,
        )
    }

    /// Plain share of a value: v * n / d.
    pub fn share_of(&self, value: Amount) -> Amount {
        mul_div_round(value, self.numerator as i128, self.denominator as i128)
    }
}

/// a * b / d with round-half-away-from-zero. Intermediate products fit
/// i128 comfortably: amounts are bounded by total coin supply (~2.1e15
/// sats) and rates stay within a few orders of magnitude of 1e8.
pub fn mul_div_round(a: i128, b: i128, d: i128) -> i128 {
    debug_assert!(d > 0);
    let p = a * b;
    if p >= 0 {
        (p + d / 2) / d
    } else {
        (p - d / 2) / d
    }
}

/// Compound one performance entry into a multiplier.
/// `pct_fp8` is percent * 1e8 as served by the performance index.
pub fn apply_percent(rate: Rate, pct_fp8: i64) -> Rate {
    mul_div_round(rate, PCT_DENOM + pct_fp8 as i128, PCT_DENOM)
}

/// Scale an amount by a multiplier.
pub fn apply_rate(amount: Amount, rate: Rate) -> Amount {
    mul_div_round(amount, rate, RATE_ONE)
}

/// Accumulate with overflow treated as corrupt upstream data.
pub fn checked_accum(acc: &mut Amount, v: Amount) -> Result<(), DataCorruption> {
    match acc.checked_add(v) {
        Some(next) => {
            *acc = next;
            Ok(())
        }
        None => Err(DataCorruption(format!(
            "accumulator overflow adding {v} to {acc}"
        ))),
    }
}

/// Convert a decimal BTC value (as found in external JSON) to satoshis.
/// Non-finite input is corrupt, never silently zero.
pub fn from_btc(value: f64) -> Result<Amount, DataCorruption> {
    if !value.is_finite() {
        return Err(DataCorruption(format!("non-finite BTC value {value}")));
    }
    Ok((value * SATS_PER_BTC as f64).round() as Amount)
}

/// 8-decimal BTC string for report output.
pub fn format_btc(amount: Amount) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!(
        "{}{}.{:08}",
        sign,
        abs / SATS_PER_BTC as u128,
        abs % SATS_PER_BTC as u128
    )
}
