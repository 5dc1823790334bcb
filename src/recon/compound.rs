//! Interest compounding.
//!
//! Pure function of (transaction times, performance sequence, fee share).
//! Deterministic and replay-safe: recomputing a closed transaction against
//! the append-only index always yields the same multiplier and fee.

use crate::amount::{FeeShare, Rate, RATE_ONE};
use crate::models::{DepositKind, LedgerTransaction, PerformanceEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accrual {
    /// Final compounded multiplier.
    pub interest: Rate,
    /// Accumulated performance-fee fraction, grossed up per entry.
    pub fee: Rate,
    /// Time of the last entry applied.
    pub last_interest: Option<i64>,
}

/// Walk the performance index over one transaction's holding window.
/// Entries before the deposit are skipped; the walk stops entirely at the
/// first entry past the exit (closed transactions never accrue post-exit).
pub fn accrue(
    deposit_time: i64,
    exit_timestamp: Option<i64>,
    kind: DepositKind,
    index: &[PerformanceEntry],
    fee_share: FeeShare,
) -> Accrual {
    let mut interest = RATE_ONE;
    let mut fee: Rate = 0;
    let mut last_interest = None;

    for entry in index {
        if exit_timestamp.is_some_and(|exit| entry.time > exit) {
            break;
        }
        if entry.time < deposit_time {
            continue;
        }

        last_interest = Some(entry.time);
        let next = crate::amount::apply_percent(interest, entry.value);
        if entry.value > 0 {
            // Index values are net of the performance fee; gross the
            // delta back up to extract the fee share.
            fee += fee_share.gross_up(next - interest);
        }
        interest = next;
    }

    if kind == DepositKind::Referral {
        fee = 0;
    }

    Accrual {
        interest,
        fee,
        last_interest,
    }
}

/// Enrich a transaction in place.
pub fn apply(tx: &mut LedgerTransaction, index: &[PerformanceEntry], fee_share: FeeShare) {
    let accrual = accrue(tx.time, tx.exit_timestamp, tx.kind, index, fee_share);
    tx.interest = accrual.interest;
    tx.fee = accrual.fee;
    tx.last_interest = accrual.last_interest;
}
