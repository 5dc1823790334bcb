//! Cross-investor aggregation.
//!
//! Investor tasks return immutable partial results; this module folds them
//! single-threaded after the join barrier, so fund-wide totals and the
//! system-address table never need shared mutable state. All accumulator
//! arithmetic is checked: overflow means corrupt upstream data and aborts
//! the batch before anything is written.

use crate::amount::{checked_accum, Amount};
use crate::models::{DepositKind, Investor, LedgerTransaction};
use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Immutable per-investor result handed to the reduction.
#[derive(Debug, Clone)]
pub struct InvestorOutcome {
    pub investor: Investor,
    pub transactions: BTreeMap<String, LedgerTransaction>,
    pub system_addresses: HashMap<String, u64>,
}

/// One withdrawal-eligible ledger entry, resolved for audit output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WithdrawalRecord {
    pub requested_at: i64,
    pub btc_address: String,
    pub eth_address: String,
    /// "SYSTEM TX", "REFERRER", or the original deposit txid.
    pub label: String,
    pub balance: Amount,
    /// None while the payout is pending.
    pub paid_at: Option<i64>,
    /// Matched payout transaction, if correlation found one.
    pub payout_txid: Option<String>,
}

/// Fund-wide reduction output.
#[derive(Debug, Clone, Default)]
pub struct FundAggregate {
    pub total_deposited: Amount,
    pub total_withdrawn: Amount,
    pub total_withdrawn_referral: Amount,
    pub current_balance: Amount,
    pub current_referral: Amount,

    /// All withdrawal-eligible entries, request time descending.
    pub all_withdrawals: Vec<WithdrawalRecord>,
    /// Subset with no exit yet, same sort.
    pub pending_withdrawals: Vec<WithdrawalRecord>,
    /// Paid entries, exit time descending; the numeric sort key is not
    /// part of the emitted record shape.
    pub processed_withdrawals: Vec<WithdrawalRecord>,

    /// Treasury addresses by descending occurrence count.
    pub system_addresses: Vec<(String, u64)>,
    pub bitcoin_mapping: BTreeMap<String, String>,
    pub ethereum_mapping: BTreeMap<String, String>,

    pub investors_processed: usize,
    pub investors_failed: usize,
}

pub fn reduce(outcomes: &[InvestorOutcome], deposit_addresses: &[String]) -> Result<FundAggregate> {
    let mut agg = FundAggregate::default();

    // The fund's own deposit addresses are system addresses by definition.
    let mut system_addresses: HashMap<String, u64> = deposit_addresses
        .iter()
        .map(|a| (a.clone(), 1))
        .collect();

    // Pass 1: accumulators, mappings, system table. An account reachable
    // from several ethereum addresses folds once.
    let mut folded: Vec<&InvestorOutcome> = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        let investor = &outcome.investor;
        if agg.bitcoin_mapping.contains_key(&investor.btc_address) {
            debug!(btc = %investor.btc_address, "skipping already-folded account");
            continue;
        }
        agg.bitcoin_mapping
            .insert(investor.btc_address.clone(), investor.pubkey.clone());
        agg.ethereum_mapping
            .insert(investor.eth_address.to_lowercase(), investor.pubkey.clone());

        for tx in outcome.transactions.values() {
            let bucket = match (tx.is_open(), tx.kind) {
                (true, DepositKind::Referral) => &mut agg.current_referral,
                (true, DepositKind::Regular) => &mut agg.current_balance,
                (false, DepositKind::Referral) => &mut agg.total_withdrawn_referral,
                (false, DepositKind::Regular) => &mut agg.total_withdrawn,
            };
            checked_accum(bucket, tx.balance).map_err(anyhow::Error::new)?;
            checked_accum(&mut agg.total_deposited, tx.principal).map_err(anyhow::Error::new)?;
        }

        for (addr, count) in &outcome.system_addresses {
            *system_addresses.entry(addr.clone()).or_insert(0) += count;
        }

        folded.push(outcome);
    }

    // Pass 2: audit records, now that the system table is complete.
    for outcome in &folded {
        for tx in outcome.transactions.values() {
            let Some(requested_at) = tx.requested_exit else {
                continue;
            };
            let record = WithdrawalRecord {
                requested_at,
                btc_address: outcome.investor.btc_address.clone(),
                eth_address: outcome.investor.eth_address.to_lowercase(),
                label: resolve_label(tx, &outcome.investor, &system_addresses),
                balance: tx.balance,
                paid_at: tx.exit_timestamp,
                payout_txid: tx
                    .exit_timestamp
                    .and_then(|_| tx.withdrawal_match())
                    .map(|r| r.bitcoin_txid.clone()),
            };
            if record.paid_at.is_none() {
                agg.pending_withdrawals.push(record.clone());
            }
            agg.all_withdrawals.push(record);
        }
    }

    agg.all_withdrawals
        .sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
    agg.pending_withdrawals
        .sort_by(|a, b| b.requested_at.cmp(&a.requested_at));

    agg.processed_withdrawals = agg
        .all_withdrawals
        .iter()
        .filter(|r| r.paid_at.is_some())
        .cloned()
        .collect();
    agg.processed_withdrawals
        .sort_by(|a, b| b.paid_at.cmp(&a.paid_at));

    let mut system: Vec<(String, u64)> = system_addresses.into_iter().collect();
    system.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    agg.system_addresses = system;

    agg.investors_processed = folded.len();
    Ok(agg)
}

/// Label precedence: treasury-owned address, then referral credit, then
/// the original deposit txid.
fn resolve_label(
    tx: &LedgerTransaction,
    investor: &Investor,
    system_addresses: &HashMap<String, u64>,
) -> String {
    if system_addresses.contains_key(&investor.btc_address) {
        "SYSTEM TX".to_string()
    } else if tx.kind == DepositKind::Referral {
        "REFERRER".to_string()
    } else {
        tx.txid.clone()
    }
}
