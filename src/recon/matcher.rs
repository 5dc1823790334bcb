//! Bitcoin matcher.
//!
//! The ledger records abstract events only; this module pins them to the
//! settlement layer. Step A establishes each deposit's real principal from
//! its funding transaction. Step B correlates closed ledger entries to
//! payout transactions using tiered heuristics, strict descending
//! confidence, first success wins per (bitcoin tx, ledger entry) pair.
//! Step C classifies non-investor input addresses on matched payouts as
//! fund treasury addresses.

use crate::amount::Amount;
use crate::models::{
    ChainTx, Investor, LedgerTransaction, MatchKind, MatchRecord, MatchTier,
};
use crate::sources::ChainSource;
use anyhow::{bail, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Precise/tolerant withdrawal window around the ledger exit time.
const PRECISE_WINDOW_SECS: i64 = 3_600;
/// Loose withdrawal window.
const LOOSE_WINDOW_SECS: i64 = 86_400;

/// Tier 2 absolute tolerance: 1e-6 BTC.
const PRECISE_EPSILON_SATS: Amount = 100;
/// Tier 4 absolute tolerance: 8e-4 BTC.
const LOOSE_EPSILON_SATS: Amount = 80_000;

/// Tier 3 relative tolerance: 0.5% of balance.
const TOLERANT_RATIO: (Amount, Amount) = (5, 1000);
/// Tier 4 relative tolerance: 5% of balance.
const LOOSE_RATIO: (Amount, Amount) = (5, 100);

/// Step A: resolve every deposit's principal from the output its funding
/// transaction paid to the fund's deposit-tracking addresses. A deposit
/// without such an output has an unknown principal, which fails the whole
/// investor rather than defaulting to zero.
pub async fn discover_principals(
    chain: &dyn ChainSource,
    transactions: &mut BTreeMap<String, LedgerTransaction>,
    deposit_addresses: &HashSet<String>,
) -> Result<()> {
    for tx in transactions.values_mut() {
        let funding = chain.raw_transaction(&tx.txid).await?;
        let paid = funding
            .outputs
            .iter()
            .filter(|o| o.address.as_deref().is_some_and(|a| deposit_addresses.contains(a)))
            .map(|o| o.value)
            .last();

        match paid {
            Some(value) => tx.principal = value,
            None => bail!("could not find deposit value for transaction {}", tx.txid),
        }
    }
    Ok(())
}

/// Tier cascade for one (bitcoin tx, ledger entry) pair. Returns the first
/// tier that matches; looser tiers are never evaluated past a success.
pub fn match_pair(
    tx_time: i64,
    exit_timestamp: i64,
    paid_values: &[Amount],
    balance: Amount,
) -> Option<MatchTier> {
    let time_diff = (exit_timestamp - tx_time).abs();

    if time_diff < PRECISE_WINDOW_SECS {
        if paid_values
            .iter()
            .any(|v| (balance - v).abs() < PRECISE_EPSILON_SATS)
        {
            return Some(MatchTier::Precise);
        }
        if paid_values
            .iter()
            .any(|v| (balance - v).abs() * TOLERANT_RATIO.1 < balance * TOLERANT_RATIO.0)
        {
            return Some(MatchTier::Tolerant);
        }
    }

    if time_diff < LOOSE_WINDOW_SECS {
        if paid_values.iter().any(|v| {
            let diff = (balance - v).abs();
            diff * LOOSE_RATIO.1 < balance * LOOSE_RATIO.0 || diff < LOOSE_EPSILON_SATS
        }) {
            return Some(MatchTier::Loose);
        }
    }

    None
}

/// Step B: correlate the investor's address history against the ledger
/// set. Every ledger txid gets an entry in the result (possibly empty), so
/// callers can mark the whole set as matched. A single bitcoin tx may
/// match several ledger entries (fan-out payouts), but an exact deposit
/// match consumes it.
pub fn correlate(
    investor: &Investor,
    transactions: &BTreeMap<String, LedgerTransaction>,
    history: &[ChainTx],
) -> BTreeMap<String, Vec<MatchRecord>> {
    let mut records: BTreeMap<String, Vec<MatchRecord>> = transactions
        .keys()
        .map(|txid| (txid.clone(), Vec::new()))
        .collect();

    for chain_tx in history {
        if chain_tx.confirmations == 0 {
            continue;
        }

        if let Some(entries) = records.get_mut(&chain_tx.txid) {
            entries.push(MatchRecord {
                bitcoin_txid: chain_tx.txid.clone(),
                ledger_txid: chain_tx.txid.clone(),
                kind: MatchKind::Deposit,
                tier: MatchTier::Exact,
            });
            continue;
        }

        let paid_values = chain_tx.outputs_to(&investor.btc_address);
        if paid_values.is_empty() {
            continue;
        }

        for tx in transactions.values() {
            let Some(exit) = tx.exit_timestamp else {
                continue;
            };
            if let Some(tier) = match_pair(chain_tx.time, exit, &paid_values, tx.balance) {
                debug!(
                    ledger_txid = %tx.txid,
                    bitcoin_txid = %chain_tx.txid,
                    ?tier,
                    "withdrawal correlated"
                );
                if let Some(entries) = records.get_mut(&tx.txid) {
                    entries.push(MatchRecord {
                        bitcoin_txid: chain_tx.txid.clone(),
                        ledger_txid: tx.txid.clone(),
                        kind: MatchKind::Withdrawal,
                        tier,
                    });
                }
            }
        }
    }

    records
}

/// Step C: count treasury addresses. Every input of a matched payout that
/// is not the investor's own address is an internal system address; the
/// counter increments once per (match record, input) occurrence.
pub fn classify_system_addresses(
    own_address: &str,
    transactions: &BTreeMap<String, LedgerTransaction>,
    chain_txs: &HashMap<String, ChainTx>,
) -> HashMap<String, u64> {
    let mut counts: HashMap<String, u64> = HashMap::new();

    for tx in transactions.values() {
        let Some(matches) = tx.matches.as_deref() else {
            continue;
        };
        for record in matches.iter().filter(|r| r.kind == MatchKind::Withdrawal) {
            let Some(chain_tx) = chain_txs.get(&record.bitcoin_txid) else {
                continue;
            };
            for input in &chain_tx.inputs {
                if let Some(addr) = input.prev_address.as_deref() {
                    if addr != own_address {
                        *counts.entry(addr.to_string()).or_insert(0) += 1;
                    }
                }
            }
        }
    }

    counts
}
