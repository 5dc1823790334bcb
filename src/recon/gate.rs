//! Update gate.
//!
//! Decides, per investor, whether the matcher pass can be skipped by
//! reusing the prior snapshot's match records. Invalidation is
//! whole-investor: one stale transaction forces a full re-match of the
//! entire set, never a partial one.

use crate::models::{BalanceSnapshot, LedgerTransaction};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDecision {
    /// Run the matcher from scratch.
    FullRematch,
    /// Copy every match record from the prior snapshot verbatim.
    Reuse,
}

pub fn evaluate(
    prior: Option<&BalanceSnapshot>,
    current: &BTreeMap<String, LedgerTransaction>,
) -> UpdateDecision {
    let Some(prior) = prior else {
        return UpdateDecision::FullRematch;
    };

    if prior.transactions.len() != current.len() {
        debug!(
            pubkey = %prior.pubkey,
            old = prior.transactions.len(),
            new = current.len(),
            "transaction count changed"
        );
        return UpdateDecision::FullRematch;
    }

    for (txid, old_tx) in &prior.transactions {
        let Some(new_tx) = current.get(txid) else {
            debug!(pubkey = %prior.pubkey, %txid, "transaction disappeared");
            return UpdateDecision::FullRematch;
        };
        if old_tx.matches.is_none() {
            debug!(pubkey = %prior.pubkey, %txid, "prior snapshot was never matched");
            return UpdateDecision::FullRematch;
        }
        if old_tx.exit_timestamp != new_tx.exit_timestamp {
            debug!(pubkey = %prior.pubkey, %txid, "exit timestamp changed");
            return UpdateDecision::FullRematch;
        }
    }

    UpdateDecision::Reuse
}

/// Carry the prior snapshot's match records into the freshly assembled set.
pub fn adopt_matches(
    current: &mut BTreeMap<String, LedgerTransaction>,
    prior: &BalanceSnapshot,
) {
    for (txid, tx) in current.iter_mut() {
        if let Some(old_tx) = prior.transactions.get(txid) {
            tx.matches = old_tx.matches.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DepositKind, LedgerEvent, LedgerAction, MatchKind, MatchRecord, MatchTier, Rollup,
    };

    fn tx(txid: &str, exit: Option<i64>, matched: bool) -> LedgerTransaction {
        let mut tx = LedgerTransaction::from_event(&LedgerEvent {
            txid: txid.into(),
            pubkey: "04aa".into(),
            signature: "sig".into(),
            action: LedgerAction::Deposit,
            kind: DepositKind::Regular,
            time: 100,
        });
        tx.exit_timestamp = exit;
        if matched {
            tx.matches = Some(vec![MatchRecord {
                bitcoin_txid: "bb".repeat(32),
                ledger_txid: txid.into(),
                kind: MatchKind::Withdrawal,
                tier: MatchTier::Precise,
            }]);
        }
        tx
    }

    fn snapshot(txs: Vec<LedgerTransaction>) -> BalanceSnapshot {
        BalanceSnapshot {
            pubkey: "04aa".into(),
            transactions: txs.into_iter().map(|t| (t.txid.clone(), t)).collect(),
            index_slice: vec![],
            current: Rollup::default(),
            total: Rollup::default(),
            updated_at: 0,
        }
    }

    fn set(txs: Vec<LedgerTransaction>) -> BTreeMap<String, LedgerTransaction> {
        txs.into_iter().map(|t| (t.txid.clone(), t)).collect()
    }

    #[test]
    fn test_no_snapshot_forces_full_rematch() {
        let current = set(vec![tx("t1", None, false)]);
        assert_eq!(evaluate(None, &current), UpdateDecision::FullRematch);
    }

    #[test]
    fn test_count_change_forces_full_rematch() {
        let prior = snapshot(vec![tx("t1", None, true)]);
        let current = set(vec![tx("t1", None, false), tx("t2", None, false)]);
        assert_eq!(evaluate(Some(&prior), &current), UpdateDecision::FullRematch);
    }

    #[test]
    fn test_unmatched_prior_forces_full_rematch() {
        let prior = snapshot(vec![tx("t1", None, false)]);
        let current = set(vec![tx("t1", None, false)]);
        assert_eq!(evaluate(Some(&prior), &current), UpdateDecision::FullRematch);
    }

    #[test]
    fn test_exit_change_forces_full_rematch() {
        let prior = snapshot(vec![tx("t1", None, true)]);
        let current = set(vec![tx("t1", Some(900), false)]);
        assert_eq!(evaluate(Some(&prior), &current), UpdateDecision::FullRematch);
    }

    #[test]
    fn test_swapped_id_with_same_count_forces_full_rematch() {
        let prior = snapshot(vec![tx("t1", None, true)]);
        let current = set(vec![tx("t9", None, false)]);
        assert_eq!(evaluate(Some(&prior), &current), UpdateDecision::FullRematch);
    }

    #[test]
    fn test_unchanged_set_reuses_matches() {
        let prior = snapshot(vec![tx("t1", Some(900), true), tx("t2", None, true)]);
        let current = set(vec![tx("t1", Some(900), false), tx("t2", None, false)]);
        assert_eq!(evaluate(Some(&prior), &current), UpdateDecision::Reuse);
    }

    #[test]
    fn test_adopt_matches_copies_records_verbatim() {
        let prior = snapshot(vec![tx("t1", None, true)]);
        let mut current = set(vec![tx("t1", None, false)]);
        adopt_matches(&mut current, &prior);
        assert_eq!(
            current["t1"].matches,
            prior.transactions["t1"].matches
        );
    }
}
