//! Transaction assembly.
//!
//! Folds one investor's ordered deposit/exit events into the canonical
//! id -> transaction map, then overlays withdraw requests. Duplicates and
//! invalid requests are flagged and kept for audit, never merged or
//! dropped silently.

use crate::models::{LedgerAction, LedgerEvent, LedgerTransaction, WithdrawRequest};
use anyhow::{bail, Result};
use std::collections::BTreeMap;
use tracing::warn;

/// Assembly output: the canonical transaction set plus the audit lists
/// that do not belong to any single transaction.
#[derive(Debug, Default)]
pub struct TransactionSet {
    pub transactions: BTreeMap<String, LedgerTransaction>,
    /// Requests targeting an id this investor never deposited.
    pub unmatched_requests: Vec<WithdrawRequest>,
}

pub fn assemble(
    eth_address: &str,
    events: &[LedgerEvent],
    requests: &[WithdrawRequest],
) -> Result<TransactionSet> {
    let mut set = TransactionSet::default();

    for event in events {
        match event.action {
            LedgerAction::Deposit => {
                if let Some(existing) = set.transactions.get_mut(&event.txid) {
                    // First event wins; repeats are flagged, never merged.
                    existing.duplicates.push(event.clone());
                } else {
                    set.transactions
                        .insert(event.txid.clone(), LedgerTransaction::from_event(event));
                }
            }
            LedgerAction::Exit => match set.transactions.get_mut(&event.txid) {
                Some(tx) => tx.exit_timestamp = Some(event.time),
                None => bail!(
                    "exit event for unknown transaction {} on account {eth_address}",
                    event.txid
                ),
            },
        }
    }

    for request in requests {
        match set.transactions.get_mut(&request.txid) {
            Some(tx) => {
                if tx.requested_exit.is_some() || request.pubkey != tx.pubkey {
                    warn!(
                        account = eth_address,
                        txid = %request.txid,
                        "invalid withdraw request (double request or pubkey mismatch)"
                    );
                    tx.invalid_requests.push(request.clone());
                } else {
                    tx.requested_exit = Some(request.time);
                }
            }
            None => {
                warn!(
                    account = eth_address,
                    txid = %request.txid,
                    "unmatched withdraw request"
                );
                set.unmatched_requests.push(request.clone());
            }
        }
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DepositKind;

    fn deposit(txid: &str, time: i64) -> LedgerEvent {
        LedgerEvent {
            txid: txid.into(),
            pubkey: "04aa".into(),
            signature: "sig".into(),
            action: LedgerAction::Deposit,
            kind: DepositKind::Regular,
            time,
        }
    }

    fn exit(txid: &str, time: i64) -> LedgerEvent {
        LedgerEvent {
            action: LedgerAction::Exit,
            ..deposit(txid, time)
        }
    }

    fn request(txid: &str, pubkey: &str, time: i64) -> WithdrawRequest {
        WithdrawRequest {
            txid: txid.into(),
            pubkey: pubkey.into(),
            signature: "sig".into(),
            time,
            referral: false,
        }
    }

    #[test]
    fn test_first_deposit_wins_duplicates_flagged() {
        let events = vec![deposit("t1", 100), deposit("t1", 200)];
        let set = assemble("0xabc", &events, &[]).unwrap();

        assert_eq!(set.transactions.len(), 1);
        let tx = &set.transactions["t1"];
        assert_eq!(tx.time, 100);
        assert_eq!(tx.duplicates.len(), 1);
        assert_eq!(tx.duplicates[0].time, 200);
    }

    #[test]
    fn test_exit_closes_existing_transaction() {
        let events = vec![deposit("t1", 100), exit("t1", 500)];
        let set = assemble("0xabc", &events, &[]).unwrap();
        assert_eq!(set.transactions["t1"].exit_timestamp, Some(500));
    }

    #[test]
    fn test_exit_for_unknown_id_is_assembly_error() {
        let events = vec![exit("ghost", 500)];
        assert!(assemble("0xabc", &events, &[]).is_err());
    }

    #[test]
    fn test_valid_request_sets_requested_exit() {
        let events = vec![deposit("t1", 100)];
        let requests = vec![request("t1", "04aa", 300)];
        let set = assemble("0xabc", &events, &requests).unwrap();
        let tx = &set.transactions["t1"];
        assert_eq!(tx.requested_exit, Some(300));
        assert!(tx.invalid_requests.is_empty());
    }

    #[test]
    fn test_double_request_is_invalid() {
        let events = vec![deposit("t1", 100)];
        let requests = vec![request("t1", "04aa", 300), request("t1", "04aa", 400)];
        let set = assemble("0xabc", &events, &requests).unwrap();
        let tx = &set.transactions["t1"];
        assert_eq!(tx.requested_exit, Some(300));
        assert_eq!(tx.invalid_requests.len(), 1);
        assert_eq!(tx.invalid_requests[0].time, 400);
    }

    #[test]
    fn test_pubkey_mismatch_is_invalid() {
        let events = vec![deposit("t1", 100)];
        let requests = vec![request("t1", "04bb", 300)];
        let set = assemble("0xabc", &events, &requests).unwrap();
        let tx = &set.transactions["t1"];
        assert_eq!(tx.requested_exit, None);
        assert_eq!(tx.invalid_requests.len(), 1);
    }

    #[test]
    fn test_unknown_target_goes_to_unmatched_list() {
        let events = vec![deposit("t1", 100)];
        let requests = vec![request("ghost", "04aa", 300)];
        let set = assemble("0xabc", &events, &requests).unwrap();
        assert_eq!(set.unmatched_requests.len(), 1);
        assert_eq!(set.transactions["t1"].requested_exit, None);
    }

    #[test]
    fn test_request_on_closed_transaction_is_accepted() {
        // A request normally precedes the exit; the overlay only rejects
        // double requests and key mismatches.
        let events = vec![deposit("t1", 100), exit("t1", 900)];
        let requests = vec![request("t1", "04aa", 700)];
        let set = assemble("0xabc", &events, &requests).unwrap();
        assert_eq!(set.transactions["t1"].requested_exit, Some(700));
    }
}
