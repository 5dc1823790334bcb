//! Reconciliation engine.
//!
//! Per-investor pipeline (assemble -> compound -> value -> gate -> match)
//! fanned out over a bounded set of tokio tasks. Each task exclusively
//! owns its working state and returns an immutable partial result; the
//! reduction folds them single-threaded after all tasks settle. One
//! investor failing never cancels the others; a data-corruption error
//! aborts the whole batch.

pub mod aggregate;
pub mod assembler;
pub mod compound;
pub mod gate;
pub mod matcher;

pub use aggregate::{FundAggregate, InvestorOutcome, WithdrawalRecord};
pub use gate::UpdateDecision;

use crate::amount::{
    apply_rate, checked_accum, mul_div_round, DataCorruption, FeeShare, RATE_ONE,
};
use crate::models::{
    BalanceSnapshot, ChainTx, DepositKind, Investor, LedgerEvent, LedgerTransaction, MatchKind,
    PerformanceEntry, Rollup,
};
use crate::snapshot::SnapshotStore;
use crate::sources::{ChainSource, LedgerSource};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub struct ReconEngine {
    ledger: Arc<dyn LedgerSource>,
    chain: Arc<dyn ChainSource>,
    snapshots: Arc<SnapshotStore>,
    max_parallel_investors: usize,
}

impl ReconEngine {
    pub fn new(
        ledger: Arc<dyn LedgerSource>,
        chain: Arc<dyn ChainSource>,
        snapshots: Arc<SnapshotStore>,
        max_parallel_investors: usize,
    ) -> Self {
        Self {
            ledger,
            chain,
            snapshots,
            max_parallel_investors: max_parallel_investors.max(1),
        }
    }

    /// One full batch run: fan out per-investor pipelines, join, reduce.
    pub async fn run(&self) -> Result<FundAggregate> {
        let investors = self.ledger.investors().await?;
        let total = investors.len();
        info!(total, "starting reconciliation run");

        let index = Arc::new(self.ledger.performance_index().await?);
        let fee_share = self.ledger.referral_fee_share().await?;
        let deposit_addresses = self.ledger.deposit_addresses().await?;
        let deposit_set: Arc<HashSet<String>> =
            Arc::new(deposit_addresses.iter().cloned().collect());

        let sem = Arc::new(Semaphore::new(self.max_parallel_investors));
        let processed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(total);
        for eth_address in investors {
            let sem = sem.clone();
            let ledger = self.ledger.clone();
            let chain = self.chain.clone();
            let snapshots = self.snapshots.clone();
            let index = index.clone();
            let deposit_set = deposit_set.clone();
            let processed = processed.clone();

            handles.push(tokio::spawn(async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (eth_address, Err(anyhow::Error::new(e))),
                };
                let result = process_investor(
                    ledger.as_ref(),
                    chain.as_ref(),
                    snapshots.as_ref(),
                    &eth_address,
                    &index,
                    fee_share,
                    &deposit_set,
                )
                .await;
                if result.is_ok() {
                    let n = processed.fetch_add(1, Ordering::Relaxed) + 1;
                    info!("processed {} [{}/{}]", eth_address.to_lowercase(), n, total);
                }
                (eth_address, result)
            }));
        }

        // Join barrier: aggregation only starts after every task settles.
        let mut outcomes = Vec::with_capacity(total);
        let mut failed = 0usize;
        for joined in join_all(handles).await {
            match joined {
                Ok((_, Ok(outcome))) => outcomes.push(outcome),
                Ok((eth_address, Err(e))) => {
                    if e.downcast_ref::<DataCorruption>().is_some() {
                        return Err(e);
                    }
                    failed += 1;
                    warn!(account = %eth_address, error = %e, "investor failed this run");
                }
                Err(e) => {
                    failed += 1;
                    warn!(error = %e, "investor task panicked");
                }
            }
        }

        let mut aggregate = aggregate::reduce(&outcomes, &deposit_addresses)?;
        aggregate.investors_failed = failed;
        info!(
            processed = aggregate.investors_processed,
            failed, "reconciliation run complete"
        );
        Ok(aggregate)
    }
}

async fn process_investor(
    ledger: &dyn LedgerSource,
    chain: &dyn ChainSource,
    snapshots: &SnapshotStore,
    eth_address: &str,
    index: &[PerformanceEntry],
    fee_share: FeeShare,
    deposit_addresses: &HashSet<String>,
) -> Result<InvestorOutcome> {
    let events = ledger.deposit_events(eth_address).await?;
    let investor = resolve_identity(eth_address, &events)?;
    let requests = ledger.withdraw_requests(eth_address).await?;

    let mut set = assembler::assemble(eth_address, &events, &requests)?;

    for tx in set.transactions.values_mut() {
        compound::apply(tx, index, fee_share);
    }

    matcher::discover_principals(chain, &mut set.transactions, deposit_addresses)
        .await
        .with_context(|| format!("principal discovery failed for {eth_address}"))?;

    let valuation = value_transactions(&mut set.transactions, fee_share)?;

    let prior = snapshots.load(&investor.pubkey)?;
    let decision = gate::evaluate(prior.as_ref(), &set.transactions);

    let mut payout_txs: HashMap<String, ChainTx> = HashMap::new();
    match decision {
        UpdateDecision::FullRematch => {
            debug!(account = eth_address, "full re-match");
            let history = chain
                .address_history(&investor.btc_address)
                .await
                .with_context(|| format!("address history failed for {eth_address}"))?;
            let mut records = matcher::correlate(&investor, &set.transactions, &history);
            for tx in set.transactions.values_mut() {
                tx.matches = Some(records.remove(&tx.txid).unwrap_or_default());
            }
            payout_txs = history.into_iter().map(|t| (t.txid.clone(), t)).collect();
        }
        UpdateDecision::Reuse => {
            debug!(account = eth_address, "reusing prior match records");
            if let Some(prior) = prior.as_ref() {
                gate::adopt_matches(&mut set.transactions, prior);
            }
        }
    }

    // Resolve matched payouts for treasury classification; on the reuse
    // path these reads come straight out of the persistent cache.
    for tx in set.transactions.values() {
        for record in tx.matches.as_deref().unwrap_or(&[]) {
            if record.kind == MatchKind::Withdrawal
                && !payout_txs.contains_key(&record.bitcoin_txid)
            {
                let chain_tx = chain.raw_transaction(&record.bitcoin_txid).await?;
                payout_txs.insert(record.bitcoin_txid.clone(), chain_tx);
            }
        }
    }
    let system_addresses = matcher::classify_system_addresses(
        &investor.btc_address,
        &set.transactions,
        &payout_txs,
    );

    let snapshot = BalanceSnapshot {
        pubkey: investor.pubkey.clone(),
        transactions: set.transactions.clone(),
        index_slice: related_index(index, valuation.first_investment, valuation.last_activity),
        current: valuation.current,
        total: valuation.total,
        updated_at: Utc::now().timestamp(),
    };
    snapshots.save(&snapshot)?;

    Ok(InvestorOutcome {
        investor,
        transactions: set.transactions,
        system_addresses,
    })
}

/// The account identity comes from the first event carrying a usable
/// public key; events with malformed keys are logged and skipped.
fn resolve_identity(eth_address: &str, events: &[LedgerEvent]) -> Result<Investor> {
    for event in events {
        match Investor::from_pubkey(&event.pubkey) {
            Ok(investor) => return Ok(investor),
            Err(e) => warn!(account = eth_address, error = %e, "skipping event with bad pubkey"),
        }
    }
    bail!("could not find valid transactions for account {eth_address}");
}

/// Most recent relevant activity across the transaction set. Any open
/// transaction dominates (the index slice has no upper bound); otherwise
/// the latest exit closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastActivity {
    None,
    Open { deposit_time: i64 },
    Closed { exit_time: i64 },
}

impl LastActivity {
    fn merge(self, tx: &LedgerTransaction) -> Self {
        match (self, tx.exit_timestamp) {
            (LastActivity::Open { deposit_time }, None) => LastActivity::Open {
                deposit_time: deposit_time.max(tx.time),
            },
            (LastActivity::Open { .. }, Some(_)) => self,
            (LastActivity::Closed { .. }, None) | (LastActivity::None, None) => {
                LastActivity::Open {
                    deposit_time: tx.time,
                }
            }
            (LastActivity::Closed { exit_time }, Some(exit)) => LastActivity::Closed {
                exit_time: exit_time.max(exit),
            },
            (LastActivity::None, Some(exit)) => LastActivity::Closed { exit_time: exit },
        }
    }

    fn upper_bound(self) -> Option<i64> {
        match self {
            LastActivity::Closed { exit_time } => Some(exit_time),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ValuationSummary {
    current: Rollup,
    total: Rollup,
    first_investment: Option<i64>,
    last_activity: LastActivity,
}

/// Turn discovered principals and accrued multipliers into balances and
/// per-investor rollups. Referral entries move their face value aside and
/// carry only the fund's referral share of the growth, floored at zero.
fn value_transactions(
    transactions: &mut BTreeMap<String, LedgerTransaction>,
    fee_share: FeeShare,
) -> Result<ValuationSummary> {
    let mut current = Rollup::default();
    let mut total = Rollup::default();
    let mut first_investment: Option<i64> = None;
    let mut last_activity = LastActivity::None;

    for tx in transactions.values_mut() {
        if first_investment.map_or(true, |t| tx.time < t) {
            first_investment = Some(tx.time);
        }
        last_activity = last_activity.merge(tx);

        match tx.kind {
            DepositKind::Referral => {
                let face = tx.principal;
                let growth = apply_rate(face, tx.interest) - face;
                let credit = fee_share.share_of(growth).max(0);
                tx.referral_value = face;
                tx.principal = 0;
                tx.balance = credit;

                checked_accum(&mut total.balance, credit).map_err(anyhow::Error::new)?;
                if tx.is_open() {
                    checked_accum(&mut current.balance, credit).map_err(anyhow::Error::new)?;
                }
            }
            DepositKind::Regular => {
                let compounded = apply_rate(tx.principal, tx.interest);
                tx.balance = compounded;
                let growth = compounded - tx.principal;
                let fee_amount = apply_rate(growth, tx.fee);

                checked_accum(&mut total.initial, tx.principal).map_err(anyhow::Error::new)?;
                checked_accum(&mut total.balance, compounded).map_err(anyhow::Error::new)?;
                checked_accum(&mut total.fee, fee_amount).map_err(anyhow::Error::new)?;
                if tx.is_open() {
                    checked_accum(&mut current.initial, tx.principal)
                        .map_err(anyhow::Error::new)?;
                    checked_accum(&mut current.balance, compounded)
                        .map_err(anyhow::Error::new)?;
                    checked_accum(&mut current.fee, fee_amount).map_err(anyhow::Error::new)?;
                }
            }
        }
    }

    for rollup in [&mut current, &mut total] {
        rollup.growth = rollup.balance - rollup.initial;
        rollup.yield_rate = if rollup.initial > 0 {
            mul_div_round(rollup.growth, RATE_ONE, rollup.initial)
        } else {
            0
        };
    }

    Ok(ValuationSummary {
        current,
        total,
        first_investment,
        last_activity,
    })
}

/// Slice of the global index that covered this investor's activity:
/// from the first deposit to the last exit, unbounded while any
/// transaction stays open.
fn related_index(
    index: &[PerformanceEntry],
    first_investment: Option<i64>,
    last_activity: LastActivity,
) -> Vec<PerformanceEntry> {
    let Some(first) = first_investment else {
        return Vec::new();
    };
    let upper = last_activity.upper_bound();
    index
        .iter()
        .filter(|e| e.time >= first)
        .take_while(|e| upper.map_or(true, |u| e.time <= u))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LedgerAction;

    fn tx(
        txid: &str,
        kind: DepositKind,
        time: i64,
        exit: Option<i64>,
        principal: i128,
        interest: i128,
        fee: i128,
    ) -> LedgerTransaction {
        let mut tx = LedgerTransaction::from_event(&LedgerEvent {
            txid: txid.into(),
            pubkey: "04aa".into(),
            signature: "sig".into(),
            action: LedgerAction::Deposit,
            kind,
            time,
        });
        tx.exit_timestamp = exit;
        tx.principal = principal;
        tx.interest = interest;
        tx.fee = fee;
        tx
    }

    fn set(txs: Vec<LedgerTransaction>) -> BTreeMap<String, LedgerTransaction> {
        txs.into_iter().map(|t| (t.txid.clone(), t)).collect()
    }

    fn share() -> FeeShare {
        FeeShare::new(2, 10).unwrap()
    }

    #[test]
    fn test_regular_valuation_and_rollups() {
        let mut txs = set(vec![tx(
            "t1",
            DepositKind::Regular,
            100,
            None,
            100_000_000,
            121_000_000,
            5_250_000,
        )]);
        let v = value_transactions(&mut txs, share()).unwrap();

        assert_eq!(txs["t1"].balance, 121_000_000);
        assert_eq!(v.total.initial, 100_000_000);
        assert_eq!(v.total.balance, 121_000_000);
        assert_eq!(v.total.growth, 21_000_000);
        // fee fraction applied to the growth
        assert_eq!(v.total.fee, 1_102_500);
        // 21% yield at 1e8 scale
        assert_eq!(v.total.yield_rate, 21_000_000);
        // open position mirrors into the current rollup
        assert_eq!(v.current, v.total);
    }

    #[test]
    fn test_closed_position_leaves_current_empty() {
        let mut txs = set(vec![tx(
            "t1",
            DepositKind::Regular,
            100,
            Some(900),
            100_000_000,
            110_000_000,
            2_500_000,
        )]);
        let v = value_transactions(&mut txs, share()).unwrap();
        assert_eq!(v.current, Rollup::default());
        assert_eq!(v.total.balance, 110_000_000);
    }

    #[test]
    fn test_referral_valuation_moves_face_value() {
        let mut txs = set(vec![tx(
            "t1",
            DepositKind::Referral,
            100,
            None,
            50_000_000,
            121_000_000,
            0,
        )]);
        let v = value_transactions(&mut txs, share()).unwrap();

        let t = &txs["t1"];
        assert_eq!(t.referral_value, 50_000_000);
        assert_eq!(t.principal, 0);
        // 20% of the 10_500_000 growth
        assert_eq!(t.balance, 2_100_000);
        assert_eq!(v.total.initial, 0);
        assert_eq!(v.total.balance, 2_100_000);
    }

    #[test]
    fn test_negative_referral_growth_floors_at_zero() {
        let mut txs = set(vec![tx(
            "t1",
            DepositKind::Referral,
            100,
            None,
            50_000_000,
            90_000_000,
            0,
        )]);
        value_transactions(&mut txs, share()).unwrap();
        assert_eq!(txs["t1"].balance, 0);
    }

    #[test]
    fn test_last_activity_open_dominates_closed() {
        let open = tx("t1", DepositKind::Regular, 500, None, 0, RATE_ONE, 0);
        let closed = tx("t2", DepositKind::Regular, 100, Some(900), 0, RATE_ONE, 0);

        let a = LastActivity::None.merge(&closed).merge(&open);
        assert_eq!(a, LastActivity::Open { deposit_time: 500 });
        // once open, later exits do not close it again
        assert_eq!(a.merge(&closed), LastActivity::Open { deposit_time: 500 });
        assert_eq!(a.upper_bound(), None);
    }

    #[test]
    fn test_last_activity_tracks_latest_exit() {
        let c1 = tx("t1", DepositKind::Regular, 100, Some(900), 0, RATE_ONE, 0);
        let c2 = tx("t2", DepositKind::Regular, 100, Some(700), 0, RATE_ONE, 0);
        let a = LastActivity::None.merge(&c1).merge(&c2);
        assert_eq!(a, LastActivity::Closed { exit_time: 900 });
        assert_eq!(a.upper_bound(), Some(900));
    }

    #[test]
    fn test_related_index_bounds() {
        let index: Vec<PerformanceEntry> = [100, 200, 300, 400]
            .iter()
            .map(|&time| PerformanceEntry { time, value: 0 })
            .collect();

        // closed at 300: [first, last exit]
        let slice = related_index(
            &index,
            Some(200),
            LastActivity::Closed { exit_time: 300 },
        );
        assert_eq!(slice.iter().map(|e| e.time).collect::<Vec<_>>(), vec![200, 300]);

        // open: no upper bound
        let slice = related_index(&index, Some(200), LastActivity::Open { deposit_time: 250 });
        assert_eq!(
            slice.iter().map(|e| e.time).collect::<Vec<_>>(),
            vec![200, 300, 400]
        );

        // no transactions at all
        assert!(related_index(&index, None, LastActivity::None).is_empty());
    }
}
