//! Report emission.
//!
//! The only place satoshis become decimal strings and unix seconds become
//! dates. Artifacts are written after a fully successful reduction and
//! never on a corrupt batch.

use crate::amount::format_btc;
use crate::recon::{FundAggregate, WithdrawalRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::info;

pub fn format_timestamp(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y/%m/%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("invalid({secs})"))
}

/// Withdrawal delay, rendered as whole hours rounded up:
/// `floor(ceil(seconds/3600)/24)` days plus the remaining hours.
pub fn format_delay(from_secs: i64, to_secs: i64) -> String {
    let seconds = (to_secs - from_secs).max(0);
    let hours_total = (seconds + 3_599) / 3_600;
    format!("{} day(s) {:02} hours", hours_total / 24, hours_total % 24)
}

/// One emitted audit row. Everything is a formatted string by design;
/// the numeric sort keys stay behind in the aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct WithdrawEntry {
    pub request_date: String,
    pub btc_address: String,
    pub eth_address: String,
    pub transaction: String,
    pub value: String,
    pub paid_out_date: String,
    pub paid_out_transaction: String,
    pub delay: String,
}

fn entry_from_record(record: &WithdrawalRecord, as_of: DateTime<Utc>) -> WithdrawEntry {
    let (paid_out_date, paid_out_transaction, delay) = match record.paid_at {
        Some(paid_at) => (
            format_timestamp(paid_at),
            record
                .payout_txid
                .clone()
                .unwrap_or_else(|| "not matched".to_string()),
            format_delay(record.requested_at, paid_at),
        ),
        None => (
            "PENDING".to_string(),
            String::new(),
            format_delay(record.requested_at, as_of.timestamp()),
        ),
    };

    WithdrawEntry {
        request_date: format_timestamp(record.requested_at),
        btc_address: record.btc_address.clone(),
        eth_address: record.eth_address.clone(),
        transaction: record.label.clone(),
        value: format_btc(record.balance),
        paid_out_date,
        paid_out_transaction,
        delay,
    }
}

#[derive(Debug, Serialize)]
struct SystemAddressEntry<'a> {
    address: &'a str,
    count: u64,
}

/// Write every report artifact. Callers only reach this after `reduce`
/// succeeded, so a corrupt batch produces zero output files.
pub fn write_reports(
    aggregate: &FundAggregate,
    output_dir: &str,
    started_at: DateTime<Utc>,
) -> Result<()> {
    let dir = Path::new(output_dir);
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {output_dir}"))?;

    let all: Vec<WithdrawEntry> = aggregate
        .all_withdrawals
        .iter()
        .map(|r| entry_from_record(r, started_at))
        .collect();
    let pending: Vec<WithdrawEntry> = aggregate
        .pending_withdrawals
        .iter()
        .map(|r| entry_from_record(r, started_at))
        .collect();
    let processed: Vec<WithdrawEntry> = aggregate
        .processed_withdrawals
        .iter()
        .map(|r| entry_from_record(r, started_at))
        .collect();

    write_json(dir, "withdrawEntries.json", &all)?;
    write_json(dir, "pendingEntries.json", &pending)?;
    write_json(dir, "processedEntries.json", &processed)?;

    let mut csv = format!(
        "request date, btc address, eth address, transaction, value, paid out date, \
         paid out transaction, delay (as of {})\r\n",
        started_at.format("%Y/%m/%d %H:%M:%S")
    );
    for entry in &all {
        csv.push_str(&format!(
            "{}, {}, {}, {}, {}, {}, {}, {}\r\n",
            entry.request_date,
            entry.btc_address,
            entry.eth_address,
            entry.transaction,
            entry.value,
            entry.paid_out_date,
            entry.paid_out_transaction,
            entry.delay
        ));
    }
    fs::write(dir.join("latest.csv"), csv).context("failed to write latest.csv")?;

    // Pending payout worksheet: address and amount only.
    let mut worksheet = String::new();
    for entry in &pending {
        worksheet.push_str(&format!("{}, {}\r\n", entry.btc_address, entry.value));
    }
    fs::write(dir.join("many.txt"), worksheet).context("failed to write many.txt")?;

    write_json(dir, "bitcoinMapping.json", &aggregate.bitcoin_mapping)?;
    write_json(dir, "ethereumMapping.json", &aggregate.ethereum_mapping)?;

    let system: Vec<SystemAddressEntry> = aggregate
        .system_addresses
        .iter()
        .map(|(address, count)| SystemAddressEntry {
            address,
            count: *count,
        })
        .collect();
    write_json(dir, "knownSystemAddresses.json", &system)?;

    info!(output_dir, "report artifacts written");
    Ok(())
}

/// Five-line fund summary, emitted even when some investors failed.
pub fn log_summary(aggregate: &FundAggregate) {
    info!("Total deposited: {}", format_btc(aggregate.total_deposited));
    info!(
        "Total withdrawn (deposits): {}",
        format_btc(aggregate.total_withdrawn)
    );
    info!(
        "Total withdrawn (referrals): {}",
        format_btc(aggregate.total_withdrawn_referral)
    );
    info!(
        "Total balance (deposits): {}",
        format_btc(aggregate.current_balance)
    );
    info!(
        "Total balance (referrals): {}",
        format_btc(aggregate.current_referral)
    );
}

fn write_json<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {name}"))?;
    fs::write(dir.join(name), json).with_context(|| format!("failed to write {name}"))
}
