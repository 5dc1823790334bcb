//! Core domain model for fund reconciliation.
//!
//! Everything here is serde-serializable: ledger transactions and snapshots
//! go through the SQLite snapshot store and the wire types come straight
//! from the source adapters.

use crate::amount::{Amount, Rate, RATE_ONE};
use anyhow::{bail, Context, Result};
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use std::collections::BTreeMap;

// =============================================================================
// LEDGER EVENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepositKind {
    Regular,
    Referral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerAction {
    Deposit,
    Exit,
}

/// One raw contract event (deposit or exit), as served by the ledger source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub txid: String,
    pub pubkey: String,
    pub signature: String,
    pub action: LedgerAction,
    pub kind: DepositKind,
    pub time: i64,
}

/// Withdraw request overlay event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub txid: String,
    pub pubkey: String,
    pub signature: String,
    pub time: i64,
    pub referral: bool,
}

/// Global fund performance entry. `value` is percent * 1e8 fixed-point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceEntry {
    pub time: i64,
    pub value: i64,
}

// =============================================================================
// MATCHING
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Deposit,
    Withdrawal,
}

/// Confidence tier of a match, strongest first. Ordering is meaningful:
/// a stricter tier always wins and suppresses looser evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MatchTier {
    Exact,
    Precise,
    Tolerant,
    Loose,
}

/// Correlation between a real bitcoin transaction and a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub bitcoin_txid: String,
    pub ledger_txid: String,
    pub kind: MatchKind,
    pub tier: MatchTier,
}

// =============================================================================
// LEDGER TRANSACTION
// =============================================================================

fn rate_one() -> Rate {
    RATE_ONE
}

/// Canonical per-investor transaction, created at assembly time and
/// enriched in place by the compounder and matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub txid: String,
    pub pubkey: String,
    pub kind: DepositKind,
    /// Deposit time (unix seconds).
    pub time: i64,
    /// None while the position is open.
    pub exit_timestamp: Option<i64>,
    /// Time of the accepted withdraw request, if any.
    pub requested_exit: Option<i64>,
    /// Principal in satoshis, established by the matcher. Zero for
    /// referral entries (their face value moves to `referral_value`).
    #[serde(default)]
    pub principal: Amount,
    #[serde(default)]
    pub referral_value: Amount,
    /// Compounded interest multiplier.
    #[serde(default = "rate_one")]
    pub interest: Rate,
    /// Accumulated performance-fee fraction.
    #[serde(default)]
    pub fee: Rate,
    /// Time of the last performance entry applied, if any.
    #[serde(default)]
    pub last_interest: Option<i64>,
    /// Compounded balance in satoshis.
    #[serde(default)]
    pub balance: Amount,
    /// None = the matcher never ran for this entry (drives the update gate).
    #[serde(default)]
    pub matches: Option<Vec<MatchRecord>>,
    /// Duplicate deposit events sharing this id. Flagged, never merged.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub duplicates: Vec<LedgerEvent>,
    /// Withdraw requests rejected for this entry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalid_requests: Vec<WithdrawRequest>,
}

impl LedgerTransaction {
    pub fn from_event(event: &LedgerEvent) -> Self {
        Self {
            txid: event.txid.clone(),
            pubkey: event.pubkey.clone(),
            kind: event.kind,
            time: event.time,
            exit_timestamp: None,
            requested_exit: None,
            principal: 0,
            referral_value: 0,
            interest: RATE_ONE,
            fee: 0,
            last_interest: None,
            balance: 0,
            matches: None,
            duplicates: Vec::new(),
            invalid_requests: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.exit_timestamp.is_none()
    }

    /// First withdrawal match record, if the matcher found one.
    pub fn withdrawal_match(&self) -> Option<&MatchRecord> {
        self.matches
            .as_deref()
            .and_then(|m| m.iter().find(|r| r.kind == MatchKind::Withdrawal))
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Per-investor value rollup, in satoshis except `yield_rate` (1e8 scale).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollup {
    pub initial: Amount,
    pub balance: Amount,
    pub growth: Amount,
    pub yield_rate: Rate,
    pub fee: Amount,
}

/// Persisted per-investor state. Superseded, never deleted: the next full
/// run overwrites it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub pubkey: String,
    pub transactions: BTreeMap<String, LedgerTransaction>,
    /// Slice of the performance index that covered this investor's activity.
    pub index_slice: Vec<PerformanceEntry>,
    pub current: Rollup,
    pub total: Rollup,
    pub updated_at: i64,
}

// =============================================================================
// CHAIN TRANSACTIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTxInput {
    /// Address that funded this input (resolved prevout).
    pub prev_address: Option<String>,
    pub prev_value: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTxOutput {
    pub address: Option<String>,
    pub value: Amount,
}

/// A confirmed bitcoin transaction as seen by the matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTx {
    pub txid: String,
    pub confirmations: u64,
    /// Block time (unix seconds).
    pub time: i64,
    pub inputs: Vec<ChainTxInput>,
    pub outputs: Vec<ChainTxOutput>,
}

impl ChainTx {
    /// Output values paying a given address.
    pub fn outputs_to(&self, address: &str) -> Vec<Amount> {
        self.outputs
            .iter()
            .filter(|o| o.address.as_deref() == Some(address))
            .map(|o| o.value)
            .collect()
    }
}

// =============================================================================
// INVESTOR
// =============================================================================

/// An investor identity. Both addresses derive deterministically from the
/// public key recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Investor {
    pub pubkey: String,
    pub eth_address: String,
    pub btc_address: String,
}

impl Investor {
    pub fn from_pubkey(pubkey_hex: &str) -> Result<Self> {
        let bytes = hex::decode(pubkey_hex.trim_start_matches("0x"))
            .with_context(|| format!("invalid public key hex {pubkey_hex}"))?;
        Ok(Self {
            pubkey: pubkey_hex.to_string(),
            eth_address: derive_eth_address(&bytes)?,
            btc_address: derive_btc_address(&bytes),
        })
    }
}

/// Base58check P2PKH address over hash160 of the key bytes (version 0x00).
fn derive_btc_address(pubkey: &[u8]) -> String {
    let sha = Sha256::digest(pubkey);
    let hash160 = Ripemd160::digest(sha);

    let mut payload = Vec::with_capacity(25);
    payload.push(0x00);
    payload.extend_from_slice(&hash160);
    let checksum = Sha256::digest(Sha256::digest(&payload));
    payload.extend_from_slice(&checksum[..4]);

    bs58::encode(payload).into_string()
}

/// EIP-55 checksummed address from the last 20 bytes of keccak256 over the
/// uncompressed key body. Compressed keys cannot be expanded without curve
/// math, so they are rejected and fail the investor.
fn derive_eth_address(pubkey: &[u8]) -> Result<String> {
    let body = match pubkey.len() {
        65 if pubkey[0] == 0x04 => &pubkey[1..],
        64 => pubkey,
        n => bail!("unsupported public key encoding ({n} bytes), expected uncompressed"),
    };

    let hash = Keccak256::digest(body);
    let raw = hex::encode(&hash[12..]);
    let check_hash = Keccak256::digest(raw.as_bytes());

    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in raw.chars().enumerate() {
        let nibble = if i % 2 == 0 {
            check_hash[i / 2] >> 4
        } else {
            check_hash[i / 2] & 0x0f
        };
        if nibble >= 8 {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    pub ledger_api_url: String,
    pub esplora_api_url: String,
    pub database_path: String,
    pub output_dir: String,
    pub max_parallel_investors: usize,
    pub max_parallel_chain_requests: usize,
    pub http_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let ledger_api_url = std::env::var("LEDGER_API_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8545/ledger".to_string());

        let esplora_api_url = std::env::var("ESPLORA_API_URL")
            .unwrap_or_else(|_| "https://blockstream.info/api".to_string());

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./fundrecon.db".to_string());

        let output_dir = std::env::var("OUTPUT_DIR").unwrap_or_else(|_| "./web".to_string());

        let max_parallel_investors = std::env::var("MAX_PARALLEL_INVESTORS")
            .unwrap_or_else(|_| "16".to_string())
            .parse()
            .unwrap_or(16);

        let max_parallel_chain_requests = std::env::var("MAX_CHAIN_REQUESTS")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .unwrap_or(8);

        let http_timeout_secs = std::env::var("HTTP_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        Ok(Self {
            ledger_api_url,
            esplora_api_url,
            database_path,
            output_dir,
            max_parallel_investors,
            max_parallel_chain_requests,
            http_timeout_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_btc_address_derivation_deterministic() {
        let a = derive_btc_address(&[0u8; 65]);
        let b = derive_btc_address(&[0u8; 65]);
        assert_eq!(a, b);
        assert!(a.starts_with('1'), "P2PKH mainnet addresses start with 1: {a}");
    }

    #[test]
    fn test_eth_address_prefix_stripping() {
        // Uncompressed key with 0x04 prefix and its 64-byte body derive the
        // same address.
        let mut key = vec![0x04];
        key.extend_from_slice(&[0x11; 64]);
        let with_prefix = derive_eth_address(&key).unwrap();
        let without_prefix = derive_eth_address(&[0x11; 64]).unwrap();
        assert_eq!(with_prefix, without_prefix);
        assert_eq!(with_prefix.len(), 42);
        assert!(with_prefix.starts_with("0x"));
    }

    #[test]
    fn test_eth_address_rejects_compressed_key() {
        assert!(derive_eth_address(&[0x02; 33]).is_err());
    }

    #[test]
    fn test_eip55_mixed_case() {
        let addr = derive_eth_address(&[0x42; 64]).unwrap();
        assert_ne!(addr, addr.to_lowercase());
    }

    #[test]
    fn test_investor_from_pubkey() {
        let hex_key = hex::encode([0x11u8; 64]);
        let investor = Investor::from_pubkey(&hex_key).unwrap();
        assert_eq!(investor.pubkey, hex_key);
        assert!(investor.btc_address.starts_with('1'));
        assert!(investor.eth_address.starts_with("0x"));
    }

    #[test]
    fn test_outputs_to_filters_by_address() {
        let tx = ChainTx {
            txid: "ab".into(),
            confirmations: 1,
            time: 0,
            inputs: vec![],
            outputs: vec![
                ChainTxOutput {
                    address: Some("addr1".into()),
                    value: 100,
                },
                ChainTxOutput {
                    address: Some("addr2".into()),
                    value: 200,
                },
                ChainTxOutput {
                    address: Some("addr1".into()),
                    value: 300,
                },
                ChainTxOutput {
                    address: None,
                    value: 400,
                },
            ],
        };
        assert_eq!(tx.outputs_to("addr1"), vec![100, 300]);
        assert!(tx.outputs_to("missing").is_empty());
    }
}
