//! Contract ledger source.
//!
//! Talks to the contract-indexer REST gateway that mirrors the fund's
//! storage contract. Events are append-only and individually immutable, so
//! per-index fetches cache persistently; index-level data (performance,
//! fees, investor list) uses short memory TTLs.

use crate::cache::{CacheStore, CacheTier};
use crate::models::{DepositKind, LedgerAction, LedgerEvent, PerformanceEntry, WithdrawRequest};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::amount::FeeShare;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;

/// Signature sentinel the contract stores on referral-program credits.
const REFERRAL_SIGNATURE: &str = "referer";

const INDEX_TTL: Duration = Duration::from_secs(900);
const INVESTORS_TTL: Duration = Duration::from_secs(120);

/// Read access to the fund's system of record.
#[async_trait]
pub trait LedgerSource: Send + Sync {
    /// All investor ethereum addresses known to the contract.
    async fn investors(&self) -> Result<Vec<String>>;
    /// Ordered deposit/exit events for one investor.
    async fn deposit_events(&self, eth_address: &str) -> Result<Vec<LedgerEvent>>;
    /// Ordered withdraw-request events for one investor.
    async fn withdraw_requests(&self, eth_address: &str) -> Result<Vec<WithdrawRequest>>;
    /// Global fund performance index, time-ordered, append-only.
    async fn performance_index(&self) -> Result<Vec<PerformanceEntry>>;
    /// Referral fee share as an exact rational.
    async fn referral_fee_share(&self) -> Result<FeeShare>;
    /// Fund treasury deposit addresses.
    async fn deposit_addresses(&self) -> Result<Vec<String>>;
}

// Wire shapes served by the indexer gateway. Field names follow the
// upstream contract ABI (including its `referal` spelling).

#[derive(Debug, Deserialize)]
struct WireCount {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    txid: String,
    pubkey: String,
    signature: String,
    action: u8,
    time: i64,
}

#[derive(Debug, Deserialize)]
struct WireWithdrawRequest {
    txid: String,
    pubkey: String,
    signature: String,
    time: i64,
    #[serde(alias = "referal")]
    referral: bool,
}

#[derive(Debug, Deserialize)]
struct WireFeeShare {
    numerator: u32,
    denominator: u32,
}

pub struct HttpLedgerClient {
    http: Client,
    base_url: String,
    cache: Arc<CacheStore>,
}

impl HttpLedgerClient {
    pub fn new(base_url: &str, cache: Arc<CacheStore>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("fundrecon/0.1 (ledger reader)")
            .build()
            .context("failed to build ledger HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        let mut backoff = INITIAL_BACKOFF_MS;

        for attempt in 0..MAX_RETRIES {
            match self.http.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<T>()
                        .await
                        .with_context(|| format!("failed to parse response from {url}"));
                }
                Ok(response) => {
                    warn!(%url, status = %response.status(), attempt, "ledger request failed");
                }
                Err(e) => {
                    warn!(%url, error = %e, attempt, "ledger request error");
                }
            }
            sleep(Duration::from_millis(backoff)).await;
            backoff *= 2;
        }

        bail!("ledger request to {url} failed after {MAX_RETRIES} attempts");
    }

    /// Count-then-get walk over an append-only contract array. Items are
    /// individually immutable, so they cache persistently without expiry.
    async fn fetch_indexed(&self, kind: &str, eth_address: &str) -> Result<Vec<serde_json::Value>> {
        let addr = eth_address.to_lowercase();
        let count: WireCount = self.get_json(&format!("{kind}/{addr}/count")).await?;

        let mut items = Vec::with_capacity(count.count as usize);
        for n in 0..count.count {
            let cache_key = format!("ledger.{kind}.{addr}.{n}");
            if let Some(item) = self.cache.get::<serde_json::Value>(&cache_key) {
                items.push(item);
                continue;
            }
            let item: serde_json::Value = self.get_json(&format!("{kind}/{addr}/{n}")).await?;
            self.cache
                .put(&cache_key, &item, None, CacheTier::Persistent)?;
            items.push(item);
        }
        debug!(kind, %addr, count = items.len(), "fetched ledger items");
        Ok(items)
    }
}

fn event_from_wire(wire: WireEvent) -> Result<LedgerEvent> {
    let action = match wire.action {
        0 => LedgerAction::Deposit,
        1 => LedgerAction::Exit,
        other => bail!("unknown ledger action {other} for tx {}", wire.txid),
    };
    let kind = if wire.signature == REFERRAL_SIGNATURE {
        DepositKind::Referral
    } else {
        DepositKind::Regular
    };
    Ok(LedgerEvent {
        txid: wire.txid,
        pubkey: wire.pubkey,
        signature: wire.signature,
        action,
        kind,
        time: wire.time,
    })
}

#[async_trait]
impl LedgerSource for HttpLedgerClient {
    async fn investors(&self) -> Result<Vec<String>> {
        if let Some(cached) = self.cache.get::<Vec<String>>("ledger.investors") {
            return Ok(cached);
        }
        let investors: Vec<String> = self.get_json("investors").await?;
        self.cache.put(
            "ledger.investors",
            &investors,
            Some(INVESTORS_TTL),
            CacheTier::Memory,
        )?;
        Ok(investors)
    }

    async fn deposit_events(&self, eth_address: &str) -> Result<Vec<LedgerEvent>> {
        let values = self.fetch_indexed("tx", eth_address).await?;
        values
            .into_iter()
            .enumerate()
            .map(|(n, value)| {
                let wire: WireEvent = serde_json::from_value(value)
                    .with_context(|| format!("malformed ledger tx {eth_address}/{n}"))?;
                event_from_wire(wire)
            })
            .collect()
    }

    async fn withdraw_requests(&self, eth_address: &str) -> Result<Vec<WithdrawRequest>> {
        let values = self.fetch_indexed("rtx", eth_address).await?;
        values
            .into_iter()
            .enumerate()
            .map(|(n, value)| {
                let wire: WireWithdrawRequest = serde_json::from_value(value)
                    .with_context(|| format!("malformed withdraw request {eth_address}/{n}"))?;
                Ok(WithdrawRequest {
                    txid: wire.txid,
                    pubkey: wire.pubkey,
                    signature: wire.signature,
                    time: wire.time,
                    referral: wire.referral,
                })
            })
            .collect()
    }

    async fn performance_index(&self) -> Result<Vec<PerformanceEntry>> {
        if let Some(cached) = self.cache.get::<Vec<PerformanceEntry>>("ledger.performance") {
            return Ok(cached);
        }
        let index: Vec<PerformanceEntry> = self.get_json("performance").await?;
        self.cache.put(
            "ledger.performance",
            &index,
            Some(INDEX_TTL),
            CacheTier::Memory,
        )?;
        Ok(index)
    }

    async fn referral_fee_share(&self) -> Result<FeeShare> {
        if let Some(cached) = self.cache.get::<FeeShare>("ledger.referral_fee") {
            return Ok(cached);
        }
        let wire: WireFeeShare = self.get_json("fees/referral").await?;
        let share = FeeShare::new(wire.numerator, wire.denominator)?;
        self.cache.put(
            "ledger.referral_fee",
            &share,
            Some(INDEX_TTL),
            CacheTier::Memory,
        )?;
        Ok(share)
    }

    async fn deposit_addresses(&self) -> Result<Vec<String>> {
        if let Some(cached) = self.cache.get::<Vec<String>>("ledger.deposit_addresses") {
            return Ok(cached);
        }
        let addresses: Vec<String> = self.get_json("deposit-addresses").await?;
        self.cache.put(
            "ledger.deposit_addresses",
            &addresses,
            Some(INDEX_TTL),
            CacheTier::Memory,
        )?;
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_from_wire_maps_actions() {
        let deposit = event_from_wire(WireEvent {
            txid: "ab".into(),
            pubkey: "04".into(),
            signature: "sig".into(),
            action: 0,
            time: 10,
        })
        .unwrap();
        assert_eq!(deposit.action, LedgerAction::Deposit);
        assert_eq!(deposit.kind, DepositKind::Regular);

        let exit = event_from_wire(WireEvent {
            txid: "ab".into(),
            pubkey: "04".into(),
            signature: "sig".into(),
            action: 1,
            time: 20,
        })
        .unwrap();
        assert_eq!(exit.action, LedgerAction::Exit);

        assert!(event_from_wire(WireEvent {
            txid: "ab".into(),
            pubkey: "04".into(),
            signature: "sig".into(),
            action: 7,
            time: 30,
        })
        .is_err());
    }

    #[test]
    fn test_referral_sentinel_sets_kind() {
        let referral = event_from_wire(WireEvent {
            txid: "cd".into(),
            pubkey: "04".into(),
            signature: REFERRAL_SIGNATURE.into(),
            action: 0,
            time: 10,
        })
        .unwrap();
        assert_eq!(referral.kind, DepositKind::Referral);
    }

    #[test]
    fn test_withdraw_request_accepts_upstream_spelling() {
        let wire: WireWithdrawRequest = serde_json::from_str(
            r#"{"txid":"ab","pubkey":"04","signature":"s","time":5,"referal":true}"#,
        )
        .unwrap();
        assert!(wire.referral);
    }
}
