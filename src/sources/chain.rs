//! Bitcoin chain source.
//!
//! Esplora-style REST client. Every lookup funnels through one bounded
//! semaphore shared across all investor tasks, and through the unified
//! cache keyed by request identity: confirmed transactions never change,
//! so they persist without expiry; address histories stay in memory with
//! a short TTL.

use crate::amount::Amount;
use crate::cache::{CacheStore, CacheTier};
use crate::models::{ChainTx, ChainTxInput, ChainTxOutput};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Fixed retry budget before a lookup escalates to a per-investor failure.
const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF_MS: u64 = 100;

/// Esplora pages confirmed address history 25 transactions at a time.
const HISTORY_PAGE_SIZE: usize = 25;

const TIP_TTL: Duration = Duration::from_secs(60);
const HISTORY_TTL: Duration = Duration::from_secs(60);
const UNCONFIRMED_TX_TTL: Duration = Duration::from_secs(60);

/// Read access to the bitcoin settlement layer.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// One transaction by id, with input prevouts resolved.
    async fn raw_transaction(&self, txid: &str) -> Result<ChainTx>;
    /// Every transaction touching an address, oldest first.
    async fn address_history(&self, address: &str) -> Result<Vec<ChainTx>>;
}

// Esplora wire shapes.

#[derive(Debug, Clone, Deserialize)]
struct EsploraStatus {
    confirmed: bool,
    block_height: Option<u64>,
    block_time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct EsploraVout {
    scriptpubkey_address: Option<String>,
    value: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct EsploraVin {
    prevout: Option<EsploraVout>,
}

#[derive(Debug, Clone, Deserialize)]
struct EsploraTx {
    txid: String,
    status: EsploraStatus,
    vin: Vec<EsploraVin>,
    vout: Vec<EsploraVout>,
}

fn chain_tx_from_esplora(tx: EsploraTx, tip_height: u64) -> ChainTx {
    let confirmations = match (tx.status.confirmed, tx.status.block_height) {
        (true, Some(height)) => tip_height.saturating_sub(height) + 1,
        _ => 0,
    };
    ChainTx {
        txid: tx.txid,
        confirmations,
        time: tx.status.block_time.unwrap_or(0),
        inputs: tx
            .vin
            .into_iter()
            .map(|vin| match vin.prevout {
                Some(prev) => ChainTxInput {
                    prev_address: prev.scriptpubkey_address,
                    prev_value: prev.value as Amount,
                },
                None => ChainTxInput {
                    prev_address: None,
                    prev_value: 0,
                },
            })
            .collect(),
        outputs: tx
            .vout
            .into_iter()
            .map(|vout| ChainTxOutput {
                address: vout.scriptpubkey_address,
                value: vout.value as Amount,
            })
            .collect(),
    }
}

fn is_txid(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

pub struct EsploraClient {
    http: Client,
    base_url: String,
    cache: Arc<CacheStore>,
    request_sem: Arc<Semaphore>,
}

impl EsploraClient {
    pub fn new(
        base_url: &str,
        cache: Arc<CacheStore>,
        max_concurrent_requests: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("fundrecon/0.1 (chain reader)")
            .build()
            .context("failed to build chain HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache,
            request_sem: Arc::new(Semaphore::new(max_concurrent_requests.max(1))),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        let mut backoff = INITIAL_BACKOFF_MS;

        for attempt in 0..MAX_ATTEMPTS {
            let result = {
                let _permit = self
                    .request_sem
                    .acquire()
                    .await
                    .context("chain request semaphore closed")?;
                self.http.get(&url).send().await
            };
            match result {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<T>()
                        .await
                        .with_context(|| format!("failed to parse response from {url}"));
                }
                Ok(response) => {
                    warn!(%url, status = %response.status(), attempt, "chain request failed");
                }
                Err(e) => {
                    warn!(%url, error = %e, attempt, "chain request error");
                }
            }
            sleep(Duration::from_millis(backoff)).await;
            backoff *= 2;
        }

        bail!("maxed out retries ({MAX_ATTEMPTS}) for {url}");
    }

    async fn tip_height(&self) -> Result<u64> {
        if let Some(tip) = self.cache.get::<u64>("chain.tip") {
            return Ok(tip);
        }
        let tip: u64 = self.get_json("blocks/tip/height").await?;
        self.cache
            .put("chain.tip", &tip, Some(TIP_TTL), CacheTier::Memory)?;
        Ok(tip)
    }

    async fn fetch_transaction(&self, txid: &str, tip: u64) -> Result<ChainTx> {
        let cache_key = format!("tx.{txid}");
        if let Some(tx) = self.cache.get::<ChainTx>(&cache_key) {
            return Ok(tx);
        }

        let wire: EsploraTx = self.get_json(&format!("tx/{txid}")).await?;
        let tx = chain_tx_from_esplora(wire, tip);

        if tx.confirmations > 0 {
            self.cache.put(&cache_key, &tx, None, CacheTier::Persistent)?;
        } else {
            self.cache
                .put(&cache_key, &tx, Some(UNCONFIRMED_TX_TTL), CacheTier::Memory)?;
        }
        Ok(tx)
    }
}

#[async_trait]
impl ChainSource for EsploraClient {
    async fn raw_transaction(&self, txid: &str) -> Result<ChainTx> {
        if !is_txid(txid) {
            bail!("invalid transaction id {txid}");
        }
        let tip = self.tip_height().await?;
        self.fetch_transaction(txid, tip).await
    }

    async fn address_history(&self, address: &str) -> Result<Vec<ChainTx>> {
        let cache_key = format!("addresstx.{address}");
        if let Some(history) = self.cache.get::<Vec<ChainTx>>(&cache_key) {
            return Ok(history);
        }

        let tip = self.tip_height().await?;
        let mut history: Vec<ChainTx> = Vec::new();
        let mut last_seen: Option<String> = None;

        loop {
            let path = match &last_seen {
                Some(txid) => format!("address/{address}/txs/chain/{txid}"),
                None => format!("address/{address}/txs/chain"),
            };
            let page: Vec<EsploraTx> = self.get_json(&path).await?;
            let page_len = page.len();

            for wire in page {
                if !wire.status.confirmed {
                    continue;
                }
                history.push(chain_tx_from_esplora(wire, tip));
            }

            match history.last() {
                Some(tx) if page_len == HISTORY_PAGE_SIZE => {
                    last_seen = Some(tx.txid.clone());
                }
                _ => break,
            }
        }

        // Esplora pages newest-first; matching walks oldest-first.
        history.reverse();
        debug!(address, count = history.len(), "fetched address history");
        self.cache
            .put(&cache_key, &history, Some(HISTORY_TTL), CacheTier::Memory)?;
        Ok(history)
    }
}
