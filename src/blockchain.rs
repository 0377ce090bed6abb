//! Blockchain adapter contract (spec §4.3): confirmation queries, spend
//! lookups, broadcast.

use bitcoin::{Transaction, Txid};
use serde::Deserialize;

use crate::config::blockchain_url;
use crate::error::{PaymentError, Result};

pub trait BlockchainClient: Send + Sync {
    /// Is `txid` included in a confirmed block?
    fn check_confirmed(&self, txid: Txid) -> Result<bool>;

    /// The txid spending `(txid, output_index)`, if any exists on chain.
    fn lookup_spend_txid(&self, txid: Txid, output_index: u32) -> Result<Option<Txid>>;

    /// Push a raw transaction to the network. Idempotent from the caller's
    /// perspective: broadcasting an already-known transaction is not an
    /// error.
    fn broadcast_tx(&self, tx: &Transaction) -> Result<()>;
}

/// Reference implementation against the explorer-style HTTP API of spec §6
/// (`<HOST>/blockchain/bitcoin` or `.../testnet3`).
pub struct HttpBlockchainClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpBlockchainClient {
    pub fn new(network: bitcoin::Network) -> Self {
        Self {
            base_url: blockchain_url(network),
            client: reqwest::blocking::Client::new(),
        }
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::blocking::Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TxStatusResponse {
    confirmations: u64,
}

#[derive(Debug, Deserialize)]
struct SpendResponse {
    spent: bool,
    #[serde(default)]
    txid: Option<String>,
}

impl BlockchainClient for HttpBlockchainClient {
    fn check_confirmed(&self, txid: Txid) -> Result<bool> {
        let url = format!("{}/transactions/{}", self.base_url, txid);
        let resp: TxStatusResponse = self
            .client
            .get(&url)
            .send()
            .map_err(|e| PaymentError::Blockchain(format!("check_confirmed request failed: {e}")))?
            .json()
            .map_err(|e| PaymentError::Blockchain(format!("check_confirmed decode failed: {e}")))?;
        Ok(resp.confirmations >= 1)
    }

    fn lookup_spend_txid(&self, txid: Txid, output_index: u32) -> Result<Option<Txid>> {
        let url = format!("{}/transactions/{}/outputs/{}/spend", self.base_url, txid, output_index);
        let resp: SpendResponse = self
            .client
            .get(&url)
            .send()
            .map_err(|e| PaymentError::Blockchain(format!("lookup_spend_txid request failed: {e}")))?
            .json()
            .map_err(|e| PaymentError::Blockchain(format!("lookup_spend_txid decode failed: {e}")))?;

        if !resp.spent {
            return Ok(None);
        }
        let txid_hex = resp
            .txid
            .ok_or_else(|| PaymentError::Blockchain("spend reported without a txid".into()))?;
        let spend_txid: Txid = txid_hex
            .parse()
            .map_err(|e| PaymentError::Blockchain(format!("bad spend txid: {e}")))?;
        Ok(Some(spend_txid))
    }

    fn broadcast_tx(&self, tx: &Transaction) -> Result<()> {
        let hex = bitcoin::consensus::encode::serialize_hex(tx);
        let url = format!("{}/transactions", self.base_url);
        self.client
            .post(&url)
            .json(&serde_json::json!({ "hex": hex }))
            .send()
            .map_err(|e| PaymentError::Blockchain(format!("broadcast failed: {e}")))?;
        Ok(())
    }
}
