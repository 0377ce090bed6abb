//! The payment server: channel lifecycle orchestration (spec §4.5).
//!
//! All mutating operations (`open`, `receive_payment`, `close`, `redeem`,
//! each `sync` tick) acquire a single process-wide lock before touching the
//! store and hold it across any blocking wallet/blockchain I/O — this is
//! what makes "verify then persist" atomic and is the sole source of the
//! monotonicity and at-most-once guarantees in spec §5. `identify` and
//! `status` are read-only and never take the lock.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitcoin::hashes::{sha256, Hash};
use bitcoin::{ScriptBuf, Transaction, Txid};
use parking_lot::{Condvar, Mutex};
use secp256k1::{Message, Secp256k1};
use serde::Serialize;

use crate::blockchain::BlockchainClient;
use crate::config::Config;
use crate::error::{PaymentError, Result};
use crate::script::PaymentChannelRedeemScript;
use crate::store::ChannelStore;
use crate::transaction::{build_half_signed_script_sig, parse_half_signed_input, redeem_script_from_input, verify_customer_signature};
use crate::types::ChannelState;
use crate::wallet::Wallet;

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs()
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentifyResponse {
    pub public_key: String,
    pub version: u32,
    pub zeroconf: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub balance: u64,
    pub time_left: u64,
}

struct Inner {
    wallet: Box<dyn Wallet>,
    blockchain: Box<dyn BlockchainClient>,
    store: ChannelStore,
    config: Config,
    zeroconf: bool,
    lock: Mutex<()>,
}

/// Shared stop flag + condition variable the background sync task waits on,
/// so a shutdown wakes it immediately instead of waiting out the period.
struct SyncControl {
    stop: Mutex<bool>,
    cond: Condvar,
}

pub struct PaymentServer {
    inner: Arc<Inner>,
    control: Arc<SyncControl>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PaymentServer {
    pub fn new(wallet: Box<dyn Wallet>, blockchain: Box<dyn BlockchainClient>, config: Config, zeroconf: bool) -> Self {
        let inner = Arc::new(Inner {
            wallet,
            blockchain,
            store: ChannelStore::new(),
            config,
            zeroconf,
            lock: Mutex::new(()),
        });
        let control = Arc::new(SyncControl {
            stop: Mutex::new(false),
            cond: Condvar::new(),
        });

        let worker = {
            let inner = Arc::clone(&inner);
            let control = Arc::clone(&control);
            let period = config.sync_period;
            thread::Builder::new()
                .name("paychan-sync".into())
                .spawn(move || sync_worker_loop(inner, control, period))
                .expect("failed to spawn sync worker thread")
        };

        Self {
            inner,
            control,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Stop the background sync worker and join it. In-flight request
    /// handlers are unaffected; only the worker's own next wait is
    /// interrupted.
    pub fn shutdown(&self) {
        {
            let mut stop = self.control.stop.lock();
            *stop = true;
            self.control.cond.notify_one();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn identify(&self) -> IdentifyResponse {
        IdentifyResponse {
            public_key: hex::encode(self.inner.wallet.get_payout_public_key().to_bytes()),
            version: self.inner.config.protocol_version,
            zeroconf: self.inner.zeroconf,
        }
    }

    pub fn status(&self, deposit_txid: &str) -> Result<StatusResponse> {
        let txid = parse_txid(deposit_txid)?;
        let channel = self
            .inner
            .store
            .lookup_channel(txid)
            .ok_or_else(|| PaymentError::PaymentChannelNotFound("related channel not found".into()))?;
        Ok(StatusResponse {
            status: channel.state.as_str().to_string(),
            balance: channel.last_payment_amount,
            time_left: channel.expires_at,
        })
    }

    pub fn open(&self, deposit_tx_hex: &str, redeem_script_hex: &str) -> Result<String> {
        let _guard = self.inner.lock.lock();

        let deposit_tx = decode_tx(deposit_tx_hex)?;
        let redeem_script_bytes =
            hex::decode(redeem_script_hex).map_err(|e| PaymentError::BadTransaction(format!("invalid hex: {e}")))?;
        let redeem_script = PaymentChannelRedeemScript::from_bytes(&redeem_script_bytes)?;

        let script_pubkey = ScriptBuf::new_p2sh(&redeem_script.hash160());
        let output_index = deposit_tx
            .output
            .iter()
            .position(|o| o.script_pubkey == script_pubkey)
            .ok_or_else(|| PaymentError::BadTransaction("deposit does not pay to the provided script hash".into()))?;

        let deposit_txid = deposit_tx.compute_txid();
        let amount = deposit_tx.output[output_index].value.to_sat();
        let merchant_public_key = redeem_script.merchant_public_key;

        if !self.inner.wallet.validate_public_key(&merchant_public_key) {
            return Err(PaymentError::BadTransaction("public key does not belong to the merchant".into()));
        }

        if self.inner.store.lookup_channel(deposit_txid).is_some() {
            return Err(PaymentError::BadTransaction(
                "that deposit has already been used to create a channel".into(),
            ));
        }

        // See DESIGN.md for why this follows the original's `< now + MIN_EXP_TIME - 1`
        // rather than a stricter `< now + MIN_EXP_TIME`.
        let minimum_locktime = now() + self.inner.config.min_exp_time - 1;
        if (redeem_script.expiration_time as u64) < minimum_locktime {
            return Err(PaymentError::TransactionVerificationError(
                "transaction locktime must be further in the future".into(),
            ));
        }

        self.inner
            .store
            .create_channel(deposit_tx, merchant_public_key, amount, redeem_script.expiration_time as u64);

        if self.inner.zeroconf {
            self.inner.store.update_state(deposit_txid, ChannelState::Ready);
        }

        tracing::info!(%deposit_txid, zeroconf = self.inner.zeroconf, "opened payment channel");
        Ok(deposit_txid.to_string())
    }

    pub fn receive_payment(&self, deposit_txid: &str, payment_tx_hex: &str) -> Result<String> {
        let _guard = self.inner.lock.lock();

        // 1. Parse payment_tx.
        let payment_tx = decode_tx(payment_tx_hex)?;

        // 2. Look up channel.
        let deposit_txid_parsed = parse_txid(deposit_txid)?;
        let channel = self
            .inner
            .store
            .lookup_channel(deposit_txid_parsed)
            .ok_or_else(|| PaymentError::PaymentChannelNotFound("related channel not found".into()))?;

        // 3-5. Shape check (exactly 3 items, middle one the merchant-signature
        // placeholder), redeem script, and customer signature, all in one
        // pass; merchant pubkey must match the channel's.
        let half_signed = parse_half_signed_input(&payment_tx)?;
        let redeem_script = half_signed.redeem_script;
        if redeem_script.merchant_public_key != channel.merchant_pubkey {
            return Err(PaymentError::BadTransaction("invalid merchant pubkey".into()));
        }
        verify_customer_signature(&payment_tx, &redeem_script, half_signed.signature_der, &redeem_script.customer_public_key)?;

        // 6. Channel state gate.
        match channel.state {
            ChannelState::Confirming => {
                if self.inner.blockchain.check_confirmed(deposit_txid_parsed)? {
                    self.inner.store.update_state(deposit_txid_parsed, ChannelState::Ready);
                } else {
                    return Err(PaymentError::ChannelClosed("payment channel not ready".into()));
                }
            }
            ChannelState::Closed => return Err(PaymentError::ChannelClosed("payment channel closed".into())),
            ChannelState::Ready => {}
        }

        // 7. Locate the merchant-paying output.
        let merchant_script = ScriptBuf::new_p2pkh(&redeem_script.merchant_public_key.pubkey_hash());
        let merchant_index = payment_tx
            .output
            .iter()
            .position(|o| o.script_pubkey == merchant_script)
            .ok_or_else(|| PaymentError::BadTransaction("payment must pay to merchant pubkey".into()))?;

        // 8. Dust check.
        for (index, output) in payment_tx.output.iter().enumerate() {
            if output.value.to_sat() < self.inner.config.dust_limit {
                if index == merchant_index {
                    return Err(PaymentError::BadTransaction(format!(
                        "initial payment must be greater than {}",
                        self.inner.config.dust_limit
                    )));
                }
                return Err(PaymentError::BadTransaction(
                    "payment channel balance is not large enough to make payment".into(),
                ));
            }
        }

        // 9. Monotonicity.
        let new_merchant_amount = payment_tx.output[merchant_index].value.to_sat();
        if new_merchant_amount <= channel.last_payment_amount {
            return Err(PaymentError::BadTransaction(
                "payment must be greater than the previous payment".into(),
            ));
        }

        // 10. Fee adequacy.
        let total_out: u64 = payment_tx.output.iter().map(|o| o.value.to_sat()).sum();
        let fee = channel
            .amount
            .checked_sub(total_out)
            .ok_or_else(|| PaymentError::BadTransaction("payment must have adequate fees".into()))?;
        if fee < self.inner.config.min_tx_fee {
            return Err(PaymentError::BadTransaction("payment must have adequate fees".into()));
        }

        // 11. Redeem script reconstruction integrity.
        let reconstructed_script =
            PaymentChannelRedeemScript::new(channel.merchant_pubkey, redeem_script.customer_public_key, channel.expires_at as i64);
        if reconstructed_script.to_bytes() != redeem_script.to_bytes() {
            return Err(PaymentError::BadTransaction("invalid redeem script".into()));
        }

        // 12. Whole-transaction integrity: strict byte-equality reconstruction.
        let mut reconstructed_tx = self
            .inner
            .wallet
            .create_unsigned_payment_tx(&channel.deposit_tx, &redeem_script, new_merchant_amount, fee)?;
        reconstructed_tx.input[0].script_sig = build_half_signed_script_sig(half_signed.signature_der, &redeem_script)?;
        if bitcoin::consensus::serialize(&reconstructed_tx) != bitcoin::consensus::serialize(&payment_tx) {
            return Err(PaymentError::BadTransaction("invalid payment channel transaction structure".into()));
        }

        // 13. Persist.
        self.inner
            .store
            .update_payment(deposit_txid_parsed, payment_tx.clone(), new_merchant_amount);
        self.inner.store.create_payment(
            deposit_txid_parsed,
            payment_tx.clone(),
            new_merchant_amount - channel.last_payment_amount,
        );

        let payment_txid = payment_tx.compute_txid();
        tracing::info!(%deposit_txid_parsed, %payment_txid, amount = new_merchant_amount, "accepted payment");
        Ok(payment_txid.to_string())
    }

    pub fn close(&self, deposit_txid: &str, signature_hex: &str) -> Result<String> {
        let _guard = self.inner.lock.lock();

        let deposit_txid_parsed = parse_txid(deposit_txid)?;
        let channel = self
            .inner
            .store
            .lookup_channel(deposit_txid_parsed)
            .ok_or_else(|| PaymentError::PaymentChannelNotFound("related channel not found".into()))?;

        let signature_bytes =
            hex::decode(signature_hex).map_err(|_| PaymentError::TransactionVerificationError("invalid signature provided".into()))?;
        let signature = secp256k1::ecdsa::Signature::from_der(&signature_bytes)
            .map_err(|_| PaymentError::TransactionVerificationError("invalid signature provided".into()))?;

        let mut payment_tx = channel
            .payment_tx
            .clone()
            .ok_or_else(|| PaymentError::BadTransaction("no payments made in channel".into()))?;

        let redeem_script = redeem_script_from_input(&payment_tx)?;

        // Proof of possession of the customer key over the ASCII channel
        // identifier, not a Bitcoin sighash.
        let digest = sha256::Hash::hash(deposit_txid.as_bytes());
        let msg = Message::from_digest(digest.to_byte_array());
        let secp = Secp256k1::verification_only();
        secp.verify_ecdsa(&msg, &signature, &redeem_script.customer_public_key.inner)
            .map_err(|_| PaymentError::TransactionVerificationError("invalid signature".into()))?;

        self.inner.wallet.sign_half_signed_payment(&mut payment_tx, &redeem_script)?;
        self.inner.blockchain.broadcast_tx(&payment_tx)?;
        self.inner.store.update_state(deposit_txid_parsed, ChannelState::Closed);

        let final_txid = payment_tx.compute_txid();
        tracing::info!(%deposit_txid_parsed, %final_txid, "closed payment channel");
        Ok(final_txid.to_string())
    }

    pub fn redeem(&self, payment_txid: &str) -> Result<u64> {
        let _guard = self.inner.lock.lock();

        let txid = payment_txid
            .parse::<Txid>()
            .map_err(|_| PaymentError::PaymentChannelNotFound("payment not found".into()))?;
        let payment = self
            .inner
            .store
            .lookup_payment(txid)
            .ok_or_else(|| PaymentError::PaymentChannelNotFound("payment not found".into()))?;
        let channel = self
            .inner
            .store
            .lookup_channel(payment.deposit_txid)
            .ok_or_else(|| PaymentError::PaymentChannelNotFound("channel not found".into()))?;

        match channel.state {
            ChannelState::Confirming => return Err(PaymentError::ChannelClosed("payment channel not ready".into())),
            ChannelState::Closed => return Err(PaymentError::ChannelClosed("payment channel closed".into())),
            ChannelState::Ready => {}
        }

        if !self.inner.store.redeem_payment(txid) {
            return Err(PaymentError::RedeemPayment("payment already redeemed".into()));
        }
        Ok(payment.amount)
    }

    /// Run one `sync` tick synchronously. Exposed for tests and for callers
    /// that want deterministic control over when syncing happens instead of
    /// relying on the background worker.
    pub fn sync(&self) {
        run_sync_tick(&self.inner);
    }
}

impl Drop for PaymentServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sync_worker_loop(inner: Arc<Inner>, control: Arc<SyncControl>, period: Duration) {
    loop {
        let mut stop = control.stop.lock();
        let result = control.cond.wait_for(&mut stop, period);
        let should_stop = *stop;
        drop(stop);

        if should_stop {
            break;
        }
        if result.timed_out() {
            run_sync_tick(&inner);
        }
    }
}

fn run_sync_tick(inner: &Arc<Inner>) {
    let _guard = inner.lock.lock();
    for channel in inner.store.all_channels() {
        if channel.state == ChannelState::Closed {
            continue;
        }
        let deposit_txid = channel.deposit_txid;
        if let Err(e) = sync_channel(inner, channel) {
            tracing::error!(%deposit_txid, error = %e, "sync tick failed for channel");
        }
    }
}

fn sync_channel(inner: &Arc<Inner>, mut channel: crate::types::Channel) -> Result<()> {
    let deposit_txid = channel.deposit_txid;

    // Confirmation promotion.
    if channel.state == ChannelState::Confirming && inner.blockchain.check_confirmed(deposit_txid)? {
        inner.store.update_state(deposit_txid, ChannelState::Ready);
        channel.state = ChannelState::Ready;
    }

    // Foreign spend detection: must run (and short-circuit CLOSED) before
    // the pre-expiry broadcast below.
    if matches!(channel.state, ChannelState::Confirming | ChannelState::Ready) {
        if let Some(payment_tx) = channel.payment_tx.as_ref() {
            let redeem_script = redeem_script_from_input(payment_tx)?;
            let script_pubkey = ScriptBuf::new_p2sh(&redeem_script.hash160());
            if let Some(index) = channel.deposit_tx.output.iter().position(|o| o.script_pubkey == script_pubkey) {
                if inner.blockchain.lookup_spend_txid(deposit_txid, index as u32)?.is_some() {
                    inner.store.update_state(deposit_txid, ChannelState::Closed);
                    channel.state = ChannelState::Closed;
                }
            }
        }
    }

    // Pre-expiry broadcast.
    if channel.state != ChannelState::Closed && now() + inner.config.exp_time_buffer > channel.expires_at {
        if let Some(mut payment_tx) = channel.payment_tx.clone() {
            let redeem_script = redeem_script_from_input(&payment_tx)?;
            inner.wallet.sign_half_signed_payment(&mut payment_tx, &redeem_script)?;
            inner.blockchain.broadcast_tx(&payment_tx)?;
            inner.store.update_payment(deposit_txid, payment_tx, channel.last_payment_amount);
            inner.store.update_state(deposit_txid, ChannelState::Closed);
            tracing::info!(%deposit_txid, "broadcast pre-expiry close");
        }
    }

    Ok(())
}

fn parse_txid(s: &str) -> Result<Txid> {
    s.parse()
        .map_err(|e| PaymentError::PaymentChannelNotFound(format!("invalid txid: {e}")))
}

fn decode_tx(hex_str: &str) -> Result<Transaction> {
    let bytes = hex::decode(hex_str).map_err(|e| PaymentError::BadTransaction(format!("invalid hex: {e}")))?;
    bitcoin::consensus::deserialize(&bytes).map_err(|e| PaymentError::BadTransaction(format!("malformed transaction: {e}")))
}
