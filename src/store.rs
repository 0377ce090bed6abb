//! In-memory transactional channel/payment store (spec §4.4).
//!
//! Keeps two maps behind `parking_lot::Mutex`es. This is the store's own
//! internal consistency lock, distinct from `PaymentServer`'s process-wide
//! serializing mutex (spec §5) — the store lock alone is what protects the
//! lock-free `identify`/`status` read paths.

use std::collections::HashMap;

use bitcoin::{Transaction, Txid};
use parking_lot::Mutex;

use crate::types::{Channel, ChannelState, Payment};

#[derive(Default)]
pub struct ChannelStore {
    channels: Mutex<HashMap<Txid, Channel>>,
    payments: Mutex<HashMap<Txid, Payment>>,
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup_channel(&self, deposit_txid: Txid) -> Option<Channel> {
        self.channels.lock().get(&deposit_txid).cloned()
    }

    pub fn all_channels(&self) -> Vec<Channel> {
        self.channels.lock().values().cloned().collect()
    }

    /// Fails (returns `false`) if `deposit_txid` is already present.
    pub fn create_channel(
        &self,
        deposit_tx: Transaction,
        merchant_pubkey: bitcoin::PublicKey,
        amount: u64,
        expires_at: u64,
    ) -> bool {
        let deposit_txid = deposit_tx.compute_txid();
        let mut channels = self.channels.lock();
        if channels.contains_key(&deposit_txid) {
            return false;
        }
        channels.insert(
            deposit_txid,
            Channel {
                deposit_txid,
                deposit_tx,
                merchant_pubkey,
                amount,
                expires_at,
                state: ChannelState::Confirming,
                payment_tx: None,
                last_payment_amount: 0,
            },
        );
        true
    }

    pub fn update_state(&self, deposit_txid: Txid, state: ChannelState) {
        if let Some(channel) = self.channels.lock().get_mut(&deposit_txid) {
            channel.state = state;
        }
    }

    pub fn update_payment(&self, deposit_txid: Txid, payment_tx: Transaction, last_payment_amount: u64) {
        if let Some(channel) = self.channels.lock().get_mut(&deposit_txid) {
            channel.payment_tx = Some(payment_tx);
            channel.last_payment_amount = last_payment_amount;
        }
    }

    pub fn create_payment(&self, deposit_txid: Txid, payment_tx: Transaction, delta_amount: u64) {
        let payment_txid = payment_tx.compute_txid();
        self.payments.lock().insert(
            payment_txid,
            Payment {
                payment_txid,
                deposit_txid,
                payment_tx,
                amount: delta_amount,
                redeemed: false,
            },
        );
    }

    pub fn lookup_payment(&self, payment_txid: Txid) -> Option<Payment> {
        self.payments.lock().get(&payment_txid).cloned()
    }

    /// Atomic test-and-set: returns `true` iff this call flipped `redeemed`
    /// from false to true. The sole primitive guaranteeing at-most-once
    /// redemption under concurrency.
    pub fn redeem_payment(&self, payment_txid: Txid) -> bool {
        let mut payments = self.payments.lock();
        match payments.get_mut(&payment_txid) {
            Some(payment) if !payment.redeemed => {
                payment.redeemed = true;
                true
            }
            _ => false,
        }
    }
}
