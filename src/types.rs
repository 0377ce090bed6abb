//! Channel and Payment data model (spec §3).

use bitcoin::{PublicKey, Transaction, Txid};

/// A channel's lifecycle stage. Transitions are monotone: CONFIRMING ->
/// READY -> CLOSED, with CONFIRMING skippable under zeroconf. No backward
/// transition is ever observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Confirming,
    Ready,
    Closed,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Confirming => "CONFIRMING",
            ChannelState::Ready => "READY",
            ChannelState::Closed => "CLOSED",
        }
    }
}

/// One per funded 2-of-2 deposit.
#[derive(Debug, Clone)]
pub struct Channel {
    pub deposit_txid: Txid,
    pub deposit_tx: Transaction,
    pub merchant_pubkey: PublicKey,
    pub amount: u64,
    pub expires_at: u64,
    pub state: ChannelState,
    pub payment_tx: Option<Transaction>,
    pub last_payment_amount: u64,
}

/// One per accepted incremental payment. `amount` is the delta over the
/// previous accepted payment, i.e. this micropayment's own earnings.
#[derive(Debug, Clone)]
pub struct Payment {
    pub payment_txid: Txid,
    pub deposit_txid: Txid,
    pub payment_tx: Transaction,
    pub amount: u64,
    pub redeemed: bool,
}
