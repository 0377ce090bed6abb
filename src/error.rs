//! Crate-wide error type.
//!
//! One variant per error kind distinguished in the protocol (bad client
//! input, signature/locktime failures, unknown ids, a channel that isn't
//! ready, a payment already redeemed) plus passthrough variants for
//! downstream wallet/blockchain failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PaymentError {
    /// Client-supplied transaction or script is malformed, inconsistent,
    /// underpays fees/dust, or fails a structural check.
    #[error("bad transaction: {0}")]
    BadTransaction(String),

    /// A signature or locktime fails verification in a context where the
    /// client may retry with corrected input.
    #[error("transaction verification failed: {0}")]
    TransactionVerificationError(String),

    /// A referenced deposit or payment id is unknown to the store.
    #[error("not found: {0}")]
    PaymentChannelNotFound(String),

    /// The operation requires a ready channel and the channel isn't.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// The referenced payment has already been redeemed.
    #[error("already redeemed: {0}")]
    RedeemPayment(String),

    /// The wallet adapter failed (key store I/O, signing failure).
    #[error("wallet error: {0}")]
    Wallet(String),

    /// The blockchain adapter failed (network I/O, malformed response).
    #[error("blockchain error: {0}")]
    Blockchain(String),
}

pub type Result<T> = std::result::Result<T, PaymentError>;
