//! Server-side engine for a two-party Bitcoin payment channel protocol.
//!
//! A channel is a 2-of-2 multisig deposit with a CLTV-gated refund branch
//! (`script`, `transaction`). Clients submit half-signed payment
//! transactions that monotonically increase the merchant's balance
//! (`server::receive_payment`); the merchant co-signs and broadcasts the
//! last one either on an explicit `close` or automatically as the refund
//! deadline approaches (`server::sync`). `wallet` and `blockchain` are the
//! two adapter seams a deployment plugs in.

pub mod blockchain;
pub mod config;
pub mod error;
pub mod script;
pub mod server;
pub mod store;
pub mod transaction;
pub mod types;
pub mod wallet;

pub use blockchain::{BlockchainClient, HttpBlockchainClient};
pub use config::Config;
pub use error::{PaymentError, Result};
pub use script::PaymentChannelRedeemScript;
pub use server::{IdentifyResponse, PaymentServer, StatusResponse};
pub use types::{Channel, ChannelState, Payment};
pub use wallet::{Secp256k1Wallet, Wallet};
