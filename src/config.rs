//! Protocol constants and blockchain endpoint resolution (spec §6).

use std::time::Duration;

use bitcoin::Network;

/// Minimum allowable output value, in satoshis, before a transaction is
/// considered non-standard. Fixed by the protocol, not configurable.
pub const DUST_LIMIT: u64 = 3_000;

/// Buffer before refund expiry at which `sync` force-broadcasts the latest
/// payment. Three days, conservatively longer than any reasonable mempool
/// residence time for the customer's own refund transaction.
pub const EXP_TIME_BUFFER: u64 = 3 * 24 * 3_600;

/// Wire protocol version returned by `identify`.
pub const PROTOCOL_VERSION: u32 = 2;

/// Default period between `sync` ticks.
pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(600);

/// Host environment variable overriding the blockchain provider's base URL.
pub const PROVIDER_HOST_ENV_VAR: &str = "PAYCHAN_PROVIDER_HOST";

const DEFAULT_PROVIDER_HOST: &str = "https://blockchain.21.co";

/// Deployment-tunable protocol parameters.
///
/// `min_tx_fee` and `min_exp_time` have no universal default: a deployment
/// must pick values appropriate to its fee market and desired refund
/// window. Everything else has a fixed protocol value.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub min_tx_fee: u64,
    pub dust_limit: u64,
    pub min_exp_time: u64,
    pub exp_time_buffer: u64,
    pub protocol_version: u32,
    pub sync_period: Duration,
}

impl Config {
    pub fn new(min_tx_fee: u64, min_exp_time: u64) -> Self {
        Self {
            min_tx_fee,
            dust_limit: DUST_LIMIT,
            min_exp_time,
            exp_time_buffer: EXP_TIME_BUFFER,
            protocol_version: PROTOCOL_VERSION,
            sync_period: DEFAULT_SYNC_PERIOD,
        }
    }

    pub fn with_sync_period(mut self, sync_period: Duration) -> Self {
        self.sync_period = sync_period;
        self
    }
}

/// Resolve the blockchain provider's URL for `network`, honoring
/// `PAYCHAN_PROVIDER_HOST` the way the original resolved
/// `TWO1_PROVIDER_HOST`.
pub fn blockchain_url(network: Network) -> String {
    let host = std::env::var(PROVIDER_HOST_ENV_VAR).unwrap_or_else(|_| DEFAULT_PROVIDER_HOST.into());
    match network {
        Network::Bitcoin => format!("{host}/blockchain/bitcoin"),
        _ => format!("{host}/blockchain/testnet3"),
    }
}
