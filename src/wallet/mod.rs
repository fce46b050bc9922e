//! Phore wallet engine driven by a phored full node over JSON-RPC.

pub mod address;
pub mod builder;
pub mod coins;
pub mod daemon;
pub mod fees;
pub mod keys;
pub mod multisig;
pub mod notify;
pub mod params;
pub mod rpc;
pub mod rpc_wallet;
pub mod script;
pub mod tx;

#[cfg(test)]
pub(crate) mod testutil;

pub use address::Address;
pub use fees::FeeLevel;
pub use keys::{ExtendedKey, SigningKey};
pub use params::NetParams;
pub use rpc::{NodeRpc, RpcClient};
pub use rpc_wallet::RpcWallet;

/// Daemon account every address and import is filed under.
pub const ACCOUNT: &str = "OpenBazaar";
pub const CURRENCY_CODE: &str = "phr";
pub const UNITS_PER_COIN: u64 = 100_000_000;

/// Convert a daemon coin amount to base units, rounding to the nearest unit.
pub fn to_base_units(coins: f64) -> i64 {
    (coins * UNITS_PER_COIN as f64).round() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    External,
    Internal,
}
