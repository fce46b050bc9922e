//! Crate-wide error type.
//!
//! Wallet operations are all-or-nothing: any variant returned from a build
//! or sign path means no transaction was produced or broadcast.

use libp2p::PeerId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("amount is below the dust threshold")]
    DustAmount,

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("signing failed: {0}")]
    SignFailure(String),

    #[error("transaction is already confirmed")]
    AlreadyConfirmed,

    #[error("transaction either doesn't exist or has already been spent")]
    BumpNotFound,

    #[error("invalid redeem script: {0}")]
    InvalidRedeemScript(RedeemScriptError),

    #[error("daemon unreachable: {0}")]
    RpcUnreachable(String),

    #[error("could not decode rpc response: {0}")]
    RpcDecode(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("peer {0} is banned")]
    PeerBanned(PeerId),

    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: PeerId, reason: String },

    #[error("stream reset: {0}")]
    StreamReset(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("currency {0} not tracked")]
    CurrencyUnknown(String),

    #[error("exchange rate: {0}")]
    ExchangeRate(String),

    #[error("migration failed: {0}")]
    MigrationFailed(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("malformed transaction: {0}")]
    MalformedTransaction(String),

    #[error("daemon: {0}")]
    Daemon(String),

    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedeemScriptError {
    #[error("unable to generate multisig script with {keys} keys and threshold {threshold}")]
    TooFewKeys { threshold: usize, keys: usize },

    #[error("timeout key must be set when a timeout is given")]
    MissingTimeoutKey,

    #[error("{0}")]
    Malformed(String),
}

impl From<RedeemScriptError> for Error {
    fn from(e: RedeemScriptError) -> Self {
        Error::InvalidRedeemScript(e)
    }
}

impl Error {
    /// True for transport failures that should invalidate a peer stream.
    pub fn is_stream_error(&self) -> bool {
        matches!(self, Error::StreamReset(_) | Error::Io(_))
    }
}
