//! Phore wallet engine and OpenBazaar peer messaging core.
//!
//! [`wallet`] drives a phored full node over JSON-RPC and builds, signs
//! and broadcasts spends and 2-of-3 escrow transactions. [`net`] carries
//! length-delimited protobuf messages between peers and dispatches them to
//! application handlers, which reach the wallet and the network through
//! the traits in [`ports`].

pub mod config;
pub mod error;
pub mod exchange;
pub mod logging;
pub mod migrations;
pub mod net;
pub mod node;
pub mod notifications;
pub mod ports;
pub mod wallet;

pub use error::{Error, Result};
