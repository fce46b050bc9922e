//! Interfaces handlers use to reach the wallet and the network.
//!
//! The protocol service hands both to every handler call, so neither side
//! holds a reference to the other.

use async_trait::async_trait;
use libp2p::PeerId;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::net::pb::Message;
use crate::wallet::keys::{ExtendedKey, SigningKey};
use crate::wallet::multisig::{Signature, TransactionInput, TransactionOutput, Utxo};
use crate::wallet::{Address, FeeLevel, KeyPurpose};

#[async_trait]
pub trait WalletPort: Send + Sync {
    fn currency_code(&self) -> &'static str;

    fn is_dust(&self, amount: u64) -> bool;

    async fn fee_per_byte(&self, level: FeeLevel) -> u64;

    async fn current_address(&self, purpose: KeyPurpose) -> Result<Address>;

    /// Pay `amount` base units to `address`; returns the broadcast txid.
    async fn spend(&self, amount: u64, address: &Address, level: FeeLevel) -> Result<String>;

    fn estimate_fee(&self, ins: &[TransactionInput], outs: &[TransactionOutput], fee_per_byte: u64) -> u64;

    fn generate_multisig_script(
        &self,
        keys: &[ExtendedKey],
        threshold: usize,
        timeout: Duration,
        timeout_key: Option<&ExtendedKey>,
    ) -> Result<(Address, Vec<u8>)>;

    fn create_multisig_signature(
        &self,
        ins: &[TransactionInput],
        outs: &[TransactionOutput],
        key: &SigningKey,
        redeem_script: &[u8],
        fee_per_byte: u64,
    ) -> Result<Vec<Signature>>;

    /// Serialized, fully witnessed escrow spend.
    #[allow(clippy::too_many_arguments)]
    async fn multisign(
        &self,
        ins: &[TransactionInput],
        outs: &[TransactionOutput],
        sigs1: &[Signature],
        sigs2: &[Signature],
        redeem_script: &[u8],
        fee_per_byte: u64,
        broadcast: bool,
    ) -> Result<Vec<u8>>;

    async fn sweep_address(
        &self,
        utxos: &[Utxo],
        address: Option<&Address>,
        key: &SigningKey,
        redeem_script: Option<&[u8]>,
        level: FeeLevel,
    ) -> Result<String>;

    async fn add_watched_script(&self, script: &[u8]) -> Result<()>;
}

#[async_trait]
pub trait NetworkPort: Send + Sync {
    /// Send `msg` and wait for the peer's reply.
    async fn send_request(&self, ctx: &CancellationToken, peer: PeerId, msg: Message) -> Result<Message>;

    async fn send_message(&self, ctx: &CancellationToken, peer: PeerId, msg: Message) -> Result<()>;

    /// Publish to local subscribers. Returns how many received it.
    fn broadcast(&self, payload: Vec<u8>) -> usize;
}
