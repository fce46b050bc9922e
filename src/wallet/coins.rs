//! Spendable coin enumeration and selection.

use std::cmp::Reverse;
use std::collections::HashMap;

use super::address::Address;
use super::keys::SigningKey;
use super::params::NetParams;
use super::rpc::NodeRpc;
use super::to_base_units;
use super::tx::OutPoint;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Coin {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_pubkey: Vec<u8>,
    pub confirmations: i64,
    pub address: String,
}

/// Every spendable UTXO with the key that spends it. Keys are exported
/// from the daemon; a failure on any UTXO fails the whole gather.
pub async fn gather_coins(rpc: &dyn NodeRpc, params: &NetParams) -> Result<HashMap<Coin, SigningKey>> {
    let unspent = rpc.list_unspent().await?;
    let mut coins = HashMap::with_capacity(unspent.len());
    for u in unspent.into_iter().filter(|u| u.spendable) {
        let address = Address::decode(&u.address, params)?;
        let wif = rpc.dump_priv_key(&u.address).await?;
        let key = SigningKey::from_wif(&wif, params)?;
        let coin = Coin {
            outpoint: OutPoint::from_hex(&u.txid, u.vout)?,
            value: to_base_units(u.amount).max(0) as u64,
            script_pubkey: address.script_pubkey(),
            confirmations: u.confirmations,
            address: u.address,
        };
        coins.insert(coin, key);
    }
    Ok(coins)
}

/// Prefers coins with the largest value × confirmations; ties go to the
/// older coin, then the larger one.
#[derive(Debug, Clone, Copy)]
pub struct MaxValueAgeSelector {
    pub max_inputs: usize,
    pub min_change: u64,
}

impl Default for MaxValueAgeSelector {
    fn default() -> Self {
        Self { max_inputs: 10_000, min_change: 10_000 }
    }
}

impl MaxValueAgeSelector {
    pub fn select(&self, target: u64, coins: &[Coin]) -> Result<Vec<Coin>> {
        let mut ranked: Vec<&Coin> = coins.iter().collect();
        ranked.sort_by_key(|c| {
            let confs = c.confirmations.max(0) as u64;
            (
                Reverse(c.value as u128 * confs as u128),
                Reverse(confs),
                Reverse(c.value),
                c.outpoint.txid_hex(),
                c.outpoint.vout,
            )
        });

        let goal = target.saturating_add(self.min_change);
        let mut total = 0u64;
        let mut selected = Vec::new();
        for coin in ranked.into_iter().take(self.max_inputs) {
            total += coin.value;
            selected.push(coin.clone());
            if total >= goal {
                return Ok(selected);
            }
        }
        Err(Error::InsufficientFunds)
    }
}
