//! Spend construction: coin selection, change, BIP69 ordering and signing.

use std::collections::HashMap;

use super::address::{p2pkh_script, Address};
use super::coins::{gather_coins, Coin, MaxValueAgeSelector};
use super::fees::{
    estimate_serialize_size, fee_per_byte, is_dust_amount, FeeLevel, InputKind,
    DEFAULT_RELAY_FEE_PER_KB, P2PKH_PK_SCRIPT_SIZE,
};
use super::keys::SigningKey;
use super::params::NetParams;
use super::rpc::NodeRpc;
use super::script::{ScriptBuilder, OP_CHECKSIG};
use super::tx::{hash160, sha256, OutPoint, Transaction, TxIn, TxOut, RBF_SEQUENCE};
use super::ACCOUNT;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct BuiltSpend {
    pub tx: Transaction,
    /// Inputs minus outputs.
    pub fee: u64,
}

/// Build and sign a payment of `amount` to `address`; nothing is broadcast.
pub async fn build_spend(
    rpc: &dyn NodeRpc,
    params: &NetParams,
    amount: u64,
    address: &Address,
    level: FeeLevel,
) -> Result<BuiltSpend> {
    let script = address.script_pubkey();
    if is_dust_amount(amount, script.len(), DEFAULT_RELAY_FEE_PER_KB) {
        return Err(Error::DustAmount);
    }

    let coin_keys = gather_coins(rpc, params).await?;
    let coins: Vec<Coin> = coin_keys.keys().cloned().collect();
    let fee_rate = fee_per_byte(rpc, level).await;

    let change_address = rpc.get_account_address(ACCOUNT).await?;
    let change_script = Address::decode(&change_address, params)?.script_pubkey();

    let outputs = vec![TxOut { value: amount, script_pubkey: script }];
    let (mut tx, selected) = author_transaction(
        &coins,
        outputs,
        fee_rate,
        &change_script,
        &MaxValueAgeSelector::default(),
    )?;

    let mut keys_by_address: HashMap<String, SigningKey> = HashMap::new();
    let mut prev_outputs: HashMap<OutPoint, (Vec<u8>, u64)> = HashMap::new();
    for coin in &selected {
        if let Some(key) = coin_keys.get(coin) {
            keys_by_address.insert(coin.address.clone(), key.clone());
        }
        prev_outputs.insert(coin.outpoint, (coin.script_pubkey.clone(), coin.value));
    }
    sign_transaction(&mut tx, &prev_outputs, &keys_by_address, params)?;

    let total_in: u64 = selected.iter().map(|c| c.value).sum();
    let fee = total_in - tx.total_out();
    Ok(BuiltSpend { tx, fee })
}

/// Select inputs for `outputs` and add change, iterating until the
/// selected inputs also cover the fee of their own size. The result is
/// BIP69 sorted and unsigned.
pub fn author_transaction(
    coins: &[Coin],
    outputs: Vec<TxOut>,
    fee_per_byte: u64,
    change_script: &[u8],
    selector: &MaxValueAgeSelector,
) -> Result<(Transaction, Vec<Coin>)> {
    let target: u64 = outputs.iter().map(|o| o.value).sum();
    let mut target_fee =
        estimate_serialize_size(1, &outputs, true, InputKind::P2pkh) as u64 * fee_per_byte;

    loop {
        let selected = selector.select(target + target_fee, coins)?;
        let input_amount: u64 = selected.iter().map(|c| c.value).sum();
        let max_signed_size = estimate_serialize_size(selected.len(), &outputs, true, InputKind::P2pkh);
        let max_required_fee = max_signed_size as u64 * fee_per_byte;
        let remaining = input_amount - target;
        if remaining < max_required_fee {
            target_fee = max_required_fee;
            continue;
        }

        let mut tx = Transaction::new(1);
        for coin in &selected {
            tx.inputs.push(TxIn::new(coin.outpoint, RBF_SEQUENCE));
        }
        tx.outputs = outputs;
        let change = remaining - max_required_fee;
        if change != 0 && !is_dust_amount(change, P2PKH_PK_SCRIPT_SIZE, DEFAULT_RELAY_FEE_PER_KB) {
            tx.outputs.push(TxOut { value: change, script_pubkey: change_script.to_vec() });
        }
        tx.sort_bip69();
        return Ok((tx, selected));
    }
}

/// Sign every input with the key filed under the address of its previous
/// output. Any input that cannot be signed fails the whole transaction.
pub fn sign_transaction(
    tx: &mut Transaction,
    prev_outputs: &HashMap<OutPoint, (Vec<u8>, u64)>,
    keys_by_address: &HashMap<String, SigningKey>,
    params: &NetParams,
) -> Result<()> {
    for i in 0..tx.inputs.len() {
        let outpoint = tx.inputs[i].previous_output;
        let (script, value) = prev_outputs.get(&outpoint).ok_or_else(|| {
            Error::SignFailure(format!("unknown previous output {}:{}", outpoint.txid_hex(), outpoint.vout))
        })?;
        let address = Address::from_script(script)
            .map_err(|e| Error::SignFailure(e.to_string()))?
            .encode(params);
        let key = keys_by_address
            .get(&address)
            .ok_or_else(|| Error::SignFailure(format!("no key for address {}", address)))?;
        sign_input(tx, i, script, *value, key)?;
    }
    Ok(())
}

/// Sign one input spending `prev_script`: legacy for P2PKH, witness for
/// P2WPKH and single-key P2WSH.
pub fn sign_input(
    tx: &mut Transaction,
    index: usize,
    prev_script: &[u8],
    value: u64,
    key: &SigningKey,
) -> Result<()> {
    let pubkey = key.pubkey_bytes()?;
    let address = Address::from_script(prev_script).map_err(|e| Error::SignFailure(e.to_string()))?;
    match address {
        Address::PubKeyHash(hash) => {
            if hash160(&pubkey) != hash {
                return Err(Error::SignFailure("key does not match pubkey hash".into()));
            }
            let sig = key.sign(tx.legacy_sighash(index, prev_script)?)?;
            tx.inputs[index].script_sig = ScriptBuilder::new().add_data(&sig).add_data(&pubkey).into_bytes();
        }
        Address::WitnessPubKeyHash(hash) => {
            if hash160(&pubkey) != hash {
                return Err(Error::SignFailure("key does not match witness pubkey hash".into()));
            }
            let sig = key.sign(tx.witness_sighash(index, &p2pkh_script(&hash), value)?)?;
            tx.inputs[index].witness = vec![sig, pubkey.to_vec()];
        }
        Address::WitnessScriptHash(hash) => {
            let witness_script = ScriptBuilder::new().add_data(&pubkey).add_op(OP_CHECKSIG).into_bytes();
            if sha256(&witness_script) != hash {
                return Err(Error::SignFailure("witness script is not spendable by this key".into()));
            }
            let sig = key.sign(tx.witness_sighash(index, &witness_script, value)?)?;
            tx.inputs[index].witness = vec![sig, witness_script];
        }
        Address::ScriptHash(_) => {
            return Err(Error::SignFailure("p2sh inputs need their redeem script".into()));
        }
    }
    Ok(())
}
