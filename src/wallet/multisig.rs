//! Escrow multisig: redeem scripts, partial signatures, combining and sweeps.

use std::collections::HashMap;
use std::time::Duration;

use super::address::Address;
use super::builder::sign_input;
use super::fees::{estimate_serialize_size, InputKind};
use super::keys::{ExtendedKey, SigningKey};
use super::script::{
    is_timelocked, lock_time_from_redeem_script, lock_time_to_sequence, multisig_keys,
    multisig_script, timelocked_multisig_script,
};
use super::tx::{OutPoint, Transaction, TxIn, TxOut, RBF_SEQUENCE};
use crate::error::{Error, RedeemScriptError, Result};

/// Blocks per hour at one block every ten minutes.
const BLOCKS_PER_HOUR: u64 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInput {
    pub outpoint: OutPoint,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOutput {
    pub script_pubkey: Vec<u8>,
    pub value: u64,
}

/// Witness signature over the input at `input_index` of the sorted tx.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub input_index: u32,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// Build a multisig redeem script and its P2WSH address. A non-zero
/// `timeout` (whole hours) adds a CSV branch spendable by `timeout_key`
/// alone.
pub fn generate_multisig_script(
    keys: &[ExtendedKey],
    threshold: usize,
    timeout: Duration,
    timeout_key: Option<&ExtendedKey>,
) -> Result<(Address, Vec<u8>)> {
    let hours = timeout.as_secs() / 3600;
    if hours > 0 && timeout_key.is_none() {
        return Err(RedeemScriptError::MissingTimeoutKey.into());
    }
    if threshold == 0 || keys.len() < threshold {
        return Err(RedeemScriptError::TooFewKeys { threshold, keys: keys.len() }.into());
    }
    let pubkeys: Vec<[u8; 33]> = keys.iter().map(ExtendedKey::pubkey_bytes).collect();

    let redeem_script = match timeout_key {
        Some(tk) if hours > 0 => {
            let blocks = u32::try_from(hours * BLOCKS_PER_HOUR)
                .map_err(|_| RedeemScriptError::Malformed("timeout too long".into()))?;
            let sequence = lock_time_to_sequence(false, blocks);
            timelocked_multisig_script(threshold, &pubkeys, sequence, &tk.pubkey_bytes())
        }
        _ => multisig_script(threshold, &pubkeys),
    };
    Ok((Address::from_witness_script(&redeem_script), redeem_script))
}

fn escrow_input_kind(redeem_script: &[u8]) -> InputKind {
    if is_timelocked(redeem_script) {
        return InputKind::P2shMultisigTimelock2Sigs;
    }
    match multisig_keys(redeem_script) {
        Ok((1, keys)) if keys.len() == 2 => InputKind::P2sh1of2Multisig,
        _ => InputKind::P2sh2of3Multisig,
    }
}

/// Unsigned escrow spend shared by both signers: version 1, the estimated
/// fee taken evenly from every output, BIP69 sorted. Returns the previous
/// output values in sorted input order.
fn escrow_transaction(
    ins: &[TransactionInput],
    outs: &[TransactionOutput],
    redeem_script: &[u8],
    fee_per_byte: u64,
) -> Result<(Transaction, Vec<u64>)> {
    let mut tx = Transaction::new(1);
    let mut values: HashMap<OutPoint, u64> = HashMap::with_capacity(ins.len());
    for input in ins {
        tx.inputs.push(TxIn::new(input.outpoint, RBF_SEQUENCE));
        values.insert(input.outpoint, input.value);
    }
    tx.outputs = outs
        .iter()
        .map(|o| TxOut { value: o.value, script_pubkey: o.script_pubkey.clone() })
        .collect();

    let size = estimate_serialize_size(ins.len(), &tx.outputs, false, escrow_input_kind(redeem_script));
    let fee = size as u64 * fee_per_byte;
    if !tx.outputs.is_empty() {
        let per_output = fee / tx.outputs.len() as u64;
        for out in tx.outputs.iter_mut() {
            out.value = out.value.checked_sub(per_output).ok_or(Error::InsufficientFunds)?;
        }
    }
    tx.sort_bip69();

    let sorted_values = tx
        .inputs
        .iter()
        .map(|i| values.get(&i.previous_output).copied().unwrap_or_default())
        .collect();
    Ok((tx, sorted_values))
}

/// One SIGHASH_ALL witness signature per input of the escrow spend. Never
/// broadcasts.
pub fn create_multisig_signature(
    ins: &[TransactionInput],
    outs: &[TransactionOutput],
    key: &SigningKey,
    redeem_script: &[u8],
    fee_per_byte: u64,
) -> Result<Vec<Signature>> {
    let (tx, values) = escrow_transaction(ins, outs, redeem_script, fee_per_byte)?;
    let mut sigs = Vec::with_capacity(tx.inputs.len());
    for (i, value) in values.iter().enumerate() {
        let digest = tx.witness_sighash(i, redeem_script, *value)?;
        sigs.push(Signature { input_index: i as u32, signature: key.sign(digest)? });
    }
    Ok(sigs)
}

/// Combine two parties' signatures into a fully witnessed escrow spend.
pub fn multisign(
    ins: &[TransactionInput],
    outs: &[TransactionOutput],
    sigs1: &[Signature],
    sigs2: &[Signature],
    redeem_script: &[u8],
    fee_per_byte: u64,
) -> Result<Transaction> {
    if redeem_script.is_empty() {
        return Err(RedeemScriptError::Malformed("empty redeem script".into()).into());
    }
    let (mut tx, _) = escrow_transaction(ins, outs, redeem_script, fee_per_byte)?;
    let timelocked = is_timelocked(redeem_script);

    let find = |sigs: &[Signature], i: usize| {
        sigs.iter()
            .find(|s| s.input_index as usize == i)
            .map(|s| s.signature.clone())
            .ok_or_else(|| Error::SignFailure(format!("missing signature for input {}", i)))
    };
    for (i, input) in tx.inputs.iter_mut().enumerate() {
        let mut witness = vec![Vec::new(), find(sigs1, i)?, find(sigs2, i)?];
        if timelocked {
            witness.push(vec![0x01]);
        }
        witness.push(redeem_script.to_vec());
        input.witness = witness;
    }
    Ok(tx)
}

/// Consolidate `utxos` into one output paying `script_pubkey`. With a
/// redeem script the inputs are spent through its single-signature path
/// (the CSV branch when timelocked); without one each input is signed as a
/// plain wallet output.
pub fn build_sweep(
    utxos: &[Utxo],
    script_pubkey: Vec<u8>,
    key: &SigningKey,
    redeem_script: Option<&[u8]>,
    fee_per_byte: u64,
) -> Result<Transaction> {
    let total: u64 = utxos.iter().map(|u| u.value).sum();
    let mut out = TxOut { value: total, script_pubkey };

    let kind = match redeem_script {
        None => InputKind::P2pkh,
        Some(rs) if is_timelocked(rs) => InputKind::P2shMultisigTimelock1Sig,
        Some(_) => InputKind::P2sh1of2Multisig,
    };
    let size = estimate_serialize_size(utxos.len(), std::slice::from_ref(&out), false, kind);
    out.value = total.saturating_sub(size as u64 * fee_per_byte);

    let mut tx = Transaction::new(1);
    let mut prev: HashMap<OutPoint, &Utxo> = HashMap::with_capacity(utxos.len());
    let mut sequence = RBF_SEQUENCE;
    let timelocked = redeem_script.is_some_and(is_timelocked);
    if let Some(rs) = redeem_script.filter(|_| timelocked) {
        sequence = lock_time_from_redeem_script(rs)?;
        tx.version = 2;
    }
    for u in utxos {
        tx.inputs.push(TxIn::new(u.outpoint, sequence));
        prev.insert(u.outpoint, u);
    }
    tx.outputs.push(out);
    tx.sort_bip69();

    for i in 0..tx.inputs.len() {
        let utxo = prev
            .get(&tx.inputs[i].previous_output)
            .ok_or_else(|| Error::SignFailure(format!("unknown input {}", i)))?;
        match redeem_script {
            None => sign_input(&mut tx, i, &utxo.script_pubkey, utxo.value, key)?,
            Some(rs) => {
                let sig = key.sign(tx.witness_sighash(i, rs, utxo.value)?)?;
                tx.inputs[i].witness = if timelocked {
                    vec![sig, Vec::new(), rs.to_vec()]
                } else {
                    vec![Vec::new(), sig, rs.to_vec()]
                };
            }
        }
    }
    Ok(tx)
}
