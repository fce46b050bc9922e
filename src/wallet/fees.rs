//! Fee levels, the daemon-backed fee oracle, size estimation and dust.

use log::warn;
use serde_json::json;

use super::rpc::NodeRpc;
use super::tx::{varint_size, TxOut};

/// Fallback rate when the daemon has no estimate.
pub const DEFAULT_FEE_PER_BYTE: u64 = 50;
pub const DEFAULT_RELAY_FEE_PER_KB: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeeLevel {
    Priority,
    Normal,
    Economic,
    FeeBump,
}

impl FeeLevel {
    /// Confirmation target passed to `estimatefee`.
    pub fn target_blocks(self) -> u32 {
        match self {
            FeeLevel::Priority | FeeLevel::FeeBump => 1,
            FeeLevel::Normal => 3,
            FeeLevel::Economic => 6,
        }
    }
}

/// Satoshi per byte for `level`; never fails.
pub async fn fee_per_byte(rpc: &dyn NodeRpc, level: FeeLevel) -> u64 {
    let base = estimate(rpc, level.target_blocks()).await;
    match level {
        FeeLevel::FeeBump => base + 1,
        _ => base,
    }
}

async fn estimate(rpc: &dyn NodeRpc, blocks: u32) -> u64 {
    let value = match rpc.raw_request("estimatefee", vec![json!(blocks)]).await {
        Ok(v) => v,
        Err(e) => {
            warn!("estimatefee({}) failed, using default fee: {}", blocks, e);
            return DEFAULT_FEE_PER_BYTE;
        }
    };
    let per_kb = match &value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match per_kb {
        Some(v) if v > 0.0 => ((v / 1000.0).floor() as u64).max(1),
        Some(_) => DEFAULT_FEE_PER_BYTE,
        None => {
            warn!("estimatefee({}) returned unparseable {}, using default fee", blocks, value);
            DEFAULT_FEE_PER_BYTE
        }
    }
}

// ---------------------------------------------------------------------------
// Size estimation
// ---------------------------------------------------------------------------

/// Script class of the inputs being spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    P2pkh,
    P2sh2of3Multisig,
    P2shMultisigTimelock2Sigs,
    P2sh1of2Multisig,
    P2shMultisigTimelock1Sig,
}

// Worst-case unlocking data per input class. The multisig variants live in
// the witness and are discounted by four.
const REDEEM_P2PKH_SIG_SCRIPT_SIZE: usize = 1 + 73 + 1 + 33;
const REDEEM_2OF3_MULTISIG_SIZE: usize = 1 + 1 + 72 + 1 + 72 + 1 + 1 + 1 + 33 + 1 + 33 + 1 + 33 + 1 + 1;
const REDEEM_1OF2_MULTISIG_SIZE: usize = 1 + 1 + 72 + 1 + 1 + 1 + 33 + 1 + 33 + 1 + 1;
const REDEEM_TIMELOCK_1SIG_SIZE: usize =
    1 + 1 + 72 + 1 + 1 + 1 + 1 + 1 + 33 + 1 + 33 + 1 + 33 + 1 + 1 + 1 + 3 + 1 + 1 + 1 + 33 + 1 + 1;
const REDEEM_TIMELOCK_2SIGS_SIZE: usize =
    1 + 1 + 72 + 1 + 72 + 1 + 1 + 1 + 1 + 1 + 33 + 1 + 33 + 1 + 33 + 1 + 1 + 1 + 3 + 1 + 1 + 1 + 33 + 1 + 1;

pub const P2PKH_PK_SCRIPT_SIZE: usize = 1 + 1 + 1 + 20 + 1 + 1;
pub const P2PKH_OUTPUT_SIZE: usize = 8 + 1 + P2PKH_PK_SCRIPT_SIZE;

impl InputKind {
    /// Virtual size of one redeeming input.
    pub fn input_size(self) -> usize {
        const OUTPOINT_AND_SEQUENCE: usize = 32 + 4 + 4;
        match self {
            InputKind::P2pkh => OUTPOINT_AND_SEQUENCE + 1 + REDEEM_P2PKH_SIG_SCRIPT_SIZE,
            InputKind::P2sh2of3Multisig => OUTPOINT_AND_SEQUENCE + 1 + REDEEM_2OF3_MULTISIG_SIZE / 4,
            InputKind::P2sh1of2Multisig => OUTPOINT_AND_SEQUENCE + 1 + REDEEM_1OF2_MULTISIG_SIZE / 4,
            InputKind::P2shMultisigTimelock1Sig => OUTPOINT_AND_SEQUENCE + 1 + REDEEM_TIMELOCK_1SIG_SIZE / 4,
            InputKind::P2shMultisigTimelock2Sigs => OUTPOINT_AND_SEQUENCE + 1 + REDEEM_TIMELOCK_2SIGS_SIZE / 4,
        }
    }
}

/// Upper bound on the serialized size of a transaction with `input_count`
/// inputs of `kind`, the given outputs and optionally a P2PKH change output.
pub fn estimate_serialize_size(
    input_count: usize,
    outputs: &[TxOut],
    add_change_output: bool,
    kind: InputKind,
) -> usize {
    let mut output_count = outputs.len();
    let mut change_size = 0;
    if add_change_output {
        change_size = P2PKH_OUTPUT_SIZE;
        output_count += 1;
    }
    // 10 bytes cover version, locktime and the segwit marker/flag
    10 + varint_size(input_count as u64)
        + varint_size(output_count as u64)
        + input_count * kind.input_size()
        + outputs.iter().map(TxOut::serialize_size).sum::<usize>()
        + change_size
}

// ---------------------------------------------------------------------------
// Dust
// ---------------------------------------------------------------------------

/// An output is dust when spending it would cost more than a third of its
/// value at the relay fee. The redeeming input is assumed to be a
/// compressed P2PKH input of 148 bytes.
pub fn is_dust_amount(amount: u64, script_len: usize, relay_fee_per_kb: u64) -> bool {
    let total = dust_spend_size(script_len) as u128;
    (amount as u128) * 1000 / (3 * total) < relay_fee_per_kb as u128
}

/// Largest amount still considered dust for an output of `script_len`.
pub fn max_dust_amount(script_len: usize, relay_fee_per_kb: u64) -> u64 {
    let total = dust_spend_size(script_len) as u64;
    (relay_fee_per_kb * 3 * total).div_ceil(1000) - 1
}

fn dust_spend_size(script_len: usize) -> usize {
    8 + varint_size(script_len as u64) + script_len + 148
}
