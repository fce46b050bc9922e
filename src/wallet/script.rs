//! Script construction and inspection.
//!
//! Only the subset of script needed by the wallet: standard output
//! templates, multisig redeem scripts (plain and CSV-timelocked) and the
//! minimal-push rules used to encode them.

use crate::error::{RedeemScriptError, Result};

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_IF: u8 = 0x63;
pub const OP_ELSE: u8 = 0x67;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_DROP: u8 = 0x75;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKSEQUENCEVERIFY: u8 = 0xb2;

/// Relative lock-time flag for time-based sequences (BIP68).
pub const SEQUENCE_LOCKTIME_IS_SECONDS: u32 = 1 << 22;
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

/// Convert a relative lock into the sequence value CSV compares against.
pub fn lock_time_to_sequence(is_seconds: bool, locktime: u32) -> u32 {
    if !is_seconds {
        return locktime;
    }
    SEQUENCE_LOCKTIME_IS_SECONDS | (locktime >> SEQUENCE_LOCKTIME_GRANULARITY)
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct ScriptBuilder {
    script: Vec<u8>,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_op(mut self, op: u8) -> Self {
        self.script.push(op);
        self
    }

    /// Push an integer using the small-int opcodes where possible.
    pub fn add_int64(mut self, n: i64) -> Self {
        match n {
            0 => self.script.push(OP_0),
            -1 => self.script.push(OP_1NEGATE),
            1..=16 => self.script.push(OP_1 - 1 + n as u8),
            _ => return self.add_data(&script_num(n)),
        }
        self
    }

    /// Push data with the smallest possible push opcode.
    pub fn add_data(mut self, data: &[u8]) -> Self {
        let len = data.len();
        if len == 0 || (len == 1 && data[0] == 0) {
            self.script.push(OP_0);
            return self;
        }
        if len == 1 && (1..=16).contains(&data[0]) {
            self.script.push(OP_1 - 1 + data[0]);
            return self;
        }
        if len == 1 && data[0] == 0x81 {
            self.script.push(OP_1NEGATE);
            return self;
        }
        if len < OP_PUSHDATA1 as usize {
            self.script.push(len as u8);
        } else if len <= 0xff {
            self.script.push(OP_PUSHDATA1);
            self.script.push(len as u8);
        } else if len <= 0xffff {
            self.script.push(OP_PUSHDATA2);
            self.script.extend_from_slice(&(len as u16).to_le_bytes());
        } else {
            self.script.push(OP_PUSHDATA4);
            self.script.extend_from_slice(&(len as u32).to_le_bytes());
        }
        self.script.extend_from_slice(data);
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.script
    }
}

/// Minimal little-endian sign-magnitude encoding used by script numbers.
pub fn script_num(n: i64) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }
    let negative = n < 0;
    let mut abs = n.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if out[out.len() - 1] & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        let last = out.len() - 1;
        out[last] |= 0x80;
    }
    out
}

fn parse_script_num(bytes: &[u8]) -> i64 {
    if bytes.is_empty() {
        return 0;
    }
    let mut result: i64 = 0;
    for (i, b) in bytes.iter().enumerate() {
        result |= (*b as i64) << (8 * i);
    }
    let last = bytes[bytes.len() - 1];
    if last & 0x80 != 0 {
        let mask = !(0x80i64 << (8 * (bytes.len() - 1)));
        return -(result & mask);
    }
    result
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Op(u8),
    Push(Vec<u8>),
}

impl Instruction {
    /// Numeric value for small-int opcodes and minimal pushes.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Instruction::Op(OP_0) => Some(0),
            Instruction::Op(OP_1NEGATE) => Some(-1),
            Instruction::Op(op) if (OP_1..=OP_16).contains(op) => Some((op - OP_1 + 1) as i64),
            Instruction::Push(data) if data.len() <= 5 => Some(parse_script_num(data)),
            _ => None,
        }
    }
}

pub fn parse_script(script: &[u8]) -> Result<Vec<Instruction>> {
    let malformed = |msg: &str| RedeemScriptError::Malformed(msg.to_string());
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < script.len() {
        let op = script[i];
        i += 1;
        let len = match op {
            0x01..=0x4b => op as usize,
            OP_PUSHDATA1 => {
                let n = *script.get(i).ok_or_else(|| malformed("truncated pushdata1"))? as usize;
                i += 1;
                n
            }
            OP_PUSHDATA2 => {
                let b = script.get(i..i + 2).ok_or_else(|| malformed("truncated pushdata2"))?;
                i += 2;
                u16::from_le_bytes([b[0], b[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let b = script.get(i..i + 4).ok_or_else(|| malformed("truncated pushdata4"))?;
                i += 4;
                u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
            }
            _ => {
                out.push(Instruction::Op(op));
                continue;
            }
        };
        let data = script.get(i..i + len).ok_or_else(|| malformed("push past end of script"))?;
        out.push(Instruction::Push(data.to_vec()));
        i += len;
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Multisig redeem scripts
// ---------------------------------------------------------------------------

/// `OP_N <keys...> OP_M OP_CHECKMULTISIG`
pub fn multisig_script(threshold: usize, keys: &[[u8; 33]]) -> Vec<u8> {
    let mut b = ScriptBuilder::new().add_int64(threshold as i64);
    for k in keys {
        b = b.add_data(k);
    }
    b.add_int64(keys.len() as i64).add_op(OP_CHECKMULTISIG).into_bytes()
}

/// `IF <multisig> ELSE <sequence> CSV DROP <timeout key> CHECKSIG ENDIF`
pub fn timelocked_multisig_script(
    threshold: usize,
    keys: &[[u8; 33]],
    sequence: u32,
    timeout_key: &[u8; 33],
) -> Vec<u8> {
    let mut b = ScriptBuilder::new().add_op(OP_IF).add_int64(threshold as i64);
    for k in keys {
        b = b.add_data(k);
    }
    b.add_int64(keys.len() as i64)
        .add_op(OP_CHECKMULTISIG)
        .add_op(OP_ELSE)
        .add_int64(sequence as i64)
        .add_op(OP_CHECKSEQUENCEVERIFY)
        .add_op(OP_DROP)
        .add_data(timeout_key)
        .add_op(OP_CHECKSIG)
        .add_op(OP_ENDIF)
        .into_bytes()
}

pub fn is_timelocked(redeem_script: &[u8]) -> bool {
    redeem_script.first() == Some(&OP_IF)
}

/// Read the CSV sequence out of a timelocked redeem script.
pub fn lock_time_from_redeem_script(redeem_script: &[u8]) -> Result<u32> {
    let ins = parse_script(redeem_script)?;
    let else_at = ins
        .iter()
        .position(|i| *i == Instruction::Op(OP_ELSE))
        .ok_or_else(|| RedeemScriptError::Malformed("no OP_ELSE branch".into()))?;
    let seq = ins
        .get(else_at + 1)
        .and_then(Instruction::as_int)
        .filter(|n| *n >= 0 && *n <= u32::MAX as i64)
        .ok_or_else(|| RedeemScriptError::Malformed("invalid sequence after OP_ELSE".into()))?;
    Ok(seq as u32)
}

/// Multisig parameters of a redeem script: (threshold, public keys).
pub fn multisig_keys(redeem_script: &[u8]) -> Result<(usize, Vec<Vec<u8>>)> {
    let ins = parse_script(redeem_script)?;
    let start = if is_timelocked(redeem_script) { 1 } else { 0 };
    let threshold = ins
        .get(start)
        .and_then(Instruction::as_int)
        .ok_or_else(|| RedeemScriptError::Malformed("missing threshold".into()))?;
    let keys: Vec<Vec<u8>> = ins[start + 1..]
        .iter()
        .map_while(|i| match i {
            Instruction::Push(k) if k.len() == 33 => Some(k.clone()),
            _ => None,
        })
        .collect();
    match ins.get(start + 1 + keys.len() + 1) {
        Some(Instruction::Op(OP_CHECKMULTISIG)) => Ok((threshold as usize, keys)),
        _ => Err(RedeemScriptError::Malformed("not a multisig script".into()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> [u8; 33] {
        let mut k = [b; 33];
        k[0] = 0x02;
        k
    }

    #[test]
    fn small_ints_use_opcodes() {
        assert_eq!(ScriptBuilder::new().add_int64(2).into_bytes(), vec![0x52]);
        assert_eq!(ScriptBuilder::new().add_int64(16).into_bytes(), vec![0x60]);
        assert_eq!(ScriptBuilder::new().add_int64(0).into_bytes(), vec![0x00]);
    }

    #[test]
    fn script_numbers_are_minimal() {
        assert_eq!(script_num(144), vec![0x90, 0x00]);
        assert_eq!(script_num(127), vec![0x7f]);
        assert_eq!(script_num(-1), vec![0x81]);
        assert_eq!(script_num(4320), vec![0xe0, 0x10]);
        assert_eq!(parse_script_num(&script_num(4320)), 4320);
        assert_eq!(parse_script_num(&script_num(-300)), -300);
    }

    #[test]
    fn plain_multisig_layout() {
        let keys = [key(1), key(2), key(3)];
        let s = multisig_script(2, &keys);
        assert_eq!(s.len(), 1 + 3 * 34 + 1 + 1);
        assert_eq!(s[0], 0x52);
        assert_eq!(s[s.len() - 2], 0x53);
        assert_eq!(s[s.len() - 1], OP_CHECKMULTISIG);

        let (threshold, parsed) = multisig_keys(&s).unwrap();
        assert_eq!(threshold, 2);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[1], key(2).to_vec());
    }

    #[test]
    fn timelocked_script_roundtrips_sequence() {
        let keys = [key(1), key(2), key(3)];
        let seq = lock_time_to_sequence(false, 144);
        let s = timelocked_multisig_script(2, &keys, seq, &key(9));
        assert!(is_timelocked(&s));
        assert_eq!(lock_time_from_redeem_script(&s).unwrap(), 144);
        let (threshold, parsed) = multisig_keys(&s).unwrap();
        assert_eq!(threshold, 2);
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn lock_time_needs_else_branch() {
        let s = multisig_script(2, &[key(1), key(2), key(3)]);
        assert!(lock_time_from_redeem_script(&s).is_err());
    }

    #[test]
    fn block_locks_are_unflagged() {
        assert_eq!(lock_time_to_sequence(false, 144), 144);
        assert_eq!(lock_time_to_sequence(true, 1024), SEQUENCE_LOCKTIME_IS_SECONDS | 2);
    }

    #[test]
    fn truncated_push_is_rejected() {
        assert!(parse_script(&[0x05, 0x01, 0x02]).is_err());
    }
}
