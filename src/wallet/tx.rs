//! Transaction model, serialization and signature hashing.
//!
//! Serialization follows the Bitcoin wire format used by phored, including
//! the BIP144 witness encoding. Signature hashes are the legacy algorithm
//! for P2PKH inputs and BIP143 for witness inputs, always SIGHASH_ALL.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

use crate::error::{Error, Result};

pub const SIGHASH_ALL: u32 = 0x01;

/// Sequence used on every input that is not spent through a CSV branch.
/// It is below 0xfffffffe, so the transaction signals opt-in RBF.
pub const RBF_SEQUENCE: u32 = 0;
pub const MAX_SEQUENCE: u32 = 0xffff_ffff;

// ---------------------------------------------------------------------------
// Low-level primitives
// ---------------------------------------------------------------------------

/// Encode a u64 as a Bitcoin varint.
pub fn write_varint(buf: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(0xfd);
        buf.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(0xfe);
        buf.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        buf.push(0xff);
        buf.extend_from_slice(&n.to_le_bytes());
    }
}

pub fn varint_size(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    }
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Double SHA-256
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(Sha256::digest(data)).into()
}

/// Hash160 = RIPEMD160(SHA256(data))
pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(data)).into()
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|e| *e <= self.buf.len()).ok_or_else(|| {
            Error::MalformedTransaction(format!("unexpected end of data at byte {}", self.pos))
        })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    fn varint(&mut self) -> Result<u64> {
        match self.u8()? {
            0xfd => {
                let b = self.take(2)?;
                Ok(u16::from_le_bytes([b[0], b[1]]) as u64)
            }
            0xfe => Ok(self.u32()? as u64),
            0xff => self.u64(),
            n => Ok(n as u64),
        }
    }

    fn var_bytes(&mut self) -> Result<Vec<u8>> {
        let n = self.varint()? as usize;
        Ok(self.take(n)?.to_vec())
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutPoint {
    /// Previous txid in internal (little-endian) byte order.
    pub txid: [u8; 32],
    pub vout: u32,
}

impl OutPoint {
    /// Parse a txid as displayed by the daemon (reversed byte order).
    pub fn from_hex(txid: &str, vout: u32) -> Result<Self> {
        let mut bytes = hex::decode(txid)
            .map_err(|e| Error::MalformedTransaction(format!("invalid txid hex: {}", e)))?;
        if bytes.len() != 32 {
            return Err(Error::MalformedTransaction(format!("invalid txid length: {}", bytes.len())));
        }
        bytes.reverse();
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self { txid: out, vout })
    }

    pub fn txid_hex(&self) -> String {
        let mut display = self.txid;
        display.reverse();
        hex::encode(display)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    pub fn new(previous_output: OutPoint, sequence: u32) -> Self {
        Self { previous_output, script_sig: Vec::new(), sequence, witness: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn serialize_size(&self) -> usize {
        8 + varint_size(self.script_pubkey.len() as u64) + self.script_pubkey.len()
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.value.to_le_bytes());
        write_varint(buf, self.script_pubkey.len() as u64);
        buf.extend_from_slice(&self.script_pubkey);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(version: i32) -> Self {
        Self { version, inputs: Vec::new(), outputs: Vec::new(), lock_time: 0 }
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|i| !i.witness.is_empty())
    }

    pub fn total_out(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Wire encoding; witness data is included when any input carries it.
    pub fn serialize(&self) -> Vec<u8> {
        self.encode(self.has_witness())
    }

    pub fn serialize_no_witness(&self) -> Vec<u8> {
        self.encode(false)
    }

    fn encode(&self, with_witness: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.version.to_le_bytes());
        if with_witness {
            buf.push(0x00); // marker
            buf.push(0x01); // flag
        }
        write_varint(&mut buf, self.inputs.len() as u64);
        for inp in &self.inputs {
            buf.extend_from_slice(&inp.previous_output.txid);
            buf.extend_from_slice(&inp.previous_output.vout.to_le_bytes());
            write_varint(&mut buf, inp.script_sig.len() as u64);
            buf.extend_from_slice(&inp.script_sig);
            buf.extend_from_slice(&inp.sequence.to_le_bytes());
        }
        write_varint(&mut buf, self.outputs.len() as u64);
        for out in &self.outputs {
            out.write(&mut buf);
        }
        if with_witness {
            for inp in &self.inputs {
                write_varint(&mut buf, inp.witness.len() as u64);
                for item in &inp.witness {
                    write_varint(&mut buf, item.len() as u64);
                    buf.extend_from_slice(item);
                }
            }
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }

    pub fn deserialize(raw: &[u8]) -> Result<Self> {
        let mut r = Reader { buf: raw, pos: 0 };
        let version = r.u32()? as i32;
        let mut input_count = r.varint()?;
        let mut segwit = false;
        if input_count == 0 {
            if r.u8()? != 0x01 {
                return Err(Error::MalformedTransaction("unknown witness flag".into()));
            }
            segwit = true;
            input_count = r.varint()?;
        }
        let mut inputs = Vec::with_capacity(input_count.min(1024) as usize);
        for _ in 0..input_count {
            let mut txid = [0u8; 32];
            txid.copy_from_slice(r.take(32)?);
            let vout = r.u32()?;
            let script_sig = r.var_bytes()?;
            let sequence = r.u32()?;
            inputs.push(TxIn {
                previous_output: OutPoint { txid, vout },
                script_sig,
                sequence,
                witness: Vec::new(),
            });
        }
        let output_count = r.varint()?;
        let mut outputs = Vec::with_capacity(output_count.min(1024) as usize);
        for _ in 0..output_count {
            let value = r.u64()?;
            let script_pubkey = r.var_bytes()?;
            outputs.push(TxOut { value, script_pubkey });
        }
        if segwit {
            for inp in inputs.iter_mut() {
                let items = r.varint()?;
                for _ in 0..items {
                    inp.witness.push(r.var_bytes()?);
                }
            }
        }
        let lock_time = r.u32()?;
        if r.remaining() != 0 {
            return Err(Error::MalformedTransaction(format!("{} trailing bytes", r.remaining())));
        }
        Ok(Self { version, inputs, outputs, lock_time })
    }

    /// Transaction id as displayed (reversed double-SHA256 of the
    /// witness-stripped encoding).
    pub fn txid(&self) -> String {
        let mut hash = double_sha256(&self.serialize_no_witness());
        hash.reverse();
        hex::encode(hash)
    }

    /// BIP69: inputs by (prev txid as displayed, index), outputs by
    /// (value, script bytes).
    pub fn sort_bip69(&mut self) {
        self.inputs.sort_by(|a, b| compare_outpoints(&a.previous_output, &b.previous_output));
        self.outputs.sort_by(|a, b| {
            a.value.cmp(&b.value).then_with(|| a.script_pubkey.cmp(&b.script_pubkey))
        });
    }

    // -----------------------------------------------------------------------
    // Signature hashes
    // -----------------------------------------------------------------------

    /// Pre-segwit signature hash with SIGHASH_ALL.
    pub fn legacy_sighash(&self, input_index: usize, script_code: &[u8]) -> Result<[u8; 32]> {
        if input_index >= self.inputs.len() {
            return Err(Error::SignFailure(format!("input {} out of range", input_index)));
        }
        let mut copy = self.clone();
        for (i, inp) in copy.inputs.iter_mut().enumerate() {
            inp.witness.clear();
            inp.script_sig = if i == input_index { script_code.to_vec() } else { Vec::new() };
        }
        let mut preimage = copy.serialize_no_witness();
        preimage.extend_from_slice(&SIGHASH_ALL.to_le_bytes());
        Ok(double_sha256(&preimage))
    }

    /// BIP143 witness signature hash with SIGHASH_ALL.
    ///
    /// Preimage = version || hashPrevouts || hashSequence || outpoint ||
    ///            scriptCode || value || nSequence || hashOutputs ||
    ///            locktime || sighashType
    pub fn witness_sighash(
        &self,
        input_index: usize,
        script_code: &[u8],
        value: u64,
    ) -> Result<[u8; 32]> {
        let input = self
            .inputs
            .get(input_index)
            .ok_or_else(|| Error::SignFailure(format!("input {} out of range", input_index)))?;

        let mut prevouts = Vec::with_capacity(self.inputs.len() * 36);
        let mut sequences = Vec::with_capacity(self.inputs.len() * 4);
        for inp in &self.inputs {
            prevouts.extend_from_slice(&inp.previous_output.txid);
            prevouts.extend_from_slice(&inp.previous_output.vout.to_le_bytes());
            sequences.extend_from_slice(&inp.sequence.to_le_bytes());
        }
        let mut outputs = Vec::new();
        for out in &self.outputs {
            out.write(&mut outputs);
        }

        let mut preimage = Vec::new();
        preimage.extend_from_slice(&self.version.to_le_bytes());
        preimage.extend_from_slice(&double_sha256(&prevouts));
        preimage.extend_from_slice(&double_sha256(&sequences));
        preimage.extend_from_slice(&input.previous_output.txid);
        preimage.extend_from_slice(&input.previous_output.vout.to_le_bytes());
        write_varint(&mut preimage, script_code.len() as u64);
        preimage.extend_from_slice(script_code);
        preimage.extend_from_slice(&value.to_le_bytes());
        preimage.extend_from_slice(&input.sequence.to_le_bytes());
        preimage.extend_from_slice(&double_sha256(&outputs));
        preimage.extend_from_slice(&self.lock_time.to_le_bytes());
        preimage.extend_from_slice(&SIGHASH_ALL.to_le_bytes());
        Ok(double_sha256(&preimage))
    }
}

fn compare_outpoints(a: &OutPoint, b: &OutPoint) -> Ordering {
    a.txid
        .iter()
        .rev()
        .cmp(b.txid.iter().rev())
        .then_with(|| a.vout.cmp(&b.vout))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outpoint(hex_char: char, vout: u32) -> OutPoint {
        OutPoint::from_hex(&hex_char.to_string().repeat(64), vout).unwrap()
    }

    fn sample_tx() -> Transaction {
        let mut tx = Transaction::new(1);
        tx.inputs.push(TxIn::new(outpoint('b', 1), RBF_SEQUENCE));
        tx.inputs.push(TxIn::new(outpoint('a', 7), RBF_SEQUENCE));
        tx.inputs.push(TxIn::new(outpoint('a', 2), RBF_SEQUENCE));
        tx.outputs.push(TxOut { value: 5000, script_pubkey: vec![0x51, 0x02] });
        tx.outputs.push(TxOut { value: 100, script_pubkey: vec![0x51] });
        tx.outputs.push(TxOut { value: 5000, script_pubkey: vec![0x51, 0x01] });
        tx
    }

    #[test]
    fn varint_boundaries() {
        for (n, size) in [(0xfcu64, 1), (0xfd, 3), (0xffff, 3), (0x10000, 5), (0x1_0000_0000, 9)] {
            let mut buf = Vec::new();
            write_varint(&mut buf, n);
            assert_eq!(buf.len(), size);
            assert_eq!(varint_size(n), size);
        }
    }

    #[test]
    fn outpoint_hex_is_reversed_internally() {
        let op = OutPoint::from_hex(&format!("{}01", "00".repeat(31)), 0).unwrap();
        assert_eq!(op.txid[0], 0x01);
        assert_eq!(op.txid_hex(), format!("{}01", "00".repeat(31)));
        assert!(OutPoint::from_hex("abcd", 0).is_err());
    }

    #[test]
    fn bip69_orders_inputs_and_outputs() {
        let mut tx = sample_tx();
        tx.sort_bip69();
        let ins: Vec<(String, u32)> =
            tx.inputs.iter().map(|i| (i.previous_output.txid_hex(), i.previous_output.vout)).collect();
        assert_eq!(ins[0], ("a".repeat(64), 2));
        assert_eq!(ins[1], ("a".repeat(64), 7));
        assert_eq!(ins[2], ("b".repeat(64), 1));
        let outs: Vec<(u64, Vec<u8>)> =
            tx.outputs.iter().map(|o| (o.value, o.script_pubkey.clone())).collect();
        assert_eq!(outs, vec![(100, vec![0x51]), (5000, vec![0x51, 0x01]), (5000, vec![0x51, 0x02])]);
    }

    #[test]
    fn bip69_compares_displayed_txid() {
        // Internal bytes differ only in the first byte, which is the last
        // displayed byte; ordering must follow the displayed form.
        let mut lo = [0u8; 32];
        let mut hi = [0u8; 32];
        lo[0] = 0xff;
        hi[31] = 0x01;
        let mut tx = Transaction::new(1);
        tx.inputs.push(TxIn::new(OutPoint { txid: hi, vout: 0 }, 0));
        tx.inputs.push(TxIn::new(OutPoint { txid: lo, vout: 0 }, 0));
        tx.sort_bip69();
        assert_eq!(tx.inputs[0].previous_output.txid, lo);
    }

    #[test]
    fn legacy_and_witness_encodings_decode() {
        let mut tx = sample_tx();
        let legacy = tx.serialize();
        assert_eq!(Transaction::deserialize(&legacy).unwrap(), tx);

        tx.inputs[0].witness = vec![Vec::new(), vec![0xaa; 72], vec![0x52, 0xae]];
        let witness = tx.serialize();
        assert_eq!(&witness[4..6], &[0x00, 0x01]);
        assert_eq!(Transaction::deserialize(&witness).unwrap(), tx);
        assert_eq!(tx.txid(), Transaction::deserialize(&legacy).unwrap().txid());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut raw = sample_tx().serialize();
        raw.push(0);
        assert!(Transaction::deserialize(&raw).is_err());
        assert!(Transaction::deserialize(&raw[..10]).is_err());
    }

    #[test]
    fn sighashes_depend_on_signed_input() {
        let tx = sample_tx();
        let code = vec![0x76, 0xa9];
        let a = tx.witness_sighash(0, &code, 1000).unwrap();
        let b = tx.witness_sighash(1, &code, 1000).unwrap();
        let c = tx.witness_sighash(0, &code, 1001).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, tx.witness_sighash(0, &code, 1000).unwrap());
        assert_ne!(tx.legacy_sighash(0, &code).unwrap(), tx.legacy_sighash(1, &code).unwrap());
        assert!(tx.legacy_sighash(9, &code).is_err());
    }

    // Native P2WPKH example from BIP143.
    const BIP143_UNSIGNED: &str = "0100000002fff7f7881a8099afa6940d42d1e7f6362bec38171ea3edf433541db4e4ad969f0000000000eeffffffef51e1b804cc89d182d279655c3aa89e815b1b309fe287d9b2b55d57b90ec68a0100000000ffffffff02202cb206000000001976a9148280b37df378db99f66f85c95a783a76ac7a6d5988ac9093510d000000001976a9143bde42dbee7e4dbe6a21b2d50ce2f0167faa815988ac11000000";
    const BIP143_SIGNED: &str = "01000000000102fff7f7881a8099afa6940d42d1e7f6362bec38171ea3edf433541db4e4ad969f00000000494830450221008b9d1dc26ba6a9cb62127b02742fa9d754cd3bebf337f7a55d114c8e5cdd30be022040529b194ba3f9281a99f2b1c0a19c0489bc22ede944ccf4ecbab4cc618ef3ed01eeffffffef51e1b804cc89d182d279655c3aa89e815b1b309fe287d9b2b55d57b90ec68a0100000000ffffffff02202cb206000000001976a9148280b37df378db99f66f85c95a783a76ac7a6d5988ac9093510d000000001976a9143bde42dbee7e4dbe6a21b2d50ce2f0167faa815988ac000247304402203609e17b84f6a7d30c80bfa610b5b4542f32a8a0d5447a12fb1366d7f01cc44a0220573a954c4518331561406f90300e8f3358f51928d43c212a8caed02de67eebee0121025476c2e83188368da1ff3e292e7acafcdb3566bb0ad253f62fc70f07aeee635711000000";

    fn bip143_tx() -> Transaction {
        Transaction::deserialize(&hex::decode(BIP143_UNSIGNED).unwrap()).unwrap()
    }

    #[test]
    fn witness_sighash_matches_bip143_vector() {
        let tx = bip143_tx();
        let mut pkh = [0u8; 20];
        pkh.copy_from_slice(&hex::decode("1d0f172a0ecb48aee1be1f2687d2963ae33f71a1").unwrap());
        let script_code = crate::wallet::address::p2pkh_script(&pkh);
        let hash = tx.witness_sighash(1, &script_code, 600_000_000).unwrap();
        assert_eq!(
            hex::encode(hash),
            "c37af31116d1b27caf68aae9e3ac82f1477929014d5b917657d0eb49478cb670"
        );
    }

    #[test]
    fn legacy_sighash_matches_known_value() {
        let tx = bip143_tx();
        let script_code = hex::decode(
            "2103c9f4836b9a4f77fc0d81f7bcb01b7f1b35916864b9476c241ce9fc198bd25432ac",
        )
        .unwrap();
        let hash = tx.legacy_sighash(0, &script_code).unwrap();
        assert_eq!(
            hex::encode(hash),
            "63cec688ee06a91e913875356dd4dea2f8e0f2a2659885372da2a37e32c7532e"
        );
    }

    #[test]
    fn signed_segwit_tx_reserializes_byte_for_byte() {
        let raw = hex::decode(BIP143_SIGNED).unwrap();
        let tx = Transaction::deserialize(&raw).unwrap();
        assert!(tx.has_witness());
        assert!(tx.inputs[0].witness.is_empty());
        assert_eq!(tx.inputs[1].witness.len(), 2);
        assert_eq!(tx.lock_time, 0x11);
        assert_eq!(tx.serialize(), raw);
        assert_eq!(
            tx.txid(),
            "3cca625f908d7fbbe3cdd26fc5b6fd5cbf750c1d4587a234220b85df6672adb9"
        );
    }

    #[test]
    fn hash160_of_empty() {
        assert_eq!(hex::encode(hash160(b"")), "b472a266d0bd89c13706a4132ccfb16f7c3b9fcb");
    }
}
