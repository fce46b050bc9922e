//! Address encoding for Phore networks: base58check for P2PKH/P2SH and
//! bech32 witness-v0 for P2WPKH/P2WSH.

use bech32::{FromBase32, ToBase32, Variant};

use super::params::NetParams;
use super::script::{OP_0, OP_CHECKSIG, OP_DUP, OP_EQUAL, OP_EQUALVERIFY, OP_HASH160};
use super::tx::{hash160, sha256};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    PubKeyHash([u8; 20]),
    ScriptHash([u8; 20]),
    WitnessPubKeyHash([u8; 20]),
    WitnessScriptHash([u8; 32]),
}

impl Address {
    pub fn from_pubkey(pubkey: &[u8; 33]) -> Self {
        Address::PubKeyHash(hash160(pubkey))
    }

    pub fn from_witness_script(script: &[u8]) -> Self {
        Address::WitnessScriptHash(sha256(script))
    }

    pub fn decode(s: &str, params: &NetParams) -> Result<Self> {
        let s = s.trim();
        if let Ok(decoded) = bs58::decode(s).with_check(None).into_vec() {
            if decoded.len() != 21 {
                return Err(Error::InvalidAddress(format!("invalid length {}", decoded.len())));
            }
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&decoded[1..]);
            return match decoded[0] {
                v if v == params.pubkey_hash_addr_id => Ok(Address::PubKeyHash(hash)),
                v if v == params.script_hash_addr_id => Ok(Address::ScriptHash(hash)),
                v => Err(Error::InvalidAddress(format!(
                    "version byte 0x{:02x} is not valid on {}",
                    v, params.name
                ))),
            };
        }

        let (hrp, data, variant) =
            bech32::decode(s).map_err(|e| Error::InvalidAddress(format!("{}: {}", s, e)))?;
        if hrp != params.bech32_hrp {
            return Err(Error::InvalidAddress(format!("hrp {} is not valid on {}", hrp, params.name)));
        }
        if variant != Variant::Bech32 || data.first().map(|v| v.to_u8()) != Some(0) {
            return Err(Error::InvalidAddress("only witness version 0 is supported".into()));
        }
        let program = Vec::<u8>::from_base32(&data[1..])
            .map_err(|e| Error::InvalidAddress(format!("bad witness program: {}", e)))?;
        match program.len() {
            20 => {
                let mut h = [0u8; 20];
                h.copy_from_slice(&program);
                Ok(Address::WitnessPubKeyHash(h))
            }
            32 => {
                let mut h = [0u8; 32];
                h.copy_from_slice(&program);
                Ok(Address::WitnessScriptHash(h))
            }
            n => Err(Error::InvalidAddress(format!("witness program of {} bytes", n))),
        }
    }

    pub fn encode(&self, params: &NetParams) -> String {
        match self {
            Address::PubKeyHash(h) => base58_with_version(params.pubkey_hash_addr_id, h),
            Address::ScriptHash(h) => base58_with_version(params.script_hash_addr_id, h),
            Address::WitnessPubKeyHash(h) => segwit_encode(params.bech32_hrp, h),
            Address::WitnessScriptHash(h) => segwit_encode(params.bech32_hrp, h),
        }
    }

    pub fn script_pubkey(&self) -> Vec<u8> {
        match self {
            Address::PubKeyHash(h) => p2pkh_script(h),
            Address::ScriptHash(h) => {
                let mut s = Vec::with_capacity(23);
                s.push(OP_HASH160);
                s.push(0x14);
                s.extend_from_slice(h);
                s.push(OP_EQUAL);
                s
            }
            Address::WitnessPubKeyHash(h) => {
                let mut s = vec![OP_0, 0x14];
                s.extend_from_slice(h);
                s
            }
            Address::WitnessScriptHash(h) => {
                let mut s = vec![OP_0, 0x20];
                s.extend_from_slice(h);
                s
            }
        }
    }

    /// Recognise one of the four standard templates.
    pub fn from_script(script: &[u8]) -> Result<Self> {
        match script {
            [OP_DUP, OP_HASH160, 0x14, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG] if hash.len() == 20 => {
                Ok(Address::PubKeyHash(to_array(hash)))
            }
            [OP_HASH160, 0x14, hash @ .., OP_EQUAL] if hash.len() == 20 => {
                Ok(Address::ScriptHash(to_array(hash)))
            }
            [OP_0, 0x14, hash @ ..] if hash.len() == 20 => Ok(Address::WitnessPubKeyHash(to_array(hash))),
            [OP_0, 0x20, hash @ ..] if hash.len() == 32 => Ok(Address::WitnessScriptHash(to_array(hash))),
            _ => Err(Error::InvalidAddress(format!("non-standard script {}", hex::encode(script)))),
        }
    }
}

/// Build a P2PKH locking script: OP_DUP OP_HASH160 <20-byte-hash> OP_EQUALVERIFY OP_CHECKSIG
pub fn p2pkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(pubkey_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

fn to_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

fn base58_with_version(version: u8, hash: &[u8; 20]) -> String {
    let mut payload = Vec::with_capacity(21);
    payload.push(version);
    payload.extend_from_slice(hash);
    bs58::encode(payload).with_check().into_string()
}

fn segwit_encode(hrp: &str, program: &[u8]) -> String {
    // hrp is a static lowercase constant and the data is valid base32,
    // so encoding cannot fail.
    bech32::u5::try_from_u8(0)
        .and_then(|version| {
            let mut data = vec![version];
            data.extend(program.to_base32());
            bech32::encode(hrp, data, Variant::Bech32)
        })
        .unwrap_or_default()
}
