//! HD keys (BIP-39/BIP-32) and the signing keys used to spend.
//!
//! `ExtendedKey` wraps a bip32 node together with the network whose HD
//! version bytes it serializes under. Keys exported from the daemon via
//! `dumpprivkey` have no chain code, so they are held as
//! `SigningKey::Raw` instead of being dressed up as extended keys.

use bip32::{ChildNumber, ExtendedKeyAttrs, Prefix, XPrv, XPub};
use bip39::Mnemonic;
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use std::fmt;
use zeroize::Zeroize;

use super::address::Address;
use super::params::NetParams;
use super::tx::SIGHASH_ALL;
use crate::error::{Error, Result};

pub const HARDENED_OFFSET: u32 = 1 << 31;

#[derive(Clone)]
enum Node {
    Private(XPrv),
    Public(XPub),
}

#[derive(Clone)]
pub struct ExtendedKey {
    node: Node,
    params: &'static NetParams,
}

impl ExtendedKey {
    pub fn from_seed(seed: &[u8], params: &'static NetParams) -> Result<Self> {
        let master = XPrv::new(seed).map_err(|e| Error::InvalidKey(format!("master key: {}", e)))?;
        Ok(Self { node: Node::Private(master), params })
    }

    /// Master key for a BIP-39 phrase with an empty passphrase.
    pub fn from_mnemonic(phrase: &str, params: &'static NetParams) -> Result<Self> {
        let mnemonic: Mnemonic = phrase
            .trim()
            .parse()
            .map_err(|e| Error::InvalidKey(format!("invalid mnemonic: {}", e)))?;
        let mut seed = mnemonic.to_seed("");
        let key = Self::from_seed(&seed, params);
        seed.zeroize();
        key
    }

    pub fn params(&self) -> &'static NetParams {
        self.params
    }

    pub fn is_private(&self) -> bool {
        matches!(self.node, Node::Private(_))
    }

    /// Public counterpart of this node; a public key is returned unchanged.
    pub fn neuter(&self) -> ExtendedKey {
        match &self.node {
            Node::Private(x) => Self { node: Node::Public(x.public_key()), params: self.params },
            Node::Public(_) => self.clone(),
        }
    }

    /// Derive child `index`; indexes from `HARDENED_OFFSET` up are hardened
    /// and need a private parent.
    pub fn derive_child(&self, index: u32) -> Result<ExtendedKey> {
        let child = ChildNumber(index);
        let node = match &self.node {
            Node::Private(x) => Node::Private(
                x.derive_child(child)
                    .map_err(|e| Error::InvalidKey(format!("derive {}: {}", index, e)))?,
            ),
            Node::Public(x) => {
                if child.is_hardened() {
                    return Err(Error::InvalidKey("cannot derive a hardened child from a public key".into()));
                }
                Node::Public(
                    x.derive_child(child)
                        .map_err(|e| Error::InvalidKey(format!("derive {}: {}", index, e)))?,
                )
            }
        };
        Ok(Self { node, params: self.params })
    }

    /// Walk a path such as `m/44'/444'/0'/0/3`.
    pub fn derive_path(&self, path: &str) -> Result<ExtendedKey> {
        let mut parts = path.split('/');
        if parts.next() != Some("m") {
            return Err(Error::InvalidKey("path must start with 'm'".into()));
        }
        let mut key = self.clone();
        for part in parts {
            let (index, hardened) = match part.strip_suffix('\'') {
                Some(s) => (s, true),
                None => (part, false),
            };
            let index: u32 =
                index.parse().map_err(|_| Error::InvalidKey(format!("invalid path index: {}", part)))?;
            let child = ChildNumber::new(index, hardened)
                .map_err(|e| Error::InvalidKey(format!("invalid index {}: {}", part, e)))?;
            key = key.derive_child(child.0)?;
        }
        Ok(key)
    }

    fn attrs(&self) -> &ExtendedKeyAttrs {
        match &self.node {
            Node::Private(x) => x.attrs(),
            Node::Public(x) => x.attrs(),
        }
    }

    pub fn depth(&self) -> u8 {
        self.attrs().depth
    }

    pub fn child_index(&self) -> u32 {
        self.attrs().child_number.0
    }

    pub fn parent_fingerprint(&self) -> [u8; 4] {
        self.attrs().parent_fingerprint
    }

    pub fn chain_code(&self) -> [u8; 32] {
        self.attrs().chain_code
    }

    pub fn ec_priv_key(&self) -> Result<SecretKey> {
        match &self.node {
            Node::Private(x) => {
                let mut bytes: [u8; 32] = x.to_bytes();
                let sk = SecretKey::from_slice(&bytes)
                    .map_err(|e| Error::InvalidKey(format!("invalid secret key: {}", e)));
                bytes.zeroize();
                sk
            }
            Node::Public(_) => Err(Error::InvalidKey("not a private extended key".into())),
        }
    }

    pub fn pubkey_bytes(&self) -> [u8; 33] {
        match &self.node {
            Node::Private(x) => x.public_key().to_bytes(),
            Node::Public(x) => x.to_bytes(),
        }
    }

    pub fn ec_pub_key(&self) -> Result<PublicKey> {
        PublicKey::from_slice(&self.pubkey_bytes())
            .map_err(|e| Error::InvalidKey(format!("invalid public key: {}", e)))
    }

    /// Pay-to-pubkey-hash address of this node.
    pub fn address(&self) -> Address {
        Address::from_pubkey(&self.pubkey_bytes())
    }

    /// Parse a base58check serialized key for `params`.
    pub fn parse(s: &str, params: &'static NetParams) -> Result<Self> {
        let mut data = bs58::decode(s.trim())
            .with_check(None)
            .into_vec()
            .map_err(|e| Error::InvalidKey(format!("invalid extended key: {}", e)))?;
        if data.len() != 78 {
            data.zeroize();
            return Err(Error::InvalidKey(format!("invalid extended key length: {}", data.len())));
        }
        let version = [data[0], data[1], data[2], data[3]];
        let mut parent_fingerprint = [0u8; 4];
        parent_fingerprint.copy_from_slice(&data[5..9]);
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&data[13..45]);
        let mut key_bytes = [0u8; 33];
        key_bytes.copy_from_slice(&data[45..78]);
        let attrs = ExtendedKeyAttrs {
            depth: data[4],
            parent_fingerprint,
            child_number: ChildNumber(u32::from_be_bytes([data[9], data[10], data[11], data[12]])),
            chain_code,
        };
        data.zeroize();

        let node = if version == params.hd_private_key_id {
            let ext = bip32::ExtendedKey { prefix: Prefix::XPRV, attrs, key_bytes };
            Node::Private(XPrv::try_from(ext).map_err(|e| Error::InvalidKey(e.to_string()))?)
        } else if version == params.hd_public_key_id {
            let ext = bip32::ExtendedKey { prefix: Prefix::XPUB, attrs, key_bytes };
            Node::Public(XPub::try_from(ext).map_err(|e| Error::InvalidKey(e.to_string()))?)
        } else {
            return Err(Error::InvalidKey(format!(
                "version {} is not valid on {}",
                hex::encode(version),
                params.name
            )));
        };
        Ok(Self { node, params })
    }
}

impl fmt::Display for ExtendedKey {
    /// BIP32 serialization under this network's HD version bytes.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attrs = self.attrs();
        let mut payload = Vec::with_capacity(78);
        match &self.node {
            Node::Private(x) => {
                payload.extend_from_slice(&self.params.hd_private_key_id);
                push_attrs(&mut payload, attrs);
                payload.push(0x00);
                let mut secret: [u8; 32] = x.to_bytes();
                payload.extend_from_slice(&secret);
                secret.zeroize();
            }
            Node::Public(x) => {
                payload.extend_from_slice(&self.params.hd_public_key_id);
                push_attrs(&mut payload, attrs);
                payload.extend_from_slice(&x.to_bytes());
            }
        }
        let encoded = bs58::encode(&payload).with_check().into_string();
        payload.zeroize();
        f.write_str(&encoded)
    }
}

fn push_attrs(payload: &mut Vec<u8>, attrs: &ExtendedKeyAttrs) {
    payload.push(attrs.depth);
    payload.extend_from_slice(&attrs.parent_fingerprint);
    payload.extend_from_slice(&attrs.child_number.0.to_be_bytes());
    payload.extend_from_slice(&attrs.chain_code);
}

impl fmt::Debug for ExtendedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedKey")
            .field("private", &self.is_private())
            .field("depth", &self.depth())
            .field("child_index", &self.child_index())
            .field("pubkey", &hex::encode(self.pubkey_bytes()))
            .finish()
    }
}

impl PartialEq for ExtendedKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

// ---------------------------------------------------------------------------
// Signing keys
// ---------------------------------------------------------------------------

/// A key able to produce signatures: either a node of the HD tree or a
/// bare secret exported from the daemon.
#[derive(Clone)]
pub enum SigningKey {
    Extended(ExtendedKey),
    Raw(SecretKey),
}

impl SigningKey {
    /// Decode a compressed WIF for `params`.
    pub fn from_wif(wif: &str, params: &NetParams) -> Result<Self> {
        let mut decoded = bs58::decode(wif.trim())
            .with_check(None)
            .into_vec()
            .map_err(|e| Error::InvalidKey(format!("invalid WIF: {}", e)))?;
        let result = match decoded.as_slice() {
            [prefix, ..] if *prefix != params.private_key_id => {
                Err(Error::InvalidKey("invalid WIF prefix".into()))
            }
            [_, secret @ .., 0x01] if secret.len() == 32 => SecretKey::from_slice(secret)
                .map_err(|e| Error::InvalidKey(format!("invalid private key: {}", e))),
            [_, secret @ ..] if secret.len() == 32 => {
                Err(Error::InvalidKey("uncompressed WIF keys are not supported".into()))
            }
            _ => Err(Error::InvalidKey(format!("invalid WIF length: {}", decoded.len()))),
        };
        decoded.zeroize();
        result.map(SigningKey::Raw)
    }

    pub fn ec_priv_key(&self) -> Result<SecretKey> {
        match self {
            SigningKey::Extended(k) => k.ec_priv_key(),
            SigningKey::Raw(sk) => Ok(*sk),
        }
    }

    pub fn pubkey_bytes(&self) -> Result<[u8; 33]> {
        match self {
            SigningKey::Extended(k) => Ok(k.pubkey_bytes()),
            SigningKey::Raw(sk) => Ok(PublicKey::from_secret_key(SECP256K1, sk).serialize()),
        }
    }

    /// Deterministic low-S ECDSA over `digest`, DER encoded with the
    /// SIGHASH_ALL byte appended.
    pub fn sign(&self, digest: [u8; 32]) -> Result<Vec<u8>> {
        let sk = self.ec_priv_key()?;
        let msg = Message::from_digest(digest);
        let mut sig = SECP256K1.sign_ecdsa(&msg, &sk);
        sig.normalize_s();
        let der = sig.serialize_der();
        let mut out = Vec::with_capacity(der.len() + 1);
        out.extend_from_slice(&der);
        out.push(SIGHASH_ALL as u8);
        Ok(out)
    }
}

impl From<ExtendedKey> for SigningKey {
    fn from(k: ExtendedKey) -> Self {
        SigningKey::Extended(k)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningKey::Extended(k) => f.debug_tuple("Extended").field(k).finish(),
            SigningKey::Raw(_) => f.write_str("Raw(..)"),
        }
    }
}

/// Encode a secret as compressed WIF for `params`.
pub fn to_wif(sk: &SecretKey, params: &NetParams) -> String {
    let mut payload = Vec::with_capacity(34);
    payload.push(params.private_key_id);
    payload.extend_from_slice(&sk.secret_bytes());
    payload.push(0x01); // compressed flag
    let wif = bs58::encode(&payload).with_check().into_string();
    payload.zeroize();
    wif
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::params::{MAINNET, TESTNET};
    use secp256k1::ecdsa::Signature;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn master() -> ExtendedKey {
        ExtendedKey::from_mnemonic(TEST_MNEMONIC, &MAINNET).unwrap()
    }

    #[test]
    fn master_key_is_deterministic() {
        let a = master();
        let b = master();
        assert_eq!(a, b);
        assert!(a.is_private());
        assert_eq!(a.depth(), 0);
        assert_eq!(a.parent_fingerprint(), [0u8; 4]);
    }

    #[test]
    fn neutered_children_match_private_children() {
        let m = master();
        let child = m.derive_child(0).unwrap();
        let pub_child = m.neuter().derive_child(0).unwrap();
        assert!(!pub_child.is_private());
        assert_eq!(child.pubkey_bytes(), pub_child.pubkey_bytes());
        assert_eq!(child.depth(), 1);
        assert!(pub_child.ec_priv_key().is_err());
    }

    #[test]
    fn hardened_derivation_needs_private_parent() {
        let m = master();
        assert!(m.derive_child(HARDENED_OFFSET).is_ok());
        assert!(m.neuter().derive_child(HARDENED_OFFSET).is_err());
        let via_path = m.derive_path("m/0'/1").unwrap();
        let manual = m.derive_child(HARDENED_OFFSET).unwrap().derive_child(1).unwrap();
        assert_eq!(via_path, manual);
        assert_eq!(via_path.child_index(), 1);
    }

    #[test]
    fn serialization_roundtrips_under_network_versions() {
        let m = master().derive_path("m/44'/0").unwrap();
        let xprv = m.to_string();
        let xpub = m.neuter().to_string();
        assert_eq!(ExtendedKey::parse(&xprv, &MAINNET).unwrap(), m);
        assert_eq!(ExtendedKey::parse(&xpub, &MAINNET).unwrap(), m.neuter());
        assert!(ExtendedKey::parse(&xpub, &TESTNET).is_err());
    }

    #[test]
    fn wif_roundtrip() {
        let sk = master().ec_priv_key().unwrap();
        let wif = to_wif(&sk, &MAINNET);
        let key = SigningKey::from_wif(&wif, &MAINNET).unwrap();
        assert_eq!(key.ec_priv_key().unwrap(), sk);
        assert!(SigningKey::from_wif(&wif, &TESTNET).is_err());
        assert!(SigningKey::from_wif("", &MAINNET).is_err());
    }

    #[test]
    fn uncompressed_wif_is_rejected() {
        let sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let mut payload = vec![MAINNET.private_key_id];
        payload.extend_from_slice(&sk.secret_bytes());
        let wif = bs58::encode(&payload).with_check().into_string();
        let err = SigningKey::from_wif(&wif, &MAINNET).unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
    }

    #[test]
    fn signatures_are_low_s_and_verify() {
        let key = SigningKey::Extended(master().derive_child(5).unwrap());
        let digest = [0x42u8; 32];
        let sig = key.sign(digest).unwrap();
        assert_eq!(*sig.last().unwrap(), 0x01);
        assert_eq!(sig, key.sign(digest).unwrap());

        let parsed = Signature::from_der(&sig[..sig.len() - 1]).unwrap();
        let mut normalized = parsed;
        normalized.normalize_s();
        assert_eq!(parsed, normalized);
        let pk = PublicKey::from_slice(&key.pubkey_bytes().unwrap()).unwrap();
        assert!(SECP256K1.verify_ecdsa(&Message::from_digest(digest), &parsed, &pk).is_ok());
    }
}
