//! In-memory phored used by the wallet tests.

use async_trait::async_trait;
use secp256k1::SecretKey;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;

use super::address::Address;
use super::keys::{to_wif, SigningKey};
use super::params::{NetParams, MAINNET};
use super::rpc::NodeRpc;
use super::tx::{sha256, Transaction};
use super::UNITS_PER_COIN;
use crate::error::{Error, Result};

#[derive(Default)]
struct State {
    fees: HashMap<u64, Value>,
    unspent: Vec<Value>,
    keys: HashMap<String, String>,
    transactions: HashMap<String, Value>,
    list_txs: Vec<Value>,
    broadcasts: Vec<Vec<u8>>,
    imports: Vec<(String, bool)>,
    block_count: i64,
    block_count_failures: usize,
    stopped: bool,
    counter: u32,
    account_address: Option<String>,
}

pub struct MockNode {
    state: Mutex<State>,
    pub params: &'static NetParams,
}

impl MockNode {
    pub fn new() -> Self {
        Self { state: Mutex::new(State { block_count: 100, ..State::default() }), params: &MAINNET }
    }

    fn next_key(st: &mut State, params: &NetParams) -> (String, SecretKey) {
        st.counter += 1;
        let mut seed = b"mock-node-key".to_vec();
        seed.extend_from_slice(&st.counter.to_be_bytes());
        let sk = SecretKey::from_slice(&sha256(&seed)).unwrap();
        let key = SigningKey::Raw(sk);
        let addr = Address::from_pubkey(&key.pubkey_bytes().unwrap()).encode(params);
        st.keys.insert(addr.clone(), to_wif(&sk, params));
        (addr, sk)
    }

    fn next_txid(st: &mut State) -> String {
        st.counter += 1;
        hex::encode(sha256(&st.counter.to_le_bytes()))
    }

    fn push_unspent(st: &mut State, txid: &str, vout: u32, addr: &str, value: u64, confs: i64, spendable: bool) {
        let script = Address::decode(addr, &MAINNET).unwrap().script_pubkey();
        st.unspent.push(json!({
            "txid": txid,
            "vout": vout,
            "address": addr,
            "scriptPubKey": hex::encode(script),
            "amount": value as f64 / UNITS_PER_COIN as f64,
            "confirmations": confs,
            "spendable": spendable,
        }));
    }

    /// Spendable P2PKH output with an exportable key.
    pub fn add_utxo(&self, value: u64, confirmations: i64) -> (String, SigningKey) {
        let mut st = self.state.lock().unwrap();
        let (addr, sk) = Self::next_key(&mut st, self.params);
        let txid = Self::next_txid(&mut st);
        Self::push_unspent(&mut st, &txid, 0, &addr, value, confirmations, true);
        (addr, SigningKey::Raw(sk))
    }

    /// Output belonging to transaction `txid` at `vout`.
    pub fn add_utxo_in_tx(&self, txid: &str, vout: u32, value: u64, confirmations: i64) -> String {
        let mut st = self.state.lock().unwrap();
        let (addr, _) = Self::next_key(&mut st, self.params);
        Self::push_unspent(&mut st, txid, vout, &addr, value, confirmations, true);
        addr
    }

    pub fn add_watch_only_utxo(&self, value: u64, confirmations: i64) {
        let mut st = self.state.lock().unwrap();
        let (addr, _) = Self::next_key(&mut st, self.params);
        st.keys.remove(&addr);
        let txid = Self::next_txid(&mut st);
        Self::push_unspent(&mut st, &txid, 0, &addr, value, confirmations, false);
    }

    /// Spendable output whose key the daemon refuses to export.
    pub fn add_utxo_without_key(&self, value: u64, confirmations: i64) {
        let mut st = self.state.lock().unwrap();
        let (addr, _) = Self::next_key(&mut st, self.params);
        st.keys.remove(&addr);
        let txid = Self::next_txid(&mut st);
        Self::push_unspent(&mut st, &txid, 0, &addr, value, confirmations, true);
    }

    pub fn add_transaction(&self, txid: &str, amount: f64, confirmations: i64) {
        let mut st = self.state.lock().unwrap();
        st.transactions.insert(
            txid.to_string(),
            json!({
                "txid": txid,
                "amount": amount,
                "confirmations": confirmations,
                "blockhash": if confirmations > 0 { "11".repeat(32) } else { String::new() },
                "time": 1_500_000_000,
                "timereceived": 1_500_000_000,
                "details": [],
                "hex": "",
            }),
        );
        st.list_txs.push(json!({
            "txid": txid,
            "amount": amount,
            "confirmations": confirmations,
            "blockhash": if confirmations > 0 { "11".repeat(32) } else { String::new() },
            "timereceived": 1_500_000_000,
            "category": "receive",
        }));
    }

    /// Overwrite one field of a transaction added with `add_transaction`.
    pub fn set_transaction_field(&self, txid: &str, field: &str, value: Value) {
        if let Some(tx) = self.state.lock().unwrap().transactions.get_mut(txid) {
            tx[field] = value;
        }
    }

    pub fn set_fee_estimate(&self, blocks: u64, value: Value) {
        self.state.lock().unwrap().fees.insert(blocks, value);
    }

    pub fn fail_block_count(&self, times: usize) {
        self.state.lock().unwrap().block_count_failures = times;
    }

    pub fn broadcasts(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().broadcasts.clone()
    }

    pub fn imports(&self) -> Vec<(String, bool)> {
        self.state.lock().unwrap().imports.clone()
    }

    pub fn stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }

    pub fn account_address(&self) -> String {
        let mut st = self.state.lock().unwrap();
        Self::account_address_locked(&mut st, self.params)
    }

    fn account_address_locked(st: &mut State, params: &NetParams) -> String {
        if let Some(a) = &st.account_address {
            return a.clone();
        }
        let (addr, _) = Self::next_key(st, params);
        st.account_address = Some(addr.clone());
        addr
    }
}

fn not_found(what: &str) -> Error {
    Error::Rpc { code: -5, message: format!("{} not found", what) }
}

#[async_trait]
impl NodeRpc for MockNode {
    async fn raw_request(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let mut st = self.state.lock().unwrap();
        let arg = |i: usize| params.get(i).cloned().unwrap_or(Value::Null);
        match method {
            "estimatefee" => {
                let blocks = arg(0).as_u64().unwrap_or_default();
                st.fees.get(&blocks).cloned().ok_or_else(|| not_found("estimate"))
            }
            "listunspent" => Ok(Value::Array(st.unspent.clone())),
            "dumpprivkey" => {
                let addr = arg(0).as_str().unwrap_or_default().to_string();
                st.keys.get(&addr).map(|w| json!(w)).ok_or_else(|| not_found("private key"))
            }
            "getaccountaddress" => Ok(json!(Self::account_address_locked(&mut st, self.params))),
            "getnewaddress" => Ok(json!(Self::next_key(&mut st, self.params).0)),
            "sendrawtransaction" => {
                let raw = hex::decode(arg(0).as_str().unwrap_or_default())
                    .map_err(|e| Error::Rpc { code: -22, message: e.to_string() })?;
                let txid = Transaction::deserialize(&raw)
                    .map_err(|e| Error::Rpc { code: -22, message: e.to_string() })?
                    .txid();
                st.broadcasts.push(raw);
                Ok(json!(txid))
            }
            "gettransaction" => {
                let txid = arg(0).as_str().unwrap_or_default().to_string();
                st.transactions.get(&txid).cloned().ok_or_else(|| not_found("transaction"))
            }
            "listtransactions" => Ok(Value::Array(st.list_txs.clone())),
            "getblockcount" => {
                if st.block_count_failures > 0 {
                    st.block_count_failures -= 1;
                    return Err(Error::RpcUnreachable("connection refused".into()));
                }
                Ok(json!(st.block_count))
            }
            "getinfo" => Ok(json!({"blocks": st.block_count, "connections": 8})),
            "getbestblockhash" => Ok(json!("22".repeat(32))),
            "getblockheader" => Ok(json!({"hash": arg(0), "height": 90, "time": 1_500_000_000})),
            "getwalletinfo" => Ok(json!({"balance": 1.25, "unconfirmed_balance": 0.5})),
            "importaddress" => {
                let addr = arg(0).as_str().unwrap_or_default().to_string();
                st.imports.push((addr, arg(2).as_bool().unwrap_or(true)));
                Ok(Value::Null)
            }
            "stop" => {
                st.stopped = true;
                Ok(json!("phored stopping"))
            }
            other => Err(Error::Rpc { code: -32601, message: format!("method {} not found", other) }),
        }
    }
}
