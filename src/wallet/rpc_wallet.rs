//! Wallet facade over a phored full node.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};

use super::address::Address;
use super::builder::build_spend;
use super::daemon::{self, Daemon, STOP_GRACE};
use super::fees::{self, estimate_serialize_size, is_dust_amount, FeeLevel, InputKind, DEFAULT_RELAY_FEE_PER_KB, P2PKH_PK_SCRIPT_SIZE};
use super::keys::{ExtendedKey, SigningKey};
use super::multisig::{self, Signature, TransactionInput, TransactionOutput, Utxo};
use super::params::NetParams;
use super::rpc::{NodeRpc, RpcClient};
use super::tx::{OutPoint, TxOut};
use super::{to_base_units, KeyPurpose, ACCOUNT, CURRENCY_CODE};
use crate::config::WalletConfig;
use crate::error::{Error, Result};
use crate::ports::WalletPort;

const READY_POLL: Duration = Duration::from_secs(1);

/// A wallet transaction as reported by the daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct Txn {
    pub txid: String,
    pub value: i64,
    pub height: i64,
    pub timestamp: DateTime<Utc>,
    pub watch_only: bool,
}

/// Delivered to listeners for every walletnotify.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionCallback {
    pub txid: String,
    pub value: i64,
    pub height: i64,
    pub timestamp: DateTime<Utc>,
    pub watch_only: bool,
    pub raw: Vec<u8>,
}

pub type TransactionListener = Arc<dyn Fn(&TransactionCallback) + Send + Sync>;

pub struct RpcWallet {
    params: &'static NetParams,
    master_private_key: ExtendedKey,
    master_public_key: ExtendedKey,
    config: WalletConfig,
    rpc: RwLock<Arc<dyn NodeRpc>>,
    daemon: Option<Daemon>,
    listeners: Mutex<Vec<TransactionListener>>,
    // scripts queued until the daemon answers; drained once by start()
    pending_scripts: Mutex<Vec<Vec<u8>>>,
    started: AtomicBool,
}

impl RpcWallet {
    /// Wallet that manages its own phored process.
    pub fn new(config: WalletConfig, mnemonic: &str) -> Result<Self> {
        let params = NetParams::for_testnet(config.testnet);
        let rpc: Arc<dyn NodeRpc> = Arc::new(RpcClient::from_config(&config)?);
        let daemon = Daemon::from_config(&config);
        Self::build(params, config, mnemonic, rpc, Some(daemon))
    }

    /// Wallet over an already running node.
    pub fn with_rpc(rpc: Arc<dyn NodeRpc>, mnemonic: &str, config: WalletConfig) -> Result<Self> {
        let params = NetParams::for_testnet(config.testnet);
        Self::build(params, config, mnemonic, rpc, None)
    }

    fn build(
        params: &'static NetParams,
        config: WalletConfig,
        mnemonic: &str,
        rpc: Arc<dyn NodeRpc>,
        daemon: Option<Daemon>,
    ) -> Result<Self> {
        let master_private_key = ExtendedKey::from_mnemonic(mnemonic, params)?;
        let master_public_key = master_private_key.neuter();
        Ok(Self {
            params,
            master_private_key,
            master_public_key,
            config,
            rpc: RwLock::new(rpc),
            daemon,
            listeners: Mutex::new(Vec::new()),
            pending_scripts: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    async fn rpc(&self) -> Arc<dyn NodeRpc> {
        self.rpc.read().await.clone()
    }

    pub fn params(&self) -> &'static NetParams {
        self.params
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Restart phored with our flags and wait for it to answer. Failing to
    /// reach it before the startup deadline is fatal to the caller.
    pub async fn start(&self) -> Result<()> {
        let rpc = self.rpc().await;
        if let Some(d) = &self.daemon {
            daemon::stop_existing(rpc.as_ref(), STOP_GRACE).await;
            d.spawn(false).await?;
        }
        self.connect(rpc.as_ref()).await
    }

    // Wait for the node and flush scripts queued while it was down.
    async fn connect(&self, rpc: &dyn NodeRpc) -> Result<()> {
        let height = daemon::wait_until_ready(rpc, READY_POLL, self.config.startup_deadline()).await?;
        info!("connected to phored at height {}", height);
        self.add_scripts().await;
        Ok(())
    }

    async fn add_scripts(&self) {
        let queued = {
            let mut pending = self.pending_scripts.lock().await;
            self.started.store(true, Ordering::SeqCst);
            std::mem::take(&mut *pending)
        };
        for script in queued {
            if let Err(e) = self.import_script(&script).await {
                warn!("failed to import watched script: {}", e);
            }
        }
    }

    async fn import_script(&self, script: &[u8]) -> Result<()> {
        let address = Address::from_script(script)?.encode(self.params);
        self.rpc().await.import_address_rescan(&address, ACCOUNT, false).await
    }

    /// Watch `script` for incoming and outgoing coins. Queued until the
    /// daemon is up.
    pub async fn add_watched_script(&self, script: &[u8]) -> Result<()> {
        {
            let mut pending = self.pending_scripts.lock().await;
            if !self.is_started() {
                pending.push(script.to_vec());
                return Ok(());
            }
        }
        self.import_script(script).await
    }

    /// Restart phored with `-rescan` and reconnect.
    pub async fn resync_blockchain(&self, from: DateTime<Utc>) -> Result<()> {
        let d = self
            .daemon
            .as_ref()
            .ok_or_else(|| Error::Daemon("no managed daemon to rescan".into()))?;
        info!("rescanning blockchain from {}", from);
        // queue watched scripts until the restarted node answers
        self.started.store(false, Ordering::SeqCst);
        d.shutdown(self.rpc().await.as_ref()).await;
        tokio::time::sleep(STOP_GRACE).await;
        d.spawn(true).await?;
        let client: Arc<dyn NodeRpc> = Arc::new(RpcClient::from_config(&self.config)?);
        *self.rpc.write().await = client.clone();
        self.connect(client.as_ref()).await
    }

    pub async fn close(&self) {
        let rpc = self.rpc().await;
        match &self.daemon {
            Some(d) => d.shutdown(rpc.as_ref()).await,
            None => {
                if let Err(e) = rpc.stop().await {
                    debug!("stop rpc failed: {}", e);
                }
            }
        }
        self.started.store(false, Ordering::SeqCst);
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    pub async fn add_transaction_listener(&self, listener: TransactionListener) {
        self.listeners.lock().await.push(listener);
    }

    /// Resolve a walletnotify txid and hand it to every listener.
    pub async fn on_wallet_notify(&self, txid: &str) -> Result<TransactionCallback> {
        let rpc = self.rpc().await;
        let tx = rpc.get_transaction(txid, true).await?;
        let height = if tx.blockhash.is_empty() {
            0
        } else {
            rpc.get_block_header_verbose(&tx.blockhash).await?.height
        };
        let raw = hex::decode(&tx.hex).map_err(|e| {
            warn!("dropping notification for {}: bad transaction hex: {}", tx.txid, e);
            Error::RpcDecode(format!("bad transaction hex: {}", e))
        })?;
        let callback = TransactionCallback {
            txid: tx.txid,
            value: to_base_units(tx.amount),
            height,
            timestamp: unix_time(tx.time),
            watch_only: tx.details.iter().any(|d| d.involveswatchonly),
            raw,
        };
        let listeners = self.listeners.lock().await.clone();
        for listener in listeners {
            listener(&callback);
        }
        Ok(callback)
    }

    /// Consume walletnotify txids until the channel closes.
    pub async fn run_notifications(self: Arc<Self>, mut txids: mpsc::UnboundedReceiver<String>) {
        while let Some(txid) = txids.recv().await {
            if let Err(e) = self.on_wallet_notify(&txid).await {
                warn!("could not resolve notified transaction {}: {}", txid, e);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Keys and addresses
    // -----------------------------------------------------------------------

    pub fn currency_code(&self) -> &'static str {
        CURRENCY_CODE
    }

    pub fn master_private_key(&self) -> &ExtendedKey {
        &self.master_private_key
    }

    pub fn master_public_key(&self) -> &ExtendedKey {
        &self.master_public_key
    }

    pub async fn current_address(&self, _purpose: KeyPurpose) -> Result<Address> {
        let encoded = self.rpc().await.get_account_address(ACCOUNT).await?;
        Address::decode(&encoded, self.params)
    }

    pub async fn new_address(&self, _purpose: KeyPurpose) -> Result<Address> {
        let encoded = self.rpc().await.get_new_address(ACCOUNT).await?;
        Address::decode(&encoded, self.params)
    }

    pub fn decode_address(&self, addr: &str) -> Result<Address> {
        Address::decode(addr, self.params)
    }

    pub fn script_to_address(&self, script: &[u8]) -> Result<Address> {
        Address::from_script(script)
    }

    pub fn address_to_script(&self, address: &Address) -> Vec<u8> {
        address.script_pubkey()
    }

    pub async fn has_key(&self, address: &Address) -> bool {
        self.rpc().await.dump_priv_key(&address.encode(self.params)).await.is_ok()
    }

    pub fn is_dust(&self, amount: u64) -> bool {
        is_dust_amount(amount, P2PKH_PK_SCRIPT_SIZE, DEFAULT_RELAY_FEE_PER_KB)
    }

    // -----------------------------------------------------------------------
    // Chain queries
    // -----------------------------------------------------------------------

    /// (confirmed, unconfirmed) in base units.
    pub async fn balance(&self) -> Result<(i64, i64)> {
        let info = self.rpc().await.get_wallet_info().await?;
        Ok((to_base_units(info.balance), to_base_units(info.unconfirmed_balance)))
    }

    pub async fn get_block_height(&self, hash: &str) -> Result<i64> {
        Ok(self.rpc().await.get_block_header_verbose(hash).await?.height)
    }

    pub async fn transactions(&self) -> Result<Vec<Txn>> {
        let rpc = self.rpc().await;
        let listed = rpc.list_transactions(ACCOUNT).await?;
        let mut heights: HashMap<String, i64> = HashMap::new();
        let mut txns = Vec::with_capacity(listed.len());
        for t in listed {
            let mut height = 0;
            if t.confirmations > 0 && !t.blockhash.is_empty() {
                height = match heights.get(&t.blockhash) {
                    Some(h) => *h,
                    None => {
                        let h = rpc.get_block_header_verbose(&t.blockhash).await?.height;
                        heights.insert(t.blockhash.clone(), h);
                        h
                    }
                };
            }
            txns.push(Txn {
                txid: t.txid,
                value: to_base_units(t.amount),
                height,
                timestamp: unix_time(t.timereceived),
                watch_only: t.involveswatchonly,
            });
        }
        Ok(txns)
    }

    pub async fn get_transaction(&self, txid: &str) -> Result<Txn> {
        let rpc = self.rpc().await;
        let tx = rpc.get_transaction(txid, false).await?;
        let height = if tx.blockhash.is_empty() {
            0
        } else {
            rpc.get_block_header_verbose(&tx.blockhash).await?.height
        };
        Ok(Txn {
            txid: tx.txid,
            value: to_base_units(tx.amount),
            height,
            timestamp: unix_time(tx.timereceived),
            watch_only: false,
        })
    }

    /// (confirmations, block height); height is 0 while unconfirmed.
    pub async fn get_confirmations(&self, txid: &str) -> Result<(u32, u32)> {
        let rpc = self.rpc().await;
        let tx = rpc.get_transaction(txid, true).await?;
        if tx.confirmations <= 0 || tx.blockhash.is_empty() {
            return Ok((0, 0));
        }
        let height = rpc.get_block_header_verbose(&tx.blockhash).await?.height;
        Ok((tx.confirmations as u32, height.max(0) as u32))
    }

    /// (height, best block hash).
    pub async fn chain_tip(&self) -> Result<(u32, String)> {
        let rpc = self.rpc().await;
        let info = rpc.get_info().await?;
        let hash = rpc.get_best_block_hash().await?;
        Ok((info.blocks.max(0) as u32, hash))
    }

    // -----------------------------------------------------------------------
    // Spending
    // -----------------------------------------------------------------------

    pub async fn fee_per_byte(&self, level: FeeLevel) -> u64 {
        fees::fee_per_byte(self.rpc().await.as_ref(), level).await
    }

    pub async fn spend(&self, amount: u64, address: &Address, level: FeeLevel) -> Result<String> {
        let rpc = self.rpc().await;
        let built = build_spend(rpc.as_ref(), self.params, amount, address, level).await?;
        let txid = rpc.send_raw_transaction(&built.tx.serialize()).await?;
        info!("broadcast spend {} paying {} with fee {}", txid, amount, built.fee);
        Ok(txid)
    }

    /// Replace a stuck incoming transaction by sweeping its wallet output
    /// at the bump fee level.
    pub async fn bump_fee(&self, txid: &str) -> Result<String> {
        let rpc = self.rpc().await;
        let tx = rpc.get_transaction(txid, false).await?;
        if tx.confirmations > 0 {
            return Err(Error::AlreadyConfirmed);
        }
        for u in rpc.list_unspent().await? {
            if u.txid != txid {
                continue;
            }
            if u.confirmations > 0 {
                return Err(Error::AlreadyConfirmed);
            }
            let utxo = Utxo {
                outpoint: OutPoint::from_hex(&u.txid, u.vout)?,
                value: to_base_units(u.amount).max(0) as u64,
                script_pubkey: hex::decode(&u.script_pub_key)
                    .map_err(|e| Error::MalformedTransaction(format!("bad script hex: {}", e)))?,
            };
            let wif = rpc.dump_priv_key(&u.address).await?;
            let key = SigningKey::from_wif(&wif, self.params)?;
            return self.sweep_address(&[utxo], None, &key, None, FeeLevel::FeeBump).await;
        }
        Err(Error::BumpNotFound)
    }

    /// P2PKH size of `ins` and `outs` times `fee_per_byte`.
    pub fn estimate_fee(&self, ins: &[TransactionInput], outs: &[TransactionOutput], fee_per_byte: u64) -> u64 {
        let outputs: Vec<TxOut> = outs
            .iter()
            .map(|o| TxOut { value: o.value, script_pubkey: o.script_pubkey.clone() })
            .collect();
        estimate_serialize_size(ins.len(), &outputs, false, InputKind::P2pkh) as u64 * fee_per_byte
    }

    /// Fee a spend of `amount` would pay right now, measured against a
    /// P2WSH output so the estimate errs high.
    pub async fn estimate_spend_fee(&self, amount: u64, level: FeeLevel) -> Result<u64> {
        let dummy = Address::WitnessScriptHash([0u8; 32]);
        let built = build_spend(self.rpc().await.as_ref(), self.params, amount, &dummy, level).await?;
        Ok(built.fee)
    }

    // -----------------------------------------------------------------------
    // Multisig
    // -----------------------------------------------------------------------

    pub fn generate_multisig_script(
        &self,
        keys: &[ExtendedKey],
        threshold: usize,
        timeout: Duration,
        timeout_key: Option<&ExtendedKey>,
    ) -> Result<(Address, Vec<u8>)> {
        multisig::generate_multisig_script(keys, threshold, timeout, timeout_key)
    }

    pub fn create_multisig_signature(
        &self,
        ins: &[TransactionInput],
        outs: &[TransactionOutput],
        key: &SigningKey,
        redeem_script: &[u8],
        fee_per_byte: u64,
    ) -> Result<Vec<Signature>> {
        multisig::create_multisig_signature(ins, outs, key, redeem_script, fee_per_byte)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn multisign(
        &self,
        ins: &[TransactionInput],
        outs: &[TransactionOutput],
        sigs1: &[Signature],
        sigs2: &[Signature],
        redeem_script: &[u8],
        fee_per_byte: u64,
        broadcast: bool,
    ) -> Result<Vec<u8>> {
        let tx = multisig::multisign(ins, outs, sigs1, sigs2, redeem_script, fee_per_byte)?;
        let raw = tx.serialize();
        if broadcast {
            let txid = self.rpc().await.send_raw_transaction(&raw).await?;
            info!("broadcast escrow release {}", txid);
        }
        Ok(raw)
    }

    /// Sweep `utxos` to `address`, or to the wallet's own address when
    /// none is given, and broadcast.
    pub async fn sweep_address(
        &self,
        utxos: &[Utxo],
        address: Option<&Address>,
        key: &SigningKey,
        redeem_script: Option<&[u8]>,
        level: FeeLevel,
    ) -> Result<String> {
        let destination = match address {
            Some(a) => a.clone(),
            None => self.current_address(KeyPurpose::Internal).await?,
        };
        let fee_rate = self.fee_per_byte(level).await;
        let tx = multisig::build_sweep(utxos, destination.script_pubkey(), key, redeem_script, fee_rate)?;
        let txid = self.rpc().await.send_raw_transaction(&tx.serialize()).await?;
        info!("broadcast sweep {} of {} inputs", txid, utxos.len());
        Ok(txid)
    }
}

fn unix_time(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(|| {
        warn!("timestamp {} out of range, using the epoch", secs);
        DateTime::<Utc>::UNIX_EPOCH
    })
}

#[async_trait]
impl WalletPort for RpcWallet {
    fn currency_code(&self) -> &'static str {
        RpcWallet::currency_code(self)
    }

    fn is_dust(&self, amount: u64) -> bool {
        RpcWallet::is_dust(self, amount)
    }

    async fn fee_per_byte(&self, level: FeeLevel) -> u64 {
        RpcWallet::fee_per_byte(self, level).await
    }

    async fn current_address(&self, purpose: KeyPurpose) -> Result<Address> {
        RpcWallet::current_address(self, purpose).await
    }

    async fn spend(&self, amount: u64, address: &Address, level: FeeLevel) -> Result<String> {
        RpcWallet::spend(self, amount, address, level).await
    }

    fn estimate_fee(&self, ins: &[TransactionInput], outs: &[TransactionOutput], fee_per_byte: u64) -> u64 {
        RpcWallet::estimate_fee(self, ins, outs, fee_per_byte)
    }

    fn generate_multisig_script(
        &self,
        keys: &[ExtendedKey],
        threshold: usize,
        timeout: Duration,
        timeout_key: Option<&ExtendedKey>,
    ) -> Result<(Address, Vec<u8>)> {
        RpcWallet::generate_multisig_script(self, keys, threshold, timeout, timeout_key)
    }

    fn create_multisig_signature(
        &self,
        ins: &[TransactionInput],
        outs: &[TransactionOutput],
        key: &SigningKey,
        redeem_script: &[u8],
        fee_per_byte: u64,
    ) -> Result<Vec<Signature>> {
        RpcWallet::create_multisig_signature(self, ins, outs, key, redeem_script, fee_per_byte)
    }

    async fn multisign(
        &self,
        ins: &[TransactionInput],
        outs: &[TransactionOutput],
        sigs1: &[Signature],
        sigs2: &[Signature],
        redeem_script: &[u8],
        fee_per_byte: u64,
        broadcast: bool,
    ) -> Result<Vec<u8>> {
        RpcWallet::multisign(self, ins, outs, sigs1, sigs2, redeem_script, fee_per_byte, broadcast).await
    }

    async fn sweep_address(
        &self,
        utxos: &[Utxo],
        address: Option<&Address>,
        key: &SigningKey,
        redeem_script: Option<&[u8]>,
        level: FeeLevel,
    ) -> Result<String> {
        RpcWallet::sweep_address(self, utxos, address, key, redeem_script, level).await
    }

    async fn add_watched_script(&self, script: &[u8]) -> Result<()> {
        RpcWallet::add_watched_script(self, script).await
    }
}
