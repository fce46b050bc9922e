//! Wires the wallet, walletnotify webhook, protocol service and rate
//! cache into one running node.

use futures::StreamExt;
use libp2p::identity;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::compat::FuturesAsyncReadCompatExt;

use crate::config::Config;
use crate::error::Result;
use crate::exchange::ExchangeRates;
use crate::net::{spawn_swarm, BanManager, BazaarService, BoxStream, HandlerTable};
use crate::notifications::{IncomingTransaction, Notification};
use crate::ports::NetworkPort;
use crate::wallet::rpc_wallet::{TransactionCallback, TransactionListener};
use crate::wallet::{notify, RpcWallet};

pub struct Node {
    pub wallet: Arc<RpcWallet>,
    pub service: Arc<BazaarService>,
    pub rates: Arc<ExchangeRates>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bring every component up. The webhook binds before phored starts
    /// so no notification is lost; failing to reach phored is fatal.
    pub async fn start(cfg: &Config, mnemonic: &str, keypair: identity::Keypair, table: HandlerTable) -> Result<Self> {
        let wallet = Arc::new(RpcWallet::new(cfg.wallet.clone(), mnemonic)?);

        let (txids_tx, txids_rx) = mpsc::unbounded_channel();
        let listener = notify::bind(cfg.wallet.notify_port).await?;
        let mut tasks = vec![tokio::spawn(async move {
            if let Err(e) = notify::serve(listener, txids_tx).await {
                error!("walletnotify server stopped: {}", e);
            }
        })];

        wallet.start().await?;
        tasks.push(tokio::spawn(wallet.clone().run_notifications(txids_rx)));

        let (host, incoming) = spawn_swarm(keypair, &cfg.net)?;
        let service = BazaarService::new(Arc::new(host), Arc::new(BanManager::new()), wallet.clone(), table, &cfg.net);
        let incoming = incoming.map(|(peer, stream)| {
            let stream: BoxStream = Box::new(stream.compat());
            (peer, stream)
        });
        tasks.push(service.spawn_incoming(Box::pin(incoming)));
        wire_wallet_notifications(&wallet, service.clone()).await;

        let rates = Arc::new(ExchangeRates::from_config(&cfg.exchange)?);
        tasks.push(rates.spawn_refresh(Duration::from_secs(cfg.exchange.refresh_secs)));

        info!("node {} up", service.local_peer());
        Ok(Self { wallet, service, rates, tasks })
    }

    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.wallet.close().await;
        info!("node stopped");
    }
}

/// Publish every wallet transaction as an `IncomingTransaction`
/// notification on the service broadcast channel.
pub async fn wire_wallet_notifications(wallet: &RpcWallet, network: Arc<dyn NetworkPort>) {
    let listener: TransactionListener = Arc::new(move |cb: &TransactionCallback| {
        let notification = Notification::IncomingTransaction(incoming_transaction(cb));
        match notification.to_json() {
            Ok(bytes) => {
                let receivers = network.broadcast(bytes);
                debug!("incoming transaction {} sent to {} subscribers", cb.txid, receivers);
            }
            Err(e) => warn!("could not serialize notification for {}: {}", cb.txid, e),
        }
    });
    wallet.add_transaction_listener(listener).await;
}

pub fn incoming_transaction(cb: &TransactionCallback) -> IncomingTransaction {
    let confirmed = cb.height > 0;
    IncomingTransaction {
        txid: cb.txid.clone(),
        value: cb.value,
        address: String::new(),
        status: if confirmed { "CONFIRMED" } else { "UNCONFIRMED" }.to_string(),
        memo: String::new(),
        timestamp: cb.timestamp,
        confirmations: i32::from(confirmed),
        order_id: String::new(),
        thumbnail: String::new(),
        height: i32::try_from(cb.height).unwrap_or(i32::MAX),
        can_bump_fee: !confirmed,
    }
}
