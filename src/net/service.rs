//! `/openbazaar/app/1.0.0` protocol service.
//!
//! Accepts inbound streams, dispatches each request to the handler
//! registered for its message type and exposes the outbound side as a
//! `NetworkPort`.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use libp2p::PeerId;
use log::{debug, info};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ban::BanManager;
use super::host::{BoxStream, StreamHost, PROTOCOL};
use super::pb::{Message, MessageType};
use super::sender::SenderPool;
use super::stream::{Connection, RequestHandler};
use crate::config::NetConfig;
use crate::error::{Error, Result};
use crate::ports::{NetworkPort, WalletPort};

const BROADCAST_CAPACITY: usize = 64;

/// What a handler gets besides the request.
#[derive(Clone)]
pub struct HandlerContext {
    pub wallet: Arc<dyn WalletPort>,
    pub network: Arc<dyn NetworkPort>,
}

pub type Handler =
    Arc<dyn Fn(PeerId, Message, HandlerContext) -> BoxFuture<'static, Result<Option<Message>>> + Send + Sync>;

/// Message type to handler. Built once, before the service starts.
pub struct HandlerTable {
    handlers: HashMap<MessageType, Handler>,
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerTable {
    /// Table with the builtin `Ping` handler.
    pub fn new() -> Self {
        let mut table = Self { handlers: HashMap::new() };
        table.register(MessageType::Ping, |_peer, msg, _ctx| async move {
            Ok(Some(Message::reply_to(&msg, MessageType::Ping, Vec::new())))
        });
        table
    }

    pub fn register<F, Fut>(&mut self, message_type: MessageType, handler: F)
    where
        F: Fn(PeerId, Message, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Message>>> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |peer: PeerId, msg: Message, ctx: HandlerContext| handler(peer, msg, ctx).boxed());
        self.handlers.insert(message_type, handler);
    }

    pub fn handler_for(&self, message_type: MessageType) -> Option<Handler> {
        self.handlers.get(&message_type).cloned()
    }
}

struct Dispatcher {
    table: HandlerTable,
    wallet: Arc<dyn WalletPort>,
    service: Weak<BazaarService>,
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, peer: PeerId, msg: Message) -> Result<Option<Message>> {
        let handler = msg
            .kind()
            .and_then(|kind| self.table.handler_for(kind))
            .ok_or_else(|| Error::StreamReset(format!("no handler for message type {}", msg.message_type)))?;
        let service = self.service.upgrade().ok_or_else(|| Error::StreamReset("service stopped".into()))?;
        let network: Arc<dyn NetworkPort> = service;
        let ctx = HandlerContext { wallet: self.wallet.clone(), network };
        handler(peer, msg, ctx).await
    }
}

pub struct BazaarService {
    host: Arc<dyn StreamHost>,
    bans: Arc<BanManager>,
    pool: SenderPool,
    events: broadcast::Sender<Vec<u8>>,
}

impl BazaarService {
    pub fn new(
        host: Arc<dyn StreamHost>,
        bans: Arc<BanManager>,
        wallet: Arc<dyn WalletPort>,
        table: HandlerTable,
        cfg: &NetConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|service| {
            let dispatcher = Arc::new(Dispatcher { table, wallet, service: service.clone() });
            let pool = SenderPool::new(
                host.clone(),
                dispatcher,
                cfg.max_message_size,
                Duration::from_secs(cfg.request_timeout_secs),
            );
            let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
            info!("bazaar service running at {}", PROTOCOL);
            Self { host, bans, pool, events }
        })
    }

    pub fn local_peer(&self) -> PeerId {
        self.host.local_peer()
    }

    pub fn bans(&self) -> &BanManager {
        &self.bans
    }

    /// Serve an inbound stream and make it the reply path to `peer`.
    /// Streams from banned peers are dropped unread.
    pub async fn handle_new_stream(&self, peer: PeerId, stream: BoxStream) {
        if self.bans.is_banned(&peer) {
            debug!("dropping stream from banned peer {}", peer);
            return;
        }
        let conn = Connection::open(peer, stream, self.pool.max_message_size(), self.pool.handler());
        self.pool.sender_for(peer).bind(conn).await;
    }

    /// Accept every stream `incoming` yields until it ends.
    pub fn spawn_incoming<S>(self: &Arc<Self>, incoming: S) -> JoinHandle<()>
    where
        S: Stream<Item = (PeerId, BoxStream)> + Send + Unpin + 'static,
    {
        let service = self.clone();
        tokio::spawn(async move {
            let mut incoming = incoming;
            while let Some((peer, stream)) = incoming.next().await {
                let service = service.clone();
                tokio::spawn(async move { service.handle_new_stream(peer, stream).await });
            }
            debug!("inbound stream source closed");
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.events.subscribe()
    }
}

#[async_trait]
impl NetworkPort for BazaarService {
    async fn send_request(&self, ctx: &CancellationToken, peer: PeerId, msg: Message) -> Result<Message> {
        if self.bans.is_banned(&peer) {
            return Err(Error::PeerBanned(peer));
        }
        debug!("sending {:?} request to {}", msg.kind(), peer);
        match self.pool.sender_for(peer).send_request(ctx, msg).await {
            Ok(reply) => {
                debug!("received response from {}", peer);
                Ok(reply)
            }
            Err(e) => {
                debug!("no response from {}: {}", peer, e);
                Err(e)
            }
        }
    }

    async fn send_message(&self, ctx: &CancellationToken, peer: PeerId, msg: Message) -> Result<()> {
        if self.bans.is_banned(&peer) {
            return Err(Error::PeerBanned(peer));
        }
        debug!("sending {:?} message to {}", msg.kind(), peer);
        self.pool.sender_for(peer).send_message(ctx, msg).await
    }

    fn broadcast(&self, payload: Vec<u8>) -> usize {
        self.events.send(payload).unwrap_or(0)
    }
}
