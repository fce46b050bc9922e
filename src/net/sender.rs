//! Per-peer message senders.

use libp2p::PeerId;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::host::StreamHost;
use super::pb::Message;
use super::stream::{Connection, RequestHandler};
use crate::error::{Error, Result};

/// Sends to one peer over a lazily opened stream.
///
/// The slot mutex is held for the whole send, so frames from concurrent
/// callers never interleave and a request owns the stream until its reply
/// arrives. A stream error empties the slot and the next send opens a new
/// stream.
pub struct MessageSender {
    peer: PeerId,
    host: Arc<dyn StreamHost>,
    handler: Arc<dyn RequestHandler>,
    max_message_size: usize,
    request_timeout: Duration,
    conn: Mutex<Option<Arc<Connection>>>,
}

impl MessageSender {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// One-way send. Retries once on a fresh stream if the write fails.
    pub async fn send_message(&self, ctx: &CancellationToken, msg: Message) -> Result<()> {
        let mut slot = self.conn.lock().await;
        let mut retried = false;
        loop {
            let conn = self.ensure(ctx, &mut slot).await?;
            match conn.write(msg.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_stream_error() && !retried => {
                    debug!("send to {} failed, reopening: {}", self.peer, e);
                    invalidate(&mut slot).await;
                    retried = true;
                }
                Err(e) => {
                    invalidate(&mut slot).await;
                    return Err(e);
                }
            }
        }
    }

    /// Send a request and wait for its reply, `ctx` cancellation or the
    /// request timeout. A timeout leaves the stream in place.
    pub async fn send_request(&self, ctx: &CancellationToken, msg: Message) -> Result<Message> {
        let mut slot = self.conn.lock().await;
        let mut retried = false;
        let (conn, id, reply) = loop {
            let conn = self.ensure(ctx, &mut slot).await?;
            match conn.request(msg.clone()).await {
                Ok((id, reply)) => break (conn, id, reply),
                Err(e) if e.is_stream_error() && !retried => {
                    debug!("request to {} failed, reopening: {}", self.peer, e);
                    invalidate(&mut slot).await;
                    retried = true;
                }
                Err(e) => {
                    invalidate(&mut slot).await;
                    return Err(e);
                }
            }
        };

        tokio::select! {
            res = reply => match res {
                Ok(msg) => Ok(msg),
                Err(_) => {
                    invalidate(&mut slot).await;
                    Err(Error::StreamReset(format!("stream to {} closed before reply", self.peer)))
                }
            },
            _ = ctx.cancelled() => {
                conn.forget(id);
                Err(Error::Cancelled)
            }
            _ = tokio::time::sleep(self.request_timeout) => {
                conn.forget(id);
                Err(Error::Timeout(format!("no reply from {} within {:?}", self.peer, self.request_timeout)))
            }
        }
    }

    /// Use an inbound stream from this peer for later sends. The stream it
    /// replaces is closed.
    pub async fn bind(&self, conn: Arc<Connection>) {
        let old = self.conn.lock().await.replace(conn.clone());
        if let Some(old) = old.filter(|old| !Arc::ptr_eq(old, &conn)) {
            debug!("replacing stream to {}", self.peer);
            old.close().await;
        }
    }

    async fn ensure(&self, ctx: &CancellationToken, slot: &mut Option<Arc<Connection>>) -> Result<Arc<Connection>> {
        if let Some(conn) = slot.as_ref().filter(|c| c.is_alive()) {
            return Ok(conn.clone());
        }
        let stream = tokio::select! {
            res = self.host.new_stream(self.peer) => res?,
            _ = ctx.cancelled() => return Err(Error::Cancelled),
        };
        debug!("opened stream to {}", self.peer);
        let conn = Connection::open(self.peer, stream, self.max_message_size, self.handler.clone());
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

async fn invalidate(slot: &mut Option<Arc<Connection>>) {
    if let Some(conn) = slot.take() {
        conn.close().await;
    }
}

/// Lazily built `MessageSender` per peer.
pub struct SenderPool {
    host: Arc<dyn StreamHost>,
    handler: Arc<dyn RequestHandler>,
    max_message_size: usize,
    request_timeout: Duration,
    senders: std::sync::Mutex<HashMap<PeerId, Arc<MessageSender>>>,
}

impl SenderPool {
    pub fn new(
        host: Arc<dyn StreamHost>,
        handler: Arc<dyn RequestHandler>,
        max_message_size: usize,
        request_timeout: Duration,
    ) -> Self {
        Self { host, handler, max_message_size, request_timeout, senders: std::sync::Mutex::new(HashMap::new()) }
    }

    pub fn sender_for(&self, peer: PeerId) -> Arc<MessageSender> {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders
            .entry(peer)
            .or_insert_with(|| {
                Arc::new(MessageSender {
                    peer,
                    host: self.host.clone(),
                    handler: self.handler.clone(),
                    max_message_size: self.max_message_size,
                    request_timeout: self.request_timeout,
                    conn: Mutex::new(None),
                })
            })
            .clone()
    }

    pub fn handler(&self) -> Arc<dyn RequestHandler> {
        self.handler.clone()
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::DEFAULT_MAX_MESSAGE_SIZE;
    use crate::net::host::testutil::MemoryNetwork;
    use crate::net::pb::MessageType;
    use async_trait::async_trait;

    /// Echoes CHAT after a short pause, drops FOLLOW, fails on BLOCK.
    struct Remote {
        seen: std::sync::Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl RequestHandler for Remote {
        async fn handle(&self, _peer: PeerId, msg: Message) -> Result<Option<Message>> {
            self.seen.lock().unwrap().push(msg.payload.clone());
            match msg.kind() {
                Some(MessageType::Chat) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(Some(Message::new(MessageType::Chat, msg.payload)))
                }
                Some(MessageType::Follow) => Ok(None),
                _ => Err(Error::StreamReset("reset".into())),
            }
        }
    }

    struct Idle;

    #[async_trait]
    impl RequestHandler for Idle {
        async fn handle(&self, _peer: PeerId, _msg: Message) -> Result<Option<Message>> {
            Ok(None)
        }
    }

    struct Setup {
        pool: SenderPool,
        host: Arc<crate::net::host::testutil::MemoryHost>,
        remote: Arc<Remote>,
        remote_peer: PeerId,
    }

    fn setup(timeout: Duration) -> Setup {
        let net = MemoryNetwork::default();
        let (host, _) = net.join(PeerId::random());
        let remote_peer = PeerId::random();
        let (_, mut inbound) = net.join(remote_peer);
        let remote = Arc::new(Remote { seen: std::sync::Mutex::new(Vec::new()) });
        let handler: Arc<dyn RequestHandler> = remote.clone();
        tokio::spawn(async move {
            let mut open = Vec::new();
            while let Some((peer, stream)) = inbound.recv().await {
                open.push(Connection::open(peer, Box::new(stream), DEFAULT_MAX_MESSAGE_SIZE, handler.clone()));
            }
        });
        let host = Arc::new(host);
        let pool = SenderPool::new(host.clone(), Arc::new(Idle), DEFAULT_MAX_MESSAGE_SIZE, timeout);
        Setup { pool, host, remote, remote_peer }
    }

    #[tokio::test]
    async fn concurrent_requests_serialize_and_reset_reopens() {
        let s = setup(Duration::from_secs(5));
        let sender = s.pool.sender_for(s.remote_peer);
        let ctx = CancellationToken::new();

        let (a, b) = tokio::join!(
            sender.send_request(&ctx, Message::new(MessageType::Chat, b"first".to_vec())),
            sender.send_request(&ctx, Message::new(MessageType::Chat, b"second".to_vec())),
        );
        assert_eq!(a.unwrap().payload, b"first".to_vec());
        assert_eq!(b.unwrap().payload, b"second".to_vec());
        assert_eq!(s.host.streams_opened(), 1);
        assert_eq!(s.remote.seen.lock().unwrap().len(), 2);

        let err = sender.send_request(&ctx, Message::new(MessageType::Block, vec![])).await.unwrap_err();
        assert!(matches!(err, Error::StreamReset(_)));

        let reply = sender.send_request(&ctx, Message::new(MessageType::Chat, b"again".to_vec())).await.unwrap();
        assert_eq!(reply.payload, b"again".to_vec());
        assert_eq!(s.host.streams_opened(), 2);
    }

    #[tokio::test]
    async fn same_sender_per_peer() {
        let s = setup(Duration::from_secs(5));
        let a = s.pool.sender_for(s.remote_peer);
        let b = s.pool.sender_for(s.remote_peer);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(s.host.streams_opened(), 0);
    }

    #[tokio::test]
    async fn timeout_keeps_stream() {
        let s = setup(Duration::from_millis(50));
        let sender = s.pool.sender_for(s.remote_peer);
        let ctx = CancellationToken::new();
        let err = sender.send_request(&ctx, Message::new(MessageType::Follow, vec![])).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        sender.send_message(&ctx, Message::new(MessageType::Follow, vec![])).await.unwrap();
        assert_eq!(s.host.streams_opened(), 1);
    }

    #[tokio::test]
    async fn cancelled_request() {
        let s = setup(Duration::from_secs(5));
        let sender = s.pool.sender_for(s.remote_peer);
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = sender.send_request(&ctx, Message::new(MessageType::Follow, vec![])).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn rebinding_closes_previous_stream() {
        let s = setup(Duration::from_secs(5));
        let sender = s.pool.sender_for(s.remote_peer);
        let mut conns = Vec::new();
        for _ in 0..2 {
            let stream = s.host.new_stream(s.remote_peer).await.unwrap();
            conns.push(Connection::open(s.remote_peer, stream, DEFAULT_MAX_MESSAGE_SIZE, Arc::new(Idle)));
        }

        sender.bind(conns[0].clone()).await;
        sender.bind(conns[0].clone()).await;
        assert!(conns[0].is_alive());

        sender.bind(conns[1].clone()).await;
        assert!(!conns[0].is_alive());
        assert!(conns[1].is_alive());

        sender.send_message(&CancellationToken::new(), Message::new(MessageType::Follow, vec![])).await.unwrap();
        assert_eq!(s.host.streams_opened(), 2);
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let s = setup(Duration::from_secs(5));
        let sender = s.pool.sender_for(PeerId::random());
        let err = sender
            .send_message(&CancellationToken::new(), Message::new(MessageType::Ping, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerUnreachable { .. }));
    }
}
