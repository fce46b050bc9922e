//! One framed protocol stream with its reader task.
//!
//! Every stream, inbound or outbound, has exactly one reader. Responses
//! are routed to the waiting request by id; requests go to the handler and
//! the reply is written back on the same stream.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use libp2p::PeerId;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio::task::AbortHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::DelimitedCodec;
use super::host::BoxStream;
use super::pb::Message;
use crate::error::{Error, Result};

/// Answers requests arriving on a stream. An error closes the stream.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, peer: PeerId, msg: Message) -> Result<Option<Message>>;
}

type Pending = HashMap<u32, oneshot::Sender<Message>>;

pub struct Connection {
    peer: PeerId,
    writer: Mutex<FramedWrite<WriteHalf<BoxStream>, DelimitedCodec>>,
    pending: std::sync::Mutex<Pending>,
    next_id: AtomicU32,
    alive: AtomicBool,
    reader: std::sync::Mutex<Option<AbortHandle>>,
}

impl Connection {
    /// Frame `stream` and start its reader.
    pub fn open(
        peer: PeerId,
        stream: BoxStream,
        max_message_size: usize,
        handler: Arc<dyn RequestHandler>,
    ) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        let conn = Arc::new(Self {
            peer,
            writer: Mutex::new(FramedWrite::new(write_half, DelimitedCodec::new(max_message_size))),
            pending: std::sync::Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            alive: AtomicBool::new(true),
            reader: std::sync::Mutex::new(None),
        });
        let reader = FramedRead::new(read_half, DelimitedCodec::new(max_message_size));
        let task = tokio::spawn(read_loop(conn.clone(), reader, handler));
        *conn.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(task.abort_handle());
        conn
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub async fn write(&self, msg: Message) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::StreamReset(format!("stream to {} is closed", self.peer)));
        }
        let result = self.writer.lock().await.send(msg).await;
        if let Err(e) = &result {
            debug!("write to {} failed: {}", self.peer, e);
            self.mark_dead();
        }
        result
    }

    /// Send `msg` as a request and return the channel its reply lands on.
    pub async fn request(&self, mut msg: Message) -> Result<(u32, oneshot::Receiver<Message>)> {
        let id = self.fresh_id();
        msg.request_id = id;
        msg.is_response = false;
        let (tx, rx) = oneshot::channel();
        self.pending_map().insert(id, tx);
        if let Err(e) = self.write(msg).await {
            self.forget(id);
            return Err(e);
        }
        Ok((id, rx))
    }

    /// Drop the waiter for `id`, e.g. after a timeout.
    pub fn forget(&self, id: u32) {
        self.pending_map().remove(&id);
    }

    /// Stop the reader and shut the write side down.
    pub async fn close(&self) {
        self.mark_dead();
        if let Some(handle) = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        let _ = self.writer.lock().await.close().await;
    }

    fn fresh_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn pending_map(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_pending(&self, id: u32) -> Option<oneshot::Sender<Message>> {
        self.pending_map().remove(&id)
    }

    /// Waiters see their channel close and report a reset.
    fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.pending_map().clear();
    }
}

async fn read_loop(
    conn: Arc<Connection>,
    mut reader: FramedRead<ReadHalf<BoxStream>, DelimitedCodec>,
    handler: Arc<dyn RequestHandler>,
) {
    let peer = conn.peer;
    while let Some(frame) = reader.next().await {
        let msg = match frame {
            Ok(m) => m,
            Err(e) => {
                debug!("read from {} failed: {}", peer, e);
                break;
            }
        };
        if msg.is_response {
            match conn.take_pending(msg.request_id) {
                Some(waiter) => {
                    let _ = waiter.send(msg);
                }
                None => debug!("unsolicited response {} from {}", msg.request_id, peer),
            }
            continue;
        }

        debug!("received {:?} from {}", msg.kind(), peer);
        let request_id = msg.request_id;
        match handler.handle(peer, msg).await {
            Ok(Some(mut reply)) => {
                reply.request_id = request_id;
                reply.is_response = true;
                if conn.write(reply).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!("closing stream from {}: {}", peer, e);
                break;
            }
        }
    }
    conn.mark_dead();
    let _ = conn.writer.lock().await.close().await;
}
