//! Stream transport: the libp2p swarm and the seam tests replace.

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::core::upgrade;
use libp2p::swarm::{self, SwarmEvent};
use libp2p::{identity, noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, Transport};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::compat::FuturesAsyncReadCompatExt;

use crate::config::NetConfig;
use crate::error::{Error, Result};

pub const PROTOCOL: StreamProtocol = StreamProtocol::new("/openbazaar/app/1.0.0");

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Opens outbound protocol streams to peers.
#[async_trait]
pub trait StreamHost: Send + Sync {
    fn local_peer(&self) -> PeerId;

    async fn new_stream(&self, peer: PeerId) -> Result<BoxStream>;
}

pub struct Libp2pHost {
    local: PeerId,
    control: libp2p_stream::Control,
}

#[async_trait]
impl StreamHost for Libp2pHost {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn new_stream(&self, peer: PeerId) -> Result<BoxStream> {
        let mut control = self.control.clone();
        let stream = control
            .open_stream(peer, PROTOCOL)
            .await
            .map_err(|e| Error::PeerUnreachable { peer, reason: e.to_string() })?;
        Ok(Box::new(stream.compat()))
    }
}

/// Inbound `(peer, stream)` pairs for the protocol.
pub type IncomingStreams = libp2p_stream::IncomingStreams;

/// Start a TCP + Noise + Yamux swarm that only speaks the stream protocol,
/// listen on the configured address and dial the bootstrap peers.
pub fn spawn_swarm(keypair: identity::Keypair, cfg: &NetConfig) -> Result<(Libp2pHost, IncomingStreams)> {
    let local = PeerId::from(keypair.public());
    let noise = noise::Config::new(&keypair).map_err(|e| Error::Config(format!("noise: {}", e)))?;
    let transport = tcp::tokio::Transport::new(tcp::Config::default())
        .upgrade(upgrade::Version::V1Lazy)
        .authenticate(noise)
        .multiplex(yamux::Config::default())
        .boxed();

    let behaviour = libp2p_stream::Behaviour::new();
    let mut control = behaviour.new_control();
    let incoming = control
        .accept(PROTOCOL)
        .map_err(|e| Error::Config(format!("protocol already registered: {}", e)))?;

    let mut swarm = Swarm::new(
        transport,
        behaviour,
        local,
        swarm::Config::with_tokio_executor().with_idle_connection_timeout(Duration::from_secs(60)),
    );

    let listen: Multiaddr = cfg
        .listen
        .parse()
        .map_err(|e| Error::Config(format!("listen address {}: {}", cfg.listen, e)))?;
    swarm
        .listen_on(listen)
        .map_err(|e| Error::Config(format!("listen failed: {}", e)))?;

    for addr in &cfg.bootstrap {
        match addr.parse::<Multiaddr>() {
            Ok(ma) => {
                if let Err(e) = swarm.dial(ma) {
                    warn!("failed to dial bootstrap peer {}: {}", addr, e);
                }
            }
            Err(e) => warn!("bad bootstrap address {}: {}", addr, e),
        }
    }

    tokio::spawn(async move {
        loop {
            match swarm.select_next_some().await {
                SwarmEvent::NewListenAddr { address, .. } => info!("listening on {}/p2p/{}", address, local),
                SwarmEvent::ConnectionEstablished { peer_id, .. } => debug!("connected to {}", peer_id),
                SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                    debug!("disconnected from {}: {:?}", peer_id, cause)
                }
                _ => {}
            }
        }
    });

    info!("bazaar protocol {} registered for {}", PROTOCOL, local);
    Ok((Libp2pHost { local, control }, incoming))
}

#[cfg(test)]
pub(crate) mod testutil {
    //! In-process host whose streams are `tokio::io::duplex` pipes.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    pub type Inbound = mpsc::UnboundedSender<(PeerId, DuplexStream)>;

    #[derive(Clone, Default)]
    pub struct MemoryNetwork {
        peers: std::sync::Arc<Mutex<HashMap<PeerId, Inbound>>>,
    }

    impl MemoryNetwork {
        /// Register `peer` and return its host plus inbound stream source.
        pub fn join(&self, peer: PeerId) -> (MemoryHost, mpsc::UnboundedReceiver<(PeerId, DuplexStream)>) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.peers.lock().unwrap().insert(peer, tx);
            (MemoryHost { local: peer, net: self.clone(), opened: AtomicUsize::new(0) }, rx)
        }
    }

    pub struct MemoryHost {
        local: PeerId,
        net: MemoryNetwork,
        opened: AtomicUsize,
    }

    impl MemoryHost {
        pub fn streams_opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StreamHost for MemoryHost {
        fn local_peer(&self) -> PeerId {
            self.local
        }

        async fn new_stream(&self, peer: PeerId) -> Result<BoxStream> {
            let inbound = self.net.peers.lock().unwrap().get(&peer).cloned();
            let inbound = inbound.ok_or_else(|| Error::PeerUnreachable { peer, reason: "no route".into() })?;
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            inbound
                .send((self.local, theirs))
                .map_err(|_| Error::PeerUnreachable { peer, reason: "peer gone".into() })?;
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ours))
        }
    }
}
