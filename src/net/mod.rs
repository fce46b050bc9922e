//! Peer messaging over libp2p streams.

pub mod ban;
pub mod codec;
pub mod host;
pub mod pb;
pub mod sender;
pub mod service;
pub mod stream;

pub use ban::BanManager;
pub use host::{spawn_swarm, BoxStream, Libp2pHost, StreamHost, PROTOCOL};
pub use pb::{Message, MessageType};
pub use sender::{MessageSender, SenderPool};
pub use service::{BazaarService, Handler, HandlerContext, HandlerTable};
