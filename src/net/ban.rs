//! Process-wide set of banned peers.

use libp2p::PeerId;
use log::info;
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Default)]
pub struct BanManager {
    banned: RwLock<HashSet<PeerId>>,
}

impl BanManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peers(peers: impl IntoIterator<Item = PeerId>) -> Self {
        Self { banned: RwLock::new(peers.into_iter().collect()) }
    }

    pub fn ban(&self, peer: PeerId) {
        if self.banned.write().unwrap_or_else(PoisonError::into_inner).insert(peer) {
            info!("banned {}", peer);
        }
    }

    pub fn unban(&self, peer: &PeerId) {
        if self.banned.write().unwrap_or_else(PoisonError::into_inner).remove(peer) {
            info!("unbanned {}", peer);
        }
    }

    pub fn is_banned(&self, peer: &PeerId) -> bool {
        self.banned.read().unwrap_or_else(PoisonError::into_inner).contains(peer)
    }

    pub fn banned_peers(&self) -> Vec<PeerId> {
        self.banned.read().unwrap_or_else(PoisonError::into_inner).iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_and_unban() {
        let bans = BanManager::new();
        let peer = PeerId::random();
        assert!(!bans.is_banned(&peer));
        bans.ban(peer);
        bans.ban(peer);
        assert!(bans.is_banned(&peer));
        assert_eq!(bans.banned_peers(), vec![peer]);
        bans.unban(&peer);
        assert!(!bans.is_banned(&peer));
    }

    #[test]
    fn seeded_from_list() {
        let peers = [PeerId::random(), PeerId::random()];
        let bans = BanManager::with_peers(peers);
        assert!(peers.iter().all(|p| bans.is_banned(p)));
    }
}
