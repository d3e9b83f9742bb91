//! Ban peers that demonstrably sent garbage: when a piece fails its hash,
//! record a salted digest of every block alongside who sent it. When a
//! later attempt at the same piece succeeds, any recorded digest that
//! differs from the good one convicts its sender.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use tracing::debug;

use crate::type_aliases::PeerHandle;

pub struct SmartBan {
    /// (piece, block) -> (contributor, salted digest of what they sent).
    suspects: HashMap<(u32, u16), (PeerHandle, [u8; 20])>,
    banned: HashSet<IpAddr>,
}

impl SmartBan {
    pub fn new() -> Self {
        Self {
            suspects: HashMap::new(),
            banned: HashSet::new(),
        }
    }

    /// A piece failed: remember each contributor with the salted digest of
    /// the block they delivered.
    pub fn record_failed_piece(
        &mut self,
        piece: u32,
        contributors: &[Option<PeerHandle>],
        digests: &[[u8; 20]],
    ) {
        for (block, (peer, digest)) in contributors.iter().zip(digests.iter()).enumerate() {
            if let Some(peer) = peer {
                self.suspects
                    .insert((piece, block as u16), (*peer, *digest));
            }
        }
    }

    /// The same piece later verified: compare the good digests with the
    /// recorded ones. Returns the convicted peers and the ones whose
    /// blocks turned out fine (their parole ends).
    pub fn evaluate_passed_piece(
        &mut self,
        piece: u32,
        good_digests: &[[u8; 20]],
    ) -> (Vec<PeerHandle>, Vec<PeerHandle>) {
        let mut convicted = Vec::new();
        let mut cleared = Vec::new();
        for (block, good) in good_digests.iter().enumerate() {
            if let Some((peer, recorded)) = self.suspects.remove(&(piece, block as u16)) {
                if recorded != *good {
                    debug!(piece, block, %peer, "smart-ban convicted peer");
                    if !convicted.contains(&peer) {
                        convicted.push(peer);
                    }
                } else if !cleared.contains(&peer) {
                    cleared.push(peer);
                }
            }
        }
        cleared.retain(|p| !convicted.contains(p));
        for peer in &convicted {
            self.banned.insert(peer.ip());
        }
        (convicted, cleared)
    }

    pub fn ban(&mut self, addr: IpAddr) {
        self.banned.insert(addr);
    }

    /// Bans are durable for the session.
    pub fn is_banned(&self, addr: IpAddr) -> bool {
        self.banned.contains(&addr)
    }
}

impl Default for SmartBan {
    fn default() -> Self {
        Self::new()
    }
}
