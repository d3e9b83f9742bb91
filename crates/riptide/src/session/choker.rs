//! Unchoke scheduling: every interval, rank unchokable peers by what they
//! are worth to us and unchoke the top few. One extra optimistic slot
//! rotates through peers we never unchoked, so newcomers get a chance to
//! prove themselves.

use rand::seq::IndexedRandom;
use std::sync::atomic::Ordering;

use tracing::trace;

use crate::config::RuntimeConfig;
use crate::peer::WriterRequest;
use crate::torrent::Torrent;
use crate::type_aliases::PeerHandle;

/// How often the optimistic slot rotates, in choke rounds.
pub const OPTIMISTIC_ROTATION: u64 = 3;

#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub addr: PeerHandle,
    /// Upload opportunity: bytes received since the last round while
    /// leeching, bytes sent while seeding.
    pub score: u64,
    pub interested: bool,
    pub never_unchoked: bool,
}

/// Pick who stays unchoked this round. Pure so it can be tested without a
/// live torrent: the regular slots go to the highest-scoring interested
/// peers, the optimistic peer rides along for free.
pub fn select_unchoked(
    candidates: &[Candidate],
    max_uploads: usize,
    optimistic: Option<PeerHandle>,
) -> Vec<PeerHandle> {
    let mut ranked: Vec<&Candidate> = candidates.iter().filter(|c| c.interested).collect();
    ranked.sort_by(|a, b| b.score.cmp(&a.score).then(a.addr.cmp(&b.addr)));
    let mut out: Vec<PeerHandle> = ranked
        .iter()
        .take(max_uploads)
        .map(|c| c.addr)
        .collect();
    if let Some(opt) = optimistic {
        if !out.contains(&opt) && candidates.iter().any(|c| c.addr == opt && c.interested) {
            out.push(opt);
        }
    }
    out
}

pub struct Choker {
    round: u64,
    optimistic: Option<PeerHandle>,
}

impl Choker {
    pub fn new() -> Self {
        Self {
            round: 0,
            optimistic: None,
        }
    }

    /// Run one round against a torrent: sample stats, rotate the
    /// optimistic slot, apply choke/unchoke transitions.
    pub fn tick(&mut self, torrent: &Torrent, cfg: &RuntimeConfig) {
        self.round += 1;
        let state = torrent.state.lock();
        let seeding = state.picker.is_seed();

        let mut candidates = Vec::with_capacity(state.peers.len());
        for (addr, slot) in &state.peers {
            let rx = slot.stats.payload_rx.load(Ordering::Relaxed);
            let tx = slot.stats.payload_tx.load(Ordering::Relaxed);
            let prev_rx = slot.stats.sampled_rx.swap(rx, Ordering::Relaxed);
            let prev_tx = slot.stats.sampled_tx.swap(tx, Ordering::Relaxed);
            let score = if seeding {
                tx.saturating_sub(prev_tx)
            } else {
                rx.saturating_sub(prev_rx)
            };
            candidates.push(Candidate {
                addr: *addr,
                score,
                interested: slot.stats.peer_interested.load(Ordering::Relaxed),
                never_unchoked: slot.never_unchoked,
            });
        }

        if self.round % OPTIMISTIC_ROTATION == 1 || self.optimistic.is_none() {
            let fresh: Vec<PeerHandle> = candidates
                .iter()
                .filter(|c| c.never_unchoked && c.interested)
                .map(|c| c.addr)
                .collect();
            self.optimistic = fresh.choose(&mut rand::rng()).copied().or(self.optimistic);
        }

        let unchoke = select_unchoked(&candidates, cfg.max_uploads, self.optimistic);
        trace!(round = self.round, unchoked = unchoke.len(), "choke round");
        drop(state);

        let mut state = torrent.state.lock();
        for (addr, slot) in state.peers.iter_mut() {
            let should_unchoke = unchoke.contains(addr);
            let currently_choking = slot.stats.am_choking.load(Ordering::Relaxed);
            if should_unchoke && currently_choking {
                slot.never_unchoked = false;
                let _ = slot.tx.send(WriterRequest::Unchoke);
            } else if !should_unchoke && !currently_choking {
                // The writer clears queued piece uploads on choke.
                let _ = slot.tx.send(WriterRequest::Choke);
            }
        }
    }
}

impl Default for Choker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> PeerHandle {
        format!("10.0.0.{n}:6881").parse().unwrap()
    }

    fn cand(n: u8, score: u64, interested: bool) -> Candidate {
        Candidate {
            addr: addr(n),
            score,
            interested,
            never_unchoked: false,
        }
    }

    #[test]
    fn test_top_uploaders_win() {
        let c = [
            cand(1, 100, true),
            cand(2, 500, true),
            cand(3, 300, true),
            cand(4, 900, false), // not interested: ineligible
        ];
        let picked = select_unchoked(&c, 2, None);
        assert_eq!(picked, vec![addr(2), addr(3)]);
    }

    #[test]
    fn test_optimistic_rides_along() {
        let c = [cand(1, 100, true), cand(2, 500, true), cand(3, 0, true)];
        let picked = select_unchoked(&c, 2, Some(addr(3)));
        assert_eq!(picked, vec![addr(2), addr(1), addr(3)]);
    }

    #[test]
    fn test_optimistic_already_in_top_not_duplicated() {
        let c = [cand(1, 100, true), cand(2, 500, true)];
        let picked = select_unchoked(&c, 2, Some(addr(2)));
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn test_uninterested_optimistic_skipped() {
        let c = [cand(1, 100, true), cand(2, 0, false)];
        let picked = select_unchoked(&c, 1, Some(addr(2)));
        assert_eq!(picked, vec![addr(1)]);
    }
}
