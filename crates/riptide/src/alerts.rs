use std::collections::VecDeque;
use std::path::PathBuf;

use parking_lot::Mutex;
use riptide_core::Id20;

use crate::error::{DisconnectReason, StorageError};
use crate::type_aliases::PeerHandle;

/// User-visible events. The queue is bounded; when it overflows, the
/// oldest non-critical alerts are dropped and a single `AlertsDropped`
/// records how many went missing.
#[derive(Debug)]
pub enum Alert {
    /// A fatal storage error moved the torrent into an error state.
    TorrentError {
        info_hash: Id20,
        error: StorageError,
    },
    PieceHashFailed {
        info_hash: Id20,
        piece: u32,
    },
    PeerBanned {
        info_hash: Id20,
        peer: PeerHandle,
    },
    PeerDisconnected {
        info_hash: Id20,
        peer: PeerHandle,
        reason: DisconnectReason,
    },
    FileRenamed {
        info_hash: Id20,
        file_index: usize,
        new_name: PathBuf,
    },
    ListenFailed {
        addr: std::net::SocketAddr,
        error: std::io::Error,
    },
    AlertsDropped {
        count: u64,
    },
}

impl Alert {
    fn is_critical(&self) -> bool {
        matches!(
            self,
            Alert::TorrentError { .. } | Alert::ListenFailed { .. } | Alert::AlertsDropped { .. }
        )
    }
}

pub struct AlertQueue {
    inner: Mutex<Inner>,
}

struct Inner {
    queue: VecDeque<Alert>,
    capacity: usize,
    dropped: u64,
}

impl AlertQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                capacity: capacity.max(1),
                dropped: 0,
            }),
        }
    }

    pub fn push(&self, alert: Alert) {
        let mut inner = self.inner.lock();
        if inner.queue.len() >= inner.capacity {
            // Shed the oldest non-critical entry.
            match inner.queue.iter().position(|a| !a.is_critical()) {
                Some(pos) => {
                    inner.queue.remove(pos);
                    inner.dropped += 1;
                }
                None => {
                    // Nothing sheddable; the incoming alert loses instead.
                    if !alert.is_critical() {
                        inner.dropped += 1;
                        return;
                    }
                    inner.queue.pop_front();
                    inner.dropped += 1;
                }
            }
        }
        inner.queue.push_back(alert);
    }

    /// Drain everything, with a coalesced drop marker when overflow
    /// happened since the last drain.
    pub fn pop_all(&self) -> Vec<Alert> {
        let mut inner = self.inner.lock();
        let mut out: Vec<Alert> = inner.queue.drain(..).collect();
        if inner.dropped > 0 {
            out.push(Alert::AlertsDropped {
                count: inner.dropped,
            });
            inner.dropped = 0;
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_alert(piece: u32) -> Alert {
        Alert::PieceHashFailed {
            info_hash: Id20::default(),
            piece,
        }
    }

    #[test]
    fn test_overflow_drops_oldest_noncritical() {
        let q = AlertQueue::new(2);
        q.push(info_alert(1));
        q.push(Alert::TorrentError {
            info_hash: Id20::default(),
            error: crate::error::StorageError::new(
                crate::error::StorageOp::Open,
                None,
                crate::error::StorageErrorKind::FileCollision,
            ),
        });
        q.push(info_alert(3));

        let drained = q.pop_all();
        // alert(1) was shed; the critical one survived; a drop marker
        // was coalesced at the end.
        assert_eq!(drained.len(), 3);
        assert!(matches!(drained[0], Alert::TorrentError { .. }));
        assert!(matches!(drained[1], Alert::PieceHashFailed { piece: 3, .. }));
        assert!(matches!(drained[2], Alert::AlertsDropped { count: 1 }));
    }

    #[test]
    fn test_drop_marker_counts_all() {
        let q = AlertQueue::new(1);
        for i in 0..5 {
            q.push(info_alert(i));
        }
        let drained = q.pop_all();
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[1], Alert::AlertsDropped { count: 4 }));
        // Counter resets after draining.
        assert!(q.pop_all().is_empty());
    }
}
