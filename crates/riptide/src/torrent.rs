use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64};

use parking_lot::Mutex;
use riptide_core::Id20;
use riptide_core::metainfo::Metainfo;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::alerts::{Alert, AlertQueue};
use crate::config::ConfigHandle;
use crate::disk::DiskHandle;
use crate::error::{DisconnectReason, StorageError};
use crate::peer::WriterRequest;
use crate::picker::PiecePicker;
use crate::session::smart_ban::SmartBan;
use crate::type_aliases::{PeerHandle, StorageId};

/// Counters a peer task keeps current and the choker samples. Payload is
/// piece-message bodies; everything else on the wire is protocol.
#[derive(Default)]
pub struct PeerStats {
    pub payload_rx: AtomicU64,
    pub payload_tx: AtomicU64,
    pub protocol_rx: AtomicU64,
    pub protocol_tx: AtomicU64,
    pub peer_interested: AtomicBool,
    pub am_choking: AtomicBool,
    /// Snapshot fields owned by the choker between ticks.
    pub sampled_rx: AtomicU64,
    pub sampled_tx: AtomicU64,
}

impl PeerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            am_choking: AtomicBool::new(true),
            ..Default::default()
        })
    }
}

pub struct PeerSlot {
    pub peer_id: Id20,
    pub outgoing: bool,
    pub tx: mpsc::UnboundedSender<WriterRequest>,
    pub stats: Arc<PeerStats>,
    /// Never been unchoked by us; candidates for the optimistic slot.
    pub never_unchoked: bool,
}

pub struct TorrentState {
    pub picker: PiecePicker,
    pub peers: HashMap<PeerHandle, PeerSlot>,
    /// Peers that contributed to a failed piece and haven't cleared their
    /// name yet; the picker confines them to attributable pieces.
    pub parole: HashSet<PeerHandle>,
    /// Fatal storage error, if the torrent is wedged.
    pub error: Option<StorageError>,
}

pub struct Torrent {
    pub meta: Arc<Metainfo>,
    pub storage_id: StorageId,
    pub state: Mutex<TorrentState>,
    pub smart_ban: Mutex<SmartBan>,
    pub have_tx: broadcast::Sender<u32>,
    pub disk: DiskHandle,
    pub config: Arc<ConfigHandle>,
    pub alerts: Arc<AlertQueue>,
}

impl Torrent {
    pub fn new(
        meta: Arc<Metainfo>,
        storage_id: StorageId,
        disk: DiskHandle,
        config: Arc<ConfigHandle>,
        alerts: Arc<AlertQueue>,
    ) -> Arc<Self> {
        let (have_tx, _) = broadcast::channel(512);
        let picker = PiecePicker::new(meta.lengths);
        Arc::new(Torrent {
            meta,
            storage_id,
            state: Mutex::new(TorrentState {
                picker,
                peers: HashMap::new(),
                parole: HashSet::new(),
                error: None,
            }),
            smart_ban: Mutex::new(SmartBan::new()),
            have_tx,
            disk,
            config,
            alerts,
        })
    }

    pub fn info_hash(&self) -> Id20 {
        self.meta.info_hash
    }

    /// Register a connection that completed its handshake. Applies the ban
    /// list and the duplicate-peer-id rule: between two connections to the
    /// same address with the same peer id, the endpoint with the greater
    /// peer id keeps its outgoing side.
    pub fn attach_peer(
        &self,
        addr: PeerHandle,
        peer_id: Id20,
        our_id: Id20,
        outgoing: bool,
        tx: mpsc::UnboundedSender<WriterRequest>,
        stats: Arc<PeerStats>,
    ) -> Result<(), DisconnectReason> {
        if peer_id == our_id {
            return Err(DisconnectReason::SelfConnection);
        }
        if self.smart_ban.lock().is_banned(addr.ip()) {
            return Err(DisconnectReason::PeerBanned);
        }
        let cfg = self.config.load();
        let mut state = self.state.lock();

        if !cfg.allow_multiple_connections_per_ip {
            let duplicate = state
                .peers
                .iter()
                .find(|(existing_addr, slot)| {
                    existing_addr.ip() == addr.ip() && slot.peer_id == peer_id
                })
                .map(|(a, s)| (*a, s.outgoing));
            if let Some((existing_addr, existing_outgoing)) = duplicate {
                // Which side survives is deterministic on both endpoints.
                let keep_our_outgoing = our_id > peer_id;
                let new_wins = outgoing == keep_our_outgoing;
                if !new_wins {
                    return Err(DisconnectReason::DuplicatePeerId);
                }
                if let Some(slot) = state.peers.remove(&existing_addr) {
                    let _ = slot.tx.send(WriterRequest::Disconnect);
                }
                debug!(%addr, existing = %existing_addr, existing_outgoing, "duplicate peer id, replacing older side");
            }
        }

        state.peers.insert(
            addr,
            PeerSlot {
                peer_id,
                outgoing,
                tx,
                stats,
                never_unchoked: true,
            },
        );
        Ok(())
    }

    pub fn remove_peer(&self, addr: PeerHandle) {
        self.state.lock().peers.remove(&addr);
    }

    pub fn num_peers(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// A piece finished verification on the disk side.
    pub fn on_piece_hashed(&self, piece: u32, ok: bool, digests: &[[u8; 20]]) {
        if ok {
            let (convicted, cleared) = {
                let mut ban = self.smart_ban.lock();
                ban.evaluate_passed_piece(piece, digests)
            };
            {
                let mut state = self.state.lock();
                state.picker.we_have(piece);
                for peer in &convicted {
                    state.parole.remove(peer);
                    if let Some(slot) = state.peers.remove(peer) {
                        let _ = slot.tx.send(WriterRequest::Disconnect);
                    }
                }
                // Contributors whose blocks checked out come off parole.
                for peer in &cleared {
                    state.parole.remove(peer);
                }
            }
            for peer in convicted {
                info!(%peer, piece, "peer banned after delivering a corrupt block");
                self.alerts.push(Alert::PeerBanned {
                    info_hash: self.info_hash(),
                    peer,
                });
            }
            let _ = self.have_tx.send(piece);
            if self.state.lock().picker.is_seed() {
                info!(info_hash = %self.info_hash(), "torrent complete");
            }
        } else {
            let contributors = {
                let mut state = self.state.lock();
                let contributors = state.picker.piece_failed(piece);
                for peer in contributors.iter().flatten() {
                    state.parole.insert(*peer);
                }
                contributors
            };
            self.smart_ban
                .lock()
                .record_failed_piece(piece, &contributors, digests);
            // Drop whatever partial state the disk still holds.
            self.disk.clear_piece(self.storage_id, piece);
            self.alerts.push(Alert::PieceHashFailed {
                info_hash: self.info_hash(),
                piece,
            });
        }
    }

    /// Rename one file on disk and in the mapping. Completion is an alert.
    pub async fn rename_file(
        &self,
        file_index: usize,
        new_name: std::path::PathBuf,
    ) -> Result<(), StorageError> {
        let rx = self
            .disk
            .rename_file(self.storage_id, file_index, new_name.clone());
        match rx.await {
            Ok(Ok(())) => {
                self.alerts.push(Alert::FileRenamed {
                    info_hash: self.info_hash(),
                    file_index,
                    new_name,
                });
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StorageError::new(
                crate::error::StorageOp::Rename,
                Some(file_index),
                crate::error::StorageErrorKind::Aborted,
            )),
        }
    }

    /// A storage error surfaced from the disk side.
    pub fn on_storage_error(&self, error: StorageError) {
        if error.is_fatal() {
            let mut state = self.state.lock();
            if state.error.is_none() {
                state.error = Some(error.duplicate());
                drop(state);
                self.alerts.push(Alert::TorrentError {
                    info_hash: self.info_hash(),
                    error,
                });
            }
        }
    }

    pub fn is_wedged(&self) -> bool {
        self.state.lock().error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::disk::DiskIo;

    fn make_torrent() -> (Arc<Torrent>, DiskIo) {
        let config = Arc::new(ConfigHandle::new(RuntimeConfig::default()));
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (io, disk) = DiskIo::spawn(config.clone(), events_tx);
        let raw = {
            use riptide_bencode::DictBuilder;
            let info = DictBuilder::new()
                .push_integer("length", 65536)
                .push_str("name", "t")
                .push_integer("piece length", 16384)
                .push_bytes("pieces", &[0u8; 80]);
            DictBuilder::new().push_dict("info", info).finish()
        };
        let meta = Arc::new(Metainfo::parse(&raw).unwrap());
        let alerts = Arc::new(AlertQueue::new(64));
        (
            Torrent::new(meta, StorageId(1), disk, config, alerts),
            io,
        )
    }

    fn id(n: u8) -> Id20 {
        Id20::new([n; 20])
    }

    fn addr(n: u8, port: u16) -> PeerHandle {
        format!("10.0.0.{n}:{port}").parse().unwrap()
    }

    fn slot_tx() -> (
        mpsc::UnboundedSender<WriterRequest>,
        mpsc::UnboundedReceiver<WriterRequest>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_self_connection_rejected() {
        let (t, _io) = make_torrent();
        let (tx, _rx) = slot_tx();
        let err = t
            .attach_peer(addr(1, 1000), id(7), id(7), true, tx, PeerStats::new())
            .unwrap_err();
        assert!(matches!(err, DisconnectReason::SelfConnection));
    }

    #[test]
    fn test_duplicate_peer_id_greater_keeps_outgoing() {
        let (t, _io) = make_torrent();
        let our_id = id(9);
        let their_id = id(3); // ours is greater

        // Incoming connection arrives first.
        let (tx1, mut rx1) = slot_tx();
        t.attach_peer(addr(1, 1000), their_id, our_id, false, tx1, PeerStats::new())
            .unwrap();
        // Our outgoing connection to the same peer: we have the greater
        // id, so our outgoing side wins and the incoming one is told to
        // go away.
        let (tx2, _rx2) = slot_tx();
        t.attach_peer(addr(1, 2000), their_id, our_id, true, tx2, PeerStats::new())
            .unwrap();
        assert!(matches!(
            rx1.try_recv(),
            Ok(WriterRequest::Disconnect)
        ));
        assert_eq!(t.num_peers(), 1);

        // The mirror case: their id is greater, our outgoing side loses.
        let our_small = id(1);
        let their_big = id(200);
        let (tx3, _rx3) = slot_tx();
        t.attach_peer(addr(2, 1000), their_big, our_small, false, tx3, PeerStats::new())
            .unwrap();
        let (tx4, _rx4) = slot_tx();
        let err = t
            .attach_peer(addr(2, 2000), their_big, our_small, true, tx4, PeerStats::new())
            .unwrap_err();
        assert!(matches!(err, DisconnectReason::DuplicatePeerId));
    }

    #[test]
    fn test_duplicate_allowed_when_configured() {
        let (t, _io) = make_torrent();
        t.config.store(RuntimeConfig {
            allow_multiple_connections_per_ip: true,
            ..RuntimeConfig::default()
        });
        let (tx1, _rx1) = slot_tx();
        t.attach_peer(addr(1, 1000), id(3), id(9), false, tx1, PeerStats::new())
            .unwrap();
        let (tx2, _rx2) = slot_tx();
        t.attach_peer(addr(1, 2000), id(3), id(9), true, tx2, PeerStats::new())
            .unwrap();
        assert_eq!(t.num_peers(), 2);
    }

    #[test]
    fn test_banned_peer_rejected() {
        let (t, _io) = make_torrent();
        let a = addr(1, 1000);
        t.smart_ban.lock().ban(a.ip());
        let (tx, _rx) = slot_tx();
        let err = t
            .attach_peer(a, id(3), id(9), true, tx, PeerStats::new())
            .unwrap_err();
        assert!(matches!(err, DisconnectReason::PeerBanned));
    }

    #[test]
    fn test_hash_fail_puts_contributors_on_parole() {
        let (t, _io) = make_torrent();
        let x = addr(1, 1000);
        {
            let mut state = t.state.lock();
            let all = crate::type_aliases::BF::repeat(true, 4);
            state.picker.inc_refcount_bitfield(&all);
            let lengths = t.meta.lengths;
            let idx = lengths.validate_piece_index(0).unwrap();
            let block = lengths.block_info(idx, 0).unwrap();
            state
                .picker
                .mark_as_downloading(block, x, crate::picker::PieceSpeed::Medium);
        }
        t.on_piece_hashed(0, false, &[[1u8; 20]]);
        assert!(t.state.lock().parole.contains(&x));
        let alerts = t.alerts.pop_all();
        assert!(alerts
            .iter()
            .any(|a| matches!(a, Alert::PieceHashFailed { piece: 0, .. })));
    }
}
