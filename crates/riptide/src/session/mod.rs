//! The session: owns torrents, the disk pool, the listener and the
//! periodic choker; routes disk completions back to their torrents.

pub mod choker;
pub mod smart_ban;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use rand::Rng;
use riptide_core::Id20;
use riptide_core::metainfo::Metainfo;
use riptide_core::peer_id::generate_peer_id;
use riptide_wire::mse::req2_hash;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertQueue};
use crate::config::{ConfigHandle, EncPolicy, RuntimeConfig};
use crate::disk::{DiskEvent, DiskHandle, DiskIo, DiskTorrent};
use crate::error::DisconnectReason;
use crate::peer::handshake::{self, TorrentLookup};
use crate::storage::file_pool::FilePool;
use crate::storage::{FileStorage, StorageVariant};
use crate::torrent::Torrent;
use crate::type_aliases::{PeerHandle, StorageId};

pub struct AddTorrentOptions {
    pub output_dir: PathBuf,
    /// Preallocate files to their full size instead of growing sparsely.
    pub allocate: bool,
    pub resume_data: Option<Vec<u8>>,
    pub sequential: bool,
}

impl AddTorrentOptions {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            allocate: false,
            resume_data: None,
            sequential: false,
        }
    }
}

pub struct Session {
    pub config: Arc<ConfigHandle>,
    pub peer_id: Id20,
    torrents: RwLock<HashMap<Id20, Arc<Torrent>>>,
    by_req2: RwLock<HashMap<[u8; 20], Id20>>,
    by_storage: RwLock<HashMap<StorageId, Id20>>,
    disk: DiskHandle,
    disk_io: parking_lot::Mutex<Option<DiskIo>>,
    file_pool: Arc<FilePool>,
    alerts: Arc<AlertQueue>,
    next_storage: AtomicU32,
    next_owner: AtomicU32,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let file_pool = Arc::new(FilePool::new(config.file_pool_size));
        let config = Arc::new(ConfigHandle::new(config));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (disk_io, disk) = DiskIo::spawn(config.clone(), events_tx);

        let session = Arc::new(Session {
            config,
            peer_id: generate_peer_id(),
            torrents: RwLock::new(HashMap::new()),
            by_req2: RwLock::new(HashMap::new()),
            by_storage: RwLock::new(HashMap::new()),
            disk,
            disk_io: parking_lot::Mutex::new(Some(disk_io)),
            file_pool,
            alerts: Arc::new(AlertQueue::new(256)),
            next_storage: AtomicU32::new(1),
            next_owner: AtomicU32::new(1),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(Self::event_pump(session.clone(), events_rx));
        tokio::spawn(Self::choke_timer(session.clone()));
        session
    }

    pub fn alerts(&self) -> &Arc<AlertQueue> {
        &self.alerts
    }

    /// Publish a new settings snapshot; everything picks it up at its next
    /// loop boundary.
    pub fn apply_settings(&self, config: RuntimeConfig) {
        self.config.store(config);
    }

    pub fn find_torrent(&self, info_hash: &Id20) -> Option<Arc<Torrent>> {
        self.torrents.read().get(info_hash).cloned()
    }

    pub async fn add_torrent(
        self: &Arc<Self>,
        meta: Arc<Metainfo>,
        options: AddTorrentOptions,
    ) -> anyhow::Result<Arc<Torrent>> {
        let info_hash = meta.info_hash;
        if self.torrents.read().contains_key(&info_hash) {
            anyhow::bail!("torrent {info_hash} is already attached");
        }
        let storage_id = StorageId(self.next_storage.fetch_add(1, Ordering::Relaxed));
        let owner = self.next_owner.fetch_add(1, Ordering::Relaxed) as u64;
        let storage = FileStorage::new(
            storage_id,
            owner,
            meta.files.clone(),
            meta.lengths,
            options.output_dir,
            self.file_pool.clone(),
            self.config.clone(),
        );
        self.disk.register_torrent(
            storage_id,
            DiskTorrent {
                storage: parking_lot::RwLock::new(StorageVariant::Default(storage)),
                meta: meta.clone(),
                salt: rand::rng().random(),
            },
        );

        let torrent = Torrent::new(
            meta,
            storage_id,
            self.disk.clone(),
            self.config.clone(),
            self.alerts.clone(),
        );
        torrent.state.lock().picker.set_sequential(options.sequential);

        // Resume data, when present and valid, seeds the have-set. A
        // mismatch is surfaced but not fatal: the torrent just starts
        // from what the files actually contain (nothing, conservatively).
        if let Some(blob) = options.resume_data {
            match self.disk.verify_resume(storage_id, blob).await {
                Ok(Ok(check)) => {
                    let mut state = torrent.state.lock();
                    for piece in check.have.iter_ones() {
                        state.picker.we_have(piece as u32);
                    }
                    if check.seed {
                        info!(%info_hash, "resume data authorizes seeding");
                    }
                }
                Ok(Err(e)) => {
                    warn!(%info_hash, error = %e, "resume data rejected");
                    self.alerts.push(Alert::TorrentError {
                        info_hash,
                        error: e,
                    });
                }
                Err(_) => anyhow::bail!("disk pool is gone"),
            }
        }

        let initialized = self
            .disk
            .initialize(storage_id, options.allocate)
            .await?;
        if let Err(e) = initialized {
            // Leave nothing behind on the disk side.
            let _ = self.disk.abort_torrent(storage_id, false);
            anyhow::bail!("storage initialization failed: {e}");
        }

        self.torrents.write().insert(info_hash, torrent.clone());
        self.by_req2
            .write()
            .insert(req2_hash(&info_hash), info_hash);
        self.by_storage.write().insert(storage_id, info_hash);
        info!(%info_hash, %storage_id, "torrent added");
        Ok(torrent)
    }

    /// Detach a torrent: peers are told to leave, outstanding disk jobs
    /// drain behind fences, then the storage is released or deleted.
    pub async fn remove_torrent(&self, info_hash: &Id20, delete_files: bool) {
        let Some(torrent) = self.torrents.write().remove(info_hash) else {
            return;
        };
        self.by_req2.write().remove(&req2_hash(info_hash));
        self.by_storage.write().remove(&torrent.storage_id);
        {
            let state = torrent.state.lock();
            for slot in state.peers.values() {
                let _ = slot.tx.send(crate::peer::WriterRequest::Disconnect);
            }
        }
        let _ = self.disk.abort_torrent(torrent.storage_id, delete_files).await;
        info!(%info_hash, delete_files, "torrent removed");
    }

    /// Bind and start accepting peers.
    pub async fn listen(self: &Arc<Self>, addr: std::net::SocketAddr) -> std::io::Result<std::net::SocketAddr> {
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                self.alerts.push(Alert::ListenFailed {
                    addr,
                    error: std::io::Error::new(e.kind(), e.to_string()),
                });
                return Err(e);
            }
        };
        let local = listener.local_addr()?;
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer_addr)) => {
                                debug!(%peer_addr, "incoming connection");
                                let session = session.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = session.run_incoming(stream, peer_addr).await {
                                        debug!(%peer_addr, error = %e, "incoming peer failed");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                                break;
                            }
                        }
                    }
                }
            }
        });
        info!(%local, "listening");
        Ok(local)
    }

    async fn run_incoming(
        self: Arc<Self>,
        stream: TcpStream,
        addr: PeerHandle,
    ) -> Result<(), DisconnectReason> {
        let cfg = self.config.load();
        let (info_hash, est) = tokio::time::timeout(
            cfg.handshake_timeout,
            handshake::establish_incoming(stream, &*self, self.peer_id, &cfg),
        )
        .await
        .map_err(|_| DisconnectReason::TimedOut)??;
        let torrent = self
            .find_torrent(&info_hash)
            .ok_or(DisconnectReason::InvalidInfoHash)?;
        crate::peer::run(torrent, addr, self.peer_id, false, est).await
    }

    /// Dial a peer for a torrent. Per policy the connection opens plain or
    /// with MSE; with `Enabled`, an early plain failure reconnects with
    /// MSE before giving up.
    pub fn connect_peer(self: &Arc<Self>, info_hash: Id20, addr: PeerHandle) {
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.run_outgoing(info_hash, addr).await {
                debug!(%addr, error = %e, "outgoing peer failed");
            }
        });
    }

    async fn run_outgoing(
        self: Arc<Self>,
        info_hash: Id20,
        addr: PeerHandle,
    ) -> Result<(), DisconnectReason> {
        let torrent = self
            .find_torrent(&info_hash)
            .ok_or(DisconnectReason::InvalidInfoHash)?;
        if torrent.smart_ban.lock().is_banned(addr.ip()) {
            return Err(DisconnectReason::PeerBanned);
        }
        let cfg = self.config.load();
        let attempts: &[bool] = match cfg.out_enc_policy {
            EncPolicy::Disabled => &[false],
            EncPolicy::Forced => &[true],
            EncPolicy::Enabled => &[false, true],
        };
        let mut last_err = DisconnectReason::TimedOut;
        for (i, &mse) in attempts.iter().enumerate() {
            let stream = match TcpStream::connect(addr).await {
                Ok(s) => s,
                Err(e) => return Err(DisconnectReason::Io(e)),
            };
            let est = tokio::time::timeout(
                cfg.handshake_timeout,
                handshake::establish_outgoing(stream, info_hash, self.peer_id, mse, &cfg),
            )
            .await
            .map_err(|_| DisconnectReason::TimedOut)
            .and_then(|r| r);
            match est {
                Ok(est) => {
                    return crate::peer::run(torrent, addr, self.peer_id, true, est).await;
                }
                Err(e) => {
                    if i + 1 < attempts.len() {
                        debug!(%addr, error = %e, "handshake failed, retrying with MSE");
                    }
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn event_pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<DiskEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                DiskEvent::PieceHashed {
                    storage,
                    piece,
                    ok,
                    digests,
                } => {
                    if let Some(torrent) = self.torrent_by_storage(storage) {
                        torrent.on_piece_hashed(piece, ok, &digests);
                    }
                }
                DiskEvent::Error { storage, error } => {
                    if let Some(torrent) = self.torrent_by_storage(storage) {
                        torrent.on_storage_error(error);
                    }
                }
            }
        }
    }

    fn torrent_by_storage(&self, storage: StorageId) -> Option<Arc<Torrent>> {
        let info_hash = *self.by_storage.read().get(&storage)?;
        self.find_torrent(&info_hash)
    }

    async fn choke_timer(self: Arc<Self>) {
        let mut choker_by_torrent: HashMap<Id20, choker::Choker> = HashMap::new();
        loop {
            let cfg = self.config.load();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(cfg.unchoke_interval) => {}
            }
            let torrents: Vec<Arc<Torrent>> = self.torrents.read().values().cloned().collect();
            choker_by_torrent.retain(|ih, _| torrents.iter().any(|t| t.info_hash() == *ih));
            for torrent in torrents {
                choker_by_torrent
                    .entry(torrent.info_hash())
                    .or_default()
                    .tick(&torrent, &cfg);
            }
        }
    }

    /// Stop background tasks and join the disk pool. Torrent state stays
    /// on disk; resume data should be written beforehand.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(io) = self.disk_io.lock().take() {
            io.shutdown();
        }
    }
}

impl TorrentLookup for Session {
    fn knows_info_hash(&self, info_hash: &Id20) -> bool {
        self.torrents.read().contains_key(info_hash)
    }

    fn find_by_req2(&self, req2: &[u8; 20]) -> Option<Id20> {
        self.by_req2.read().get(req2).copied()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests;
