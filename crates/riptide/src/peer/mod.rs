//! One peer connection: the post-handshake message loop, choke/interest
//! state, the outstanding-request window and payload accounting. The
//! reader half owns protocol state; a writer task owns the socket's write
//! half and the outgoing cipher.

pub mod handshake;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use riptide_core::Id20;
use riptide_core::lengths::BlockInfo;
use riptide_core::peer_id::has_slow_request_window;
use riptide_wire::crypto::StreamCipher;
use riptide_wire::extended::{EXTENDED_HANDSHAKE_ID, ExtendedHandshake};
use riptide_wire::message::{MAX_REQUEST_LEN, Message, PieceHeader, Request as WireRequest};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use self::handshake::Established;
use crate::error::DisconnectReason;
use crate::picker::PieceSpeed;
use crate::torrent::{PeerStats, Torrent};
use crate::type_aliases::{BF, PeerHandle};

/// Outstanding requests clamped for clients known to choke on deep queues.
const SLOW_CLIENT_WINDOW: usize = 50;
/// Lazy bitfields clear at most this many bits.
const LAZY_BITFIELD_BITS: usize = 50;

/// Commands to the writer half of a peer connection.
#[derive(Debug)]
pub enum WriterRequest {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Request(WireRequest),
    Cancel(WireRequest),
    /// Serve a peer's request; the payload is read from disk by the
    /// writer so the reader never blocks on it.
    Upload(WireRequest),
    /// Drop every queued upload (we just choked this peer).
    ClearUploads,
    Disconnect,
}

struct SharedUploads {
    queue: Mutex<VecDeque<WireRequest>>,
}

/// Run a connection that already finished its handshake. Returns when the
/// peer goes away; in-flight picker state is reclaimed on every exit path.
pub async fn run<S>(
    torrent: Arc<Torrent>,
    addr: PeerHandle,
    our_id: Id20,
    outgoing: bool,
    est: Established<S>,
) -> Result<(), DisconnectReason>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let stats = PeerStats::new();
    torrent.attach_peer(addr, est.remote.peer_id, our_id, outgoing, tx.clone(), stats.clone())?;

    let uploads = Arc::new(SharedUploads {
        queue: Mutex::new(VecDeque::new()),
    });
    let (read_half, write_half) = tokio::io::split(est.stream);

    let writer = tokio::spawn(writer_loop(WriterCtx {
        torrent: torrent.clone(),
        addr,
        stats: stats.clone(),
        uploads: uploads.clone(),
        remote_supports_extended: est.remote.supports_extended(),
        write_half,
        cipher: est.write_cipher,
        rx,
    }));

    let mut reader = Reader {
        torrent: torrent.clone(),
        addr,
        stats,
        tx,
        uploads,
        cipher: est.read_cipher,
        remote_id: est.remote.peer_id,
        peer_bits: BF::repeat(false, torrent.meta.lengths.total_pieces() as usize),
        counted_as_seed: false,
        peer_choking: true,
        am_interested: false,
        messages_seen: 0,
        outstanding: VecDeque::new(),
        reqq_limit: None,
        client_version: None,
        window_bytes: 0,
        window_start: Instant::now(),
        last_activity: Instant::now(),
    };

    let result = reader.run_loop(read_half, est.leftover).await;

    reader.teardown();
    torrent.remove_peer(addr);
    writer.abort();

    if let Err(reason) = &result {
        debug!(%addr, %reason, "peer disconnected");
        torrent.alerts.push(crate::alerts::Alert::PeerDisconnected {
            info_hash: torrent.info_hash(),
            peer: addr,
            reason: duplicate_reason(reason),
        });
    }
    result
}

fn duplicate_reason(r: &DisconnectReason) -> DisconnectReason {
    use DisconnectReason::*;
    match r {
        InvalidInfoHash => InvalidInfoHash,
        DuplicatePeerId => DuplicatePeerId,
        SelfConnection => SelfConnection,
        OversizeMessage(n) => OversizeMessage(*n),
        InvalidMessageId(n) => InvalidMessageId(*n),
        InvalidMessageSize => InvalidMessageSize,
        InvalidBitfieldSize => InvalidBitfieldSize,
        BitfieldAfterHave => BitfieldAfterHave,
        EncryptedDisabled => EncryptedDisabled,
        EncryptionRequired => EncryptionRequired,
        SyncHashNotFound => SyncHashNotFound,
        InvalidCryptoSelect(n) => InvalidCryptoSelect(*n),
        PeerBanned => PeerBanned,
        InvalidRequest => InvalidRequest,
        ClosedByPeer => ClosedByPeer,
        TimedOut => TimedOut,
        OperationAborted => OperationAborted,
        Io(e) => Io(std::io::Error::new(e.kind(), e.to_string())),
        Handshake(s) => Handshake(s),
    }
}

struct Reader {
    torrent: Arc<Torrent>,
    addr: PeerHandle,
    stats: Arc<PeerStats>,
    tx: mpsc::UnboundedSender<WriterRequest>,
    uploads: Arc<SharedUploads>,
    cipher: Box<dyn StreamCipher>,
    remote_id: Id20,
    peer_bits: BF,
    counted_as_seed: bool,
    peer_choking: bool,
    am_interested: bool,
    messages_seen: u64,
    outstanding: VecDeque<(BlockInfo, Instant)>,
    /// Peer's advertised inbound queue depth (BEP-10 `reqq`).
    reqq_limit: Option<usize>,
    client_version: Option<String>,
    /// Rolling payload window for the speed class.
    window_bytes: u64,
    window_start: Instant,
    last_activity: Instant,
}

impl Reader {
    async fn run_loop<R: AsyncRead + Unpin>(
        &mut self,
        mut read_half: R,
        leftover: Vec<u8>,
    ) -> Result<(), DisconnectReason> {
        let mut buf: Vec<u8> = leftover;
        let mut consumed = 0usize;
        // Streaming state for a partially received piece message.
        let mut in_flight: Option<(PieceHeader, Vec<u8>)> = None;
        let mut tick = tokio::time::interval(Duration::from_secs(2));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut chunk = vec![0u8; 64 * 1024];

        loop {
            // Drain whatever is already buffered.
            loop {
                let window = &buf[consumed..];
                if window.is_empty() {
                    break;
                }
                if let Some((header, partial)) = in_flight.take() {
                    let missing = header.payload_len as usize - partial.len();
                    let take = missing.min(window.len());
                    let mut partial = partial;
                    partial.extend_from_slice(&window[..take]);
                    consumed += take;
                    if partial.len() == header.payload_len as usize {
                        self.on_piece(header, partial).await?;
                    } else {
                        in_flight = Some((header, partial));
                    }
                    continue;
                }
                match Message::deserialize(window) {
                    Ok((msg, len)) => {
                        consumed += len;
                        self.on_message(msg).await?;
                    }
                    Err(riptide_wire::WireError::NotEnoughData(_)) => {
                        // Piece bodies stream into their own buffer instead
                        // of waiting for the whole frame.
                        if let Some(header) = Message::peek_piece_header(window) {
                            consumed += riptide_wire::message::PIECE_HEADER_LEN;
                            self.account_protocol_rx(
                                riptide_wire::message::PIECE_HEADER_LEN as u64,
                            );
                            in_flight = Some((
                                header,
                                Vec::with_capacity(header.payload_len as usize),
                            ));
                            continue;
                        }
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            // Compact.
            if consumed > 0 {
                buf.drain(..consumed);
                consumed = 0;
            }

            tokio::select! {
                read = read_half.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        return Err(DisconnectReason::ClosedByPeer);
                    }
                    self.cipher.process(&mut chunk[..n]);
                    buf.extend_from_slice(&chunk[..n]);
                    self.last_activity = Instant::now();
                }
                _ = tick.tick() => {
                    self.on_tick()?;
                }
            }
        }
    }

    fn config(&self) -> Arc<crate::config::RuntimeConfig> {
        self.torrent.config.load()
    }

    fn account_protocol_rx(&self, n: u64) {
        self.stats.protocol_rx.fetch_add(n, Ordering::Relaxed);
    }

    fn on_tick(&mut self) -> Result<(), DisconnectReason> {
        let cfg = self.config();
        if self.last_activity.elapsed() > cfg.peer_idle_timeout {
            return Err(DisconnectReason::TimedOut);
        }
        // Expire overdue requests back to the picker so someone else can
        // pick them up.
        let deadline = cfg.request_timeout;
        let mut expired = Vec::new();
        while let Some((block, sent)) = self.outstanding.front() {
            if sent.elapsed() > deadline {
                expired.push(*block);
                self.outstanding.pop_front();
            } else {
                break;
            }
        }
        if !expired.is_empty() {
            let mut state = self.torrent.state.lock();
            for block in &expired {
                trace!(%self.addr, ?block, "request timed out");
                state.picker.abort_download(*block, self.addr);
            }
            drop(state);
            // Best effort: the peer may not have sent the block yet.
            for block in expired {
                let _ = self.tx.send(WriterRequest::Cancel(WireRequest::new(
                    block.piece_index.get(),
                    block.offset,
                    block.size,
                )));
            }
        }
        self.request_more();
        Ok(())
    }

    async fn on_message(&mut self, msg: Message<'_>) -> Result<(), DisconnectReason> {
        // Bitfield legality depends on it being the very first message.
        let first_message = self.messages_seen == 0;
        if !matches!(msg, Message::KeepAlive) {
            self.messages_seen += 1;
        }
        match msg {
            Message::KeepAlive => {
                self.account_protocol_rx(4);
            }
            Message::Choke => {
                self.account_protocol_rx(5);
                self.peer_choking = true;
                // Everything in flight is dead; hand it back.
                let mut state = self.torrent.state.lock();
                for (block, _) in self.outstanding.drain(..) {
                    state.picker.abort_download(block, self.addr);
                }
            }
            Message::Unchoke => {
                self.account_protocol_rx(5);
                self.peer_choking = false;
                self.request_more();
            }
            Message::Interested => {
                self.account_protocol_rx(5);
                self.stats.peer_interested.store(true, Ordering::Relaxed);
            }
            Message::NotInterested => {
                self.account_protocol_rx(5);
                self.stats.peer_interested.store(false, Ordering::Relaxed);
            }
            Message::Have(piece) => {
                self.account_protocol_rx(9);
                if piece >= self.torrent.meta.lengths.total_pieces() {
                    return Err(DisconnectReason::InvalidMessageSize);
                }
                if !self.peer_bits[piece as usize] {
                    self.peer_bits.set(piece as usize, true);
                    if !self.counted_as_seed {
                        self.torrent.state.lock().picker.inc_refcount(piece);
                    }
                }
                self.update_interest();
                self.request_more();
            }
            Message::Bitfield(bytes) => {
                self.account_protocol_rx(5 + bytes.len() as u64);
                if !first_message {
                    return Err(DisconnectReason::BitfieldAfterHave);
                }
                let expected = self.torrent.meta.lengths.piece_bitfield_bytes();
                if bytes.len() != expected {
                    return Err(DisconnectReason::InvalidBitfieldSize);
                }
                let mut bits = BF::from_slice(bytes);
                bits.truncate(self.torrent.meta.lengths.total_pieces() as usize);
                self.peer_bits = bits;
                let mut state = self.torrent.state.lock();
                if self.peer_bits.all() {
                    state.picker.inc_seed_count();
                    self.counted_as_seed = true;
                } else {
                    state.picker.inc_refcount_bitfield(&self.peer_bits);
                }
                drop(state);
                self.update_interest();
                self.request_more();
            }
            Message::Request(r) => {
                self.account_protocol_rx(17);
                self.on_request(r)?;
            }
            Message::Piece { index, begin, data } => {
                self.account_protocol_rx(13);
                let header = PieceHeader {
                    index,
                    begin,
                    payload_len: data.len() as u32,
                };
                self.on_piece(header, data.to_vec()).await?;
            }
            Message::Cancel(r) => {
                self.account_protocol_rx(17);
                // Best effort: only requests not yet picked up by the
                // writer can be withdrawn.
                self.uploads.queue.lock().retain(|q| *q != r);
            }
            Message::DhtPort(port) => {
                self.account_protocol_rx(7);
                trace!(%self.addr, port, "peer advertised a DHT port");
            }
            Message::Extended { ext_id, payload } => {
                self.account_protocol_rx(6 + payload.len() as u64);
                if ext_id == EXTENDED_HANDSHAKE_ID {
                    self.on_extended_handshake(payload)?;
                }
                // Payloads of negotiated extensions are outside the core.
            }
        }
        Ok(())
    }

    fn on_extended_handshake(&mut self, payload: &[u8]) -> Result<(), DisconnectReason> {
        let hs = ExtendedHandshake::deserialize(payload)
            .map_err(|_| DisconnectReason::InvalidMessageSize)?;
        if let Some(v) = &hs.v {
            trace!(%self.addr, client = %v, "extended handshake");
            self.client_version = Some(v.clone());
        }
        // A reqq of 0 would deadlock the connection; clamp it up.
        self.reqq_limit = hs.reqq.map(|r| (r as usize).max(1));
        Ok(())
    }

    fn on_request(&mut self, r: WireRequest) -> Result<(), DisconnectReason> {
        if r.length > MAX_REQUEST_LEN {
            return Err(DisconnectReason::InvalidRequest);
        }
        let Some(_block) = self
            .torrent
            .meta
            .lengths
            .block_from_wire(r.index, r.begin, r.length)
        else {
            return Err(DisconnectReason::InvalidRequest);
        };
        // Never service requests while choking.
        if self.stats.am_choking.load(Ordering::Relaxed) {
            trace!(%self.addr, ?r, "request while choked, ignoring");
            return Ok(());
        }
        if !self.torrent.state.lock().picker.has_piece(r.index) {
            return Ok(());
        }
        let cfg = self.config();
        {
            let mut queue = self.uploads.queue.lock();
            if queue.len() >= cfg.max_allowed_in_request_queue {
                trace!(%self.addr, "inbound request queue full, dropping");
                return Ok(());
            }
            queue.push_back(r);
        }
        let _ = self.tx.send(WriterRequest::Upload(r));
        Ok(())
    }

    async fn on_piece(
        &mut self,
        header: PieceHeader,
        data: Vec<u8>,
    ) -> Result<(), DisconnectReason> {
        self.stats
            .payload_rx
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.window_bytes += data.len() as u64;

        let Some(block) = self.torrent.meta.lengths.block_from_wire(
            header.index,
            header.begin,
            header.payload_len,
        ) else {
            return Err(DisconnectReason::InvalidRequest);
        };
        let Some(pos) = self.outstanding.iter().position(|(b, _)| *b == block) else {
            // Not ours (cancelled or end-game duplicate); drop it.
            trace!(%self.addr, ?block, "unsolicited block");
            return Ok(());
        };
        self.outstanding.remove(pos);

        {
            let mut state = self.torrent.state.lock();
            if !state.picker.mark_as_writing(block, self.addr) {
                // Someone else's copy won the race to disk.
                drop(state);
                self.request_more();
                return Ok(());
            }
        }
        let ack = self
            .torrent
            .disk
            .write_block(
                self.torrent.storage_id,
                block,
                data.into_boxed_slice(),
                self.addr,
            )
            .await;
        let mut state = self.torrent.state.lock();
        match ack {
            Ok(Ok(())) => state.picker.mark_as_finished(block),
            Ok(Err(e)) => {
                state.picker.write_failed(block);
                drop(state);
                self.torrent.on_storage_error(e);
                self.request_more();
                return Ok(());
            }
            Err(_) => {
                state.picker.write_failed(block);
                return Err(DisconnectReason::OperationAborted);
            }
        }
        drop(state);
        self.request_more();
        Ok(())
    }

    fn speed_class(&mut self) -> PieceSpeed {
        let elapsed = self.window_start.elapsed();
        if elapsed > Duration::from_secs(10) {
            self.window_bytes = 0;
            self.window_start = Instant::now();
        }
        let secs = self.window_start.elapsed().as_secs().max(1);
        let rate = self.window_bytes / secs;
        match rate {
            0..=16_383 => PieceSpeed::Slow,
            16_384..=524_287 => PieceSpeed::Medium,
            _ => PieceSpeed::Fast,
        }
    }

    fn update_interest(&mut self) {
        let mut state = self.torrent.state.lock();
        let interested = self
            .peer_bits
            .iter_ones()
            .any(|p| !state.picker.has_piece(p as u32) && state.picker.piece_priority(p as u32) != 0);
        drop(state);
        if interested != self.am_interested {
            self.am_interested = interested;
            let _ = self.tx.send(if interested {
                WriterRequest::Interested
            } else {
                WriterRequest::NotInterested
            });
        }
    }

    fn request_more(&mut self) {
        if self.peer_choking || !self.am_interested {
            return;
        }
        let cfg = self.config();
        let mut window = cfg.max_out_request_queue;
        if has_slow_request_window(&self.remote_id) {
            window = window.min(SLOW_CLIENT_WINDOW);
        }
        if let Some(reqq) = self.reqq_limit {
            window = window.min(reqq);
        }
        let want = window.saturating_sub(self.outstanding.len());
        if want == 0 {
            return;
        }
        let speed = self.speed_class();
        let picks = {
            let mut state = self.torrent.state.lock();
            let on_parole = state.parole.contains(&self.addr);
            let picks = state.picker.pick_pieces(
                &self.peer_bits,
                want,
                0,
                self.addr,
                speed,
                true,
                on_parole,
                &[],
            );
            for block in &picks {
                state.picker.mark_as_downloading(*block, self.addr, speed);
            }
            picks
        };
        for block in picks {
            self.outstanding.push_back((block, Instant::now()));
            let _ = self.tx.send(WriterRequest::Request(WireRequest::new(
                block.piece_index.get(),
                block.offset,
                block.size,
            )));
        }
    }

    /// Hand everything back on the way out.
    fn teardown(&mut self) {
        trace!(%self.addr, client = ?self.client_version, "peer torn down");
        let mut state = self.torrent.state.lock();
        for (block, _) in self.outstanding.drain(..) {
            state.picker.abort_download(block, self.addr);
        }
        if self.counted_as_seed {
            state.picker.dec_seed_count();
        } else if self.peer_bits.any() {
            state.picker.dec_refcount_bitfield(&self.peer_bits);
        }
    }
}

struct WriterCtx<W> {
    torrent: Arc<Torrent>,
    addr: PeerHandle,
    stats: Arc<PeerStats>,
    uploads: Arc<SharedUploads>,
    remote_supports_extended: bool,
    write_half: W,
    cipher: Box<dyn StreamCipher>,
    rx: mpsc::UnboundedReceiver<WriterRequest>,
}

async fn writer_loop<W: AsyncWrite + Unpin>(mut ctx: WriterCtx<W>) {
    if let Err(e) = writer_loop_inner(&mut ctx).await {
        debug!(addr = %ctx.addr, error = %e, "peer writer stopped");
    }
}

async fn writer_loop_inner<W: AsyncWrite + Unpin>(
    ctx: &mut WriterCtx<W>,
) -> Result<(), DisconnectReason> {
    let cfg = ctx.torrent.config.load();
    let mut out = Vec::with_capacity(riptide_wire::message::PIECE_HEADER_LEN + 16 * 1024);

    // Subscribe before the bitfield snapshot so no `have` slips between.
    let mut have_rx = ctx.torrent.have_tx.subscribe();
    send_initial_bitfield(ctx, &mut out).await?;
    if ctx.remote_supports_extended {
        let hs = ExtendedHandshake {
            p: Some(cfg.listen_port),
            v: Some(cfg.client_version.clone()),
            reqq: Some(cfg.max_allowed_in_request_queue as u32),
            ..Default::default()
        };
        let payload = hs.serialize();
        out.clear();
        Message::Extended {
            ext_id: EXTENDED_HANDSHAKE_ID,
            payload: &payload,
        }
        .serialize(&mut out);
        send_protocol(ctx, &mut out).await?;
    }

    let mut keepalive = tokio::time::interval(cfg.keep_alive_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.reset();

    loop {
        tokio::select! {
            req = ctx.rx.recv() => {
                let Some(req) = req else { return Ok(()) };
                match req {
                    WriterRequest::Choke => {
                        ctx.stats.am_choking.store(true, Ordering::Relaxed);
                        // Choking cancels queued piece uploads.
                        ctx.uploads.queue.lock().clear();
                        out.clear();
                        Message::Choke.serialize(&mut out);
                        send_protocol(ctx, &mut out).await?;
                    }
                    WriterRequest::Unchoke => {
                        ctx.stats.am_choking.store(false, Ordering::Relaxed);
                        out.clear();
                        Message::Unchoke.serialize(&mut out);
                        send_protocol(ctx, &mut out).await?;
                    }
                    WriterRequest::Interested => {
                        out.clear();
                        Message::Interested.serialize(&mut out);
                        send_protocol(ctx, &mut out).await?;
                    }
                    WriterRequest::NotInterested => {
                        out.clear();
                        Message::NotInterested.serialize(&mut out);
                        send_protocol(ctx, &mut out).await?;
                    }
                    WriterRequest::Have(piece) => {
                        out.clear();
                        Message::Have(piece).serialize(&mut out);
                        send_protocol(ctx, &mut out).await?;
                    }
                    WriterRequest::Request(r) => {
                        out.clear();
                        Message::Request(r).serialize(&mut out);
                        send_protocol(ctx, &mut out).await?;
                    }
                    WriterRequest::Cancel(r) => {
                        out.clear();
                        Message::Cancel(r).serialize(&mut out);
                        send_protocol(ctx, &mut out).await?;
                    }
                    WriterRequest::Upload(r) => {
                        serve_upload(ctx, r, &mut out).await?;
                    }
                    WriterRequest::ClearUploads => {
                        ctx.uploads.queue.lock().clear();
                    }
                    WriterRequest::Disconnect => {
                        return Ok(());
                    }
                }
            }
            have = have_rx.recv() => {
                match have {
                    Ok(piece) => {
                        out.clear();
                        Message::Have(piece).serialize(&mut out);
                        send_protocol(ctx, &mut out).await?;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
            _ = keepalive.tick() => {
                out.clear();
                Message::KeepAlive.serialize(&mut out);
                send_protocol(ctx, &mut out).await?;
            }
        }
    }
}

/// Send the initial bitfield, obfuscating seed status when lazy bitfields
/// are on: up to 50 random bits are withheld and followed up as `have`s.
async fn send_initial_bitfield<W: AsyncWrite + Unpin>(
    ctx: &mut WriterCtx<W>,
    out: &mut Vec<u8>,
) -> Result<(), DisconnectReason> {
    let cfg = ctx.torrent.config.load();
    let (mut bits, is_seed, num_have) = {
        let state = ctx.torrent.state.lock();
        (
            state.picker.have_bitfield().clone(),
            state.picker.is_seed(),
            state.picker.num_have(),
        )
    };
    if num_have == 0 {
        return Ok(());
    }
    let mut withheld: Vec<u32> = Vec::new();
    if is_seed && cfg.lazy_bitfields {
        let total = bits.len();
        let n = LAZY_BITFIELD_BITS.min(total / 2).max(1);
        let mut rng = rand::rng();
        use rand::Rng;
        while withheld.len() < n {
            let piece = rng.random_range(0..total) as u32;
            if !withheld.contains(&piece) {
                withheld.push(piece);
                bits.set(piece as usize, false);
            }
        }
    }
    out.clear();
    Message::Bitfield(bits.as_raw_slice()).serialize(out);
    send_protocol(ctx, out).await?;
    for piece in withheld {
        out.clear();
        Message::Have(piece).serialize(out);
        send_protocol(ctx, out).await?;
    }
    Ok(())
}

async fn serve_upload<W: AsyncWrite + Unpin>(
    ctx: &mut WriterCtx<W>,
    r: WireRequest,
    out: &mut Vec<u8>,
) -> Result<(), DisconnectReason> {
    // A cancel or a choke may have withdrawn it already.
    {
        let mut queue = ctx.uploads.queue.lock();
        let Some(pos) = queue.iter().position(|q| *q == r) else {
            return Ok(());
        };
        queue.remove(pos);
    }
    if ctx.stats.am_choking.load(Ordering::Relaxed) {
        return Ok(());
    }
    let Some(block) = ctx
        .torrent
        .meta
        .lengths
        .block_from_wire(r.index, r.begin, r.length)
    else {
        return Ok(());
    };
    let data = match ctx
        .torrent
        .disk
        .read_block(ctx.torrent.storage_id, block, ctx.addr, false)
        .await
    {
        Ok(Ok(data)) => data,
        Ok(Err(e)) => {
            ctx.torrent.on_storage_error(e);
            return Ok(());
        }
        Err(_) => return Err(DisconnectReason::OperationAborted),
    };
    out.clear();
    Message::Piece {
        index: r.index,
        begin: r.begin,
        data: &data,
    }
    .serialize(out);
    let payload = data.len() as u64;
    let total = out.len() as u64;
    ctx.cipher.process(out);
    ctx.write_half.write_all(out).await?;
    ctx.stats.payload_tx.fetch_add(payload, Ordering::Relaxed);
    ctx.stats
        .protocol_tx
        .fetch_add(total - payload, Ordering::Relaxed);
    trace!(addr = %ctx.addr, ?r, "served block");
    Ok(())
}

async fn send_protocol<W: AsyncWrite + Unpin>(
    ctx: &mut WriterCtx<W>,
    out: &mut Vec<u8>,
) -> Result<(), DisconnectReason> {
    let len = out.len() as u64;
    ctx.cipher.process(out);
    ctx.write_half.write_all(out).await?;
    ctx.stats.protocol_tx.fetch_add(len, Ordering::Relaxed);
    Ok(())
}

#[cfg(test)]
mod tests;
