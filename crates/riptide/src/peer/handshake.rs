//! Connection establishment: plain BT1 and the MSE branch. Each protocol
//! step is a sequential await on the same buffered wire.

use byteorder::{BE, ByteOrder};
use riptide_core::Id20;
use riptide_wire::crypto::{PlainText, StreamCipher};
use riptide_wire::message::{HANDSHAKE_LEN, PSTR_BT1};
use riptide_wire::mse::{
    self, DH_KEY_LEN, DhKeyPair, KeyDirection, MAX_PAD_LEN, SYNC_SCAN_LIMIT, VC,
};
use riptide_wire::{Handshake, Rc4, WireError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::config::{EncPolicy, RuntimeConfig};
use crate::error::DisconnectReason;

/// How the session resolves which torrent a handshake belongs to.
pub trait TorrentLookup: Send + Sync {
    fn knows_info_hash(&self, info_hash: &Id20) -> bool;
    /// Resolve `HASH('req2', SKEY)` back to an attached torrent.
    fn find_by_req2(&self, req2: &[u8; 20]) -> Option<Id20>;
}

/// A connection that finished its handshake: ciphers locked in, the
/// remote's handshake parsed, any over-read bytes preserved (already
/// decrypted) for the message loop.
pub struct Established<S> {
    pub stream: S,
    pub remote: Handshake,
    pub read_cipher: Box<dyn StreamCipher>,
    pub write_cipher: Box<dyn StreamCipher>,
    pub leftover: Vec<u8>,
}

/// Buffered reader/writer used only during establishment.
struct Wire<S> {
    stream: S,
    buf: Vec<u8>,
    consumed: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Wire<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(1024),
            consumed: 0,
        }
    }

    fn window(&self) -> &[u8] {
        &self.buf[self.consumed..]
    }

    fn available(&self) -> usize {
        self.buf.len() - self.consumed
    }

    fn consume(&mut self, n: usize) {
        debug_assert!(self.consumed + n <= self.buf.len());
        self.consumed += n;
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        let out = self.window()[..n].to_vec();
        self.consume(n);
        out
    }

    fn rest(&mut self) -> Vec<u8> {
        let out = self.window().to_vec();
        self.consumed = self.buf.len();
        out
    }

    async fn read_any(&mut self) -> Result<(), DisconnectReason> {
        let mut chunk = [0u8; 1024];
        let n = self.stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(DisconnectReason::ClosedByPeer);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    async fn fill_to(&mut self, n: usize) -> Result<(), DisconnectReason> {
        while self.available() < n {
            self.read_any().await?;
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), DisconnectReason> {
        self.stream.write_all(data).await?;
        Ok(())
    }
}

fn plain_cipher() -> Box<dyn StreamCipher> {
    Box::new(PlainText)
}

/// Initiate a connection we dialed. `mse` selects the branch; the caller
/// owns the reconnect-and-fall-back policy since a failed attempt burns
/// the socket.
pub async fn establish_outgoing<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    info_hash: Id20,
    our_id: Id20,
    mse: bool,
    config: &RuntimeConfig,
) -> Result<Established<S>, DisconnectReason> {
    let mut wire = Wire::new(stream);
    let our_handshake = Handshake::new(info_hash, our_id);
    let mut serialized = Vec::with_capacity(HANDSHAKE_LEN);
    our_handshake.serialize(&mut serialized);

    if !mse {
        wire.send(&serialized).await?;
        wire.fill_to(HANDSHAKE_LEN).await?;
        let (remote, len) = Handshake::deserialize(wire.window()).map_err(wire_err)?;
        wire.consume(len);
        if remote.info_hash != info_hash {
            return Err(DisconnectReason::InvalidInfoHash);
        }
        let leftover = wire.rest();
        return Ok(Established {
            stream: wire.stream,
            remote,
            read_cipher: plain_cipher(),
            write_cipher: plain_cipher(),
            leftover,
        });
    }

    // --- MSE initiator ---
    let (keys, pad) = {
        let mut rng = rand::rng();
        (DhKeyPair::generate(&mut rng), mse::generate_pad(&mut rng))
    };
    let mut opening = keys.public_key().to_vec();
    opening.extend_from_slice(&pad);
    wire.send(&opening).await?;

    wire.fill_to(DH_KEY_LEN).await?;
    let their_pub = wire.take(DH_KEY_LEN);
    let secret = keys.shared_secret(&their_pub);

    let mut enc = Rc4::new_mse(&mse::stream_key(KeyDirection::AtoB, &secret, &info_hash));

    let provide = config.allowed_enc_level.provide_mask();
    let mut msg = Vec::new();
    msg.extend_from_slice(&mse::req1_hash(&secret));
    msg.extend_from_slice(&mse::obfuscated_skey_hash(&info_hash, &secret));
    let mut tail = Vec::new();
    tail.extend_from_slice(&VC);
    tail.extend_from_slice(&provide.to_be_bytes());
    tail.extend_from_slice(&0u16.to_be_bytes()); // no pad C
    tail.extend_from_slice(&(serialized.len() as u16).to_be_bytes());
    tail.extend_from_slice(&serialized); // IA: the BT1 handshake
    enc.process(&mut tail);
    msg.extend_from_slice(&tail);
    wire.send(&msg).await?;

    // The responder's reply starts with ENCRYPT(VC) at an unknown pad
    // offset; the only alignment is scanning for that fixed pattern.
    let mut expected_vc = VC;
    Rc4::new_mse(&mse::stream_key(KeyDirection::BtoA, &secret, &info_hash))
        .process(&mut expected_vc);
    let offset = loop {
        if let Some(off) = mse::scan_for_pattern(wire.window(), &expected_vc) {
            break off;
        }
        if wire.available() >= MAX_PAD_LEN + VC.len() {
            return Err(DisconnectReason::SyncHashNotFound);
        }
        wire.read_any().await?;
    };
    wire.consume(offset);

    let mut dec = Rc4::new_mse(&mse::stream_key(KeyDirection::BtoA, &secret, &info_hash));
    wire.fill_to(8 + 4 + 2).await?;
    let mut head = wire.take(14);
    dec.process(&mut head);
    debug_assert_eq!(&head[..8], &VC[..]);
    let select = BE::read_u32(&head[8..12]);
    let pad_len = BE::read_u16(&head[12..14]) as usize;
    if pad_len > MAX_PAD_LEN {
        return Err(DisconnectReason::Handshake("oversize pad in crypto reply"));
    }
    wire.fill_to(pad_len).await?;
    let mut pad_d = wire.take(pad_len);
    dec.process(&mut pad_d);

    if select.count_ones() != 1 || select & provide == 0 {
        return Err(DisconnectReason::InvalidCryptoSelect(select));
    }
    trace!(select, "MSE negotiated (initiator)");

    let (mut read_cipher, write_cipher): (Box<dyn StreamCipher>, Box<dyn StreamCipher>) =
        if select == mse::CRYPTO_RC4 {
            (Box::new(dec), Box::new(enc))
        } else {
            (plain_cipher(), plain_cipher())
        };

    // The peer's BT1 handshake follows under the selected cipher.
    let mut leftover = wire.rest();
    read_cipher.process(&mut leftover);
    while leftover.len() < HANDSHAKE_LEN {
        wire.read_any().await?;
        let mut fresh = wire.rest();
        read_cipher.process(&mut fresh);
        leftover.extend_from_slice(&fresh);
    }
    let (remote, len) = Handshake::deserialize(&leftover).map_err(wire_err)?;
    leftover.drain(..len);
    if remote.info_hash != info_hash {
        return Err(DisconnectReason::InvalidInfoHash);
    }

    Ok(Established {
        stream: wire.stream,
        remote,
        read_cipher,
        write_cipher,
        leftover,
    })
}

/// Accept a connection: sniff plain BT1 vs MSE, honor the inbound policy,
/// resolve the torrent and finish the handshake. Returns the resolved
/// info-hash alongside the established transport.
pub async fn establish_incoming<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    lookup: &dyn TorrentLookup,
    our_id: Id20,
    config: &RuntimeConfig,
) -> Result<(Id20, Established<S>), DisconnectReason> {
    let mut wire = Wire::new(stream);
    wire.fill_to(20).await?;
    let head = wire.window();
    let looks_plain = head[0] == 19 && &head[1..20] == PSTR_BT1.as_bytes();

    if looks_plain {
        if config.in_enc_policy == EncPolicy::Forced {
            return Err(DisconnectReason::EncryptionRequired);
        }
        wire.fill_to(HANDSHAKE_LEN).await?;
        let (remote, len) = Handshake::deserialize(wire.window()).map_err(wire_err)?;
        wire.consume(len);
        if !lookup.knows_info_hash(&remote.info_hash) {
            return Err(DisconnectReason::InvalidInfoHash);
        }
        let mut reply = Vec::with_capacity(HANDSHAKE_LEN);
        Handshake::new(remote.info_hash, our_id).serialize(&mut reply);
        wire.send(&reply).await?;
        let leftover = wire.rest();
        return Ok((
            remote.info_hash,
            Established {
                stream: wire.stream,
                remote,
                read_cipher: plain_cipher(),
                write_cipher: plain_cipher(),
                leftover,
            },
        ));
    }

    if config.in_enc_policy == EncPolicy::Disabled {
        return Err(DisconnectReason::EncryptedDisabled);
    }

    // --- MSE responder ---
    wire.fill_to(DH_KEY_LEN).await?;
    let their_pub = wire.take(DH_KEY_LEN);
    let (keys, pad) = {
        let mut rng = rand::rng();
        (DhKeyPair::generate(&mut rng), mse::generate_pad(&mut rng))
    };
    let mut opening = keys.public_key().to_vec();
    opening.extend_from_slice(&pad);
    wire.send(&opening).await?;
    let secret = keys.shared_secret(&their_pub);

    // Align on HASH('req1', S).
    let pattern = mse::req1_hash(&secret);
    let offset = loop {
        if let Some(off) = mse::scan_for_pattern(wire.window(), &pattern) {
            break off;
        }
        if wire.available() >= SYNC_SCAN_LIMIT {
            return Err(DisconnectReason::SyncHashNotFound);
        }
        wire.read_any().await?;
    };
    wire.consume(offset + pattern.len());

    wire.fill_to(20).await?;
    let obfuscated: [u8; 20] = wire.take(20).try_into().unwrap();
    let req2 = mse::recover_req2_hash(&obfuscated, &secret);
    let info_hash = lookup
        .find_by_req2(&req2)
        .ok_or(DisconnectReason::InvalidInfoHash)?;

    let mut dec = Rc4::new_mse(&mse::stream_key(KeyDirection::AtoB, &secret, &info_hash));
    let mut enc = Rc4::new_mse(&mse::stream_key(KeyDirection::BtoA, &secret, &info_hash));

    wire.fill_to(8 + 4 + 2).await?;
    let mut head = wire.take(14);
    dec.process(&mut head);
    if head[..8] != VC {
        return Err(DisconnectReason::Handshake("verification constant mismatch"));
    }
    let provide = BE::read_u32(&head[8..12]);
    let pad_len = BE::read_u16(&head[12..14]) as usize;
    if pad_len > MAX_PAD_LEN {
        return Err(DisconnectReason::Handshake("oversize pad in crypto offer"));
    }
    wire.fill_to(pad_len).await?;
    let mut pad_c = wire.take(pad_len);
    dec.process(&mut pad_c);

    wire.fill_to(2).await?;
    let mut ia_len_raw = wire.take(2);
    dec.process(&mut ia_len_raw);
    let ia_len = BE::read_u16(&ia_len_raw) as usize;

    let select = mse::select_crypto(provide, config.allowed_enc_level, config.prefer_rc4)
        .ok_or(DisconnectReason::InvalidCryptoSelect(provide))?;
    trace!(provide, select, "MSE negotiated (responder)");

    let mut reply = Vec::new();
    reply.extend_from_slice(&VC);
    reply.extend_from_slice(&select.to_be_bytes());
    reply.extend_from_slice(&0u16.to_be_bytes());
    enc.process(&mut reply);
    wire.send(&reply).await?;

    // IA (sent before our reply) is always under RC4; everything after it
    // uses the selected cipher.
    wire.fill_to(ia_len).await?;
    let mut ia = wire.take(ia_len);
    dec.process(&mut ia);

    let (mut read_cipher, write_cipher): (Box<dyn StreamCipher>, Box<dyn StreamCipher>) =
        if select == mse::CRYPTO_RC4 {
            (Box::new(dec), Box::new(enc))
        } else {
            (plain_cipher(), plain_cipher())
        };

    let mut leftover = ia;
    {
        let mut trailing = wire.rest();
        read_cipher.process(&mut trailing);
        leftover.extend_from_slice(&trailing);
    }
    while leftover.len() < HANDSHAKE_LEN {
        wire.read_any().await?;
        let mut fresh = wire.rest();
        read_cipher.process(&mut fresh);
        leftover.extend_from_slice(&fresh);
    }
    let (remote, len) = Handshake::deserialize(&leftover).map_err(wire_err)?;
    leftover.drain(..len);
    if remote.info_hash != info_hash {
        return Err(DisconnectReason::InvalidInfoHash);
    }

    let mut reply = Vec::with_capacity(HANDSHAKE_LEN);
    Handshake::new(info_hash, our_id).serialize(&mut reply);
    let mut reply_enc = reply;
    // Our handshake goes out under the selected cipher too.
    let mut write_cipher = write_cipher;
    write_cipher.process(&mut reply_enc);
    wire.send(&reply_enc).await?;

    Ok((
        info_hash,
        Established {
            stream: wire.stream,
            remote,
            read_cipher,
            write_cipher,
            leftover,
        },
    ))
}

fn wire_err(e: WireError) -> DisconnectReason {
    DisconnectReason::from(e)
}
