//! Message Stream Encryption primitives: the Diffie-Hellman exchange, the
//! sync-hash scanning, key derivation and crypto negotiation. Driving the
//! handshake over a socket belongs to the peer connection; everything here
//! is pure and unit-testable.

use num_bigint::BigUint;
use rand::Rng;
use riptide_core::Id20;
use riptide_sha1::{Sha1, Sha1Engine};

/// Both DH public keys and the shared secret are exchanged as 96 bytes,
/// big-endian, left-padded with zeros.
pub const DH_KEY_LEN: usize = 96;

/// Verification constant: 8 zero bytes.
pub const VC: [u8; 8] = [0u8; 8];

pub const CRYPTO_PLAINTEXT: u32 = 0x01;
pub const CRYPTO_RC4: u32 = 0x02;

/// Random padding after the DH key is limited to this many bytes.
pub const MAX_PAD_LEN: usize = 512;

/// How far into the stream the sync pattern may start: the pad limit plus
/// the pattern length itself.
pub const SYNC_SCAN_LIMIT: usize = MAX_PAD_LEN + 20;

// The 768-bit MSE group prime, generator 2.
const DH_PRIME_BYTES: [u8; DH_KEY_LEN] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2, 0x21, 0x68, 0xC2,
    0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1, 0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67,
    0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6, 0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E,
    0x34, 0x04, 0xDD, 0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45, 0xE4, 0x85, 0xB5,
    0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9, 0xA6, 0x3A, 0x36, 0x21, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x09, 0x05, 0x63,
];

fn dh_prime() -> BigUint {
    BigUint::from_bytes_be(&DH_PRIME_BYTES)
}

fn to_96_bytes(n: &BigUint) -> [u8; DH_KEY_LEN] {
    let raw = n.to_bytes_be();
    let mut out = [0u8; DH_KEY_LEN];
    out[DH_KEY_LEN - raw.len()..].copy_from_slice(&raw);
    out
}

/// One side of the DH exchange.
pub struct DhKeyPair {
    private: BigUint,
    public: [u8; DH_KEY_LEN],
}

impl DhKeyPair {
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        // 160-bit exponent: plenty for a 768-bit group used for obfuscation.
        let mut secret = [0u8; 20];
        rng.fill(&mut secret[..]);
        let private = BigUint::from_bytes_be(&secret);
        let public = BigUint::from(2u32).modpow(&private, &dh_prime());
        DhKeyPair {
            private,
            public: to_96_bytes(&public),
        }
    }

    pub fn public_key(&self) -> &[u8; DH_KEY_LEN] {
        &self.public
    }

    pub fn shared_secret(&self, peer_public: &[u8]) -> [u8; DH_KEY_LEN] {
        let peer = BigUint::from_bytes_be(peer_public);
        to_96_bytes(&peer.modpow(&self.private, &dh_prime()))
    }
}

/// Random pad of 0..=512 bytes appended to the DH key on the wire.
pub fn generate_pad<R: Rng>(rng: &mut R) -> Vec<u8> {
    let len = rng.random_range(0..=MAX_PAD_LEN);
    let mut pad = vec![0u8; len];
    rng.fill(&mut pad[..]);
    pad
}

fn sha1_parts(parts: &[&[u8]]) -> [u8; 20] {
    let mut h = Sha1::new();
    for part in parts {
        h.update(part);
    }
    h.finish()
}

/// `HASH('req1', S)` — the pattern the responder scans for.
pub fn req1_hash(secret: &[u8; DH_KEY_LEN]) -> [u8; 20] {
    sha1_parts(&[b"req1", secret])
}

/// `HASH('req2', SKEY) xor HASH('req3', S)` — identifies the torrent
/// without revealing the info-hash to a passive observer.
pub fn obfuscated_skey_hash(info_hash: &Id20, secret: &[u8; DH_KEY_LEN]) -> [u8; 20] {
    let req2 = sha1_parts(&[b"req2", &info_hash.0]);
    let req3 = sha1_parts(&[b"req3", secret]);
    let mut out = [0u8; 20];
    for (o, (a, b)) in out.iter_mut().zip(req2.iter().zip(req3.iter())) {
        *o = a ^ b;
    }
    out
}

/// Given our observed `HASH('req3', S)`, recover `HASH('req2', SKEY)` from
/// the obfuscated pattern so the torrent can be looked up by that key.
pub fn recover_req2_hash(obfuscated: &[u8; 20], secret: &[u8; DH_KEY_LEN]) -> [u8; 20] {
    let req3 = sha1_parts(&[b"req3", secret]);
    let mut out = [0u8; 20];
    for (o, (a, b)) in out.iter_mut().zip(obfuscated.iter().zip(req3.iter())) {
        *o = a ^ b;
    }
    out
}

/// `HASH('req2', SKEY)` for one attached torrent, precomputed on the
/// responder side for lookup.
pub fn req2_hash(info_hash: &Id20) -> [u8; 20] {
    sha1_parts(&[b"req2", &info_hash.0])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    /// `HASH('keyA', S, SKEY)`: bytes the connection initiator sends.
    AtoB,
    /// `HASH('keyB', S, SKEY)`: bytes the responder sends.
    BtoA,
}

/// Per-direction RC4 key.
pub fn stream_key(
    direction: KeyDirection,
    secret: &[u8; DH_KEY_LEN],
    info_hash: &Id20,
) -> [u8; 20] {
    let prefix: &[u8] = match direction {
        KeyDirection::AtoB => b"keyA",
        KeyDirection::BtoA => b"keyB",
    };
    sha1_parts(&[prefix, secret, &info_hash.0])
}

/// Locate `pattern` in `haystack`, starting no deeper than the scan limit.
/// There is no framing during negotiation; the byte scan IS the alignment
/// mechanism. Returns the offset of the pattern start.
pub fn scan_for_pattern(haystack: &[u8], pattern: &[u8]) -> Option<usize> {
    let last_start = (MAX_PAD_LEN).min(haystack.len().checked_sub(pattern.len())?);
    (0..=last_start).find(|&start| &haystack[start..start + pattern.len()] == pattern)
}

/// Permitted cipher set, from configuration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CryptoLevel {
    Plaintext,
    Rc4,
    #[default]
    Both,
}

impl CryptoLevel {
    pub fn provide_mask(&self) -> u32 {
        match self {
            CryptoLevel::Plaintext => CRYPTO_PLAINTEXT,
            CryptoLevel::Rc4 => CRYPTO_RC4,
            CryptoLevel::Both => CRYPTO_PLAINTEXT | CRYPTO_RC4,
        }
    }

    pub fn allows(&self, selection: u32) -> bool {
        self.provide_mask() & selection != 0
    }
}

/// Responder-side choice from the initiator's `crypto_provide` bitmask.
/// Returns None when no overlap exists.
pub fn select_crypto(provide: u32, allowed: CryptoLevel, prefer_rc4: bool) -> Option<u32> {
    let overlap = provide & allowed.provide_mask();
    if overlap == 0 {
        return None;
    }
    if overlap & CRYPTO_RC4 != 0 && (prefer_rc4 || overlap & CRYPTO_PLAINTEXT == 0) {
        return Some(CRYPTO_RC4);
    }
    if overlap & CRYPTO_PLAINTEXT != 0 {
        return Some(CRYPTO_PLAINTEXT);
    }
    Some(CRYPTO_RC4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rng() -> impl Rng {
        use rand::SeedableRng;
        rand::rngs::StdRng::seed_from_u64(0x5eed)
    }

    #[test]
    fn test_dh_agreement() {
        let mut r = rng();
        let a = DhKeyPair::generate(&mut r);
        let b = DhKeyPair::generate(&mut r);
        let s_a = a.shared_secret(b.public_key());
        let s_b = b.shared_secret(a.public_key());
        assert_eq!(s_a, s_b);
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_obfuscated_skey_roundtrip() {
        let mut r = rng();
        let a = DhKeyPair::generate(&mut r);
        let b = DhKeyPair::generate(&mut r);
        let s = a.shared_secret(b.public_key());
        let info_hash = Id20::new([7; 20]);
        let obfuscated = obfuscated_skey_hash(&info_hash, &s);
        assert_eq!(recover_req2_hash(&obfuscated, &s), req2_hash(&info_hash));
    }

    #[test]
    fn test_stream_keys_differ_by_direction() {
        let s = [3u8; DH_KEY_LEN];
        let ih = Id20::new([9; 20]);
        assert_ne!(
            stream_key(KeyDirection::AtoB, &s, &ih),
            stream_key(KeyDirection::BtoA, &s, &ih)
        );
    }

    #[test]
    fn test_scan_alignment() {
        let mut r = rng();
        let s = [0x42u8; DH_KEY_LEN];
        let pattern = req1_hash(&s);
        // Invariant: for any pad k <= 512, the scan recovers the offset.
        for k in [0usize, 1, 17, 511, 512] {
            let mut stream = vec![0u8; k];
            r.fill(&mut stream[..]);
            // Make sure random padding can't contain the pattern by accident
            // (statistically impossible, but the test should be deterministic):
            stream.extend_from_slice(&pattern);
            stream.extend_from_slice(b"tail bytes");
            assert_eq!(scan_for_pattern(&stream, &pattern), Some(k), "k={k}");
        }
        // Beyond the pad limit the pattern must not be found.
        let mut stream = vec![0u8; 513];
        stream.extend_from_slice(&pattern);
        assert_eq!(scan_for_pattern(&stream, &pattern), None);
    }

    #[test]
    fn test_select_crypto() {
        use CryptoLevel::*;
        // provide both, prefer rc4
        assert_eq!(select_crypto(0x03, Both, true), Some(CRYPTO_RC4));
        // provide both, no preference -> plaintext is cheaper
        assert_eq!(select_crypto(0x03, Both, false), Some(CRYPTO_PLAINTEXT));
        // rc4-only policy
        assert_eq!(select_crypto(0x03, Rc4, false), Some(CRYPTO_RC4));
        // no overlap
        assert_eq!(select_crypto(CRYPTO_PLAINTEXT, Rc4, false), None);
        assert_eq!(select_crypto(CRYPTO_RC4, Plaintext, true), None);
    }

    #[test]
    fn test_pad_bounds() {
        let mut r = rng();
        for _ in 0..32 {
            assert!(generate_pad(&mut r).len() <= MAX_PAD_LEN);
        }
    }
}
