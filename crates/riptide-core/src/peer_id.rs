use crate::hash_id::Id20;

pub fn generate_peer_id() -> Id20 {
    let mut peer_id = [0u8; 20];
    let u = uuid::Uuid::new_v4();
    peer_id[4..20].copy_from_slice(u.as_bytes());
    peer_id[..8].copy_from_slice(b"-RP0010-");
    Id20::new(peer_id)
}

/// Azureus-style client tag decoded from a peer id, e.g. `-lt0D60-`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTag {
    pub kind: [u8; 2],
    pub version: [u8; 4],
}

pub fn decode_client_tag(p: &Id20) -> Option<ClientTag> {
    let p = p.0;
    if p[0] != b'-' || p[7] != b'-' {
        return None;
    }
    Some(ClientTag {
        kind: [p[1], p[2]],
        version: [p[3], p[4], p[5], p[6]],
    })
}

/// Clients known to misbehave with deep request queues. Their outstanding
/// window is clamped by the peer connection.
pub fn has_slow_request_window(p: &Id20) -> bool {
    matches!(decode_client_tag(p), Some(t) if &t.kind == b"BC" || &t.kind == b"XL")
}
