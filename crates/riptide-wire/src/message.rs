use byteorder::{BE, ByteOrder};
use riptide_core::Id20;

const INTEGER_LEN: usize = 4;
const MSGID_LEN: usize = 1;
const PREAMBLE_LEN: usize = INTEGER_LEN + MSGID_LEN;

/// One message may not exceed this many payload bytes.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;
/// An incoming `request` may not ask for more than this.
pub const MAX_REQUEST_LEN: u32 = 16 * 1024;

pub const PSTR_BT1: &str = "BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// Header of a `piece` message: everything except the payload. The payload
/// is streamed by the connection, so the codec exposes the header alone.
pub const PIECE_HEADER_LEN: usize = PREAMBLE_LEN + INTEGER_LEN * 2;

type MsgId = u8;

const MSGID_CHOKE: MsgId = 0;
const MSGID_UNCHOKE: MsgId = 1;
const MSGID_INTERESTED: MsgId = 2;
const MSGID_NOT_INTERESTED: MsgId = 3;
const MSGID_HAVE: MsgId = 4;
const MSGID_BITFIELD: MsgId = 5;
const MSGID_REQUEST: MsgId = 6;
const MSGID_PIECE: MsgId = 7;
const MSGID_CANCEL: MsgId = 8;
const MSGID_DHT_PORT: MsgId = 9;
const MSGID_EXTENDED: MsgId = 20;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("not enough data: need {0} more bytes")]
    NotEnoughData(usize),
    #[error("message of {0} bytes exceeds the 1 MiB frame cap")]
    OversizeMessage(u32),
    #[error("unknown message id {0}")]
    InvalidMessageId(u8),
    #[error("message id {id} with invalid body length {len}")]
    InvalidMessageSize { id: u8, len: u32 },
    #[error("bitfield of {got} bytes, expected {expected}")]
    InvalidBitfieldSize { got: usize, expected: usize },
    #[error("handshake protocol length byte is {0}, expected 19")]
    BadProtocolLength(u8),
    #[error("handshake protocol tag mismatch")]
    BadProtocolTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl Request {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceHeader {
    pub index: u32,
    pub begin: u32,
    pub payload_len: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Message<'a> {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(&'a [u8]),
    Request(Request),
    Piece {
        index: u32,
        begin: u32,
        data: &'a [u8],
    },
    Cancel(Request),
    DhtPort(u16),
    Extended {
        ext_id: u8,
        payload: &'a [u8],
    },
}

impl<'a> Message<'a> {
    /// Append the framed message to `out`. Returns the serialized length.
    pub fn serialize(&self, out: &mut Vec<u8>) -> usize {
        fn preamble_into(out: &mut Vec<u8>, body_len: u32, id: MsgId) {
            out.extend_from_slice(&(body_len + 1).to_be_bytes());
            out.push(id);
        }
        let start = out.len();
        macro_rules! preamble {
            ($body_len:expr, $id:expr) => {
                preamble_into(out, $body_len, $id)
            };
        }
        match self {
            Message::KeepAlive => {
                out.extend_from_slice(&0u32.to_be_bytes());
            }
            Message::Choke => preamble!(0, MSGID_CHOKE),
            Message::Unchoke => preamble!(0, MSGID_UNCHOKE),
            Message::Interested => preamble!(0, MSGID_INTERESTED),
            Message::NotInterested => preamble!(0, MSGID_NOT_INTERESTED),
            Message::Have(index) => {
                preamble!(4, MSGID_HAVE);
                out.extend_from_slice(&index.to_be_bytes());
            }
            Message::Bitfield(bits) => {
                preamble!(bits.len() as u32, MSGID_BITFIELD);
                out.extend_from_slice(bits);
            }
            Message::Request(r) | Message::Cancel(r) => {
                let id = if matches!(self, Message::Request(..)) {
                    MSGID_REQUEST
                } else {
                    MSGID_CANCEL
                };
                preamble!(12, id);
                out.extend_from_slice(&r.index.to_be_bytes());
                out.extend_from_slice(&r.begin.to_be_bytes());
                out.extend_from_slice(&r.length.to_be_bytes());
            }
            Message::Piece { index, begin, data } => {
                preamble!(8 + data.len() as u32, MSGID_PIECE);
                out.extend_from_slice(&index.to_be_bytes());
                out.extend_from_slice(&begin.to_be_bytes());
                out.extend_from_slice(data);
            }
            Message::DhtPort(port) => {
                preamble!(2, MSGID_DHT_PORT);
                out.extend_from_slice(&port.to_be_bytes());
            }
            Message::Extended { ext_id, payload } => {
                preamble!(1 + payload.len() as u32, MSGID_EXTENDED);
                out.push(*ext_id);
                out.extend_from_slice(payload);
            }
        }
        out.len() - start
    }

    /// Parse one message from the front of `buf`. Returns the message and
    /// the number of bytes consumed.
    pub fn deserialize(buf: &'a [u8]) -> Result<(Message<'a>, usize), WireError> {
        if buf.len() < INTEGER_LEN {
            return Err(WireError::NotEnoughData(INTEGER_LEN - buf.len()));
        }
        let len_prefix = BE::read_u32(&buf[..4]);
        if len_prefix == 0 {
            return Ok((Message::KeepAlive, INTEGER_LEN));
        }
        if len_prefix > MAX_FRAME_LEN {
            return Err(WireError::OversizeMessage(len_prefix));
        }
        let total_len = INTEGER_LEN + len_prefix as usize;
        if buf.len() < total_len {
            return Err(WireError::NotEnoughData(total_len - buf.len()));
        }
        let msg_id = buf[4];
        let body = &buf[PREAMBLE_LEN..total_len];
        let body_len = len_prefix - 1;

        let check_len = |expected: u32| {
            if body_len != expected {
                Err(WireError::InvalidMessageSize {
                    id: msg_id,
                    len: body_len,
                })
            } else {
                Ok(())
            }
        };

        let msg = match msg_id {
            MSGID_CHOKE => {
                check_len(0)?;
                Message::Choke
            }
            MSGID_UNCHOKE => {
                check_len(0)?;
                Message::Unchoke
            }
            MSGID_INTERESTED => {
                check_len(0)?;
                Message::Interested
            }
            MSGID_NOT_INTERESTED => {
                check_len(0)?;
                Message::NotInterested
            }
            MSGID_HAVE => {
                check_len(4)?;
                Message::Have(BE::read_u32(body))
            }
            MSGID_BITFIELD => {
                if body.is_empty() {
                    return Err(WireError::InvalidMessageSize {
                        id: msg_id,
                        len: body_len,
                    });
                }
                Message::Bitfield(body)
            }
            MSGID_REQUEST | MSGID_CANCEL => {
                check_len(12)?;
                let r = Request {
                    index: BE::read_u32(&body[0..4]),
                    begin: BE::read_u32(&body[4..8]),
                    length: BE::read_u32(&body[8..12]),
                };
                if msg_id == MSGID_REQUEST {
                    Message::Request(r)
                } else {
                    Message::Cancel(r)
                }
            }
            MSGID_PIECE => {
                if body_len < 9 {
                    return Err(WireError::InvalidMessageSize {
                        id: msg_id,
                        len: body_len,
                    });
                }
                Message::Piece {
                    index: BE::read_u32(&body[0..4]),
                    begin: BE::read_u32(&body[4..8]),
                    data: &body[8..],
                }
            }
            MSGID_DHT_PORT => {
                check_len(2)?;
                Message::DhtPort(BE::read_u16(body))
            }
            MSGID_EXTENDED => {
                if body.is_empty() {
                    return Err(WireError::InvalidMessageSize {
                        id: msg_id,
                        len: body_len,
                    });
                }
                Message::Extended {
                    ext_id: body[0],
                    payload: &body[1..],
                }
            }
            other => return Err(WireError::InvalidMessageId(other)),
        };
        Ok((msg, total_len))
    }

    /// Peek the header of a `piece` message without requiring the payload.
    /// Returns None if the frame at the front of `buf` is not a piece, or
    /// if fewer than [`PIECE_HEADER_LEN`] bytes are buffered.
    pub fn peek_piece_header(buf: &[u8]) -> Option<PieceHeader> {
        if buf.len() < PIECE_HEADER_LEN {
            return None;
        }
        let len_prefix = BE::read_u32(&buf[..4]);
        if buf[4] != MSGID_PIECE || len_prefix < 10 || len_prefix > MAX_FRAME_LEN {
            return None;
        }
        Some(PieceHeader {
            index: BE::read_u32(&buf[5..9]),
            begin: BE::read_u32(&buf[9..13]),
            payload_len: len_prefix - 9,
        })
    }
}

/// Write the 13-byte preamble of a `piece` message whose payload will be
/// appended (or sent) separately.
pub fn serialize_piece_header(index: u32, begin: u32, payload_len: u32, out: &mut Vec<u8>) {
    out.extend_from_slice(&(9 + payload_len).to_be_bytes());
    out.push(MSGID_PIECE);
    out.extend_from_slice(&index.to_be_bytes());
    out.extend_from_slice(&begin.to_be_bytes());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: u64,
    pub info_hash: Id20,
    pub peer_id: Id20,
}

impl Handshake {
    pub fn new(info_hash: Id20, peer_id: Id20) -> Handshake {
        let mut reserved: u64 = 0;
        // extended messaging (BEP-10): reserved bit 43 = byte 5, mask 0x10
        reserved |= 1 << 20;
        Handshake {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extended(&self) -> bool {
        self.reserved.to_be_bytes()[5] & 0x10 > 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved.to_be_bytes()[7] & 0x01 > 0
    }

    pub fn with_dht(mut self) -> Self {
        self.reserved |= 1;
        self
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(19);
        out.extend_from_slice(PSTR_BT1.as_bytes());
        out.extend_from_slice(&self.reserved.to_be_bytes());
        out.extend_from_slice(&self.info_hash.0);
        out.extend_from_slice(&self.peer_id.0);
    }

    pub fn deserialize(b: &[u8]) -> Result<(Handshake, usize), WireError> {
        if b.len() < HANDSHAKE_LEN {
            return Err(WireError::NotEnoughData(HANDSHAKE_LEN - b.len()));
        }
        if b[0] != 19 {
            return Err(WireError::BadProtocolLength(b[0]));
        }
        if &b[1..20] != PSTR_BT1.as_bytes() {
            return Err(WireError::BadProtocolTag);
        }
        Ok((
            Handshake {
                reserved: BE::read_u64(&b[20..28]),
                info_hash: Id20::new(b[28..48].try_into().unwrap()),
                peer_id: Id20::new(b[48..68].try_into().unwrap()),
            },
            HANDSHAKE_LEN,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message<'_>) {
        let mut buf = Vec::new();
        let len = msg.serialize(&mut buf);
        assert_eq!(len, buf.len());
        let (parsed, consumed) = Message::deserialize(&buf).unwrap();
        assert_eq!(consumed, len);
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_roundtrip_all() {
        roundtrip(Message::KeepAlive);
        roundtrip(Message::Choke);
        roundtrip(Message::Unchoke);
        roundtrip(Message::Interested);
        roundtrip(Message::NotInterested);
        roundtrip(Message::Have(42));
        roundtrip(Message::Bitfield(&[0b10101010, 0b11000000]));
        roundtrip(Message::Request(Request::new(1, 16384, 16384)));
        roundtrip(Message::Cancel(Request::new(1, 16384, 16384)));
        roundtrip(Message::Piece {
            index: 3,
            begin: 32768,
            data: b"payload",
        });
        roundtrip(Message::DhtPort(6881));
        roundtrip(Message::Extended {
            ext_id: 0,
            payload: b"d1:md6:ut_pexi1eee",
        });
    }

    #[test]
    fn test_partial_input() {
        let mut buf = Vec::new();
        Message::Have(7).serialize(&mut buf);
        for cut in 0..buf.len() {
            match Message::deserialize(&buf[..cut]) {
                Err(WireError::NotEnoughData(n)) => {
                    assert!(n > 0 && cut + n <= buf.len());
                }
                other => panic!("cut={cut}: expected NotEnoughData, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_oversize_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        buf.push(MSGID_BITFIELD);
        assert_eq!(
            Message::deserialize(&buf),
            Err(WireError::OversizeMessage(MAX_FRAME_LEN + 1))
        );
    }

    #[test]
    fn test_unknown_id_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.push(14);
        assert_eq!(Message::deserialize(&buf), Err(WireError::InvalidMessageId(14)));
    }

    #[test]
    fn test_bad_sizes_rejected() {
        // choke with a body
        let mut buf = Vec::new();
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.push(MSGID_CHOKE);
        buf.extend_from_slice(&[0, 0]);
        assert!(matches!(
            Message::deserialize(&buf),
            Err(WireError::InvalidMessageSize { id: 0, len: 2 })
        ));
    }

    #[test]
    fn test_piece_header_peek() {
        let mut buf = Vec::new();
        serialize_piece_header(5, 16384, 16384, &mut buf);
        let h = Message::peek_piece_header(&buf).unwrap();
        assert_eq!(h.index, 5);
        assert_eq!(h.begin, 16384);
        assert_eq!(h.payload_len, 16384);
        // Not a piece frame:
        let mut other = Vec::new();
        Message::Have(5).serialize(&mut other);
        other.extend_from_slice(&[0u8; 16]);
        assert!(Message::peek_piece_header(&other).is_none());
    }

    #[test]
    fn test_handshake_roundtrip() {
        let hs = Handshake::new(Id20::new([1; 20]), Id20::new([2; 20])).with_dht();
        let mut buf = Vec::new();
        hs.serialize(&mut buf);
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        assert_eq!(buf[0], 0x13);
        let (parsed, len) = Handshake::deserialize(&buf).unwrap();
        assert_eq!(len, HANDSHAKE_LEN);
        assert_eq!(parsed, hs);
        assert!(parsed.supports_extended());
        assert!(parsed.supports_dht());
    }

    #[test]
    fn test_handshake_rejects_garbage() {
        let mut buf = vec![0u8; HANDSHAKE_LEN];
        buf[0] = 19;
        assert_eq!(Handshake::deserialize(&buf), Err(WireError::BadProtocolTag));
        buf[0] = 18;
        assert_eq!(
            Handshake::deserialize(&buf),
            Err(WireError::BadProtocolLength(18))
        );
    }
}
