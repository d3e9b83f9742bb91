//! BEP-10 extended-protocol handshake framing. Extension payloads beyond
//! the handshake dictionary are opaque to this crate.

use std::collections::BTreeMap;

use riptide_bencode::{DictBuilder, Value};

/// Extended message id 0 is always the handshake itself.
pub const EXTENDED_HANDSHAKE_ID: u8 = 0;

#[derive(Debug, thiserror::Error)]
pub enum ExtendedError {
    #[error("extended handshake is not valid bencode: {0}")]
    Bencode(#[from] riptide_bencode::ParseError),
    #[error("extended handshake is not a dictionary")]
    NotADictionary,
}

/// The bencoded dictionary carried by extended message id 0.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtendedHandshake {
    /// Extension name -> message id chosen by the sender. Id 0 disables.
    pub m: BTreeMap<String, u8>,
    /// The sender's listen port.
    pub p: Option<u16>,
    /// Client name and version, human readable.
    pub v: Option<String>,
    /// How we look from the sender's side of the connection.
    pub yourip: Option<Vec<u8>>,
    /// Maximum number of outstanding requests the sender is willing to
    /// queue from us.
    pub reqq: Option<u32>,
}

impl ExtendedHandshake {
    pub fn deserialize(payload: &[u8]) -> Result<Self, ExtendedError> {
        let root = riptide_bencode::from_bytes(payload)?;
        if root.as_dict().is_none() {
            return Err(ExtendedError::NotADictionary);
        }
        let mut out = ExtendedHandshake::default();
        if let Some(m) = root.get("m").and_then(Value::as_dict) {
            for (name, id) in m {
                if let (Ok(name), Some(id)) = (std::str::from_utf8(name), id.as_integer()) {
                    if (0..=255).contains(&id) {
                        out.m.insert(name.to_owned(), id as u8);
                    }
                }
            }
        }
        out.p = root
            .get("p")
            .and_then(Value::as_integer)
            .filter(|p| (1..=65535).contains(p))
            .map(|p| p as u16);
        out.v = root.get("v").and_then(Value::as_str).map(str::to_owned);
        out.yourip = root
            .get("yourip")
            .and_then(Value::as_bytes)
            .map(<[u8]>::to_vec);
        out.reqq = root
            .get("reqq")
            .and_then(Value::as_integer)
            .filter(|r| *r >= 0)
            .map(|r| (r as u64).min(u32::MAX as u64) as u32);
        Ok(out)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut m = DictBuilder::new();
        for (name, id) in &self.m {
            m = m.push_integer(name, *id as i64);
        }
        let mut d = DictBuilder::new().push_dict("m", m);
        if let Some(p) = self.p {
            d = d.push_integer("p", p as i64);
        }
        if let Some(reqq) = self.reqq {
            d = d.push_integer("reqq", reqq as i64);
        }
        if let Some(v) = &self.v {
            d = d.push_str("v", v);
        }
        if let Some(ip) = &self.yourip {
            d = d.push_bytes("yourip", ip);
        }
        d.finish()
    }

    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.m.get(name).copied().filter(|id| *id != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut hs = ExtendedHandshake {
            p: Some(6881),
            v: Some("riptide 0.1.0".to_owned()),
            reqq: Some(250),
            yourip: Some(vec![10, 0, 0, 1]),
            ..Default::default()
        };
        hs.m.insert("ut_pex".to_owned(), 1);
        hs.m.insert("ut_metadata".to_owned(), 3);

        let bytes = hs.serialize();
        let parsed = ExtendedHandshake::deserialize(&bytes).unwrap();
        assert_eq!(parsed, hs);
        assert_eq!(parsed.extension_id("ut_pex"), Some(1));
        assert_eq!(parsed.extension_id("missing"), None);
    }

    #[test]
    fn test_zero_id_disables() {
        let mut hs = ExtendedHandshake::default();
        hs.m.insert("ut_pex".to_owned(), 0);
        let parsed = ExtendedHandshake::deserialize(&hs.serialize()).unwrap();
        assert_eq!(parsed.extension_id("ut_pex"), None);
    }

    #[test]
    fn test_tolerates_unknown_keys() {
        let raw = b"d1:md6:ut_pexi2ee12:custom_fieldi7e1:pi6881ee";
        let parsed = ExtendedHandshake::deserialize(raw).unwrap();
        assert_eq!(parsed.p, Some(6881));
        assert_eq!(parsed.extension_id("ut_pex"), Some(2));
    }

    #[test]
    fn test_rejects_non_dict() {
        assert!(matches!(
            ExtendedHandshake::deserialize(b"le"),
            Err(ExtendedError::NotADictionary)
        ));
        assert!(matches!(
            ExtendedHandshake::deserialize(b"garbage"),
            Err(ExtendedError::Bencode(_))
        ));
    }
}
