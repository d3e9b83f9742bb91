use std::str::FromStr;

/// A 20-byte identifier: info-hashes, peer ids, SHA-1 digests.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Id20(pub [u8; 20]);

impl Id20 {
    pub fn new(from: [u8; 20]) -> Id20 {
        Id20(from)
    }

    pub fn from_bytes(b: &[u8]) -> anyhow::Result<Self> {
        if b.len() != 20 {
            anyhow::bail!("expected 20 bytes, got {}", b.len());
        }
        let mut v = [0u8; 20];
        v.copy_from_slice(b);
        Ok(Id20(v))
    }

    pub fn as_string(&self) -> String {
        hex::encode(self.0)
    }

    pub fn xor(&self, other: &Id20) -> Id20 {
        let mut out = [0u8; 20];
        for (o, (a, b)) in out.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *o = a ^ b;
        }
        Id20(out)
    }
}

impl std::fmt::Debug for Id20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Id20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl FromStr for Id20 {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            anyhow::bail!("expected a hex string of length 40");
        }
        let mut out = [0u8; 20];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Id20(out))
    }
}
