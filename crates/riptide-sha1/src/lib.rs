// Wrapper around the SHA-1 implementation so it can be swapped without
// touching callers. Piece hashing dominates CPU time, so the backend choice
// matters; everything downstream goes through this trait.

pub trait Sha1Engine {
    fn new() -> Self;
    fn update(&mut self, buf: &[u8]);
    fn finish(self) -> [u8; 20];
}

pub type Sha1 = Sha1Rust;

pub struct Sha1Rust {
    inner: sha1::Sha1,
}

impl Sha1Engine for Sha1Rust {
    fn new() -> Self {
        Sha1Rust {
            inner: sha1::Sha1::default(),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        use sha1::Digest;
        sha1::Sha1::update(&mut self.inner, buf)
    }

    fn finish(self) -> [u8; 20] {
        use sha1::Digest;
        let mut output = [0u8; 20];
        sha1::Sha1::finalize_into(self.inner, (&mut output[..]).into());
        output
    }
}

/// One-shot convenience for small inputs.
pub fn sha1(buf: &[u8]) -> [u8; 20] {
    let mut h = Sha1::new();
    h.update(buf);
    h.finish()
}
