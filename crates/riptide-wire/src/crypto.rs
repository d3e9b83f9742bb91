/// Transport obfuscation applied below the frame codec. One instance per
/// direction; the codec never sees ciphertext.
pub trait StreamCipher: Send {
    /// Transform `data` in place, advancing the keystream.
    fn process(&mut self, data: &mut [u8]);
}

/// The no-op cipher used for plaintext connections and for MSE sessions
/// that negotiated `crypto_select = plaintext`.
pub struct PlainText;

impl StreamCipher for PlainText {
    fn process(&mut self, _data: &mut [u8]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plaintext_is_identity() {
        let mut data = *b"hello";
        PlainText.process(&mut data);
        assert_eq!(&data, b"hello");
    }
}
