// BitTorrent peer wire protocol: parsing, serialization, transport crypto.
//
// The frame codec knows nothing about encryption. MSE, when negotiated,
// produces a pair of stream ciphers that the connection applies to raw
// socket bytes below the codec.

pub mod crypto;
pub mod extended;
pub mod message;
pub mod mse;
mod rc4;

pub use crypto::{PlainText, StreamCipher};
pub use message::{Handshake, Message, PieceHeader, Request, WireError};
pub use rc4::Rc4;
