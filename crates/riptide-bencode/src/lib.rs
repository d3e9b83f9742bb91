// Bencode parsing and serialization.
//
// The parser borrows from the input buffer. Dictionary values remember the
// byte range they were parsed from, which is how the info-hash gets computed
// over the exact `info` dict bytes.

mod value;
mod writer;

pub use value::{ParseError, Value, from_bytes};
pub use writer::{DictBuilder, ListBuilder, encode_value};
