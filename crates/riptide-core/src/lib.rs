pub mod constants;
pub mod hash_id;
pub mod lengths;
pub mod metainfo;
pub mod peer_id;

pub use hash_id::Id20;
