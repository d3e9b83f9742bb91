// The riptide engine: everything between a torrent descriptor plus a set of
// peer addresses, and verified bytes on disk.
//
// Layout mirrors the data flow: session owns torrents and the disk pool;
// peer tasks speak the wire protocol and post disk jobs; the disk workers
// own the block cache and the storage backends.

pub mod alerts;
pub mod config;
pub mod disk;
pub mod error;
pub mod peer;
pub mod picker;
pub mod session;
pub mod storage;
pub mod torrent;
mod type_aliases;

pub use config::RuntimeConfig;
pub use error::{DisconnectReason, StorageError, StorageErrorKind, StorageOp};
pub use riptide_core::metainfo::Metainfo;
pub use session::Session;
pub use type_aliases::{BF, PeerHandle, StorageId};
