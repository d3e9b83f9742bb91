use riptide_wire::WireError;

use crate::type_aliases::PeerHandle;

/// The operation a storage error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Stat,
    Mkdir,
    Open,
    Fallocate,
    Read,
    Write,
    Rename,
    Remove,
    Copy,
    CheckResume,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageErrorKind {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("two storages want the same file and at least one writes")]
    FileCollision,
    #[error("resume data has no 'file sizes' entry")]
    MissingFileSizes,
    #[error("file size does not match resume data")]
    MismatchingFileSize,
    #[error("file timestamp outside the resume-data window")]
    MismatchingFileTimestamp,
    #[error("resume data has neither 'slots' nor 'pieces'")]
    MissingPieces,
    #[error("resume data file count does not match the torrent")]
    MismatchingNumberOfFiles,
    #[error("resume data has an empty file list")]
    NoFilesInResumeData,
    #[error("'blocks per piece' does not match the torrent")]
    InvalidBlocksPerPiece,
    #[error("resume data is not a bencoded dictionary")]
    NotADictionary,
    #[error("storage is disabled")]
    StorageDisabled,
    #[error("block cache exhausted")]
    OutOfMemory,
    #[error("operation aborted")]
    Aborted,
}

/// Every fallible storage/disk operation reports which operation failed on
/// which file. `file` is None for operations that span the whole storage.
#[derive(Debug, thiserror::Error)]
#[error("storage {op:?} failed{}: {kind}", .file.map(|f| format!(" (file {f})")).unwrap_or_default())]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub op: StorageOp,
    pub file: Option<usize>,
}

impl StorageError {
    pub fn new(op: StorageOp, file: Option<usize>, kind: StorageErrorKind) -> Self {
        Self { kind, op, file }
    }

    pub fn io(op: StorageOp, file: Option<usize>, err: std::io::Error) -> Self {
        Self::new(op, file, StorageErrorKind::Io(err))
    }

    /// A structural copy for fan-out (io::Error does not implement Clone).
    pub fn duplicate(&self) -> StorageError {
        use StorageErrorKind::*;
        let kind = match &self.kind {
            Io(e) => Io(std::io::Error::new(e.kind(), e.to_string())),
            FileCollision => FileCollision,
            MissingFileSizes => MissingFileSizes,
            MismatchingFileSize => MismatchingFileSize,
            MismatchingFileTimestamp => MismatchingFileTimestamp,
            MissingPieces => MissingPieces,
            MismatchingNumberOfFiles => MismatchingNumberOfFiles,
            NoFilesInResumeData => NoFilesInResumeData,
            InvalidBlocksPerPiece => InvalidBlocksPerPiece,
            NotADictionary => NotADictionary,
            StorageDisabled => StorageDisabled,
            OutOfMemory => OutOfMemory,
            Aborted => Aborted,
        };
        StorageError::new(self.op, self.file, kind)
    }

    /// Fatal errors put the torrent into an error state; transient ones are
    /// cleared and the job retried once.
    pub fn is_fatal(&self) -> bool {
        match &self.kind {
            StorageErrorKind::Io(e) => !matches!(e.kind(), std::io::ErrorKind::NotFound),
            StorageErrorKind::Aborted => false,
            _ => true,
        }
    }
}

/// Why a peer connection was closed. Protocol errors never fail the
/// torrent; they only cost us the peer.
#[derive(Debug, thiserror::Error)]
pub enum DisconnectReason {
    #[error("info-hash does not match any attached torrent")]
    InvalidInfoHash,
    #[error("duplicate connection from the same peer id")]
    DuplicatePeerId,
    #[error("connected to ourselves")]
    SelfConnection,
    #[error("oversize message ({0} bytes)")]
    OversizeMessage(u32),
    #[error("unknown message id {0}")]
    InvalidMessageId(u8),
    #[error("message with invalid size")]
    InvalidMessageSize,
    #[error("bitfield has the wrong size")]
    InvalidBitfieldSize,
    #[error("bitfield arrived after another message")]
    BitfieldAfterHave,
    #[error("encrypted connection attempted but encryption is disabled")]
    EncryptedDisabled,
    #[error("plaintext connection attempted but encryption is required")]
    EncryptionRequired,
    #[error("MSE sync pattern not found within the scan window")]
    SyncHashNotFound,
    #[error("responder selected crypto method {0:#x} we did not offer")]
    InvalidCryptoSelect(u32),
    #[error("peer is banned")]
    PeerBanned,
    #[error("request is invalid or oversized")]
    InvalidRequest,
    #[error("peer closed the connection")]
    ClosedByPeer,
    #[error("connection timed out")]
    TimedOut,
    #[error("operation aborted")]
    OperationAborted,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(&'static str),
}

impl From<WireError> for DisconnectReason {
    fn from(e: WireError) -> Self {
        match e {
            WireError::OversizeMessage(len) => DisconnectReason::OversizeMessage(len),
            WireError::InvalidMessageId(id) => DisconnectReason::InvalidMessageId(id),
            WireError::InvalidMessageSize { .. } => DisconnectReason::InvalidMessageSize,
            WireError::InvalidBitfieldSize { .. } => DisconnectReason::InvalidBitfieldSize,
            WireError::BadProtocolLength(_) | WireError::BadProtocolTag => {
                DisconnectReason::Handshake("bad protocol identifier")
            }
            // NotEnoughData never escapes the read loop.
            WireError::NotEnoughData(_) => DisconnectReason::ClosedByPeer,
        }
    }
}

/// A disconnect bundled with who it happened to, for alerts.
#[derive(Debug)]
pub struct PeerError {
    pub peer: PeerHandle,
    pub reason: DisconnectReason,
}
