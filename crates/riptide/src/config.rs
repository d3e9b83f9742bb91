use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use riptide_wire::mse::CryptoLevel;

/// Whether to hint the OS to bypass its page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IoMode {
    #[default]
    EnableOsCache,
    DisableOsCache,
}

/// MSE policy for one connection direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EncPolicy {
    /// Never negotiate MSE; encrypted peers are turned away.
    Disabled,
    /// Accept both; prefer plaintext outgoing with MSE fallback.
    #[default]
    Enabled,
    /// Require MSE; plaintext peers are turned away.
    Forced,
}

/// Engine configuration. Immutable once published; `apply_settings` swaps
/// the whole snapshot and workers pick it up at their next loop boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Block cache capacity, in 16 KiB blocks.
    pub cache_size: usize,
    /// Read-ahead quantum in blocks when a cache miss goes to disk.
    pub read_cache_line_size: usize,
    pub coalesce_reads: bool,
    pub coalesce_writes: bool,
    pub disk_io_read_mode: IoMode,
    pub disk_io_write_mode: IoMode,
    /// Allow sorting queued reads by physical offset.
    pub allow_reordered_disk_operations: bool,
    pub lock_files: bool,
    pub no_atime_storage: bool,
    pub ignore_resume_timestamps: bool,
    pub no_recheck_incomplete_resume: bool,
    pub allow_multiple_connections_per_ip: bool,
    /// Obfuscate seed status by sending an incomplete bitfield followed by
    /// have messages for the withheld pieces.
    pub lazy_bitfields: bool,
    /// Cap on the number of requests a peer may keep queued with us.
    pub max_allowed_in_request_queue: usize,
    /// How many of our own requests we keep outstanding per peer.
    pub max_out_request_queue: usize,
    pub out_enc_policy: EncPolicy,
    pub in_enc_policy: EncPolicy,
    pub allowed_enc_level: CryptoLevel,
    pub prefer_rc4: bool,

    /// Open file handles kept across all torrents.
    pub file_pool_size: usize,
    pub disk_threads: usize,

    pub max_uploads: usize,
    #[serde(with = "secs")]
    pub unchoke_interval: Duration,
    #[serde(with = "secs")]
    pub request_timeout: Duration,
    #[serde(with = "secs")]
    pub peer_idle_timeout: Duration,
    #[serde(with = "secs")]
    pub keep_alive_interval: Duration,
    #[serde(with = "secs")]
    pub handshake_timeout: Duration,

    pub listen_port: u16,
    pub client_version: String,

    /// Upload/download gating in bytes per second; None = unlimited. The
    /// limiter itself lives outside the engine, these are its inputs.
    pub upload_rate_limit: Option<u64>,
    pub download_rate_limit: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache_size: 1024,
            read_cache_line_size: 32,
            coalesce_reads: true,
            coalesce_writes: true,
            disk_io_read_mode: IoMode::EnableOsCache,
            disk_io_write_mode: IoMode::EnableOsCache,
            allow_reordered_disk_operations: true,
            lock_files: false,
            no_atime_storage: true,
            ignore_resume_timestamps: false,
            no_recheck_incomplete_resume: false,
            allow_multiple_connections_per_ip: false,
            lazy_bitfields: true,
            max_allowed_in_request_queue: 250,
            max_out_request_queue: 200,
            out_enc_policy: EncPolicy::Enabled,
            in_enc_policy: EncPolicy::Enabled,
            allowed_enc_level: CryptoLevel::Both,
            prefer_rc4: false,
            file_pool_size: 40,
            disk_threads: 2,
            max_uploads: 4,
            unchoke_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            peer_idle_timeout: Duration::from_secs(120),
            keep_alive_interval: Duration::from_secs(100),
            handshake_timeout: Duration::from_secs(10),
            listen_port: 6881,
            client_version: concat!("riptide ", env!("CARGO_PKG_VERSION")).to_owned(),
            upload_rate_limit: None,
            download_rate_limit: None,
        }
    }
}

/// Copy-on-write handle shared by everything that reads settings.
pub struct ConfigHandle {
    inner: ArcSwap<RuntimeConfig>,
}

impl ConfigHandle {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            inner: ArcSwap::from_pointee(config),
        }
    }

    pub fn load(&self) -> Arc<RuntimeConfig> {
        self.inner.load_full()
    }

    pub fn store(&self, config: RuntimeConfig) {
        self.inner.store(Arc::new(config));
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
