use std::sync::Arc;
use std::time::Duration;

use riptide_core::metainfo::Metainfo;
use riptide_sha1::sha1;

use super::*;
use crate::config::{EncPolicy, RuntimeConfig};

const PIECE_LEN: u32 = 32768;

fn make_torrent(total: u64, name: &str) -> (Vec<u8>, Arc<Metainfo>) {
    let data: Vec<u8> = (0..total).map(|i| (i * 17 % 253) as u8).collect();
    let mut pieces = Vec::new();
    for chunk in data.chunks(PIECE_LEN as usize) {
        pieces.extend_from_slice(&sha1(chunk));
    }
    let info = riptide_bencode::DictBuilder::new()
        .push_integer("length", total as i64)
        .push_str("name", name)
        .push_integer("piece length", PIECE_LEN as i64)
        .push_bytes("pieces", &pieces);
    let raw = riptide_bencode::DictBuilder::new()
        .push_dict("info", info)
        .finish();
    (data, Arc::new(Metainfo::parse(&raw).unwrap()))
}

fn fast_config() -> RuntimeConfig {
    RuntimeConfig {
        unchoke_interval: Duration::from_millis(200),
        disk_threads: 1,
        ..RuntimeConfig::default()
    }
}

async fn wait_for_seed(torrent: &Arc<crate::torrent::Torrent>, secs: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        if torrent.state.lock().picker.is_seed() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "transfer did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn transfer(seed_cfg: RuntimeConfig, leech_cfg: RuntimeConfig) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let seed_dir = tempfile::tempdir().unwrap();
    let leech_dir = tempfile::tempdir().unwrap();
    let (data, meta) = make_torrent(PIECE_LEN as u64 * 2 + 5000, "transfer.bin");
    std::fs::write(seed_dir.path().join("transfer.bin"), &data).unwrap();

    let seeder = Session::new(seed_cfg);
    let seed_torrent = seeder
        .add_torrent(meta.clone(), AddTorrentOptions::new(seed_dir.path()))
        .await
        .unwrap();
    {
        // The files are already complete; mark every piece owned the way
        // verified resume data would.
        let mut state = seed_torrent.state.lock();
        for piece in 0..meta.lengths.total_pieces() {
            state.picker.we_have(piece);
        }
    }
    let listen_addr = seeder
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let leecher = Session::new(leech_cfg);
    let leech_torrent = leecher
        .add_torrent(meta.clone(), AddTorrentOptions::new(leech_dir.path()))
        .await
        .unwrap();
    leecher.connect_peer(meta.info_hash, listen_addr);

    wait_for_seed(&leech_torrent, 30).await;

    let downloaded = std::fs::read(leech_dir.path().join("transfer.bin")).unwrap();
    assert_eq!(downloaded, data);

    seeder.shutdown();
    leecher.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transfer_plaintext() {
    transfer(fast_config(), fast_config()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transfer_mse_forced() {
    let cfg = RuntimeConfig {
        in_enc_policy: EncPolicy::Forced,
        out_enc_policy: EncPolicy::Forced,
        prefer_rc4: true,
        ..fast_config()
    };
    transfer(cfg.clone(), cfg).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_plain_falls_back_to_mse_when_seed_requires_it() {
    // The seeder only talks MSE; the leecher starts plain and retries.
    let seed_cfg = RuntimeConfig {
        in_enc_policy: EncPolicy::Forced,
        ..fast_config()
    };
    let leech_cfg = RuntimeConfig {
        out_enc_policy: EncPolicy::Enabled,
        ..fast_config()
    };
    transfer(seed_cfg, leech_cfg).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resume_data_roundtrip_through_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let (data, meta) = make_torrent(PIECE_LEN as u64 * 2, "resume.bin");
    std::fs::write(dir.path().join("resume.bin"), &data).unwrap();

    // First session: attach, mark complete, snapshot resume data.
    let first = Session::new(fast_config());
    let torrent = first
        .add_torrent(meta.clone(), AddTorrentOptions::new(dir.path()))
        .await
        .unwrap();
    let have = {
        let mut state = torrent.state.lock();
        for piece in 0..meta.lengths.total_pieces() {
            state.picker.we_have(piece);
        }
        state.picker.have_bitfield().clone()
    };
    let blob = torrent
        .disk
        .write_resume(torrent.storage_id, have)
        .await
        .unwrap()
        .unwrap();
    first.shutdown();

    // Second session: the blob authorizes the seed shortcut.
    let second = Session::new(fast_config());
    let torrent = second
        .add_torrent(
            meta.clone(),
            AddTorrentOptions {
                resume_data: Some(blob),
                ..AddTorrentOptions::new(dir.path())
            },
        )
        .await
        .unwrap();
    assert!(torrent.state.lock().picker.is_seed());
    second.shutdown();
}

#[tokio::test]
async fn test_add_duplicate_torrent_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (_, meta) = make_torrent(PIECE_LEN as u64, "dup.bin");
    let session = Session::new(fast_config());
    session
        .add_torrent(meta.clone(), AddTorrentOptions::new(dir.path()))
        .await
        .unwrap();
    assert!(session
        .add_torrent(meta, AddTorrentOptions::new(dir.path()))
        .await
        .is_err());
    session.shutdown();
}

#[tokio::test]
async fn test_remove_torrent_with_delete() {
    let dir = tempfile::tempdir().unwrap();
    let (data, meta) = make_torrent(PIECE_LEN as u64, "removed.bin");
    std::fs::write(dir.path().join("removed.bin"), &data).unwrap();
    let session = Session::new(fast_config());
    session
        .add_torrent(meta.clone(), AddTorrentOptions::new(dir.path()))
        .await
        .unwrap();
    session.remove_torrent(&meta.info_hash, true).await;
    assert!(session.find_torrent(&meta.info_hash).is_none());
    assert!(!dir.path().join("removed.bin").exists());
}
