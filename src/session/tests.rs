use super::*;
use crate::bencode::{encode, Value};
use crate::tracker::{AnnounceRequest, AnnounceResponse, ScrapeStats, TrackerError};
use sha1::{Digest, Sha1};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const PIECE_LEN: usize = 16_384;
const DATA_LEN: usize = 40_000;

fn payload() -> Vec<u8> {
    (0..DATA_LEN).map(|i| (i * 31 % 251) as u8).collect()
}

fn torrent(data: &[u8]) -> Metainfo {
    let pieces: Vec<u8> = data
        .chunks(PIECE_LEN)
        .flat_map(|piece| Sha1::digest(piece).to_vec())
        .collect();
    let value = Value::dict([
        ("announce", Value::string("http://tracker.example/announce")),
        (
            "info",
            Value::dict([
                ("name", Value::string("data.bin")),
                ("length", Value::Integer(data.len() as i64)),
                ("piece length", Value::Integer(PIECE_LEN as i64)),
                ("pieces", Value::from(&pieces[..])),
            ]),
        ),
    ]);
    Metainfo::from_bytes(&encode(&value)).unwrap()
}

fn config(dir: &Path) -> SessionConfig {
    SessionConfig {
        download_dir: dir.to_path_buf(),
        port_range: 0..=0,
        ..SessionConfig::default()
    }
}

/// Answers every announce with a fixed peer list and records the events.
#[derive(Default)]
struct FixedTracker {
    peers: Vec<Peer>,
    events: parking_lot::Mutex<Vec<TrackerEvent>>,
}

impl TrackerBackend for FixedTracker {
    fn announce<'a>(
        &'a self,
        _url: &'a str,
        request: &'a AnnounceRequest,
    ) -> BoxFuture<'a, Result<AnnounceResponse, TrackerError>> {
        Box::pin(async move {
            self.events.lock().push(request.event);
            Ok(AnnounceResponse {
                interval: Some(1800),
                peers: self.peers.clone(),
                ..AnnounceResponse::default()
            })
        })
    }

    fn scrape<'a>(
        &'a self,
        _url: &'a str,
        _info_hash: &'a InfoHash,
    ) -> BoxFuture<'a, Result<ScrapeStats, TrackerError>> {
        Box::pin(async { Err(TrackerError::ScrapeUnsupported) })
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[test]
fn test_totals_apply() {
    let mut totals = TransferTotals::new(1000);
    totals.apply(TransferDelta::transferred(10, 400, 0));
    totals.apply(TransferDelta::transferred(5, 0, 16));
    totals.apply(TransferDelta::left(600));

    assert_eq!(totals.uploaded(), 15);
    assert_eq!(totals.downloaded(), 400);
    assert_eq!(totals.wasted(), 16);
    assert_eq!(
        totals.announce_stats(),
        AnnounceStats {
            uploaded: 15,
            downloaded: 400,
            left: 600
        }
    );
}

#[tokio::test]
async fn test_bind_skips_to_free_port() {
    let taken = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await.unwrap();
    let port = taken.local_addr().unwrap().port();

    match bind_first_free(&(port..=port)).await {
        Err(SessionError::NoFreePort { start, end }) => assert_eq!((start, end), (port, port)),
        other => panic!("expected no free port, got {:?}", other.map(|l| l.local_addr())),
    }

    let listener = bind_first_free(&(0..=0)).await.unwrap();
    assert_ne!(listener.local_addr().unwrap().port(), 0);
}

#[tokio::test]
async fn test_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.peer.max_connections = 0;

    let result = Session::start_with_backend(
        &torrent(&payload()),
        config,
        Arc::new(FixedTracker::default()),
    )
    .await;
    assert!(matches!(result, Err(SessionError::Config(_))));
}

#[tokio::test]
async fn test_seed_reports_nothing_left() {
    let dir = TempDir::new().unwrap();
    let data = payload();
    std::fs::write(dir.path().join("data.bin"), &data).unwrap();
    let tracker = Arc::new(FixedTracker::default());

    let seed = Session::start_with_backend(&torrent(&data), config(dir.path()), tracker.clone())
        .await
        .unwrap();
    assert!(seed.is_complete());
    assert_eq!(seed.totals().left(), 0);
    assert_ne!(seed.port(), 0);

    eventually("started announce", || !tracker.events.lock().is_empty()).await;
    assert_eq!(tracker.events.lock()[0], TrackerEvent::Started);
    seed.stop();
    seed.stop();
    assert!(seed.peers().is_stopped());
    assert!(seed.announcer().is_stopped());
}

#[tokio::test]
async fn test_leech_downloads_from_seed() {
    let data = payload();
    let metainfo = torrent(&data);

    let seed_dir = TempDir::new().unwrap();
    std::fs::write(seed_dir.path().join("data.bin"), &data).unwrap();
    let seed = Session::start_with_backend(
        &metainfo,
        config(seed_dir.path()),
        Arc::new(FixedTracker::default()),
    )
    .await
    .unwrap();

    let leech_dir = TempDir::new().unwrap();
    let tracker = Arc::new(FixedTracker {
        peers: vec![Peer::new(([127, 0, 0, 1], seed.port()).into())],
        ..FixedTracker::default()
    });
    let leech = Session::start_with_backend(&metainfo, config(leech_dir.path()), tracker.clone())
        .await
        .unwrap();
    assert_eq!(leech.totals().left(), DATA_LEN as u64);

    eventually("download", || leech.totals().left() == 0).await;
    assert!(leech.is_complete());
    assert_eq!(std::fs::read(leech_dir.path().join("data.bin")).unwrap(), data);

    let totals = leech.totals();
    assert_eq!(totals.downloaded(), DATA_LEN as u64);
    assert_eq!(totals.wasted(), 0);

    eventually("completed announce", || {
        tracker.events.lock().contains(&TrackerEvent::Completed)
    })
    .await;
    eventually("seed upload count", || seed.totals().uploaded() == DATA_LEN as u64).await;
    eventually("rate tick", || leech.average_rates().1 > 0.0).await;

    leech.stop();
    seed.stop();
}

#[tokio::test]
async fn test_pause_announces_stopped() {
    let dir = TempDir::new().unwrap();
    let data = payload();
    std::fs::write(dir.path().join("data.bin"), &data).unwrap();
    let tracker = Arc::new(FixedTracker::default());

    let session =
        Session::start_with_backend(&torrent(&data), config(dir.path()), tracker.clone())
            .await
            .unwrap();
    eventually("started announce", || !tracker.events.lock().is_empty()).await;

    session.pause();
    session.pause();
    assert!(session.is_paused());
    assert!(session.peers().is_stopped());
    assert!(!session.announcer().is_stopped());

    eventually("stopped announce", || {
        tracker.events.lock().contains(&TrackerEvent::Stopped)
    })
    .await;
    let stopped = tracker
        .events
        .lock()
        .iter()
        .filter(|&&e| e == TrackerEvent::Stopped)
        .count();
    assert_eq!(stopped, 1);
    assert_eq!(session.announcer().pending(), 0);

    session.stop();
    assert!(session.announcer().is_stopped());
}
