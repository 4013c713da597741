use super::*;
use crate::config::PeerConfig;
use crate::constants::BLOCK_SIZE;
use crate::metainfo::InfoHash;
use crate::storage::{PieceStorage, StorageLayout};
use bytes::{BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Barrier;

fn request(index: u32, begin: u32) -> BlockRequest {
    BlockRequest::new(index, begin, BLOCK_SIZE)
}

#[test]
fn test_pipeline_defers_past_window() {
    let mut pipeline = RequestPipeline::new();
    assert_eq!(pipeline.window(), 2);

    assert_eq!(pipeline.push(request(0, 0)), Some(request(0, 0)));
    assert_eq!(pipeline.push(request(0, BLOCK_SIZE)), Some(request(0, BLOCK_SIZE)));
    assert_eq!(pipeline.push(request(1, 0)), None);
    assert_eq!(pipeline.push(request(2, 0)), None);
    assert_eq!(pipeline.pending().len(), 2);
    assert_eq!(pipeline.len(), 4);
}

#[test]
fn test_pipeline_completion_promotes_in_order() {
    let mut pipeline = RequestPipeline::new();
    for i in 0..5 {
        pipeline.push(request(i, 0));
    }

    let done = pipeline.complete(1, 0).unwrap();
    assert_eq!(done.request, request(1, 0));
    assert_eq!(done.promoted, vec![request(2, 0)]);

    let done = pipeline.complete(0, 0).unwrap();
    assert_eq!(done.promoted, vec![request(3, 0)]);

    assert!(pipeline.complete(0, 0).is_none());
    assert_eq!(pipeline.pending(), &[request(2, 0), request(3, 0)]);
}

#[test]
fn test_pipeline_resize_flushes_queue() {
    let mut pipeline = RequestPipeline::new();
    for i in 0..6 {
        pipeline.push(request(i, 0));
    }

    let promoted = pipeline.resize_for_rate(25_000);
    assert_eq!(pipeline.window(), 4);
    assert_eq!(promoted, vec![request(2, 0), request(3, 0)]);

    assert!(pipeline.resize(0).is_empty());
    assert_eq!(pipeline.window(), 2);
    assert_eq!(pipeline.pending().len(), 4);
}

#[test]
fn test_pipeline_cancel() {
    let mut pipeline = RequestPipeline::new();
    for i in 0..3 {
        pipeline.push(request(i, 0));
    }

    // Queued entries match on the full triple.
    assert_eq!(
        pipeline.cancel(&BlockRequest::new(2, 0, 100)),
        Cancelled::NotFound
    );
    assert_eq!(pipeline.cancel(&request(2, 0)), Cancelled::Queued);

    pipeline.push(request(3, 0));
    match pipeline.cancel(&request(0, 0)) {
        Cancelled::InFlight(done) => assert_eq!(done.promoted, vec![request(3, 0)]),
        other => panic!("expected in-flight cancel, got {:?}", other),
    }
    assert!(pipeline.contains(&request(1, 0)));
    assert!(!pipeline.contains(&request(0, 0)));
}

#[test]
fn test_handshake_fast_bit() {
    let info_hash = InfoHash([1; 20]);
    let peer_id = PeerId([2; 20]);

    let plain = Handshake::decode(&Handshake::new(info_hash, peer_id, false).encode()).unwrap();
    assert!(!plain.supports_fast_extension());
    assert_eq!(plain.info_hash, info_hash);
    assert_eq!(plain.peer_id, peer_id);

    let fast = Handshake::new(info_hash, peer_id, true).encode();
    assert_eq!(fast[27], 0x04);
    assert!(Handshake::decode(&fast).unwrap().supports_fast_extension());
}

#[test]
fn test_handshake_rejects_other_protocols() {
    let mut data = Handshake::new(InfoHash([1; 20]), PeerId([2; 20]), false)
        .encode()
        .to_vec();
    data[5] = b'X';
    assert!(matches!(
        Handshake::decode(&data),
        Err(PeerError::InvalidHandshake)
    ));
    assert!(Handshake::decode(&data[..67]).is_err());
}

#[test]
fn test_message_framing() {
    let have = Message::Have { piece: 7 }.encode();
    assert_eq!(&have[..], &[0, 0, 0, 5, 4, 0, 0, 0, 7]);
    assert_eq!(Message::decode(have).unwrap(), Message::Have { piece: 7 });

    let keepalive = Message::KeepAlive.encode();
    assert_eq!(&keepalive[..], &[0, 0, 0, 0]);
    assert_eq!(Message::decode(keepalive).unwrap(), Message::KeepAlive);

    let piece = Message::Piece {
        index: 1,
        begin: 16384,
        data: Bytes::from_static(b"abc"),
    };
    assert_eq!(Message::decode(piece.encode()).unwrap(), piece);
}

#[test]
fn test_message_unknown_id() {
    let frame = Bytes::from_static(&[0, 0, 0, 3, 20, 1, 2]);
    assert_eq!(Message::decode(frame).unwrap(), Message::Unknown { id: 20 });
}

#[test]
fn test_message_rejects_bad_lengths() {
    // request with an 8-byte payload
    let mut frame = BytesMut::new();
    frame.put_u32(9);
    frame.put_u8(6);
    frame.put_u64(0);
    assert!(Message::decode(frame.freeze()).is_err());

    // prefix disagrees with the bytes present
    assert!(Message::decode(Bytes::from_static(&[0, 0, 0, 2, 1])).is_err());

    // choke with a payload
    assert!(Message::decode(Bytes::from_static(&[0, 0, 0, 2, 0, 0])).is_err());
}

#[test]
fn test_rarity_ranks() {
    // tiers by holder count: 1 -> 3, 2 -> 2, 3 -> 1
    assert_eq!(rarity_ranks(&[0, 1, 3, 1, 2]), vec![0, 3, 1, 3, 2]);
    assert_eq!(rarity_ranks(&[4, 4]), vec![1, 1]);
    assert!(rarity_ranks(&[]).is_empty());
}

#[test]
fn test_admission() {
    let open = ChokingState {
        am_choking: false,
        am_interested: false,
        peer_choking: true,
        peer_interested: true,
    };
    assert!(admits(true, false, &open));
    assert!(!admits(false, false, &open));
    assert!(!admits(true, true, &open));

    let choked = ChokingState {
        am_choking: true,
        ..open
    };
    assert!(!admits(true, false, &choked));

    // Uninterested peers are served only while they unchoke us.
    let uninterested = ChokingState {
        peer_interested: false,
        ..open
    };
    assert!(!admits(true, false, &uninterested));
    let reciprocal = ChokingState {
        peer_choking: false,
        ..uninterested
    };
    assert!(admits(true, false, &reciprocal));
}

// ----------------------------------------------------------------------------
// Loopback swarm tests
// ----------------------------------------------------------------------------

const PIECE_LEN: usize = BLOCK_SIZE as usize;

#[derive(Default)]
struct Recorder {
    storage: Option<Arc<PieceStorage>>,
    downloaded: AtomicU64,
    wasted: AtomicU64,
    completions: AtomicUsize,
    reannounces: AtomicUsize,
}

impl SwarmEvents for Recorder {
    fn transferred(&self, _uploaded: u64, downloaded: u64, wasted: u64) {
        self.downloaded.fetch_add(downloaded, Ordering::SeqCst);
        self.wasted.fetch_add(wasted, Ordering::SeqCst);
    }

    fn piece_completed(&self, index: u32) -> BoxFuture<'_, bool> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            match &self.storage {
                Some(storage) => storage.verify(index).await.unwrap_or(false),
                None => false,
            }
        })
    }

    fn reannounce(&self) {
        self.reannounces.fetch_add(1, Ordering::SeqCst);
    }
}

struct Swarm {
    _dir: TempDir,
    data: Vec<u8>,
    info_hash: InfoHash,
    storage: Arc<PieceStorage>,
    events: Arc<Recorder>,
    manager: Arc<PeerManager>,
}

fn test_data(pieces: usize) -> (Vec<u8>, StorageLayout) {
    let data: Vec<u8> = (0..pieces * PIECE_LEN).map(|i| (i % 253) as u8).collect();
    let hashes = data
        .chunks(PIECE_LEN)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&Sha1::digest(chunk));
            hash
        })
        .collect();
    let layout =
        StorageLayout::single_file("data.bin", data.len() as u64, PIECE_LEN as u64, hashes).unwrap();
    (data, layout)
}

fn assemble(dir: TempDir, data: Vec<u8>, storage: PieceStorage, config: PeerConfig) -> Swarm {
    let storage = Arc::new(storage);
    let events = Arc::new(Recorder {
        storage: Some(storage.clone()),
        ..Recorder::default()
    });
    let info_hash = InfoHash([9; 20]);
    let manager = Arc::new(PeerManager::new(
        config,
        info_hash,
        PeerId::generate(),
        storage.clone(),
        events.clone(),
    ));

    Swarm {
        _dir: dir,
        data,
        info_hash,
        storage,
        events,
        manager,
    }
}

fn swarm(pieces: usize) -> Swarm {
    swarm_with(pieces, PeerConfig::default())
}

/// A swarm whose local storage starts empty.
fn swarm_with(pieces: usize, config: PeerConfig) -> Swarm {
    let (data, layout) = test_data(pieces);
    let dir = TempDir::new().unwrap();
    let storage = PieceStorage::new(dir.path(), layout, true);
    assemble(dir, data, storage, config)
}

/// A swarm whose local storage already holds every piece.
async fn seeded_swarm(pieces: usize, config: PeerConfig) -> Swarm {
    let (data, layout) = test_data(pieces);
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("data.bin"), &data).unwrap();
    let storage = PieceStorage::open(dir.path(), layout, true).await;
    assert!(storage.is_complete());
    assemble(dir, data, storage, config)
}

fn fast_config() -> PeerConfig {
    PeerConfig {
        fast_extension: true,
        ..PeerConfig::default()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Accepts one connection and completes the handshake as a remote peer.
async fn accept_peer(listener: &TcpListener, info_hash: InfoHash) -> PeerTransport {
    accept_peer_as(listener, info_hash, PeerId::generate(), false).await
}

async fn accept_peer_as(
    listener: &TcpListener,
    info_hash: InfoHash,
    peer_id: PeerId,
    fast: bool,
) -> PeerTransport {
    let (stream, _) = listener.accept().await.unwrap();
    let mut transport = PeerTransport::new(stream);
    let theirs = transport.receive_handshake().await.unwrap();
    assert_eq!(theirs.info_hash, info_hash);
    transport
        .send_handshake(&Handshake::new(info_hash, peer_id, fast))
        .await
        .unwrap();
    transport
}

fn block_of(data: &[u8], index: u32, begin: u32, length: u32) -> Bytes {
    let start = index as usize * PIECE_LEN + begin as usize;
    Bytes::copy_from_slice(&data[start..start + length as usize])
}

#[derive(Debug, Default)]
struct SeedLog {
    requests: Vec<BlockRequest>,
    haves: HashSet<u32>,
}

/// A remote seed holding exactly `piece` of a two-piece torrent.
///
/// It unchokes only after every seed in `ready` has seen our interest, then
/// serves requests until we announce both pieces.
async fn seed_one_piece(
    listener: TcpListener,
    info_hash: InfoHash,
    data: Vec<u8>,
    piece: u32,
    ready: Arc<Barrier>,
) -> SeedLog {
    let mut transport = accept_peer(&listener, info_hash).await;
    let bits = if piece == 0 { 0x80 } else { 0x40 };
    transport
        .send_message(&Message::Bitfield(Bytes::from(vec![bits])))
        .await
        .unwrap();

    let mut log = SeedLog::default();
    loop {
        match transport.receive_message().await.unwrap() {
            Message::Interested => break,
            Message::Request { index, begin, length } => {
                log.requests.push(BlockRequest::new(index, begin, length))
            }
            _ => {}
        }
    }
    ready.wait().await;
    transport.send_message(&Message::Unchoke).await.unwrap();

    while !(log.haves.contains(&0) && log.haves.contains(&1)) {
        match transport.receive_message().await.unwrap() {
            Message::Request { index, begin, length } => {
                log.requests.push(BlockRequest::new(index, begin, length));
                let start = index as usize * PIECE_LEN + begin as usize;
                let block = Bytes::copy_from_slice(&data[start..start + length as usize]);
                transport
                    .send_message(&Message::Piece {
                        index,
                        begin,
                        data: block,
                    })
                    .await
                    .unwrap();
            }
            Message::Have { piece } => {
                log.haves.insert(piece);
            }
            _ => {}
        }
    }
    log
}

#[tokio::test]
async fn test_downloads_from_two_seeds() {
    let swarm = swarm(2);
    let ready = Arc::new(Barrier::new(2));

    let mut seeds = Vec::new();
    for piece in 0..2 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        seeds.push(tokio::spawn(seed_one_piece(
            listener,
            swarm.info_hash,
            swarm.data.clone(),
            piece,
            ready.clone(),
        )));
        assert!(swarm.manager.add_peer(addr, None));
    }

    for (piece, seed) in seeds.into_iter().enumerate() {
        let log = tokio::time::timeout(Duration::from_secs(10), seed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log.requests, vec![request(piece as u32, 0)]);
        assert_eq!(log.haves, HashSet::from([0, 1]));
    }

    assert!(swarm.storage.bitfield().is_complete());
    assert_eq!(swarm.storage.data_left(), 0);
    assert_eq!(swarm.events.completions.load(Ordering::SeqCst), 2);
    assert_eq!(
        swarm.events.downloaded.load(Ordering::SeqCst),
        2 * PIECE_LEN as u64
    );
    assert_eq!(swarm.events.wasted.load(Ordering::SeqCst), 0);

    swarm.manager.stop();
    assert_eq!(swarm.manager.connection_count(), 0);
}

#[tokio::test]
async fn test_duplicate_block_is_wasted() {
    let swarm = swarm(2);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let data = swarm.data.clone();
    let info_hash = swarm.info_hash;
    let (have_tx, have_rx) = tokio::sync::oneshot::channel();
    let seed = tokio::spawn(async move {
        let mut transport = accept_peer(&listener, info_hash).await;
        transport
            .send_message(&Message::Bitfield(Bytes::from(vec![0x80])))
            .await
            .unwrap();
        transport.send_message(&Message::Unchoke).await.unwrap();

        let mut have_tx = Some(have_tx);
        while let Ok(message) = transport.receive_message().await {
            match message {
                Message::Request { index, begin, .. } => {
                    let block = Message::Piece {
                        index,
                        begin,
                        data: Bytes::copy_from_slice(&data[..PIECE_LEN]),
                    };
                    transport.send_message(&block).await.unwrap();
                    transport.send_message(&block).await.unwrap();
                }
                Message::Have { piece } => {
                    if let Some(tx) = have_tx.take() {
                        let _ = tx.send(piece);
                    }
                }
                _ => {}
            }
        }
    });
    assert!(swarm.manager.add_peer(addr, None));

    let have = tokio::time::timeout(Duration::from_secs(10), have_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(have, 0);

    let events = swarm.events.clone();
    eventually(|| events.wasted.load(Ordering::SeqCst) == PIECE_LEN as u64).await;
    assert_eq!(swarm.events.completions.load(Ordering::SeqCst), 1);
    assert_eq!(swarm.events.downloaded.load(Ordering::SeqCst), PIECE_LEN as u64);
    assert!(swarm.storage.has_piece(0));
    assert!(!swarm.storage.has_piece(1));

    swarm.manager.stop();
    tokio::time::timeout(Duration::from_secs(10), seed)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_fast_message_without_extension_disconnects() {
    let swarm = swarm(2);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let info_hash = swarm.info_hash;
    let peer = tokio::spawn(async move {
        let mut transport = accept_peer(&listener, info_hash).await;
        transport.send_message(&Message::HaveAll).await.unwrap();
        // The connection ends once the message is rejected.
        while transport.receive_message().await.is_ok() {}
    });
    assert!(swarm.manager.add_peer(addr, None));

    tokio::time::timeout(Duration::from_secs(10), peer)
        .await
        .unwrap()
        .unwrap();
    let manager = swarm.manager.clone();
    eventually(|| manager.connection_count() == 0).await;

    // Dropping below the low-water mark asks for more peers, once.
    assert_eq!(swarm.events.reannounces.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_info_hash_mismatch_disconnects() {
    let swarm = swarm(1);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = PeerTransport::new(stream);
        transport.receive_handshake().await.unwrap();
        transport
            .send_handshake(&Handshake::new(InfoHash([1; 20]), PeerId::generate(), false))
            .await
            .unwrap();
        while transport.receive_message().await.is_ok() {}
    });
    assert!(swarm.manager.add_peer(addr, None));
    assert!(!swarm.manager.add_peer(addr, None));

    tokio::time::timeout(Duration::from_secs(10), peer)
        .await
        .unwrap()
        .unwrap();
    let manager = swarm.manager.clone();
    eventually(|| manager.connection_count() == 0).await;
}

#[tokio::test]
async fn test_fast_seed_sends_have_all_and_rejects_while_choking() {
    let swarm = seeded_swarm(1, fast_config()).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let info_hash = swarm.info_hash;
    let peer = tokio::spawn(async move {
        let mut transport = accept_peer_as(&listener, info_hash, PeerId::generate(), true).await;
        let first = transport.receive_message().await.unwrap();

        transport
            .send_message(&Message::Request {
                index: 0,
                begin: 0,
                length: BLOCK_SIZE,
            })
            .await
            .unwrap();
        let second = transport.receive_message().await.unwrap();
        (first, second)
    });
    assert!(swarm.manager.add_peer(addr, None));

    let (first, second) = tokio::time::timeout(Duration::from_secs(10), peer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, Message::HaveAll);
    assert_eq!(
        second,
        Message::Reject {
            index: 0,
            begin: 0,
            length: BLOCK_SIZE
        }
    );
    swarm.manager.stop();
}

#[tokio::test]
async fn test_rejected_request_is_picked_again() {
    let swarm = swarm_with(1, fast_config());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let data = swarm.data.clone();
    let info_hash = swarm.info_hash;
    let peer = tokio::spawn(async move {
        let mut transport = accept_peer_as(&listener, info_hash, PeerId::generate(), true).await;
        let first = transport.receive_message().await.unwrap();
        transport.send_message(&Message::HaveAll).await.unwrap();
        transport.send_message(&Message::Unchoke).await.unwrap();

        let mut log = SeedLog::default();
        while log.haves.is_empty() {
            match transport.receive_message().await.unwrap() {
                Message::Request { index, begin, length } => {
                    let reply = if log.requests.is_empty() {
                        Message::Reject { index, begin, length }
                    } else {
                        Message::Piece {
                            index,
                            begin,
                            data: block_of(&data, index, begin, length),
                        }
                    };
                    log.requests.push(BlockRequest::new(index, begin, length));
                    transport.send_message(&reply).await.unwrap();
                }
                Message::Have { piece } => {
                    log.haves.insert(piece);
                }
                _ => {}
            }
        }
        (first, log)
    });
    assert!(swarm.manager.add_peer(addr, None));

    let (first, log) = tokio::time::timeout(Duration::from_secs(10), peer)
        .await
        .unwrap()
        .unwrap();
    // Nothing to offer yet, so the fast extension says so explicitly.
    assert_eq!(first, Message::HaveNone);
    assert_eq!(log.requests, vec![request(0, 0), request(0, 0)]);
    assert!(swarm.storage.has_piece(0));
    assert_eq!(swarm.events.wasted.load(Ordering::SeqCst), 0);
    swarm.manager.stop();
}

#[tokio::test]
async fn test_failed_hash_check_requests_piece_again() {
    let swarm = swarm(1);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let data = swarm.data.clone();
    let info_hash = swarm.info_hash;
    let seed = tokio::spawn(async move {
        let mut transport = accept_peer(&listener, info_hash).await;
        transport
            .send_message(&Message::Bitfield(Bytes::from(vec![0x80])))
            .await
            .unwrap();
        transport.send_message(&Message::Unchoke).await.unwrap();

        let mut log = SeedLog::default();
        while log.haves.is_empty() {
            match transport.receive_message().await.unwrap() {
                Message::Request { index, begin, length } => {
                    let mut block = block_of(&data, index, begin, length).to_vec();
                    if log.requests.is_empty() {
                        block[0] ^= 0xFF;
                    }
                    log.requests.push(BlockRequest::new(index, begin, length));
                    transport
                        .send_message(&Message::Piece {
                            index,
                            begin,
                            data: Bytes::from(block),
                        })
                        .await
                        .unwrap();
                }
                Message::Have { piece } => {
                    log.haves.insert(piece);
                }
                _ => {}
            }
        }
        log
    });
    assert!(swarm.manager.add_peer(addr, None));

    let log = tokio::time::timeout(Duration::from_secs(10), seed)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.requests, vec![request(0, 0), request(0, 0)]);
    assert_eq!(log.haves, HashSet::from([0]));
    assert!(swarm.storage.has_piece(0));
    assert_eq!(swarm.events.completions.load(Ordering::SeqCst), 2);
    swarm.manager.stop();
}

#[tokio::test]
async fn test_known_peer_id_must_match() {
    let swarm = swarm(1);
    let expected = PeerId([7; 20]);
    let info_hash = swarm.info_hash;

    let impostor = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let impostor_addr = impostor.local_addr().unwrap();
    let impostor = tokio::spawn(async move {
        let mut transport = accept_peer_as(&impostor, info_hash, PeerId([8; 20]), false).await;
        while transport.receive_message().await.is_ok() {}
    });
    assert!(swarm.manager.add_peer(impostor_addr, Some(expected)));

    tokio::time::timeout(Duration::from_secs(10), impostor)
        .await
        .unwrap()
        .unwrap();
    let manager = swarm.manager.clone();
    eventually(|| !manager.is_connected_to(impostor_addr)).await;

    let genuine = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let genuine_addr = genuine.local_addr().unwrap();
    let genuine = tokio::spawn(async move {
        let mut transport = accept_peer_as(&genuine, info_hash, expected, false).await;
        while transport.receive_message().await.is_ok() {}
    });
    assert!(swarm.manager.add_peer(genuine_addr, Some(expected)));

    let manager = swarm.manager.clone();
    eventually(|| {
        manager
            .connections()
            .iter()
            .any(|c| c.addr() == genuine_addr && c.is_active())
    })
    .await;
    assert_eq!(swarm.manager.connections()[0].peer_id(), Some(expected));

    swarm.manager.stop();
    tokio::time::timeout(Duration::from_secs(10), genuine)
        .await
        .unwrap()
        .unwrap();
}
