//! One running torrent.
//!
//! A [`Session`] binds the listen port, checks the data already on disk and
//! wires the [`PeerManager`] and the [`Announcer`] together: peers from
//! trackers are dialled, finished pieces are verified and counted, and a
//! `completed` announce goes out once the last piece lands. Background
//! tasks run until [`Session::stop`]; [`Session::pause`] tells the trackers
//! the client is leaving first.
//!
//! # Example
//!
//! ```no_run
//! use swarmbit::config::SessionConfig;
//! use swarmbit::metainfo::Metainfo;
//! use swarmbit::session::Session;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let metainfo = Metainfo::from_file("example.torrent")?;
//! let session = Session::start(&metainfo, SessionConfig::default()).await?;
//! println!("listening on port {}", session.port());
//!
//! tokio::signal::ctrl_c().await?;
//! session.stop();
//! # Ok(())
//! # }
//! ```

mod error;
mod totals;

pub use error::SessionError;
pub use totals::{TransferDelta, TransferTotals};

use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::metainfo::{InfoHash, Metainfo};
use crate::peer::{PeerId, PeerManager, SwarmEvents};
use crate::rate::RateWindow;
use crate::storage::PieceStorage;
use crate::tracker::{
    AnnounceHandler, AnnounceStats, Announcer, NetworkBackend, Peer, TrackerBackend, TrackerEvent,
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Session {
    info_hash: InfoHash,
    local_id: PeerId,
    port: u16,
    swarm: Arc<Swarm>,
    peers: Arc<PeerManager>,
    announcer: Arc<Announcer>,
    paused: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Starts a session that reaches trackers over the network.
    pub async fn start(metainfo: &Metainfo, config: SessionConfig) -> Result<Self, SessionError> {
        let backend = Arc::new(NetworkBackend::new(config.tracker.clone())?);
        Self::start_with_backend(metainfo, config, backend).await
    }

    pub async fn start_with_backend(
        metainfo: &Metainfo,
        config: SessionConfig,
        backend: Arc<dyn TrackerBackend>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let layout = metainfo.storage_layout()?;
        let listener = bind_first_free(&config.port_range).await?;
        let port = listener.local_addr()?.port();

        let storage =
            Arc::new(PieceStorage::open(&config.download_dir, layout, config.create_files).await);
        let swarm = Arc::new(Swarm::new(storage.clone(), &config));
        let local_id = PeerId::generate();

        let peers = Arc::new(PeerManager::new(
            config.peer.clone(),
            metainfo.info_hash,
            local_id,
            storage,
            swarm.clone(),
        ));
        let announcer = Arc::new(Announcer::new(
            config.tracker.clone(),
            metainfo.announce_tiers(),
            metainfo.info_hash,
            local_id,
            port,
            backend,
            swarm.clone(),
        ));
        swarm.attach(&peers, &announcer);

        let tasks = vec![
            tokio::spawn(accept_loop(listener, peers.clone())),
            tokio::spawn(tick_loop(swarm.clone(), peers.clone(), config.tick_interval)),
            tokio::spawn(peers.clone().run_choker()),
            tokio::spawn(announcer.clone().run()),
        ];
        announcer.reannounce(TrackerEvent::Started);

        info!(
            torrent = %metainfo.info.name,
            info_hash = %metainfo.info_hash,
            port,
            "session started"
        );
        Ok(Self {
            info_hash: metainfo.info_hash,
            local_id,
            port,
            swarm,
            peers,
            announcer,
            paused: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// The port accepting peer connections.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn storage(&self) -> &Arc<PieceStorage> {
        &self.swarm.storage
    }

    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    pub fn announcer(&self) -> &Arc<Announcer> {
        &self.announcer
    }

    pub fn totals(&self) -> TransferTotals {
        *self.swarm.totals.lock()
    }

    /// Bytes per second over the last completed tick.
    pub fn download_rate(&self) -> u64 {
        self.swarm.rates.lock().down()
    }

    pub fn upload_rate(&self) -> u64 {
        self.swarm.rates.lock().up()
    }

    /// Mean `(upload, download)` bytes per second over the global window.
    pub fn average_rates(&self) -> (f64, f64) {
        let rates = self.swarm.rates.lock();
        (rates.up_avg(), rates.down_avg())
    }

    pub fn is_complete(&self) -> bool {
        self.swarm.storage.is_complete()
    }

    /// Sends `stopped` to the trackers and drops every peer connection.
    ///
    /// The announcer keeps running until the `stopped` round is out;
    /// [`stop`](Self::stop) ends it. Later calls do nothing.
    pub fn pause(&self) {
        if self.paused.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(info_hash = %self.info_hash, "session paused");
        self.announcer.reannounce(TrackerEvent::Stopped);
        self.peers.stop();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Stops the announcer, drops every connection and ends the background
    /// tasks. Later calls do nothing.
    pub fn stop(&self) {
        self.announcer.stop();
        self.peers.stop();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("info_hash", &self.info_hash)
            .field("port", &self.port)
            .field("totals", &self.totals())
            .finish()
    }
}

/// Tries each port of `range` in order.
pub(crate) async fn bind_first_free(
    range: &RangeInclusive<u16>,
) -> Result<TcpListener, SessionError> {
    for port in range.clone() {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!(port, "port unavailable: {}", e),
        }
    }
    Err(SessionError::NoFreePort {
        start: *range.start(),
        end: *range.end(),
    })
}

async fn accept_loop(listener: TcpListener, peers: Arc<PeerManager>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        match peers.accept(stream) {
            Ok(true) => {}
            Ok(false) => trace!(peer = %addr, "incoming connection refused"),
            Err(e) => debug!(peer = %addr, "incoming connection failed: {}", e),
        }
    }
}

async fn tick_loop(swarm: Arc<Swarm>, peers: Arc<PeerManager>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        if peers.is_stopped() {
            break;
        }
        swarm.rates.lock().tick();
        peers.tick();
    }
}

/// The glue between the peer engine and the announcer.
///
/// Holds the torrent-wide counters. The peer manager and announcer own
/// this value, so it only keeps weak references back to them.
struct Swarm {
    storage: Arc<PieceStorage>,
    totals: Mutex<TransferTotals>,
    rates: Mutex<RateWindow>,
    max_connections: usize,
    completed: AtomicBool,
    peers: OnceLock<Weak<PeerManager>>,
    announcer: OnceLock<Weak<Announcer>>,
}

impl Swarm {
    fn new(storage: Arc<PieceStorage>, config: &SessionConfig) -> Self {
        let left = storage.data_left();
        let completed = AtomicBool::new(storage.is_complete());
        Self {
            storage,
            totals: Mutex::new(TransferTotals::new(left)),
            rates: Mutex::new(RateWindow::new(config.global_rate_window)),
            max_connections: config.peer.max_connections,
            completed,
            peers: OnceLock::new(),
            announcer: OnceLock::new(),
        }
    }

    fn attach(&self, peers: &Arc<PeerManager>, announcer: &Arc<Announcer>) {
        let _ = self.peers.set(Arc::downgrade(peers));
        let _ = self.announcer.set(Arc::downgrade(announcer));
    }

    fn peers(&self) -> Option<Arc<PeerManager>> {
        self.peers.get().and_then(Weak::upgrade)
    }

    fn announcer(&self) -> Option<Arc<Announcer>> {
        self.announcer.get().and_then(Weak::upgrade)
    }

    async fn verify(&self, index: u32) -> bool {
        match self.storage.verify(index).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(piece = index, "piece failed hash check");
                return false;
            }
            Err(e) => {
                warn!(piece = index, "piece could not be verified: {}", e);
                return false;
            }
        }

        self.totals
            .lock()
            .apply(TransferDelta::left(self.storage.data_left()));
        debug!(piece = index, "piece verified");

        if self.storage.is_complete() && !self.completed.swap(true, Ordering::AcqRel) {
            info!("download complete");
            if let Some(announcer) = self.announcer() {
                announcer.reannounce(TrackerEvent::Completed);
            }
        }
        true
    }
}

impl SwarmEvents for Swarm {
    fn transferred(&self, uploaded: u64, downloaded: u64, wasted: u64) {
        self.totals
            .lock()
            .apply(TransferDelta::transferred(uploaded, downloaded, wasted));
        self.rates.lock().record(uploaded, downloaded);
    }

    fn piece_completed(&self, index: u32) -> BoxFuture<'_, bool> {
        Box::pin(self.verify(index))
    }

    fn reannounce(&self) {
        if let Some(announcer) = self.announcer() {
            announcer.reannounce(TrackerEvent::None);
        }
    }
}

impl AnnounceHandler for Swarm {
    fn stats(&self) -> AnnounceStats {
        self.totals.lock().announce_stats()
    }

    fn peers_found(&self, peers: Vec<Peer>) {
        let Some(manager) = self.peers() else {
            return;
        };
        let mut added = 0;
        for peer in peers {
            if manager.connection_count() >= self.max_connections {
                break;
            }
            if manager.is_connected_to(peer.addr) {
                continue;
            }
            if manager.add_peer(peer.addr, peer.peer_id) {
                added += 1;
            }
        }
        debug!(added, connections = manager.connection_count(), "tracker peers added");
    }
}

#[cfg(test)]
mod tests;
