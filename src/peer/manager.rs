use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::bitfield::Bitfield;
use super::choking::{choke_round, ChokeCandidate, ChokePolicy, ChokingState, InterestOrder};
use super::connection::PeerConnection;
use super::error::PeerError;
use super::message::{Handshake, Message};
use super::peer_id::PeerId;
use super::pipeline::{BlockRequest, Cancelled};
use super::transport::PeerTransport;
use crate::config::PeerConfig;
use crate::constants::{CONNECT_TIMEOUT, MAX_REQUEST_LEN};
use crate::metainfo::InfoHash;
use crate::storage::{BlockMark, PieceProgress, PieceStorage};

/// Callbacks from the peer engine to whoever owns the torrent.
pub trait SwarmEvents: Send + Sync {
    /// Payload bytes moved. Duplicate blocks are reported as `wasted` only.
    fn transferred(&self, uploaded: u64, downloaded: u64, wasted: u64);

    /// Every block of `index` has been written. Resolves to whether the
    /// piece passed hash verification.
    fn piece_completed(&self, index: u32) -> BoxFuture<'_, bool>;

    /// The connection count fell below the low-water mark.
    fn reannounce(&self);
}

/// Received blocks and the blocks currently asked for, kept under one lock.
struct Blocks {
    progress: PieceProgress,
    requested: HashSet<(u32, u32)>,
}

/// Owns every peer connection of one torrent.
///
/// The manager runs each connection's handshake and read loop, dispatches
/// the messages it receives, decides what to request from whom and which
/// requests to serve. Pieces are requested scarcest first; rarity is
/// recomputed whenever a peer's advertised pieces change.
pub struct PeerManager {
    config: PeerConfig,
    info_hash: InfoHash,
    local_id: PeerId,
    storage: Arc<PieceStorage>,
    events: Arc<dyn SwarmEvents>,
    policy: Box<dyn ChokePolicy>,
    connections: Mutex<Vec<Arc<PeerConnection>>>,
    blocks: Mutex<Blocks>,
    availability: Mutex<Vec<u32>>,
    next_id: AtomicU64,
    reannounce_armed: AtomicBool,
    stopped: AtomicBool,
}

impl PeerManager {
    pub fn new(
        config: PeerConfig,
        info_hash: InfoHash,
        local_id: PeerId,
        storage: Arc<PieceStorage>,
        events: Arc<dyn SwarmEvents>,
    ) -> Self {
        Self::with_policy(config, info_hash, local_id, storage, events, Box::new(InterestOrder))
    }

    pub fn with_policy(
        config: PeerConfig,
        info_hash: InfoHash,
        local_id: PeerId,
        storage: Arc<PieceStorage>,
        events: Arc<dyn SwarmEvents>,
        policy: Box<dyn ChokePolicy>,
    ) -> Self {
        let progress = PieceProgress::new(storage.layout(), &storage.bitfield());
        let piece_count = storage.layout().piece_count();
        Self {
            config,
            info_hash,
            local_id,
            storage,
            events,
            policy,
            connections: Mutex::new(Vec::new()),
            blocks: Mutex::new(Blocks {
                progress,
                requested: HashSet::new(),
            }),
            availability: Mutex::new(vec![0; piece_count]),
            next_id: AtomicU64::new(1),
            reannounce_armed: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn storage(&self) -> &Arc<PieceStorage> {
        &self.storage
    }

    /// Snapshot of the connection set, highest interest score first.
    pub fn connections(&self) -> Vec<Arc<PeerConnection>> {
        self.connections.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_connected_to(&self, addr: SocketAddr) -> bool {
        self.connections.lock().iter().any(|c| c.addr() == addr)
    }

    /// How many connections advertise each piece, as of the last interest
    /// pass.
    pub fn availability(&self) -> Vec<u32> {
        self.availability.lock().clone()
    }

    /// Dials `addr` unless it is already known or the connection limit is
    /// reached. Returns whether a connection was started.
    pub fn add_peer(self: &Arc<Self>, addr: SocketAddr, peer_id: Option<PeerId>) -> bool {
        let Some(conn) = self.register(addr, true, peer_id) else {
            return false;
        };
        trace!(peer = %addr, "dialing");
        let task = tokio::spawn(self.clone().run_connection(conn.clone(), None));
        conn.set_task(task.abort_handle());
        true
    }

    /// Takes over an accepted socket.
    pub fn accept(self: &Arc<Self>, stream: TcpStream) -> Result<bool, PeerError> {
        let addr = stream.peer_addr()?;
        let Some(conn) = self.register(addr, false, None) else {
            return Ok(false);
        };
        trace!(peer = %addr, "accepted");
        let task = tokio::spawn(self.clone().run_connection(conn.clone(), Some(stream)));
        conn.set_task(task.abort_handle());
        Ok(true)
    }

    fn register(
        &self,
        addr: SocketAddr,
        outgoing: bool,
        peer_id: Option<PeerId>,
    ) -> Option<Arc<PeerConnection>> {
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }
        let mut connections = self.connections.lock();
        if connections.len() >= self.config.max_connections
            || connections.iter().any(|c| c.addr() == addr)
        {
            return None;
        }

        let conn = Arc::new(PeerConnection::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            addr,
            outgoing,
            peer_id,
            self.storage.layout().piece_count(),
            self.config.rate_window,
        ));
        connections.push(conn.clone());
        if connections.len() >= self.config.low_water_mark {
            self.reannounce_armed.store(true, Ordering::Release);
        }
        Some(conn)
    }

    async fn run_connection(self: Arc<Self>, conn: Arc<PeerConnection>, stream: Option<TcpStream>) {
        match self.drive(&conn, stream).await {
            Ok(()) => debug!(peer = %conn.addr(), "connection closed"),
            Err(e) => debug!(peer = %conn.addr(), "connection dropped: {}", e),
        }
        self.drop_connection(&conn);
    }

    async fn drive(
        self: &Arc<Self>,
        conn: &Arc<PeerConnection>,
        stream: Option<TcpStream>,
    ) -> Result<(), PeerError> {
        let stream = match stream {
            Some(stream) => stream,
            None => timeout(CONNECT_TIMEOUT, TcpStream::connect(conn.addr()))
                .await
                .map_err(|_| PeerError::Timeout)??,
        };
        conn.set_handshaking();

        let mut transport = PeerTransport::new(stream);
        let ours = Handshake::new(self.info_hash, self.local_id, self.config.fast_extension);
        let theirs = if conn.is_outgoing() {
            transport.send_handshake(&ours).await?;
            let theirs = transport.receive_handshake().await?;
            self.check_info_hash(&theirs)?;
            theirs
        } else {
            let theirs = transport.receive_handshake().await?;
            self.check_info_hash(&theirs)?;
            transport.send_handshake(&ours).await?;
            theirs
        };
        conn.check_peer_id(theirs.peer_id)?;

        let fast = self.config.fast_extension && theirs.supports_fast_extension();
        let (mut reader, writer) = transport.into_split();
        conn.activate(writer, fast, self.events.clone())?;
        debug!(
            peer = %conn.addr(),
            client = theirs.peer_id.client_id().unwrap_or("unknown"),
            fast,
            "connection established"
        );
        self.send_initial_state(conn);

        loop {
            let message = tokio::select! {
                message = reader.receive_message() => message?,
                _ = conn.closed() => return Ok(()),
            };
            trace!(peer = %conn.addr(), "received {:?}", message.id());
            self.handle_message(conn, message).await?;
        }
    }

    fn check_info_hash(&self, handshake: &Handshake) -> Result<(), PeerError> {
        if handshake.info_hash == self.info_hash {
            Ok(())
        } else {
            Err(PeerError::InfoHashMismatch)
        }
    }

    fn send_initial_state(&self, conn: &PeerConnection) {
        let have = self.storage.bitfield();
        if conn.fast() && have.is_complete() {
            conn.send(Message::HaveAll);
        } else if have.is_empty() {
            if conn.fast() {
                conn.send(Message::HaveNone);
            }
        } else if self.config.lazy_bitfield > 0 {
            conn.send_lazy_bitfield(&have, self.config.lazy_bitfield);
        } else {
            conn.send_bitfield(&have);
        }
    }

    async fn handle_message(
        self: &Arc<Self>,
        conn: &Arc<PeerConnection>,
        message: Message,
    ) -> Result<(), PeerError> {
        if message.is_fast() && !conn.fast() {
            return Err(PeerError::UnknownMessage(message.id().unwrap_or(0)));
        }

        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                conn.with_choking(|c| c.peer_choking = true);
                let dropped = conn.with_pipeline(|p| p.clear());
                self.release(&dropped);
            }
            Message::Unchoke => {
                conn.with_choking(|c| c.peer_choking = false);
                self.fill_requests(conn);
            }
            Message::Interested => {
                conn.with_choking(|c| c.peer_interested = true);
                self.rechoke();
            }
            Message::NotInterested => {
                conn.with_choking(|c| c.peer_interested = false);
                self.rechoke();
            }
            Message::Have { piece } => {
                if piece as usize >= self.storage.layout().piece_count() {
                    return Err(PeerError::InvalidMessage(format!("have for piece {}", piece)));
                }
                if conn.add_piece(piece) {
                    self.refresh_interest();
                    self.fill_requests(conn);
                }
            }
            Message::Bitfield(bytes) => {
                let pieces = Bitfield::from_bytes(&bytes, self.storage.layout().piece_count())?;
                self.add_pieces(conn, &pieces);
            }
            Message::HaveAll => {
                let pieces = Bitfield::full(self.storage.layout().piece_count());
                self.add_pieces(conn, &pieces);
            }
            Message::HaveNone => {}
            Message::Request {
                index,
                begin,
                length,
            } => self.serve(conn, BlockRequest::new(index, begin, length))?,
            Message::Piece { index, begin, data } => {
                self.receive_block(conn, index, begin, data).await?;
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => conn.note_upload_cancel(BlockRequest::new(index, begin, length)),
            Message::Reject {
                index,
                begin,
                length,
            } => {
                let request = BlockRequest::new(index, begin, length);
                match conn.with_pipeline(|p| p.cancel(&request)) {
                    Cancelled::InFlight(completion) => {
                        for next in completion.promoted {
                            conn.send_request(next);
                        }
                        self.release(&[request]);
                    }
                    Cancelled::Queued => self.release(&[request]),
                    Cancelled::NotFound => {}
                }
                self.fill_requests(conn);
            }
            Message::Suggest { piece } | Message::AllowedFast { piece } => {
                trace!(peer = %conn.addr(), piece, "ignoring fast hint");
            }
            Message::Unknown { id } => return Err(PeerError::UnknownMessage(id)),
        }
        Ok(())
    }

    fn add_pieces(&self, conn: &PeerConnection, pieces: &Bitfield) {
        if !conn.add_pieces(pieces).is_empty() {
            self.refresh_interest();
            self.fill_requests(conn);
        }
    }

    /// Answers a block request if the peer is admitted, otherwise rejects it
    /// (fast extension) or drops it.
    fn serve(&self, conn: &Arc<PeerConnection>, request: BlockRequest) -> Result<(), PeerError> {
        if request.length == 0 || request.length > MAX_REQUEST_LEN {
            return Err(PeerError::InvalidMessage(format!(
                "request length {}",
                request.length
            )));
        }

        let admitted = admits(
            self.storage.has_piece(request.index),
            conn.has_piece(request.index),
            &conn.choking(),
        );
        if !admitted {
            if conn.fast() {
                conn.send_reject(request);
            } else {
                trace!(peer = %conn.addr(), piece = request.index, "dropping request");
            }
            return Ok(());
        }

        // A cancel for an earlier identical request must not suppress this one.
        conn.take_upload_cancel(&request);

        let storage = self.storage.clone();
        let conn = conn.clone();
        tokio::spawn(async move {
            match storage.read(request.index, request.begin, request.length).await {
                Ok(data) => {
                    if !conn.take_upload_cancel(&request) {
                        conn.send_piece(request.index, request.begin, data);
                    }
                }
                Err(e) => {
                    debug!(peer = %conn.addr(), piece = request.index, "read failed: {}", e);
                    if conn.fast() {
                        conn.send_reject(request);
                    }
                }
            }
        });
        Ok(())
    }

    async fn receive_block(
        &self,
        conn: &Arc<PeerConnection>,
        index: u32,
        begin: u32,
        data: Bytes,
    ) -> Result<(), PeerError> {
        let length = data.len() as u64;
        conn.record_transfer(0, length);

        if let Some(completion) = conn.with_pipeline(|p| p.complete(index, begin)) {
            for next in completion.promoted {
                conn.send_request(next);
            }
        }

        let (expected, done) = {
            let blocks = self.blocks.lock();
            (
                blocks.progress.block_length(index, begin),
                blocks.progress.is_done(index, begin),
            )
        };
        if expected != Some(data.len() as u32) {
            self.release(&[BlockRequest::new(index, begin, data.len() as u32)]);
            return Err(PeerError::InvalidMessage(format!(
                "unexpected block {}:{} of {} bytes",
                index,
                begin,
                data.len()
            )));
        }
        if done {
            self.blocks.lock().requested.remove(&(index, begin));
            trace!(peer = %conn.addr(), piece = index, begin, "duplicate block");
            self.events.transferred(0, 0, length);
            self.fill_requests(conn);
            return Ok(());
        }

        let written = self.storage.write(index, begin, &data).await;
        let mark = {
            let mut blocks = self.blocks.lock();
            blocks.requested.remove(&(index, begin));
            match written {
                Ok(()) => blocks.progress.mark(index, begin),
                Err(e) => return Err(e.into()),
            }
        };

        match mark {
            Some(BlockMark::Duplicate) => self.events.transferred(0, 0, length),
            Some(BlockMark::Added) => self.events.transferred(0, length, 0),
            Some(BlockMark::PieceFull) => {
                self.events.transferred(0, length, 0);
                self.complete_piece(index).await;
            }
            None => {}
        }

        self.fill_requests(conn);
        Ok(())
    }

    async fn complete_piece(&self, index: u32) {
        if self.events.piece_completed(index).await {
            debug!(piece = index, "piece verified");
            for conn in self.connections() {
                conn.send_have(index);
            }
            self.refresh_interest();
        } else {
            warn!(piece = index, "piece failed hash check");
            let mut blocks = self.blocks.lock();
            blocks.progress.reset(index);
            blocks.requested.retain(|&(piece, _)| piece != index);
        }
    }

    fn release(&self, requests: &[BlockRequest]) {
        if requests.is_empty() {
            return;
        }
        let mut blocks = self.blocks.lock();
        for r in requests {
            blocks.requested.remove(&(r.index, r.begin));
        }
    }

    /// Queues blocks for `conn` while it has us unchoked and we want
    /// something it has, up to the per-connection request depth.
    pub fn fill_requests(&self, conn: &PeerConnection) {
        if !conn.is_active() || !conn.choking().can_request() {
            return;
        }
        let room = self
            .config
            .request_depth
            .saturating_sub(conn.with_pipeline(|p| p.len()));
        if room == 0 {
            return;
        }

        let local = self.storage.bitfield();
        let availability = self.availability.lock().clone();
        let mut pieces: Vec<u32> = conn
            .bitfield()
            .iter_set()
            .filter(|&i| !local.has(i))
            .map(|i| i as u32)
            .collect();
        pieces.sort_by_key(|&i| availability.get(i as usize).copied().unwrap_or(0));

        let mut picked = Vec::new();
        {
            let mut blocks = self.blocks.lock();
            'pieces: for index in pieces {
                for (begin, length) in blocks.progress.missing(index) {
                    if picked.len() == room {
                        break 'pieces;
                    }
                    if blocks.requested.insert((index, begin)) {
                        picked.push(BlockRequest::new(index, begin, length));
                    }
                }
            }
        }

        for request in picked {
            if let Some(now) = conn.with_pipeline(|p| p.push(request)) {
                conn.send_request(now);
            }
        }
    }

    /// Recomputes rarity, every connection's interest score and our interest
    /// in each peer, then re-sorts the connection set by score.
    pub fn refresh_interest(&self) {
        let local = self.storage.bitfield();
        let connections: Vec<_> = self
            .connections()
            .into_iter()
            .filter(|c| c.is_active())
            .collect();
        let bitfields: Vec<Bitfield> = connections.iter().map(|c| c.bitfield()).collect();

        let mut availability = vec![0u32; local.len()];
        for bitfield in &bitfields {
            for i in bitfield.iter_set() {
                availability[i] += 1;
            }
        }
        let ranks = rarity_ranks(&availability);

        for (conn, bitfield) in connections.iter().zip(&bitfields) {
            let mut wanted = false;
            let mut score = 0u64;
            for i in bitfield.iter_set().filter(|&i| !local.has(i)) {
                wanted = true;
                score += ranks[i] as u64;
            }
            conn.set_interest_score(score);

            let changed = conn.with_choking(|c| std::mem::replace(&mut c.am_interested, wanted) != wanted);
            if changed {
                if wanted {
                    conn.send_interested();
                } else {
                    conn.send_not_interested();
                }
            }
        }

        *self.availability.lock() = availability;
        self.connections
            .lock()
            .sort_by(|a, b| b.interest_score().cmp(&a.interest_score()));
    }

    /// Runs the choke policy over the active connections and sends choke or
    /// unchoke where the decision changed.
    pub fn rechoke(&self) {
        let connections: Vec<_> = self
            .connections()
            .into_iter()
            .filter(|c| c.is_active())
            .collect();
        let candidates: Vec<ChokeCandidate> = connections
            .iter()
            .map(|c| {
                let choking = c.choking();
                ChokeCandidate {
                    id: c.id(),
                    addr: c.addr(),
                    peer_interested: choking.peer_interested,
                    am_choking: choking.am_choking,
                    interest_score: c.interest_score(),
                    download_rate: c.download_rate(),
                }
            })
            .collect();

        for (id, unchoke) in choke_round(self.policy.as_ref(), &candidates, self.config.unchoke_slots) {
            let Some(conn) = connections.iter().find(|c| c.id() == id) else {
                continue;
            };
            conn.with_choking(|c| c.am_choking = !unchoke);
            if unchoke {
                conn.send_unchoke();
            } else {
                conn.send_choke();
            }
        }
    }

    /// Closes every connection's rate tick, resizes its pipeline from the
    /// observed rate and tops up its requests.
    pub fn tick(&self) {
        for conn in self.connections() {
            let down = conn.tick();
            for next in conn.with_pipeline(|p| p.resize_for_rate(down)) {
                conn.send_request(next);
            }
            self.fill_requests(&conn);
        }
    }

    /// Periodic interest pass and choke round until the manager stops.
    pub async fn run_choker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.choke_interval);
        loop {
            interval.tick().await;
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            self.refresh_interest();
            self.rechoke();
        }
    }

    /// Removes a connection. Safe to call more than once.
    pub fn drop_connection(&self, conn: &Arc<PeerConnection>) {
        conn.close();
        let remaining = {
            let mut connections = self.connections.lock();
            let Some(pos) = connections.iter().position(|c| c.id() == conn.id()) else {
                return;
            };
            connections.remove(pos);
            connections.len()
        };

        let dropped = conn.with_pipeline(|p| p.clear());
        self.release(&dropped);
        self.refresh_interest();
        if !dropped.is_empty() {
            for other in self.connections() {
                self.fill_requests(&other);
            }
        }

        if remaining < self.config.low_water_mark
            && !self.stopped.load(Ordering::Acquire)
            && self.reannounce_armed.swap(false, Ordering::AcqRel)
        {
            info!(remaining, "connection count below low-water mark, reannouncing");
            self.events.reannounce();
        }
    }

    /// Drops every connection. Later calls do nothing.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let connections = std::mem::take(&mut *self.connections.lock());
        debug!(count = connections.len(), "stopping peer manager");
        for conn in connections {
            conn.close();
        }
        self.blocks.lock().requested.clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerManager")
            .field("info_hash", &self.info_hash)
            .field("connections", &self.connection_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Rank of each piece by scarcity.
///
/// Pieces are grouped by holder count; with `t` distinct non-zero counts the
/// scarcest group ranks `t` and the most common ranks 1. Pieces nobody has
/// rank 0.
pub fn rarity_ranks(availability: &[u32]) -> Vec<u32> {
    let mut tiers: Vec<u32> = availability.iter().copied().filter(|&n| n > 0).collect();
    tiers.sort_unstable();
    tiers.dedup();

    availability
        .iter()
        .map(|&n| match tiers.binary_search(&n) {
            Ok(idx) => (tiers.len() - idx) as u32,
            Err(_) => 0,
        })
        .collect()
}

/// Whether a block request may be served: we have the piece, the peer does
/// not, we are not choking it, and it is either interested or not choking us.
pub fn admits(have_piece: bool, peer_has_piece: bool, choking: &ChokingState) -> bool {
    have_piece
        && !peer_has_piece
        && !choking.am_choking
        && (choking.peer_interested || !choking.peer_choking)
}
