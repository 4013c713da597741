use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;
use tokio::time::timeout;

use super::bitfield::Bitfield;
use super::choking::ChokingState;
use super::error::PeerError;
use super::manager::SwarmEvents;
use super::message::Message;
use super::peer_id::PeerId;
use super::pipeline::{BlockRequest, RequestPipeline};
use super::transport::MessageWriter;
use crate::constants::KEEPALIVE_INTERVAL;
use crate::rate::RateWindow;

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Dialing the peer.
    Connecting,
    /// Socket open, handshakes not yet exchanged.
    Handshaking,
    /// Handshake validated; messages flow both ways.
    Active,
    Closed,
}

/// One peer connection and everything it owns.
///
/// Outgoing messages go through a channel to a writer task that owns the
/// socket's write half, so any task can send without blocking on the
/// network. Sends are silently dropped unless the connection is
/// [`Active`](ConnectionState::Active).
///
/// Incoming messages are read and dispatched by the
/// [`PeerManager`](super::PeerManager), which owns the set of connections.
pub struct PeerConnection {
    id: u64,
    addr: SocketAddr,
    outgoing: bool,
    state: Mutex<ConnectionState>,
    peer_id: Mutex<Option<PeerId>>,
    bitfield: Mutex<Bitfield>,
    choking: Mutex<ChokingState>,
    pipeline: Mutex<RequestPipeline>,
    rates: Mutex<RateWindow>,
    interest: AtomicU64,
    fast: AtomicBool,
    outbox: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    upload_cancels: Mutex<HashSet<BlockRequest>>,
    closed: Notify,
    task: Mutex<Option<AbortHandle>>,
}

impl PeerConnection {
    pub(crate) fn new(
        id: u64,
        addr: SocketAddr,
        outgoing: bool,
        peer_id: Option<PeerId>,
        piece_count: usize,
        rate_window: usize,
    ) -> Self {
        Self {
            id,
            addr,
            outgoing,
            state: Mutex::new(ConnectionState::Connecting),
            peer_id: Mutex::new(peer_id),
            bitfield: Mutex::new(Bitfield::new(piece_count)),
            choking: Mutex::new(ChokingState::default()),
            pipeline: Mutex::new(RequestPipeline::new()),
            rates: Mutex::new(RateWindow::new(rate_window)),
            interest: AtomicU64::new(0),
            fast: AtomicBool::new(false),
            outbox: Mutex::new(None),
            upload_cancels: Mutex::new(HashSet::new()),
            closed: Notify::new(),
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_outgoing(&self) -> bool {
        self.outgoing
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        *self.peer_id.lock()
    }

    /// Whether the fast extension was negotiated.
    pub fn fast(&self) -> bool {
        self.fast.load(Ordering::Acquire)
    }

    /// The peer's advertised pieces.
    pub fn bitfield(&self) -> Bitfield {
        self.bitfield.lock().clone()
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.lock().has(index as usize)
    }

    pub fn choking(&self) -> ChokingState {
        *self.choking.lock()
    }

    pub fn interest_score(&self) -> u64 {
        self.interest.load(Ordering::Relaxed)
    }

    /// Bytes received during the last completed tick.
    pub fn download_rate(&self) -> u64 {
        self.rates.lock().down()
    }

    pub fn upload_rate(&self) -> u64 {
        self.rates.lock().up()
    }

    /// Snapshot of the in-flight and queued requests.
    pub fn pipeline(&self) -> RequestPipeline {
        self.pipeline.lock().clone()
    }

    pub(crate) fn set_interest_score(&self, score: u64) {
        self.interest.store(score, Ordering::Relaxed);
    }

    pub(crate) fn with_choking<R>(&self, f: impl FnOnce(&mut ChokingState) -> R) -> R {
        f(&mut self.choking.lock())
    }

    pub(crate) fn with_pipeline<R>(&self, f: impl FnOnce(&mut RequestPipeline) -> R) -> R {
        f(&mut self.pipeline.lock())
    }

    pub(crate) fn record_transfer(&self, up: u64, down: u64) {
        self.rates.lock().record(up, down);
    }

    /// Closes the current rate tick and returns the download bytes it saw.
    pub(crate) fn tick(&self) -> u64 {
        let mut rates = self.rates.lock();
        rates.tick();
        rates.down()
    }

    /// Marks one piece as held by the peer. Returns true if it was new.
    pub(crate) fn add_piece(&self, index: u32) -> bool {
        let mut bitfield = self.bitfield.lock();
        let new = !bitfield.has(index as usize);
        bitfield.set(index as usize);
        new
    }

    /// Merges `pieces` into the peer's bitfield, returning the newly set bits.
    pub(crate) fn add_pieces(&self, pieces: &Bitfield) -> Vec<usize> {
        let mut bitfield = self.bitfield.lock();
        let added: Vec<usize> = pieces.iter_set().filter(|&i| !bitfield.has(i)).collect();
        for &i in &added {
            bitfield.set(i);
        }
        added
    }

    pub(crate) fn set_handshaking(&self) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Handshaking;
        }
    }

    /// Records the id from the peer's handshake, or checks it against the
    /// one already known.
    pub(crate) fn check_peer_id(&self, id: PeerId) -> Result<(), PeerError> {
        let mut known = self.peer_id.lock();
        match *known {
            Some(existing) if existing != id => Err(PeerError::PeerIdMismatch),
            _ => {
                *known = Some(id);
                Ok(())
            }
        }
    }

    /// Starts the writer task and moves the connection to `Active`.
    pub(crate) fn activate(
        self: &Arc<Self>,
        writer: MessageWriter,
        fast: bool,
        events: Arc<dyn SwarmEvents>,
    ) -> Result<(), PeerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return Err(PeerError::ConnectionClosed);
            }
            *state = ConnectionState::Active;
            *self.outbox.lock() = Some(tx);
        }
        self.fast.store(fast, Ordering::Release);
        tokio::spawn(write_loop(self.clone(), writer, rx, events));
        Ok(())
    }

    pub(crate) fn set_task(&self, handle: AbortHandle) {
        if self.state() == ConnectionState::Closed {
            handle.abort();
        } else {
            *self.task.lock() = Some(handle);
        }
    }

    /// Moves to `Closed`, stops the writer and aborts the read task.
    /// Returns false if the connection was already closed.
    pub(crate) fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Closed;
        }
        self.outbox.lock().take();
        self.closed.notify_one();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        true
    }

    /// Wakes the read loop so it ends the connection.
    fn fail(&self) {
        self.closed.notify_one();
    }

    /// Resolves once the connection has been closed or its writer failed.
    pub(crate) async fn closed(&self) {
        self.closed.notified().await
    }

    pub(crate) fn note_upload_cancel(&self, request: BlockRequest) {
        self.upload_cancels.lock().insert(request);
    }

    pub(crate) fn take_upload_cancel(&self, request: &BlockRequest) -> bool {
        self.upload_cancels.lock().remove(request)
    }

    /// Queues a message. Returns false, sending nothing, unless the
    /// connection is active.
    pub fn send(&self, message: Message) -> bool {
        if !self.is_active() {
            return false;
        }
        match self.outbox.lock().as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    pub fn send_choke(&self) -> bool {
        self.send(Message::Choke)
    }

    pub fn send_unchoke(&self) -> bool {
        self.send(Message::Unchoke)
    }

    pub fn send_interested(&self) -> bool {
        self.send(Message::Interested)
    }

    pub fn send_not_interested(&self) -> bool {
        self.send(Message::NotInterested)
    }

    pub fn send_have(&self, piece: u32) -> bool {
        self.send(Message::Have { piece })
    }

    pub fn send_bitfield(&self, bitfield: &Bitfield) -> bool {
        self.send(Message::Bitfield(bitfield.to_bytes()))
    }

    /// Sends `bitfield` with up to `hidden` random set bits cleared, then a
    /// `have` for each cleared bit.
    pub fn send_lazy_bitfield(&self, bitfield: &Bitfield, hidden: usize) -> bool {
        let mut held: Vec<usize> = bitfield.iter_set().collect();
        held.shuffle(&mut rand::rng());
        held.truncate(hidden);

        let mut shown = bitfield.clone();
        for &i in &held {
            shown.clear(i);
        }
        if !self.send_bitfield(&shown) {
            return false;
        }
        held.into_iter().all(|i| self.send_have(i as u32))
    }

    pub fn send_request(&self, request: BlockRequest) -> bool {
        self.send(Message::Request {
            index: request.index,
            begin: request.begin,
            length: request.length,
        })
    }

    pub fn send_reject(&self, request: BlockRequest) -> bool {
        self.send(Message::Reject {
            index: request.index,
            begin: request.begin,
            length: request.length,
        })
    }

    pub fn send_piece(&self, index: u32, begin: u32, data: Bytes) -> bool {
        self.send(Message::Piece { index, begin, data })
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .field("choking", &self.choking())
            .finish()
    }
}

async fn write_loop(
    conn: Arc<PeerConnection>,
    mut writer: MessageWriter,
    mut rx: mpsc::UnboundedReceiver<Message>,
    events: Arc<dyn SwarmEvents>,
) {
    loop {
        let message = match timeout(KEEPALIVE_INTERVAL, rx.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(_) => Message::KeepAlive,
        };

        if let Err(e) = writer.send_message(&message).await {
            tracing::debug!(peer = %conn.addr, "write failed: {}", e);
            conn.fail();
            break;
        }
        tracing::trace!(peer = %conn.addr, "sent {:?}", message.id());

        if let Message::Piece { data, .. } = &message {
            let sent = data.len() as u64;
            conn.record_transfer(sent, 0);
            events.transferred(sent, 0, 0);
        }
    }
    writer.shutdown().await;
}
