use std::collections::VecDeque;

use crate::constants::{MIN_PIPELINE_WINDOW, PIPELINE_BYTES_PER_SLOT};

/// A block request as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }
}

/// Result of removing a request from the in-flight set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub request: BlockRequest,
    /// Queued requests moved into the freed capacity; send these now.
    pub promoted: Vec<BlockRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cancelled {
    /// The request was in flight; treated as a completion.
    InFlight(Completion),
    /// The request was still queued and never sent.
    Queued,
    NotFound,
}

/// Adaptive window of outstanding block requests for one connection.
///
/// Requests beyond the window wait in a FIFO queue and are promoted in
/// arrival order as in-flight requests complete. Every method that can free
/// capacity returns the requests that should now go out on the wire.
#[derive(Debug, Clone)]
pub struct RequestPipeline {
    pending: Vec<BlockRequest>,
    queue: VecDeque<BlockRequest>,
    window: usize,
}

impl Default for RequestPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestPipeline {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            queue: VecDeque::new(),
            window: MIN_PIPELINE_WINDOW,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// In-flight requests, oldest first.
    pub fn pending(&self) -> &[BlockRequest] {
        &self.pending
    }

    pub fn queued(&self) -> impl Iterator<Item = &BlockRequest> {
        self.queue.iter()
    }

    /// In-flight plus queued.
    pub fn len(&self) -> usize {
        self.pending.len() + self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.queue.is_empty()
    }

    pub fn contains(&self, request: &BlockRequest) -> bool {
        self.pending.contains(request) || self.queue.contains(request)
    }

    /// Adds a request. Returns it back if it should be sent immediately,
    /// `None` if it was queued.
    pub fn push(&mut self, request: BlockRequest) -> Option<BlockRequest> {
        if self.pending.len() < self.window {
            self.pending.push(request);
            Some(request)
        } else {
            self.queue.push_back(request);
            None
        }
    }

    /// Marks the in-flight request at `(index, begin)` as answered.
    pub fn complete(&mut self, index: u32, begin: u32) -> Option<Completion> {
        let pos = self
            .pending
            .iter()
            .position(|r| r.index == index && r.begin == begin)?;
        let request = self.pending.remove(pos);
        Some(Completion {
            request,
            promoted: self.flush(),
        })
    }

    /// Withdraws a request, matching the exact triple.
    pub fn cancel(&mut self, request: &BlockRequest) -> Cancelled {
        if self.pending.contains(request) {
            return match self.complete(request.index, request.begin) {
                Some(completion) => Cancelled::InFlight(completion),
                None => Cancelled::NotFound,
            };
        }
        match self.queue.iter().position(|r| r == request) {
            Some(pos) => {
                self.queue.remove(pos);
                Cancelled::Queued
            }
            None => Cancelled::NotFound,
        }
    }

    /// Sets the window (never below the minimum) and returns the queued
    /// requests that now fit.
    pub fn resize(&mut self, window: usize) -> Vec<BlockRequest> {
        self.window = window.max(MIN_PIPELINE_WINDOW);
        self.flush()
    }

    /// Sizes the window from an observed download rate in bytes per second.
    pub fn resize_for_rate(&mut self, down_per_sec: u64) -> Vec<BlockRequest> {
        let extra = (down_per_sec / PIPELINE_BYTES_PER_SLOT) as usize;
        self.resize(MIN_PIPELINE_WINDOW + extra)
    }

    /// Empties the pipeline, returning everything that was in it.
    pub fn clear(&mut self) -> Vec<BlockRequest> {
        let mut all: Vec<_> = self.pending.drain(..).collect();
        all.extend(self.queue.drain(..));
        all
    }

    fn flush(&mut self) -> Vec<BlockRequest> {
        let mut promoted = Vec::new();
        while self.pending.len() < self.window {
            let Some(next) = self.queue.pop_front() else {
                break;
            };
            self.pending.push(next);
            promoted.push(next);
        }
        promoted
    }
}
