use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use tokio::time::Instant;

use super::response::TrackerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactKind {
    Announce(TrackerEvent),
    Scrape,
}

/// One pending request to one tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub url: String,
    pub kind: ContactKind,
}

impl Contact {
    pub fn announce(url: impl Into<String>, event: TrackerEvent) -> Self {
        Self {
            url: url.into(),
            kind: ContactKind::Announce(event),
        }
    }

    pub fn scrape(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: ContactKind::Scrape,
        }
    }
}

#[derive(Debug)]
struct Entry {
    at: Instant,
    seq: u64,
    contact: Contact,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

/// Tracker contacts ordered by fire time. Contacts due at the same instant
/// come out in insertion order.
#[derive(Debug, Default)]
pub struct Schedule {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, at: Instant, contact: Contact) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry { at, seq, contact }));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.at)
    }

    /// Whether an announce to `url` is already waiting.
    pub fn has_announce(&self, url: &str) -> bool {
        self.heap
            .iter()
            .any(|Reverse(e)| e.contact.url == url && matches!(e.contact.kind, ContactKind::Announce(_)))
    }

    /// Whether a contact of the same kind as `contact`, ignoring the event,
    /// is already waiting for its tracker.
    pub fn has_like(&self, contact: &Contact) -> bool {
        match contact.kind {
            ContactKind::Announce(_) => self.has_announce(&contact.url),
            ContactKind::Scrape => self
                .heap
                .iter()
                .any(|Reverse(e)| e.contact.url == contact.url && e.contact.kind == ContactKind::Scrape),
        }
    }

    /// Removes and returns every contact due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<Contact> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|Reverse(e)| e.at <= now) {
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry.contact);
            }
        }
        due
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
