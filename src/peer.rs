//! Peer wire protocol (BEP-3, with the BEP-6 fast extension)
//!
//! [`PeerManager`] owns every connection of a torrent: it dials and accepts
//! peers, runs the handshake, dispatches incoming messages, picks blocks to
//! request by rarity and serves the blocks peers ask for. Each
//! [`PeerConnection`] carries its own choke/interest flags, request pipeline
//! and transfer rates.

mod bitfield;
mod choking;
mod connection;
mod error;
mod manager;
mod message;
mod peer_id;
mod pipeline;
mod transport;

pub use bitfield::{Bitfield, BitfieldError};
pub use choking::{choke_round, ChokeCandidate, ChokePolicy, ChokingState, InterestOrder};
pub use connection::{ConnectionState, PeerConnection};
pub use error::PeerError;
pub use manager::{admits, rarity_ranks, PeerManager, SwarmEvents};
pub use message::{Handshake, Message, MessageId};
pub use peer_id::PeerId;
pub use pipeline::{BlockRequest, Cancelled, Completion, RequestPipeline};
pub use transport::{MessageReader, MessageWriter, PeerTransport};

#[cfg(test)]
mod tests;
