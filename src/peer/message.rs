use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::PeerError;
use crate::constants::{FAST_EXTENSION_BIT, HANDSHAKE_LEN, PROTOCOL};
use crate::metainfo::InfoHash;

use super::peer_id::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    // Fast extension (BEP-6)
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
}

impl MessageId {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            13 => MessageId::Suggest,
            14 => MessageId::HaveAll,
            15 => MessageId::HaveNone,
            16 => MessageId::Reject,
            17 => MessageId::AllowedFast,
            _ => return None,
        })
    }
}

/// The 68-byte opening exchange of every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId, fast: bool) -> Self {
        let mut reserved = [0u8; 8];
        if fast {
            let (byte, bit) = FAST_EXTENSION_BIT;
            reserved[byte] |= bit;
        }
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_fast_extension(&self) -> bool {
        let (byte, bit) = FAST_EXTENSION_BIT;
        self.reserved[byte] & bit != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(self.info_hash.as_bytes());
        buf.put_slice(self.peer_id.as_bytes());
        buf.freeze()
    }

    /// Parses a handshake, rejecting any protocol string but the standard one.
    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() != HANDSHAKE_LEN
            || data[0] as usize != PROTOCOL.len()
            || &data[1..20] != PROTOCOL
        {
            return Err(PeerError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let info_hash = InfoHash::from_bytes(&data[28..48]).map_err(|_| PeerError::InvalidHandshake)?;
        let peer_id = PeerId::from_bytes(&data[48..68]).ok_or(PeerError::InvalidHandshake)?;

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    /// Raw packed bitfield; its length is checked against the piece count by
    /// the receiver.
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    // Fast extension
    Suggest { piece: u32 },
    HaveAll,
    HaveNone,
    Reject { index: u32, begin: u32, length: u32 },
    AllowedFast { piece: u32 },
    /// Any id not in the table above.
    Unknown { id: u8 },
}

impl Message {
    /// Wire id, `None` for a keep-alive.
    pub fn id(&self) -> Option<u8> {
        let id = match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel { .. } => MessageId::Cancel,
            Message::Suggest { .. } => MessageId::Suggest,
            Message::HaveAll => MessageId::HaveAll,
            Message::HaveNone => MessageId::HaveNone,
            Message::Reject { .. } => MessageId::Reject,
            Message::AllowedFast { .. } => MessageId::AllowedFast,
            Message::Unknown { id } => return Some(*id),
        };
        Some(id as u8)
    }

    /// True for the ids that exist only under the fast extension.
    pub fn is_fast(&self) -> bool {
        matches!(
            self,
            Message::Suggest { .. }
                | Message::HaveAll
                | Message::HaveNone
                | Message::Reject { .. }
                | Message::AllowedFast { .. }
        )
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        let put_triple = |buf: &mut BytesMut, id: MessageId, triple: [u32; 3]| {
            buf.put_u32(13);
            buf.put_u8(id as u8);
            for field in triple {
                buf.put_u32(field);
            }
        };

        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => put_id(&mut buf, MessageId::Choke),
            Message::Unchoke => put_id(&mut buf, MessageId::Unchoke),
            Message::Interested => put_id(&mut buf, MessageId::Interested),
            Message::NotInterested => put_id(&mut buf, MessageId::NotInterested),
            Message::HaveAll => put_id(&mut buf, MessageId::HaveAll),
            Message::HaveNone => put_id(&mut buf, MessageId::HaveNone),
            Message::Have { piece } => put_index(&mut buf, MessageId::Have, *piece),
            Message::Suggest { piece } => put_index(&mut buf, MessageId::Suggest, *piece),
            Message::AllowedFast { piece } => put_index(&mut buf, MessageId::AllowedFast, *piece),
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => put_triple(&mut buf, MessageId::Request, [*index, *begin, *length]),
            Message::Cancel {
                index,
                begin,
                length,
            } => put_triple(&mut buf, MessageId::Cancel, [*index, *begin, *length]),
            Message::Reject {
                index,
                begin,
                length,
            } => put_triple(&mut buf, MessageId::Reject, [*index, *begin, *length]),
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Unknown { id } => {
                buf.put_u32(1);
                buf.put_u8(*id);
            }
        }

        buf.freeze()
    }

    /// Decodes one complete frame, length prefix included.
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < 4 {
            return Err(PeerError::InvalidMessage("too short".into()));
        }

        let length = data.get_u32() as usize;
        if data.remaining() != length {
            return Err(PeerError::InvalidMessage(format!(
                "frame says {} bytes, got {}",
                length,
                data.remaining()
            )));
        }
        if length == 0 {
            return Ok(Message::KeepAlive);
        }

        let raw_id = data.get_u8();
        let Some(id) = MessageId::from_u8(raw_id) else {
            return Ok(Message::Unknown { id: raw_id });
        };

        match id {
            MessageId::Choke => expect_len(&data, id, 0).map(|_| Message::Choke),
            MessageId::Unchoke => expect_len(&data, id, 0).map(|_| Message::Unchoke),
            MessageId::Interested => expect_len(&data, id, 0).map(|_| Message::Interested),
            MessageId::NotInterested => expect_len(&data, id, 0).map(|_| Message::NotInterested),
            MessageId::HaveAll => expect_len(&data, id, 0).map(|_| Message::HaveAll),
            MessageId::HaveNone => expect_len(&data, id, 0).map(|_| Message::HaveNone),
            MessageId::Have => {
                expect_len(&data, id, 4)?;
                Ok(Message::Have {
                    piece: data.get_u32(),
                })
            }
            MessageId::Suggest => {
                expect_len(&data, id, 4)?;
                Ok(Message::Suggest {
                    piece: data.get_u32(),
                })
            }
            MessageId::AllowedFast => {
                expect_len(&data, id, 4)?;
                Ok(Message::AllowedFast {
                    piece: data.get_u32(),
                })
            }
            MessageId::Bitfield => Ok(Message::Bitfield(data)),
            MessageId::Request => {
                expect_len(&data, id, 12)?;
                Ok(Message::Request {
                    index: data.get_u32(),
                    begin: data.get_u32(),
                    length: data.get_u32(),
                })
            }
            MessageId::Cancel => {
                expect_len(&data, id, 12)?;
                Ok(Message::Cancel {
                    index: data.get_u32(),
                    begin: data.get_u32(),
                    length: data.get_u32(),
                })
            }
            MessageId::Reject => {
                expect_len(&data, id, 12)?;
                Ok(Message::Reject {
                    index: data.get_u32(),
                    begin: data.get_u32(),
                    length: data.get_u32(),
                })
            }
            MessageId::Piece => {
                if data.remaining() < 8 {
                    return Err(PeerError::InvalidMessage("piece too short".into()));
                }
                let index = data.get_u32();
                let begin = data.get_u32();
                Ok(Message::Piece { index, begin, data })
            }
        }
    }
}

fn expect_len(data: &Bytes, id: MessageId, payload: usize) -> Result<(), PeerError> {
    if data.remaining() == payload {
        Ok(())
    } else {
        Err(PeerError::InvalidMessage(format!(
            "{:?} payload is {} bytes, expected {}",
            id,
            data.remaining(),
            payload
        )))
    }
}

fn put_id(buf: &mut BytesMut, id: MessageId) {
    buf.put_u32(1);
    buf.put_u8(id as u8);
}

fn put_index(buf: &mut BytesMut, id: MessageId, piece: u32) {
    buf.put_u32(5);
    buf.put_u8(id as u8);
    buf.put_u32(piece);
}
