//! Bencode, the canonical serialization used by torrent files and HTTP
//! tracker responses ([BEP-3]).
//!
//! | Type | Encoding | Example |
//! |------|----------|---------|
//! | Integer | `i<decimal>e` | `i42e` |
//! | Byte string | `<length>:<bytes>` | `4:spam` |
//! | List | `l<items>e` | `l4:spami42ee` |
//! | Dictionary | `d<key><value>...e`, keys sorted | `d3:cow3:mooe` |
//!
//! Decoding is strict: integers with leading zeros or `-0`, string lengths
//! with leading zeros, truncated input and trailing bytes are all rejected.
//!
//! ```
//! use swarmbit::bencode::{decode, encode, Value};
//!
//! let value = Value::dict([("spam", Value::Integer(3)), ("cow", "moo".into())]);
//! let bytes = encode(&value);
//! assert_eq!(bytes, b"d3:cow3:moo4:spami3ee");
//! assert_eq!(decode(&bytes).unwrap(), value);
//! ```
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod encode;
mod error;
mod value;

pub use decode::{decode, decode_prefix};
pub use encode::encode;
pub use error::BencodeError;
pub use value::Value;
