//! Open Sound Control packet layer
//!
//! Pure data and byte handling, no I/O: the transport hands whole datagrams
//! to [`decode`] and sends what [`encode`] produces.

pub mod address;
pub mod codec;
pub mod types;

pub use address::{Strip, StripParam, MIXER_PORT};
pub use codec::{decode, encode, encode_message};
pub use types::{
    bare, into_messages, message, OscBundle, OscMessage, OscMessageExt, OscPacket, OscTime, OscType,
    OscTypeExt,
};
