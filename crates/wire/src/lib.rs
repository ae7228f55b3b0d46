//! Wire codec for cosim messages.
//!
//! For every message kind, `encode` and `decode` are inverse and stable
//! across versions of the same major protocol.
//!
//! # Wire Format
//!
//! ```text
//! [total_length: u32 LE][kind: u8][participant_id: u64][service_id: u16][body]
//! ```
//!
//! `total_length` counts everything after the length field itself. Within a
//! body:
//!
//! - integers are little-endian fixed-width
//! - strings are UTF-8 with a u32 length prefix
//! - byte blobs and sequences carry a u32 length/count prefix
//! - optional fields carry a one-byte presence tag
//! - timestamps are signed 64-bit nanoseconds
//!
//! A decode that would read past the declared frame length fails with
//! [`CodecError::MalformedFrame`]; an unknown kind byte fails with
//! [`CodecError::UnknownKind`]. The codec has no I/O and no concurrency
//! concerns; stream framing is the peer link's job.

mod buffer;
mod codec;

pub use buffer::{Decoder, Encoder};
pub use codec::{decode_frame, encode_frame, HEADER_LEN, MAX_FRAME_SIZE};

use thiserror::Error;

/// Errors from message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame body is shorter than its fields claim, carries trailing
    /// garbage, or holds an out-of-range enum value.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// The kind byte is not assigned in this protocol version.
    #[error("unknown message kind: {0}")]
    UnknownKind(u8),

    /// The length prefix exceeds the maximum accepted frame size.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
}
