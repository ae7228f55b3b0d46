//! Length-prefixed stream framing.
//!
//! Shared by the participant side and the registry server so the wire
//! protocol cannot drift between the two. The frame layout itself
//! (`[u32 length][kind][address][body]`) lives in `cosim-wire`; this module
//! only moves frames across a stream.

use cosim_messages::{AddressedMessage, Message};
use cosim_types::EndpointAddress;
use cosim_wire::{decode_frame, encode_frame, CodecError, MAX_FRAME_SIZE};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Errors surfaced while reading a frame from a stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameReadError {
    /// Clean end of stream between frames.
    #[error("end of stream")]
    Eof,

    #[error("frame i/o error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or unknown frame; tears down the originating link.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Encode and write one frame, without flushing.
pub async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    from: EndpointAddress,
    message: &Message,
) -> io::Result<()> {
    let bytes = encode_frame(from, message);
    stream.write_all(&bytes).await
}

/// Read one length-prefixed frame and decode it.
pub async fn read_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<AddressedMessage, FrameReadError> {
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(FrameReadError::Eof),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameReadError::Codec(CodecError::FrameTooLarge(len)));
    }
    if len == 0 {
        return Err(FrameReadError::Codec(CodecError::MalformedFrame(
            "zero-length frame",
        )));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(decode_frame(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosim_types::ParticipantId;

    #[tokio::test]
    async fn frames_cross_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let from = EndpointAddress::connection(ParticipantId::from_name("A"));

        write_frame(&mut client, from, &Message::Heartbeat)
            .await
            .unwrap();
        let received = read_frame(&mut server).await.unwrap();
        assert_eq!(received.from, from);
        assert_eq!(received.message, Message::Heartbeat);
    }

    #[tokio::test]
    async fn eof_between_frames_is_clean() {
        let (client, mut server) = tokio::io::duplex(4096);
        drop(client);
        assert!(matches!(
            read_frame(&mut server).await,
            Err(FrameReadError::Eof)
        ));
    }

    #[tokio::test]
    async fn oversized_length_prefix_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let len = (MAX_FRAME_SIZE as u32 + 1).to_le_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &len)
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(FrameReadError::Codec(CodecError::FrameTooLarge(_)))
        ));
    }
}
