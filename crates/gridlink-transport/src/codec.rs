//! Length-prefixed frames
//!
//! Format: `[length: u32 BE][payload]`. The payload is opaque to this layer.

use crate::pipeline::{MessageBytesOutcome, MessageHandler};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Frame receiver closed")]
    ReceiverClosed,
}

/// Length-prefixed frame codec
pub struct LengthPrefixedFrames;

impl LengthPrefixedFrames {
    /// Maximum frame size (16MB)
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    const HEADER_LEN: usize = 4;

    /// Encode a payload as one frame
    pub fn encode(payload: &[u8]) -> Result<Bytes, CodecError> {
        if payload.len() > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);

        Ok(buf.freeze())
    }

    /// Decode the frame at the front of `bytes`
    ///
    /// Returns Ok(Some((payload, frame_len))) for a complete frame,
    /// Ok(None) if more data is needed,
    /// Err if the announced length is too large
    pub fn decode(bytes: &[u8]) -> Result<Option<(&[u8], usize)>, CodecError> {
        if bytes.len() < Self::HEADER_LEN {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&bytes[..Self::HEADER_LEN]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        let frame_len = Self::HEADER_LEN + length;
        if bytes.len() < frame_len {
            return Ok(None);
        }

        Ok(Some((&bytes[Self::HEADER_LEN..frame_len], frame_len)))
    }

    /// Whether `bytes` starts with a complete frame
    pub fn has_complete_frame(bytes: &[u8]) -> bool {
        matches!(Self::decode(bytes), Ok(Some(_)))
    }
}

/// Message handler that forwards each decoded payload to a channel
///
/// Takes one frame per call and reports whether another complete frame
/// follows, so the pipeline keeps calling while frames are buffered.
pub struct ChannelFrameHandler {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelFrameHandler {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    /// Handler plus the receiving end of a channel of `capacity` frames
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl MessageHandler for ChannelFrameHandler {
    async fn on_message_bytes(&self, bytes: &[u8]) -> anyhow::Result<MessageBytesOutcome> {
        let Some((payload, frame_len)) = LengthPrefixedFrames::decode(bytes)? else {
            return Ok(MessageBytesOutcome::incomplete());
        };

        trace!("Decoded frame of {} bytes", payload.len());
        self.tx
            .send(Bytes::copy_from_slice(payload))
            .await
            .map_err(|_| CodecError::ReceiverClosed)?;

        let has_more = LengthPrefixedFrames::has_complete_frame(&bytes[frame_len..]);
        Ok(MessageBytesOutcome::consumed(frame_len, has_more))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_incomplete() {
        let encoded = LengthPrefixedFrames::encode(b"hello").unwrap();

        assert_eq!(LengthPrefixedFrames::decode(&encoded[..3]).unwrap(), None);
        assert_eq!(LengthPrefixedFrames::decode(&encoded[..6]).unwrap(), None);

        let (payload, len) = LengthPrefixedFrames::decode(&encoded).unwrap().unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(len, 9);
    }

    #[test]
    fn test_empty_payload() {
        let encoded = LengthPrefixedFrames::encode(b"").unwrap();
        let (payload, len) = LengthPrefixedFrames::decode(&encoded).unwrap().unwrap();
        assert!(payload.is_empty());
        assert_eq!(len, 4);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let header = (LengthPrefixedFrames::MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        assert!(matches!(
            LengthPrefixedFrames::decode(&header),
            Err(CodecError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_channel_handler_one_frame_per_call() {
        let (handler, mut rx) = ChannelFrameHandler::channel(8);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&LengthPrefixedFrames::encode(b"one").unwrap());
        buf.extend_from_slice(&LengthPrefixedFrames::encode(b"two").unwrap());
        buf.extend_from_slice(&[0, 0, 0, 9, b'p']);

        let first = handler.on_message_bytes(&buf).await.unwrap();
        assert_eq!(first, MessageBytesOutcome::consumed(7, true));

        let second = handler.on_message_bytes(&buf[7..]).await.unwrap();
        assert_eq!(second, MessageBytesOutcome::consumed(7, false));

        let third = handler.on_message_bytes(&buf[14..]).await.unwrap();
        assert_eq!(third, MessageBytesOutcome::incomplete());

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_channel_handler_receiver_dropped() {
        let (handler, rx) = ChannelFrameHandler::channel(1);
        drop(rx);

        let encoded = LengthPrefixedFrames::encode(b"lost").unwrap();
        assert!(handler.on_message_bytes(&encoded).await.is_err());
    }
}
