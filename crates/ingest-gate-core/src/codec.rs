//! Length-prefixed CBOR framing for stream transports.
//!
//! Each frame is a 4-byte big-endian body length followed by the CBOR
//! encoding of a [`ClientFrame`] or [`ServerFrame`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::wire::{Headers, Request, Response, Status};

/// Length of the frame header.
pub const FRAME_HEADER_LEN: usize = 4;

/// Default limit on a single received frame (4 MiB).
pub const DEFAULT_MAX_RECEIVE_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    Request(Request),
    /// No more requests will follow. Closing the connection without this
    /// frame is a cancellation.
    HalfClose,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    Headers(Headers),
    Response(Response),
    /// Always the last frame of a stream.
    Status(Status),
}

/// Encode a frame, header included.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![0u8; FRAME_HEADER_LEN];
    ciborium::into_writer(frame, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    let body_len = buf.len() - FRAME_HEADER_LEN;
    let len = u32::try_from(body_len).map_err(|_| CodecError::FrameTooLarge {
        size: body_len,
        max: u32::MAX as usize,
    })?;
    buf[..FRAME_HEADER_LEN].copy_from_slice(&len.to_be_bytes());
    Ok(buf)
}

/// Body length announced by a frame header, checked against `max`.
pub fn frame_body_len(header: [u8; FRAME_HEADER_LEN], max: usize) -> Result<usize, CodecError> {
    let size = u32::from_be_bytes(header) as usize;
    if size > max {
        return Err(CodecError::FrameTooLarge { size, max });
    }
    Ok(size)
}

/// Decode a frame body.
pub fn decode_frame_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, CodecError> {
    ciborium::from_reader(body).map_err(|e| CodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{DataBatch, Initialize, MetaPair};
    use bytes::Bytes;

    fn split(frame: &[u8]) -> ([u8; FRAME_HEADER_LEN], &[u8]) {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&frame[..FRAME_HEADER_LEN]);
        (header, &frame[FRAME_HEADER_LEN..])
    }

    #[test]
    fn test_client_frame_decodes() {
        let frame = ClientFrame::Request(Request::Initialize(Initialize {
            session_id: String::new(),
            shared_secret_key: "s3cret".into(),
            meta: vec![MetaPair::new("app", "web")],
        }));
        let bytes = encode_frame(&frame).unwrap();
        let (header, body) = split(&bytes);
        assert_eq!(frame_body_len(header, 1024).unwrap(), body.len());
        let decoded: ClientFrame = decode_frame_body(body).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_payload_bytes_survive() {
        let frame = ClientFrame::Request(Request::DataBatch(DataBatch {
            seq_no: vec![1],
            timestamp: vec![5],
            payload: vec![Bytes::from_static(&[0, 255, 7])],
            meta: vec![],
        }));
        let bytes = encode_frame(&frame).unwrap();
        let (_, body) = split(&bytes);
        let decoded: ClientFrame = decode_frame_body(body).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let header = 5000u32.to_be_bytes();
        assert!(matches!(
            frame_body_len(header, 4096),
            Err(CodecError::FrameTooLarge { size: 5000, max: 4096 })
        ));
    }

    #[test]
    fn test_garbage_body_rejected() {
        let result: Result<ServerFrame, _> = decode_frame_body(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }
}
