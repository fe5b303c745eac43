//! Byte-stream contract for typed messages exchanged over a child's pipes.
//!
//! A frame is a one-byte kind tag, the payload length as a little-endian
//! `u32`, then the kind-specific payload.

use thiserror::Error;

/// Kind tag of [`QuitMessage`]
pub const QUIT_MESSAGE_ID: u8 = 1;

const HEADER_LEN: usize = 5;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MessageError {
    #[error("Frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Unexpected message kind {found}, expected {expected}")]
    UnexpectedKind { expected: u8, found: u8 },

    #[error("Payload of {found} bytes does not match the declared size {declared}")]
    SizeMismatch { declared: usize, found: usize },
}

/// A message with a fixed binary payload layout
pub trait Message: Sized {
    const MESSAGE_ID: u8;

    fn encoded_size(&self) -> usize;

    fn encode_payload(&self, out: &mut Vec<u8>);

    fn decode_payload(payload: &[u8]) -> Result<Self, MessageError>;
}

/// Encode `message` into a complete frame
pub fn encode<M: Message>(message: &M) -> Vec<u8> {
    let size = message.encoded_size();
    let mut out = Vec::with_capacity(HEADER_LEN + size);
    out.push(M::MESSAGE_ID);
    out.extend_from_slice(&(size as u32).to_le_bytes());
    message.encode_payload(&mut out);
    debug_assert_eq!(out.len(), HEADER_LEN + size);
    out
}

/// Decode one frame from the front of `bytes`.
///
/// Returns the message and the number of bytes consumed so callers can walk
/// a stream holding several frames.
pub fn decode<M: Message>(bytes: &[u8]) -> Result<(M, usize), MessageError> {
    if bytes.len() < HEADER_LEN {
        return Err(MessageError::Truncated {
            needed: HEADER_LEN,
            available: bytes.len(),
        });
    }
    if bytes[0] != M::MESSAGE_ID {
        return Err(MessageError::UnexpectedKind {
            expected: M::MESSAGE_ID,
            found: bytes[0],
        });
    }
    let declared = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    let end = HEADER_LEN + declared;
    if bytes.len() < end {
        return Err(MessageError::Truncated {
            needed: end,
            available: bytes.len(),
        });
    }
    let message = M::decode_payload(&bytes[HEADER_LEN..end])?;
    Ok((message, end))
}

/// Asks the peer to exit with the given code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuitMessage {
    pub exit_code: i32,
}

impl QuitMessage {
    pub fn new(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

impl Message for QuitMessage {
    const MESSAGE_ID: u8 = QUIT_MESSAGE_ID;

    fn encoded_size(&self) -> usize {
        std::mem::size_of::<i32>()
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.exit_code.to_le_bytes());
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, MessageError> {
        let bytes: [u8; 4] = payload.try_into().map_err(|_| MessageError::SizeMismatch {
            declared: std::mem::size_of::<i32>(),
            found: payload.len(),
        })?;
        Ok(Self::new(i32::from_le_bytes(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quit_message_layout() {
        let bytes = encode(&QuitMessage::new(-7));
        assert_eq!(bytes[0], QUIT_MESSAGE_ID);
        assert_eq!(&bytes[1..5], &4u32.to_le_bytes());
        assert_eq!(&bytes[5..], &(-7i32).to_le_bytes());
    }

    #[test]
    fn test_decode_stream_of_frames() {
        let mut stream = encode(&QuitMessage::new(3));
        stream.extend(encode(&QuitMessage::new(4)));

        let (first, used) = decode::<QuitMessage>(&stream).unwrap();
        assert_eq!(first.exit_code, 3);
        let (second, rest) = decode::<QuitMessage>(&stream[used..]).unwrap();
        assert_eq!(second.exit_code, 4);
        assert_eq!(used + rest, stream.len());
    }

    #[test]
    fn test_decode_errors() {
        let bytes = encode(&QuitMessage::new(0));

        assert_eq!(
            decode::<QuitMessage>(&bytes[..3]),
            Err(MessageError::Truncated {
                needed: 5,
                available: 3
            })
        );
        assert!(matches!(
            decode::<QuitMessage>(&bytes[..7]),
            Err(MessageError::Truncated { needed: 9, .. })
        ));

        let mut wrong_kind = bytes.clone();
        wrong_kind[0] = 42;
        assert_eq!(
            decode::<QuitMessage>(&wrong_kind),
            Err(MessageError::UnexpectedKind {
                expected: QUIT_MESSAGE_ID,
                found: 42
            })
        );

        let mut short_payload = vec![QUIT_MESSAGE_ID];
        short_payload.extend_from_slice(&2u32.to_le_bytes());
        short_payload.extend_from_slice(&[0, 0]);
        assert!(matches!(
            decode::<QuitMessage>(&short_payload),
            Err(MessageError::SizeMismatch { found: 2, .. })
        ));
    }
}
