//! Wire codec for benchmark messages.
//!
//! Layout: `id: u64 LE | payload_len: u32 LE | payload`. The peer echoes
//! messages back unchanged, so the same decoder handles arrivals. Stream
//! transports use the length field to frame messages.

use thiserror::Error;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 12;

/// Largest payload accepted on encode; keeps datagrams under the UDP limit.
pub const MAX_PAYLOAD: usize = 65_507 - HEADER_SIZE;

/// Errors that can occur while decoding a datagram.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram too short: {size} bytes")]
    Truncated { size: usize },

    #[error("payload length mismatch: header says {declared}, datagram carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("payload too large: {size} bytes")]
    PayloadTooLarge { size: usize },
}

/// An outgoing benchmark message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(id: u64, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    /// Encoded datagram size.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode into `buf`, replacing its contents.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge {
                size: self.payload.len(),
            });
        }

        buf.clear();
        buf.reserve(self.encoded_len());
        buf.extend_from_slice(&self.id.to_le_bytes());
        // MAX_PAYLOAD fits in u32.
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }
}

/// Header fields of a received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u64,
    pub payload_len: usize,
}

/// Decode and validate the header of a received datagram.
///
/// The payload itself is not copied; arrivals only need the id.
pub fn decode_header(data: &[u8]) -> Result<Header, WireError> {
    if data.len() < HEADER_SIZE {
        return Err(WireError::Truncated { size: data.len() });
    }

    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&data[0..8]);
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&data[8..12]);

    let declared = u32::from_le_bytes(len_bytes) as usize;
    let actual = data.len() - HEADER_SIZE;
    if declared != actual {
        return Err(WireError::LengthMismatch { declared, actual });
    }

    Ok(Header {
        id: u64::from_le_bytes(id_bytes),
        payload_len: declared,
    })
}

/// Total encoded length announced by the header at the start of `data`.
///
/// Frames messages on stream transports. Returns `None` until a full header
/// is available.
pub fn frame_len(data: &[u8]) -> Option<usize> {
    let len_bytes: [u8; 4] = data.get(8..HEADER_SIZE)?.try_into().ok()?;
    Some(HEADER_SIZE + u32::from_le_bytes(len_bytes) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let msg = Message::new(0x0102_0304_0506_0708, vec![0xAA, 0xBB]);
        let data = msg.encode().expect("encode");

        assert_eq!(data.len(), HEADER_SIZE + 2);
        assert_eq!(&data[0..8], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&data[8..12], &[2, 0, 0, 0]);
        assert_eq!(&data[12..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_decode_encoded_message() {
        let msg = Message::new(42, b"velocity".to_vec());
        let data = msg.encode().expect("encode");

        assert_eq!(&data[HEADER_SIZE..], msg.payload.as_slice());
        assert_eq!(
            decode_header(&data).expect("header"),
            Header {
                id: 42,
                payload_len: 8
            }
        );
    }

    #[test]
    fn test_decode_truncated() {
        assert_eq!(
            decode_header(&[1, 2, 3]),
            Err(WireError::Truncated { size: 3 })
        );
    }

    #[test]
    fn test_decode_length_mismatch() {
        let mut data = Message::new(7, vec![1, 2, 3, 4]).encode().expect("encode");
        data.pop();

        assert_eq!(
            decode_header(&data),
            Err(WireError::LengthMismatch {
                declared: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn test_frame_len_needs_full_header() {
        let data = Message::new(9, vec![7; 20]).encode().expect("encode");

        assert_eq!(frame_len(&data[..HEADER_SIZE - 1]), None);
        assert_eq!(frame_len(&data[..HEADER_SIZE]), Some(HEADER_SIZE + 20));
        assert_eq!(frame_len(&data), Some(data.len()));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let msg = Message::new(1, vec![0; MAX_PAYLOAD + 1]);
        assert!(matches!(
            msg.encode(),
            Err(WireError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_encode_into_reuses_buffer() {
        let mut buf = Vec::with_capacity(64);
        Message::new(1, vec![9; 10]).encode_into(&mut buf).expect("encode");
        Message::new(2, vec![]).encode_into(&mut buf).expect("encode");

        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(decode_header(&buf).expect("header").id, 2);
    }
}
