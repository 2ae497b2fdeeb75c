//! The outer envelope: payload-type tag, opaque payload, optional
//! correlation id.
//!
//! # Wire layout (inside the length-prefixed frame)
//!
//! ```text
//! [0..4]    payload_type   u32, big-endian
//! [4]       c              correlation-id length; 0 = absent, 1..=64 valid
//! [5..5+c]  correlation id UTF-8
//! [5+c..]   payload        opaque bytes
//! ```
//!
//! Unknown payload types decode successfully — the tag is preserved verbatim
//! so the dispatcher can still route (or count) them.  Only structural damage
//! is a [`WireError`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Correlation ids are short opaque tokens; the server echoes them verbatim.
pub const MAX_CORRELATION_ID_LEN: usize = 64;

const HEADER_BYTES: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("envelope truncated: {0} bytes")]
    Truncated(usize),
    #[error("correlation id length {0} exceeds {MAX_CORRELATION_ID_LEN}")]
    CorrelationTooLong(usize),
    #[error("correlation id is not valid UTF-8")]
    CorrelationNotUtf8,
    #[error("correlation id must not be empty")]
    CorrelationEmpty,
    #[error("payload body: {0}")]
    Body(String),
}

/// One framed message, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub payload_type: u32,
    pub payload: Bytes,
    pub correlation_id: Option<String>,
}

impl Envelope {
    /// An uncorrelated envelope (server pushes, keepalives).
    pub fn new(payload_type: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            payload_type,
            payload: payload.into(),
            correlation_id: None,
        }
    }

    /// A correlated envelope (requests and their responses).
    pub fn with_correlation(
        payload_type: u32,
        payload: impl Into<Bytes>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            payload_type,
            payload: payload.into(),
            correlation_id: Some(correlation_id.into()),
        }
    }

    /// Encode into the wire form (without the outer length prefix).
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let corr = self.correlation_id.as_deref().unwrap_or("");
        if self.correlation_id.is_some() && corr.is_empty() {
            return Err(WireError::CorrelationEmpty);
        }
        if corr.len() > MAX_CORRELATION_ID_LEN {
            return Err(WireError::CorrelationTooLong(corr.len()));
        }
        let mut buf = BytesMut::with_capacity(HEADER_BYTES + corr.len() + self.payload.len());
        buf.put_u32(self.payload_type);
        buf.put_u8(corr.len() as u8);
        buf.put_slice(corr.as_bytes());
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode one envelope from a complete frame body.
    pub fn decode(mut frame: Bytes) -> Result<Self, WireError> {
        if frame.len() < HEADER_BYTES {
            return Err(WireError::Truncated(frame.len()));
        }
        let payload_type = frame.get_u32();
        let corr_len = usize::from(frame.get_u8());
        if corr_len > MAX_CORRELATION_ID_LEN {
            return Err(WireError::CorrelationTooLong(corr_len));
        }
        if frame.len() < corr_len {
            return Err(WireError::Truncated(frame.len() + HEADER_BYTES));
        }
        let correlation_id = if corr_len == 0 {
            None
        } else {
            let raw = frame.split_to(corr_len);
            Some(
                std::str::from_utf8(&raw)
                    .map_err(|_| WireError::CorrelationNotUtf8)?
                    .to_owned(),
            )
        };
        Ok(Self {
            payload_type,
            payload: frame,
            correlation_id,
        })
    }
}

/// Serialize a reserved message body into payload bytes.
pub fn encode_body<T: Serialize>(body: &T) -> Result<Bytes, WireError> {
    bincode::serialize(body)
        .map(Bytes::from)
        .map_err(|e| WireError::Body(e.to_string()))
}

/// Deserialize a reserved message body from payload bytes.
pub fn decode_body<T: DeserializeOwned>(payload: &[u8]) -> Result<T, WireError> {
    bincode::deserialize(payload).map_err(|e| WireError::Body(e.to_string()))
}
