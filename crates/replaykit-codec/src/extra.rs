//! Fallback decoding for message codes that this build does not know.
//!
//! Codes below [`EXTENDED_CODE_BASE`] were assigned while bodies were
//! still written without a length, so an unknown one there cannot be
//! stepped over and the batch has to stop.  Codes at or above it are
//! length prefixed: `code, len, payload[len]`.

use crate::{FrameError, Message, Opaque, read_u64};
use std::io::Read;
use thiserror::Error;

/// First code of the generically framed range.
pub const EXTENDED_CODE_BASE: u64 = 256;

/// Upper bound on an opaque payload unless configured otherwise.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ExtraError {
    #[error("no decoder for message code {code}")]
    Unsupported { code: u64 },

    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtraDecoder {
    max_payload_len: usize,
}

impl Default for ExtraDecoder {
    fn default() -> Self {
        Self {
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

impl ExtraDecoder {
    pub fn new(max_payload_len: usize) -> Self {
        Self { max_payload_len }
    }

    /// Decode the remainder of a frame whose `code` the codec primitive
    /// did not recognize.  `r` must be positioned just after the code.
    pub fn decode_extra<R: Read>(&self, code: u64, r: &mut R) -> Result<Message, ExtraError> {
        if code < EXTENDED_CODE_BASE {
            return Err(ExtraError::Unsupported { code });
        }

        let len = read_u64(r)?;
        if len > self.max_payload_len as u64 {
            return Err(FrameError::PayloadTooLarge {
                code,
                len,
                limit: self.max_payload_len,
            }
            .into());
        }

        let mut payload = vec![0u8; len as usize];
        r.read_exact(&mut payload).map_err(FrameError::Io)?;
        metrics::histogram!("frame.opaque.size").record(len as f64);
        tracing::debug!(code, len, "decoded opaque message");

        Ok(Message::Opaque(Opaque { code, payload }))
    }
}
