//! Error types for replaykit-core

use thiserror::Error;

pub use crate::queue::ConsumeError;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that stop the ingestion loop.
///
/// Configuration and logging setup fail before the loop exists and keep
/// their own types (`ConfigError`, `LogError`); cacher errors are reported
/// on the cacher's channel and never end the loop.
#[derive(Error, Debug)]
pub enum Error {
    /// Queue consumption errors, including batch decode failures
    #[error("Consume error: {0}")]
    Consume(#[from] ConsumeError),
}

impl Error {
    /// True when the error came out of the batch decoder, meaning the
    /// stream it was reading can no longer be trusted.
    #[must_use]
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, Self::Consume(ConsumeError::Decode { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replaykit_codec::DecodeError;

    #[test]
    fn decode_failures_are_recognized() {
        let err: Error = ConsumeError::Decode {
            session_id: 1,
            offset: 0,
            source: DecodeError::FramingViolation { index: 3 },
        }
        .into();
        assert!(err.is_decode_failure());
        assert!(err.to_string().contains("session 1"));

        let closed: Error = ConsumeError::Closed.into();
        assert!(!closed.is_decode_failure());
    }
}
