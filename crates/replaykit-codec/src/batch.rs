//! Turns a batch byte stream into annotated messages.
//!
//! Messages on the wire carry neither an index nor (mostly) a timestamp.
//! A batch may open with a header that seeds both; after that every
//! message takes the next index and the most recent timestamp seen in
//! the stream.  Index layout is `page << 32 | position`, so indices stay
//! ordered across pages and re-deliveries.

use crate::extra::{ExtraDecoder, ExtraError};
use crate::{AnnotatedMessage, FrameError, Meta, ReadOutcome, legacy, read_message};
use std::io::Read;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    /// A batch header showed up after the batch had already started.
    #[error("batch header found at index {index}, after the start of the batch")]
    FramingViolation { index: u64 },

    #[error("malformed frame at message index {index}")]
    MalformedFrame {
        index: u64,
        #[source]
        source: FrameError,
    },

    #[error("unsupported message code {code} at message index {index}")]
    UnsupportedMessage { index: u64, code: u64 },
}

impl DecodeError {
    /// The running index at which decoding stopped.
    pub fn index(&self) -> u64 {
        match self {
            Self::FramingViolation { index }
            | Self::MalformedFrame { index, .. }
            | Self::UnsupportedMessage { index, .. } => *index,
        }
    }
}

/// State for a single pass over one batch.
///
/// `decode` consumes the decoder, so nothing carries over from one
/// batch to the next.
#[derive(Debug, Default)]
pub struct BatchDecoder {
    index: u64,
    timestamp: i64,
    extra: ExtraDecoder,
}

impl BatchDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp stamped on messages that precede any timestamp-bearing
    /// message (and on everything, if the batch has none).
    #[must_use]
    pub fn with_initial_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_extra_decoder(mut self, extra: ExtraDecoder) -> Self {
        self.extra = extra;
        self
    }

    /// Decode frames from `r` until it is exhausted, handing each message
    /// to `on_message` in stream order.  Returns the number of messages
    /// delivered.
    ///
    /// Only a clean end of input finishes a batch.  Any error leaves the
    /// messages already delivered in place; the caller cannot resume the
    /// batch because the running index is no longer trustworthy.
    pub fn decode<R, F>(mut self, mut r: R, mut on_message: F) -> Result<u64, DecodeError>
    where
        R: Read,
        F: FnMut(AnnotatedMessage),
    {
        let span = tracing::debug_span!("decode_batch", delivered = tracing::field::Empty);
        let _guard = span.enter();
        let mut delivered = 0u64;

        loop {
            let message = match read_message(&mut r) {
                Ok(ReadOutcome::EndOfStream) => break,
                Ok(ReadOutcome::Message(message)) => message,
                Ok(ReadOutcome::UnknownCode(code)) => {
                    match self.extra.decode_extra(code, &mut r) {
                        Ok(message) => message,
                        Err(ExtraError::Unsupported { code }) => {
                            return Err(DecodeError::UnsupportedMessage {
                                index: self.index,
                                code,
                            });
                        }
                        Err(ExtraError::Frame(source)) => {
                            return Err(DecodeError::MalformedFrame {
                                index: self.index,
                                source,
                            });
                        }
                    }
                }
                Err(source) => {
                    return Err(DecodeError::MalformedFrame {
                        index: self.index,
                        source,
                    });
                }
            };
            let message = legacy::normalize(message);

            let is_header = if let Some((index, timestamp)) = message.batch_seed() {
                // Several headers in a row at the very start are fine
                if self.index != 0 {
                    return Err(DecodeError::FramingViolation { index: self.index });
                }
                self.index = index;
                self.timestamp = timestamp;
                true
            } else {
                if let Some(timestamp) = message.timestamp_update() {
                    self.timestamp = timestamp;
                }
                false
            };

            on_message(AnnotatedMessage {
                meta: Meta {
                    index: self.index,
                    timestamp: self.timestamp,
                },
                message,
            });
            delivered += 1;

            // The tracker does not count headers, so they share the index
            // of the message that follows them.
            if !is_header {
                self.index = self.index.wrapping_add(1);
            }
        }

        span.record("delivered", delivered);
        metrics::histogram!("batch.messages").record(delivered as f64);
        Ok(delivered)
    }
}

/// Decode one batch with default settings.
pub fn read_batch<R, F>(r: R, on_message: F) -> Result<u64, DecodeError>
where
    R: Read,
    F: FnMut(AnnotatedMessage),
{
    BatchDecoder::new().decode(r, on_message)
}
