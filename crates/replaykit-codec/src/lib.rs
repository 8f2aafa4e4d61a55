//! encode and decode the frames of a session-replay batch.
//! A batch is a plain concatenation of frames.  Each frame starts with
//! a message code, encoded as a leb128 variable length integer, which
//! tells us how to decode the rest of the frame.
//! Known messages follow the code with their fields, serialized in
//! declaration order with varbincode.  Those bodies have no length
//! prefix, so a reader that doesn't know a code cannot skip over it.
//! They are read back by the `body` module, which never trusts a
//! declared string length further than the input actually reaches.
//! Message types that are newer than this set are given codes from
//! `EXTENDED_CODE_BASE` upwards and always carry a length prefix; the
//! `extra` module consumes those so that an older decoder can still
//! read a batch produced by a newer tracker.

pub mod batch;
mod body;
pub mod extra;
pub mod legacy;

pub use batch::{BatchDecoder, DecodeError, read_batch};
pub use extra::{EXTENDED_CODE_BASE, ExtraDecoder, ExtraError};
pub use legacy::normalize;

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

/// Failure of the codec primitive to produce a message from the bytes
/// at the current position.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("reading frame: {0}")]
    Io(#[from] std::io::Error),

    #[error("leb128 value is too large")]
    Overflow,

    #[error("malformed {name} body: {reason}")]
    Body { name: &'static str, reason: String },

    #[error("payload for code {code} declares {len} bytes, limit is {limit}")]
    PayloadTooLarge { code: u64, len: u64, limit: usize },

    #[error("code {0} is outside the extended range and cannot be framed generically")]
    NotExtended(u64),
}

/// Read a single leb128 encoded value from the stream
fn read_u64<R: Read + ?Sized>(r: &mut R) -> Result<u64, FrameError> {
    leb128::read::unsigned(r).map_err(|err| match err {
        leb128::read::Error::IoError(ioerr) => FrameError::Io(ioerr),
        _ => FrameError::Overflow,
    })
}

fn write_u64<W: Write + ?Sized>(w: &mut W, value: u64) -> Result<(), FrameError> {
    leb128::write::unsigned(w, value)?;
    Ok(())
}

/// Reads the code that opens a frame.
/// `None` means that the input ended cleanly on a frame boundary;
/// running out of input part way through the code is an error.
fn read_code<R: Read>(r: &mut R) -> Result<Option<u64>, FrameError> {
    let mut first = [0u8; 1];
    loop {
        match r.read(&mut first) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    let mut rest = first.as_slice().chain(&mut *r);
    read_u64(&mut rest).map(Some)
}

fn deserialize<T: serde::de::DeserializeOwned, R: Read>(
    name: &'static str,
    r: &mut R,
) -> Result<T, FrameError> {
    let mut decode = body::BodyDeserializer::new(r);
    T::deserialize(&mut decode).map_err(|err| FrameError::Body {
        name,
        reason: err.to_string(),
    })
}

fn serialize<T: Serialize, W: Write>(
    name: &'static str,
    t: &T,
    w: &mut W,
) -> Result<(), FrameError> {
    let mut encode = varbincode::Serializer::new(w);
    t.serialize(&mut encode).map_err(|err| FrameError::Body {
        name,
        reason: err.to_string(),
    })
}

/// What the codec primitive found at the current position of a stream.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Message(Message),
    /// A code outside the known set.  The code itself has been consumed;
    /// the reader is positioned at whatever follows it.
    UnknownCode(u64),
    EndOfStream,
}

/// Decode the next frame from `r`.
pub fn read_message<R: Read>(r: &mut R) -> Result<ReadOutcome, FrameError> {
    let Some(code) = read_code(r)? else {
        return Ok(ReadOutcome::EndOfStream);
    };
    match Message::decode_body(code, r) {
        Some(decoded) => decoded.map(ReadOutcome::Message),
        None => Ok(ReadOutcome::UnknownCode(code)),
    }
}

macro_rules! messages {
    ($( $name:ident: $code:literal ),* $(,)?) => {
        /// A single session-replay message.
        /// The `Opaque` variant is never produced by `read_message`;
        /// it is how the extended decoder surfaces message types that
        /// are newer than this build.
        #[derive(Clone, PartialEq, Eq, Debug, Serialize)]
        #[serde(tag = "type")]
        pub enum Message {
            $(
                $name($name),
            )*
            Opaque(Opaque),
        }

        impl Message {
            pub fn code(&self) -> u64 {
                match self {
                    $(
                        Message::$name(_) => $code,
                    )*
                    Message::Opaque(opaque) => opaque.code,
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(
                        Message::$name(_) => stringify!($name),
                    )*
                    Message::Opaque(_) => "Opaque",
                }
            }

            /// Write this message as a single frame.
            pub fn encode<W: Write>(&self, mut w: W) -> Result<(), FrameError> {
                match self {
                    $(
                        Message::$name(body) => {
                            write_u64(&mut w, $code)?;
                            serialize(stringify!($name), body, &mut w)
                        }
                    )*
                    Message::Opaque(opaque) => opaque.encode(&mut w),
                }
            }

            /// `None` when `code` is not one of ours.
            fn decode_body<R: Read>(code: u64, r: &mut R) -> Option<Result<Message, FrameError>> {
                match code {
                    $(
                        $code => Some(deserialize(stringify!($name), r).map(Message::$name)),
                    )*
                    _ => None,
                }
            }

            /// Returns true if `code` belongs to a message type this build
            /// knows how to decode.
            pub fn is_known_code(code: u64) -> bool {
                matches!(code, $( $code )|*)
            }
        }

        $(
            impl From<$name> for Message {
                fn from(message: $name) -> Self {
                    Message::$name(message)
                }
            }
        )*
    };
}

// Each struct has an explicit code.  Codes of retired shapes stay
// reserved for their deprecated struct so that old batches keep decoding;
// see the `legacy` module for how those are upgraded.
messages! {
    Timestamp: 0,
    SessionStart: 1,
    SessionEndDeprecated: 3,
    SetPageLocation: 4,
    SetViewportSize: 5,
    FetchDeprecated: 21,
    ConsoleLog: 22,
    JsExceptionDeprecated: 25,
    CustomEvent: 27,
    AssetCache: 66,
    JsException: 78,
    BatchMeta: 80,
    NetworkRequest: 83,
    ErrorEvent: 90,
    IosBatchMeta: 107,
    SessionEnd: 126,
}

impl Message {
    /// The `(index, timestamp)` that a batch header seeds the decoder with.
    /// The high 32 bits of the index are the page number, so a page holds
    /// at most 2^32 messages.
    pub fn batch_seed(&self) -> Option<(u64, i64)> {
        match self {
            Message::BatchMeta(meta) => {
                Some(((meta.page_no << 32) | meta.first_index, meta.timestamp))
            }
            // iOS trackers have no pages
            Message::IosBatchMeta(meta) => Some((meta.first_index, meta.timestamp as i64)),
            _ => None,
        }
    }

    /// The new running timestamp, for messages that carry one.
    pub fn timestamp_update(&self) -> Option<i64> {
        match self {
            Message::Timestamp(Timestamp { timestamp })
            | Message::SessionStart(SessionStart { timestamp, .. })
            | Message::SessionEnd(SessionEnd { timestamp, .. }) => Some(*timestamp as i64),
            _ => None,
        }
    }
}

/// Index and timestamp assigned by the batch decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Meta {
    pub index: u64,
    pub timestamp: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AnnotatedMessage {
    pub meta: Meta,
    pub message: Message,
}

#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct Timestamp {
    pub timestamp: u64,
}

#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct SessionStart {
    pub timestamp: u64,
    pub project_id: u64,
    pub tracker_version: String,
    pub rev_id: String,
    pub user_uuid: String,
    pub user_agent: String,
}

/// Superseded by `SessionEnd`.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct SessionEndDeprecated {
    pub timestamp: u64,
}

#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct SessionEnd {
    pub timestamp: u64,
    pub encryption_key: String,
}

#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct SetPageLocation {
    pub url: String,
    pub referrer: String,
    pub navigation_start: u64,
}

#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct SetViewportSize {
    pub width: u64,
    pub height: u64,
}

/// Superseded by `NetworkRequest`.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct FetchDeprecated {
    pub method: String,
    pub url: String,
    pub request: String,
    pub response: String,
    pub status: u64,
    pub timestamp: u64,
    pub duration: u64,
}

#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct NetworkRequest {
    /// "fetch" or "xhr"
    pub kind: String,
    pub method: String,
    pub url: String,
    pub request: String,
    pub response: String,
    pub status: u64,
    pub timestamp: u64,
    pub duration: u64,
}

#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct ConsoleLog {
    pub level: String,
    pub value: String,
}

/// Superseded by `JsException`.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct JsExceptionDeprecated {
    pub name: String,
    pub message: String,
    pub payload: String,
}

#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct JsException {
    pub name: String,
    pub message: String,
    pub payload: String,
    pub metadata: String,
}

#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct CustomEvent {
    pub name: String,
    pub payload: String,
}

/// Asks the asset cacher to keep a copy of a page resource.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct AssetCache {
    pub url: String,
}

#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct ErrorEvent {
    pub message_id: u64,
    pub timestamp: u64,
    /// Where the error came from, e.g. "js_exception"
    pub source: String,
    pub name: String,
    pub message: String,
    /// Source specific JSON; for "js_exception" it is the stack trace.
    pub payload: String,
}

/// Batch header written by the web tracker.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct BatchMeta {
    pub page_no: u64,
    pub first_index: u64,
    pub timestamp: i64,
}

/// Batch header written by the iOS tracker.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct IosBatchMeta {
    pub timestamp: u64,
    pub length: u64,
    pub first_index: u64,
}

/// A generically framed message that this build has no type for.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct Opaque {
    pub code: u64,
    pub payload: Vec<u8>,
}

impl Opaque {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), FrameError> {
        if self.code < EXTENDED_CODE_BASE {
            return Err(FrameError::NotExtended(self.code));
        }
        write_u64(w, self.code)?;
        write_u64(w, self.payload.len() as u64)?;
        w.write_all(&self.payload)?;
        Ok(())
    }
}
