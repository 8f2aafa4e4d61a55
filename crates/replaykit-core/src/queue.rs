//! Queue consumers feeding batches to the ingestion loop.
//!
//! A queue record is one batch from one session. Consumers hand every
//! message of the decoded batch to a callback together with the session id
//! and where the record came from. "Nothing available right now" is
//! [`ConsumeStatus::Idle`], not an error.
//!
//! Two consumers are provided:
//! - [`SpoolConsumer`] reads a spool stream of length-prefixed records
//!   (`session_id`, `len`, both leb128, then `len` payload bytes) and
//!   persists its committed byte offset so a restart resumes after it.
//! - [`ChannelConsumer`] takes records from a `crossbeam` channel.

use crossbeam::channel::{Receiver, TryRecvError};
use replaykit_codec::{AnnotatedMessage, BatchDecoder, DecodeError, ExtraDecoder};
use serde::Serialize;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::QueueConfig;

#[derive(Error, Debug)]
pub enum ConsumeError {
    /// The record's batch could not be decoded; the stream state for this
    /// session is unknown from here on.
    #[error("decoding batch for session {session_id} at offset {offset}")]
    Decode {
        session_id: u64,
        offset: u64,
        #[source]
        source: DecodeError,
    },

    #[error("record at offset {offset} is truncated")]
    Truncated { offset: u64 },

    #[error("record header at offset {offset} has an oversized leb128 value")]
    BadHeader { offset: u64 },

    #[error("offset file {path}: {reason}")]
    OffsetFile { path: PathBuf, reason: String },

    #[error("consumer is closed")]
    Closed,

    #[error("queue I/O: {0}")]
    Io(#[from] io::Error),
}

/// Where a consumed record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordMeta {
    pub topic: String,
    pub offset: u64,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeStatus {
    /// A record was decoded and `messages` were handed to the callback.
    Consumed { messages: u64 },
    /// A record over the size limit was dropped unread.
    Skipped { size: usize },
    /// No record is available yet.
    Idle,
    /// The queue has ended and will not produce more records.
    Exhausted,
}

pub trait MessageConsumer {
    /// Pull at most one record and feed its messages to `handler`.
    fn consume_next<F>(&mut self, handler: F) -> Result<ConsumeStatus, ConsumeError>
    where
        F: FnMut(u64, &AnnotatedMessage, &RecordMeta);

    fn commit(&mut self) -> Result<(), ConsumeError>;

    /// Commit and release the consumer. Later calls to `consume_next`
    /// fail with [`ConsumeError::Closed`]; closing twice is a no-op.
    fn close(&mut self) -> Result<(), ConsumeError>;
}

/// Settings shared by all consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub topic: String,
    pub message_size_limit: usize,
    pub commit_every: u64,
    pub max_opaque_payload: usize,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for ConsumerSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            topic: config.topic.clone(),
            message_size_limit: config.message_size_limit,
            commit_every: config.commit_every.max(1),
            max_opaque_payload: config.max_opaque_payload,
        }
    }
}

fn decode_record<F>(
    settings: &ConsumerSettings,
    session_id: u64,
    payload: &[u8],
    meta: &RecordMeta,
    handler: &mut F,
) -> Result<u64, ConsumeError>
where
    F: FnMut(u64, &AnnotatedMessage, &RecordMeta),
{
    let span = tracing::debug_span!("consume_record", session_id, offset = meta.offset);
    let _guard = span.enter();
    BatchDecoder::new()
        .with_extra_decoder(ExtraDecoder::new(settings.max_opaque_payload))
        .decode(payload, |message| handler(session_id, &message, meta))
        .map_err(|source| ConsumeError::Decode {
            session_id,
            offset: meta.offset,
            source,
        })
}

fn skip_oversized(topic: &str, offset: u64, size: usize, limit: usize) -> ConsumeStatus {
    tracing::warn!(topic, offset, size, limit, "Skipping record over the size limit");
    metrics::counter!("queue.records.skipped").increment(1);
    ConsumeStatus::Skipped { size }
}

/// Write one spool record.
pub fn write_spool_record<W: Write>(mut w: W, session_id: u64, payload: &[u8]) -> io::Result<()> {
    leb128::write::unsigned(&mut w, session_id)?;
    leb128::write::unsigned(&mut w, payload.len() as u64)?;
    w.write_all(payload)
}

/// Counts the bytes pulled through it.
struct Counted<'a, R> {
    inner: &'a mut R,
    count: u64,
}

impl<R: Read> Read for Counted<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

fn eof_is_truncation(err: io::Error, offset: u64) -> ConsumeError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ConsumeError::Truncated { offset }
    } else {
        ConsumeError::Io(err)
    }
}

/// Reads one leb128 header value. `None` means input ended before its
/// first byte.
fn read_header_value<R: Read>(r: &mut R, offset: u64) -> Result<Option<u64>, ConsumeError> {
    let mut first = [0u8; 1];
    loop {
        match r.read(&mut first) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    let mut rest = first.as_slice().chain(r);
    match leb128::read::unsigned(&mut rest) {
        Ok(value) => Ok(Some(value)),
        Err(leb128::read::Error::IoError(err)) => Err(eof_is_truncation(err, offset)),
        Err(_) => Err(ConsumeError::BadHeader { offset }),
    }
}

/// Consumer over a spool stream, such as a file or stdin.
pub struct SpoolConsumer<R> {
    reader: R,
    settings: ConsumerSettings,
    offset_file: Option<PathBuf>,
    /// Byte offset of the next record
    position: u64,
    committed: u64,
    uncommitted: u64,
    closed: bool,
}

impl<R> std::fmt::Debug for SpoolConsumer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpoolConsumer")
            .field("topic", &self.settings.topic)
            .field("position", &self.position)
            .field("committed", &self.committed)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<R: Read> SpoolConsumer<R> {
    /// Consume `reader` from its start, without persisting offsets.
    pub fn new(reader: R, settings: ConsumerSettings) -> Self {
        Self {
            reader,
            settings,
            offset_file: None,
            position: 0,
            committed: 0,
            uncommitted: 0,
            closed: false,
        }
    }

    /// Consume `reader`, resuming after the offset committed in
    /// `offset_file` if it exists. Commits are written back to it.
    pub fn open(
        reader: R,
        settings: ConsumerSettings,
        offset_file: Option<PathBuf>,
    ) -> Result<Self, ConsumeError> {
        let mut consumer = Self::new(reader, settings);
        let Some(path) = offset_file else {
            return Ok(consumer);
        };
        if let Some(offset) = read_offset_file(&path)? {
            let skipped = io::copy(&mut (&mut consumer.reader).take(offset), &mut io::sink())?;
            if skipped < offset {
                return Err(ConsumeError::OffsetFile {
                    path,
                    reason: format!("committed offset {offset} is past the end of the spool ({skipped} bytes)"),
                });
            }
            tracing::info!(offset, path = %path.display(), "Resuming spool after committed offset");
            consumer.position = offset;
            consumer.committed = offset;
        }
        consumer.offset_file = Some(path);
        Ok(consumer)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    fn record_done(&mut self, size: u64) -> Result<(), ConsumeError> {
        self.position += size;
        self.uncommitted += 1;
        if self.uncommitted >= self.settings.commit_every {
            self.commit()?;
        }
        Ok(())
    }
}

fn read_offset_file(path: &Path) -> Result<Option<u64>, ConsumeError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    text.trim()
        .parse()
        .map(Some)
        .map_err(|err: std::num::ParseIntError| ConsumeError::OffsetFile {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
}

fn write_offset_file(path: &Path, offset: u64) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, format!("{offset}\n"))?;
    std::fs::rename(&tmp, path)
}

impl<R: Read> MessageConsumer for SpoolConsumer<R> {
    fn consume_next<F>(&mut self, mut handler: F) -> Result<ConsumeStatus, ConsumeError>
    where
        F: FnMut(u64, &AnnotatedMessage, &RecordMeta),
    {
        if self.closed {
            return Err(ConsumeError::Closed);
        }
        let offset = self.position;
        let mut counted = Counted {
            inner: &mut self.reader,
            count: 0,
        };

        let Some(session_id) = read_header_value(&mut counted, offset)? else {
            return Ok(ConsumeStatus::Exhausted);
        };
        let len = read_header_value(&mut counted, offset)?
            .ok_or(ConsumeError::Truncated { offset })?;
        let size = usize::try_from(len).unwrap_or(usize::MAX);

        if size > self.settings.message_size_limit {
            let skipped = io::copy(&mut (&mut counted).take(len), &mut io::sink())?;
            if skipped < len {
                return Err(ConsumeError::Truncated { offset });
            }
            let consumed = counted.count;
            let status = skip_oversized(&self.settings.topic, offset, size, self.settings.message_size_limit);
            self.record_done(consumed)?;
            return Ok(status);
        }

        let mut payload = vec![0u8; size];
        counted
            .read_exact(&mut payload)
            .map_err(|err| eof_is_truncation(err, offset))?;
        let consumed = counted.count;

        let meta = RecordMeta {
            topic: self.settings.topic.clone(),
            offset,
            size,
        };
        let messages = decode_record(&self.settings, session_id, &payload, &meta, &mut handler)?;
        metrics::counter!("queue.records.consumed").increment(1);
        self.record_done(consumed)?;
        Ok(ConsumeStatus::Consumed { messages })
    }

    fn commit(&mut self) -> Result<(), ConsumeError> {
        if let Some(path) = &self.offset_file {
            write_offset_file(path, self.position)?;
        }
        tracing::debug!(offset = self.position, records = self.uncommitted, "Committed spool offset");
        self.committed = self.position;
        self.uncommitted = 0;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ConsumeError> {
        if self.closed {
            return Ok(());
        }
        self.commit()?;
        self.closed = true;
        tracing::info!(offset = self.committed, "Spool consumer closed");
        Ok(())
    }
}

/// A record handed to a [`ChannelConsumer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRecord {
    pub session_id: u64,
    pub payload: Vec<u8>,
}

/// Consumer over an in-process channel. Offsets count records.
#[derive(Debug)]
pub struct ChannelConsumer {
    records: Receiver<QueueRecord>,
    settings: ConsumerSettings,
    next_offset: u64,
    committed: u64,
    closed: bool,
}

impl ChannelConsumer {
    pub fn new(records: Receiver<QueueRecord>, settings: ConsumerSettings) -> Self {
        Self {
            records,
            settings,
            next_offset: 0,
            committed: 0,
            closed: false,
        }
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Skipped records count toward `commit_every` like consumed ones.
    fn record_done(&mut self) -> Result<(), ConsumeError> {
        if self.next_offset - self.committed >= self.settings.commit_every {
            self.commit()?;
        }
        Ok(())
    }
}

impl MessageConsumer for ChannelConsumer {
    fn consume_next<F>(&mut self, mut handler: F) -> Result<ConsumeStatus, ConsumeError>
    where
        F: FnMut(u64, &AnnotatedMessage, &RecordMeta),
    {
        if self.closed {
            return Err(ConsumeError::Closed);
        }
        let record = match self.records.try_recv() {
            Ok(record) => record,
            Err(TryRecvError::Empty) => return Ok(ConsumeStatus::Idle),
            Err(TryRecvError::Disconnected) => return Ok(ConsumeStatus::Exhausted),
        };
        let offset = self.next_offset;
        self.next_offset += 1;

        let size = record.payload.len();
        if size > self.settings.message_size_limit {
            let status = skip_oversized(
                &self.settings.topic,
                offset,
                size,
                self.settings.message_size_limit,
            );
            self.record_done()?;
            return Ok(status);
        }
        let meta = RecordMeta {
            topic: self.settings.topic.clone(),
            offset,
            size,
        };
        let messages =
            decode_record(&self.settings, record.session_id, &record.payload, &meta, &mut handler)?;
        metrics::counter!("queue.records.consumed").increment(1);
        self.record_done()?;
        Ok(ConsumeStatus::Consumed { messages })
    }

    fn commit(&mut self) -> Result<(), ConsumeError> {
        self.committed = self.next_offset;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ConsumeError> {
        if !self.closed {
            self.commit()?;
            self.closed = true;
        }
        Ok(())
    }
}
