//! `replaykit decode`: print one batch as JSON lines.

use anyhow::Context;
use replaykit_codec::{AnnotatedMessage, BatchDecoder, ExtraDecoder};
use replaykit_core::config::Config;
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Raw batch file
    file: PathBuf,

    /// Timestamp for messages before the first timestamp-bearing one
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    initial_timestamp: i64,
}

fn print_batch<W: Write>(
    bytes: &[u8],
    decoder: BatchDecoder,
    out: &mut W,
) -> anyhow::Result<u64> {
    let mut write_error: Option<io::Error> = None;
    let decoded = decoder.decode(bytes, |message: AnnotatedMessage| {
        if write_error.is_some() {
            return;
        }
        let line = serde_json::to_writer(&mut *out, &message)
            .map_err(io::Error::from)
            .and_then(|()| out.write_all(b"\n"));
        if let Err(err) = line {
            write_error = Some(err);
        }
    });
    if let Some(err) = write_error {
        return Err(err).context("writing output");
    }
    out.flush().context("writing output")?;
    Ok(decoded?)
}

pub fn run(config: &Config, args: &Args) -> anyhow::Result<()> {
    let bytes =
        std::fs::read(&args.file).with_context(|| format!("reading {}", args.file.display()))?;
    let decoder = BatchDecoder::new()
        .with_initial_timestamp(args.initial_timestamp)
        .with_extra_decoder(ExtraDecoder::new(config.queue.max_opaque_payload));

    let mut stdout = io::stdout().lock();
    let delivered = print_batch(&bytes, decoder, &mut stdout)
        .with_context(|| format!("decoding {}", args.file.display()))?;
    tracing::debug!(delivered, file = %args.file.display(), "Batch decoded");
    Ok(())
}
