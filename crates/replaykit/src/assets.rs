//! `replaykit assets`: the ingestion loop over a spool.

use anyhow::Context;
use crossbeam::channel::Receiver;
use replaykit_core::cacher::{AssetJob, CacheSettings, LocalCacher};
use replaykit_core::config::Config;
use replaykit_core::queue::{ConsumerSettings, SpoolConsumer};
use replaykit_core::service::{AssetService, Exit, ServiceSettings, register_shutdown_signals};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Spool of queue records to consume, `-` for stdin
    #[arg(long)]
    spool: PathBuf,

    /// Persist committed offsets here and resume from them
    #[arg(long)]
    offset_file: Option<PathBuf>,

    /// Append planned asset jobs to this JSON-lines file
    #[arg(long)]
    manifest: Option<PathBuf>,
}

fn open_spool(path: &Path) -> io::Result<Box<dyn Read>> {
    if path == Path::new("-") {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    Ok(Box::new(BufReader::new(File::open(path)?)))
}

/// Write jobs as JSON lines until the cacher goes away.
fn write_jobs<W: Write>(jobs: &Receiver<AssetJob>, mut out: W) -> io::Result<u64> {
    let mut written = 0;
    for job in jobs {
        serde_json::to_writer(&mut out, &job)?;
        out.write_all(b"\n")?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}

fn spawn_job_sink(
    jobs: Receiver<AssetJob>,
    manifest: Option<PathBuf>,
) -> io::Result<std::thread::JoinHandle<io::Result<u64>>> {
    let manifest = manifest
        .map(|path| OpenOptions::new().create(true).append(true).open(path))
        .transpose()?;
    std::thread::Builder::new()
        .name("asset-jobs".into())
        .spawn(move || match manifest {
            Some(file) => write_jobs(&jobs, BufWriter::new(file)),
            None => {
                let mut logged = 0;
                for job in &jobs {
                    tracing::info!(key = %job.key, url = %job.url, session_id = ?job.session_id, "Asset job");
                    logged += 1;
                }
                Ok(logged)
            }
        })
}

pub fn run(mut config: Config, args: Args) -> anyhow::Result<()> {
    if args.offset_file.is_some() {
        config.queue.offset_file = args.offset_file;
    }
    if args.manifest.is_some() {
        config.cache.manifest_path = args.manifest;
    }

    let shutdown = register_shutdown_signals().context("registering signal handlers")?;
    let spool = open_spool(&args.spool)
        .with_context(|| format!("opening spool {}", args.spool.display()))?;
    let consumer = SpoolConsumer::open(
        spool,
        ConsumerSettings::from(&config.queue),
        config.queue.offset_file.clone(),
    )?;
    let (cacher, jobs) = LocalCacher::new(CacheSettings::from(&config.cache));
    let sink = spawn_job_sink(jobs, config.cache.manifest_path.clone())
        .context("starting asset job writer")?;

    let mut service = AssetService::new(
        consumer,
        cacher,
        shutdown,
        ServiceSettings::from(&config),
    );
    let outcome = service.run();
    // dropping the cacher closes the job channel and lets the sink finish
    drop(service);
    let written = sink
        .join()
        .map_err(|_| anyhow::anyhow!("asset job writer panicked"))?
        .context("writing asset jobs")?;

    match outcome? {
        Exit::Signalled => tracing::info!(jobs = written, "Terminated by signal"),
        Exit::Drained => tracing::info!(jobs = written, "Spool drained"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    #[test]
    fn jobs_are_written_as_json_lines() {
        let (tx, rx) = channel::unbounded();
        tx.send(AssetJob {
            key: "1/abc".into(),
            url: "https://a/x.css".into(),
            session_id: Some(1),
        })
        .unwrap();
        drop(tx);

        let mut out = Vec::new();
        assert_eq!(write_jobs(&rx, &mut out).unwrap(), 1);
        let line = String::from_utf8(out).unwrap();
        assert_eq!(
            line,
            "{\"key\":\"1/abc\",\"url\":\"https://a/x.css\",\"session_id\":1}\n"
        );
    }
}
