//! The assets ingestion loop.
//!
//! Single threaded and cooperative: each iteration polls, in order, the
//! shutdown flag, the cacher's error channel and the maintenance ticker,
//! none of them blocking, and only when all three are quiet pulls one
//! record from the queue. Shutdown and maintenance therefore wait at most
//! one record, never for the queue to deliver.

use crossbeam::channel::{self, Receiver};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::Result;
use crate::assets::AssetHandler;
use crate::cacher::{AssetCacher, CacheError};
use crate::config::Config;
use crate::queue::{ConsumeStatus, MessageConsumer};

/// Flag raised by SIGINT or SIGTERM.
pub fn register_shutdown_signals() -> io::Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))?;
    }
    Ok(shutdown)
}

/// What one loop iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Shutdown,
    CacheError(CacheError),
    Maintenance,
    Consumed(ConsumeStatus),
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Termination was requested.
    Signalled,
    /// The queue ran out of records.
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings {
    pub maintenance_interval: Duration,
    pub idle_backoff: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ServiceSettings {
    fn from(config: &Config) -> Self {
        Self {
            maintenance_interval: config.cache.maintenance_interval(),
            idle_backoff: config.queue.idle_backoff(),
        }
    }
}

pub struct AssetService<Q, C> {
    consumer: Q,
    handler: AssetHandler<C>,
    cache_errors: Receiver<CacheError>,
    maintenance: Receiver<Instant>,
    shutdown: Arc<AtomicBool>,
    idle_backoff: Duration,
}

impl<Q, C> std::fmt::Debug for AssetService<Q, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetService")
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .field("idle_backoff", &self.idle_backoff)
            .finish_non_exhaustive()
    }
}

impl<Q: MessageConsumer, C: AssetCacher> AssetService<Q, C> {
    pub fn new(consumer: Q, cacher: C, shutdown: Arc<AtomicBool>, settings: ServiceSettings) -> Self {
        let cache_errors = cacher.errors();
        Self {
            consumer,
            handler: AssetHandler::new(cacher),
            cache_errors,
            maintenance: channel::tick(settings.maintenance_interval),
            shutdown,
            idle_backoff: settings.idle_backoff,
        }
    }

    /// Replace the maintenance ticker, e.g. with a channel driven by hand.
    #[must_use]
    pub fn with_maintenance_ticks(mut self, ticks: Receiver<Instant>) -> Self {
        self.maintenance = ticks;
        self
    }

    pub fn consumer(&self) -> &Q {
        &self.consumer
    }

    pub fn cacher(&self) -> &C {
        self.handler.cacher()
    }

    /// Run one iteration of the loop.
    pub fn step(&mut self) -> Result<Step> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(Step::Shutdown);
        }
        if let Ok(error) = self.cache_errors.try_recv() {
            tracing::warn!(error = %error, "Error while caching");
            return Ok(Step::CacheError(error));
        }
        if self.maintenance.try_recv().is_ok() {
            self.handler.cacher_mut().update_timeouts();
            return Ok(Step::Maintenance);
        }

        let handler = &mut self.handler;
        let status = self
            .consumer
            .consume_next(|session_id, message, _meta| handler.handle(session_id, message))?;
        Ok(Step::Consumed(status))
    }

    /// Loop until shutdown is requested or the queue is drained. A
    /// consume error ends the loop without committing.
    pub fn run(&mut self) -> Result<Exit> {
        tracing::info!("Cacher service started");
        loop {
            match self.step()? {
                Step::Shutdown => {
                    tracing::info!("Caught termination signal, stopping");
                    self.consumer.close()?;
                    return Ok(Exit::Signalled);
                }
                Step::Consumed(ConsumeStatus::Exhausted) => {
                    tracing::info!("Queue drained, stopping");
                    self.consumer.close()?;
                    return Ok(Exit::Drained);
                }
                Step::Consumed(ConsumeStatus::Idle) => std::thread::sleep(self.idle_backoff),
                Step::Consumed(_) | Step::CacheError(_) | Step::Maintenance => {}
            }
        }
    }
}
