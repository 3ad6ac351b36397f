//! Periodic background sampling
//!
//! Each running backend owns one [`Sampler`]: a named thread that calls a tick
//! function at a fixed rate until stopped. Ticks that overrun the interval are not
//! queued up; the next tick is scheduled one interval after the late one finished.

use crate::error::{Error, Result};
use crate::gpu::{Backend, BackendStatus};
use crate::registry::Registry;
use crate::snapshot::SnapshotCache;
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Handle to a background sampling thread
#[derive(Debug)]
pub struct Sampler {
    name: String,
    interval: Duration,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sampler {
    /// Start calling `tick` every `interval` on a thread named `<name>-sampler`.
    ///
    /// The first tick runs one interval after spawning.
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(format!("{}-sampler", name))
            .spawn(move || {
                let mut next = Instant::now() + interval;
                loop {
                    let wait = next.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        // Explicit stop or handle dropped
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    tick();

                    next += interval;
                    let now = Instant::now();
                    if next <= now {
                        next = now + interval;
                    }
                }
            })?;

        Ok(Self {
            name: name.to_string(),
            interval,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True until the thread has exited
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Signal the thread and wait for the in-flight tick to finish
    pub fn stop(mut self) {
        self.signal();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("{} sampler panicked", self.name);
            }
        }
    }

    fn signal(&mut self) {
        // Dropping the sender wakes the thread with `Disconnected`
        self.stop_tx.take();
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.signal();
    }
}

/// Start a backend: take the first snapshot synchronously, then sample every
/// `interval` and hook the cache up to the registry's providers.
pub fn launch<B: Backend>(backend: B, interval: Duration, registry: &Registry) -> Result<()> {
    let key = backend.key();
    let provides = backend.provides();
    registry.set_status(key, BackendStatus::Initializing);

    let backend = Arc::new(backend);
    let cache = Arc::new(SnapshotCache::new(key));
    cache.refresh(backend.as_ref());

    let sampler = {
        let backend = Arc::clone(&backend);
        let cache = Arc::clone(&cache);
        Sampler::spawn(key, interval, move || cache.refresh(backend.as_ref()))
            .map_err(|source| Error::Spawn {
                key: key.to_string(),
                source,
            })?
    };

    if provides.temperature {
        let cache = Arc::clone(&cache);
        registry.register_temperature(move |out| cache.copy_temperatures(out));
    }
    if provides.memory {
        let cache = Arc::clone(&cache);
        registry.register_memory(move |out| cache.copy_memory(out));
    }
    if provides.usage {
        let cache = Arc::clone(&cache);
        registry.register_usage(move |out, _per_device| cache.copy_usage(out));
    }

    let devices = cache.load().labels().len();
    registry.attach(key, cache, sampler);
    log::info!(
        "{} backend running: {} device label(s), refresh every {:?}",
        key,
        devices,
        interval
    );
    Ok(())
}
