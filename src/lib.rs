//! # gputel
//!
//! GPU telemetry aggregation for terminal dashboards. gputel samples independent
//! hardware backends in the background and exposes their latest readings through a
//! small set of provider callbacks that never block on device I/O.
//!
//! ## Features
//!
//! - **Pluggable Backends**: AMD (sysfs), NVIDIA (NVML), Apple Silicon (IOKit via `ioreg`)
//! - **Atomic Snapshots**: readers see one complete sampling cycle, never a mix
//! - **Partial Failure**: per-device errors are reported next to the metrics that did work
//! - **Opt-in/Auto-detect**: force-enabled backends fail loudly, auto-detected ones stay quiet
//!
//! ## Quick Start
//!
//! ```no_run
//! use gputel::{registry, Config};
//! use std::collections::HashMap;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load()?;
//! let registry = registry::global();
//! registry.run_startup(&config.vars())?;
//!
//! let mut mems = HashMap::new();
//! let errors = registry.update_memory(&mut mems);
//! for (label, mem) in &mems {
//!     println!("{}: {:.1}% of {} MB", label, mem.used_percent, mem.total / 1024 / 1024);
//! }
//! for (label, err) in &errors {
//!     eprintln!("{}: {}", label, err);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Backends
//!
//! Anything implementing [`Backend`] can be run with [`sampler::launch`]:
//!
//! ```no_run
//! use gputel::{sampler, Backend, Provides, Registry, Result, Snapshot};
//! use std::time::Duration;
//!
//! struct Fixed;
//!
//! impl Backend for Fixed {
//!     fn key(&self) -> &'static str { "fixed" }
//!     fn provides(&self) -> Provides { Provides::ALL }
//!     fn sample(&self) -> Result<Snapshot> {
//!         let mut snapshot = Snapshot::new();
//!         snapshot.usage.insert("Fixed.0".to_string(), 42);
//!         Ok(snapshot)
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let registry = Registry::new();
//! sampler::launch(Fixed, Duration::from_secs(1), &registry)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod gpu;
pub mod registry;
pub mod sampler;
pub mod snapshot;
pub mod sysfs;

pub use config::{BackendVars, Config, Enablement, GeneralConfig};
pub use error::{Error, ErrorMap, Result};
pub use gpu::query::{DeviceReading, GpuQuery, QueryBackend};
pub use gpu::{Backend, BackendStatus, MemoryInfo, Provides};
pub use registry::Registry;
pub use sampler::Sampler;
pub use snapshot::{Snapshot, SnapshotCache};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
