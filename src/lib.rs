//! # promdb - Multi-Process Prometheus Metrics Store
//!
//! promdb lets a pool of cooperating worker processes (a pre-fork web
//! server, a job runner fleet) record Prometheus metrics independently and
//! lets a single exporter merge their contributions into one coherent
//! scrape, with no inter-process coordination on the hot path.
//!
//! Each process appends `(key -> f64)` entries to its own memory-mapped
//! files; the exporter reads every file in the shared directory and merges
//! samples with type-specific rules. The on-disk byte layout is the entire
//! cross-process protocol.
//!
//! ## Quick Start
//!
//! ```ignore
//! use promdb::{Counter, MultiprocessMode, Gauge};
//!
//! // In every worker:
//! let requests = Counter::new("http_requests_total", &["code"]);
//! requests.inc(&["200"]);
//!
//! let in_flight = Gauge::new("in_flight", &[], MultiprocessMode::Livesum);
//! in_flight.inc_by(&[], 1.0);
//!
//! // In the exporter:
//! let families = promdb::aggregate(&promdb::config::settings().files_dir)?;
//! let body = promdb::render_text(&families);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │  Instruments (Counter/Gauge/Hist/Summary) │
//! ├───────────────────────────────────────────┤
//! │  Registry (prefix -> dict, fork handling) │
//! ├───────────────────────────────────────────┤
//! │  MmapedDict (key -> value-offset index)   │
//! ├───────────────────────────────────────────┤
//! │  MmapedFile (mmap, growth, append)        │     write path, per process
//! ╞═══════════════════════════════════════════╡  ── shared directory ──
//! │  Aggregator (parse, merge, render)        │     scrape path, exporter
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! $prometheus_multiproc_dir/
//! ├── counter_1234-0.db          # counters written by pid 1234
//! ├── histogram_1234-0.db
//! ├── gauge_livesum_1234-0.db
//! ├── gauge_all_1235-0.db        # per-process gauge from pid 1235
//! └── summary_1235-0.db
//! ```
//!
//! Filenames carry the metric type, the gauge merge mode, and the writer's
//! pid; an advisory `flock` makes each file single-writer. Readers need
//! nothing but the directory.
//!
//! ## Module Overview
//!
//! - [`storage`]: mmapped files, entry codec, parser, path allocation
//! - [`registry`]: process-wide file registry and value stores
//! - [`metrics`]: metric types and recording instruments
//! - [`aggregate`]: scrape-side merge and text exposition
//! - [`keys`]: canonical JSON key codec
//! - [`config`]: shared directory, initial file size, pid provider

pub mod aggregate;
pub mod config;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod registry;
pub mod storage;

pub use aggregate::{aggregate, render_text, MetricFamily, Sample};
pub use config::{configure, Settings};
pub use error::StoreError;
pub use metrics::{
    Counter, Gauge, Histogram, MetricType, MultiprocessMode, Summary, DEFAULT_BUCKETS,
};
pub use registry::{
    reinitialize_on_pid_change, reset_and_reinitialize, sync_all, SimpleValue, Value, ValueStore,
};
