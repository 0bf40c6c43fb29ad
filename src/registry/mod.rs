//! # Per-Process File Registry
//!
//! The process-wide map from file prefix (`counter`, `gauge_livesum`, ...)
//! to the open [`MmapedDict`] this process writes through. Created lazily on
//! the first write; guarded by a single mutex, which is the only lock on the
//! write path besides each value's own accumulator mutex.
//!
//! ## Fork Handling
//!
//! A pre-fork server imports metrics code in the parent, then forks. The
//! child must not keep writing to the parent's files: the registry compares
//! the pid provider's answer against the pid it last saw on every access and,
//! on a change, closes everything and reallocates under the new pid. The
//! `reset_and_reinitialize` variant does so unconditionally and exists for
//! test suites.
//!
//! ## Vanished Files
//!
//! When a write reports [`StoreError::FileVanished`] (an external reset
//! unlinked or truncated the file), the registry drops the dead dict and
//! retries once against a freshly allocated file. Anything else is logged by
//! the value layer and swallowed; a broken metric never takes down the
//! process.

use std::sync::OnceLock;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config;
use crate::error::StoreError;
use crate::metrics::{file_prefix, MetricType, MultiprocessMode};
use crate::storage::{MmapedDict, MmapedFile, PathAllocator};

#[derive(Debug)]
struct FileRegistry {
    pid: String,
    dicts: HashMap<String, MmapedDict>,
}

static REGISTRY: OnceLock<Mutex<FileRegistry>> = OnceLock::new();

fn registry() -> &'static Mutex<FileRegistry> {
    REGISTRY.get_or_init(|| {
        let settings = config::settings();
        Mutex::new(FileRegistry {
            pid: (settings.pid_provider)(),
            dicts: HashMap::new(),
        })
    })
}

impl FileRegistry {
    /// Close and reopen everything if the pid provider disagrees with the
    /// pid the open files were allocated under. No-op otherwise.
    fn check_pid(&mut self) {
        let pid = (config::settings().pid_provider)();
        if pid != self.pid {
            debug!(old = %self.pid, new = %pid, "pid change detected, reinitializing metric files");
            self.dicts.clear();
            self.pid = pid;
        }
    }

    fn dict(&mut self, prefix: &str) -> Result<&mut MmapedDict> {
        if !self.dicts.contains_key(prefix) {
            let settings = config::settings();
            let alloc = PathAllocator::acquire(&settings.files_dir, prefix, &self.pid)?;
            let file = MmapedFile::from_allocated(alloc, settings.initial_size_page_aligned())?;
            self.dicts.insert(prefix.to_string(), MmapedDict::new(file)?);
        }

        // UNWRAP: inserted above if missing.
        Ok(self.dicts.get_mut(prefix).unwrap())
    }
}

fn with_dict<T>(
    metric_type: MetricType,
    mode: Option<MultiprocessMode>,
    f: impl Fn(&mut MmapedDict) -> Result<T>,
) -> Result<T> {
    let prefix = file_prefix(metric_type, mode);
    let mut registry = registry().lock();
    registry.check_pid();

    let first = f(registry.dict(&prefix)?);
    match first {
        Err(e)
            if matches!(
                e.downcast_ref::<StoreError>(),
                Some(StoreError::FileVanished { .. })
            ) =>
        {
            warn!(prefix = %prefix, "metrics file vanished beneath writer, reallocating");
            registry.dicts.remove(&prefix);
            f(registry.dict(&prefix)?)
        }
        other => other,
    }
}

/// Write `value` under `key` in this process's file for the metric type.
pub fn write_value(
    metric_type: MetricType,
    mode: Option<MultiprocessMode>,
    key: &[u8],
    value: f64,
) -> Result<()> {
    with_dict(metric_type, mode, |dict| dict.write_value(key, value))
}

/// Read the current value under `key`, initializing an absent key to 0.0.
pub fn read_value(
    metric_type: MetricType,
    mode: Option<MultiprocessMode>,
    key: &[u8],
) -> Result<f64> {
    with_dict(metric_type, mode, |dict| dict.read_value(key))
}

/// Close and reallocate files if the process has forked since the last
/// write. Safe to call at any time.
pub fn reinitialize_on_pid_change() {
    let mut registry = registry().lock();
    registry.check_pid();
}

/// Unconditionally close every file and start over under the current pid
/// and settings. Test hook.
pub fn reset_and_reinitialize() {
    let mut registry = registry().lock();
    registry.dicts.clear();
    registry.pid = (config::settings().pid_provider)();
}

/// Flush every open file to disk, best effort.
pub fn sync_all() {
    let registry = registry().lock();
    for dict in registry.dicts.values() {
        dict.sync();
    }
}

/// Capability surface the metric instruments program against.
pub trait ValueStore {
    fn get(&self) -> f64;
    fn set(&self, value: f64);
    /// Add `by` and return the new value.
    fn increment(&self, by: f64) -> f64;
}

/// A process-local accumulator with no shared-file backing. Used where
/// multiprocess storage is disabled or a value never needs exporting.
#[derive(Debug, Default)]
pub struct SimpleValue {
    value: Mutex<f64>,
}

impl ValueStore for SimpleValue {
    fn get(&self) -> f64 {
        *self.value.lock()
    }

    fn set(&self, value: f64) {
        *self.value.lock() = value;
    }

    fn increment(&self, by: f64) -> f64 {
        let mut value = self.value.lock();
        *value += by;
        *value
    }
}

/// A value backed by this process's mmapped file for its metric type. The
/// key is encoded once; every operation resolves the dict through the
/// registry so the handle survives forks and file reallocation.
///
/// Storage errors are logged and swallowed here: a metric keeps working
/// in-process even when its file does not.
#[derive(Debug)]
pub struct MmapedValue {
    metric_type: MetricType,
    mode: Option<MultiprocessMode>,
    key: Vec<u8>,
    /// Serializes read-modify-write cycles on this accumulator.
    lock: Mutex<()>,
}

impl MmapedValue {
    pub fn new(metric_type: MetricType, mode: Option<MultiprocessMode>, key: Vec<u8>) -> Self {
        MmapedValue {
            metric_type,
            mode,
            key,
            lock: Mutex::new(()),
        }
    }

    fn report(&self, err: eyre::Report) {
        warn!(
            metric_type = self.metric_type.as_str(),
            error = %err,
            "metric write failed; value dropped"
        );
    }
}

impl ValueStore for MmapedValue {
    fn get(&self) -> f64 {
        let _guard = self.lock.lock();
        match read_value(self.metric_type, self.mode, &self.key) {
            Ok(value) => value,
            Err(e) => {
                self.report(e);
                0.0
            }
        }
    }

    fn set(&self, value: f64) {
        let _guard = self.lock.lock();
        if let Err(e) = write_value(self.metric_type, self.mode, &self.key, value) {
            self.report(e);
        }
    }

    fn increment(&self, by: f64) -> f64 {
        let _guard = self.lock.lock();
        let current = match read_value(self.metric_type, self.mode, &self.key) {
            Ok(value) => value,
            Err(e) => {
                self.report(e);
                return 0.0;
            }
        };

        let next = current + by;
        if let Err(e) = write_value(self.metric_type, self.mode, &self.key, next) {
            self.report(e);
        }
        next
    }
}

/// A value that is either process-local or shared through the mmap layer.
/// The instruments use [`MmapedValue`] directly; this sum type is the seam
/// for embedders that select storage at runtime.
#[derive(Debug)]
pub enum Value {
    Simple(SimpleValue),
    Mmap(MmapedValue),
}

impl ValueStore for Value {
    fn get(&self) -> f64 {
        match self {
            Value::Simple(v) => v.get(),
            Value::Mmap(v) => v.get(),
        }
    }

    fn set(&self, value: f64) {
        match self {
            Value::Simple(v) => v.set(value),
            Value::Mmap(v) => v.set(value),
        }
    }

    fn increment(&self, by: f64) -> f64 {
        match self {
            Value::Simple(v) => v.increment(by),
            Value::Mmap(v) => v.increment(by),
        }
    }
}
