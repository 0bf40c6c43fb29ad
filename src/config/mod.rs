//! # Process-Wide Configuration
//!
//! Settings shared by every metric and file in the process: where the `*.db`
//! files live, how large a fresh file starts out, and how the writing process
//! identifies itself in filenames and `pid` labels.
//!
//! ## Resolution Order
//!
//! 1. An explicit [`configure`] call, typically from application startup.
//! 2. The `prometheus_multiproc_dir` environment variable.
//! 3. A process-unique directory under the system temp dir.
//!
//! The settings are read lazily on first use and may be replaced wholesale
//! with [`configure`]; the registry picks up the new values after
//! `reset_and_reinitialize`. Changing settings mid-flight in a production
//! process is not supported, the hook exists for test suites.
//!
//! ## PID Provider
//!
//! The pid is a plain function pointer returning a token string, not a cached
//! value. Pre-fork servers often name workers (`puma_1`, `worker-3`) rather
//! than using raw OS pids, and the registry re-queries it on every write to
//! detect forks.

use std::path::PathBuf;
use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::storage::page_size;

/// Environment variable naming the shared metrics directory. The historical
/// name is kept so deployments can switch client libraries without config
/// changes.
pub const FILES_DIR_ENV: &str = "prometheus_multiproc_dir";

/// Returns the OS pid as a token string.
pub fn default_pid() -> String {
    std::process::id().to_string()
}

/// Process-wide settings for the multiprocess store.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding every worker's `*.db` files.
    pub files_dir: PathBuf,
    /// Starting size for a fresh file, rounded up to a page multiple.
    pub initial_file_size: usize,
    /// Callable producing the current process token.
    pub pid_provider: fn() -> String,
}

impl Settings {
    /// Build settings from the environment, falling back to a
    /// process-unique temp directory.
    pub fn from_env() -> Self {
        let files_dir = std::env::var_os(FILES_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::temp_dir().join(format!("promdb-{}", std::process::id()))
            });

        Settings {
            files_dir,
            initial_file_size: page_size(),
            pid_provider: default_pid,
        }
    }

    /// The configured initial file size rounded up to a whole page.
    pub fn initial_size_page_aligned(&self) -> usize {
        let page = page_size();
        let size = self.initial_file_size.max(page);
        size.div_ceil(page) * page
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_env()
    }
}

static SETTINGS: OnceLock<RwLock<Settings>> = OnceLock::new();

fn cell() -> &'static RwLock<Settings> {
    SETTINGS.get_or_init(|| RwLock::new(Settings::from_env()))
}

/// Replace the process-wide settings. Call before any metric writes; files
/// already open under the old settings keep their directory until the
/// registry is reset.
pub fn configure(settings: Settings) {
    *cell().write() = settings;
}

/// A snapshot of the current process-wide settings.
pub fn settings() -> Settings {
    cell().read().clone()
}
