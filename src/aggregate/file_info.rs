//! # Filename Metadata
//!
//! A `*.db` filename is the only metadata channel between writers and the
//! aggregator: `<type>(_<mode>)?_<pid>(-<n>)?.db`. The mode segment exists
//! only for gauges. The pid token is opaque and may itself contain
//! underscores (`puma_worker_3`), so everything past the fixed segments is
//! re-joined, and only a trailing `-<digits>` allocation counter is
//! stripped.

use std::path::{Path, PathBuf};

use eyre::{bail, eyre, Result};

use crate::metrics::{MetricType, MultiprocessMode};

/// Metadata recovered from one `*.db` path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    pub metric_type: MetricType,
    pub mode: Option<MultiprocessMode>,
    pub pid: String,
}

impl FileInfo {
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| eyre!("path '{}' has no UTF-8 filename", path.display()))?;

        let stem = name
            .strip_suffix(".db")
            .ok_or_else(|| eyre!("'{name}' is not a .db file"))?;

        let mut parts = stem.split('_');
        let metric_type: MetricType = parts
            .next()
            .ok_or_else(|| eyre!("'{name}' has no metric type segment"))?
            .parse()?;

        let mode = match metric_type {
            MetricType::Gauge => {
                let segment = parts
                    .next()
                    .ok_or_else(|| eyre!("gauge file '{name}' has no mode segment"))?;
                Some(segment.parse::<MultiprocessMode>()?)
            }
            _ => None,
        };

        let mut pid = parts.collect::<Vec<_>>().join("_");
        strip_allocation_counter(&mut pid);
        if pid.is_empty() {
            bail!("'{name}' has no pid segment");
        }

        Ok(FileInfo {
            path: path.to_path_buf(),
            metric_type,
            mode,
            pid,
        })
    }

    /// True when this file's samples keep their per-process identity.
    pub fn pid_significant(&self) -> bool {
        self.metric_type == MetricType::Gauge
            && self.mode.is_some_and(MultiprocessMode::pid_significant)
    }
}

/// Remove a trailing `-<digits>` from the last path segment; anything else
/// after a dash belongs to the pid token.
fn strip_allocation_counter(pid: &mut String) {
    if let Some(idx) = pid.rfind('-') {
        let suffix = &pid[idx + 1..];
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            pid.truncate(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(name: &str) -> Result<FileInfo> {
        FileInfo::from_path(Path::new(name))
    }

    #[test]
    fn counter_with_numeric_pid() {
        let info = parse("/tmp/metrics/counter_1234-0.db").unwrap();
        assert_eq!(info.metric_type, MetricType::Counter);
        assert_eq!(info.mode, None);
        assert_eq!(info.pid, "1234");
        assert!(!info.pid_significant());
    }

    #[test]
    fn gauge_carries_mode() {
        let info = parse("gauge_livesum_8423-1.db").unwrap();
        assert_eq!(info.metric_type, MetricType::Gauge);
        assert_eq!(info.mode, Some(MultiprocessMode::Livesum));
        assert_eq!(info.pid, "8423");
        assert!(!info.pid_significant());

        let info = parse("gauge_all_8423-1.db").unwrap();
        assert!(info.pid_significant());
    }

    #[test]
    fn pid_token_may_contain_underscores() {
        let info = parse("gauge_max_puma_worker_3-0.db").unwrap();
        assert_eq!(info.mode, Some(MultiprocessMode::Max));
        assert_eq!(info.pid, "puma_worker_3");

        let info = parse("summary_sidekiq_0_1.db").unwrap();
        assert_eq!(info.metric_type, MetricType::Summary);
        assert_eq!(info.pid, "sidekiq_0_1");
    }

    #[test]
    fn only_numeric_dash_suffix_is_stripped() {
        assert_eq!(parse("counter_worker-a.db").unwrap().pid, "worker-a");
        assert_eq!(parse("counter_worker-12.db").unwrap().pid, "worker");
        assert_eq!(parse("counter_worker-.db").unwrap().pid, "worker-");
        assert_eq!(parse("counter_w-1-2.db").unwrap().pid, "w-1");
    }

    #[test]
    fn malformed_names_are_rejected() {
        assert!(parse("counter_1234-0.txt").is_err());
        assert!(parse("exemplar_1234-0.db").is_err());
        assert!(parse("gauge_1234-0.db").is_err(), "gauge needs a mode");
        assert!(parse("counter.db").is_err(), "missing pid");
        assert!(parse("gauge_min.db").is_err(), "missing pid");
    }
}
