//! # Aggregation
//!
//! Turns a directory of per-process `*.db` files into metric families ready
//! for exposition. This is the scrape path: it runs in the exporter process,
//! opens every file read-only, and never coordinates with the writers — the
//! write-then-publish discipline in the storage layer is the only contract
//! between them.
//!
//! ## Merge Semantics
//!
//! Counters, histograms, and summaries sum across processes. Gauges merge
//! according to the mode baked into their filename:
//!
//! | mode            | merge                                    |
//! |-----------------|------------------------------------------|
//! | `min` / `max`   | min / max across processes               |
//! | `livesum`       | sum across processes                     |
//! | `all`/`liveall` | one sample per process, `pid` label kept |
//!
//! ## Failure Policy
//!
//! Aggregation is strictly best-effort. A file that cannot be opened,
//! parsed, or attributed contributes nothing and is logged at `warn`; a
//! torn tail within a file silently ends that file's entries (lenient
//! parsing); an entry whose key fails JSON validation is dropped alone. A
//! scrape only fails if the directory itself cannot be listed.

mod file_info;
mod text;

pub use file_info::FileInfo;
pub use text::render_text;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use tracing::warn;

use crate::keys::decode_key;
use crate::metrics::{MetricType, MultiprocessMode};
use crate::storage::{EntryIter, ParseMode, HEADER_SIZE};

/// One aggregated sample: exposition name, ordered labels, merged value.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

/// Everything exposed for one metric name.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    pub metric_type: MetricType,
    pub samples: Vec<Sample>,
}

/// Identity of a sample while merging. Labels are sorted by name, and the
/// pid is part of the identity only when the file's mode keeps processes
/// separate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SampleKey {
    metric: String,
    name: String,
    labels: Vec<(String, String)>,
    pid: Option<String>,
}

#[derive(Debug)]
struct Merged {
    metric_type: MetricType,
    mode: Option<MultiprocessMode>,
    value: f64,
}

impl Merged {
    fn merge(&mut self, incoming: f64) {
        match (self.metric_type, self.mode) {
            (MetricType::Gauge, Some(MultiprocessMode::Min)) => {
                self.value = self.value.min(incoming);
            }
            (MetricType::Gauge, Some(MultiprocessMode::Max)) => {
                self.value = self.value.max(incoming);
            }
            (MetricType::Gauge, Some(MultiprocessMode::Livesum)) => self.value += incoming,
            // Per-process samples never share a key across pids; a second
            // file from the same process supersedes the first.
            (MetricType::Gauge, _) => self.value = incoming,
            _ => self.value += incoming,
        }
    }
}

/// Aggregate every `*.db` file under `dir` into metric families, keyed and
/// ordered by metric name.
pub fn aggregate(dir: &Path) -> Result<BTreeMap<String, MetricFamily>> {
    let mut paths = Vec::new();
    let listing = std::fs::read_dir(dir)
        .wrap_err_with(|| format!("failed to list metrics directory '{}'", dir.display()))?;

    for dirent in listing {
        let path = dirent
            .wrap_err_with(|| format!("failed to list metrics directory '{}'", dir.display()))?
            .path();
        if path.extension().is_some_and(|ext| ext == "db") {
            paths.push(path);
        }
    }
    // Lexical order makes the scrape, including last-wins merges, stable.
    paths.sort();

    let mut merged: HashMap<SampleKey, Merged> = HashMap::new();
    for path in &paths {
        let info = match FileInfo::from_path(path) {
            Ok(info) => info,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unrecognized db file");
                continue;
            }
        };

        let buf = match read_file(path) {
            Ok(buf) => buf,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable db file");
                continue;
            }
        };

        merge_file(&info, &buf, &mut merged);
    }

    Ok(build_families(merged))
}

/// Read a file fully. Workers may append (and grow the file) between the
/// stat and the read; extra bytes are accepted, a short read is not.
fn read_file(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let expected = file.metadata()?.len() as usize;

    let mut buf = Vec::with_capacity(expected);
    let n = file.read_to_end(&mut buf)?;
    eyre::ensure!(
        n >= expected,
        "read {n} bytes of '{}', expected at least {expected}",
        path.display()
    );
    Ok(buf)
}

fn merge_file(info: &FileInfo, buf: &[u8], merged: &mut HashMap<SampleKey, Merged>) {
    if buf.len() < HEADER_SIZE {
        return;
    }

    let pid_significant = info.pid_significant();
    for entry in EntryIter::new(buf, ParseMode::Lenient) {
        // UNWRAP: lenient iteration never yields Err.
        let entry = entry.unwrap();

        let decoded = match decode_key(entry.key) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    path = %info.path.display(),
                    offset = entry.value_offset,
                    error = %e,
                    "dropping entry with invalid key"
                );
                continue;
            }
        };

        let mut labels: Vec<(String, String)> = decoded
            .labels()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        // Writers canonicalize, but nothing stops a foreign producer from
        // permuting label order; identity must not depend on it.
        labels.sort();

        let key = SampleKey {
            metric: decoded.metric_name().to_string(),
            name: decoded.sample_name().to_string(),
            labels,
            pid: pid_significant.then(|| info.pid.clone()),
        };

        merged
            .entry(key)
            .and_modify(|m| m.merge(entry.value))
            .or_insert(Merged {
                metric_type: info.metric_type,
                mode: info.mode,
                value: entry.value,
            });
    }
}

fn build_families(merged: HashMap<SampleKey, Merged>) -> BTreeMap<String, MetricFamily> {
    let mut entries: Vec<(SampleKey, Merged)> = merged.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut families = BTreeMap::new();
    for (key, value) in entries {
        let family = families
            .entry(key.metric.clone())
            .or_insert_with(|| MetricFamily {
                name: key.metric.clone(),
                help: "Multiprocess metric".to_string(),
                metric_type: value.metric_type,
                samples: Vec::new(),
            });

        if family.metric_type != value.metric_type {
            warn!(
                metric = %key.metric,
                "metric recorded under conflicting types; keeping {}",
                family.metric_type.as_str()
            );
            continue;
        }

        let mut labels = key.labels;
        if let Some(pid) = key.pid {
            labels.push(("pid".to_string(), pid));
        }

        family.samples.push(Sample {
            name: key.name,
            labels,
            value: value.value,
        });
    }

    families
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RawEntry;
    use tempfile::tempdir;

    fn write_db(dir: &Path, name: &str, entries: &[(&str, f64)]) {
        let mut buf = vec![0u8; HEADER_SIZE];
        for (key, value) in entries {
            let total = RawEntry::total_len(key.len()).unwrap();
            let start = buf.len();
            buf.resize(start + total, 0);
            RawEntry::write(&mut buf[start..], key.as_bytes(), *value).unwrap();
        }
        let used = buf.len() as u32;
        buf[..4].copy_from_slice(&used.to_le_bytes());
        std::fs::write(dir.join(name), buf).unwrap();
    }

    #[test]
    fn counters_sum_across_files() {
        let dir = tempdir().unwrap();
        write_db(
            dir.path(),
            "counter_A-0.db",
            &[
                (r#"["c","c",["a"],["1"]]"#, 1.0),
                (r#"["c","c",["a"],["2"]]"#, 1.0),
            ],
        );
        write_db(dir.path(), "counter_B-0.db", &[(r#"["c","c",["a"],["1"]]"#, 3.0)]);

        let families = aggregate(dir.path()).unwrap();
        let family = &families["c"];

        assert_eq!(family.metric_type, MetricType::Counter);
        assert_eq!(
            family.samples,
            vec![
                Sample {
                    name: "c".to_string(),
                    labels: vec![("a".to_string(), "1".to_string())],
                    value: 4.0,
                },
                Sample {
                    name: "c".to_string(),
                    labels: vec![("a".to_string(), "2".to_string())],
                    value: 1.0,
                },
            ]
        );
    }

    #[test]
    fn gauge_modes_merge_per_table() {
        let entries: &[(&str, f64)] = &[(r#"["g","g",[],[]]"#, 5.0)];
        let entries_b: &[(&str, f64)] = &[(r#"["g","g",[],[]]"#, 7.0)];

        for (mode, expected) in [("livesum", 12.0), ("max", 7.0), ("min", 5.0)] {
            let dir = tempdir().unwrap();
            write_db(dir.path(), &format!("gauge_{mode}_A-0.db"), entries);
            write_db(dir.path(), &format!("gauge_{mode}_B-0.db"), entries_b);

            let families = aggregate(dir.path()).unwrap();
            let samples = &families["g"].samples;
            assert_eq!(samples.len(), 1, "mode {mode}");
            assert_eq!(samples[0].value, expected, "mode {mode}");
            assert!(samples[0].labels.is_empty(), "mode {mode} drops pid");
        }
    }

    #[test]
    fn gauge_all_keeps_one_sample_per_pid() {
        let dir = tempdir().unwrap();
        write_db(dir.path(), "gauge_all_A-0.db", &[(r#"["g","g",[],[]]"#, 5.0)]);
        write_db(dir.path(), "gauge_all_B-0.db", &[(r#"["g","g",[],[]]"#, 7.0)]);

        let families = aggregate(dir.path()).unwrap();
        let samples = &families["g"].samples;

        assert_eq!(
            samples,
            &vec![
                Sample {
                    name: "g".to_string(),
                    labels: vec![("pid".to_string(), "A".to_string())],
                    value: 5.0,
                },
                Sample {
                    name: "g".to_string(),
                    labels: vec![("pid".to_string(), "B".to_string())],
                    value: 7.0,
                },
            ]
        );
    }

    #[test]
    fn label_permutations_merge_into_one_sample() {
        let dir = tempdir().unwrap();
        write_db(
            dir.path(),
            "counter_A-0.db",
            &[(r#"["c","c",["x","y"],["1","2"]]"#, 1.0)],
        );
        write_db(
            dir.path(),
            "counter_B-0.db",
            &[(r#"["c","c",["y","x"],["2","1"]]"#, 2.0)],
        );

        let families = aggregate(dir.path()).unwrap();
        let samples = &families["c"].samples;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 3.0);
        assert_eq!(
            samples[0].labels,
            vec![
                ("x".to_string(), "1".to_string()),
                ("y".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn invalid_keys_are_dropped_not_fatal() {
        let dir = tempdir().unwrap();
        write_db(
            dir.path(),
            "counter_A-0.db",
            &[(r#"not json"#, 1.0), (r#"["c","c",[],[]]"#, 2.0)],
        );

        let families = aggregate(dir.path()).unwrap();
        assert_eq!(families.len(), 1);
        assert_eq!(families["c"].samples[0].value, 2.0);
    }

    #[test]
    fn corrupt_file_does_not_poison_others() {
        let dir = tempdir().unwrap();
        write_db(dir.path(), "counter_A-0.db", &[(r#"["c","c",[],[]]"#, 1.0)]);
        std::fs::write(dir.path().join("counter_B-0.db"), b"\xff\xff\xff\xff garbage").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let families = aggregate(dir.path()).unwrap();
        assert_eq!(families["c"].samples[0].value, 1.0);
    }

    #[test]
    fn truncated_file_contributes_its_prefix() {
        let dir = tempdir().unwrap();
        write_db(
            dir.path(),
            "counter_A-0.db",
            &[(r#"["c","c",[],[]]"#, 1.0), (r#"["d","d",[],[]]"#, 2.0)],
        );

        let path = dir.path().join("counter_A-0.db");
        let full = std::fs::read(&path).unwrap();
        // Keep the header's `used` but chop the second entry's value.
        std::fs::write(&path, &full[..full.len() - 4]).unwrap();

        let families = aggregate(dir.path()).unwrap();
        assert!(families.contains_key("c"));
        assert!(!families.contains_key("d"));
    }

    #[test]
    fn empty_directory_aggregates_to_nothing() {
        let dir = tempdir().unwrap();
        assert!(aggregate(dir.path()).unwrap().is_empty());
    }
}
