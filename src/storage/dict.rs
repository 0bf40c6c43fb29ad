//! # Mmaped Dictionary
//!
//! `MmapedDict` gives one [`MmapedFile`] its dictionary semantics: an
//! in-memory index from key bytes to the absolute offset of the key's value
//! slot. The index is built with a single strict scan at open time and kept
//! exact thereafter, which is what makes key uniqueness hold: a write to a
//! known key becomes an in-place overwrite, anything else appends exactly
//! one new entry.
//!
//! The index is process-local and never shared: the writer owning the file
//! is the only process that consults it. Scraping processes re-parse the
//! file bytes instead.

use eyre::{Result, WrapErr};
use hashbrown::HashMap;

use crate::storage::{MmapedFile, ParseMode};

#[derive(Debug)]
pub struct MmapedDict {
    file: MmapedFile,
    index: HashMap<Vec<u8>, usize>,
}

impl MmapedDict {
    /// Wrap `file`, indexing every entry it already holds. A pre-existing
    /// file that fails the strict scan is unusable for writing: appends
    /// could collide with whatever occupies the tail, so the error
    /// propagates to the caller.
    pub fn new(file: MmapedFile) -> Result<Self> {
        let mut index = HashMap::new();

        for entry in file.entries(ParseMode::Strict) {
            let entry = entry.wrap_err_with(|| {
                format!("failed to index '{}'", file.path().display())
            })?;
            index.insert(entry.key.to_vec(), entry.value_offset);
        }

        Ok(Self { file, index })
    }

    /// Read the current value for `key`. An absent key is initialized to
    /// `0.0` and that entry persists, so a key observed once by a scrape
    /// stays observable.
    pub fn read_value(&mut self, key: &[u8]) -> Result<f64> {
        if let Some(&offset) = self.index.get(key) {
            return self.file.value_at(offset);
        }

        let offset = self.file.append_entry(key, 0.0)?;
        self.index.insert(key.to_vec(), offset);
        Ok(0.0)
    }

    /// Write `value` for `key`: in place when the key exists, as a fresh
    /// appended entry otherwise.
    pub fn write_value(&mut self, key: &[u8], value: f64) -> Result<()> {
        if let Some(&offset) = self.index.get(key) {
            return self.file.write_value_at(offset, value);
        }

        let offset = self.file.append_entry(key, value)?;
        self.index.insert(key.to_vec(), offset);
        Ok(())
    }

    /// Number of distinct keys in the file.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Flush the backing mapping, best effort.
    pub fn sync(&self) {
        self.file.sync();
    }

    pub fn file(&self) -> &MmapedFile {
        &self.file
    }
}
