//! # Memory-Mapped Dictionary File
//!
//! `MmapedFile` owns one `*.db` file and its read/write shared mapping. It
//! implements the append and overwrite protocols on top of the raw entry
//! codec, grows the file by doubling when an append does not fit, and
//! guarantees teardown (munmap, lock release) on every exit path via `Drop`.
//!
//! ## Write Protocol
//!
//! Appends are write-then-publish: the length prefix, key, padding, and
//! value are all written into the reserved region past `used`, and only then
//! is `used` advanced with a release store. A concurrent reader either sees
//! the old `used` (entry invisible) or the new one (entry complete). There
//! is no step at which a reader can observe a partial entry.
//!
//! Overwrites of an existing value slot are single aligned 8-byte atomic
//! stores. A byte-wise copy could tear under a concurrent scrape; an aligned
//! store cannot on the targets this crate supports.
//!
//! ## Growth
//!
//! Growth doubles the file length until the pending entry fits, extends the
//! file with `ftruncate`, and replaces the mapping. Entry offsets never
//! move, and the file is never shrunk, so stale read-only mappings held by
//! scraping processes stay valid for every entry they could already see.
//!
//! ## Vanished Files
//!
//! An external reset may unlink or truncate a file while its writer lives.
//! Every write re-checks the file metadata first and reports
//! `StoreError::FileVanished` instead of faulting on the dead mapping. The
//! registry reacts by reallocating a fresh file on the next write.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};
use tracing::warn;

use crate::error::StoreError;
use crate::storage::{
    file_header, round_to_page, AllocatedPath, EntryIter, ParseMode, PathAllocator, RawEntry,
    HEADER_SIZE, MINIMUM_SIZE,
};

#[derive(Debug)]
pub struct MmapedFile {
    file: File,
    path: PathBuf,
    map: MmapMut,
    /// Mapped length; always equals the file length and a page multiple.
    len: usize,
}

impl MmapedFile {
    /// Open `path`, creating it if missing. A file smaller than
    /// [`MINIMUM_SIZE`] is extended to `initial_size`; anything larger is
    /// rounded up to the next page multiple. The whole file is mapped
    /// shared, read/write.
    pub fn open(path: &Path, initial_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open metrics file '{}'", path.display()))?;

        Self::from_file(file, path.to_path_buf(), initial_size)
    }

    /// Wrap a path already claimed by the [`PathAllocator`], reusing its
    /// locked handle so the advisory lock lives exactly as long as the
    /// mapping.
    pub fn from_allocated(alloc: AllocatedPath, initial_size: usize) -> Result<Self> {
        Self::from_file(alloc.file, alloc.path, initial_size)
    }

    fn from_file(file: File, path: PathBuf, initial_size: usize) -> Result<Self> {
        let metadata = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?;

        let size = metadata.len() as usize;
        let target = if size < MINIMUM_SIZE {
            round_to_page(initial_size.max(MINIMUM_SIZE))
        } else {
            round_to_page(size)
        };

        // Extend only. Shrinking would invalidate offsets held by readers.
        if target > size {
            file.set_len(target as u64)
                .wrap_err_with(|| format!("failed to extend '{}' to {target} bytes", path.display()))?;
        }

        // SAFETY: mapping a file we hold open read/write. Another process
        // mutating the file is part of the design: the format confines
        // concurrent writes to the single writer holding the advisory lock,
        // and all access below stays within `len`, which only grows.
        let map = unsafe { MmapOptions::new().len(target).map_mut(&file) }
            .wrap_err_with(|| format!("failed to mmap '{}'", path.display()))?;

        Ok(Self {
            file,
            path,
            map,
            len: target,
        })
    }

    /// The published data length from the header.
    pub fn used(&self) -> Result<u32> {
        Ok(file_header(&self.map)?.used())
    }

    /// Current mapped (and file) length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.used().map(|u| u as usize <= HEADER_SIZE).unwrap_or(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lazy entry sequence over the mapped bytes.
    pub fn entries(&self, mode: ParseMode) -> EntryIter<'_> {
        EntryIter::new(&self.map, mode)
    }

    /// Read the value slot at `offset` with a single aligned load.
    pub fn value_at(&self, offset: usize) -> Result<f64> {
        // A truncated file faults on access, not just on write; reads get
        // the same recoverable error instead.
        self.check_live()?;
        self.check_value_offset(offset)?;

        // SAFETY: offset is 8-aligned and offset + 8 <= len, so the pointer
        // covers a valid, aligned AtomicU64 inside the mapping.
        let bits = unsafe {
            let ptr = self.map.as_ptr().add(offset) as *const AtomicU64;
            (*ptr).load(Ordering::Relaxed)
        };
        Ok(f64::from_bits(u64::from_le(bits)))
    }

    /// Overwrite the value slot at `offset` in place. A single aligned
    /// 8-byte store; never moves the entry, never touches `used`.
    pub fn write_value_at(&mut self, offset: usize, value: f64) -> Result<()> {
        self.check_live()?;
        self.check_value_offset(offset)?;

        // Stored as the little-endian bit pattern so the on-disk layout is
        // identical on every target.
        // SAFETY: as for value_at; the mapping is writable.
        unsafe {
            let ptr = self.map.as_ptr().add(offset) as *const AtomicU64;
            (*ptr).store(value.to_bits().to_le(), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Append a new entry, growing the file if needed. Returns the absolute
    /// offset of the value slot. The caller is responsible for key
    /// uniqueness; the file format stores whatever it is given.
    pub fn append_entry(&mut self, key: &[u8], value: f64) -> Result<usize> {
        self.check_live()?;

        let used = self.used()? as usize;
        let total = RawEntry::total_len(key.len())?;
        ensure!(
            used >= HEADER_SIZE && used <= self.len,
            StoreError::out_of_bounds(used, self.len)
        );
        // Entries start on 8-byte boundaries; a header claiming otherwise
        // was not written by this format.
        ensure!(
            used % 8 == 0,
            StoreError::parse(used, "published length is not 8-byte aligned")
        );

        let new_used = used + total;
        if new_used > self.len {
            self.grow(new_used)?;
        }

        RawEntry::write(&mut self.map[used..new_used], key, value)?;

        // Publish after the entry bytes are in place; the release store
        // pairs with readers scanning up to the `used` they observe.
        self.publish_used(new_used as u32);

        Ok(new_used - 8)
    }

    /// Flush the mapping to disk. Best effort: scrapes read whatever the
    /// page cache holds, so a failed msync costs durability, not
    /// correctness.
    pub fn sync(&self) {
        if let Err(e) = self.map.flush() {
            warn!(path = %self.path.display(), error = %e, "msync of metrics file failed");
        }
    }

    /// Detect the backing file being unlinked or truncated by another
    /// process. Writing through the mapping afterwards would at best be
    /// lost and at worst fault, so writers bail out with a recoverable
    /// error instead.
    pub fn check_live(&self) -> Result<()> {
        let metadata = self
            .file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", self.path.display()))?;

        use std::os::unix::fs::MetadataExt;
        ensure!(
            metadata.nlink() > 0 && metadata.len() as usize >= self.len,
            StoreError::vanished(&self.path)
        );
        Ok(())
    }

    fn check_value_offset(&self, offset: usize) -> Result<()> {
        ensure!(
            offset >= HEADER_SIZE && offset + 8 <= self.len,
            StoreError::out_of_bounds(offset, self.len)
        );
        ensure!(
            offset % 8 == 0,
            StoreError::parse(offset, "value slot is not 8-byte aligned")
        );
        Ok(())
    }

    /// Double the file length until `required` fits, then remap. `used` and
    /// every existing entry offset are unchanged.
    fn grow(&mut self, required: usize) -> Result<()> {
        let mut new_len = self.len.max(MINIMUM_SIZE);
        while new_len < required {
            new_len = new_len
                .checked_mul(2)
                .ok_or_else(|| StoreError::out_of_bounds(required, usize::MAX))?;
        }

        self.map
            .flush_async()
            .wrap_err("failed to flush mapping before grow")?;

        self.file
            .set_len(new_len as u64)
            .wrap_err_with(|| {
                format!("failed to extend '{}' to {new_len} bytes", self.path.display())
            })?;

        // SAFETY: same justification as the initial mapping; the old map is
        // dropped on assignment and no borrows of it can be live because
        // grow takes &mut self.
        self.map = unsafe { MmapOptions::new().len(new_len).map_mut(&self.file) }
            .wrap_err_with(|| format!("failed to remap '{}' after grow", self.path.display()))?;

        self.len = new_len;
        Ok(())
    }

    fn publish_used(&mut self, used: u32) {
        // SAFETY: the mapping is at least HEADER_SIZE long and page-aligned,
        // so offset 0 is a valid aligned AtomicU32.
        unsafe {
            let ptr = self.map.as_ptr() as *const AtomicU32;
            (*ptr).store(used.to_le(), Ordering::Release);
        }
    }
}

impl Drop for MmapedFile {
    fn drop(&mut self) {
        // The mapping and the file handle unmap/close on drop; the advisory
        // lock dies with the handle. Only the claim table needs cleanup.
        PathAllocator::release(&self.path);
    }
}
