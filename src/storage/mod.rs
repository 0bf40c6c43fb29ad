//! # Storage Module
//!
//! The shared-state layer of the multiprocess store: a family of per-process
//! memory-mapped append-only files, each encoding a `(key -> f64)`
//! dictionary. This layer is what lets many worker processes record metrics
//! with no cross-process coordination on the hot path; the only shared state
//! is the on-disk byte layout.
//!
//! ## File Format
//!
//! Every `*.db` file has the same layout. All integers are little-endian,
//! values are IEEE-754 `f64`:
//!
//! ```text
//! offset  size  field
//! 0       4     used       u32, first byte past the last valid entry
//! 4       4     reserved   zero
//! 8       ...   entries, contiguous, each starting on an 8-byte boundary:
//!
//!         E+0        4     key_len L (u32)
//!         E+4        L     encoded key (UTF-8 JSON, opaque here)
//!         E+4+L      pad   1..8 zero bytes, so E+4+L+pad is 8-aligned
//!         E+4+L+pad  8     value (f64)
//! ```
//!
//! The file length is always a multiple of the OS page size; bytes in
//! `[used, len)` are zero and reserved for future appends.
//!
//! ## Cross-Process Safety
//!
//! One writer per file, enforced with an advisory `flock` taken when the
//! filename is allocated. Any number of readers may map or read the file
//! concurrently. The single ordering guarantee is write-then-publish: entry
//! bytes are fully written before `used` is advanced, so a reader that
//! observes `used = U` can scan up to `U` without seeing torn entries.
//! Value overwrites are single aligned 8-byte stores and are observed
//! atomically on the supported targets (x86_64, aarch64).
//!
//! Growth only ever extends a file, and entry offsets never move. A reader
//! holding a stale, shorter mapping misses recent appends but never reads
//! garbage.
//!
//! ## Module Organization
//!
//! - `entry`: byte-exact encode/decode of a single entry
//! - `parser`: lazy entry iterator over a raw byte slice
//! - `file`: `MmapedFile`, mapping lifecycle, growth, append/overwrite
//! - `dict`: `MmapedDict`, the key -> value-offset index over one file
//! - `path`: `PathAllocator`, lock-guarded `<prefix>_<pid>-<n>.db` naming

mod dict;
mod entry;
mod file;
mod parser;
mod path;

pub use dict::MmapedDict;
pub use entry::RawEntry;
pub use file::MmapedFile;
pub use parser::{EntryIter, ParseMode, ParsedEntry};
pub use path::{AllocatedPath, PathAllocator};

use std::sync::OnceLock;

use eyre::{eyre, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Bytes reserved at the start of every file: `used` plus padding.
pub const HEADER_SIZE: usize = 8;

/// Smallest readable file: nothing but a header.
pub const MINIMUM_SIZE: usize = 8;

/// The mapped file header. `used` is the number of bytes occupied by the
/// header and all published entries.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FileHeader {
    used: U32,
    reserved: U32,
}

impl FileHeader {
    /// The published data length. A zero header (fresh file, never written)
    /// reads as `HEADER_SIZE`: an empty dictionary, not a malformed one.
    pub fn used(&self) -> u32 {
        match self.used.get() {
            0 => HEADER_SIZE as u32,
            used => used,
        }
    }
}

/// Borrow the file header from the start of a mapped or read buffer.
pub fn file_header(bytes: &[u8]) -> Result<&FileHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(eyre!(
            "buffer of {} bytes too small for file header",
            bytes.len()
        ));
    }
    FileHeader::ref_from_bytes(&bytes[..HEADER_SIZE])
        .map_err(|e| eyre!("failed to parse file header: {e:?}"))
}

/// The OS page size, resolved once. Falls back to 4096 if `sysconf` has
/// nothing to say.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf(3) has no preconditions and touches no memory we
        // own; a negative or zero return means "unsupported" and is handled.
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ret > 0 {
            ret as usize
        } else {
            4096
        }
    })
}

/// Round `len` up to the next multiple of the page size.
pub fn round_to_page(len: usize) -> usize {
    let page = page_size();
    len.max(1).div_ceil(page) * page
}
