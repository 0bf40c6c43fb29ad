//! # Entry Parsing
//!
//! A lazy, one-shot iterator over the entries of a file buffer. The parser
//! is pure: it never touches the filesystem and works equally on a live
//! mapping or a plain read of the file. It trusts nothing: `used` is clamped
//! to the buffer length, zero-length cells are skipped, and a truncated tail
//! either ends iteration (lenient) or surfaces the byte offset (strict).
//!
//! Lenient mode is what the aggregator uses: a worker crash mid-append
//! leaves a well-formed prefix followed by garbage, and the prefix is still
//! worth scraping.

use eyre::Result;

use crate::error::StoreError;
use crate::storage::{file_header, RawEntry, HEADER_SIZE};

/// How the iterator reacts to a malformed or truncated tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Stop silently at the first byte that does not decode.
    Lenient,
    /// Yield a `StoreError::Parse` carrying the byte offset, then stop.
    Strict,
}

/// One parsed entry: the key bytes, the value, and the absolute offset of
/// the value slot within the file.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEntry<'a> {
    pub key: &'a [u8],
    pub value: f64,
    pub value_offset: usize,
}

/// Lazy entry sequence over a raw file buffer.
#[derive(Debug)]
pub struct EntryIter<'a> {
    buf: &'a [u8],
    pos: usize,
    limit: usize,
    mode: ParseMode,
    done: bool,
}

impl<'a> EntryIter<'a> {
    /// Build an iterator over `buf`. A buffer shorter than the header is an
    /// empty dictionary, not an error.
    pub fn new(buf: &'a [u8], mode: ParseMode) -> Self {
        let limit = match file_header(buf) {
            // Entries past the buffer end (torn tail, stale mapping) are
            // unreachable regardless of what `used` claims.
            Ok(header) => (header.used() as usize).min(buf.len()),
            Err(_) => 0,
        };

        EntryIter {
            buf,
            pos: HEADER_SIZE,
            limit,
            mode,
            done: false,
        }
    }

    fn fail(&mut self, offset: usize, reason: &'static str) -> Option<Result<ParsedEntry<'a>>> {
        self.done = true;
        match self.mode {
            ParseMode::Lenient => None,
            ParseMode::Strict => Some(Err(StoreError::parse(offset, reason).into())),
        }
    }
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = Result<ParsedEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done && self.pos < self.limit {
            let pos = self.pos;

            if pos + 4 > self.limit {
                return self.fail(pos, "length prefix crosses data boundary");
            }

            // UNWRAP: bounds checked above.
            let key_len =
                u32::from_le_bytes(self.buf[pos..pos + 4].try_into().unwrap()) as usize;

            // An all-zero cell is reserved space that was never published;
            // skip one alignment slot and look again.
            if key_len == 0 {
                self.pos += 8;
                continue;
            }

            let entry = match RawEntry::from_slice(&self.buf[pos..self.limit]) {
                Ok(entry) => entry,
                Err(_) => return self.fail(pos, "entry crosses data boundary"),
            };

            let value_offset = pos + entry.entry_len() - 8;
            self.pos = pos + entry.entry_len();

            return Some(Ok(ParsedEntry {
                key: entry.key(),
                value: entry.value(),
                value_offset,
            }));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a file image from `(key, value)` pairs, optionally lying about
    /// `used`.
    fn build_file(entries: &[(&[u8], f64)], used_override: Option<u32>) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE];

        for (key, value) in entries {
            let total = RawEntry::total_len(key.len()).unwrap();
            let start = buf.len();
            buf.resize(start + total, 0);
            RawEntry::write(&mut buf[start..], key, *value).unwrap();
        }

        let used = used_override.unwrap_or(buf.len() as u32);
        buf[..4].copy_from_slice(&used.to_le_bytes());
        buf
    }

    fn collect_lenient(buf: &[u8]) -> Vec<(Vec<u8>, f64, usize)> {
        EntryIter::new(buf, ParseMode::Lenient)
            .map(|e| {
                let e = e.unwrap();
                (e.key.to_vec(), e.value, e.value_offset)
            })
            .collect()
    }

    #[test]
    fn empty_file_yields_nothing() {
        let buf = build_file(&[], None);
        assert!(collect_lenient(&buf).is_empty());
    }

    #[test]
    fn zeroed_header_yields_nothing() {
        let buf = vec![0u8; 4096];
        assert!(collect_lenient(&buf).is_empty());
    }

    #[test]
    fn entries_parse_in_order_with_offsets() {
        let buf = build_file(&[(b"foo", 100.0), (b"bar", 500.0)], None);
        let parsed = collect_lenient(&buf);

        assert_eq!(
            parsed,
            vec![
                (b"foo".to_vec(), 100.0, 16),
                (b"bar".to_vec(), 500.0, 32),
            ]
        );
    }

    #[test]
    fn used_clamped_to_buffer_len() {
        // `used` claims more data than the buffer holds; the parser reads
        // what is actually there.
        let buf = build_file(&[(b"foo", 1.0)], Some(10_000));
        assert_eq!(collect_lenient(&buf).len(), 1);
    }

    #[test]
    fn zero_cells_are_skipped() {
        let mut buf = build_file(&[(b"foo", 1.0)], None);
        // Reserve two empty alignment slots, then a published entry.
        let gap_start = buf.len();
        buf.resize(gap_start + 16, 0);
        let start = buf.len();
        let total = RawEntry::total_len(3).unwrap();
        buf.resize(start + total, 0);
        RawEntry::write(&mut buf[start..], b"baz", 2.0).unwrap();
        let used = buf.len() as u32;
        buf[..4].copy_from_slice(&used.to_le_bytes());

        let parsed = collect_lenient(&buf);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].0, b"baz");
    }

    #[test]
    fn truncated_tail_stops_lenient_iteration() {
        let full = build_file(&[(b"foo", 1.0), (b"barbaz", 2.0)], None);
        let full_used = full.len();

        // Chop bytes off the tail while keeping the original `used`; every
        // prefix yields the largest well-formed entry sequence.
        for cut in 0..16 {
            let mut buf = full[..full.len() - cut].to_vec();
            buf[..4].copy_from_slice(&(full_used as u32).to_le_bytes());

            let parsed = collect_lenient(&buf);
            if cut == 0 {
                assert_eq!(parsed.len(), 2, "cut {cut}");
            } else {
                assert_eq!(parsed.len(), 1, "cut {cut}");
                assert_eq!(parsed[0].0, b"foo");
            }
        }
    }

    #[test]
    fn truncated_tail_errors_in_strict_mode() {
        let mut buf = build_file(&[(b"foo", 1.0)], None);
        let used = buf.len() as u32 + 8;
        buf.resize(buf.len() + 8, 0);
        // A length prefix promising more bytes than remain.
        let tail = buf.len() - 8;
        buf[tail..tail + 4].copy_from_slice(&64u32.to_le_bytes());
        buf[..4].copy_from_slice(&used.to_le_bytes());

        let results: Vec<_> = EntryIter::new(&buf, ParseMode::Strict).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());

        let err = results[1].as_ref().unwrap_err();
        assert_eq!(
            err.downcast_ref::<StoreError>(),
            Some(&StoreError::parse(tail, "entry crosses data boundary"))
        );
    }

    #[test]
    fn iterator_is_fused_after_failure() {
        let mut buf = vec![0u8; 32];
        buf[..4].copy_from_slice(&32u32.to_le_bytes());
        buf[8..12].copy_from_slice(&1000u32.to_le_bytes());

        let mut iter = EntryIter::new(&buf, ParseMode::Strict);
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());
    }
}
