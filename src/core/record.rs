// Record stores: an index stream of cumulative end-offsets plus a data
// stream, giving O(1) random access to opaque byte records.
use std::sync::Arc;

use crate::core::backend::StorageBackend;
use crate::core::error::{Error, ErrorKind};
use crate::core::trunk::{StreamMode, TrunkOptions, TrunkStream, Whence};

/// Width of one index entry: a little-endian u64 cumulative data
/// end-offset.
pub const INDEX_ENTRY_LEN: u64 = 8;

pub struct RecordStore {
    index: TrunkStream,
    data: TrunkStream,
    mode: StreamMode,
    /// Cumulative data offset just before the record at the cursor.
    last_read_pos: u64,
    /// Record cursor for sequential reads.
    cursor: u64,
    /// Record count, always derived from the index stream size.
    count: u64,
    /// Total data bytes written (write mode).
    data_size: u64,
    closed: bool,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("mode", &self.mode)
            .field("cursor", &self.cursor)
            .field("count", &self.count)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl RecordStore {
    /// Opens the `index/` and `data/` trunk streams below `prefix`.
    pub fn open(
        backend: Arc<dyn StorageBackend>,
        prefix: &str,
        mode: StreamMode,
        options: TrunkOptions,
    ) -> Result<Self, Error> {
        let prefix = if prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };
        let index = TrunkStream::open(
            backend.clone(),
            &format!("{prefix}index/"),
            mode,
            options,
        )?;
        let data = TrunkStream::open(backend, &format!("{prefix}data/"), mode, options)?;

        if index.size() % INDEX_ENTRY_LEN != 0 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!(
                    "index stream size {} is not a multiple of {INDEX_ENTRY_LEN}",
                    index.size()
                )));
        }
        let count = index.size() / INDEX_ENTRY_LEN;
        let data_size = data.size();
        Ok(Self {
            index,
            data,
            mode,
            last_read_pos: 0,
            cursor: 0,
            count,
            data_size,
            closed: false,
        })
    }

    pub fn size(&self) -> u64 {
        self.count
    }

    pub fn tell(&self) -> u64 {
        self.cursor
    }

    /// Appends one record: data bytes first, then the new cumulative
    /// end-offset, so a torn write leaves at most an unindexed tail.
    pub fn write(&mut self, record: &[u8]) -> Result<(), Error> {
        self.check_open()?;
        if self.mode != StreamMode::Write {
            return Err(Error::new(ErrorKind::Unsupported).with_message("store is read-only"));
        }
        self.data.append_all(record)?;
        self.data_size += record.len() as u64;
        self.index.append_all(&self.data_size.to_le_bytes())?;
        self.count += 1;
        Ok(())
    }

    /// Sequential next record; `Ok(None)` at end of stream. Any index or
    /// data read shorter than its guaranteed length is corruption.
    pub fn read(&mut self) -> Result<Option<Vec<u8>>, Error> {
        self.check_readable()?;
        if self.cursor == self.count {
            return Ok(None);
        }

        let mut entry = [0u8; INDEX_ENTRY_LEN as usize];
        self.read_index_exact(&mut entry)?;
        let end = u64::from_le_bytes(entry);
        if end < self.last_read_pos {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!(
                    "index entry {} goes backwards: {} < {}",
                    self.cursor, end, self.last_read_pos
                )));
        }

        let length = (end - self.last_read_pos) as usize;
        let mut record = vec![0u8; length];
        let mut got = 0;
        while got < length {
            let n = self.data.read(&mut record[got..])?;
            if n == 0 {
                return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
                    "record data truncated between offsets {} and {}",
                    self.last_read_pos, end
                )));
            }
            got += n;
        }
        self.last_read_pos = end;
        self.cursor += 1;
        Ok(Some(record))
    }

    /// Repositions the record cursor, clamped to `[0, count]`, and moves
    /// both streams to match.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, Error> {
        self.check_readable()?;
        let target = match whence {
            Whence::Set => offset as i128,
            Whence::Cur => self.cursor as i128 + offset as i128,
            Whence::End => self.count as i128 - offset as i128,
        };
        let target = target.clamp(0, self.count as i128) as u64;

        if target > 0 {
            self.index
                .seek(((target - 1) * INDEX_ENTRY_LEN) as i64, Whence::Set)?;
            let mut entry = [0u8; INDEX_ENTRY_LEN as usize];
            self.read_index_exact(&mut entry)?;
            self.last_read_pos = u64::from_le_bytes(entry);
        } else {
            self.index.seek(0, Whence::Set)?;
            self.last_read_pos = 0;
        }
        self.data.seek(self.last_read_pos as i64, Whence::Set)?;
        self.cursor = target;
        Ok(target)
    }

    /// Random access without disturbing the sequential cursor. An
    /// out-of-range record number is a hard range error, never clamped.
    pub fn pread(&self, n: u64) -> Result<Vec<u8>, Error> {
        self.check_readable()?;
        if n >= self.count {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "record {n} is out of range [0, {})",
                self.count
            )));
        }

        let (begin, end) = if n > 0 {
            let raw = self
                .index
                .pread((n - 1) * INDEX_ENTRY_LEN, 2 * INDEX_ENTRY_LEN as usize)?;
            if raw.len() != 2 * INDEX_ENTRY_LEN as usize {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!("index truncated at entry {}", n - 1))
                    .with_offset((n - 1) * INDEX_ENTRY_LEN));
            }
            let mut first = [0u8; INDEX_ENTRY_LEN as usize];
            let mut second = [0u8; INDEX_ENTRY_LEN as usize];
            first.copy_from_slice(&raw[..INDEX_ENTRY_LEN as usize]);
            second.copy_from_slice(&raw[INDEX_ENTRY_LEN as usize..]);
            (u64::from_le_bytes(first), u64::from_le_bytes(second))
        } else {
            let raw = self.index.pread(0, INDEX_ENTRY_LEN as usize)?;
            if raw.len() != INDEX_ENTRY_LEN as usize {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("index truncated at entry 0"));
            }
            let mut entry = [0u8; INDEX_ENTRY_LEN as usize];
            entry.copy_from_slice(&raw);
            (0, u64::from_le_bytes(entry))
        };
        if end < begin {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("index entry {n} goes backwards: {end} < {begin}")));
        }

        let record = self.data.pread(begin, (end - begin) as usize)?;
        if record.len() != (end - begin) as usize {
            return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
                "record data truncated between offsets {begin} and {end}"
            )));
        }
        Ok(record)
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.check_open()?;
        self.index.flush()?;
        self.data.flush()
    }

    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        if self.mode == StreamMode::Write {
            self.index.flush()?;
            self.data.flush()?;
        }
        self.index.close()?;
        self.data.close()?;
        self.closed = true;
        Ok(())
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    fn read_index_exact(&mut self, entry: &mut [u8; INDEX_ENTRY_LEN as usize]) -> Result<(), Error> {
        let mut got = 0;
        while got < entry.len() {
            let n = self.index.read(&mut entry[got..])?;
            if n == 0 {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!(
                        "index truncated at byte offset {}",
                        self.cursor * INDEX_ENTRY_LEN + got as u64
                    )));
            }
            got += n;
        }
        Ok(())
    }

    fn check_readable(&self) -> Result<(), Error> {
        self.check_open()?;
        if self.mode != StreamMode::Read {
            return Err(Error::new(ErrorKind::Unsupported).with_message("store is write-only"));
        }
        Ok(())
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::new(ErrorKind::Usage).with_message("store is closed"));
        }
        Ok(())
    }
}
