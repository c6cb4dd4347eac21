// Views: contiguous windows over a record store, carrying the one mutex
// that serializes every operation on the root store.
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::error::{Error, ErrorKind};
use crate::core::record::RecordStore;
use crate::core::source::RecordSource;
use crate::core::trunk::Whence;

/// A window `[begin, end)` over a record store with its own cursor.
/// Slicing a view re-bases onto the same root store, so all views created
/// from one root share one lock and one set of backend handles.
#[derive(Debug)]
pub struct RecordView {
    store: Arc<Mutex<RecordStore>>,
    begin: u64,
    end: u64,
    cursor: u64,
    // Root views over a writable store track its growth; sliced views
    // keep their bounds fixed.
    whole: bool,
}

impl RecordView {
    /// Wraps a freshly opened store in a full-range view.
    pub fn root(store: RecordStore) -> Self {
        let end = store.size();
        Self {
            store: Arc::new(Mutex::new(store)),
            begin: 0,
            end,
            cursor: 0,
            whole: true,
        }
    }

    /// New view over `[begin+start, min(begin+start+length, end))`;
    /// overruns clamp silently. `None` extends to the view's end.
    pub fn slice(&self, start: u64, length: Option<u64>) -> Self {
        let begin = self.begin.saturating_add(start).min(self.end);
        let end = match length {
            Some(length) => begin.saturating_add(length).min(self.end),
            None => self.end,
        };
        Self {
            store: self.store.clone(),
            begin,
            end,
            cursor: 0,
            whole: false,
        }
    }

    /// The shard for `rank` of `world`: `slice(L*rank/world, L/world)`.
    /// Shards are pairwise disjoint and in-range; up to `world - 1`
    /// trailing records stay unassigned.
    pub fn shard(&self, rank: u64, world: u64) -> Result<Self, Error> {
        if world == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("world size must be nonzero"));
        }
        if rank >= world {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("rank {rank} is out of range [0, {world})")));
        }
        let len = self.len();
        let start = (len as u128 * rank as u128 / world as u128) as u64;
        Ok(self.slice(start, Some(len / world)))
    }

    pub fn size(&self) -> u64 {
        self.len()
    }

    pub fn tell(&self) -> u64 {
        self.cursor
    }

    /// Sequential next record within the view; `Ok(None)` once the
    /// cursor reaches the view's end.
    pub fn read(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let len = self.len();
        if self.cursor >= len {
            return Ok(None);
        }
        let mut store = self.guard();
        let absolute = self.begin + self.cursor;
        if store.tell() != absolute {
            store.seek(absolute as i64, Whence::Set)?;
        }
        let result = store.read()?;
        drop(store);
        match result {
            Some(record) => {
                self.cursor += 1;
                Ok(Some(record))
            }
            None => Err(Error::new(ErrorKind::Corrupt).with_message(format!(
                "store ended at record {absolute} before view bound {}",
                self.begin + len
            ))),
        }
    }

    /// Appends through to the root store (write-mode stores only).
    pub fn write(&mut self, record: &[u8]) -> Result<(), Error> {
        let mut store = self.guard();
        store.write(record)?;
        let size = store.size();
        drop(store);
        if self.whole {
            self.end = size;
        }
        Ok(())
    }

    /// Seeks in record units relative to the view, clamped to
    /// `[0, len]`; returns the view-relative position.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, Error> {
        let len = self.len();
        let target = match whence {
            Whence::Set => offset as i128,
            Whence::Cur => self.cursor as i128 + offset as i128,
            Whence::End => len as i128 - offset as i128,
        };
        let target = target.clamp(0, len as i128) as u64;
        let mut store = self.guard();
        store.seek((self.begin + target) as i64, Whence::Set)?;
        drop(store);
        self.cursor = target;
        Ok(target)
    }

    /// Random access relative to the view; out-of-range is a hard
    /// `Usage` error.
    pub fn pread(&self, n: u64) -> Result<Vec<u8>, Error> {
        let len = self.len();
        if n >= len {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("record {n} is out of range [0, {len})")));
        }
        self.guard().pread(self.begin + n)
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.guard().flush()
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.guard().close()
    }

    fn len(&self) -> u64 {
        if self.whole {
            self.guard().size()
        } else {
            self.end - self.begin
        }
    }

    fn guard(&self) -> MutexGuard<'_, RecordStore> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RecordSource for RecordView {
    fn read(&mut self) -> Result<Option<Vec<u8>>, Error> {
        RecordView::read(self)
    }

    fn write(&mut self, record: &[u8]) -> Result<(), Error> {
        RecordView::write(self, record)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, Error> {
        RecordView::seek(self, offset, whence)
    }

    fn pread(&mut self, n: u64) -> Result<Vec<u8>, Error> {
        RecordView::pread(self, n)
    }

    fn size(&self) -> u64 {
        RecordView::size(self)
    }

    fn tell(&self) -> u64 {
        RecordView::tell(self)
    }

    fn set_epoch(&mut self, _epoch: u64) -> Result<(), Error> {
        RecordView::seek(self, 0, Whence::Set).map(|_| ())
    }

    fn flush(&mut self) -> Result<(), Error> {
        RecordView::flush(self)
    }

    fn close(&mut self) -> Result<(), Error> {
        RecordView::close(self)
    }
}
