// Bounded-memory streaming shuffles over a sequential record source,
// reproducible per (seed, epoch).
use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::error::{Error, ErrorKind};
use crate::core::source::RecordSource;
use crate::core::trunk::Whence;

fn epoch_rng(seed: u64, epoch: u64) -> StdRng {
    StdRng::seed_from_u64(seed.wrapping_add(epoch))
}

/// Reservoir-style shuffle: keeps a pool of `pool_size` records, emits a
/// uniformly random slot each step, and refills the slot from upstream
/// (or shrinks the pool once upstream is exhausted). Memory stays
/// `O(pool_size)`; the order is online, not globally uniform.
pub struct PoolShuffle<S> {
    source: S,
    seed: u64,
    pool_size: usize,
    pool: Vec<Vec<u8>>,
    rng: StdRng,
    primed: bool,
    emitted: u64,
}

impl<S: RecordSource> PoolShuffle<S> {
    pub fn new(source: S, seed: u64, pool_size: usize) -> Self {
        Self {
            source,
            seed,
            pool_size: pool_size.max(1),
            pool: Vec::new(),
            rng: epoch_rng(seed, 0),
            primed: false,
            emitted: 0,
        }
    }

    /// Next shuffled record; `Ok(None)` once upstream and pool are both
    /// drained.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>, Error> {
        if !self.primed {
            self.prime()?;
        }
        if self.pool.is_empty() {
            return Ok(None);
        }
        let slot = self.rng.gen_range(0..self.pool.len());
        let out = match self.source.read()? {
            Some(incoming) => std::mem::replace(&mut self.pool[slot], incoming),
            // Upstream is dry: back-fill from the last live slot.
            None => self.pool.swap_remove(slot),
        };
        self.emitted += 1;
        Ok(Some(out))
    }

    /// Reseeds from `(seed, epoch)` and rewinds the source; buffered
    /// records are discarded and re-fetched.
    pub fn set_epoch(&mut self, epoch: u64) -> Result<(), Error> {
        self.rng = epoch_rng(self.seed, epoch);
        self.source.seek(0, Whence::Set)?;
        self.pool.clear();
        self.primed = false;
        self.emitted = 0;
        Ok(())
    }

    fn prime(&mut self) -> Result<(), Error> {
        while self.pool.len() < self.pool_size {
            match self.source.read()? {
                Some(record) => self.pool.push(record),
                None => break,
            }
        }
        self.primed = true;
        Ok(())
    }
}

impl<S: RecordSource> RecordSource for PoolShuffle<S> {
    fn read(&mut self) -> Result<Option<Vec<u8>>, Error> {
        self.next_record()
    }

    fn size(&self) -> u64 {
        self.source.size()
    }

    fn tell(&self) -> u64 {
        self.emitted
    }

    fn set_epoch(&mut self, epoch: u64) -> Result<(), Error> {
        PoolShuffle::set_epoch(self, epoch)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.source.flush()
    }

    fn close(&mut self) -> Result<(), Error> {
        self.source.close()
    }
}

/// Windowed refill shuffle: preloads `buffer_size * (1 - refill_ratio)`
/// records, then repeatedly fetches `buffer_size * refill_ratio` more,
/// permutes the fresh slots against the live buffer, and emits one
/// fetch's worth per cycle.
pub struct WindowShuffle<S> {
    source: S,
    seed: u64,
    buffer_size: usize,
    fetch_num: usize,
    buffer: Vec<Vec<u8>>,
    pending: VecDeque<Vec<u8>>,
    rng: StdRng,
    primed: bool,
    exhausted: bool,
    emitted: u64,
}

impl<S: RecordSource> WindowShuffle<S> {
    pub fn new(source: S, seed: u64, buffer_size: usize, refill_ratio: f64) -> Result<Self, Error> {
        if !(refill_ratio > 0.0 && refill_ratio <= 1.0) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("refill_ratio {refill_ratio} is out of range (0, 1]")));
        }
        let buffer_size = buffer_size.max(1);
        let fetch_num = ((buffer_size as f64 * refill_ratio) as usize).max(1);
        Ok(Self {
            source,
            seed,
            buffer_size,
            fetch_num,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            rng: epoch_rng(seed, 0),
            primed: false,
            exhausted: false,
            emitted: 0,
        })
    }

    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>, Error> {
        if !self.primed {
            self.prime()?;
        }
        loop {
            if let Some(record) = self.pending.pop_front() {
                self.emitted += 1;
                return Ok(Some(record));
            }
            if self.buffer.is_empty() && self.exhausted {
                return Ok(None);
            }

            let live = self.buffer.len();
            if !self.exhausted {
                self.fetch(self.fetch_num)?;
            }
            // Mix each fresh slot into a random position among everything
            // currently buffered.
            for fresh in live..self.buffer.len() {
                let target = self.rng.gen_range(0..=fresh);
                self.buffer.swap(fresh, target);
            }
            let emit = self.fetch_num.min(self.buffer.len());
            for _ in 0..emit {
                if let Some(record) = self.buffer.pop() {
                    self.pending.push_back(record);
                }
            }
        }
    }

    pub fn set_epoch(&mut self, epoch: u64) -> Result<(), Error> {
        self.rng = epoch_rng(self.seed, epoch);
        self.source.seek(0, Whence::Set)?;
        self.buffer.clear();
        self.pending.clear();
        self.primed = false;
        self.exhausted = false;
        self.emitted = 0;
        Ok(())
    }

    fn prime(&mut self) -> Result<(), Error> {
        let preload = self.buffer_size - self.fetch_num;
        self.fetch(preload)?;
        self.primed = true;
        Ok(())
    }

    fn fetch(&mut self, want: usize) -> Result<(), Error> {
        for _ in 0..want {
            match self.source.read()? {
                Some(record) => self.buffer.push(record),
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }
        Ok(())
    }
}

impl<S: RecordSource> RecordSource for WindowShuffle<S> {
    fn read(&mut self) -> Result<Option<Vec<u8>>, Error> {
        self.next_record()
    }

    fn size(&self) -> u64 {
        self.source.size()
    }

    fn tell(&self) -> u64 {
        self.emitted
    }

    fn set_epoch(&mut self, epoch: u64) -> Result<(), Error> {
        WindowShuffle::set_epoch(self, epoch)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.source.flush()
    }

    fn close(&mut self) -> Result<(), Error> {
        self.source.close()
    }
}
