// Trunked byte streams: one logical append-only stream over fixed-size
// backend objects numbered `0.blk, 1.blk, ...`.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::backend::{OpenMode, StorageBackend, StorageFile};
use crate::core::error::{Error, ErrorKind};

/// Whence for stream and record seeks. `End` counts backwards from the
/// end, so `seek(0, End)` lands on the end itself.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Streams are opened read-only or write-only, never both.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamMode {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug)]
pub struct TrunkOptions {
    /// Exact size of every trunk except the last.
    pub max_trunk_size: u64,
    /// Bounded retries for a short read that stops before the trunk
    /// boundary; exhausting them is corruption, not end-of-stream.
    pub max_read_retries: u32,
}

impl TrunkOptions {
    pub fn new(max_trunk_size: u64) -> Self {
        Self {
            max_trunk_size,
            max_read_retries: 3,
        }
    }

    pub fn with_max_read_retries(mut self, retries: u32) -> Self {
        self.max_read_retries = retries;
        self
    }
}

impl Default for TrunkOptions {
    fn default() -> Self {
        Self::new(128 * 1024 * 1024)
    }
}

pub struct TrunkStream {
    backend: Arc<dyn StorageBackend>,
    prefix: String,
    mode: StreamMode,
    max_trunk_size: u64,
    max_read_retries: u32,
    trunk_sizes: Vec<u64>,
    size: u64,
    tell: u64,
    curr_trunk: usize,
    in_trunk: u64,
    reader: Option<Box<dyn StorageFile>>,
    writer: Option<Box<dyn StorageFile>>,
    closed: bool,
}

impl TrunkStream {
    /// Enumerates existing trunks by probing `0.blk, 1.blk, ...` until a
    /// miss. Read mode requires at least one trunk; write mode creates an
    /// empty first trunk when none exist.
    pub fn open(
        backend: Arc<dyn StorageBackend>,
        prefix: &str,
        mode: StreamMode,
        options: TrunkOptions,
    ) -> Result<Self, Error> {
        if options.max_trunk_size == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("max_trunk_size must be nonzero"));
        }
        let prefix = if prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };

        let mut trunk_sizes = Vec::new();
        loop {
            let path = trunk_path(&prefix, trunk_sizes.len());
            match backend.filesize(&path)? {
                Some(size) => trunk_sizes.push(size),
                None => break,
            }
        }
        let size = trunk_sizes.iter().sum();

        let mut stream = Self {
            backend,
            prefix,
            mode,
            max_trunk_size: options.max_trunk_size,
            max_read_retries: options.max_read_retries,
            trunk_sizes,
            size,
            tell: 0,
            curr_trunk: 0,
            in_trunk: 0,
            reader: None,
            writer: None,
            closed: false,
        };

        match mode {
            StreamMode::Read => {
                if stream.trunk_sizes.is_empty() {
                    return Err(Error::new(ErrorKind::NotFound)
                        .with_message("no trunks found")
                        .with_path(trunk_path(&stream.prefix, 0)));
                }
                stream.reader = Some(stream.backend.open(
                    &trunk_path(&stream.prefix, 0),
                    OpenMode::Read,
                    None,
                    None,
                )?);
            }
            StreamMode::Write => {
                if stream.trunk_sizes.is_empty() {
                    stream.trunk_sizes.push(0);
                }
                let last = stream.trunk_sizes.len() - 1;
                stream.curr_trunk = last;
                stream.in_trunk = stream.trunk_sizes[last];
                stream.writer = Some(stream.backend.open(
                    &trunk_path(&stream.prefix, last),
                    OpenMode::Append,
                    None,
                    None,
                )?);
            }
        }
        Ok(stream)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn tell(&self) -> u64 {
        self.tell
    }

    /// Reads from the sequential cursor. Completing a trunk advances to
    /// the next one; a short read that stops before the trunk boundary is
    /// retried on a fresh handle and becomes `Corrupt` once the retry
    /// budget runs out. Returns 0 only at end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.check_readable()?;
        if buf.is_empty() || self.tell == self.size {
            return Ok(0);
        }

        let mut attempts = 0;
        loop {
            let reader = match self.reader.as_mut() {
                Some(reader) => reader,
                None => {
                    // Cursor was parked on a boundary with no open handle.
                    self.reopen_reader()?;
                    continue;
                }
            };
            // The probed size is the contract; never read past it even if
            // the backend object has grown since the probe.
            let room = (self.trunk_sizes[self.curr_trunk] - self.in_trunk) as usize;
            let limit = buf.len().min(room);
            let n = reader.read(&mut buf[..limit])?;
            self.tell += n as u64;
            self.in_trunk += n as u64;

            if self.in_trunk == self.trunk_sizes[self.curr_trunk] {
                if self.curr_trunk + 1 < self.trunk_sizes.len() {
                    self.curr_trunk += 1;
                    self.in_trunk = 0;
                    self.reader = Some(self.backend.open(
                        &trunk_path(&self.prefix, self.curr_trunk),
                        OpenMode::Read,
                        None,
                        None,
                    )?);
                }
                return Ok(n);
            }
            if n > 0 {
                return Ok(n);
            }
            if attempts >= self.max_read_retries {
                let missing = self.trunk_sizes[self.curr_trunk] - self.in_trunk;
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!("trunk size not aligned: expected {missing} more bytes"))
                    .with_path(trunk_path(&self.prefix, self.curr_trunk))
                    .with_offset(self.in_trunk));
            }
            attempts += 1;
            self.reopen_reader()?;
        }
    }

    /// Appends to the last trunk, writing at most up to the trunk
    /// boundary; callers loop (or use [`append_all`]) to place the rest.
    /// An exact fill closes the trunk and opens the next one.
    ///
    /// [`append_all`]: TrunkStream::append_all
    pub fn append(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.check_writable()?;
        if self.in_trunk >= self.max_trunk_size {
            self.roll_trunk()?;
        }
        let room = self.max_trunk_size - self.in_trunk;
        let n = (data.len() as u64).min(room) as usize;
        if n > 0 {
            let writer = self.writer.as_mut().ok_or_else(writer_missing)?;
            writer.append(&data[..n])?;
            self.size += n as u64;
            self.in_trunk += n as u64;
            let last = self.trunk_sizes.len() - 1;
            self.trunk_sizes[last] += n as u64;
        }
        if self.in_trunk == self.max_trunk_size {
            self.roll_trunk()?;
        }
        Ok(n)
    }

    pub fn append_all(&mut self, data: &[u8]) -> Result<(), Error> {
        let mut written = 0;
        while written < data.len() {
            written += self.append(&data[written..])?;
        }
        Ok(())
    }

    /// Repositions the read cursor, clamped to `[0, size]`. A resolved
    /// offset landing exactly on a trunk boundary is normalized to the
    /// start of the following trunk when one exists.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, Error> {
        self.check_readable()?;
        let target = match whence {
            Whence::Set => offset as i128,
            Whence::Cur => self.tell as i128 + offset as i128,
            Whence::End => self.size as i128 - offset as i128,
        };
        let target = target.clamp(0, self.size as i128) as u64;

        let mut rest = target;
        let mut trunk = 0;
        while rest > self.trunk_sizes[trunk] {
            rest -= self.trunk_sizes[trunk];
            trunk += 1;
        }
        if rest == self.trunk_sizes[trunk] && trunk + 1 < self.trunk_sizes.len() {
            trunk += 1;
            rest = 0;
        }

        self.curr_trunk = trunk;
        self.in_trunk = rest;
        self.tell = target;
        if rest == self.trunk_sizes[trunk] {
            // End of stream; nothing left to read from this handle.
            self.reader = None;
        } else {
            self.reader = Some(self.backend.open(
                &trunk_path(&self.prefix, trunk),
                OpenMode::Read,
                Some(rest),
                None,
            )?);
        }
        Ok(target)
    }

    /// Reads `length` bytes starting at the absolute `offset` without
    /// touching the sequential cursor; may span trunks. The result is
    /// shorter than requested only at true end of stream.
    pub fn pread(&self, offset: u64, length: usize) -> Result<Vec<u8>, Error> {
        self.check_readable()?;

        let mut trunk = 0;
        let mut off = offset;
        while trunk < self.trunk_sizes.len() && off >= self.trunk_sizes[trunk] {
            off -= self.trunk_sizes[trunk];
            trunk += 1;
        }
        if trunk >= self.trunk_sizes.len() {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(length);
        let mut rest = length as u64;
        while rest > 0 && trunk < self.trunk_sizes.len() {
            let end = self.trunk_sizes[trunk].min(off + rest);
            let want = (end - off) as usize;
            let mut handle = self.backend.open(
                &trunk_path(&self.prefix, trunk),
                OpenMode::Read,
                Some(off),
                Some(end),
            )?;
            let got = read_up_to(handle.as_mut(), &mut out, want)?;
            rest -= got as u64;
            if got < want {
                // The backend object is shorter than its probed size;
                // the caller decides whether that is fatal.
                break;
            }
            off = 0;
            trunk += 1;
        }
        Ok(out)
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        if self.mode != StreamMode::Write {
            return Ok(());
        }
        if self.closed {
            return Err(stream_closed());
        }
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }

    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        if self.mode == StreamMode::Write {
            if let Some(writer) = self.writer.as_mut() {
                writer.flush()?;
            }
        }
        self.reader = None;
        self.writer = None;
        self.closed = true;
        Ok(())
    }

    fn reopen_reader(&mut self) -> Result<(), Error> {
        self.reader = Some(self.backend.open(
            &trunk_path(&self.prefix, self.curr_trunk),
            OpenMode::Read,
            Some(self.in_trunk),
            None,
        )?);
        Ok(())
    }

    fn roll_trunk(&mut self) -> Result<(), Error> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        self.trunk_sizes.push(0);
        self.curr_trunk = self.trunk_sizes.len() - 1;
        self.in_trunk = 0;
        self.writer = Some(self.backend.open(
            &trunk_path(&self.prefix, self.curr_trunk),
            OpenMode::Append,
            None,
            None,
        )?);
        Ok(())
    }

    fn check_readable(&self) -> Result<(), Error> {
        if self.closed {
            return Err(stream_closed());
        }
        if self.mode != StreamMode::Read {
            return Err(Error::new(ErrorKind::Unsupported).with_message("stream is write-only"));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), Error> {
        if self.closed {
            return Err(stream_closed());
        }
        if self.mode != StreamMode::Write {
            return Err(Error::new(ErrorKind::Unsupported).with_message("stream is read-only"));
        }
        Ok(())
    }
}

fn trunk_path(prefix: &str, index: usize) -> String {
    format!("{prefix}{index}.blk")
}

fn stream_closed() -> Error {
    Error::new(ErrorKind::Usage).with_message("stream is closed")
}

fn writer_missing() -> Error {
    Error::new(ErrorKind::Internal).with_message("write handle missing")
}

fn read_up_to(
    handle: &mut dyn StorageFile,
    out: &mut Vec<u8>,
    want: usize,
) -> Result<usize, Error> {
    let start = out.len();
    out.resize(start + want, 0);
    let mut got = 0;
    while got < want {
        let n = handle.read(&mut out[start + got..])?;
        if n == 0 {
            break;
        }
        got += n;
    }
    out.truncate(start + got);
    Ok(got)
}

#[cfg(test)]
mod tests {
    use super::{StreamMode, TrunkOptions, TrunkStream, Whence};
    use crate::backend::DiskBackend;
    use crate::core::backend::StorageBackend;
    use crate::core::error::ErrorKind;
    use std::sync::Arc;

    fn backend() -> Arc<dyn StorageBackend> {
        Arc::new(DiskBackend::new())
    }

    fn prefix(dir: &tempfile::TempDir) -> String {
        dir.path().join("stream").to_string_lossy().into_owned()
    }

    fn write_stream(prefix: &str, trunk_size: u64, payload: &[u8]) {
        let mut stream = TrunkStream::open(
            backend(),
            prefix,
            StreamMode::Write,
            TrunkOptions::new(trunk_size),
        )
        .expect("open write");
        stream.append_all(payload).expect("append");
        stream.close().expect("close");
    }

    fn read_all(stream: &mut TrunkStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = stream.read(&mut buf).expect("read");
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn append_rolls_trunks_at_exact_fill() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = prefix(&dir);
        write_stream(&prefix, 4, b"0123456789");

        let backend = DiskBackend::new();
        let sizes: Vec<_> = (0..4)
            .map(|i| {
                backend
                    .filesize(&format!("{prefix}/{i}.blk"))
                    .expect("filesize")
            })
            .collect();
        assert_eq!(sizes, vec![Some(4), Some(4), Some(2), None]);
    }

    #[test]
    fn read_is_transparent_across_boundaries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = prefix(&dir);
        write_stream(&prefix, 4, b"0123456789");

        let mut stream = TrunkStream::open(
            backend(),
            &prefix,
            StreamMode::Read,
            TrunkOptions::new(4),
        )
        .expect("open read");
        assert_eq!(stream.size(), 10);
        assert_eq!(read_all(&mut stream), b"0123456789");
    }

    #[test]
    fn seek_clamps_and_normalizes_boundaries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = prefix(&dir);
        write_stream(&prefix, 4, b"0123456789");

        let mut stream = TrunkStream::open(
            backend(),
            &prefix,
            StreamMode::Read,
            TrunkOptions::new(4),
        )
        .expect("open read");

        // Landing exactly on a trunk boundary must not yield a zero-length
        // read from the finished trunk.
        assert_eq!(stream.seek(4, Whence::Set).expect("seek"), 4);
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).expect("read"), 1);
        assert_eq!(buf[0], b'4');

        assert_eq!(stream.seek(-3, Whence::Cur).expect("seek"), 2);
        assert_eq!(stream.seek(2, Whence::End).expect("seek"), 8);
        assert_eq!(stream.seek(-100, Whence::Set).expect("seek"), 0);
        assert_eq!(stream.seek(100, Whence::Set).expect("seek"), 10);
        assert_eq!(stream.read(&mut buf).expect("read"), 0);
    }

    #[test]
    fn pread_spans_trunks_without_moving_cursor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = prefix(&dir);
        write_stream(&prefix, 3, b"abcdefghij");

        let mut stream = TrunkStream::open(
            backend(),
            &prefix,
            StreamMode::Read,
            TrunkOptions::new(3),
        )
        .expect("open read");
        assert_eq!(stream.pread(2, 5).expect("pread"), b"cdefg");
        assert_eq!(stream.tell(), 0);
        // Short only at true end of stream.
        assert_eq!(stream.pread(8, 10).expect("pread"), b"ij");
        assert_eq!(stream.pread(20, 4).expect("pread"), b"");
        assert_eq!(read_all(&mut stream), b"abcdefghij");
    }

    #[test]
    fn truncated_trunk_is_corruption_after_retries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = prefix(&dir);
        write_stream(&prefix, 4, b"01234567");

        let mut stream = TrunkStream::open(
            backend(),
            &prefix,
            StreamMode::Read,
            TrunkOptions::new(4).with_max_read_retries(2),
        )
        .expect("open read");

        // Shrink the first trunk behind the stream's back.
        std::fs::write(format!("{prefix}/0.blk"), b"01").expect("truncate");

        let mut buf = [0u8; 4];
        let n = stream.read(&mut buf).expect("read");
        assert_eq!(&buf[..n], b"01");
        let err = stream.read(&mut buf).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn write_stream_rejects_reads_and_seeks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = prefix(&dir);
        let mut stream = TrunkStream::open(
            backend(),
            &prefix,
            StreamMode::Write,
            TrunkOptions::new(4),
        )
        .expect("open write");
        let mut buf = [0u8; 1];
        assert_eq!(
            stream.read(&mut buf).expect_err("err").kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            stream.seek(0, Whence::Set).expect_err("err").kind(),
            ErrorKind::Unsupported
        );
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = prefix(&dir);
        let mut stream = TrunkStream::open(
            backend(),
            &prefix,
            StreamMode::Write,
            TrunkOptions::new(4),
        )
        .expect("open write");
        stream.close().expect("close");
        stream.close().expect("close again");
        assert_eq!(
            stream.append(b"x").expect_err("err").kind(),
            ErrorKind::Usage
        );
    }

    #[test]
    fn reopened_write_stream_continues_last_trunk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = prefix(&dir);
        write_stream(&prefix, 4, b"01234");
        write_stream(&prefix, 4, b"5678");

        let mut stream = TrunkStream::open(
            backend(),
            &prefix,
            StreamMode::Read,
            TrunkOptions::new(4),
        )
        .expect("open read");
        assert_eq!(read_all(&mut stream), b"012345678");
    }
}
