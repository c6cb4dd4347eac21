// Local filesystem backend with byte-range read handles.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::core::backend::{OpenMode, StorageBackend, StorageFile};
use crate::core::error::{Error, ErrorKind};

/// Stateless local-disk backend; paths are plain filesystem paths.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiskBackend;

impl DiskBackend {
    pub fn new() -> Self {
        Self
    }
}

struct DiskFile {
    file: File,
    // Bytes left in the requested range; None means unbounded.
    remaining: Option<u64>,
}

impl StorageFile for DiskFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let limit = match self.remaining {
            Some(0) => return Ok(0),
            Some(rest) => buf.len().min(rest as usize),
            None => buf.len(),
        };
        let n = self
            .file
            .read(&mut buf[..limit])
            .map_err(|err| Error::new(map_io_error_kind(&err)).with_source(err))?;
        if let Some(rest) = self.remaining.as_mut() {
            *rest -= n as u64;
        }
        Ok(n)
    }

    fn append(&mut self, data: &[u8]) -> Result<(), Error> {
        self.file
            .write_all(data)
            .map_err(|err| Error::new(map_io_error_kind(&err)).with_source(err))
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.file
            .flush()
            .map_err(|err| Error::new(map_io_error_kind(&err)).with_source(err))
    }
}

impl StorageBackend for DiskBackend {
    fn open(
        &self,
        path: &str,
        mode: OpenMode,
        begin: Option<u64>,
        end: Option<u64>,
    ) -> Result<Box<dyn StorageFile>, Error> {
        match mode {
            OpenMode::Read => {
                let mut file = File::open(path).map_err(|err| {
                    Error::new(map_io_error_kind(&err))
                        .with_path(path)
                        .with_source(err)
                })?;
                let begin = begin.unwrap_or(0);
                if begin > 0 {
                    file.seek(SeekFrom::Start(begin)).map_err(|err| {
                        Error::new(ErrorKind::Io).with_path(path).with_source(err)
                    })?;
                }
                let remaining = match end {
                    Some(end) if end < begin => {
                        return Err(Error::new(ErrorKind::Usage)
                            .with_message("range end precedes range begin")
                            .with_path(path));
                    }
                    Some(end) => Some(end - begin),
                    None => None,
                };
                Ok(Box::new(DiskFile { file, remaining }))
            }
            OpenMode::Append => {
                if let Some(parent) = Path::new(path).parent() {
                    fs::create_dir_all(parent).map_err(|err| {
                        Error::new(map_io_error_kind(&err))
                            .with_path(path)
                            .with_source(err)
                    })?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|err| {
                        Error::new(map_io_error_kind(&err))
                            .with_path(path)
                            .with_source(err)
                    })?;
                Ok(Box::new(DiskFile {
                    file,
                    remaining: None,
                }))
            }
        }
    }

    fn filesize(&self, path: &str) -> Result<Option<u64>, Error> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::new(map_io_error_kind(&err))
                .with_path(path)
                .with_source(err)),
        }
    }

    fn put(&self, path: &str, data: &[u8]) -> Result<(), Error> {
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent).map_err(|err| {
                Error::new(map_io_error_kind(&err))
                    .with_path(path)
                    .with_source(err)
            })?;
        }
        // Stage in the same directory and rename so readers never see a
        // torn object.
        let staging = format!("{path}.tmp-{}", std::process::id());
        fs::write(&staging, data).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_path(&staging)
                .with_source(err)
        })?;
        fs::rename(&staging, path).map_err(|err| {
            let _ = fs::remove_file(&staging);
            Error::new(map_io_error_kind(&err))
                .with_path(path)
                .with_source(err)
        })
    }
}

fn map_io_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        _ => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::DiskBackend;
    use crate::core::backend::{OpenMode, StorageBackend};
    use crate::core::error::ErrorKind;

    fn path_str(path: &std::path::Path) -> String {
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn filesize_of_missing_object_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = DiskBackend::new();
        let missing = path_str(&dir.path().join("nope.blk"));
        assert_eq!(backend.filesize(&missing).expect("filesize"), None);
    }

    #[test]
    fn ranged_read_honors_begin_and_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = DiskBackend::new();
        let path = path_str(&dir.path().join("obj.blk"));
        backend.put(&path, b"0123456789").expect("put");

        let mut handle = backend
            .open(&path, OpenMode::Read, Some(2), Some(6))
            .expect("open");
        let mut buf = [0u8; 16];
        let n = handle.read(&mut buf).expect("read");
        assert_eq!(&buf[..n], b"2345");
        assert_eq!(handle.read(&mut buf).expect("read"), 0);
    }

    #[test]
    fn append_creates_missing_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = DiskBackend::new();
        let path = path_str(&dir.path().join("a/b/c.blk"));
        let mut handle = backend
            .open(&path, OpenMode::Append, None, None)
            .expect("open");
        handle.append(b"hello").expect("append");
        handle.flush().expect("flush");
        assert_eq!(backend.filesize(&path).expect("filesize"), Some(5));
    }

    #[test]
    fn inverted_range_is_usage_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = DiskBackend::new();
        let path = path_str(&dir.path().join("obj.blk"));
        backend.put(&path, b"abc").expect("put");
        let err = backend
            .open(&path, OpenMode::Read, Some(2), Some(1))
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn put_replaces_contents_and_leaves_no_staging_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = DiskBackend::new();
        let path = path_str(&dir.path().join("meta.json"));
        backend.put(&path, b"first").expect("put");
        backend.put(&path, b"second").expect("replace");
        assert_eq!(backend.read_object(&path).expect("read"), b"second");
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .collect::<Result<_, _>>()
            .expect("entries");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn read_object_returns_full_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = DiskBackend::new();
        let path = path_str(&dir.path().join("obj.blk"));
        backend.put(&path, b"payload").expect("put");
        assert_eq!(backend.read_object(&path).expect("read"), b"payload");
    }
}
