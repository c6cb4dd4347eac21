// Storage backend traits: byte-addressable objects behind a narrow contract.
use crate::core::error::Error;

/// Mode for a backend object handle. Handles are read-only or append-only,
/// never both.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    Read,
    Append,
}

/// One open backend object. `read` may return fewer bytes than requested;
/// a zero-length result means the handle (or its byte range) is exhausted.
pub trait StorageFile: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;
    fn append(&mut self, data: &[u8]) -> Result<(), Error>;
    fn flush(&mut self) -> Result<(), Error>;
}

impl std::fmt::Debug for dyn StorageFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StorageFile")
    }
}

/// Byte-addressable object store. `begin`/`end` select a byte range for
/// read handles; backends that cannot honor a requested range must fail
/// hard rather than silently serve the whole object.
pub trait StorageBackend: Send + Sync {
    fn open(
        &self,
        path: &str,
        mode: OpenMode,
        begin: Option<u64>,
        end: Option<u64>,
    ) -> Result<Box<dyn StorageFile>, Error>;

    /// Size of the object, or `None` when it does not exist.
    fn filesize(&self, path: &str) -> Result<Option<u64>, Error>;

    /// Atomically replace the object's contents.
    fn put(&self, path: &str, data: &[u8]) -> Result<(), Error>;

    /// Read a whole object into memory.
    fn read_object(&self, path: &str) -> Result<Vec<u8>, Error> {
        let mut handle = self.open(path, OpenMode::Read, None, None)?;
        let mut out = Vec::new();
        let mut chunk = [0u8; 128 * 1024];
        loop {
            let n = handle.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }
}
