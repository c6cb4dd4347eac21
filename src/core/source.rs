// The operation seam shared by store views, shufflers, and share proxies.
use crate::core::error::{Error, ErrorKind};
use crate::core::trunk::Whence;

/// Anything a relay can serve: the record-level operation set. Sequential
/// exhaustion is `Ok(None)`; implementations answer `Unsupported` for
/// operations outside their shape (e.g. `pread` on a shuffler).
pub trait RecordSource: Send {
    fn read(&mut self) -> Result<Option<Vec<u8>>, Error>;

    fn write(&mut self, _record: &[u8]) -> Result<(), Error> {
        Err(Error::new(ErrorKind::Unsupported).with_message("source is not writable"))
    }

    fn seek(&mut self, _offset: i64, _whence: Whence) -> Result<u64, Error> {
        Err(Error::new(ErrorKind::Unsupported).with_message("source is not seekable"))
    }

    fn pread(&mut self, _n: u64) -> Result<Vec<u8>, Error> {
        Err(Error::new(ErrorKind::Unsupported).with_message("source is not randomly addressable"))
    }

    fn size(&self) -> u64;

    fn tell(&self) -> u64;

    fn set_epoch(&mut self, _epoch: u64) -> Result<(), Error> {
        Err(Error::new(ErrorKind::Unsupported).with_message("source has no epochs"))
    }

    fn flush(&mut self) -> Result<(), Error>;

    fn close(&mut self) -> Result<(), Error>;
}
