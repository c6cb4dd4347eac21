// Read-only HTTP(S) backend using range requests against a base URL.
use std::io::Read;

use url::Url;

use crate::core::backend::{OpenMode, StorageBackend, StorageFile};
use crate::core::error::{Error, ErrorKind};

pub struct HttpBackend {
    agent: ureq::Agent,
    base: Url,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl HttpBackend {
    /// `base` is the URL prefix all object paths resolve against; a
    /// trailing slash is added when missing so joins stay inside it.
    pub fn new(base: &str) -> Result<Self, Error> {
        let normalized = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{base}/")
        };
        let base = Url::parse(&normalized).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid base url `{normalized}`"))
                .with_source(err)
        })?;
        Ok(Self {
            agent: ureq::AgentBuilder::new().build(),
            base,
        })
    }

    fn object_url(&self, path: &str) -> Result<Url, Error> {
        let relative = path.trim_start_matches('/');
        self.base.join(relative).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid object path `{path}`"))
                .with_source(err)
        })
    }
}

struct HttpFile {
    reader: Box<dyn Read + Send + Sync>,
}

impl StorageFile for HttpFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.reader
            .read(buf)
            .map_err(|err| Error::new(ErrorKind::Io).with_source(err))
    }

    fn append(&mut self, _data: &[u8]) -> Result<(), Error> {
        Err(Error::new(ErrorKind::Unsupported).with_message("http objects are read-only"))
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl StorageBackend for HttpBackend {
    fn open(
        &self,
        path: &str,
        mode: OpenMode,
        begin: Option<u64>,
        end: Option<u64>,
    ) -> Result<Box<dyn StorageFile>, Error> {
        if mode != OpenMode::Read {
            return Err(Error::new(ErrorKind::Unsupported)
                .with_message("http storage is read-only")
                .with_path(path));
        }
        let url = self.object_url(path)?;
        let mut request = self.agent.get(url.as_str());
        let range = range_header(begin, end);
        let ranged = range.is_some();
        if let Some(range) = &range {
            request = request.set("Range", range);
        }
        let response = request.call().map_err(|err| map_http_error(err, path))?;
        if ranged && response.header("content-range").is_none() {
            return Err(Error::new(ErrorKind::Unsupported)
                .with_message("storage server ignored the range header")
                .with_path(path));
        }
        Ok(Box::new(HttpFile {
            reader: response.into_reader(),
        }))
    }

    fn filesize(&self, path: &str) -> Result<Option<u64>, Error> {
        let url = self.object_url(path)?;
        let response = match self.agent.head(url.as_str()).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(err) => return Err(map_http_error(err, path)),
        };
        let length = response.header("content-length").ok_or_else(|| {
            Error::new(ErrorKind::Unsupported)
                .with_message("storage server does not report content-length")
                .with_path(path)
        })?;
        length
            .parse::<u64>()
            .map(Some)
            .map_err(|err| {
                Error::new(ErrorKind::Corrupt)
                    .with_message(format!("bad content-length `{length}`"))
                    .with_path(path)
                    .with_source(err)
            })
    }

    fn put(&self, path: &str, _data: &[u8]) -> Result<(), Error> {
        Err(Error::new(ErrorKind::Unsupported)
            .with_message("http storage is read-only")
            .with_path(path))
    }
}

/// Builds the Range header for a `[begin, end)` byte window. A missing
/// `begin` means 0, never an HTTP suffix range; HTTP ranges are
/// end-inclusive while the contract's `end` is not.
fn range_header(begin: Option<u64>, end: Option<u64>) -> Option<String> {
    if begin.is_none() && end.is_none() {
        return None;
    }
    let from = begin.unwrap_or(0);
    let to = end.map(|v| v.saturating_sub(1).to_string()).unwrap_or_default();
    Some(format!("bytes={from}-{to}"))
}

fn map_http_error(err: ureq::Error, path: &str) -> Error {
    match err {
        ureq::Error::Status(404, _) => Error::new(ErrorKind::NotFound).with_path(path),
        ureq::Error::Status(code, _) => Error::new(ErrorKind::Io)
            .with_message(format!("unexpected response code {code}"))
            .with_path(path),
        ureq::Error::Transport(transport) => Error::new(ErrorKind::Io)
            .with_path(path)
            .with_source(transport),
    }
}
