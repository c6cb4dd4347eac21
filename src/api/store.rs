// Dataset-level surface: resolves storage URIs and versions down to
// record views.
use std::sync::Arc;

use tracing::debug;

use crate::backend::{DiskBackend, HttpBackend};
use crate::core::backend::StorageBackend;
use crate::core::error::{Error, ErrorKind};
use crate::core::manifest::{Manifest, MANIFEST_NAME};
use crate::core::record::RecordStore;
use crate::core::trunk::{StreamMode, TrunkOptions};
use crate::core::view::RecordView;

/// Version written when a dataset is first created without an explicit
/// version name.
const INITIAL_VERSION: &str = "0";

/// A root for row datasets: one storage backend plus a path prefix.
/// Datasets live at `<root>/row/<namespace>/<key>/`, with a `meta.json`
/// manifest next to one directory per version.
pub struct RowStorage {
    backend: Arc<dyn StorageBackend>,
    root: String,
    options: TrunkOptions,
}

impl std::fmt::Debug for RowStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStorage")
            .field("root", &self.root)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RowStorage {
    /// Opens a storage root from a URI. `file://<path>` and plain paths
    /// map to local disk; `http://` and `https://` map to the read-only
    /// HTTP backend.
    pub fn open_uri(uri: &str) -> Result<Self, Error> {
        if let Some(path) = uri.strip_prefix("file://") {
            return Ok(Self::with_backend(Arc::new(DiskBackend::new()), path));
        }
        if uri.starts_with("http://") || uri.starts_with("https://") {
            let backend = HttpBackend::new(uri)?;
            return Ok(Self::with_backend(Arc::new(backend), ""));
        }
        if uri.contains("://") {
            return Err(Error::new(ErrorKind::Unsupported)
                .with_message(format!("unsupported storage uri `{uri}`")));
        }
        Ok(Self::with_backend(Arc::new(DiskBackend::new()), uri))
    }

    /// Root over an explicit backend; `prefix` is prepended to every
    /// object path.
    pub fn with_backend(backend: Arc<dyn StorageBackend>, prefix: &str) -> Self {
        let root = if prefix.is_empty() || prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };
        Self {
            backend,
            root,
            options: TrunkOptions::default(),
        }
    }

    pub fn with_trunk_options(mut self, options: TrunkOptions) -> Self {
        self.options = options;
        self
    }

    /// Opens one dataset version as a full-range view.
    ///
    /// Read mode resolves `version` through the manifest (`None` and
    /// `"latest"` mean the latest tag) and fails with `NotFound` for
    /// unknown versions. Write mode registers the version and tags it
    /// latest; a fresh dataset opened without an explicit version starts
    /// at version `"0"`.
    pub fn open(
        &self,
        namespace: &str,
        key: &str,
        mode: StreamMode,
        version: Option<&str>,
    ) -> Result<RecordView, Error> {
        let dataset = self.dataset_prefix(namespace, key)?;
        let manifest_path = format!("{dataset}{MANIFEST_NAME}");
        let mut manifest = Manifest::load(&self.backend, &manifest_path)?;

        let version = match mode {
            StreamMode::Read => manifest.resolve(version)?.to_owned(),
            StreamMode::Write => {
                let version = match version {
                    None | Some("latest") => manifest
                        .latest
                        .clone()
                        .unwrap_or_else(|| INITIAL_VERSION.to_owned()),
                    Some(version) => version.to_owned(),
                };
                manifest.touch(&version);
                manifest.save(&self.backend, &manifest_path)?;
                version
            }
        };
        debug!(namespace, key, %version, ?mode, "dataset opened");

        let store = RecordStore::open(
            self.backend.clone(),
            &format!("{dataset}{version}/"),
            mode,
            self.options,
        )?;
        Ok(RecordView::root(store))
    }

    /// Registered versions of a dataset, in registration order. Empty
    /// for datasets that do not exist yet.
    pub fn versions(&self, namespace: &str, key: &str) -> Result<Vec<String>, Error> {
        let dataset = self.dataset_prefix(namespace, key)?;
        let manifest = Manifest::load(&self.backend, &format!("{dataset}{MANIFEST_NAME}"))?;
        Ok(manifest.versions)
    }

    fn dataset_prefix(&self, namespace: &str, key: &str) -> Result<String, Error> {
        for (name, value) in [("namespace", namespace), ("key", key)] {
            if value.is_empty() || value.contains('/') || value.contains("..") {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("invalid dataset {name} `{value}`")));
            }
        }
        Ok(format!("{}row/{namespace}/{key}/", self.root))
    }
}

#[cfg(test)]
mod tests {
    use super::RowStorage;
    use crate::core::error::ErrorKind;
    use crate::core::trunk::{StreamMode, TrunkOptions, Whence};

    fn storage(dir: &tempfile::TempDir) -> RowStorage {
        RowStorage::open_uri(&format!("file://{}", dir.path().display()))
            .expect("storage")
            .with_trunk_options(TrunkOptions::new(64))
    }

    #[test]
    fn write_then_read_latest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(&dir);

        let mut writer = storage
            .open("ns", "key", StreamMode::Write, None)
            .expect("open write");
        for i in 0..10u8 {
            writer.write(&[i]).expect("write");
        }
        writer.close().expect("close");

        let mut reader = storage
            .open("ns", "key", StreamMode::Read, None)
            .expect("open read");
        assert_eq!(reader.size(), 10);
        assert_eq!(reader.pread(7).expect("pread"), vec![7]);
        reader.seek(1, Whence::End).expect("seek");
        assert_eq!(reader.read().expect("read"), Some(vec![9]));
        assert_eq!(storage.versions("ns", "key").expect("versions"), vec!["0"]);
    }

    #[test]
    fn named_versions_are_independent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(&dir);

        for (version, byte) in [("v1", 1u8), ("v2", 2u8)] {
            let mut writer = storage
                .open("ns", "key", StreamMode::Write, Some(version))
                .expect("open write");
            writer.write(&[byte]).expect("write");
            writer.close().expect("close");
        }

        let mut latest = storage
            .open("ns", "key", StreamMode::Read, Some("latest"))
            .expect("open latest");
        assert_eq!(latest.read().expect("read"), Some(vec![2]));

        let mut v1 = storage
            .open("ns", "key", StreamMode::Read, Some("v1"))
            .expect("open v1");
        assert_eq!(v1.read().expect("read"), Some(vec![1]));

        assert_eq!(
            storage.versions("ns", "key").expect("versions"),
            vec!["v1", "v2"]
        );
    }

    #[test]
    fn reading_a_missing_dataset_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(&dir);
        assert_eq!(
            storage
                .open("ns", "nope", StreamMode::Read, None)
                .expect_err("err")
                .kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            storage
                .open("ns", "key", StreamMode::Read, Some("v9"))
                .expect_err("err")
                .kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn dataset_names_are_validated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(&dir);
        for (namespace, key) in [("", "key"), ("ns", "a/b"), ("..", "key")] {
            assert_eq!(
                storage
                    .open(namespace, key, StreamMode::Read, None)
                    .expect_err("err")
                    .kind(),
                ErrorKind::Usage
            );
        }
    }

    #[test]
    fn unknown_uri_scheme_is_rejected() {
        assert_eq!(
            RowStorage::open_uri("ftp://example.com/data")
                .expect_err("err")
                .kind(),
            ErrorKind::Unsupported
        );
    }

    #[test]
    fn reopening_for_write_appends_to_the_same_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(&dir);

        let mut writer = storage
            .open("ns", "key", StreamMode::Write, None)
            .expect("open write");
        writer.write(b"first").expect("write");
        writer.close().expect("close");

        let mut writer = storage
            .open("ns", "key", StreamMode::Write, None)
            .expect("reopen write");
        writer.write(b"second").expect("write");
        writer.close().expect("close");

        let mut reader = storage
            .open("ns", "key", StreamMode::Read, None)
            .expect("open read");
        assert_eq!(reader.size(), 2);
        assert_eq!(reader.read().expect("read"), Some(b"first".to_vec()));
        assert_eq!(reader.read().expect("read"), Some(b"second".to_vec()));
        assert_eq!(storage.versions("ns", "key").expect("versions"), vec!["0"]);
    }
}
