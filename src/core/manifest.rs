// Dataset manifest: the meta.json object naming known versions and the
// one tagged "latest".
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::backend::StorageBackend;
use crate::core::error::{Error, ErrorKind};

pub const MANIFEST_NAME: &str = "meta.json";

/// Version bookkeeping for one dataset. Versions are opaque strings;
/// ordering in `versions` is registration order, and `latest` always
/// names one of them (or nothing for an empty manifest).
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Manifest {
    #[serde(default)]
    pub latest: Option<String>,
    #[serde(default)]
    pub versions: Vec<String>,
}

impl Manifest {
    /// Loads the manifest at `path`, or an empty one when the object does
    /// not exist yet. A present-but-unparsable manifest is corruption.
    pub fn load(backend: &Arc<dyn StorageBackend>, path: &str) -> Result<Self, Error> {
        if backend.filesize(path)?.is_none() {
            return Ok(Self::default());
        }
        let raw = backend.read_object(path)?;
        serde_json::from_slice(&raw).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("manifest is not valid JSON")
                .with_path(path)
                .with_source(err)
        })
    }

    pub fn save(&self, backend: &Arc<dyn StorageBackend>, path: &str) -> Result<(), Error> {
        let raw = serde_json::to_vec(self).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("manifest serialization failed")
                .with_source(err)
        })?;
        backend.put(path, &raw)?;
        debug!(path, latest = ?self.latest, "manifest saved");
        Ok(())
    }

    /// Maps a requested version to a concrete one: `None` or `"latest"`
    /// resolve through the latest tag, anything else must be registered.
    pub fn resolve(&self, version: Option<&str>) -> Result<&str, Error> {
        match version {
            None | Some("latest") => self.latest.as_deref().ok_or_else(|| {
                Error::new(ErrorKind::NotFound).with_message("dataset has no versions")
            }),
            Some(version) => self
                .versions
                .iter()
                .find(|known| known.as_str() == version)
                .map(String::as_str)
                .ok_or_else(|| {
                    Error::new(ErrorKind::NotFound)
                        .with_message(format!("version {version} is not registered"))
                }),
        }
    }

    /// Registers `version` if new and tags it latest either way.
    pub fn touch(&mut self, version: &str) {
        if !self.versions.iter().any(|known| known == version) {
            self.versions.push(version.to_owned());
        }
        self.latest = Some(version.to_owned());
    }
}
