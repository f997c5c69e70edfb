//! Substitution map loading.
//!
//! The substitution map is the set of key/value pairs injected into every
//! target resource's `spec.postBuild.substitute`. It is loaded once at startup
//! from a mounted directory (typically a ConfigMap volume) where each file name
//! is a key and the file contents are the value.

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};

/// Default directory the substitution ConfigMap is mounted at
pub const DEFAULT_CONFIG_DIR: &str = "/etc/config";

/// Errors raised while loading substitutions
#[derive(Error, Debug)]
pub enum SubstitutionError {
    /// The source directory itself could not be read
    #[error("cannot read substitution directory {path}: {source}")]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A single entry in the source could not be read
    #[error("cannot read substitution entry {path}: {source}")]
    EntryUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Read-only key/value substitutions, ordered by key.
///
/// Ordering is what makes generated patches reproducible: two runs against
/// the same map emit the same operations in the same order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubstitutionMap {
    entries: BTreeMap<String, String>,
}

impl SubstitutionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SubstitutionMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl<'a> IntoIterator for &'a SubstitutionMap {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// A source of substitutions, consulted once at startup.
pub trait SubstitutionSource {
    /// Load the full substitution map.
    ///
    /// An empty map is a valid result. Errors are reserved for a source that
    /// cannot be read at all.
    fn load(&self) -> Result<SubstitutionMap, SubstitutionError>;
}

/// Loads substitutions from the files of a single directory.
///
/// Hidden entries are skipped, which also skips the `..data` and timestamped
/// directories kubelet maintains inside ConfigMap volumes. Directories are
/// skipped; symlinks are followed.
#[derive(Clone, Debug)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SubstitutionSource for DirectorySource {
    fn load(&self) -> Result<SubstitutionMap, SubstitutionError> {
        let entries =
            fs::read_dir(&self.dir).map_err(|source| SubstitutionError::SourceUnavailable {
                path: self.dir.clone(),
                source,
            })?;

        let mut substitutions = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|source| SubstitutionError::SourceUnavailable {
                path: self.dir.clone(),
                source,
            })?;

            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    warn!(name = ?raw, "Skipping substitution file with a non-UTF-8 name");
                    continue;
                }
            };
            if name.starts_with('.') {
                continue;
            }

            let path = entry.path();
            if path.is_dir() {
                continue;
            }

            let bytes = fs::read(&path).map_err(|source| SubstitutionError::EntryUnreadable {
                path: path.clone(),
                source,
            })?;
            let value = String::from_utf8(bytes).map_err(|e| SubstitutionError::EntryUnreadable {
                path,
                source: io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("contents are not valid UTF-8 ({})", e.utf8_error()),
                ),
            })?;
            debug!(key = %name, "Loaded substitution");
            substitutions.insert(name, value);
        }

        if substitutions.is_empty() {
            warn!(dir = %self.dir.display(), "No substitutions found in directory");
        }

        Ok(SubstitutionMap {
            entries: substitutions,
        })
    }
}
