use std::fmt;
use std::fs;
use std::io;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32};
use crate::error::StateError;

/// Bumped whenever the layout of [`DependencyInfo`] changes. Records written
/// with another version are ignored.
pub const FORMAT_VERSION: u32 = 1;

/// A file as observed at some point during a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: Utf8PathBuf,
    pub modified: SystemTime,
    /// Content digest, present only when it was asked for.
    pub digest: Option<Hash32>,
}

impl FileInfo {
    /// Reads the current modification time of `path`.
    pub fn snapshot(path: &Utf8Path) -> Result<Self, StateError> {
        Ok(Self {
            path: path.to_owned(),
            modified: modified(path)?,
            digest: None,
        })
    }
}

/// Returns the modification time of `path`, reporting a missing file as
/// [`StateError::MissingDependency`].
pub(crate) fn modified(path: &Utf8Path) -> Result<SystemTime, StateError> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StateError::MissingDependency(path.to_owned()),
            _ => StateError::Io(path.to_owned(), e),
        })
}

/// The arguments a target was built with.
///
/// Any change to these bytes forces a rebuild, so they should capture
/// everything about the command that affects its output, for example the
/// compiler invocation.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildArgs(Vec<u8>);

impl BuildArgs {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Encodes a command line. Each argument is length-prefixed so that
    /// `["a b"]` and `["a", "b"]` differ.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut bytes = Vec::new();
        for arg in args {
            let arg = arg.as_ref().as_bytes();
            bytes.extend_from_slice(&(arg.len() as u64).to_le_bytes());
            bytes.extend_from_slice(arg);
        }
        Self(bytes)
    }

    /// Encodes any serializable value as CBOR.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, ciborium::ser::Error<io::Error>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(value, &mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn digest(&self) -> Hash32 {
        Blake3Hasher::default().field(&self.0).finish()
    }
}

impl fmt::Debug for BuildArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BuildArgs({} bytes, {})", self.0.len(), self.digest())
    }
}

/// What a set of targets was built from.
///
/// Records are never updated in place. Each successful build replaces the
/// previous record wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyInfo {
    pub version: u32,
    pub targets: Vec<FileInfo>,
    pub args: BuildArgs,
    pub dependencies: Vec<FileInfo>,
}

impl DependencyInfo {
    pub fn new(targets: Vec<FileInfo>, args: BuildArgs, dependencies: Vec<FileInfo>) -> Self {
        Self {
            version: FORMAT_VERSION,
            targets,
            args,
            dependencies,
        }
    }

    /// The first target, which names the record.
    pub fn primary(&self) -> Option<&FileInfo> {
        self.targets.first()
    }

    pub fn dependency_paths(&self) -> impl Iterator<Item = &Utf8Path> {
        self.dependencies.iter().map(|dep| dep.path.as_path())
    }

    /// True if every dependency carries a content digest.
    pub fn has_digests(&self) -> bool {
        self.dependencies.iter().all(|dep| dep.digest.is_some())
    }
}
