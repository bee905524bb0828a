//! Persisted build state and the up-to-date check.

mod record;

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

pub use crate::state::record::{BuildArgs, DependencyInfo, FORMAT_VERSION, FileInfo};

use crate::config::{ChangeDetection, Config};
use crate::core::{Hash32, lock, portable};
use crate::error::StateError;

const RECORD_EXTENSION: &str = "dep";

/// Why a target has to be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildReason {
    Forced,
    NoRecord,
    /// The record exists but could not be decoded.
    Unreadable(String),
    /// The record was written by an incompatible version.
    FormatChanged,
    TargetMissing(Utf8PathBuf),
    ArgsChanged,
    DependencyMissing(Utf8PathBuf),
    DependencyChanged(Utf8PathBuf),
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forced => write!(f, "rebuild forced"),
            Self::NoRecord => write!(f, "no previous build"),
            Self::Unreadable(e) => write!(f, "previous build record is unreadable: {e}"),
            Self::FormatChanged => write!(f, "previous build record has an old format"),
            Self::TargetMissing(path) => write!(f, "target '{path}' is missing"),
            Self::ArgsChanged => write!(f, "build arguments changed"),
            Self::DependencyMissing(path) => write!(f, "dependency '{path}' is missing"),
            Self::DependencyChanged(path) => write!(f, "dependency '{path}' changed"),
        }
    }
}

/// The outcome of [`StateTracker::check`].
#[derive(Debug, Clone)]
pub struct Check {
    /// The record left by the previous build, if it could be read.
    pub previous: Option<DependencyInfo>,
    /// `None` if the target is up to date.
    pub reason: Option<RebuildReason>,
}

impl Check {
    pub fn is_up_to_date(&self) -> bool {
        self.reason.is_none()
    }
}

/// Decides whether targets are up to date and records what they were built
/// from.
///
/// One record is kept per target, either next to it as `<target>.dep` or in a
/// configured state directory. Content digests computed during a run are
/// cached in memory keyed by path and modification time, so no file is hashed
/// twice while it stays unchanged.
#[derive(Debug)]
pub struct StateTracker {
    force: bool,
    detection: ChangeDetection,
    state_dir: Option<Utf8PathBuf>,
    digests: Mutex<HashMap<Utf8PathBuf, (SystemTime, Hash32)>>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

impl StateTracker {
    pub fn new(config: &Config) -> Self {
        Self {
            force: config.force,
            detection: config.change_detection,
            state_dir: config.state_dir.clone(),
            digests: Mutex::new(HashMap::new()),
        }
    }

    pub fn detection(&self) -> ChangeDetection {
        self.detection
    }

    /// Where the record for `target` is stored.
    pub fn record_path(&self, target: &Utf8Path) -> Utf8PathBuf {
        match &self.state_dir {
            Some(dir) => {
                let name = Hash32::hash(portable(target)).to_hex();
                dir.join(format!("{name}.{RECORD_EXTENSION}"))
            }
            None => Utf8PathBuf::from(format!("{target}.{RECORD_EXTENSION}")),
        }
    }

    /// Reads the record stored for `target`. A missing record is `Ok(None)`.
    pub fn load(&self, target: &Utf8Path) -> Result<Option<DependencyInfo>, StateError> {
        let path = self.record_path(target);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::Io(path, e)),
        };

        ciborium::from_reader(BufReader::new(file))
            .map(Some)
            .map_err(|e| StateError::Decode(path, e.to_string()))
    }

    /// Checks whether `target` is up to date with respect to `args` and the
    /// dependencies it was last built from. Never writes anything.
    pub fn check(&self, target: &Utf8Path, args: &BuildArgs) -> Check {
        let check = self.check_inner(target, args);
        match &check.reason {
            Some(reason) => tracing::debug!(target: "kiln::reason", "{}: {}", target, reason),
            None => tracing::debug!(target: "kiln::reason", "{}: up to date", target),
        }
        check
    }

    fn check_inner(&self, target: &Utf8Path, args: &BuildArgs) -> Check {
        let loaded = self.load(target);

        if self.force {
            let previous = loaded.ok().flatten().filter(|r| r.version == FORMAT_VERSION);
            return rebuild(previous, RebuildReason::Forced);
        }

        let previous = match loaded {
            Ok(Some(record)) if record.version == FORMAT_VERSION => record,
            Ok(Some(_)) => return rebuild(None, RebuildReason::FormatChanged),
            Ok(None) => return rebuild(None, RebuildReason::NoRecord),
            Err(e) => return rebuild(None, RebuildReason::Unreadable(e.to_string())),
        };

        if let Some(missing) = previous.targets.iter().find(|t| !t.path.exists()) {
            let reason = RebuildReason::TargetMissing(missing.path.clone());
            return rebuild(Some(previous), reason);
        }

        if previous.args != *args {
            return rebuild(Some(previous), RebuildReason::ArgsChanged);
        }

        let changed = previous.dependencies.iter().find_map(|dep| self.compare(dep));
        if let Some(reason) = changed {
            return rebuild(Some(previous), reason);
        }

        Check {
            previous: Some(previous),
            reason: None,
        }
    }

    fn compare(&self, recorded: &FileInfo) -> Option<RebuildReason> {
        let modified = match record::modified(&recorded.path) {
            Ok(modified) => modified,
            Err(_) => return Some(RebuildReason::DependencyMissing(recorded.path.clone())),
        };

        if modified <= recorded.modified {
            return None;
        }

        if let (ChangeDetection::Digest, Some(digest)) = (self.detection, recorded.digest)
            && let Ok(current) = self.digest_at(&recorded.path, modified)
            && current == digest
        {
            return None;
        }

        Some(RebuildReason::DependencyChanged(recorded.path.clone()))
    }

    /// Snapshots the current state of `targets` and `dependencies`.
    ///
    /// With `calculate_digests` set, every dependency is hashed as well, in
    /// parallel. Digests are always computed in [`ChangeDetection::Digest`]
    /// mode.
    pub fn create_dependency_info<T, D>(
        &self,
        targets: T,
        args: BuildArgs,
        dependencies: D,
        calculate_digests: bool,
    ) -> Result<DependencyInfo, StateError>
    where
        T: IntoIterator,
        T::Item: AsRef<Utf8Path>,
        D: IntoIterator,
        D::Item: AsRef<Utf8Path>,
    {
        let targets = targets
            .into_iter()
            .map(|path| FileInfo::snapshot(path.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        if targets.is_empty() {
            return Err(StateError::NoTargets);
        }

        let calculate_digests = calculate_digests || self.detection == ChangeDetection::Digest;
        let dependencies = self.snapshot_dependencies(dependencies, calculate_digests)?;

        Ok(DependencyInfo::new(targets, args, dependencies))
    }

    /// Snapshots `dependencies`, dropping duplicates and sorting by path.
    pub(crate) fn snapshot_dependencies<D>(
        &self,
        dependencies: D,
        calculate_digests: bool,
    ) -> Result<Vec<FileInfo>, StateError>
    where
        D: IntoIterator,
        D::Item: AsRef<Utf8Path>,
    {
        let mut paths: Vec<Utf8PathBuf> = dependencies
            .into_iter()
            .map(|path| path.as_ref().to_owned())
            .collect();
        paths.sort();
        paths.dedup();

        paths
            .into_par_iter()
            .map(|path| {
                let mut info = FileInfo::snapshot(&path)?;
                if calculate_digests {
                    info.digest = Some(self.digest_at(&path, info.modified)?);
                }
                Ok(info)
            })
            .collect()
    }

    /// Content digest of `path`, taken from the in-memory cache while the
    /// file's modification time is still `modified`.
    pub fn file_digest(&self, path: &Utf8Path) -> Result<Hash32, StateError> {
        let modified = record::modified(path)?;
        self.digest_at(path, modified)
    }

    fn digest_at(&self, path: &Utf8Path, modified: SystemTime) -> Result<Hash32, StateError> {
        if let Some(&(at, digest)) = lock(&self.digests).get(path)
            && at == modified
        {
            return Ok(digest);
        }

        let digest = Hash32::hash_file(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StateError::MissingDependency(path.to_owned()),
            _ => StateError::Io(path.to_owned(), e),
        })?;

        lock(&self.digests).insert(path.to_owned(), (modified, digest));
        Ok(digest)
    }

    /// Seeds the digest cache with the digests of a previous record. They are
    /// used only while the files keep their recorded modification time. An
    /// entry for an older modification time is replaced.
    pub fn prime_digest_cache(&self, record: &DependencyInfo) {
        let mut digests = lock(&self.digests);
        for dep in &record.dependencies {
            let Some(digest) = dep.digest else {
                continue;
            };
            match digests.get(&dep.path) {
                Some(&(at, _)) if at >= dep.modified => {}
                _ => {
                    digests.insert(dep.path.clone(), (dep.modified, digest));
                }
            }
        }
    }

    /// Persists `record` for each of its targets, replacing previous records
    /// atomically.
    pub fn store(&self, record: &DependencyInfo) -> Result<(), StateError> {
        if record.targets.is_empty() {
            return Err(StateError::NoTargets);
        }

        for target in &record.targets {
            let path = self.record_path(&target.path);
            write_atomic(&path, |writer| {
                ciborium::into_writer(record, writer)
                    .map_err(|e| StateError::Encode(path.clone(), e.to_string()))
            })?;
        }

        Ok(())
    }
}

fn rebuild(previous: Option<DependencyInfo>, reason: RebuildReason) -> Check {
    Check {
        previous,
        reason: Some(reason),
    }
}

/// Writes a file next to `path` and renames it into place, so readers never
/// see a partial file.
pub(crate) fn write_atomic<E>(
    path: &Utf8Path,
    write: impl FnOnce(&mut BufWriter<File>) -> Result<(), E>,
) -> Result<(), E>
where
    E: From<StateError>,
{
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let io = |e| E::from(StateError::Io(path.to_owned(), e));

    if let Some(parent) = path.parent()
        && !parent.as_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(io)?;
    }

    let temp = Utf8PathBuf::from(format!(
        "{}.{}-{}.tmp",
        path,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let result = File::create(&temp).map_err(io).and_then(|file| {
        let mut writer = BufWriter::new(file);
        write(&mut writer)?;
        writer
            .into_inner()
            .map_err(|e| io(e.into_error()))?
            .sync_all()
            .map_err(io)
    });

    if let Err(e) = result {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }

    fs::rename(&temp, path).map_err(|e| {
        let _ = fs::remove_file(&temp);
        io(e)
    })
}
