//! Content-addressable store of build artifacts.
//!
//! Both kinds of entries live in one tree, `<root>/<h0>/<h1>/<hex>`, named by
//! different digests:
//!
//! * the *target digest* (hash of the target path) names a directory of
//!   variant records, one per set of dependency paths the target has been
//!   built from;
//! * the *object digest* (hash of the target path, the build arguments and
//!   every dependency's content) names a zlib-compressed artifact.
//!
//! Entries are immutable and written only if absent. The artifact is always
//! written before its variant record, so a reader that finds a variant can
//! rely on the artifact being complete.

use std::fs::{self, File};
use std::io::{self, BufReader};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::{Blake3Hasher, Hash32, portable};
use crate::error::CacheError;
use crate::state::{BuildArgs, DependencyInfo, FileInfo, StateTracker, write_atomic};

const VARIANT_MAGIC: &str = "kiln-variant-1";

/// A variant record: the dependency paths of one build, followed by a marker
/// that a truncated record would lack.
#[derive(Debug, Serialize, Deserialize)]
struct Variant(Vec<String>, String);

/// The result of [`ObjectCache::try_restore`].
#[derive(Debug, Default)]
pub struct Restore {
    /// The record stored for the target, if it was restored.
    pub record: Option<DependencyInfo>,
    /// Files that could not be written while restoring. A failed extraction
    /// skips the candidate artifact, a failed record write does not undo the
    /// hit.
    pub warnings: Vec<CacheError>,
}

impl Restore {
    pub fn is_hit(&self) -> bool {
        self.record.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ObjectCache {
    root: Utf8PathBuf,
    workspace: Option<Utf8PathBuf>,
}

impl ObjectCache {
    /// A cache rooted at `root`. With a `workspace`, paths below it are keyed
    /// relative to it.
    pub fn new(root: impl Into<Utf8PathBuf>, workspace: Option<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            workspace: workspace.map(|workspace| absolute(&workspace)),
        }
    }

    /// The cache configured by `config`, if any.
    pub fn from_config(config: &Config) -> Option<Self> {
        let root = config.cache_root.as_ref()?;
        Some(Self::new(root.clone(), config.workspace_root.clone()))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The location of the entry named by `digest`.
    pub fn entry_path(&self, digest: Hash32) -> Utf8PathBuf {
        let hex = digest.to_hex();
        self.root.join(&hex[0..1]).join(&hex[1..2]).join(&hex)
    }

    /// Relative paths are taken against the working directory before they
    /// are compared with the workspace, so that [`resolve`](Self::resolve)
    /// gives back the same file.
    fn key(&self, path: &Utf8Path) -> String {
        let Some(workspace) = &self.workspace else {
            return portable(path);
        };

        let path = absolute(path);
        match path.strip_prefix(workspace) {
            Ok(relative) => portable(relative),
            Err(_) => portable(&path),
        }
    }

    fn resolve(&self, key: &str) -> Utf8PathBuf {
        let path = Utf8Path::new(key);
        match &self.workspace {
            Some(workspace) if path.is_relative() => workspace.join(path),
            _ => path.to_owned(),
        }
    }

    pub fn target_digest(&self, target: &Utf8Path) -> Hash32 {
        Hash32::hash(self.key(target))
    }

    /// Identifies a set of dependency paths, independent of their order.
    pub fn dependency_digest<I>(&self, dependencies: I) -> Hash32
    where
        I: IntoIterator,
        I::Item: AsRef<Utf8Path>,
    {
        let mut keys = self.keys(dependencies);
        keys.dedup();

        let mut hasher = Blake3Hasher::default();
        for key in &keys {
            hasher.field(key);
        }
        hasher.finish()
    }

    /// Identifies one build of `target`. Every dependency must carry its
    /// content digest; one without is hashed as an empty digest.
    pub fn object_digest(&self, target: &Utf8Path, args: &BuildArgs, dependencies: &[FileInfo]) -> Hash32 {
        let mut deps: Vec<(String, Hash32)> = dependencies
            .iter()
            .map(|dep| (self.key(&dep.path), dep.digest.unwrap_or_default()))
            .collect();
        deps.sort();

        let mut hasher = Blake3Hasher::default();
        hasher.field(self.key(target)).field(args.as_bytes());
        for (key, digest) in &deps {
            hasher.field(key).field(digest.as_bytes());
        }
        hasher.finish()
    }

    fn keys<I>(&self, paths: I) -> Vec<String>
    where
        I: IntoIterator,
        I::Item: AsRef<Utf8Path>,
    {
        let mut keys: Vec<String> = paths.into_iter().map(|p| self.key(p.as_ref())).collect();
        keys.sort();
        keys
    }

    /// Looks for an artifact built from the current content of a dependency
    /// set previously used for `target`, and extracts it to `target`.
    ///
    /// On a hit the dependency record of `target` is replaced with one that
    /// reflects the current dependency files. Every problem with a cache
    /// entry makes it a miss.
    pub fn try_restore(
        &self,
        target: &Utf8Path,
        args: &BuildArgs,
        previous: Option<&DependencyInfo>,
        tracker: &StateTracker,
    ) -> Restore {
        if let Some(previous) = previous {
            tracker.prime_digest_cache(previous);
        }

        let mut restore = Restore::default();

        let dir = self.entry_path(self.target_digest(target));
        let Ok(entries) = fs::read_dir(&dir) else {
            tracing::debug!(target: "kiln::cache", "{}: no cached variants", target);
            return restore;
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.parse::<Hash32>().is_err() {
                continue;
            }

            let variant = dir.join(name);
            let Some(paths) = self.read_variant(&variant) else {
                tracing::debug!(target: "kiln::cache", "skipping malformed variant {}", variant);
                continue;
            };

            let dependencies = match tracker.snapshot_dependencies(&paths, true) {
                Ok(dependencies) => dependencies,
                Err(e) => {
                    tracing::debug!(target: "kiln::cache", "skipping variant {}: {}", variant, e);
                    continue;
                }
            };

            let artifact = self.entry_path(self.object_digest(target, args, &dependencies));
            if !artifact.is_file() {
                continue;
            }

            if let Err(e) = extract(&artifact, target) {
                restore.warnings.push(e);
                continue;
            }

            let record = match FileInfo::snapshot(target) {
                Ok(info) => DependencyInfo::new(vec![info], args.clone(), dependencies),
                Err(e) => {
                    restore.warnings.push(e.into());
                    continue;
                }
            };
            if let Err(e) = tracker.store(&record) {
                restore.warnings.push(e.into());
            }

            tracing::debug!(target: "kiln::cache", "{}: restored from {}", target, artifact);
            restore.record = Some(record);
            return restore;
        }

        tracing::debug!(target: "kiln::cache", "{}: no matching artifact", target);
        restore
    }

    fn read_variant(&self, path: &Utf8Path) -> Option<Vec<Utf8PathBuf>> {
        let file = File::open(path).ok()?;
        let Variant(keys, magic) = ciborium::from_reader(BufReader::new(file)).ok()?;
        if magic != VARIANT_MAGIC {
            return None;
        }
        Some(keys.iter().map(|key| self.resolve(key)).collect())
    }

    /// Adds a freshly built `target` to the cache.
    ///
    /// `dependencies` are the files the build read. Digests missing from them
    /// are computed through `tracker`.
    pub fn store(
        &self,
        target: &Utf8Path,
        args: &BuildArgs,
        dependencies: &[FileInfo],
        tracker: &StateTracker,
    ) -> Result<(), CacheError> {
        let dependencies = dependencies
            .iter()
            .map(|dep| {
                let digest = match dep.digest {
                    Some(digest) => digest,
                    None => tracker.file_digest(&dep.path)?,
                };
                Ok(FileInfo {
                    digest: Some(digest),
                    ..dep.clone()
                })
            })
            .collect::<Result<Vec<_>, CacheError>>()?;

        let artifact = self.entry_path(self.object_digest(target, args, &dependencies));
        if !artifact.exists() {
            write_atomic(&artifact, |writer| {
                let fail = |e| CacheError::Io(target.to_owned(), e);
                let mut source = File::open(target).map_err(fail)?;
                let mut encoder = ZlibEncoder::new(writer, Compression::default());
                io::copy(&mut source, &mut encoder).map_err(fail)?;
                encoder.finish().map_err(fail)?;
                Ok::<(), CacheError>(())
            })?;
        }

        let keys = self.keys(dependencies.iter().map(|dep| &dep.path));
        let variant = self
            .entry_path(self.target_digest(target))
            .join(self.dependency_digest(dependencies.iter().map(|dep| &dep.path)).to_hex());

        if !variant.exists() {
            write_atomic(&variant, |writer| {
                ciborium::into_writer(&Variant(keys, VARIANT_MAGIC.to_string()), writer)
                    .map_err(|e| CacheError::Encode(e.to_string()))
            })?;
        }

        tracing::debug!(target: "kiln::cache", "{}: stored as {}", target, artifact);
        Ok(())
    }
}

/// `path` taken against the working directory, or `path` itself if that is
/// not available.
fn absolute(path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        return path.to_owned();
    }

    std::path::absolute(path)
        .ok()
        .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
        .unwrap_or_else(|| path.to_owned())
}

fn extract(artifact: &Utf8Path, target: &Utf8Path) -> Result<(), CacheError> {
    write_atomic(target, |writer| {
        let file = File::open(artifact).map_err(|e| CacheError::Io(artifact.to_owned(), e))?;
        let mut decoder = ZlibDecoder::new(BufReader::new(file));
        io::copy(&mut decoder, writer).map_err(|e| CacheError::Io(artifact.to_owned(), e))?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: Utf8PathBuf,
        cache: ObjectCache,
        tracker: StateTracker,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let cache = ObjectCache::new(root.join("cache"), None);
        Fixture {
            _dir: dir,
            root,
            cache,
            tracker: StateTracker::default(),
        }
    }

    fn write(path: &Utf8Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    fn snapshot(tracker: &StateTracker, deps: &[&Utf8PathBuf]) -> Vec<FileInfo> {
        tracker.snapshot_dependencies(deps, false).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let f = fixture();
        let src = f.root.join("main.c");
        let out = f.root.join("main.o");
        write(&src, "int main() { return 0; }");
        write(&out, "\x7fELF object bytes");

        let args = BuildArgs::from_args(["cc", "-c", "main.c"]);
        let deps = snapshot(&f.tracker, &[&src]);
        f.cache.store(&out, &args, &deps, &f.tracker).unwrap();

        fs::remove_file(&out).unwrap();
        let restore = f.cache.try_restore(&out, &args, None, &f.tracker);

        let Some(record) = restore.record else {
            panic!("expected a cache hit");
        };
        assert_eq!(fs::read_to_string(&out).unwrap(), "\x7fELF object bytes");
        assert_eq!(record.dependencies[0].path, src);
        assert!(f.tracker.check(&out, &args).is_up_to_date());
    }

    #[test]
    fn test_miss_without_entries() {
        let f = fixture();
        let out = f.root.join("never.o");
        assert!(!f.cache.try_restore(&out, &BuildArgs::default(), None, &f.tracker).is_hit());
    }

    #[test]
    fn test_content_changes_the_object_digest() {
        let f = fixture();
        let src = f.root.join("lib.c");
        let out = f.root.join("lib.o");
        let args = BuildArgs::from_args(["cc"]);

        // Fresh trackers, so no digest is reused across rewrites that land
        // within one timestamp tick.
        let build = |source: &str, object: &str| {
            write(&src, source);
            write(&out, object);
            let tracker = StateTracker::default();
            let deps = tracker.snapshot_dependencies([&src], true).unwrap();
            f.cache.store(&out, &args, &deps, &tracker).unwrap();
            f.cache.object_digest(&out, &args, &deps)
        };

        let first = build("int x = 1;", "object one");
        let second = build("int x = 2;", "object two");

        assert_ne!(first, second);
        assert!(f.cache.entry_path(first).is_file());
        assert!(f.cache.entry_path(second).is_file());

        // Going back to the first source restores the first object.
        write(&src, "int x = 1;");
        fs::remove_file(&out).unwrap();
        let tracker = StateTracker::default();
        assert!(f.cache.try_restore(&out, &args, None, &tracker).is_hit());
        assert_eq!(fs::read_to_string(&out).unwrap(), "object one");
    }

    #[test]
    fn test_args_change_is_a_miss() {
        let f = fixture();
        let src = f.root.join("a.c");
        let out = f.root.join("a.o");
        write(&src, "a");
        write(&out, "o");

        let deps = snapshot(&f.tracker, &[&src]);
        f.cache.store(&out, &BuildArgs::from_args(["-O0"]), &deps, &f.tracker).unwrap();

        fs::remove_file(&out).unwrap();
        let restore = f.cache.try_restore(&out, &BuildArgs::from_args(["-O2"]), None, &f.tracker);
        assert!(!restore.is_hit());
        assert!(!out.exists());
    }

    #[test]
    fn test_missing_dependency_is_a_miss() {
        let f = fixture();
        let src = f.root.join("a.c");
        let header = f.root.join("a.h");
        let out = f.root.join("a.o");
        write(&src, "a");
        write(&header, "h");
        write(&out, "o");

        let args = BuildArgs::default();
        let deps = snapshot(&f.tracker, &[&src, &header]);
        f.cache.store(&out, &args, &deps, &f.tracker).unwrap();

        fs::remove_file(&header).unwrap();
        fs::remove_file(&out).unwrap();
        assert!(!f.cache.try_restore(&out, &args, None, &f.tracker).is_hit());
    }

    #[test]
    fn test_malformed_variants_are_skipped() {
        let f = fixture();
        let src = f.root.join("a.c");
        let out = f.root.join("a.o");
        write(&src, "a");
        write(&out, "o");

        let args = BuildArgs::default();
        let deps = snapshot(&f.tracker, &[&src]);
        f.cache.store(&out, &args, &deps, &f.tracker).unwrap();

        let dir = f.cache.entry_path(f.cache.target_digest(&out));
        write(&dir.join(Hash32::hash("junk").to_hex()), "not cbor");
        write(&dir.join("README"), "ignored");

        let mut truncated = Vec::new();
        ciborium::into_writer(&Variant(vec!["a.c".into()], "wrong".into()), &mut truncated).unwrap();
        fs::write(dir.join(Hash32::hash("truncated").to_hex()), truncated).unwrap();

        fs::remove_file(&out).unwrap();
        assert!(f.cache.try_restore(&out, &args, None, &f.tracker).is_hit());
    }

    #[test]
    fn test_dependency_digest_ignores_order() {
        let f = fixture();
        let a = f.root.join("a");
        let b = f.root.join("b");
        assert_eq!(
            f.cache.dependency_digest([&a, &b]),
            f.cache.dependency_digest([&b, &a])
        );
        assert_ne!(f.cache.dependency_digest([&a]), f.cache.dependency_digest([&a, &b]));
    }

    #[test]
    fn test_shared_across_workspaces() {
        let f = fixture();
        let one = f.root.join("one");
        let two = f.root.join("two");
        let cache_one = ObjectCache::new(f.root.join("cache"), Some(one.clone()));
        let cache_two = ObjectCache::new(f.root.join("cache"), Some(two.clone()));

        for ws in [&one, &two] {
            write(&ws.join("src/a.c"), "same source");
        }
        write(&one.join("out/a.o"), "shared object");

        let args = BuildArgs::from_args(["cc"]);
        let deps = snapshot(&f.tracker, &[&one.join("src/a.c")]);
        cache_one.store(&one.join("out/a.o"), &args, &deps, &f.tracker).unwrap();

        let target = two.join("out/a.o");
        let Some(record) = cache_two.try_restore(&target, &args, None, &f.tracker).record else {
            panic!("expected a cache hit in the second workspace");
        };
        assert_eq!(fs::read_to_string(&target).unwrap(), "shared object");
        assert_eq!(record.dependencies[0].path, two.join("src/a.c"));
    }

    #[test]
    fn test_relative_dependency_outside_the_workspace() {
        let f = fixture();
        let ws = f.root.join("ws");
        let cache = ObjectCache::new(f.root.join("cache"), Some(ws.clone()));

        // Relative to the working directory of the test run, not to `ws`.
        let src = Utf8PathBuf::from("Cargo.toml");
        let out = ws.join("out/manifest.o");
        write(&out, "object");

        let args = BuildArgs::default();
        let deps = snapshot(&f.tracker, &[&src]);
        cache.store(&out, &args, &deps, &f.tracker).unwrap();

        fs::remove_file(&out).unwrap();
        let Some(record) = cache.try_restore(&out, &args, None, &f.tracker).record else {
            panic!("expected a cache hit");
        };

        let expected = Utf8PathBuf::from_path_buf(std::path::absolute("Cargo.toml").unwrap()).unwrap();
        assert_eq!(record.dependencies[0].path, expected);
        assert!(!ws.join("Cargo.toml").exists());
    }

    #[test]
    fn test_failed_artifact_leaves_no_variant() {
        let f = fixture();
        let src = f.root.join("a.c");
        // A directory cannot be read as an artifact.
        let out = f.root.join("a.o");
        write(&src, "a");
        fs::create_dir_all(&out).unwrap();

        let args = BuildArgs::default();
        let deps = snapshot(&f.tracker, &[&src]);
        assert!(f.cache.store(&out, &args, &deps, &f.tracker).is_err());

        assert!(!f.cache.entry_path(f.cache.target_digest(&out)).exists());
        assert!(!f.cache.try_restore(&out, &args, None, &f.tracker).is_hit());
    }

    #[test]
    fn test_artifacts_are_never_rewritten() {
        let f = fixture();
        let src = f.root.join("a.c");
        let out = f.root.join("a.o");
        write(&src, "a");
        write(&out, "first object");

        let args = BuildArgs::default();
        let deps = snapshot(&f.tracker, &[&src]);
        f.cache.store(&out, &args, &deps, &f.tracker).unwrap();

        let artifact = f.cache.entry_path(f.cache.object_digest(&out, &args, &deps));
        let stored = fs::read(&artifact).unwrap();

        // Same inputs, different output bytes.
        write(&out, "second object");
        f.cache.store(&out, &args, &deps, &f.tracker).unwrap();
        assert_eq!(fs::read(&artifact).unwrap(), stored);

        fs::remove_file(&out).unwrap();
        assert!(f.cache.try_restore(&out, &args, None, &f.tracker).is_hit());
        assert_eq!(fs::read_to_string(&out).unwrap(), "first object");
    }

    #[test]
    fn test_failed_extraction_is_a_warning() {
        let f = fixture();
        let src = f.root.join("a.c");
        let out = f.root.join("build/a.o");
        write(&src, "a");
        write(&out, "o");

        let args = BuildArgs::default();
        let deps = snapshot(&f.tracker, &[&src]);
        f.cache.store(&out, &args, &deps, &f.tracker).unwrap();

        // The target's directory is now a file, so nothing can be written
        // there.
        fs::remove_dir_all(f.root.join("build")).unwrap();
        write(&f.root.join("build"), "in the way");

        let restore = f.cache.try_restore(&out, &args, None, &f.tracker);
        assert!(!restore.is_hit());
        assert_eq!(restore.warnings.len(), 1);
    }
}
