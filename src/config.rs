use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How a dependency is compared against its recorded state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeDetection {
    /// A dependency changed if its modification time is newer than recorded.
    #[default]
    Timestamp,
    /// Like `Timestamp`, but a newer file whose content digest still matches
    /// the recorded one counts as unchanged. Digests are recorded for every
    /// dependency.
    Digest,
}

/// Settings consumed by the build engine.
///
/// Every field has a default, so a config file only needs to mention what it
/// changes:
///
/// ```json
/// { "cache-root": "/var/cache/kiln", "jobs": 8, "keep-going": true }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Object cache root. Caching is disabled without one.
    pub cache_root: Option<Utf8PathBuf>,
    /// Cache keys are computed relative to this directory, which lets
    /// checkouts at different locations share a cache.
    pub workspace_root: Option<Utf8PathBuf>,
    /// Keeps dependency records here instead of next to each target.
    pub state_dir: Option<Utf8PathBuf>,
    /// Rebuild every target regardless of its recorded state.
    pub force: bool,
    /// Worker threads in the default pool, 0 for one per CPU.
    pub jobs: usize,
    pub change_detection: ChangeDetection,
    /// Keep building independent targets after a failure.
    pub keep_going: bool,
    /// With `keep_going`, stop after this many failed actions.
    pub max_errors: Option<usize>,
    /// Draw a progress bar while building.
    pub progress: bool,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a JSON config file.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_owned(), e))?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.to_owned(), e))
    }

    /// Applies `KILN_*` environment variables on top of this config.
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_vars(|key| std::env::var(key).ok())
    }

    fn with_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(value) = var("KILN_CACHE") {
            self.cache_root = non_empty(value).map(Utf8PathBuf::from);
        }
        if let Some(value) = var("KILN_WORKSPACE") {
            self.workspace_root = non_empty(value).map(Utf8PathBuf::from);
        }
        if let Some(value) = var("KILN_JOBS") {
            self.jobs = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Env("KILN_JOBS", value))?;
        }
        if let Some(value) = var("KILN_FORCE") {
            self.force = flag("KILN_FORCE", value)?;
        }
        if let Some(value) = var("KILN_KEEP_GOING") {
            self.keep_going = flag("KILN_KEEP_GOING", value)?;
        }
        if let Some(value) = var("KILN_MAX_ERRORS") {
            let max = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Env("KILN_MAX_ERRORS", value))?;
            self.max_errors = Some(max);
        }
        Ok(self)
    }

    pub fn cache_root(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.cache_root = Some(path.into());
        self
    }

    pub fn workspace_root(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.workspace_root = Some(path.into());
        self
    }

    pub fn state_dir(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.state_dir = Some(path.into());
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn change_detection(mut self, detection: ChangeDetection) -> Self {
        self.change_detection = detection;
        self
    }

    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    pub fn max_errors(mut self, max: usize) -> Self {
        self.max_errors = Some(max);
        self
    }

    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// The number of errors after which the engine stops starting new
    /// actions.
    pub(crate) fn error_limit(&self) -> usize {
        match (self.keep_going, self.max_errors) {
            (false, _) => 1,
            (true, Some(max)) => max.max(1),
            (true, None) => usize::MAX,
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn flag(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Env(key, value)),
    }
}
