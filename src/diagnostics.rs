use std::fmt::{self, Display, Formatter};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use console::style;

/// How an action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The recorded state matched, nothing ran.
    UpToDate,
    /// Extracted from the object cache.
    Restored,
    /// The build function ran and succeeded.
    Built,
    Failed,
    /// Cancelled before it could run, usually because the build stopped.
    Cancelled,
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Outcome::UpToDate => "up to date",
            Outcome::Restored => "restored",
            Outcome::Built => "built",
            Outcome::Failed => "failed",
            Outcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// The result of a single action.
#[derive(Debug, Clone)]
pub struct ActionReport {
    pub target: Utf8PathBuf,
    pub outcome: Outcome,
    /// `None` for actions that never started.
    pub execution: Option<TaskExecution>,
    /// Why the action failed, if it failed on its own account.
    pub error: Option<String>,
}

/// Build report returned by [`Engine::finish`](crate::Engine::finish).
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Reports in the order the actions completed.
    pub actions: Vec<ActionReport>,
    /// Failed actions, not counting those that failed because a predecessor
    /// did.
    pub errors: usize,
    /// Dependency records or cache entries that could not be written.
    pub warnings: usize,
    pub elapsed: Duration,
}

impl Diagnostics {
    pub fn succeeded(&self) -> bool {
        self.errors == 0
            && self
                .actions
                .iter()
                .all(|a| !matches!(a.outcome, Outcome::Failed | Outcome::Cancelled))
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.actions.iter().filter(|a| a.outcome == outcome).count()
    }

    pub fn get(&self, target: impl AsRef<camino::Utf8Path>) -> Option<&ActionReport> {
        let target = target.as_ref();
        self.actions.iter().find(|a| a.target.as_path() == target)
    }

    /// Actions that failed with an error of their own.
    pub fn failures(&self) -> impl Iterator<Item = &ActionReport> {
        self.actions.iter().filter(|a| a.error.is_some())
    }

    /// The `n` actions that took longest to run, slowest first.
    pub fn slowest(&self, n: usize) -> Vec<&ActionReport> {
        let mut ran: Vec<&ActionReport> = self
            .actions
            .iter()
            .filter(|a| a.execution.is_some())
            .collect();

        ran.sort_by_key(|a| std::cmp::Reverse(a.execution.as_ref().map(|e| e.duration)));
        ran.truncate(n);
        ran
    }
}

impl Display for Diagnostics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for report in self.failures() {
            if let Some(error) = &report.error {
                writeln!(f, "{} {}: {}", style("error").red().bold(), report.target, error)?;
            }
        }

        let counts: Vec<String> = [
            Outcome::Built,
            Outcome::Restored,
            Outcome::UpToDate,
            Outcome::Failed,
            Outcome::Cancelled,
        ]
        .into_iter()
        .filter_map(|outcome| match self.count(outcome) {
            0 => None,
            n => Some(format!("{} {}", n, outcome.label())),
        })
        .collect();

        if !counts.is_empty() {
            writeln!(f, "{}", counts.join(", "))?;
        }

        if self.warnings > 0 {
            writeln!(f, "{} {} warnings", style("warning").yellow().bold(), self.warnings)?;
        }

        let elapsed = style(format!("({:.2?})", self.elapsed)).blue();
        match (self.succeeded(), self.errors) {
            (true, _) => write!(f, "{} {}", style("Build succeeded.").green(), elapsed),
            (false, 0) => write!(f, "{} {}", style("Build failed.").red(), elapsed),
            (false, 1) => write!(f, "{} {}", style("Build failed with 1 error.").red(), elapsed),
            (false, n) => write!(
                f,
                "{} {}",
                style(format!("Build failed with {n} errors.")).red(),
                elapsed
            ),
        }
    }
}
