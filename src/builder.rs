use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use indicatif::ProgressStyle;
use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::ObjectCache;
use crate::config::Config;
use crate::core::lock;
use crate::diagnostics::{ActionReport, Diagnostics, Outcome, TaskExecution};
use crate::engine::{Task, ThreadPool, default_size};
use crate::error::{KilnError, TaskError, TaskFailure};
use crate::state::{BuildArgs, StateTracker};

static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

/// Drives incremental build actions.
///
/// Every action created through [`Engine::action`] runs the same sequence:
///
/// 1. Ask the [`StateTracker`] whether the target is up to date. If so, stop.
/// 2. If the action is cacheable and a cache is configured, try to restore the
///    target from the [`ObjectCache`]. On a hit, stop.
/// 3. Run the build function, plus every child task it spawns.
/// 4. Record the dependency state of the new target and, for cacheable
///    actions, add it to the cache.
///
/// Actions are ordinary [`Task`]s, so they can be ordered after each other and
/// after any other task. [`Engine::finish`] waits for everything and returns
/// the build report.
///
/// ```rust,no_run
/// use kiln::{BuildArgs, Config, Engine};
///
/// let engine = Engine::new(Config::default().jobs(4))?;
///
/// let object = engine
///     .action("out/main.o")
///     .args(BuildArgs::from_args(["cc", "-c", "src/main.c"]))
///     .cacheable(true)
///     .run(|ctx| {
///         ctx.depends_on("src/main.c");
///         std::fs::write(ctx.target(), b"...")?;
///         Ok(())
///     })?;
///
/// engine
///     .action("out/app")
///     .after(&object)
///     .run(|ctx| {
///         ctx.depends_on("out/main.o");
///         std::fs::write(ctx.target(), b"...")?;
///         Ok(())
///     })?;
///
/// let diagnostics = engine.finish([]);
/// eprintln!("{diagnostics}");
/// # Ok::<(), kiln::KilnError>(())
/// ```
pub struct Engine {
    shared: Arc<Shared>,
    pool: ThreadPool,
    pools: Mutex<Vec<ThreadPool>>,
    actions: Mutex<Vec<Task>>,
    started: Instant,
}

struct Shared {
    config: Config,
    tracker: StateTracker,
    cache: Option<ObjectCache>,
    errors: AtomicUsize,
    warnings: AtomicUsize,
    stopped: AtomicBool,
    /// Action tasks that have not started running yet, by task id.
    pending: Mutex<HashMap<u64, Task>>,
    reports: Mutex<Vec<ActionReport>>,
    total: AtomicU64,
    span: Span,
}

/// Per action bookkeeping shared by its tasks.
#[derive(Default)]
struct ActionState {
    started: Mutex<Option<Instant>>,
    dependencies: Mutex<Vec<Utf8PathBuf>>,
    /// The first error raised by the build function, a child or the
    /// recording step.
    failure: Mutex<Option<String>>,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self, KilnError> {
        let jobs = match config.jobs {
            0 => default_size(),
            jobs => jobs,
        };
        let pool = ThreadPool::new("kiln", jobs)?;

        let span = if config.progress {
            let span = tracing::info_span!("build");
            span.pb_set_style(&PROGRESS_STYLE);
            span.pb_set_message("Building...");
            span
        } else {
            Span::none()
        };

        let tracker = StateTracker::new(&config);
        let cache = ObjectCache::from_config(&config);
        if let Some(cache) = &cache {
            tracing::debug!(target: "kiln::cache", "using object cache at {}", cache.root());
        }

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                tracker,
                cache,
                errors: AtomicUsize::new(0),
                warnings: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
                pending: Mutex::new(HashMap::new()),
                reports: Mutex::new(Vec::new()),
                total: AtomicU64::new(0),
                span,
            }),
            pool,
            pools: Mutex::new(Vec::new()),
            actions: Mutex::new(Vec::new()),
            started: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.shared.tracker
    }

    pub fn cache(&self) -> Option<&ObjectCache> {
        self.shared.cache.as_ref()
    }

    /// The pool actions run on unless told otherwise.
    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Creates another pool, shut down together with the default one.
    ///
    /// Work that fans out into further work on the same pool can starve it;
    /// giving such stages a pool of their own avoids that.
    pub fn new_pool(&self, name: &str, size: usize) -> Result<ThreadPool, KilnError> {
        let pool = ThreadPool::new(name, size)?;
        lock(&self.pools).push(pool.clone());
        Ok(pool)
    }

    /// The number of actions that failed so far.
    pub fn errors(&self) -> usize {
        self.shared.errors.load(Ordering::Acquire)
    }

    /// Whether the error limit was reached and no new actions will run.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Starts defining an action that produces `target`.
    pub fn action(&self, target: impl Into<Utf8PathBuf>) -> ActionDef<'_> {
        ActionDef {
            engine: self,
            targets: vec![target.into()],
            args: BuildArgs::default(),
            cacheable: false,
            after: Vec::new(),
            pool: None,
            dependencies: Vec::new(),
        }
    }

    /// Waits for `roots` and every action created through this engine, shuts
    /// down the pools and returns the build report.
    pub fn finish(self, roots: impl IntoIterator<Item = Task>) -> Diagnostics {
        let mut tasks: Vec<Task> = roots.into_iter().collect();
        tasks.extend(lock(&self.actions).drain(..));

        let root = Task::join(tasks);
        {
            let _enter = self.shared.span.enter();
            root.wait();
        }

        self.pool.shutdown();
        for pool in lock(&self.pools).drain(..) {
            pool.shutdown();
        }

        let diagnostics = Diagnostics {
            actions: std::mem::take(&mut *lock(&self.shared.reports)),
            errors: self.shared.errors.load(Ordering::Acquire),
            warnings: self.shared.warnings.load(Ordering::Acquire),
            elapsed: self.started.elapsed(),
        };

        match diagnostics.errors {
            _ if diagnostics.succeeded() => tracing::info!("Build succeeded."),
            1 => tracing::error!("Build failed with 1 error."),
            n => tracing::error!("Build failed with {} errors.", n),
        }

        diagnostics
    }
}

/// Builder for a single action, see [`Engine::action`].
pub struct ActionDef<'a> {
    engine: &'a Engine,
    targets: Vec<Utf8PathBuf>,
    args: BuildArgs,
    cacheable: bool,
    after: Vec<Task>,
    pool: Option<ThreadPool>,
    dependencies: Vec<Utf8PathBuf>,
}

impl<'a> ActionDef<'a> {
    /// An additional file produced by the same action. Actions with more than
    /// one target are never cached.
    pub fn target(mut self, target: impl Into<Utf8PathBuf>) -> Self {
        self.targets.push(target.into());
        self
    }

    /// The arguments the target is built with. Changing them forces a
    /// rebuild.
    pub fn args(mut self, args: BuildArgs) -> Self {
        self.args = args;
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Runs the action only after `task` succeeded.
    pub fn after(mut self, task: &Task) -> Self {
        self.after.push(task.clone());
        self
    }

    pub fn pool(mut self, pool: &ThreadPool) -> Self {
        self.pool = Some(pool.clone());
        self
    }

    /// A dependency known before the build runs.
    pub fn depends_on(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.dependencies.push(path.into());
        self
    }

    /// Schedules the action with `build` as its build function and returns
    /// its task.
    pub fn run<F>(self, build: F) -> Result<Task, TaskError>
    where
        F: FnOnce(&ActionContext) -> anyhow::Result<()> + Send + 'static,
    {
        let ActionDef {
            engine,
            targets,
            args,
            cacheable,
            after,
            pool,
            dependencies,
        } = self;

        let shared = engine.shared.clone();
        let pool = pool.unwrap_or_else(|| engine.pool.clone());
        let primary = targets[0].clone();
        let state = Arc::new(ActionState {
            dependencies: Mutex::new(dependencies),
            ..Default::default()
        });

        let action = Action {
            targets,
            args,
            cacheable,
            pool: pool.clone(),
        };

        let task = {
            let shared = shared.clone();
            let state = state.clone();
            Task::with_handle(primary.as_str(), move |task| execute(task, &shared, &state, action, build))
        };

        shared.register(&task);
        {
            let shared = shared.clone();
            task.add_callback(move |task| shared.complete(task, primary, &state));
        }
        lock(&engine.actions).push(task.clone());

        if shared.stopped.load(Ordering::Acquire) {
            task.cancel()?;
            return Ok(task);
        }

        if after.is_empty() {
            task.start(&pool)?;
        } else {
            task.start_after(&after, &pool)?;
        }

        Ok(task)
    }
}

struct Action {
    targets: Vec<Utf8PathBuf>,
    args: BuildArgs,
    cacheable: bool,
    pool: ThreadPool,
}

fn execute<F>(
    task: &Task,
    shared: &Arc<Shared>,
    state: &Arc<ActionState>,
    action: Action,
    build: F,
) -> anyhow::Result<Outcome>
where
    F: FnOnce(&ActionContext) -> anyhow::Result<()> + Send + 'static,
{
    lock(&shared.pending).remove(&task.id());
    *lock(&state.started) = Some(Instant::now());

    let primary = action.targets[0].clone();
    let check = shared.tracker.check(&primary, &action.args);
    if check.is_up_to_date() {
        return Ok(Outcome::UpToDate);
    }

    let cacheable = action.cacheable && action.targets.len() == 1;
    if cacheable && let Some(cache) = &shared.cache {
        let restore = cache.try_restore(&primary, &action.args, check.previous.as_ref(), &shared.tracker);
        for warning in &restore.warnings {
            shared.warn(format_args!("Problem restoring {} from cache.\n{}", primary, warning));
        }
        if restore.is_hit() {
            tracing::info!(target: "kiln::cache", "Restored {} from cache", primary);
            return Ok(Outcome::Restored);
        }
    }

    if let Some(previous) = &check.previous {
        shared.tracker.prime_digest_cache(previous);
    }

    let work = {
        let context = ContextInner {
            target: primary.clone(),
            args: action.args.clone(),
            pool: action.pool.clone(),
            state: state.clone(),
        };
        Task::with_handle(format!("{primary} (build)"), move |work| {
            build(&ActionContext {
                inner: Arc::new(context),
                work: work.clone(),
            })
        })
    };
    remember_failure(&work, state);
    work.start_inline()?;

    let record = {
        let shared = shared.clone();
        let state = state.clone();
        let Action { targets, args, .. } = action;
        Task::named(format!("{primary} (record)"), move || {
            record_state(&shared, &state, &targets, args, cacheable)
        })
    };
    remember_failure(&record, state);
    record.start_after_inline(&[work])?;

    task.complete_after(&[record])?;
    Ok(Outcome::Built)
}

/// Persists the dependency state of freshly built targets. Only a missing
/// target fails the action; anything that goes wrong while writing the
/// records is a warning.
fn record_state(
    shared: &Shared,
    state: &ActionState,
    targets: &[Utf8PathBuf],
    args: BuildArgs,
    cacheable: bool,
) -> anyhow::Result<()> {
    if let Some(missing) = targets.iter().find(|target| !target.exists()) {
        anyhow::bail!("build did not produce '{}'", missing);
    }

    let dependencies = lock(&state.dependencies).clone();
    let cache = shared.cache.as_ref().filter(|_| cacheable);

    let record = match shared
        .tracker
        .create_dependency_info(targets, args, &dependencies, cache.is_some())
    {
        Ok(record) => record,
        Err(e) => {
            shared.warn(format_args!("Couldn't record dependencies of {}.\n{}", targets[0], e));
            return Ok(());
        }
    };

    if let Err(e) = shared.tracker.store(&record) {
        shared.warn(format_args!("Couldn't store dependency record.\n{}", e));
    }

    if let Some(cache) = cache
        && let Err(e) = cache.store(&targets[0], &record.args, &record.dependencies, &shared.tracker)
    {
        shared.warn(format_args!("Couldn't add {} to the cache.\n{}", targets[0], e));
    }

    Ok(())
}

fn remember_failure(task: &Task, state: &Arc<ActionState>) {
    let state = state.clone();
    task.add_callback(move |task| {
        if let Some(failure) = task.failure()
            && failure.is_own()
        {
            lock(&state.failure).get_or_insert_with(|| failure.to_string());
        }
    });
}

impl Shared {
    fn register(&self, task: &Task) {
        lock(&self.pending).insert(task.id(), task.clone());
        let total = self.total.fetch_add(1, Ordering::AcqRel) + 1;
        self.span.pb_set_length(total);
    }

    fn complete(&self, task: &Task, target: Utf8PathBuf, state: &ActionState) {
        lock(&self.pending).remove(&task.id());

        let execution = lock(&state.started).map(|start| TaskExecution {
            start,
            duration: start.elapsed(),
        });

        let (outcome, error) = match task.failure() {
            None => {
                let outcome = task.output::<Outcome>().map_or(Outcome::Built, |outcome| *outcome);
                (outcome, None)
            }
            Some(TaskFailure::Cancelled) => (Outcome::Cancelled, None),
            Some(TaskFailure::PredecessorFailed) => (Outcome::Failed, None),
            Some(failure) => {
                let message = lock(&state.failure)
                    .clone()
                    .unwrap_or_else(|| failure.to_string());
                (Outcome::Failed, Some(message))
            }
        };

        let failed = error.is_some();
        if let Some(error) = &error {
            tracing::error!("{}: {}", target, error);
        }

        lock(&self.reports).push(ActionReport {
            target,
            outcome,
            execution,
            error,
        });
        self.span.pb_inc(1);

        if failed {
            let errors = self.errors.fetch_add(1, Ordering::AcqRel) + 1;
            if errors >= self.config.error_limit() {
                self.stop(errors);
            }
        }
    }

    /// Cancels every action that has not started, and any created later.
    fn stop(&self, errors: usize) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        if self.config.keep_going {
            tracing::error!("Stopping the build after {} errors", errors);
        } else {
            tracing::debug!("Stopping the build after the first error");
        }

        let pending: Vec<Task> = lock(&self.pending).drain().map(|(_, task)| task).collect();
        for task in pending {
            // It may have completed in the meantime.
            let _ = task.cancel();
        }
    }

    fn warn(&self, message: std::fmt::Arguments<'_>) {
        self.warnings.fetch_add(1, Ordering::AcqRel);
        tracing::warn!("{}", message);
    }
}

struct ContextInner {
    target: Utf8PathBuf,
    args: BuildArgs,
    pool: ThreadPool,
    state: Arc<ActionState>,
}

/// Handed to a build function.
///
/// Clones refer to the same action, so a clone can be moved into child tasks
/// that report dependencies or spawn further children.
#[derive(Clone)]
pub struct ActionContext {
    inner: Arc<ContextInner>,
    work: Task,
}

impl ActionContext {
    pub fn target(&self) -> &Utf8Path {
        &self.inner.target
    }

    pub fn args(&self) -> &BuildArgs {
        &self.inner.args
    }

    /// The pool the action runs on.
    pub fn pool(&self) -> &ThreadPool {
        &self.inner.pool
    }

    /// Records that the target was built from `path`.
    pub fn depends_on(&self, path: impl Into<Utf8PathBuf>) {
        lock(&self.inner.state.dependencies).push(path.into());
    }

    pub fn depends_on_all<I>(&self, paths: I)
    where
        I: IntoIterator,
        I::Item: Into<Utf8PathBuf>,
    {
        lock(&self.inner.state.dependencies).extend(paths.into_iter().map(Into::into));
    }

    /// Starts `step` on the action's pool. The action completes only after
    /// the step, and fails if it does.
    pub fn spawn<F>(&self, name: &str, step: F) -> Result<Task, TaskError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.spawn_after(name, &[], step)
    }

    /// Like [`spawn`](Self::spawn), running `step` only after `after`
    /// succeeded.
    pub fn spawn_after<F>(&self, name: &str, after: &[Task], step: F) -> Result<Task, TaskError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let child = Task::named(format!("{} ({})", self.inner.target, name), step);
        remember_failure(&child, &self.inner.state);

        self.work.complete_after(std::slice::from_ref(&child))?;
        if after.is_empty() {
            child.start(&self.inner.pool)?;
        } else {
            child.start_after(after, &self.inner.pool)?;
        }

        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    use tempfile::TempDir;

    fn workspace() -> (TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    /// An action that concatenates `inputs` into `target`.
    fn concat(engine: &Engine, target: &Utf8Path, inputs: &[Utf8PathBuf], runs: &Arc<AtomicUsize>) -> Task {
        let inputs = inputs.to_vec();
        let runs = runs.clone();
        engine
            .action(target)
            .args(BuildArgs::from_args(["cat"]))
            .cacheable(true)
            .run(move |ctx| {
                runs.fetch_add(1, Ordering::SeqCst);
                let mut out = String::new();
                for input in &inputs {
                    out.push_str(&fs::read_to_string(input)?);
                    ctx.depends_on(input);
                }
                fs::write(ctx.target(), out)?;
                Ok(())
            })
            .unwrap()
    }

    #[test]
    fn test_second_run_is_up_to_date() {
        let (_dir, root) = workspace();
        let src = root.join("a.txt");
        let out = root.join("a.out");
        fs::write(&src, "hello").unwrap();
        let runs = counter();

        let engine = Engine::new(Config::default().jobs(2)).unwrap();
        concat(&engine, &out, &[src.clone()], &runs);
        let diagnostics = engine.finish([]);
        assert!(diagnostics.succeeded(), "{diagnostics}");
        assert_eq!(diagnostics.get(&out).unwrap().outcome, Outcome::Built);

        let engine = Engine::new(Config::default().jobs(2)).unwrap();
        concat(&engine, &out, &[src.clone()], &runs);
        let diagnostics = engine.finish([]);
        assert_eq!(diagnostics.get(&out).unwrap().outcome, Outcome::UpToDate);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_changed_dependency_rebuilds() {
        let (_dir, root) = workspace();
        let src = root.join("a.txt");
        let out = root.join("a.out");
        fs::write(&src, "one").unwrap();
        let runs = counter();

        let engine = Engine::new(Config::default()).unwrap();
        concat(&engine, &out, &[src.clone()], &runs);
        engine.finish([]);

        fs::write(&src, "two").unwrap();
        let later = std::time::SystemTime::now() + Duration::from_secs(60);
        fs::File::options().write(true).open(&src).unwrap().set_modified(later).unwrap();

        let engine = Engine::new(Config::default()).unwrap();
        concat(&engine, &out, &[src.clone()], &runs);
        let diagnostics = engine.finish([]);

        assert_eq!(diagnostics.get(&out).unwrap().outcome, Outcome::Built);
        assert_eq!(fs::read_to_string(&out).unwrap(), "two");
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_restored_from_cache() {
        let (_dir, root) = workspace();
        let src = root.join("a.txt");
        let out = root.join("a.out");
        fs::write(&src, "cached").unwrap();
        let runs = counter();
        let config = Config::default().cache_root(root.join("cache"));

        let engine = Engine::new(config.clone()).unwrap();
        concat(&engine, &out, &[src.clone()], &runs);
        engine.finish([]);

        fs::remove_file(&out).unwrap();
        fs::remove_file(engine_record(&out)).unwrap();

        let engine = Engine::new(config).unwrap();
        concat(&engine, &out, &[src.clone()], &runs);
        let diagnostics = engine.finish([]);

        assert_eq!(diagnostics.get(&out).unwrap().outcome, Outcome::Restored);
        assert_eq!(fs::read_to_string(&out).unwrap(), "cached");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    fn engine_record(target: &Utf8Path) -> Utf8PathBuf {
        StateTracker::default().record_path(target)
    }

    #[test]
    fn test_actions_in_order() {
        let (_dir, root) = workspace();
        let src = root.join("a.txt");
        let mid = root.join("a.mid");
        let out = root.join("a.out");
        fs::write(&src, "chain").unwrap();
        let runs = counter();

        let engine = Engine::new(Config::default().jobs(4)).unwrap();
        let first = concat(&engine, &mid, &[src.clone()], &runs);

        let second = {
            let mid = mid.clone();
            engine
                .action(&out)
                .after(&first)
                .run(move |ctx| {
                    ctx.depends_on(&mid);
                    fs::copy(&mid, ctx.target())?;
                    Ok(())
                })
                .unwrap()
        };

        let diagnostics = engine.finish([second]);
        assert!(diagnostics.succeeded(), "{diagnostics}");
        assert_eq!(fs::read_to_string(&out).unwrap(), "chain");
    }

    #[test]
    fn test_failure_propagates_without_counting_twice() {
        let (_dir, root) = workspace();
        let ran = counter();

        let engine = Engine::new(Config::default().keep_going(true)).unwrap();
        let broken = engine
            .action(root.join("broken.o"))
            .run(|_| anyhow::bail!("syntax error"))
            .unwrap();

        let dependent = {
            let ran = ran.clone();
            engine
                .action(root.join("app"))
                .after(&broken)
                .run(move |_| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap()
        };

        let diagnostics = engine.finish([dependent]);
        assert!(!diagnostics.succeeded());
        assert_eq!(diagnostics.errors, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        let broken = diagnostics.get(root.join("broken.o")).unwrap();
        assert_eq!(broken.outcome, Outcome::Failed);
        assert_eq!(broken.error.as_deref(), Some("syntax error"));

        let app = diagnostics.get(root.join("app")).unwrap();
        assert_eq!(app.outcome, Outcome::Failed);
        assert!(app.error.is_none());
    }

    #[test]
    fn test_first_error_stops_the_build() {
        let (_dir, root) = workspace();
        let engine = Engine::new(Config::default()).unwrap();

        // Never started, so the waiting action stays pending until cancelled.
        let gate = Task::group();
        let waiting = engine
            .action(root.join("waiting"))
            .after(&gate)
            .run(|_| Ok(()))
            .unwrap();

        engine
            .action(root.join("broken"))
            .run(|_| anyhow::bail!("boom"))
            .unwrap();

        assert!(waiting.wait_timeout(Duration::from_secs(5)));
        assert_eq!(waiting.state(), crate::engine::TaskState::Cancelled);
        assert!(engine.is_stopped());

        let late = engine.action(root.join("late")).run(|_| Ok(())).unwrap();
        assert_eq!(late.state(), crate::engine::TaskState::Cancelled);

        let diagnostics = engine.finish([]);
        assert_eq!(diagnostics.errors, 1);
        assert_eq!(diagnostics.count(Outcome::Cancelled), 2);
        assert!(diagnostics.to_string().contains("Build failed with 1 error."));
    }

    #[test]
    fn test_keep_going() {
        let (_dir, root) = workspace();
        let engine = Engine::new(Config::default().keep_going(true)).unwrap();

        for name in ["a", "b"] {
            engine
                .action(root.join(name))
                .run(|_| anyhow::bail!("failed"))
                .unwrap();
        }
        engine
            .action(root.join("c"))
            .run(|ctx| {
                fs::write(ctx.target(), "ok")?;
                Ok(())
            })
            .unwrap();

        let diagnostics = engine.finish([]);
        assert_eq!(diagnostics.errors, 2);
        assert_eq!(diagnostics.count(Outcome::Built), 1);
        assert_eq!(diagnostics.count(Outcome::Cancelled), 0);
    }

    #[test]
    fn test_children_and_discovered_dependencies() {
        let (_dir, root) = workspace();
        let header = root.join("a.h");
        let out = root.join("a.o");
        fs::write(&header, "#pragma once").unwrap();

        let engine = Engine::new(Config::default().jobs(2)).unwrap();
        {
            let header = header.clone();
            engine
                .action(&out)
                .run(move |ctx| {
                    let scanner = ctx.clone();
                    let scan = ctx.spawn("scan", move || {
                        scanner.depends_on(&header);
                        Ok(())
                    })?;
                    let target = ctx.target().to_owned();
                    ctx.spawn_after("compile", &[scan], move || {
                        fs::write(&target, "object")?;
                        Ok(())
                    })?;
                    Ok(())
                })
                .unwrap();
        }

        let diagnostics = engine.finish([]);
        assert!(diagnostics.succeeded(), "{diagnostics}");
        assert_eq!(fs::read_to_string(&out).unwrap(), "object");

        let record = StateTracker::default().load(&out).unwrap().unwrap();
        let deps: Vec<&Utf8Path> = record.dependency_paths().collect();
        assert_eq!(deps, vec![header.as_path()]);
    }

    #[test]
    fn test_failing_child_fails_the_action() {
        let (_dir, root) = workspace();
        let engine = Engine::new(Config::default().keep_going(true)).unwrap();

        engine
            .action(root.join("a.o"))
            .run(|ctx| {
                ctx.spawn("compile", || anyhow::bail!("compiler crashed"))?;
                Ok(())
            })
            .unwrap();

        let diagnostics = engine.finish([]);
        let report = diagnostics.get(root.join("a.o")).unwrap();
        assert_eq!(report.outcome, Outcome::Failed);
        assert_eq!(report.error.as_deref(), Some("compiler crashed"));
    }

    #[test]
    fn test_missing_target_is_an_error() {
        let (_dir, root) = workspace();
        let engine = Engine::new(Config::default()).unwrap();

        engine.action(root.join("never")).run(|_| Ok(())).unwrap();

        let diagnostics = engine.finish([]);
        assert_eq!(diagnostics.errors, 1);
        let error = diagnostics.failures().next().unwrap().error.clone().unwrap();
        assert!(error.contains("did not produce"), "{error}");
    }

    #[test]
    fn test_separate_pool() {
        let (_dir, root) = workspace();
        let engine = Engine::new(Config::default()).unwrap();
        let links = engine.new_pool("link", 1).unwrap();

        let task = engine
            .action(root.join("app"))
            .pool(&links)
            .run(|ctx| {
                let name = std::thread::current().name().map(str::to_string);
                anyhow::ensure!(name.as_deref() == Some("link-0"), "ran on {name:?}");
                fs::write(ctx.target(), "")?;
                Ok(())
            })
            .unwrap();

        let diagnostics = engine.finish([task]);
        assert!(diagnostics.succeeded(), "{diagnostics}");
        assert!(links.is_closed());
    }

    #[test]
    fn test_max_errors_stops_the_build() {
        let (_dir, root) = workspace();
        let engine = Engine::new(Config::default().keep_going(true).max_errors(2)).unwrap();

        let gate = Task::group();
        let waiting = engine
            .action(root.join("waiting"))
            .after(&gate)
            .run(|_| Ok(()))
            .unwrap();

        for name in ["a", "b"] {
            engine
                .action(root.join(name))
                .run(|_| anyhow::bail!("failed"))
                .unwrap();
        }

        assert!(waiting.wait_timeout(Duration::from_secs(5)));
        assert_eq!(waiting.state(), crate::engine::TaskState::Cancelled);
        assert!(engine.is_stopped());

        let diagnostics = engine.finish([]);
        assert_eq!(diagnostics.errors, 2);
        assert_eq!(diagnostics.get(root.join("waiting")).unwrap().outcome, Outcome::Cancelled);
    }

    #[test]
    fn test_persistence_failures_are_warnings() {
        let (_dir, root) = workspace();
        let src = root.join("a.txt");
        let out = root.join("a.out");
        fs::write(&src, "hello").unwrap();

        // Neither directory can be created below a regular file.
        let blocker = root.join("blocker");
        fs::write(&blocker, "").unwrap();
        let config = Config::default()
            .state_dir(blocker.join("state"))
            .cache_root(blocker.join("cache"));

        let runs = counter();
        let engine = Engine::new(config).unwrap();
        concat(&engine, &out, &[src.clone()], &runs);
        let diagnostics = engine.finish([]);

        assert!(diagnostics.succeeded(), "{diagnostics}");
        assert_eq!(diagnostics.get(&out).unwrap().outcome, Outcome::Built);
        assert_eq!(diagnostics.warnings, 2);
        assert_eq!(fs::read_to_string(&out).unwrap(), "hello");
    }
}
