use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use tempfile::TempDir;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use super::environment::Environment;
use super::error::BuildError;
use super::types::{Outcome, RunReport, State, Step, StepRecord};
use crate::config::{Config, Strategy};
use crate::docker::{BuildStatus, CancelToken, Engine, EngineError};

/// Target used for lines printed by the build itself.
pub const BUILD_OUTPUT_TARGET: &str = "boxbuild::build_output";

/// Runs provision, populate, execute, extract and teardown against an
/// [`Engine`], guaranteeing teardown once a handle exists.
pub struct BuildRunner<'a, E: Engine + ?Sized> {
    engine: &'a E,
    config: &'a Config,
    work_dir: PathBuf,
    cancel: CancelToken,
}

impl<'a, E: Engine + ?Sized> BuildRunner<'a, E> {
    /// Relative paths in `config` are resolved against `work_dir`.
    pub fn new(engine: &'a E, config: &'a Config, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            config,
            work_dir: work_dir.into(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn source_dir(&self) -> PathBuf {
        self.work_dir.join(&self.config.source_dir)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.work_dir.join(&self.config.output_dir)
    }

    pub fn run(&self) -> Outcome {
        self.run_with_report().0
    }

    pub fn run_with_report(&self) -> (Outcome, RunReport) {
        let mut report = RunReport::new(&self.config.image, self.config.strategy);

        if let Err(e) = self.validate() {
            error!(error = %e, "refusing to run");
            return finish(report, Outcome::Failure(e));
        }

        let env = match self.step(&mut report, Step::Provision, |r| self.provision(r)) {
            Ok(env) => env,
            Err(e) => return finish(report, Outcome::Failure(e)),
        };

        let result = self.drive(&env, &mut report);

        let handle = env.handle().to_string();
        let teardown = self.step(&mut report, Step::Teardown, |_| {
            env.teardown().map_err(|source| BuildError::Teardown { handle, source })
        });

        let outcome = match (result, teardown) {
            (Ok(()), Ok(())) => Outcome::Success,
            (Ok(()), Err(e)) => Outcome::Failure(e),
            (Err(e), Ok(())) => Outcome::Failure(e),
            (Err(e), Err(t)) => {
                warn!(error = %t, "teardown failed after an earlier error");
                Outcome::Failure(e)
            }
        };
        finish(report, outcome)
    }

    /// Reject an `output_dir` whose replacement would delete the project:
    /// the working directory, the source tree, or anything containing them.
    pub fn validate(&self) -> Result<(), BuildError> {
        let output = resolve(&self.output_dir());
        let reject = |reason: &'static str| -> Result<(), BuildError> {
            Err(BuildError::OutputDir {
                path: output.clone(),
                reason,
            })
        };

        if resolve(&self.work_dir).starts_with(&output) {
            return reject("contains the working directory");
        }
        if resolve(&self.source_dir()).starts_with(&output) {
            return reject("contains the source directory");
        }
        Ok(())
    }

    /// Everything between provisioning and teardown.
    fn drive(&self, env: &Environment<'_, E>, report: &mut RunReport) -> Result<(), BuildError> {
        if self.config.strategy.populates() {
            self.step(report, Step::Populate, |_| self.populate(env))?;
        }
        self.step(report, Step::Execute, |r| self.execute(env, r))?;
        self.step(report, Step::Extract, |r| self.extract(env, r))?;
        Ok(())
    }

    /// Run one step, recording its timing and the state it leads to.
    fn step<T>(
        &self,
        report: &mut RunReport,
        step: Step,
        f: impl FnOnce(&mut RunReport) -> Result<T, BuildError>,
    ) -> Result<T, BuildError> {
        // Teardown must run even after an interrupt.
        if step != Step::Teardown && self.cancel.is_cancelled() {
            return Err(BuildError::Interrupted { step });
        }

        info!(step = %step, "starting");
        let start = Instant::now();
        let result = f(report);
        report.steps.push(StepRecord {
            step,
            success: result.is_ok(),
            duration_ms: start.elapsed().as_millis() as u64,
        });

        match &result {
            Ok(_) => {
                report.state = step.completes_into();
                info!(step = %step, elapsed_ms = start.elapsed().as_millis() as u64, "finished");
            }
            Err(e) => error!(step = %step, error = %e, "failed"),
        }
        result
    }

    fn provision(&self, report: &mut RunReport) -> Result<Environment<'a, E>, BuildError> {
        let image = &self.config.image;
        let provisioning = |source: EngineError| BuildError::Provisioning {
            image: image.clone(),
            source,
        };

        self.engine.ping().map_err(provisioning)?;
        let handle = match self.config.strategy {
            Strategy::CopyIn => self.engine.create(image),
            Strategy::Detached => self.engine.run_detached(image),
        }
        .map_err(provisioning)?;

        info!(handle = %handle.short(), image = %image, "provisioned build environment");
        report.handle = Some(handle.to_string());
        Ok(Environment::new(self.engine, handle))
    }

    fn populate(&self, env: &Environment<'_, E>) -> Result<(), BuildError> {
        let source_dir = self.source_dir();
        let population = |source: EngineError| BuildError::Population {
            path: source_dir.clone(),
            source,
        };

        if !source_dir.is_dir() {
            return Err(population(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "source directory does not exist",
            ))));
        }

        info!(
            from = %source_dir.display(),
            to = %self.config.workspace,
            "copying source tree into build environment"
        );
        self.engine
            .copy_in(env.handle(), &source_dir, &self.config.workspace)
            .map_err(population)
    }

    fn execute(&self, env: &Environment<'_, E>, report: &mut RunReport) -> Result<(), BuildError> {
        report.state = State::Executing;
        let mut sink = |line: &str| info!(target: BUILD_OUTPUT_TARGET, "{line}");

        let status: BuildStatus = match self.config.strategy {
            Strategy::CopyIn => self.engine.start_attach(env.handle(), &self.cancel, &mut sink),
            Strategy::Detached => self.engine.wait(env.handle(), &self.cancel, &mut sink),
        }
        .map_err(|source| BuildError::Execution { source })?;

        report.exit_code = Some(status.exit_code);
        if status.success() {
            return Ok(());
        }
        if self.config.check_exit_status {
            return Err(BuildError::BuildFailed {
                exit_code: status.exit_code,
            });
        }
        warn!(
            exit_code = status.exit_code,
            "build exited non-zero; continuing because check_exit_status is off"
        );
        Ok(())
    }

    fn extract(&self, env: &Environment<'_, E>, report: &mut RunReport) -> Result<(), BuildError> {
        let remote = &self.config.artifact_path;
        let local = self.output_dir();
        let extraction = |source: EngineError| BuildError::Extraction {
            remote: remote.clone(),
            local: local.clone(),
            source,
        };

        let parent = match local.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let created = create_parents(&parent).map_err(|e| extraction(EngineError::Io(e)))?;

        info!(from = %remote, to = %local.display(), "copying build artifacts");
        let staged = self.stage(env, remote, &parent).and_then(|staging| {
            install(&staging, &local, self.config.clean_output)?;
            Ok(())
        });
        if let Err(e) = staged {
            if let Some(dir) = created {
                let _ = std::fs::remove_dir_all(dir);
            }
            return Err(extraction(e));
        }

        report.artifacts = count_files(&local);
        info!(files = report.artifacts, dir = %local.display(), "artifacts extracted");
        Ok(())
    }

    /// Copy the artifacts into a fresh directory next to the destination so
    /// a failed copy never touches what is already there.
    fn stage(
        &self,
        env: &Environment<'_, E>,
        remote: &str,
        parent: &Path,
    ) -> Result<TempDir, EngineError> {
        let staging = tempfile::Builder::new()
            .prefix(".boxbuild-")
            .tempdir_in(parent)?;
        let target = staging.path().join(STAGED);
        self.engine.copy_out(env.handle(), remote, &target)?;

        if !target.exists() {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "artifact destination missing after copy",
            )));
        }
        Ok(staging)
    }
}

const STAGED: &str = "artifacts";
const PREVIOUS: &str = "previous";

/// Move the staged tree to `local`. With `clean`, an existing tree is
/// replaced; otherwise the staged files are merged over it.
fn install(staging: &TempDir, local: &Path, clean: bool) -> std::io::Result<()> {
    let staged = staging.path().join(STAGED);
    let existing = std::fs::symlink_metadata(local).is_ok();

    if existing && !clean {
        return merge_tree(&staged, local);
    }
    if existing {
        // Parked inside the staging dir; removed when it drops.
        std::fs::rename(local, staging.path().join(PREVIOUS))?;
    }
    if let Err(e) = std::fs::rename(&staged, local) {
        if existing {
            let _ = std::fs::rename(staging.path().join(PREVIOUS), local);
        }
        return Err(e);
    }
    Ok(())
}

fn merge_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        let Ok(rel) = entry.path().strip_prefix(from) else {
            continue;
        };
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else {
            std::fs::rename(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Create `dir` and any missing ancestors, returning the outermost
/// directory that did not exist before.
fn create_parents(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let outermost = dir
        .ancestors()
        .take_while(|a| !a.as_os_str().is_empty() && !a.exists())
        .last()
        .map(Path::to_path_buf);
    std::fs::create_dir_all(dir)?;
    Ok(outermost)
}

/// Absolute form of `path` with symlinks resolved where the path exists and
/// `.`/`..` folded lexically where it does not.
fn resolve(path: &Path) -> PathBuf {
    if let Ok(real) = std::fs::canonicalize(path) {
        return real;
    }
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());

    // Canonicalize the deepest existing ancestor, then append the rest.
    let mut base = absolute.as_path();
    let mut rest = Vec::new();
    while !base.exists() {
        match (base.parent(), base.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                base = parent;
            }
            _ => break,
        }
    }
    let mut out = std::fs::canonicalize(base).unwrap_or_else(|_| base.to_path_buf());
    for name in rest.into_iter().rev() {
        out.push(name);
    }

    let mut folded = PathBuf::new();
    for component in out.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                folded.pop();
            }
            other => folded.push(other),
        }
    }
    folded
}

fn finish(mut report: RunReport, outcome: Outcome) -> (Outcome, RunReport) {
    report.success = outcome.is_success();
    report.error = outcome.error().map(ToString::to_string);
    (outcome, report)
}

fn count_files(root: &Path) -> usize {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .count()
}
