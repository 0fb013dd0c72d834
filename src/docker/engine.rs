use std::path::Path;
use std::time::Duration;

use tracing::debug;

use super::run::{capture, stream};
use super::types::{BuildStatus, CancelToken, ContainerCommand, EngineError, EnvironmentHandle};

/// The container engine primitives a build run depends on.
///
/// Every call blocks until the engine responds. `sink` receives build
/// output line by line while the build is running.
pub trait Engine {
    /// Verify that the engine is reachable.
    fn ping(&self) -> Result<(), EngineError>;

    /// Create a stopped environment from `image`.
    fn create(&self, image: &str) -> Result<EnvironmentHandle, EngineError>;

    /// Launch `image` in the background; the build starts immediately.
    fn run_detached(&self, image: &str) -> Result<EnvironmentHandle, EngineError>;

    /// Copy the contents of the local directory `local` into `remote`.
    fn copy_in(&self, handle: &EnvironmentHandle, local: &Path, remote: &str)
    -> Result<(), EngineError>;

    /// Start a created environment and block on its output until it exits.
    fn start_attach(
        &self,
        handle: &EnvironmentHandle,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(&str),
    ) -> Result<BuildStatus, EngineError>;

    /// Block until a running environment exits.
    fn wait(
        &self,
        handle: &EnvironmentHandle,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(&str),
    ) -> Result<BuildStatus, EngineError>;

    /// Copy `remote` out of the environment to `local`.
    fn copy_out(&self, handle: &EnvironmentHandle, remote: &str, local: &Path)
    -> Result<(), EngineError>;

    /// Forcibly remove the environment.
    fn remove(&self, handle: &EnvironmentHandle) -> Result<(), EngineError>;
}

/// [`Engine`] backed by a Docker-compatible command line.
#[derive(Debug, Clone)]
pub struct CliEngine {
    program: String,
    prefix: Vec<String>,
    run_args: Vec<String>,
    build_command: Vec<String>,
    timeout: Option<Duration>,
}

impl CliEngine {
    /// Build an engine from a command string such as `docker` or
    /// `sudo podman`.
    pub fn new(command: &str) -> Result<Self, EngineError> {
        let mut words = shell_words::split(command).map_err(|e| EngineError::Parse {
            command: command.to_string(),
            output: e.to_string(),
        })?;
        if words.is_empty() {
            return Err(EngineError::Parse {
                command: command.to_string(),
                output: "empty engine command".to_string(),
            });
        }
        let program = words.remove(0);
        Ok(Self {
            program,
            prefix: words,
            run_args: Vec::new(),
            build_command: Vec::new(),
            timeout: None,
        })
    }

    /// Extra arguments passed when provisioning (`create` / `run -d`).
    pub fn with_run_args(mut self, args: Vec<String>) -> Self {
        self.run_args = args;
        self
    }

    /// Command run in place of the image's default, placed after the image.
    pub fn with_build_command(mut self, command: Vec<String>) -> Self {
        self.build_command = command;
        self
    }

    /// Upper bound on how long the build may run. `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Assemble an invocation of the engine with the given subcommand args.
    pub fn command<I, S>(&self, args: I) -> ContainerCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all = self.prefix.clone();
        all.extend(args.into_iter().map(Into::into));
        ContainerCommand {
            program: self.program.clone(),
            args: all,
            timeout: None,
        }
    }

    fn provision_command(&self, verb: &[&str], image: &str) -> ContainerCommand {
        let mut cmd = self.command(verb.iter().copied());
        cmd.args.extend(self.run_args.iter().cloned());
        cmd.args.push(image.to_string());
        cmd.args.extend(self.build_command.iter().cloned());
        cmd
    }

    fn exit_code(&self, handle: &EnvironmentHandle) -> Result<BuildStatus, EngineError> {
        let cmd = self.command(["inspect", "--format", "{{.State.ExitCode}}", handle.as_str()]);
        let out = capture(&cmd)?;
        parse_exit_code(&cmd, &out)
    }
}

impl Engine for CliEngine {
    fn ping(&self) -> Result<(), EngineError> {
        capture(&self.command(["version", "--format", "{{.Server.Version}}"]))?;
        Ok(())
    }

    fn create(&self, image: &str) -> Result<EnvironmentHandle, EngineError> {
        let cmd = self.provision_command(&["create"], image);
        handle_from(&cmd, capture(&cmd)?)
    }

    fn run_detached(&self, image: &str) -> Result<EnvironmentHandle, EngineError> {
        let cmd = self.provision_command(&["run", "-d"], image);
        handle_from(&cmd, capture(&cmd)?)
    }

    fn copy_in(
        &self,
        handle: &EnvironmentHandle,
        local: &Path,
        remote: &str,
    ) -> Result<(), EngineError> {
        // `<dir>/.` copies the directory's contents rather than the directory.
        let source = local.join(".");
        let cmd = self.command([
            "cp".to_string(),
            source.display().to_string(),
            format!("{handle}:{remote}"),
        ]);
        capture(&cmd)?;
        Ok(())
    }

    fn start_attach(
        &self,
        handle: &EnvironmentHandle,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(&str),
    ) -> Result<BuildStatus, EngineError> {
        let mut cmd = self.command(["start", "-a", handle.as_str()]);
        cmd.timeout = self.timeout;
        let result = stream(&cmd, cancel, sink)?;
        if !result.success {
            debug!(exit_code = ?result.exit_code, "attach exited non-zero");
        }
        // The attach exit code conflates engine and build failures; ask
        // the engine for the container's own status.
        self.exit_code(handle)
    }

    fn wait(
        &self,
        handle: &EnvironmentHandle,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(&str),
    ) -> Result<BuildStatus, EngineError> {
        let mut cmd = self.command(["wait", handle.as_str()]);
        cmd.timeout = self.timeout;
        let mut printed = String::new();
        let result = stream(&cmd, cancel, &mut |line: &str| {
            printed.push_str(line);
            printed.push('\n');
        })?;
        if !result.success {
            return Err(EngineError::Command {
                command: cmd.display(),
                status: format!("{:?}", result.exit_code),
                stderr: result.log.trim().to_string(),
            });
        }
        let status = parse_exit_code(&cmd, &printed)?;

        let logs = self.command(["logs", handle.as_str()]);
        stream(&logs, cancel, sink)?;
        Ok(status)
    }

    fn copy_out(
        &self,
        handle: &EnvironmentHandle,
        remote: &str,
        local: &Path,
    ) -> Result<(), EngineError> {
        let cmd = self.command([
            "cp".to_string(),
            format!("{handle}:{remote}"),
            local.display().to_string(),
        ]);
        capture(&cmd)?;
        Ok(())
    }

    fn remove(&self, handle: &EnvironmentHandle) -> Result<(), EngineError> {
        capture(&self.command(["rm", "-f", handle.as_str()]))?;
        Ok(())
    }
}

fn handle_from(cmd: &ContainerCommand, stdout: String) -> Result<EnvironmentHandle, EngineError> {
    // `run -d` may print pull progress before the ID; the ID is last.
    match stdout.lines().last().map(str::trim) {
        Some(id) if !id.is_empty() && !id.contains(char::is_whitespace) => {
            Ok(EnvironmentHandle::new(id))
        }
        _ => Err(EngineError::Parse {
            command: cmd.display(),
            output: stdout,
        }),
    }
}

fn parse_exit_code(cmd: &ContainerCommand, output: &str) -> Result<BuildStatus, EngineError> {
    output
        .trim()
        .lines()
        .last()
        .and_then(|l| l.trim().parse::<i64>().ok())
        .map(|exit_code| BuildStatus { exit_code })
        .ok_or_else(|| EngineError::Parse {
            command: cmd.display(),
            output: output.to_string(),
        })
}

/// Returns `["--user", "uid:gid"]` on Unix so the build runs as the
/// invoking user. Empty on other platforms.
pub fn user_args() -> Vec<String> {
    #[cfg(unix)]
    {
        // SAFETY: geteuid() and getegid() are simple POSIX getters that always succeed and have no side effects.
        let uid = unsafe { libc::geteuid() };
        let gid = unsafe { libc::getegid() };
        vec!["--user".into(), format!("{uid}:{gid}")]
    }

    #[cfg(not(unix))]
    {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_command_is_split_into_program_and_prefix() {
        let engine = CliEngine::new("sudo docker").unwrap();
        let cmd = engine.command(["rm", "-f", "abc123"]);
        assert_eq!(cmd.program, "sudo");
        assert_eq!(cmd.args, vec!["docker", "rm", "-f", "abc123"]);
    }

    #[test]
    fn blank_engine_command_is_rejected() {
        assert!(matches!(CliEngine::new("  "), Err(EngineError::Parse { .. })));
        assert!(CliEngine::new("docker 'unterminated").is_err());
    }

    #[test]
    fn provisioning_places_run_args_before_image() {
        let engine = CliEngine::new("docker")
            .unwrap()
            .with_run_args(vec!["--user".into(), "1000:1000".into()]);
        let cmd = engine.provision_command(&["run", "-d"], "builder:latest");
        assert_eq!(
            cmd.args,
            vec!["run", "-d", "--user", "1000:1000", "builder:latest"]
        );
    }

    #[test]
    fn build_command_follows_image() {
        let engine = CliEngine::new("docker")
            .unwrap()
            .with_build_command(vec!["make".into(), "install".into()]);
        let cmd = engine.provision_command(&["create"], "builder");
        assert_eq!(cmd.args, vec!["create", "builder", "make", "install"]);
    }

    #[test]
    fn handle_is_last_line_of_output() {
        let cmd = CliEngine::new("docker").unwrap().command(["run", "-d", "img"]);
        let handle = handle_from(&cmd, "Pulling img\nDone\nabc123".into()).unwrap();
        assert_eq!(handle.as_str(), "abc123");
        assert!(handle_from(&cmd, String::new()).is_err());
    }

    #[test]
    fn exit_code_parsing() {
        let cmd = CliEngine::new("docker").unwrap().command(["wait", "abc123"]);
        assert_eq!(parse_exit_code(&cmd, "0\n").unwrap().exit_code, 0);
        assert_eq!(parse_exit_code(&cmd, "137").unwrap().exit_code, 137);
        assert!(parse_exit_code(&cmd, "not a number").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn ping_fails_for_missing_engine() {
        let engine = CliEngine::new("definitely-not-a-container-engine").unwrap();
        assert!(matches!(engine.ping(), Err(EngineError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn user_args_returns_pair() {
        let args = user_args();
        assert_eq!(args.len(), 2);
        assert_eq!(args[0], "--user");
        assert!(args[1].contains(':'));
    }
}
