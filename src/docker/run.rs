use std::io::BufRead;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use super::types::{CancelToken, ContainerCommand, EngineError, OutputLine, ProcessResult};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Spawn an engine process and return a channel that streams its output.
///
/// The caller receives [`OutputLine::Stdout`]/[`Stderr`] as they arrive,
/// followed by exactly one [`OutputLine::Done`] carrying the final result.
pub fn spawn(
    cmd: &ContainerCommand,
    cancel: CancelToken,
) -> Result<Receiver<OutputLine>, EngineError> {
    debug!(command = %cmd.display(), "spawning");
    let mut child = Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| EngineError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let (tx, rx) = mpsc::channel();
    let timeout = cmd.timeout;

    std::thread::spawn(move || {
        orchestrate(child, stdout, stderr, tx, cancel, timeout);
    });

    Ok(rx)
}

/// Run a command to completion, forwarding each output line to `sink`.
///
/// Cancellation and timeout become errors; a non-zero exit does not, since
/// callers decide what the exit status means.
pub fn stream(
    cmd: &ContainerCommand,
    cancel: &CancelToken,
    sink: &mut dyn FnMut(&str),
) -> Result<ProcessResult, EngineError> {
    let rx = spawn(cmd, cancel.clone())?;

    for line in rx {
        match line {
            OutputLine::Stdout(s) | OutputLine::Stderr(s) => sink(&s),
            OutputLine::Done(result) => {
                if result.cancelled {
                    return Err(EngineError::Cancelled {
                        command: cmd.display(),
                    });
                }
                if result.timed_out {
                    return Err(EngineError::TimedOut {
                        command: cmd.display(),
                        timeout: cmd.timeout.unwrap_or_default(),
                    });
                }
                return Ok(result);
            }
        }
    }

    // The orchestrator always sends `Done`; a closed channel means it died.
    Err(EngineError::Io(std::io::Error::other(format!(
        "lost output of `{}`",
        cmd.display()
    ))))
}

/// Run a short-lived command and return its trimmed stdout.
pub fn capture(cmd: &ContainerCommand) -> Result<String, EngineError> {
    debug!(command = %cmd.display(), "running");
    let output = Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| EngineError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(EngineError::Command {
            command: cmd.display(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn orchestrate(
    mut child: std::process::Child,
    stdout: std::process::ChildStdout,
    stderr: std::process::ChildStderr,
    tx: Sender<OutputLine>,
    cancel: CancelToken,
    timeout: Option<Duration>,
) {
    let log_buf = Arc::new(Mutex::new(String::new()));

    let stdout_handle = forward_lines(stdout, tx.clone(), log_buf.clone(), OutputLine::Stdout);
    let stderr_handle = forward_lines(stderr, tx.clone(), log_buf.clone(), OutputLine::Stderr);

    // --- poll loop ---------------------------------------------------------
    let start = Instant::now();
    let mut cancelled = false;
    let mut timed_out = false;

    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(_) => break None,
        }

        if cancel.is_cancelled() {
            cancelled = true;
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }

        if timeout.is_some_and(|t| start.elapsed() > t) {
            timed_out = true;
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }

        std::thread::sleep(POLL_INTERVAL);
    };

    // --- finalize ----------------------------------------------------------
    let _ = stdout_handle.join();
    let _ = stderr_handle.join();

    let exit_code = exit_status.and_then(|s| s.code());
    let log = log_buf.lock().map(|b| b.clone()).unwrap_or_default();

    let _ = tx.send(OutputLine::Done(ProcessResult {
        success: exit_code == Some(0),
        exit_code,
        log,
        cancelled,
        timed_out,
    }));
}

fn forward_lines<R: std::io::Read + Send + 'static>(
    reader: R,
    tx: Sender<OutputLine>,
    buf: Arc<Mutex<String>>,
    wrap: fn(String) -> OutputLine,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let reader = std::io::BufReader::new(reader);
        for line in reader.lines() {
            let Ok(l) = line else { break };
            if let Ok(mut buf) = buf.lock() {
                buf.push_str(&l);
                buf.push('\n');
            }
            // Receiver may be dropped; ignore send errors.
            let _ = tx.send(wrap(l));
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Option<Duration>) -> ContainerCommand {
        ContainerCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            timeout,
        }
    }

    #[test]
    fn stream_forwards_lines_and_exit_code() {
        let mut lines = Vec::new();
        let result = stream(
            &sh("echo one; echo two >&2; exit 3", None),
            &CancelToken::new(),
            &mut |l: &str| lines.push(l.to_string()),
        )
        .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        lines.sort();
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn stream_reports_cancellation() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = stream(&sh("sleep 5", None), &cancel, &mut |_: &str| {}).unwrap_err();
        assert!(matches!(err, EngineError::Cancelled { .. }));
    }

    #[test]
    fn stream_reports_timeout() {
        let err = stream(
            &sh("sleep 5", Some(Duration::from_millis(100))),
            &CancelToken::new(),
            &mut |_: &str| {},
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::TimedOut { .. }));
    }

    #[test]
    fn capture_trims_stdout() {
        let out = capture(&sh("printf '  abc123\\n'", None)).unwrap();
        assert_eq!(out, "abc123");
    }

    #[test]
    fn capture_surfaces_stderr_on_failure() {
        let err = capture(&sh("echo 'engine unreachable' >&2; exit 1", None)).unwrap_err();
        assert!(err.to_string().contains("engine unreachable"));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let cmd = ContainerCommand {
            program: "definitely-not-a-container-engine".into(),
            args: Vec::new(),
            timeout: None,
        };
        assert!(matches!(capture(&cmd), Err(EngineError::Spawn { .. })));
    }
}
