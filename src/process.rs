use crate::cmd;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL_MS: u64 = 200;

/// Shared cancellation flag for one process scope.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum CommandRunError {
    Spawn(std::io::Error),
    Wait(std::io::Error),
    Canceled,
    TimedOut(u64),
}

impl std::fmt::Display for CommandRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandRunError::Spawn(e) => write!(f, "spawn failed: {e}"),
            CommandRunError::Wait(e) => write!(f, "wait failed: {e}"),
            CommandRunError::Canceled => write!(f, "canceled"),
            CommandRunError::TimedOut(secs) => write!(f, "timed out after {secs}s"),
        }
    }
}

pub type LineHandler = Arc<dyn Fn(&str) + Send + Sync>;

pub fn kill_process_tree(child: &mut Child) {
    #[cfg(windows)]
    {
        let pid = child.id().to_string();
        let _ = cmd::command("taskkill")
            .args(["/PID", &pid, "/T", "/F"])
            .status();
    }

    #[cfg(unix)]
    {
        // The child leads its own group (see cmd::command), so this reaches merge helpers too.
        let group = format!("-{}", child.id());
        let _ = cmd::command("kill")
            .args(["-KILL", "--", &group])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }

    let _ = child.kill();
    let _ = child.wait();
}

/// Runs `cmd` to completion, collecting both streams, while honoring `cancel` and a timeout
/// (`timeout_secs == 0` disables the timeout).
pub fn run_command_output_with_control(
    cmd: &mut Command,
    cancel: Option<&CancelToken>,
    timeout_secs: u64,
) -> Result<Output, CommandRunError> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(CommandRunError::Spawn)?;

    let mut stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let mut stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        buf
    });

    let status = wait_with_control(&mut child, cancel, timeout_secs);
    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();

    Ok(Output {
        status: status?,
        stdout,
        stderr,
    })
}

/// Spawns `cmd` with both output streams piped and stdin closed.
pub fn spawn_piped(cmd: &mut Command) -> std::io::Result<Child> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.spawn()
}

/// Feeds every output line of `child` (stdout and stderr, each on its own reader thread) to
/// `on_line` until the process exits. Readers are joined before returning.
pub fn stream_until_exit(
    mut child: Child,
    cancel: &CancelToken,
    on_line: LineHandler,
) -> Result<ExitStatus, CommandRunError> {
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        let handler = on_line.clone();
        readers.push(thread::spawn(move || read_lines(stdout, handler)));
    }
    if let Some(stderr) = child.stderr.take() {
        let handler = on_line.clone();
        readers.push(thread::spawn(move || read_lines(stderr, handler)));
    }

    let status = wait_with_control(&mut child, Some(cancel), 0);
    for reader in readers {
        let _ = reader.join();
    }
    status
}

fn read_lines(stream: impl Read, on_line: LineHandler) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                if !line.trim().is_empty() {
                    on_line(line);
                }
            }
        }
    }
}

fn wait_with_control(
    child: &mut Child,
    cancel: Option<&CancelToken>,
    timeout_secs: u64,
) -> Result<ExitStatus, CommandRunError> {
    let started = Instant::now();
    let mut abort_reason: Option<CommandRunError> = None;

    loop {
        if abort_reason.is_none() && cancel.is_some_and(CancelToken::is_canceled) {
            kill_process_tree(child);
            abort_reason = Some(CommandRunError::Canceled);
        }
        if abort_reason.is_none()
            && timeout_secs > 0
            && started.elapsed() >= Duration::from_secs(timeout_secs)
        {
            kill_process_tree(child);
            abort_reason = Some(CommandRunError::TimedOut(timeout_secs));
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                return match abort_reason {
                    Some(reason) => Err(reason),
                    None => Ok(status),
                };
            }
            Ok(None) => thread::sleep(Duration::from_millis(POLL_INTERVAL_MS)),
            Err(err) => {
                kill_process_tree(child);
                return Err(CommandRunError::Wait(err));
            }
        }
    }
}

fn missing_pipe(name: &str) -> CommandRunError {
    CommandRunError::Wait(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{name} pipe missing"),
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn stream_until_exit_delivers_lines_from_both_streams() {
        let mut cmd = cmd::command("sh");
        cmd.args(["-c", "echo out1; echo err1 1>&2; echo out2"]);
        let child = spawn_piped(&mut cmd).expect("spawn");

        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        let status = stream_until_exit(
            child,
            &CancelToken::new(),
            Arc::new(move |line: &str| sink.lock().expect("lock").push(line.to_string())),
        )
        .expect("status");

        assert!(status.success());
        let mut lines = seen.lock().expect("lock").clone();
        lines.sort();
        assert_eq!(lines, vec!["err1", "out1", "out2"]);
    }

    #[test]
    fn cancel_kills_long_running_process() {
        let token = CancelToken::new();
        let trigger = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            trigger.cancel();
        });

        let started = Instant::now();
        let mut cmd = cmd::command("sh");
        cmd.args(["-c", "sleep 30"]);
        let result = run_command_output_with_control(&mut cmd, Some(&token), 0);

        assert!(matches!(result, Err(CommandRunError::Canceled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn timeout_is_reported() {
        let mut cmd = cmd::command("sleep");
        cmd.arg("30");
        let result = run_command_output_with_control(&mut cmd, None, 1);
        assert!(matches!(result, Err(CommandRunError::TimedOut(1))));
    }
}
