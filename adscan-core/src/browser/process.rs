use anyhow::Context;
use std::io::Read;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use wait_timeout::ChildExt;

#[derive(Debug)]
pub struct ProcessOutcome {
  /// None when the process was killed after the timeout.
  pub status: Option<ExitStatus>,
  pub stdout: String,
  pub stderr: String,
}

impl ProcessOutcome {
  pub fn timed_out(&self) -> bool {
    self.status.is_none()
  }
}

/// A child process that is always killed and reaped, even on early return.
pub struct ScopedProcess {
  child: Child,
  stdout: Option<JoinHandle<String>>,
  stderr: Option<JoinHandle<String>>,
  reaped: bool,
}

impl ScopedProcess {
  /// Spawns with stdin closed; stdout and stderr are drained in the background
  /// so a chatty child cannot block on a full pipe.
  pub fn spawn(mut command: Command) -> anyhow::Result<Self> {
    command
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());

    let program = command.get_program().to_string_lossy().into_owned();
    let mut child = command
      .spawn()
      .with_context(|| format!("spawn {program}"))?;

    let stdout = child.stdout.take().map(drain::<ChildStdout>);
    let stderr = child.stderr.take().map(drain::<ChildStderr>);

    Ok(Self {
      child,
      stdout,
      stderr,
      reaped: false,
    })
  }

  pub fn id(&self) -> u32 {
    self.child.id()
  }

  pub fn wait(mut self, timeout: Option<Duration>) -> anyhow::Result<ProcessOutcome> {
    let status = match timeout {
      Some(t) => match self.child.wait_timeout(t).context("wait for child process")? {
        Some(status) => Some(status),
        None => {
          let _ = self.child.kill();
          let _ = self.child.wait();
          None
        }
      },
      None => Some(self.child.wait().context("wait for child process")?),
    };
    self.reaped = true;

    // A killed wrapper may leave grandchildren holding the pipes open; the
    // drain threads are detached in that case.
    let (stdout, stderr) = if status.is_some() {
      (join_output(self.stdout.take()), join_output(self.stderr.take()))
    } else {
      (String::new(), String::new())
    };

    Ok(ProcessOutcome {
      status,
      stdout,
      stderr,
    })
  }
}

impl Drop for ScopedProcess {
  fn drop(&mut self) {
    if !self.reaped {
      let _ = self.child.kill();
      let _ = self.child.wait();
    }
  }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
  thread::spawn(move || {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
  })
}

fn join_output(handle: Option<JoinHandle<String>>) -> String {
  handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use std::time::Instant;

  #[test]
  fn captures_output_and_status() {
    let mut cmd = Command::new("/bin/sh");
    cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
    let outcome = ScopedProcess::spawn(cmd).unwrap().wait(Some(Duration::from_secs(10))).unwrap();

    assert_eq!(outcome.status.and_then(|s| s.code()), Some(3));
    assert_eq!(outcome.stdout.trim(), "out");
    assert_eq!(outcome.stderr.trim(), "err");
  }

  #[test]
  fn timeout_kills_the_child() {
    let mut cmd = Command::new("/bin/sh");
    cmd.args(["-c", "exec sleep 30"]);
    let started = Instant::now();
    let outcome = ScopedProcess::spawn(cmd).unwrap().wait(Some(Duration::from_millis(200))).unwrap();

    assert!(outcome.timed_out());
    assert!(started.elapsed() < Duration::from_secs(10));
  }

  #[test]
  fn spawn_failure_is_an_error() {
    assert!(ScopedProcess::spawn(Command::new("/nonexistent/browser-adscan")).is_err());
  }
}
