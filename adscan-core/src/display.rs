use anyhow::Context;
use std::process::{Child, Command, Stdio};

/// A virtual X server owned for the lifetime of one scan run.
pub struct VirtualDisplay {
  id: u32,
  child: Option<Child>,
}

impl VirtualDisplay {
  pub fn start(executable: &str, id: u32, dimension: &str) -> anyhow::Result<Self> {
    let child = Command::new(executable)
      .args(display_args(id, dimension))
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .spawn()
      .with_context(|| format!("start virtual display :{id} with {executable}"))?;

    tracing::info!(display = id, pid = child.id(), "virtual display started");
    Ok(Self {
      id,
      child: Some(child),
    })
  }

  pub fn id(&self) -> u32 {
    self.id
  }

  pub fn shutdown(&mut self) {
    if let Some(mut child) = self.child.take() {
      let _ = child.kill();
      let _ = child.wait();
      tracing::debug!(display = self.id, "virtual display stopped");
    }
  }
}

impl Drop for VirtualDisplay {
  fn drop(&mut self) {
    self.shutdown();
  }
}

pub fn display_args(id: u32, dimension: &str) -> Vec<String> {
  vec![
    format!(":{id}"),
    "-screen".to_string(),
    "0".to_string(),
    dimension.to_string(),
  ]
}

/// Starts one display per id; already started ones are dropped (and killed) on error.
pub fn start_displays(executable: &str, ids: &[u32], dimension: &str) -> anyhow::Result<Vec<VirtualDisplay>> {
  ids
    .iter()
    .map(|id| VirtualDisplay::start(executable, *id, dimension))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn args_name_display_and_screen() {
    assert_eq!(display_args(101, "1024x768x24"), vec![":101", "-screen", "0", "1024x768x24"]);
  }

  #[test]
  fn missing_executable_is_reported() {
    let err = VirtualDisplay::start("/nonexistent/Xvfb-adscan", 7, "800x600x24")
      .err()
      .unwrap();
    assert!(err.to_string().contains(":7"));
  }

  #[cfg(unix)]
  #[test]
  fn drop_reaps_the_server_process() {
    // `sleep :5 -screen 0 30` exits with a usage error but still spawns.
    let mut display = VirtualDisplay::start("sleep", 5, "30").unwrap();
    assert_eq!(display.id(), 5);
    display.shutdown();
    assert!(display.child.is_none());
  }
}
