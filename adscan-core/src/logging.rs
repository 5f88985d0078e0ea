use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

const LOG_FILE_NAME: &str = "adscan.log";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn init_file_and_stderr(
  log_dir: &Path,
  level: &str,
  retention_days: u64,
) -> anyhow::Result<()> {
  fs::create_dir_all(log_dir)?;
  cleanup_old_logs(log_dir, retention_days)?;

  let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
  let _ = FILE_GUARD.set(guard);

  let filter = tracing_subscriber::EnvFilter::try_new(level)
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt_layer(file_writer))
    .with(fmt_layer(std::io::stderr))
    .try_init()
    .map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))?;

  Ok(())
}

/// Span every line of one scan run is recorded under, so interleaved runs
/// sharing a log directory can be told apart. Worker threads re-enter it.
pub fn run_span(run_id: &str) -> tracing::Span {
  tracing::info_span!("scan", run_id = %run_id)
}

fn fmt_layer<S, W>(writer: W) -> impl Layer<S>
where
  S: Subscriber + for<'a> LookupSpan<'a>,
  W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
  tracing_subscriber::fmt::layer()
    .with_ansi(false)
    .with_writer(writer)
    .with_target(true)
}

fn cleanup_old_logs(log_dir: &Path, retention_days: u64) -> anyhow::Result<()> {
  if retention_days == 0 {
    return Ok(());
  }

  let cutoff = SystemTime::now()
    .checked_sub(Duration::from_secs(retention_days.saturating_mul(24 * 60 * 60)))
    .unwrap_or(SystemTime::UNIX_EPOCH);

  let entries = match fs::read_dir(log_dir) {
    Ok(e) => e,
    Err(_) => return Ok(()),
  };

  for entry in entries.flatten() {
    let path: PathBuf = entry.path();
    if !is_adscan_log_file(&path) {
      continue;
    }

    let modified = match entry.metadata().and_then(|m| m.modified()) {
      Ok(t) => t,
      Err(_) => continue,
    };

    if modified < cutoff {
      let _ = fs::remove_file(&path);
    }
  }

  Ok(())
}

fn is_adscan_log_file(path: &Path) -> bool {
  let name = match path.file_name().and_then(|n| n.to_str()) {
    Some(n) => n,
    None => return false,
  };

  name == LOG_FILE_NAME || name.starts_with("adscan.log.")
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use std::sync::{Arc, Mutex};

  #[derive(Clone, Default)]
  struct Captured(Arc<Mutex<Vec<u8>>>);

  impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
      self.0.lock().unwrap().extend_from_slice(buf);
      Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
      Ok(())
    }
  }

  impl<'w> MakeWriter<'w> for Captured {
    type Writer = Captured;

    fn make_writer(&'w self) -> Self::Writer {
      self.clone()
    }
  }

  #[test]
  fn lines_inside_a_run_carry_its_id() {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::registry().with(fmt_layer(captured.clone()));

    tracing::subscriber::with_default(subscriber, || {
      {
        let _run = run_span("4f2a-run").entered();
        tracing::info!(creatives = 3, "browser farm starting");
      }
      tracing::info!("outside any run");
    });

    let out = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 2, "{out}");
    assert!(lines[0].contains("scan{run_id=4f2a-run}"), "{out}");
    assert!(lines[0].contains("creatives=3"));
    assert!(!lines[1].contains("run_id"));
  }

  #[test]
  fn only_rolled_adscan_logs_are_matched() {
    assert!(is_adscan_log_file(Path::new("/var/log/adscan.log")));
    assert!(is_adscan_log_file(Path::new("/var/log/adscan.log.2026-10-01")));
    assert!(!is_adscan_log_file(Path::new("/var/log/other.log")));
    assert!(!is_adscan_log_file(Path::new("/var/log/adscan.log-old")));
  }

  #[test]
  fn zero_retention_keeps_everything() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("adscan.log.2020-01-01");
    fs::write(&file, "old").unwrap();

    cleanup_old_logs(dir.path(), 0).unwrap();
    assert!(file.exists());

    cleanup_old_logs(dir.path(), 14).unwrap();
    assert!(file.exists(), "fresh file is inside the retention window");
  }
}
