//! Pool of headless-browser workers that render creatives and record their
//! network traffic.

pub mod process;
pub mod worker;

use crate::classify::HttpsProbe;
use crate::config::{BrowserConfig, Config, DisplayConfig};
use crate::creative::Creative;
use crate::display::{self, VirtualDisplay};
use crate::error::ScanError;
use crate::ports;
use crate::server::{self, TestPageHost};
use crate::types::{IssueRecord, Protocol};
use anyhow::Context;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use worker::BrowserWorker;

/// Shared cancellation flag; set by the operator's interrupt handler.
pub type StopSignal = Arc<AtomicBool>;

const DISPLAY_SETTLE: Duration = Duration::from_millis(500);

/// Read-only state every worker of one run shares.
pub struct FarmContext {
  pub protocol: Protocol,
  pub hostname: String,
  pub workspace: PathBuf,
  pub browser: BrowserConfig,
  pub probe: Arc<dyn HttpsProbe>,
  interrupt: StopSignal,
  abort: AtomicBool,
}

impl FarmContext {
  pub fn new(
    protocol: Protocol,
    hostname: &str,
    workspace: PathBuf,
    browser: BrowserConfig,
    probe: Arc<dyn HttpsProbe>,
    interrupt: StopSignal,
  ) -> Self {
    Self {
      protocol,
      hostname: hostname.to_string(),
      workspace,
      browser,
      probe,
      interrupt,
      abort: AtomicBool::new(false),
    }
  }

  pub fn should_stop(&self) -> bool {
    self.interrupted() || self.abort.load(Ordering::SeqCst)
  }

  pub fn interrupted(&self) -> bool {
    self.interrupt.load(Ordering::SeqCst)
  }

  fn abort(&self) {
    self.abort.store(true, Ordering::SeqCst);
  }
}

/// Splits `items` into at most `workers` contiguous chunks of
/// `ceil(len / workers)` items, so no worker is idle while another has two
/// or more extra creatives.
pub fn partition<T>(items: &[T], workers: usize) -> Vec<&[T]> {
  if items.is_empty() {
    return Vec::new();
  }
  let chunk = items.len().div_ceil(workers.max(1)).max(1);
  items.chunks(chunk).collect()
}

pub struct BrowserFarm {
  protocol: Protocol,
  hostname: String,
  workspace: PathBuf,
  browser: BrowserConfig,
  display: DisplayConfig,
  workers: usize,
  servers: usize,
  tls: Option<Arc<rustls::ServerConfig>>,
  probe: Arc<dyn HttpsProbe>,
  interrupt: StopSignal,
}

impl BrowserFarm {
  /// Validates TLS material up front so a bad certificate fails before any
  /// worker starts.
  pub fn new(
    cfg: &Config,
    protocol: Protocol,
    workspace: PathBuf,
    probe: Arc<dyn HttpsProbe>,
    interrupt: StopSignal,
  ) -> anyhow::Result<Self> {
    server::check_tls_files(&cfg.server)?;
    let tls = match protocol {
      Protocol::Https => Some(server::load_tls_config(&cfg.server)?),
      Protocol::Http => None,
    };
    let (workers, servers) = cfg.capped_counts();

    Ok(Self {
      protocol,
      hostname: cfg.server.hostname.clone(),
      workspace,
      browser: cfg.browser.clone(),
      display: cfg.display.clone(),
      workers,
      servers,
      tls,
      probe,
      interrupt,
    })
  }

  /// Renders every creative once and returns the issue records of the run.
  pub fn run(&self, creatives: &[Creative]) -> anyhow::Result<Vec<IssueRecord>> {
    let chunks = partition(creatives, self.workers);
    if chunks.is_empty() {
      return Ok(Vec::new());
    }

    let ctx = Arc::new(FarmContext::new(
      self.protocol,
      &self.hostname,
      self.workspace.clone(),
      self.browser.clone(),
      Arc::clone(&self.probe),
      Arc::clone(&self.interrupt),
    ));
    let mut guard = FarmGuard::new(Arc::clone(&ctx));

    let ports = ports::find_open_ports(self.servers.max(1))?;
    for port in &ports {
      guard
        .servers
        .push(TestPageHost::start(*port, self.workspace.clone(), self.tls.clone())?);
    }

    let display_ids: Vec<Option<u32>> = (0..chunks.len())
      .map(|i| {
        self
          .display
          .enabled
          .then(|| self.display.offset + i as u32 + 1)
      })
      .collect();
    if self.display.enabled {
      let ids: Vec<u32> = display_ids.iter().flatten().copied().collect();
      guard.displays = display::start_displays(&self.display.executable, &ids, &self.display.dimension)?;
      std::thread::sleep(DISPLAY_SETTLE);
    }

    tracing::info!(
      protocol = %self.protocol,
      creatives = creatives.len(),
      workers = chunks.len(),
      ?ports,
      "browser farm starting"
    );

    let (tx, rx) = mpsc::channel::<IssueRecord>();
    let run_span = tracing::Span::current();
    for (i, chunk) in chunks.into_iter().enumerate() {
      let port = ports[i % ports.len()];
      let worker = BrowserWorker::new(i, display_ids[i], port, Arc::clone(&ctx));
      let targets = worker.prepare_targets(chunk)?;
      let tx = tx.clone();
      let span = run_span.clone();
      let handle = thread::Builder::new()
        .name(format!("browser-{i}"))
        .spawn(move || {
          let _run = span.entered();
          worker.run(targets, tx)
        })
        .with_context(|| format!("spawn browser worker {i}"))?;
      guard.workers.push((i, handle));
    }
    drop(tx);

    let records: Vec<IssueRecord> = rx.iter().collect();
    guard.join_workers();
    drop(guard);

    if ctx.interrupted() {
      tracing::warn!(protocol = %self.protocol, records = records.len(), "browser farm interrupted");
      return Err(ScanError::Interrupted.into());
    }

    tracing::info!(protocol = %self.protocol, records = records.len(), "browser farm finished");
    Ok(records)
  }
}

/// Stops workers, then servers and displays, on every exit path.
struct FarmGuard {
  ctx: Arc<FarmContext>,
  workers: Vec<(usize, JoinHandle<()>)>,
  servers: Vec<TestPageHost>,
  displays: Vec<VirtualDisplay>,
}

impl FarmGuard {
  fn new(ctx: Arc<FarmContext>) -> Self {
    Self {
      ctx,
      workers: Vec::new(),
      servers: Vec::new(),
      displays: Vec::new(),
    }
  }

  fn join_workers(&mut self) {
    for (i, handle) in self.workers.drain(..) {
      if handle.join().is_err() {
        tracing::error!(worker = i, "browser worker panicked; its remaining creatives were skipped");
      }
    }
  }
}

impl Drop for FarmGuard {
  fn drop(&mut self) {
    if !self.workers.is_empty() {
      self.ctx.abort();
      self.join_workers();
    }
    for server in &mut self.servers {
      server.shutdown();
    }
    for display in &mut self.displays {
      display.shutdown();
    }
  }
}
