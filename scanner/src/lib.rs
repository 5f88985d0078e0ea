mod pipeline;

pub use pipeline::Pipeline;

use adscan_core::browser::StopSignal;
use adscan_core::{config, logging, paths, report};
use anyhow::Context;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanArgs {
  pub config: Option<PathBuf>,
  pub input: PathBuf,
  pub output: Option<PathBuf>,
  /// Previous report whose creatives fill in payloads without a snippet.
  pub cache: Option<PathBuf>,
}

impl ScanArgs {
  pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
    let mut config = None;
    let mut input = None;
    let mut output = None;
    let mut cache = None;

    let mut i = 1;
    while i < args.len() {
      let slot = match args[i].as_str() {
        "--config" => &mut config,
        "--input" => &mut input,
        "--output" => &mut output,
        "--cache" => &mut cache,
        other => anyhow::bail!("unknown argument `{other}`"),
      };
      let value = args
        .get(i + 1)
        .ok_or_else(|| anyhow::anyhow!("`{}` expects a path", args[i]))?;
      *slot = Some(PathBuf::from(value));
      i += 2;
    }

    Ok(Self {
      config,
      input: input.ok_or_else(|| anyhow::anyhow!("expected `--input <creatives.json>`"))?,
      output,
      cache,
    })
  }
}

pub fn run(args: ScanArgs) -> anyhow::Result<()> {
  let base = paths::base_dir()?;
  let config_path = args.config.clone().unwrap_or_else(|| paths::config_path(&base));
  let cfg = config::load_or_create_default(&config_path)?;

  logging::init_file_and_stderr(
    &cfg.directories.log_dir,
    &cfg.logging.level,
    cfg.logging.retention_days,
  )?;

  let stop: StopSignal = Arc::new(AtomicBool::new(false));
  let ctrlc_stop = Arc::clone(&stop);
  ctrlc::set_handler(move || {
    ctrlc_stop.store(true, Ordering::SeqCst);
  })?;

  let payloads = read_payloads(&args.input)?;
  let cached = match &args.cache {
    Some(path) => report::load_report(path)?.creatives,
    None => Vec::new(),
  };

  let run_id = uuid::Uuid::new_v4().to_string();
  let _run = logging::run_span(&run_id).entered();
  tracing::info!( config = %config_path.display(), input = %args.input.display(), "adscan starting");

  let report = Pipeline::new(cfg.clone(), stop)?.run(&run_id, &payloads, &cached)?;

  let output = args
    .output
    .unwrap_or_else(|| paths::report_path(&cfg.directories.output_dir, &run_id));
  report::store_report(&report, &output)?;

  let s = &report.summary;
  println!(
    "Scanned {} creatives: {} modified, {} compliant, {} non-compliant, {} request-matched, {} uploads. Report: {}",
    s.creatives,
    s.modified,
    s.compliant,
    s.non_compliant,
    s.request_match,
    report.uploads.len(),
    output.display()
  );
  Ok(())
}

/// The input is a JSON array of platform creative payloads.
pub fn read_payloads(path: &Path) -> anyhow::Result<Vec<Value>> {
  let raw = fs::read_to_string(path).with_context(|| format!("read input {}", path.display()))?;
  let doc: Value = serde_json::from_str(&raw).with_context(|| format!("parse input {}", path.display()))?;
  match doc {
    Value::Array(items) => Ok(items),
    _ => anyhow::bail!("input {} must be a JSON array of creatives", path.display()),
  }
}
