use adscan_core::browser::{BrowserFarm, StopSignal};
use adscan_core::classify::{HttpsProbe, ReqwestProbe};
use adscan_core::compliance::{self, ComplianceAggregator};
use adscan_core::config::Config;
use adscan_core::creative::{Creative, HttpPreview, PreviewSource};
use adscan_core::error::ScanError;
use adscan_core::report::{ReportSummary, ScanReport};
use adscan_core::rewrite::SnippetRewriter;
use adscan_core::server;
use adscan_core::types::{now_unix_ms, CreativeId, IssueRecord, Protocol};
use adscan_core::workspace::Workspace;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// One scan run: prepare → browse https → browse http → compliance →
/// uploads → cleanup, each step gated by `[steps]`.
pub struct Pipeline {
  cfg: Config,
  rewriter: SnippetRewriter,
  workspace: Workspace,
  probe: Arc<dyn HttpsProbe>,
  preview: Box<dyn PreviewSource>,
  stop: StopSignal,
  creatives: Vec<Creative>,
  payloads: HashMap<CreativeId, Value>,
  records: Vec<IssueRecord>,
  uploads: Vec<Value>,
}

impl Pipeline {
  pub fn new(cfg: Config, stop: StopSignal) -> anyhow::Result<Self> {
    let probe = Arc::new(ReqwestProbe::new(&cfg.verify)?);
    let preview = Box::new(HttpPreview::new(Duration::from_secs(cfg.verify.timeout_seconds))?);
    Self::with_parts(cfg, stop, probe, preview)
  }

  pub fn with_parts(
    cfg: Config,
    stop: StopSignal,
    probe: Arc<dyn HttpsProbe>,
    preview: Box<dyn PreviewSource>,
  ) -> anyhow::Result<Self> {
    let (workers, _) = cfg.capped_counts();
    let workspace = Workspace::new(cfg.directories.tmp_dir.clone(), workers);
    Ok(Self {
      cfg,
      rewriter: SnippetRewriter::new()?,
      workspace,
      probe,
      preview,
      stop,
      creatives: Vec::new(),
      payloads: HashMap::new(),
      records: Vec::new(),
      uploads: Vec::new(),
    })
  }

  pub fn run(mut self, run_id: &str, payloads: &[Value], cached: &[Creative]) -> anyhow::Result<ScanReport> {
    let started = now_unix_ms();
    tracing::info!(payloads = payloads.len(), cached = cached.len(), "scan pipeline starting");

    let outcome = self.run_steps(payloads, cached);
    if self.cfg.steps.remove_temp_files {
      if let Err(e) = self.remove_temp_files() {
        tracing::warn!(error = %e, "temp file cleanup failed");
      }
    }
    outcome?;

    let summary = ReportSummary::from_parts(&self.creatives, &self.records);
    tracing::info!(
      creatives = summary.creatives,
      compliant = summary.compliant,
      uploaded = summary.uploaded,
      "scan pipeline finished"
    );

    Ok(ScanReport {
      run_id: run_id.to_string(),
      started_at_unix_ms: started,
      finished_at_unix_ms: now_unix_ms(),
      summary,
      creatives: self.creatives,
      records: self.records,
      uploads: self.uploads,
    })
  }

  fn run_steps(&mut self, payloads: &[Value], cached: &[Creative]) -> anyhow::Result<()> {
    self.setup()?;
    self.load(payloads, cached)?;
    self.prepare_snippets()?;

    let steps = self.cfg.steps.clone();
    if steps.browse_https {
      self.browse(Protocol::Https)?;
    }
    if steps.browse_http {
      self.browse(Protocol::Http)?;
    }
    if steps.check_compliance {
      self.check_compliance();
    }
    if steps.select_uploads {
      self.select_uploads();
    }
    Ok(())
  }

  /// Certificate problems abort here, before any creative is touched.
  fn setup(&self) -> anyhow::Result<()> {
    if self.cfg.steps.browse_https {
      server::check_tls_files(&self.cfg.server)?;
    }
    self.workspace.create()
  }

  /// Builds creatives from platform payloads. A payload without a snippet
  /// falls back to the cached copy of the same creative, re-derived.
  fn load(&mut self, payloads: &[Value], cached: &[Creative]) -> anyhow::Result<()> {
    let limit = match self.cfg.scan.max_scan {
      0 => usize::MAX,
      n => n,
    };
    let cache: HashMap<CreativeId, &Creative> = cached.iter().map(|c| (c.id, c)).collect();

    for payload in payloads.iter().take(limit) {
      self.check_stop()?;

      let mut creative = match Creative::from_platform(payload, &self.rewriter, &*self.preview) {
        Ok(c) => c,
        Err(e) => {
          let reason = format!("{e:#}");
          tracing::warn!(error = %reason, "creative payload skipped");
          continue;
        }
      };

      if creative.snippet.is_none() {
        let stored = cache.get(&creative.id).filter(|c| {
          c.snippet.is_some()
            && c.creative_type == creative.creative_type
            && !c.creative_type.uses_preview_page()
        });
        if let Some(stored) = stored {
          tracing::debug!(creative_id = creative.id, "using cached snippet");
          creative = stored.renew(&self.rewriter);
        }
      }

      self.payloads.insert(creative.id, payload.clone());
      self.creatives.push(creative);
    }

    tracing::info!(
      creatives = self.creatives.len(),
      modified = self.creatives.iter().filter(|c| c.modified).count(),
      "creatives loaded"
    );
    Ok(())
  }

  fn prepare_snippets(&mut self) -> anyhow::Result<()> {
    for creative in &mut self.creatives {
      if self.stop.load(Ordering::SeqCst) {
        return Err(ScanError::Interrupted.into());
      }
      creative.prepare_scan_snippets(&self.rewriter, &*self.preview, &self.cfg.scan.default_ad_host);
    }
    Ok(())
  }

  /// Replaces the records of `protocol` with those of a fresh browser run.
  fn browse(&mut self, protocol: Protocol) -> anyhow::Result<()> {
    self.records.retain(|r| r.protocol != protocol);
    self.workspace.reset()?;

    let farm = BrowserFarm::new(
      &self.cfg,
      protocol,
      self.workspace.root().to_path_buf(),
      Arc::clone(&self.probe),
      Arc::clone(&self.stop),
    )?;
    let records = farm.run(&self.creatives)?;
    self.records.extend(records);
    Ok(())
  }

  fn check_compliance(&mut self) {
    let aggregator = ComplianceAggregator::new(&self.cfg.compliance);
    let verdicts = aggregator.aggregate(&self.records);
    aggregator.apply(&verdicts, &mut self.creatives);
  }

  fn select_uploads(&mut self) {
    let uploads = compliance::select_upload_candidates(&mut self.creatives, &self.payloads, &self.rewriter);
    tracing::info!(uploads = uploads.len(), "upload candidates selected");
    self.uploads.extend(uploads);
  }

  fn remove_temp_files(&self) -> anyhow::Result<()> {
    tracing::debug!(
      workspace = %self.workspace.root().display(),
      network_logs = self.workspace.log_files().len(),
      "removing workspace"
    );
    self.workspace.delete()
  }

  fn check_stop(&self) -> anyhow::Result<()> {
    if self.stop.load(Ordering::SeqCst) {
      return Err(ScanError::Interrupted.into());
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use adscan_core::classify::ProbeOutcome;
  use adscan_core::creative::CreativeType;
  use adscan_core::types::IssueKind;
  use serde_json::json;
  use std::fs;
  use std::path::Path;
  use std::sync::atomic::AtomicBool;

  struct OkProbe;

  impl HttpsProbe for OkProbe {
    fn probe(&self, _https_url: &str) -> ProbeOutcome {
      ProbeOutcome::Status(200)
    }
  }

  struct NoPreview;

  impl PreviewSource for NoPreview {
    fn fetch(&self, url: &str) -> anyhow::Result<String> {
      anyhow::bail!("preview download disabled in tests: {url}")
    }
  }

  /// Logs the visited URL and a sibling `pixel.png`.
  const FAKE_BROWSER: &str = r#"
url=""
log=""
while [ $# -gt 0 ]; do
  case "$1" in
    --url) url="$2"; shift 2 ;;
    --log-file) log="$2"; shift 2 ;;
    *) shift ;;
  esac
done
base="${url%/*}"
printf '{"1":{"request":{"url":"%s"},"response":{"status":200},"error":null},"2":{"request":{"url":"%s/pixel.png"},"response":{"status":200},"error":null}}' "$url" "$base" > "$log"
"#;

  fn test_config(dir: &Path) -> Config {
    let script = dir.join("fake-browser.sh");
    fs::write(&script, FAKE_BROWSER).unwrap();

    let mut cfg = Config::default();
    cfg.directories.tmp_dir = dir.join("tmp");
    cfg.browser.count = 2;
    cfg.browser.wrapper = vec!["/bin/sh".to_string(), script.to_string_lossy().into_owned()];
    cfg.browser.visit_timeout_seconds = 20;
    cfg.display.enabled = false;
    cfg.server.count = 1;
    cfg
  }

  fn pipeline(cfg: Config, stop: bool) -> Pipeline {
    Pipeline::with_parts(
      cfg,
      Arc::new(AtomicBool::new(stop)),
      Arc::new(OkProbe),
      Box::new(NoPreview),
    )
    .unwrap()
  }

  #[test]
  fn load_skips_bad_payloads_and_honors_scan_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.scan.max_scan = 2;
    let mut p = pipeline(cfg, false);

    let payloads = vec![
      json!({"id": 1, "type": "CustomCreative", "htmlSnippet": "<b>no preview url</b>"}),
      json!({"id": 2, "type": "ImageCreative", "previewUrl": "https://p/2", "primaryImageAsset": {"assetUrl": "http://cdn.example/a.png"}}),
      json!({"id": 3, "type": "CustomCreative", "previewUrl": "https://p/3", "htmlSnippet": "<b>beyond limit</b>"}),
    ];
    p.load(&payloads, &[]).unwrap();

    assert_eq!(p.creatives.len(), 1);
    assert_eq!(p.creatives[0].id, 2);
    assert_eq!(p.creatives[0].modified_snippet.as_deref(), Some("https://cdn.example/a.png"));
    assert!(p.payloads.contains_key(&2));
  }

  #[test]
  fn payload_without_snippet_uses_cached_creative() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = pipeline(test_config(dir.path()), false);

    let mut stored = Creative::new(5, CreativeType::Custom, "https://p/5");
    stored.snippet = Some("<img src=\"http://cdn.example/x.gif\">".to_string());
    stored.compliance = Some(false);

    let payloads = vec![json!({"id": 5, "type": "CustomCreative", "previewUrl": "https://p/5"})];
    p.load(&payloads, &[stored]).unwrap();

    let c = &p.creatives[0];
    assert_eq!(c.modified_snippet.as_deref(), Some("<img src=\"//cdn.example/x.gif\">"));
    assert!(c.modified);
    assert_eq!(c.compliance, None);
  }

  #[test]
  fn interrupt_before_loading_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = pipeline(test_config(dir.path()), true);
    let payloads = vec![json!({"id": 1, "type": "CustomCreative", "previewUrl": "https://p/1", "htmlSnippet": "<b>x</b>"})];

    let err = p.load(&payloads, &[]).unwrap_err();
    assert!(matches!(err.downcast_ref::<ScanError>(), Some(ScanError::Interrupted)));
  }

  #[cfg(unix)]
  #[test]
  fn http_only_run_produces_verdicts_and_uploads() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    // no certificate available for the https run
    cfg.steps.browse_https = false;
    let tmp = cfg.directories.tmp_dir.clone();
    let p = pipeline(cfg, false);

    let payloads = vec![
      json!({"id": 7, "type": "CustomCreative", "previewUrl": "https://p/7", "htmlSnippet": "<img src=\"pixel.png\">"}),
      json!({"id": 8, "type": "ImageCreative", "previewUrl": "https://p/8", "primaryImageAsset": {"assetUrl": "http://cdn.example/a.png"}}),
    ];
    let report = p.run("test-run", &payloads, &[]).unwrap();

    assert_eq!(report.creatives.len(), 2);
    assert!(report.records.iter().all(|r| r.protocol == Protocol::Http));

    let local: Vec<_> = report.records.iter().filter(|r| r.creative_id == 7).collect();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].kind, IssueKind::NoExternalRequest);

    let external: Vec<_> = report.records.iter().filter(|r| r.creative_id == 8).collect();
    assert_eq!(external.len(), 2);
    assert!(external.iter().all(|r| r.kind == IssueKind::HttpsAvailableButUnused));

    // Without https records nothing disqualifies, but nothing matches either.
    assert!(report.creatives.iter().all(|c| c.compliance == Some(true)));
    assert!(report.creatives.iter().all(|c| c.request_match == Some(false)));
    assert!(report.uploads.is_empty());
    assert!(!tmp.exists());
  }
}
