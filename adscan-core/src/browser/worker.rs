use super::process::ScopedProcess;
use super::FarmContext;
use crate::classify::NetworkLogClassifier;
use crate::creative::Creative;
use crate::netlog;
use crate::paths;
use crate::rewrite::is_url_value;
use crate::types::{CreativeId, IssueRecord, Protocol};
use anyhow::Context;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

/// A creative bound to the one URL a browser visits for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget {
  pub creative_id: CreativeId,
  /// None when the creative has nothing to render.
  pub url: Option<String>,
  pub hosted_locally: bool,
}

pub struct BrowserWorker {
  index: usize,
  display_id: Option<u32>,
  port: u16,
  ctx: Arc<FarmContext>,
}

impl BrowserWorker {
  pub fn new(index: usize, display_id: Option<u32>, port: u16, ctx: Arc<FarmContext>) -> Self {
    Self {
      index,
      display_id,
      port,
      ctx,
    }
  }

  /// Resolves each creative's effective URL, publishing HTML snippets as
  /// pages in this worker's workspace directory.
  pub fn prepare_targets(&self, creatives: &[Creative]) -> anyhow::Result<Vec<ScanTarget>> {
    let dir = paths::worker_dir(&self.ctx.workspace, self.index);
    fs::create_dir_all(&dir).with_context(|| format!("create worker dir {}", dir.display()))?;

    let mut targets = Vec::with_capacity(creatives.len());
    for creative in creatives {
      let snippet = match self.ctx.protocol {
        Protocol::Https => creative.modified_scan_snippet.as_deref(),
        Protocol::Http => creative.scan_snippet.as_deref(),
      };

      let target = match snippet.filter(|s| !s.trim().is_empty()) {
        None => ScanTarget {
          creative_id: creative.id,
          url: None,
          hosted_locally: false,
        },
        Some(s) if is_url_value(s) => ScanTarget {
          creative_id: creative.id,
          url: Some(s.trim().to_string()),
          hosted_locally: false,
        },
        Some(html) => {
          let page = paths::hosted_page_path(&self.ctx.workspace, self.index, creative.id);
          fs::write(&page, html).with_context(|| format!("write hosted page {}", page.display()))?;
          ScanTarget {
            creative_id: creative.id,
            url: Some(self.hosted_url(creative.id)),
            hosted_locally: true,
          }
        }
      };
      targets.push(target);
    }
    Ok(targets)
  }

  pub fn hosted_url(&self, creative_id: CreativeId) -> String {
    format!(
      "{}://{}:{}/{}",
      self.ctx.protocol,
      self.ctx.hostname,
      self.port,
      paths::hosted_page_rel(self.index, creative_id)
    )
  }

  /// Visits targets in order, stopping between visits when asked to.
  pub fn run(self, targets: Vec<ScanTarget>, records: Sender<IssueRecord>) {
    tracing::info!(
      worker = self.index,
      display = ?self.display_id,
      port = self.port,
      creatives = targets.len(),
      "browser worker started"
    );

    let mut visited = 0usize;
    for target in &targets {
      if self.ctx.should_stop() {
        tracing::info!(worker = self.index, visited, "browser worker stopping early");
        break;
      }

      for record in self.visit(target) {
        if records.send(record).is_err() {
          return;
        }
      }
      visited += 1;
    }

    tracing::info!(worker = self.index, visited, "browser worker finished");
  }

  fn visit(&self, target: &ScanTarget) -> Vec<IssueRecord> {
    let id = target.creative_id;
    let protocol = self.ctx.protocol;
    let Some(url) = target.url.as_deref() else {
      return vec![IssueRecord::no_external(id, protocol)];
    };

    let log_file = paths::network_log_path(&self.ctx.workspace, self.index, id);
    let _ = fs::remove_file(&log_file);

    let argv = self.browser_argv(url, target.hosted_locally, &log_file);
    tracing::debug!(worker = self.index, creative_id = id, ?argv, "launching browser");

    if let Err(e) = self.launch(&argv) {
      tracing::warn!(worker = self.index, creative_id = id, error = %e, "browser visit failed");
      return vec![IssueRecord::no_external(id, protocol)];
    }

    let entries = netlog::read_log(&log_file);
    let classifier = NetworkLogClassifier::new(&*self.ctx.probe, &self.ctx.hostname, protocol);
    let records = classifier.classify(id, &entries);
    tracing::info!(
      worker = self.index,
      creative_id = id,
      %protocol,
      requests = entries.len(),
      records = records.len(),
      "creative classified"
    );
    records
  }

  fn launch(&self, argv: &[String]) -> anyhow::Result<()> {
    let (program, args) = argv
      .split_first()
      .ok_or_else(|| anyhow::anyhow!("empty browser command line"))?;

    let mut command = Command::new(program);
    command.args(args);
    if let Some(display) = self.display_id {
      command.env("DISPLAY", format!(":{display}"));
    }

    let timeout = match self.ctx.browser.visit_timeout_seconds {
      0 => None,
      s => Some(Duration::from_secs(s)),
    };
    let process = ScopedProcess::spawn(command)?;
    tracing::debug!(worker = self.index, pid = process.id(), "browser launched");
    let outcome = process.wait(timeout)?;

    if outcome.timed_out() {
      tracing::warn!(worker = self.index, "browser visit timed out; process killed");
    } else if !outcome.stderr.trim().is_empty() {
      tracing::debug!(worker = self.index, stderr = %outcome.stderr.trim(), "browser stderr");
    }
    Ok(())
  }

  pub fn browser_argv(&self, url: &str, hosted_locally: bool, log_file: &Path) -> Vec<String> {
    let b = &self.ctx.browser;
    let mut argv: Vec<String> = b.wrapper.clone();
    argv.push(b.executable.clone());
    argv.extend(
      [
        "--web-security",
        "false",
        "--load-plugins",
        "true",
        "--ignore-ssl-errors",
        "true",
        "--ssl-protocol",
        "any",
      ]
      .map(String::from),
    );
    argv.push(b.script.to_string_lossy().into_owned());
    argv.extend(["--use-cookie", "true", "--enable-javascript", "true"].map(String::from));
    argv.push("--hosted-locally".to_string());
    argv.push(hosted_locally.to_string());
    argv.push("--url".to_string());
    argv.push(url.to_string());
    argv.push("--log-file".to_string());
    argv.push(log_file.to_string_lossy().into_owned());
    argv.push("--debug".to_string());
    argv.push(b.debug.to_string());
    if let Some(dir) = &b.cookie_dir {
      argv.push("--cookie-dir".to_string());
      argv.push(dir.to_string_lossy().into_owned());
    }
    argv
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::browser::tests::test_context;
  use crate::creative::CreativeType;
  use std::path::PathBuf;

  #[test]
  fn targets_split_urls_pages_and_empty_creatives() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(dir.path(), Protocol::Https);
    let worker = BrowserWorker::new(1, Some(102), 8443, ctx);

    let mut url = Creative::new(1, CreativeType::Image, "p");
    url.modified_scan_snippet = Some("https://cdn.example/a.png".to_string());
    let mut html = Creative::new(2, CreativeType::Custom, "p");
    html.modified_scan_snippet = Some("<img src=\"pixel.png\">".to_string());
    html.scan_snippet = Some("ignored on https".to_string());
    let empty = Creative::new(3, CreativeType::Custom, "p");

    let targets = worker.prepare_targets(&[url, html, empty]).unwrap();
    assert_eq!(targets[0].url.as_deref(), Some("https://cdn.example/a.png"));
    assert!(!targets[0].hosted_locally);
    assert_eq!(targets[1].url.as_deref(), Some("https://localhost:8443/1/2.html"));
    assert!(targets[1].hosted_locally);
    assert_eq!(targets[2].url, None);

    let page = fs::read_to_string(dir.path().join("1/2.html")).unwrap();
    assert_eq!(page, "<img src=\"pixel.png\">");
  }

  #[test]
  fn argv_follows_browser_conventions() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(dir.path(), Protocol::Http);
    let worker = BrowserWorker::new(0, None, 8080, ctx);

    let argv = worker.browser_argv("http://localhost:8080/0/5.html", true, &PathBuf::from("/w/0/5.json"));
    assert_eq!(argv[0], "/bin/sh");
    let joined = argv.join(" ");
    assert!(joined.contains("--web-security false --load-plugins true --ignore-ssl-errors true --ssl-protocol any"));
    assert!(joined.contains("--use-cookie true --enable-javascript true --hosted-locally true"));
    assert!(joined.ends_with("--url http://localhost:8080/0/5.html --log-file /w/0/5.json --debug false"));
  }

  #[test]
  fn creative_without_content_is_no_external_request() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(dir.path(), Protocol::Http);
    let worker = BrowserWorker::new(0, None, 8080, ctx);

    let records = worker.visit(&ScanTarget {
      creative_id: 77,
      url: None,
      hosted_locally: false,
    });
    assert_eq!(records, vec![IssueRecord::no_external(77, Protocol::Http)]);
  }
}
