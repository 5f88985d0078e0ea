use crate::creative::Creative;
use crate::types::{IssueKind, IssueRecord};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
  pub run_id: String,
  pub started_at_unix_ms: u64,
  pub finished_at_unix_ms: u64,
  pub summary: ReportSummary,
  pub creatives: Vec<Creative>,
  pub records: Vec<IssueRecord>,
  /// Modified platform payloads ready for upload.
  pub uploads: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
  pub creatives: usize,
  pub modified: usize,
  pub compliant: usize,
  pub non_compliant: usize,
  pub request_match: usize,
  pub uploaded: usize,
  pub issues: BTreeMap<IssueKind, usize>,
}

impl ReportSummary {
  pub fn from_parts(creatives: &[Creative], records: &[IssueRecord]) -> Self {
    let mut issues = BTreeMap::new();
    for r in records {
      *issues.entry(r.kind).or_insert(0) += 1;
    }

    Self {
      creatives: creatives.len(),
      modified: creatives.iter().filter(|c| c.modified).count(),
      compliant: creatives.iter().filter(|c| c.compliance == Some(true)).count(),
      non_compliant: creatives.iter().filter(|c| c.compliance == Some(false)).count(),
      request_match: creatives.iter().filter(|c| c.request_match == Some(true)).count(),
      uploaded: creatives.iter().filter(|c| c.uploaded).count(),
      issues,
    }
  }
}

pub fn store_report(report: &ScanReport, path: &Path) -> anyhow::Result<()> {
  let raw = serde_json::to_string_pretty(report)?;
  write_atomic(path, &raw).with_context(|| format!("write report {}", path.display()))?;
  tracing::info!(run_id = %report.run_id, path = %path.display(), "scan report stored");
  Ok(())
}

pub fn load_report(path: &Path) -> anyhow::Result<ScanReport> {
  let raw = fs::read_to_string(path).with_context(|| format!("read report {}", path.display()))?;
  serde_json::from_str(&raw).with_context(|| format!("parse report {}", path.display()))
}

fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
  let parent = path
    .parent()
    .ok_or_else(|| anyhow::anyhow!("file path has no parent: {}", path.display()))?;
  fs::create_dir_all(parent)?;

  let tmp = parent.join(format!(
    ".{}.tmp",
    path.file_name().unwrap_or_default().to_string_lossy()
  ));
  fs::write(&tmp, contents)?;
  fs::rename(&tmp, path)?;
  Ok(())
}
