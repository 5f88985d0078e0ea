use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One captured request from a browser network log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkLogEntry {
  pub seq: u64,
  pub url: Option<String>,
  pub status: Option<u16>,
  pub error_code: Option<i64>,
}

/// Parses a log document: an object keyed by request sequence numbers.
/// Non-numeric keys are skipped and `null` is an empty log.
pub fn parse(raw: &str) -> anyhow::Result<Vec<NetworkLogEntry>> {
  let doc: Option<BTreeMap<String, Value>> = serde_json::from_str(raw)?;
  let Some(doc) = doc else {
    return Ok(Vec::new());
  };

  let mut entries = Vec::with_capacity(doc.len());
  for (key, value) in doc {
    let Ok(seq) = key.trim().parse::<u64>() else {
      continue;
    };

    if !value.is_object() {
      tracing::debug!(seq, "skipping malformed network log entry");
      continue;
    }

    // Fields are read independently; a bad status must not hide an error code.
    entries.push(NetworkLogEntry {
      seq,
      url: value
        .pointer("/request/url")
        .and_then(Value::as_str)
        .map(str::to_string),
      status: value
        .pointer("/response/status")
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok()),
      error_code: value.pointer("/error/errorCode").and_then(Value::as_i64),
    });
  }

  entries.sort_by_key(|e| e.seq);
  Ok(entries)
}

/// Missing or unreadable logs count as "no data".
pub fn read_log(path: &Path) -> Vec<NetworkLogEntry> {
  let raw = match fs::read_to_string(path) {
    Ok(r) => r,
    Err(e) => {
      tracing::debug!(path = %path.display(), error = %e, "network log not readable");
      return Vec::new();
    }
  };

  match parse(&raw) {
    Ok(entries) => entries,
    Err(e) => {
      tracing::warn!(path = %path.display(), error = %e, "network log is not valid JSON; treating as empty");
      Vec::new()
    }
  }
}
