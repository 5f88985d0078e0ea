use crate::config::VerifyConfig;
use crate::net;
use crate::netlog::NetworkLogEntry;
use crate::types::{CreativeId, IssueKind, IssueRecord, Protocol};
use reqwest::header::USER_AGENT;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::time::Duration;

/// Error code the browser script reports for requests it blocked because
/// they resolved into a private network.
pub const PRIVATE_NETWORK_ERROR_CODE: i64 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
  Status(u16),
  TlsFailure,
  ConnectFailure,
}

pub trait HttpsProbe: Send + Sync {
  /// GETs `https_url` with certificate verification, following redirects.
  fn probe(&self, https_url: &str) -> ProbeOutcome;
}

pub struct ReqwestProbe {
  client: reqwest::blocking::Client,
}

impl ReqwestProbe {
  pub fn new(cfg: &VerifyConfig) -> anyhow::Result<Self> {
    Ok(Self {
      client: net::probe_client(Duration::from_secs(cfg.timeout_seconds), cfg.max_redirects)?,
    })
  }
}

impl HttpsProbe for ReqwestProbe {
  fn probe(&self, https_url: &str) -> ProbeOutcome {
    match self
      .client
      .get(https_url)
      .header(USER_AGENT, net::user_agent())
      .send()
    {
      Ok(response) => ProbeOutcome::Status(response.status().as_u16()),
      Err(e) if is_tls_error(&e) => {
        tracing::debug!(url = https_url, error = %e, "https probe failed TLS verification");
        ProbeOutcome::TlsFailure
      }
      Err(e) => {
        tracing::debug!(url = https_url, error = %e, "https probe failed to connect");
        ProbeOutcome::ConnectFailure
      }
    }
  }
}

fn is_tls_error(err: &reqwest::Error) -> bool {
  let mut source: Option<&(dyn StdError + 'static)> = Some(err);
  while let Some(e) = source {
    if e.is::<rustls::Error>() {
      return true;
    }
    if let Some(io) = e.downcast_ref::<std::io::Error>() {
      if io.get_ref().is_some_and(|inner| inner.is::<rustls::Error>()) {
        return true;
      }
    }

    // reqwest's own message embeds the URL, so only inner causes are matched.
    if !e.is::<reqwest::Error>() {
      let msg = e.to_string().to_ascii_lowercase();
      if msg.contains("certificate") || msg.contains("tls") || msg.contains("handshake") {
        return true;
      }
    }
    source = e.source();
  }
  false
}

/// Turns one creative's network log into issue records.
pub struct NetworkLogClassifier<'a> {
  probe: &'a dyn HttpsProbe,
  own_host: String,
  protocol: Protocol,
}

impl<'a> NetworkLogClassifier<'a> {
  pub fn new(probe: &'a dyn HttpsProbe, own_host: &str, protocol: Protocol) -> Self {
    Self {
      probe,
      own_host: own_host.to_ascii_lowercase(),
      protocol,
    }
  }

  pub fn classify(&self, creative_id: CreativeId, entries: &[NetworkLogEntry]) -> Vec<IssueRecord> {
    let mut records = Vec::new();
    let mut probed: HashMap<&str, IssueKind> = HashMap::new();
    let mut external = false;

    for entry in entries {
      if entry.error_code == Some(PRIVATE_NETWORK_ERROR_CODE) {
        records.push(IssueRecord::new(
          creative_id,
          self.protocol,
          entry.url.clone(),
          IssueKind::PrivateNetworkBlocked,
        ));
        continue;
      }

      let Some(url) = entry.url.as_deref() else {
        continue;
      };
      if self.is_own_host(url) || !has_http_prefix(url) {
        continue;
      }

      external = true;
      let kind = *probed.entry(url).or_insert_with(|| self.check_https(url));
      if kind != IssueKind::NoIssue {
        tracing::debug!(creative_id, url, issue = ?kind, code = kind.code(), "request issue");
      }
      records.push(IssueRecord::new(creative_id, self.protocol, Some(url.to_string()), kind));
    }

    if !external {
      records.push(IssueRecord::no_external(creative_id, self.protocol));
    }
    records
  }

  /// Whether `url` would work if requested over HTTPS.
  pub fn check_https(&self, url: &str) -> IssueKind {
    let baseline = if has_https_prefix(url) {
      IssueKind::NoIssue
    } else {
      IssueKind::HttpsAvailableButUnused
    };

    match self.probe.probe(&net::to_https(url)) {
      ProbeOutcome::TlsFailure => IssueKind::InvalidCert,
      ProbeOutcome::ConnectFailure => IssueKind::NoSslServer,
      ProbeOutcome::Status(403) => IssueKind::InvalidCert,
      ProbeOutcome::Status(s) if s >= 500 => IssueKind::ServerError,
      ProbeOutcome::Status(s) if s >= 400 => IssueKind::ClientError,
      ProbeOutcome::Status(_) => baseline,
    }
  }

  fn is_own_host(&self, url: &str) -> bool {
    url::Url::parse(url)
      .ok()
      .and_then(|u| u.host_str().map(|h| h.eq_ignore_ascii_case(&self.own_host)))
      .unwrap_or(false)
  }
}

fn has_http_prefix(url: &str) -> bool {
  url.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("http"))
}

fn has_https_prefix(url: &str) -> bool {
  url.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("https"))
}
