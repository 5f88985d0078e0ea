use serde::{Deserialize, Serialize};
use std::fmt;

pub type CreativeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
  Https,
  Http,
}

impl Protocol {
  pub fn scheme(self) -> &'static str {
    match self {
      Protocol::Https => "https",
      Protocol::Http => "http",
    }
  }
}

impl fmt::Display for Protocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.scheme())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueKind {
  NoIssue,
  InvalidCert,
  NoSslServer,
  HttpsAvailableButUnused,
  ClientError,
  ServerError,
  PrivateNetworkBlocked,
  NoExternalRequest,
}

impl IssueKind {
  /// Stable numeric id attached to issue log lines.
  pub fn code(self) -> u8 {
    match self {
      IssueKind::NoIssue => 0,
      IssueKind::InvalidCert => 1,
      IssueKind::NoSslServer => 2,
      IssueKind::HttpsAvailableButUnused => 3,
      IssueKind::ClientError => 4,
      IssueKind::ServerError => 5,
      IssueKind::PrivateNetworkBlocked => 8,
      IssueKind::NoExternalRequest => 9,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
  pub creative_id: CreativeId,
  pub protocol: Protocol,
  pub url: Option<String>,
  pub kind: IssueKind,
}

impl IssueRecord {
  pub fn new(creative_id: CreativeId, protocol: Protocol, url: Option<String>, kind: IssueKind) -> Self {
    Self {
      creative_id,
      protocol,
      url,
      kind,
    }
  }

  pub fn no_external(creative_id: CreativeId, protocol: Protocol) -> Self {
    Self::new(creative_id, protocol, None, IssueKind::NoExternalRequest)
  }
}

pub fn now_unix_ms() -> u64 {
  use std::time::{SystemTime, UNIX_EPOCH};
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis() as u64
}
