use crate::config::ComplianceConfig;
use crate::creative::Creative;
use crate::rewrite::SnippetRewriter;
use crate::types::{CreativeId, IssueKind, IssueRecord, Protocol};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdicts {
  pub compliant: BTreeSet<CreativeId>,
  pub non_compliant: BTreeSet<CreativeId>,
  pub matched: BTreeSet<CreativeId>,
  pub unmatched: BTreeSet<CreativeId>,
}

pub struct ComplianceAggregator {
  private_network_is_issue: bool,
}

impl ComplianceAggregator {
  pub fn new(cfg: &ComplianceConfig) -> Self {
    Self {
      private_network_is_issue: cfg.private_network_is_issue,
    }
  }

  pub fn is_disqualifying(&self, kind: IssueKind) -> bool {
    match kind {
      IssueKind::NoIssue | IssueKind::NoExternalRequest => false,
      IssueKind::PrivateNetworkBlocked => self.private_network_is_issue,
      _ => true,
    }
  }

  /// Compliance looks at HTTPS records only; request match compares the
  /// number of distinct URLs requested under each protocol.
  pub fn aggregate(&self, records: &[IssueRecord]) -> Verdicts {
    let all: BTreeSet<CreativeId> = records.iter().map(|r| r.creative_id).collect();

    let non_compliant: BTreeSet<CreativeId> = records
      .iter()
      .filter(|r| r.protocol == Protocol::Https && self.is_disqualifying(r.kind))
      .map(|r| r.creative_id)
      .collect();
    let compliant = all.difference(&non_compliant).copied().collect();

    let mut urls: HashMap<(CreativeId, Protocol), HashSet<&str>> = HashMap::new();
    for r in records {
      let set = urls.entry((r.creative_id, r.protocol)).or_default();
      if let Some(url) = r.url.as_deref() {
        set.insert(url);
      }
    }
    let matched: BTreeSet<CreativeId> = all
      .iter()
      .copied()
      .filter(|id| {
        match (urls.get(&(*id, Protocol::Https)), urls.get(&(*id, Protocol::Http))) {
          (Some(https), Some(http)) => https.len() == http.len(),
          _ => false,
        }
      })
      .collect();
    let unmatched = all.difference(&matched).copied().collect();

    tracing::info!(
      creatives = all.len(),
      compliant = all.len() - non_compliant.len(),
      non_compliant = non_compliant.len(),
      matched = matched.len(),
      "compliance aggregated"
    );

    Verdicts {
      compliant,
      non_compliant,
      matched,
      unmatched,
    }
  }

  /// Creatives without any record keep their previous verdicts.
  pub fn apply(&self, verdicts: &Verdicts, creatives: &mut [Creative]) {
    for c in creatives.iter_mut() {
      if verdicts.compliant.contains(&c.id) {
        c.compliance = Some(true);
      } else if verdicts.non_compliant.contains(&c.id) {
        c.compliance = Some(false);
      }

      if verdicts.matched.contains(&c.id) {
        c.request_match = Some(true);
      } else if verdicts.unmatched.contains(&c.id) {
        c.request_match = Some(false);
      }
    }
  }
}

/// Builds upload payloads for creatives safe to push back to the platform
/// and marks them uploaded.
pub fn select_upload_candidates(
  creatives: &mut [Creative],
  payloads: &HashMap<CreativeId, Value>,
  rewriter: &SnippetRewriter,
) -> Vec<Value> {
  let mut out = Vec::new();
  for c in creatives.iter_mut().filter(|c| c.is_upload_candidate() && !c.uploaded) {
    let Some(payload) = payloads.get(&c.id) else {
      tracing::warn!(creative_id = c.id, "no platform payload for upload candidate");
      continue;
    };
    match c.to_platform(payload, rewriter) {
      Some(updated) => {
        c.uploaded = true;
        out.push(updated);
      }
      None => tracing::debug!(creative_id = c.id, creative_type = %c.creative_type, "creative type is not writable"),
    }
  }
  out
}
