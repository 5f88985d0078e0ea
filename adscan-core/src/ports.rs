use crate::error::ScanError;
use std::net::TcpListener;

const TRIAL_LIMIT: usize = 10;

/// Asks the OS for `count` distinct free TCP ports.
///
/// The ports are released before returning, so another process may still
/// grab one before a server binds it.
pub fn find_open_ports(count: usize) -> Result<Vec<u16>, ScanError> {
  let mut ports: Vec<u16> = Vec::with_capacity(count);

  for _ in 0..count {
    for _ in 0..=TRIAL_LIMIT {
      let Some(port) = ephemeral_port() else {
        continue;
      };
      if !ports.contains(&port) {
        ports.push(port);
        break;
      }
    }
  }

  if ports.len() < count {
    return Err(ScanError::NoFreePorts {
      wanted: count,
      found: ports.len(),
    });
  }

  tracing::debug!(?ports, "allocated server ports");
  Ok(ports)
}

fn ephemeral_port() -> Option<u16> {
  let listener = TcpListener::bind(("0.0.0.0", 0)).ok()?;
  listener.local_addr().ok().map(|a| a.port())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn ports_are_distinct_and_nonzero() {
    let ports = find_open_ports(5).unwrap();
    assert_eq!(ports.len(), 5);
    assert!(ports.iter().all(|p| *p != 0));
    assert_eq!(ports.iter().collect::<HashSet<_>>().len(), 5);
  }

  #[test]
  fn zero_ports_is_empty() {
    assert!(find_open_ports(0).unwrap().is_empty());
  }
}
