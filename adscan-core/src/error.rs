use std::path::PathBuf;

/// Fatal conditions a caller may want to tell apart from generic failures.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
  #[error("certificate file not found: {}", .0.display())]
  MissingCertificate(PathBuf),

  #[error("private key file not found: {}", .0.display())]
  MissingPrivateKey(PathBuf),

  #[error("could not allocate {wanted} distinct free ports (found {found})")]
  NoFreePorts { wanted: usize, found: usize },

  #[error("scan interrupted")]
  Interrupted,
}
