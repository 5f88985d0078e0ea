//! Static page server for creatives rendered from the local workspace.

use crate::config::ServerConfig as ServerSection;
use crate::error::ScanError;
use anyhow::Context;
use axum::Router;
use axum_server::tls_rustls::{self, RustlsConfig};
use axum_server::Handle;
use std::fs::File;
use std::io::BufReader;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Fails fast on a configured certificate or key that does not exist.
pub fn check_tls_files(cfg: &ServerSection) -> Result<(), ScanError> {
  if let Some(cert) = &cfg.certificate_file {
    if !cert.exists() {
      return Err(ScanError::MissingCertificate(cert.clone()));
    }
  }
  if let Some(key) = &cfg.privatekey_file {
    if !key.exists() {
      return Err(ScanError::MissingPrivateKey(key.clone()));
    }
  }
  Ok(())
}

/// Loads the PEM certificate chain and private key for the HTTPS run.
pub fn load_tls_config(cfg: &ServerSection) -> anyhow::Result<Arc<rustls::ServerConfig>> {
  check_tls_files(cfg)?;
  let cert_path = cfg
    .certificate_file
    .as_deref()
    .ok_or_else(|| ScanError::MissingCertificate(PathBuf::from("<server.certificate_file unset>")))?;
  let key_path = cfg
    .privatekey_file
    .as_deref()
    .ok_or_else(|| ScanError::MissingPrivateKey(PathBuf::from("<server.privatekey_file unset>")))?;

  let mut cert_reader = BufReader::new(
    File::open(cert_path).with_context(|| format!("open certificate {}", cert_path.display()))?,
  );
  let certs = rustls_pemfile::certs(&mut cert_reader)
    .collect::<Result<Vec<_>, _>>()
    .with_context(|| format!("parse certificate {}", cert_path.display()))?;
  if certs.is_empty() {
    anyhow::bail!("no certificate found in {}", cert_path.display());
  }

  let mut key_reader = BufReader::new(
    File::open(key_path).with_context(|| format!("open private key {}", key_path.display()))?,
  );
  let key = rustls_pemfile::private_key(&mut key_reader)
    .with_context(|| format!("parse private key {}", key_path.display()))?
    .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path.display()))?;

  let config = rustls::ServerConfig::builder_with_provider(Arc::new(
    rustls::crypto::ring::default_provider(),
  ))
  .with_safe_default_protocol_versions()
  .context("select TLS protocol versions")?
  .with_no_client_auth()
  .with_single_cert(certs, key)
  .context("build TLS server config")?;

  Ok(Arc::new(config))
}

/// Router serving the workspace tree; `ServeDir` answers GET/HEAD, rejects
/// other methods with 405 and never resolves outside `root`.
pub fn page_router(root: &Path) -> Router {
  Router::new()
    .fallback_service(ServeDir::new(root))
    .layer(TraceLayer::new_for_http())
}

/// One server thread bound to one port, serving files under `root`.
///
/// Each host owns a current-thread runtime; the farm starts a handful of
/// them and the browsers are the only clients.
pub struct TestPageHost {
  port: u16,
  handle: Handle,
  thread: Option<JoinHandle<()>>,
}

impl TestPageHost {
  pub fn start(
    port: u16,
    root: PathBuf,
    tls: Option<Arc<rustls::ServerConfig>>,
  ) -> anyhow::Result<Self> {
    let listener =
      TcpListener::bind(("0.0.0.0", port)).with_context(|| format!("bind test page server on port {port}"))?;
    listener.set_nonblocking(true)?;
    let port = listener.local_addr()?.port();

    let runtime = tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .context("build test page server runtime")?;

    let app = page_router(&root);
    let handle = Handle::new();
    let server_handle = handle.clone();
    let secure = tls.is_some();
    let span = tracing::Span::current();

    let thread = thread::Builder::new()
      .name(format!("page-host-{port}"))
      .spawn(move || {
        let _run = span.entered();
        let served = runtime.block_on(async move {
          match tls {
            Some(config) => {
              tls_rustls::from_tcp_rustls(listener, RustlsConfig::from_config(config))
                .handle(server_handle)
                .serve(app.into_make_service())
                .await
            }
            None => {
              axum_server::from_tcp(listener)
                .handle(server_handle)
                .serve(app.into_make_service())
                .await
            }
          }
        });
        if let Err(e) = served {
          tracing::warn!(port, error = %e, "test page server exited with error");
        }
      })
      .context("spawn test page server thread")?;

    tracing::info!(port, tls = secure, root = %root.display(), "test page server started");
    Ok(Self {
      port,
      handle,
      thread: Some(thread),
    })
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  pub fn shutdown(&mut self) {
    let Some(thread) = self.thread.take() else {
      return;
    };
    self.handle.shutdown();
    if thread.join().is_err() {
      tracing::warn!(port = self.port, "test page server thread panicked");
    }
    tracing::debug!(port = self.port, "test page server stopped");
  }
}

impl Drop for TestPageHost {
  fn drop(&mut self) {
    self.shutdown();
  }
}
