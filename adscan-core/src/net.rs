use anyhow::Context;
use reqwest::blocking::{Client, Response};
use reqwest::header::USER_AGENT;
use reqwest::redirect::Policy;
use std::io::Read;
use std::time::Duration;

const MAX_PREVIEW_BYTES: usize = 4 * 1024 * 1024;
const PREVIEW_REDIRECT_LIMIT: usize = 10;

pub fn user_agent() -> String {
  format!("adscan/{}", env!("CARGO_PKG_VERSION"))
}

/// Client for preview pages: the ad server's preview hosts are not always
/// served with a valid chain, so certificate errors are accepted here.
pub fn preview_client(timeout: Duration) -> anyhow::Result<Client> {
  Client::builder()
    .timeout(timeout)
    .redirect(Policy::limited(PREVIEW_REDIRECT_LIMIT))
    .danger_accept_invalid_certs(true)
    .build()
    .context("build preview HTTP client")
}

/// Client for HTTPS availability probes; verification stays on.
pub fn probe_client(timeout: Duration, max_redirects: usize) -> anyhow::Result<Client> {
  Client::builder()
    .timeout(timeout)
    .redirect(Policy::limited(max_redirects))
    .build()
    .context("build probe HTTP client")
}

/// Downloads a preview page over HTTPS, upgrading an `http:` preview URL first.
pub fn download_html(client: &Client, url: &str) -> anyhow::Result<String> {
  let url = to_https(url);
  let response = client
    .get(&url)
    .header(USER_AGENT, user_agent())
    .send()
    .with_context(|| format!("GET {url}"))?;

  let status = response.status().as_u16();
  if !(200..300).contains(&status) {
    anyhow::bail!("unexpected HTTP status {status} for {url}");
  }

  let body = read_response_with_limit(response, MAX_PREVIEW_BYTES)?;
  Ok(String::from_utf8_lossy(&body).into_owned())
}

/// `http:` prefix (any case) swapped for `https:`; anything else unchanged.
pub fn to_https(url: &str) -> String {
  match url.get(..5) {
    Some(scheme) if scheme.eq_ignore_ascii_case("http:") => format!("https:{}", &url[5..]),
    _ => url.to_string(),
  }
}

fn read_response_with_limit(response: Response, max_bytes: usize) -> anyhow::Result<Vec<u8>> {
  let mut out = Vec::new();
  let mut limited = response.take((max_bytes.saturating_add(1)) as u64);
  limited
    .read_to_end(&mut out)
    .context("read response body")?;

  if out.len() > max_bytes {
    anyhow::bail!("response exceeds max size {} bytes", max_bytes);
  }

  Ok(out)
}
