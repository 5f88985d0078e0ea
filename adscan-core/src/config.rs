use crate::rewrite::DEFAULT_AD_HOST;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct Config {
  pub logging: LoggingConfig,
  pub directories: DirectoriesConfig,
  pub browser: BrowserConfig,
  pub display: DisplayConfig,
  pub server: ServerConfig,
  pub verify: VerifyConfig,
  pub compliance: ComplianceConfig,
  pub scan: ScanConfig,
  pub steps: StepsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
  #[serde(default = "default_log_level")]
  pub level: String,

  #[serde(default = "default_retention_days")]
  pub retention_days: u64,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      retention_days: default_retention_days(),
    }
  }
}

/// Relative entries are resolved against the directory holding the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoriesConfig {
  #[serde(default = "default_tmp_dir")]
  pub tmp_dir: PathBuf,

  #[serde(default = "default_log_dir")]
  pub log_dir: PathBuf,

  #[serde(default = "default_output_dir")]
  pub output_dir: PathBuf,
}

impl Default for DirectoriesConfig {
  fn default() -> Self {
    Self {
      tmp_dir: default_tmp_dir(),
      log_dir: default_log_dir(),
      output_dir: default_output_dir(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
  #[serde(default = "default_browser_count")]
  pub count: usize,

  #[serde(default = "default_browser_executable")]
  pub executable: String,

  #[serde(default = "default_browser_script")]
  pub script: PathBuf,

  /// Argv prefix run in front of the browser, e.g. `["xvfb-run", "--auto-servernum"]`.
  #[serde(default)]
  pub wrapper: Vec<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cookie_dir: Option<PathBuf>,

  /// 0 disables the per-visit timeout.
  #[serde(default = "default_visit_timeout_seconds")]
  pub visit_timeout_seconds: u64,

  #[serde(default)]
  pub debug: bool,
}

impl Default for BrowserConfig {
  fn default() -> Self {
    Self {
      count: default_browser_count(),
      executable: default_browser_executable(),
      script: default_browser_script(),
      wrapper: Vec::new(),
      cookie_dir: None,
      visit_timeout_seconds: default_visit_timeout_seconds(),
      debug: false,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,

  #[serde(default = "default_display_offset")]
  pub offset: u32,

  #[serde(default = "default_display_dimension")]
  pub dimension: String,

  #[serde(default = "default_display_executable")]
  pub executable: String,
}

impl Default for DisplayConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      offset: default_display_offset(),
      dimension: default_display_dimension(),
      executable: default_display_executable(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
  #[serde(default = "default_server_count")]
  pub count: usize,

  #[serde(default = "default_hostname")]
  pub hostname: String,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub certificate_file: Option<PathBuf>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub privatekey_file: Option<PathBuf>,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      count: default_server_count(),
      hostname: default_hostname(),
      certificate_file: None,
      privatekey_file: None,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
  #[serde(default = "default_verify_timeout_seconds")]
  pub timeout_seconds: u64,

  #[serde(default = "default_max_redirects")]
  pub max_redirects: usize,
}

impl Default for VerifyConfig {
  fn default() -> Self {
    Self {
      timeout_seconds: default_verify_timeout_seconds(),
      max_redirects: default_max_redirects(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ComplianceConfig {
  /// Count PRIVATE_NETWORK_BLOCKED against compliance.
  #[serde(default)]
  pub private_network_is_issue: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
  /// 0 = no limit.
  #[serde(default)]
  pub max_scan: usize,

  #[serde(default = "default_ad_host")]
  pub default_ad_host: String,
}

impl Default for ScanConfig {
  fn default() -> Self {
    Self {
      max_scan: 0,
      default_ad_host: default_ad_host(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepsConfig {
  #[serde(default = "default_true")]
  pub browse_https: bool,

  #[serde(default = "default_true")]
  pub browse_http: bool,

  #[serde(default = "default_true")]
  pub check_compliance: bool,

  #[serde(default = "default_true")]
  pub select_uploads: bool,

  #[serde(default = "default_true")]
  pub remove_temp_files: bool,
}

impl Default for StepsConfig {
  fn default() -> Self {
    Self {
      browse_https: true,
      browse_http: true,
      check_compliance: true,
      select_uploads: true,
      remove_temp_files: true,
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_retention_days() -> u64 {
  14
}

fn default_tmp_dir() -> PathBuf {
  PathBuf::from("tmp")
}

fn default_log_dir() -> PathBuf {
  PathBuf::from("logs")
}

fn default_output_dir() -> PathBuf {
  PathBuf::from("reports")
}

fn default_browser_count() -> usize {
  4
}

fn default_browser_executable() -> String {
  "phantomjs".to_string()
}

fn default_browser_script() -> PathBuf {
  PathBuf::from("browser/netlog.js")
}

fn default_visit_timeout_seconds() -> u64 {
  60
}

fn default_display_offset() -> u32 {
  100
}

fn default_display_dimension() -> String {
  "1024x768x24".to_string()
}

fn default_display_executable() -> String {
  "Xvfb".to_string()
}

fn default_server_count() -> usize {
  2
}

fn default_hostname() -> String {
  "localhost".to_string()
}

fn default_verify_timeout_seconds() -> u64 {
  10
}

fn default_max_redirects() -> usize {
  10
}

fn default_ad_host() -> String {
  DEFAULT_AD_HOST.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ConfigFile {
  #[serde(default)]
  pub logging: Option<LoggingConfig>,

  #[serde(default)]
  pub directories: Option<DirectoriesConfig>,

  #[serde(default)]
  pub browser: Option<BrowserConfig>,

  #[serde(default)]
  pub display: Option<DisplayConfig>,

  #[serde(default)]
  pub server: Option<ServerConfig>,

  #[serde(default)]
  pub verify: Option<VerifyConfig>,

  #[serde(default)]
  pub compliance: Option<ComplianceConfig>,

  #[serde(default)]
  pub scan: Option<ScanConfig>,

  #[serde(default)]
  pub steps: Option<StepsConfig>,
}

impl ConfigFile {
  fn normalize(self) -> Config {
    let mut cfg = Config::default();
    if let Some(l) = self.logging {
      cfg.logging = l;
    }
    if let Some(d) = self.directories {
      cfg.directories = d;
    }
    if let Some(b) = self.browser {
      cfg.browser = b;
    }
    if let Some(d) = self.display {
      cfg.display = d;
    }
    if let Some(s) = self.server {
      cfg.server = s;
    }
    if let Some(v) = self.verify {
      cfg.verify = v;
    }
    if let Some(c) = self.compliance {
      cfg.compliance = c;
    }
    if let Some(s) = self.scan {
      cfg.scan = s;
    }
    if let Some(s) = self.steps {
      cfg.steps = s;
    }

    for reason in sanitize(&mut cfg) {
      tracing::warn!(reason = %reason, "config value invalid; default applied");
    }

    cfg
  }

  fn needs_upgrade(&self) -> bool {
    self.logging.is_none()
      || self.directories.is_none()
      || self.browser.is_none()
      || self.display.is_none()
      || self.server.is_none()
      || self.verify.is_none()
      || self.compliance.is_none()
      || self.scan.is_none()
      || self.steps.is_none()
  }
}

impl Config {
  /// Anchors relative paths at `base` (normally the config file's directory).
  pub fn resolve_relative_paths(&mut self, base: &Path) {
    let anchor = |p: &mut PathBuf| {
      if p.is_relative() {
        *p = base.join(&*p);
      }
    };

    anchor(&mut self.directories.tmp_dir);
    anchor(&mut self.directories.log_dir);
    anchor(&mut self.directories.output_dir);
    anchor(&mut self.browser.script);
    if let Some(p) = self.browser.cookie_dir.as_mut() {
      anchor(p);
    }
    if let Some(p) = self.server.certificate_file.as_mut() {
      anchor(p);
    }
    if let Some(p) = self.server.privatekey_file.as_mut() {
      anchor(p);
    }
  }

  /// Worker and server counts never exceed the number of creatives scanned.
  pub fn capped_counts(&self) -> (usize, usize) {
    let max = self.scan.max_scan;
    if max == 0 {
      return (self.browser.count, self.server.count);
    }
    (self.browser.count.min(max), self.server.count.min(max))
  }
}

/// Missing file: defaults are written. Invalid file: backed up and replaced by defaults.
/// Relative paths in the result are anchored at the config file's directory.
pub fn load_or_create_default(path: &Path) -> anyhow::Result<Config> {
  let parent = path
    .parent()
    .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", path.display()))?;
  if !parent.as_os_str().is_empty() {
    fs::create_dir_all(parent)?;
  }

  let mut cfg = load_impl(path)?;
  let base = if parent.as_os_str().is_empty() {
    Path::new(".")
  } else {
    parent
  };
  cfg.resolve_relative_paths(base);
  Ok(cfg)
}

fn load_impl(path: &Path) -> anyhow::Result<Config> {
  if !path.exists() {
    let cfg = Config::default();
    write_atomic(path, &toml::to_string_pretty(&to_config_file(&cfg))?)?;
    eprintln!("adscan: default config written to {}", path.display());
    return Ok(cfg);
  }

  let raw = fs::read_to_string(path)?;
  match toml::from_str::<ConfigFile>(&raw) {
    Ok(file) => {
      let upgrade = file.needs_upgrade();
      let cfg = file.normalize();
      if upgrade {
        let backup = backup_path(path, "bak");
        let _ = fs::copy(path, &backup);
        let _ = write_atomic(path, &toml::to_string_pretty(&to_config_file(&cfg))?);
        eprintln!(
          "adscan: missing config sections filled in {} (backup: {})",
          path.display(),
          backup.display()
        );
      }
      Ok(cfg)
    }
    Err(e) => {
      let cfg = Config::default();
      let backup = backup_path(path, "bad");
      let _ = fs::rename(path, &backup);
      write_atomic(path, &toml::to_string_pretty(&to_config_file(&cfg))?)?;
      eprintln!(
        "adscan: invalid config at {} (backed up to {}): {e}",
        path.display(),
        backup.display()
      );
      Ok(cfg)
    }
  }
}

fn backup_path(path: &Path, tag: &str) -> PathBuf {
  let ts = std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs();
  let name = path.file_name().unwrap_or_default().to_string_lossy();
  path.with_file_name(format!("{name}.{tag}-{ts}"))
}

fn to_config_file(cfg: &Config) -> ConfigFile {
  ConfigFile {
    logging: Some(cfg.logging.clone()),
    directories: Some(cfg.directories.clone()),
    browser: Some(cfg.browser.clone()),
    display: Some(cfg.display.clone()),
    server: Some(cfg.server.clone()),
    verify: Some(cfg.verify.clone()),
    compliance: Some(cfg.compliance.clone()),
    scan: Some(cfg.scan.clone()),
    steps: Some(cfg.steps.clone()),
  }
}

fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
  let parent = path
    .parent()
    .ok_or_else(|| anyhow::anyhow!("file path has no parent: {}", path.display()))?;
  let tmp = parent.join(format!(
    ".{}.tmp",
    path.file_name().unwrap_or_default().to_string_lossy()
  ));

  fs::write(&tmp, contents)?;
  fs::rename(&tmp, path)?;
  Ok(())
}

fn sanitize(cfg: &mut Config) -> Vec<String> {
  let mut reasons = Vec::new();

  if cfg.browser.count == 0 {
    cfg.browser.count = default_browser_count();
    reasons.push("browser.count must be > 0".to_string());
  }
  if cfg.browser.executable.trim().is_empty() {
    cfg.browser.executable = default_browser_executable();
    reasons.push("browser.executable must not be empty".to_string());
  }
  if cfg.server.count == 0 {
    cfg.server.count = default_server_count();
    reasons.push("server.count must be > 0".to_string());
  }
  if cfg.server.hostname.trim().is_empty() {
    cfg.server.hostname = default_hostname();
    reasons.push("server.hostname must not be empty".to_string());
  }
  if cfg.verify.timeout_seconds == 0 {
    cfg.verify.timeout_seconds = default_verify_timeout_seconds();
    reasons.push("verify.timeout_seconds must be > 0".to_string());
  }
  if cfg.display.dimension.trim().is_empty() {
    cfg.display.dimension = default_display_dimension();
    reasons.push("display.dimension must not be empty".to_string());
  }
  match url::Url::parse(&cfg.scan.default_ad_host) {
    Ok(u) if u.scheme() == "https" && u.host_str().is_some() => {}
    _ => {
      reasons.push(format!(
        "scan.default_ad_host must be an https URL: {}",
        cfg.scan.default_ad_host
      ));
      cfg.scan.default_ad_host = default_ad_host();
    }
  }

  reasons
}
