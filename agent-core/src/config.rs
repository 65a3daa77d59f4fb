use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "APPSEC";

#[derive(Debug, Clone, Default)]
pub struct Config {
  pub logging: LoggingConfig,
  pub rules: RulesConfig,
  pub protection: ProtectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
  #[serde(default = "default_log_level")]
  pub level: String,

  #[serde(default = "default_retention_days")]
  pub retention_days: u64,
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_retention_days() -> u64 {
  14
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      retention_days: default_retention_days(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
  /// P-256 verifying key of the rule signer, as base64 SEC1 or PEM. Empty
  /// rejects every rule.
  #[serde(default)]
  pub public_key: String,

  #[serde(default = "default_true")]
  pub enabled: bool,

  #[serde(default)]
  pub pack_path: Option<PathBuf>,

  #[serde(default)]
  pub actions_path: Option<PathBuf>,
}

impl Default for RulesConfig {
  fn default() -> Self {
    Self {
      public_key: String::new(),
      enabled: true,
      pack_path: None,
      actions_path: None,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
  #[serde(default)]
  pub ip_header: Option<String>,

  #[serde(default = "default_blocking_status")]
  pub blocking_status: u16,

  #[serde(default = "default_blocking_content_type")]
  pub blocking_content_type: String,

  #[serde(default = "default_blocking_body")]
  pub blocking_body: String,
}

impl Default for ProtectionConfig {
  fn default() -> Self {
    Self {
      ip_header: None,
      blocking_status: default_blocking_status(),
      blocking_content_type: default_blocking_content_type(),
      blocking_body: default_blocking_body(),
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_blocking_status() -> u16 {
  403
}

fn default_blocking_content_type() -> String {
  "text/html; charset=utf-8".to_string()
}

fn default_blocking_body() -> String {
  "<!DOCTYPE html><html><head><title>Forbidden</title></head><body><h1>Forbidden</h1><p>This request was blocked for security reasons.</p></body></html>".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigFile {
  #[serde(default)]
  pub logging: Option<LoggingConfig>,

  #[serde(default)]
  pub rules: Option<RulesConfig>,

  #[serde(default)]
  pub protection: Option<ProtectionConfig>,
}

impl ConfigFile {
  fn normalize(self) -> Config {
    let mut cfg = Config::default();
    if let Some(l) = self.logging {
      cfg.logging = l;
    }
    if let Some(r) = self.rules {
      cfg.rules = r;
    }
    if let Some(p) = self.protection {
      cfg.protection = p;
    }
    sanitize(&mut cfg);
    cfg
  }

  fn needs_upgrade(&self) -> bool {
    self.logging.is_none() || self.rules.is_none() || self.protection.is_none()
  }
}

fn sanitize(cfg: &mut Config) {
  if !(100..=599).contains(&cfg.protection.blocking_status) {
    tracing::warn!(
      status = cfg.protection.blocking_status,
      "invalid blocking status; using default"
    );
    cfg.protection.blocking_status = default_blocking_status();
  }
}

pub fn load_or_create_default(path: &Path) -> anyhow::Result<Config> {
  load_impl(path, true)
}

pub fn load_or_default_readonly(path: &Path) -> anyhow::Result<Config> {
  load_impl(path, false)
}

/// Load the configuration file, then apply `APPSEC_*` environment overrides.
pub fn load_with_env(path: &Path, allow_writes: bool) -> anyhow::Result<Config> {
  let mut cfg = load_impl(path, allow_writes)?;
  apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
  Ok(cfg)
}

fn load_impl(path: &Path, allow_writes: bool) -> anyhow::Result<Config> {
  let parent = path
    .parent()
    .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", path.display()))?;
  if allow_writes {
    fs::create_dir_all(parent)?;
  }

  if !path.exists() {
    let cfg = Config::default();
    if allow_writes {
      write_atomic(path, &toml::to_string_pretty(&to_config_file(&cfg))?)?;
    }
    return Ok(cfg);
  }

  let raw = fs::read_to_string(path)?;
  match toml::from_str::<ConfigFile>(&raw) {
    Ok(file) => {
      let upgrade = file.needs_upgrade();
      let cfg = file.normalize();
      if allow_writes && upgrade {
        let backup = parent.join(format!("appsec.toml.bak-{}", now_unix_s()));
        let _ = fs::copy(path, &backup);
        let _ = write_atomic(path, &toml::to_string_pretty(&to_config_file(&cfg))?);
        eprintln!(
          "appsec-agent: upgraded config defaults written to {} (backup: {})",
          path.display(),
          backup.display()
        );
      }
      Ok(cfg)
    }
    Err(e) => {
      let cfg = Config::default();
      if allow_writes {
        let backup = parent.join(format!("appsec.toml.bad-{}", now_unix_s()));
        let _ = fs::rename(path, &backup);
        write_atomic(path, &toml::to_string_pretty(&to_config_file(&cfg))?)?;
        eprintln!(
          "appsec-agent: invalid config at {} (backed up to {}): {e}",
          path.display(),
          backup.display()
        );
      } else {
        eprintln!(
          "appsec-agent: invalid config at {}; using defaults in read-only mode: {e}",
          path.display()
        );
      }
      Ok(cfg)
    }
  }
}

/// Environment variables win over the file: `APPSEC_LOG_LEVEL`,
/// `APPSEC_RULES_PUBLIC_KEY`, `APPSEC_IP_HEADER`, `APPSEC_DISABLE`, ...
pub fn apply_env_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
  let var = |key: &str| {
    lookup(&format!("{ENV_PREFIX}_{}", key.to_ascii_uppercase())).filter(|v| !v.trim().is_empty())
  };

  if let Some(v) = var("log_level") {
    cfg.logging.level = v;
  }
  if let Some(v) = var("log_retention_days") {
    match v.trim().parse() {
      Ok(days) => cfg.logging.retention_days = days,
      Err(_) => tracing::warn!(value = %v, "ignoring invalid APPSEC_LOG_RETENTION_DAYS"),
    }
  }
  if let Some(v) = var("rules_public_key") {
    cfg.rules.public_key = v;
  }
  if let Some(v) = var("rules_pack_path") {
    cfg.rules.pack_path = Some(PathBuf::from(v));
  }
  if let Some(v) = var("actions_path") {
    cfg.rules.actions_path = Some(PathBuf::from(v));
  }
  if let Some(v) = var("ip_header") {
    cfg.protection.ip_header = Some(v);
  }
  if let Some(v) = var("blocking_status") {
    match v.trim().parse() {
      Ok(status) => cfg.protection.blocking_status = status,
      Err(_) => tracing::warn!(value = %v, "ignoring invalid APPSEC_BLOCKING_STATUS"),
    }
  }
  if let Some(v) = var("disable") {
    if is_truthy(&v) {
      cfg.rules.enabled = false;
    }
  }
  sanitize(cfg);
}

fn is_truthy(v: &str) -> bool {
  matches!(
    v.trim().to_ascii_lowercase().as_str(),
    "1" | "true" | "yes" | "on"
  )
}

fn to_config_file(cfg: &Config) -> ConfigFile {
  ConfigFile {
    logging: Some(cfg.logging.clone()),
    rules: Some(cfg.rules.clone()),
    protection: Some(cfg.protection.clone()),
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

fn now_unix_s() -> u64 {
  crate::types::now_unix_ms() / 1000
}
