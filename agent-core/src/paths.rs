use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "appsec.toml";

pub fn base_dir() -> PathBuf {
  std::env::var_os("APPSEC_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|| PathBuf::from("/var/lib/appsec-agent"))
}

/// `APPSEC_CONFIG_FILE` when set, else `appsec.toml` in the working directory,
/// else next to the executable, else under the base directory.
pub fn config_path(base: &Path) -> PathBuf {
  if let Some(p) = std::env::var_os("APPSEC_CONFIG_FILE").filter(|p| !p.is_empty()) {
    return PathBuf::from(p);
  }

  let candidates = [
    std::env::current_dir().ok().map(|d| d.join(CONFIG_FILE_NAME)),
    std::env::current_exe()
      .ok()
      .and_then(|exe| exe.parent().map(|d| d.join(CONFIG_FILE_NAME))),
  ];
  candidates
    .into_iter()
    .flatten()
    .find(|p| p.is_file())
    .unwrap_or_else(|| base.join(CONFIG_FILE_NAME))
}

pub fn logs_dir(base: &Path) -> PathBuf {
  base.join("logs")
}
