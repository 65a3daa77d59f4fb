use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_unix_ms() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis() as u64
}

/// Error text bounded for operator-facing diagnostics.
pub fn short_error(e: &anyhow::Error) -> String {
  let text = format!("{e:#}");
  let count = text.chars().count();
  if count <= 180 {
    return text;
  }
  let prefix: String = text.chars().take(180).collect();
  format!("{prefix}...")
}
