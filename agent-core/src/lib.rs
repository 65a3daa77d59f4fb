pub mod actor;
pub mod agent;
pub mod config;
pub mod console;
pub mod errors;
pub mod events;
pub mod hook;
pub mod logging;
pub mod paths;
pub mod protection;
pub mod rule;
pub mod security_response;
pub mod types;

use anyhow::Context;
use std::sync::mpsc;
use std::time::Duration;

pub fn run_console(args: &[String]) -> anyhow::Result<()> {
  let base = paths::base_dir();
  let config_path = paths::config_path(&base);

  // Offline commands never write the config or the log directory.
  let offline = args
    .iter()
    .any(|a| matches!(a.as_str(), "--help" | "-h" | "--print-config" | "--verify-pack"));
  if offline {
    let cfg = config::load_with_env(&config_path, false)?;
    logging::init_stderr(&cfg.logging.level)?;
    console::run_console_command(&cfg, args)?;
    return Ok(());
  }

  let cfg = config::load_with_env(&config_path, true)?;
  logging::init_file_and_stderr(
    &paths::logs_dir(&base),
    &cfg.logging.level,
    cfg.logging.retention_days,
  )?;

  match console::run_console_command(&cfg, args)? {
    console::ConsoleAction::ExitOk => return Ok(()),
    console::ConsoleAction::RunAgent => {}
  }

  tracing::info!(config = %config_path.display(), "starting appsec agent (console mode)");
  let agent = agent::Agent::new(cfg)?;
  agent.start().context("start agent")?;

  let (stop_tx, stop_rx) = mpsc::channel::<()>();
  ctrlc::set_handler(move || {
    let _ = stop_tx.send(());
  })?;

  agent.run(stop_rx, Duration::from_millis(500))?;
  tracing::info!("agent stopped");
  Ok(())
}
