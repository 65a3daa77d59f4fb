use crate::config::Config;
use crate::errors::RuleRejection;
use crate::rule::{RulePack, RuleVerifier};
use anyhow::Context;
use std::path::Path;

pub enum ConsoleAction {
  RunAgent,
  ExitOk,
}

pub fn run_console_command(cfg: &Config, args: &[String]) -> anyhow::Result<ConsoleAction> {
  let args = strip_console_flag(args);

  if args.iter().any(|a| a == "--help" || a == "-h") {
    print_help();
    return Ok(ConsoleAction::ExitOk);
  }

  if args.iter().any(|a| a == "--print-config") {
    print_config(cfg);
    return Ok(ConsoleAction::ExitOk);
  }

  if let Some(i) = args.iter().position(|a| a == "--verify-pack") {
    let path = args.get(i + 1).map(|s| s.as_str()).unwrap_or("");
    if path.is_empty() {
      anyhow::bail!("expected: --verify-pack <path-to-pack.json>");
    }
    return run_verify_pack(cfg, Path::new(path));
  }

  Ok(ConsoleAction::RunAgent)
}

/// Per-rule verdict of a rule pack checked offline.
#[derive(Debug)]
pub struct PackVerdict {
  pub pack_id: String,
  pub rules: Vec<(String, Result<(), RuleRejection>)>,
}

impl PackVerdict {
  pub fn valid_count(&self) -> usize {
    self.rules.iter().filter(|(_, r)| r.is_ok()).count()
  }
}

/// Check every rule signature of a pack file against `public_key`. Hookpoints
/// are not resolved: no instrumented process is attached.
pub fn verify_pack_file(public_key: &str, path: &Path) -> anyhow::Result<PackVerdict> {
  let raw = std::fs::read(path).with_context(|| format!("read rule pack {}", path.display()))?;
  let pack: RulePack = serde_json::from_slice(&raw).context("parse rule pack JSON")?;
  let verifier = if public_key.trim().is_empty() {
    RuleVerifier::without_key()
  } else {
    RuleVerifier::from_encoded(public_key).context("invalid rules.public_key")?
  };

  let rules = pack
    .rules
    .iter()
    .map(|rule| (rule.name.clone(), verifier.authenticate(rule)))
    .collect();

  Ok(PackVerdict {
    pack_id: pack.pack_id,
    rules,
  })
}

fn run_verify_pack(cfg: &Config, path: &Path) -> anyhow::Result<ConsoleAction> {
  let verdict = verify_pack_file(&cfg.rules.public_key, path)?;
  println!("Rule pack: {}", verdict.pack_id);
  for (name, r) in &verdict.rules {
    match r {
      Ok(()) => println!("  ok       {name}"),
      Err(e) => println!("  REJECTED {name}: {e}"),
    }
  }
  println!(
    "{}/{} rule(s) carry a valid signature.",
    verdict.valid_count(),
    verdict.rules.len()
  );
  if verdict.valid_count() < verdict.rules.len() {
    anyhow::bail!(
      "{} rule(s) rejected",
      verdict.rules.len() - verdict.valid_count()
    );
  }
  Ok(ConsoleAction::ExitOk)
}

fn print_config(cfg: &Config) {
  println!("[logging]");
  println!("level = {}", cfg.logging.level);
  println!("retention_days = {}", cfg.logging.retention_days);
  println!("[rules]");
  println!(
    "public_key = {}",
    if cfg.rules.public_key.trim().is_empty() { "(none)" } else { cfg.rules.public_key.as_str() }
  );
  println!("enabled = {}", cfg.rules.enabled);
  println!("pack_path = {}", display_opt(cfg.rules.pack_path.as_deref()));
  println!("actions_path = {}", display_opt(cfg.rules.actions_path.as_deref()));
  println!("[protection]");
  println!(
    "ip_header = {}",
    cfg.protection.ip_header.as_deref().unwrap_or("(auto)")
  );
  println!("blocking_status = {}", cfg.protection.blocking_status);
  println!("blocking_content_type = {}", cfg.protection.blocking_content_type);
}

fn display_opt(p: Option<&Path>) -> String {
  p.map(|p| p.display().to_string())
    .unwrap_or_else(|| "(none)".to_string())
}

fn strip_console_flag(args: &[String]) -> Vec<String> {
  args
    .iter()
    .skip(1)
    .filter(|a| a.as_str() != "--console")
    .cloned()
    .collect()
}

fn print_help() {
  println!("appsec-agent v{}", env!("CARGO_PKG_VERSION"));
  println!("Commands:");
  println!("  (no command) run the agent until Ctrl+C");
  println!("  --version");
  println!("  --print-config");
  println!("  --verify-pack <path-to-pack.json>");
}
