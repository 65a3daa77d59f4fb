use crate::actor::{parse_security_actions, ActorStore, UserId};
use crate::config::Config;
use crate::errors::CallResult;
use crate::hook::{Hook, HookArgs, HookRegistry, HookSignature};
use crate::protection::{self, BlockingResponse, RequestContext};
use crate::rule::callback::NativeCallbacks;
use crate::rule::{Engine, RuleVerifier, SetRulesOptions, SetRulesReport};
use anyhow::Context;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::{Duration, SystemTime};

/// Hookpoints of the HTTP protection layer.
pub const HTTP_CLASS: &str = "http";
pub const REQUEST_START: &str = "request_start";
pub const IDENTIFY_USER: &str = "identify_user";
pub const WRITE_BLOCKING_RESPONSE: &str = "write_blocking_response";

/// Wires the actor store, the hook registry and the rule engine together for
/// the HTTP protection layer.
pub struct Agent {
  cfg: Config,
  actors: Arc<ActorStore>,
  registry: Arc<HookRegistry>,
  engine: Engine,
  request_start: Arc<Hook>,
  identify_user: Arc<Hook>,
  blocking_response: Arc<Hook>,
}

impl Agent {
  pub fn new(cfg: Config) -> anyhow::Result<Self> {
    Self::with_registry(cfg, Arc::new(HookRegistry::new()))
  }

  /// Build an agent on an existing registry. The HTTP hookpoints are registered
  /// on it; other instrumented symbols may already be there.
  pub fn with_registry(cfg: Config, registry: Arc<HookRegistry>) -> anyhow::Result<Self> {
    let verifier = if cfg.rules.public_key.trim().is_empty() {
      tracing::warn!("no rule signing key configured; every rule will be rejected");
      RuleVerifier::without_key()
    } else {
      RuleVerifier::from_encoded(&cfg.rules.public_key).context("invalid rules.public_key")?
    };

    let request_start = registry.register(HTTP_CLASS, REQUEST_START, HookSignature::RequestStart)?;
    let identify_user = registry.register(HTTP_CLASS, IDENTIFY_USER, HookSignature::IdentifyUser)?;
    let blocking_response = registry.register(
      HTTP_CLASS,
      WRITE_BLOCKING_RESPONSE,
      HookSignature::BlockingResponse,
    )?;

    let actors = Arc::new(ActorStore::new());
    let engine = Engine::new(
      registry.clone(),
      verifier,
      Box::new(NativeCallbacks::new(actors.clone())),
    );

    Ok(Self {
      cfg,
      actors,
      registry,
      engine,
      request_start,
      identify_user,
      blocking_response,
    })
  }

  pub fn config(&self) -> &Config {
    &self.cfg
  }

  pub fn engine(&self) -> &Engine {
    &self.engine
  }

  pub fn actors(&self) -> &Arc<ActorStore> {
    &self.actors
  }

  pub fn registry(&self) -> &Arc<HookRegistry> {
    &self.registry
  }

  /// Load the configured action list and rule pack, then enable the engine
  /// unless protection is disabled.
  pub fn start(&self) -> anyhow::Result<()> {
    if let Some(path) = &self.cfg.rules.actions_path {
      self.load_security_actions(path)?;
    }
    if let Some(path) = &self.cfg.rules.pack_path {
      self.load_rule_pack(path)?;
    }

    if self.cfg.rules.enabled {
      self.engine.enable();
    } else {
      tracing::warn!("protection disabled by configuration");
    }
    Ok(())
  }

  pub fn load_rule_pack(&self, path: &Path) -> anyhow::Result<SetRulesReport> {
    let raw = std::fs::read(path).with_context(|| format!("read rule pack {}", path.display()))?;
    let report = self
      .engine
      .set_rules_json(&raw, &SetRulesOptions::default())
      .with_context(|| format!("load rule pack {}", path.display()))?;
    tracing::info!(
      path = %path.display(),
      pack_id = %report.pack_id,
      installed = report.installed,
      rejected = report.rejected_count(),
      "rule pack loaded"
    );
    Ok(report)
  }

  pub fn load_security_actions(&self, path: &Path) -> anyhow::Result<()> {
    let raw =
      std::fs::read(path).with_context(|| format!("read security actions {}", path.display()))?;
    let table = parse_security_actions(&raw)
      .with_context(|| format!("load security actions {}", path.display()))?;
    self.actors.replace(table);
    Ok(())
  }

  /// Protection context of a new request, with the client address resolved
  /// from the proxy headers.
  pub fn request_context(&self, remote_addr: IpAddr, headers: &[(String, String)]) -> RequestContext {
    let ip = protection::client_ip(remote_addr, headers, self.cfg.protection.ip_header.as_deref());
    RequestContext::new(ip, BlockingResponse::from(&self.cfg.protection))
      .with_blocking_hook(self.blocking_response.clone())
  }

  /// Request-start hookpoint. An error for which `is_security_response()` holds
  /// means the response is already written and the handler must not run.
  pub fn on_request_start(&self, ctx: &mut RequestContext) -> CallResult {
    self.request_start.run(ctx, &HookArgs::RequestStart, |_| Ok(()))
  }

  /// Run `handler` for a request unless a security response matched at
  /// request start.
  pub fn handle<F>(&self, ctx: &mut RequestContext, handler: F) -> CallResult
  where
    F: FnOnce(&mut RequestContext) -> CallResult,
  {
    self.on_request_start(ctx)?;
    handler(ctx)
  }

  /// Associate the request with an authenticated user.
  pub fn on_identify_user(&self, ctx: &mut RequestContext, user_id: &UserId) -> CallResult {
    self
      .identify_user
      .run(ctx, &HookArgs::IdentifyUser { user_id }, |_| Ok(()))
  }

  /// Serve until `stop_rx` fires, reloading the action list and the rule pack
  /// whenever their files change.
  pub fn run(&self, stop_rx: mpsc::Receiver<()>, tick: Duration) -> anyhow::Result<()> {
    let mut actions = Watched::new(self.cfg.rules.actions_path.clone());
    let mut pack = Watched::new(self.cfg.rules.pack_path.clone());

    tracing::info!(
      pack_id = %self.engine.pack_id(),
      enabled = self.engine.is_enabled(),
      "agent loop started"
    );

    loop {
      if stop_rx.recv_timeout(tick).is_ok() {
        break;
      }

      if let Some(path) = actions.changed() {
        if let Err(e) = self.load_security_actions(&path) {
          tracing::warn!(error = %crate::types::short_error(&e), "security actions reload failed");
        }
      }
      if let Some(path) = pack.changed() {
        if let Err(e) = self.load_rule_pack(&path) {
          tracing::warn!(error = %crate::types::short_error(&e), "rule pack reload failed");
        }
      }
    }

    self.engine.disable();
    tracing::info!("agent loop exiting");
    Ok(())
  }
}

/// A file polled for modification.
struct Watched {
  path: Option<PathBuf>,
  modified: Option<SystemTime>,
}

impl Watched {
  fn new(path: Option<PathBuf>) -> Self {
    let modified = path.as_deref().and_then(mtime);
    Self { path, modified }
  }

  fn changed(&mut self) -> Option<PathBuf> {
    let path = self.path.as_ref()?;
    let current = mtime(path);
    if current.is_none() || current == self.modified {
      return None;
    }
    self.modified = current;
    Some(path.clone())
  }
}

fn mtime(path: &Path) -> Option<SystemTime> {
  std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::rule::callback::IP_SECURITY_RESPONSE;
  use crate::rule::verify::{canonical_message, encode_public_key, sign_message};
  use crate::rule::{Hookpoint, Rule, RuleData, RulePack};
  use p256::ecdsa::{SigningKey, VerifyingKey};

  fn key() -> SigningKey {
    SigningKey::from_slice(&[7u8; 32]).unwrap()
  }

  fn config() -> Config {
    let mut cfg = Config::default();
    cfg.rules.public_key = encode_public_key(&VerifyingKey::from(&key()));
    cfg
  }

  fn pack() -> RulePack {
    RulePack {
      pack_id: "pack-1".to_string(),
      rules: vec![Rule {
        name: "ip-blocking".to_string(),
        hookpoint: Hookpoint {
          class: HTTP_CLASS.to_string(),
          method: REQUEST_START.to_string(),
          callback: IP_SECURITY_RESPONSE.to_string(),
        },
        data: RuleData::default(),
        signature: sign_message(&key(), &canonical_message("ip-blocking")).unwrap(),
      }],
    }
  }

  #[test]
  fn invalid_public_key_is_an_error() {
    let mut cfg = Config::default();
    cfg.rules.public_key = "not base64!".to_string();
    assert!(Agent::new(cfg).is_err());
  }

  #[test]
  fn start_loads_files_and_enables() {
    let dir = tempfile::tempdir().unwrap();
    let pack_path = dir.path().join("pack.json");
    let actions_path = dir.path().join("actions.json");
    std::fs::write(&pack_path, serde_json::to_vec(&pack()).unwrap()).unwrap();
    std::fs::write(
      &actions_path,
      r#"[{"action_id":"a1","action":"block_ip","parameters":{"ip_cidr":["198.51.100.0/24"]}}]"#,
    )
    .unwrap();

    let mut cfg = config();
    cfg.rules.pack_path = Some(pack_path);
    cfg.rules.actions_path = Some(actions_path);
    let agent = Agent::new(cfg).unwrap();
    agent.start().unwrap();

    assert_eq!(agent.engine().pack_id(), "pack-1");
    assert!(agent.engine().is_enabled());

    let headers = vec![("X-Forwarded-For".to_string(), "198.51.100.4".to_string())];
    let mut ctx = agent.request_context("10.0.0.2".parse().unwrap(), &headers);
    let mut reached = false;
    let r = agent.handle(&mut ctx, |_| {
      reached = true;
      Ok(())
    });
    assert!(r.unwrap_err().is_security_response());
    assert!(!reached);
    assert_eq!(ctx.response().status, Some(403));
  }

  #[test]
  fn disabled_protection_leaves_hooks_detached() {
    let mut cfg = config();
    cfg.rules.enabled = false;
    let agent = Agent::new(cfg).unwrap();
    agent.start().unwrap();
    agent
      .engine()
      .set_rules("pack-1", &pack().rules, &SetRulesOptions::default());
    assert!(!agent.engine().is_enabled());
    assert!(agent.registry().attached_symbols().is_empty());
  }

  #[test]
  fn run_stops_on_signal_and_detaches() {
    let agent = Agent::new(config()).unwrap();
    agent.start().unwrap();
    agent
      .engine()
      .set_rules("pack-1", &pack().rules, &SetRulesOptions::default());
    assert_eq!(agent.registry().attached_symbols().len(), 1);

    let (tx, rx) = mpsc::channel();
    tx.send(()).unwrap();
    agent.run(rx, Duration::from_millis(10)).unwrap();
    assert!(!agent.engine().is_enabled());
    assert!(agent.registry().attached_symbols().is_empty());
  }
}
