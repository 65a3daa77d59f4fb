use super::callback::CallbackFactory;
use super::schema::{Rule, RulePack};
use super::verify::RuleVerifier;
use crate::errors::RuleRejection;
use crate::hook::{HookRegistry, Prolog, SymbolId};
use anyhow::Context;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, Default)]
pub struct SetRulesOptions {
  /// Verify and compile the rules and report, but keep the active rule set.
  pub dry_run: bool,
}

/// A rule dropped from a rule set, with its position in the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDiagnostic {
  pub index: usize,
  pub rule: String,
  pub reason: RuleRejection,
}

#[derive(Debug, Clone, Default)]
pub struct SetRulesReport {
  pub pack_id: String,
  /// Hookpoints bound by the new rule set.
  pub installed: usize,
  pub rejected: Vec<RuleDiagnostic>,
}

impl SetRulesReport {
  pub fn rejected_count(&self) -> usize {
    self.rejected.len()
  }
}

struct CompiledRule {
  index: usize,
  name: String,
  prolog: Arc<dyn Prolog>,
}

#[derive(Default)]
struct State {
  enabled: bool,
  pack_id: String,
  rules: HashMap<SymbolId, CompiledRule>,
  // Symbols this engine currently has a prolog attached to.
  attached: HashSet<SymbolId>,
}

/// Owns the active rule set and keeps the hook registry in line with it.
///
/// Administrative calls are serialized by one lock. The registry is only
/// touched through single-symbol swaps, so monitored calls never wait on the
/// engine.
pub struct Engine {
  registry: Arc<HookRegistry>,
  verifier: RuleVerifier,
  callbacks: Box<dyn CallbackFactory>,
  state: Mutex<State>,
}

impl Engine {
  /// A new engine starts disabled with no rule set.
  pub fn new(
    registry: Arc<HookRegistry>,
    verifier: RuleVerifier,
    callbacks: Box<dyn CallbackFactory>,
  ) -> Self {
    Self {
      registry,
      verifier,
      callbacks,
      state: Mutex::new(State::default()),
    }
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Identifier of the loaded rule set; empty when none was loaded.
  pub fn pack_id(&self) -> String {
    self.state().pack_id.clone()
  }

  pub fn is_enabled(&self) -> bool {
    self.state().enabled
  }

  /// Symbols the engine has a callback attached to, sorted.
  pub fn attached_symbols(&self) -> Vec<SymbolId> {
    let mut out: Vec<SymbolId> = self.state().attached.iter().cloned().collect();
    out.sort();
    out
  }

  /// Replace the rule set. Invalid rules are dropped and reported; the call
  /// itself does not fail.
  pub fn set_rules(&self, pack_id: &str, rules: &[Rule], opts: &SetRulesOptions) -> SetRulesReport {
    let mut compiled: HashMap<SymbolId, CompiledRule> = HashMap::new();
    let mut rejected = Vec::new();

    for (index, rule) in rules.iter().enumerate() {
      match self.compile(rule) {
        Ok((symbol, prolog)) => {
          let next = CompiledRule {
            index,
            name: rule.name.clone(),
            prolog,
          };
          if let Some(prev) = compiled.insert(symbol.clone(), next) {
            tracing::debug!(
              pack_id,
              symbol = %symbol,
              rule = %prev.name,
              index = prev.index,
              "rule superseded by a later rule on the same hookpoint"
            );
          }
        }
        Err(reason) => {
          tracing::warn!(pack_id, rule = %rule.name, index, error = %reason, "rule rejected");
          rejected.push(RuleDiagnostic {
            index,
            rule: rule.name.clone(),
            reason,
          });
        }
      }
    }

    let report = SetRulesReport {
      pack_id: pack_id.to_string(),
      installed: compiled.len(),
      rejected,
    };
    if opts.dry_run {
      return report;
    }

    let mut state = self.state();
    state.pack_id = pack_id.to_string();
    state.rules = compiled;
    if state.enabled {
      self.reconcile(&mut state);
    }
    tracing::info!(
      pack_id,
      installed = report.installed,
      rejected = report.rejected_count(),
      enabled = state.enabled,
      "rule set replaced"
    );
    report
  }

  /// Parse a JSON rule pack and install it. An unparseable pack is an error and
  /// leaves the active rule set untouched.
  pub fn set_rules_json(&self, raw: &[u8], opts: &SetRulesOptions) -> anyhow::Result<SetRulesReport> {
    let pack: RulePack = serde_json::from_slice(raw).context("parse rule pack JSON")?;
    Ok(self.set_rules(&pack.pack_id, &pack.rules, opts))
  }

  pub fn enable(&self) {
    let mut state = self.state();
    if state.enabled {
      return;
    }
    self.reconcile(&mut state);
    state.enabled = true;
    tracing::info!(pack_id = %state.pack_id, attached = state.attached.len(), "rule engine enabled");
  }

  pub fn disable(&self) {
    let mut state = self.state();
    if !state.enabled {
      return;
    }
    for symbol in state.attached.drain() {
      self.registry.detach_prolog(&symbol);
    }
    state.enabled = false;
    tracing::info!(pack_id = %state.pack_id, "rule engine disabled");
  }

  fn compile(&self, rule: &Rule) -> Result<(SymbolId, Arc<dyn Prolog>), RuleRejection> {
    self.verifier.authenticate(rule)?;

    let hp = &rule.hookpoint;
    let hook = self
      .registry
      .lookup(&hp.class, &hp.method)
      .ok_or_else(|| RuleRejection::UnknownHookpoint {
        class: hp.class.clone(),
        method: hp.method.clone(),
      })?;

    let prolog = self.callbacks.build(rule)?;
    if prolog.signature() != hook.signature() {
      return Err(RuleRejection::IncompatibleCallback {
        callback: hp.callback.clone(),
        reason: format!(
          "expects a {:?} hook, {} is a {:?} hook",
          prolog.signature(),
          hook.symbol(),
          hook.signature()
        ),
      });
    }
    Ok((hook.symbol().clone(), prolog))
  }

  // New prologs are attached before stale ones are detached: a symbol kept
  // across rule sets swaps callbacks without going unmonitored.
  fn reconcile(&self, state: &mut State) {
    let mut attached = HashSet::with_capacity(state.rules.len());
    for (symbol, rule) in &state.rules {
      match self.registry.attach_prolog(symbol, rule.prolog.clone()) {
        Ok(()) => {
          attached.insert(symbol.clone());
        }
        // Compiled rules only target registered hooks of a matching signature.
        Err(e) => tracing::error!(symbol = %symbol, rule = %rule.name, error = %e, "attach failed"),
      }
    }
    for symbol in state.attached.difference(&attached) {
      self.registry.detach_prolog(symbol);
    }
    state.attached = attached;
  }
}
