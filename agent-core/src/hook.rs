//! Per-symbol hooks and the prolog/epilog call protocol.
//!
//! The instrumentation layer registers one [`Hook`] per monitored symbol and
//! keeps the returned `Arc<Hook>`. Every invocation of the symbol goes through
//! [`Hook::run`], which reads the currently attached prolog, lets it observe the
//! call and possibly short-circuit it, and finally hands the call result to the
//! epilog the prolog returned.

use crate::actor::UserId;
use crate::errors::{CallResult, CallbackError, HookError};
use crate::protection::ProtectionContext;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Shape of the arguments a monitored symbol passes to its callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookSignature {
  /// Start of an HTTP request, before the handler runs.
  RequestStart,
  /// The request is associated with an authenticated user.
  IdentifyUser,
  /// The default blocking response is about to be written.
  BlockingResponse,
}

#[derive(Debug, Clone, Copy)]
pub enum HookArgs<'a> {
  RequestStart,
  IdentifyUser { user_id: &'a UserId },
  BlockingResponse,
}

impl HookArgs<'_> {
  pub fn signature(&self) -> HookSignature {
    match self {
      HookArgs::RequestStart => HookSignature::RequestStart,
      HookArgs::IdentifyUser { .. } => HookSignature::IdentifyUser,
      HookArgs::BlockingResponse => HookSignature::BlockingResponse,
    }
  }
}

/// Identity of a monitored symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId {
  pub class: String,
  pub method: String,
}

impl SymbolId {
  pub fn new(class: impl Into<String>, method: impl Into<String>) -> Self {
    Self {
      class: class.into(),
      method: method.into(),
    }
  }
}

impl fmt::Display for SymbolId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.class, self.method)
  }
}

pub type PrologResult = Result<Option<Box<dyn Epilog>>, CallbackError>;

/// Callback run at the entry of a monitored call.
pub trait Prolog: Send + Sync {
  /// Hook signature this callback can be attached to.
  fn signature(&self) -> HookSignature;

  /// Observe the call. `Ok(Some(epilog))` asks for `epilog` to run once the call
  /// returns; `Err(CallbackError::Abort(_))` skips the call entirely.
  fn on_entry(&self, ctx: &mut dyn ProtectionContext, args: &HookArgs<'_>) -> PrologResult;
}

/// Callback run at the exit of a monitored call, produced by a prolog.
pub trait Epilog: Send {
  fn on_exit(self: Box<Self>, ctx: &mut dyn ProtectionContext, result: &mut CallResult);
}

pub struct Hook {
  symbol: SymbolId,
  signature: HookSignature,
  prolog: RwLock<Option<Arc<dyn Prolog>>>,
}

impl fmt::Debug for Hook {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Hook")
      .field("symbol", &self.symbol)
      .field("signature", &self.signature)
      .field("attached", &self.prolog().is_some())
      .finish()
  }
}

impl Hook {
  fn new(symbol: SymbolId, signature: HookSignature) -> Self {
    Self {
      symbol,
      signature,
      prolog: RwLock::new(None),
    }
  }

  pub fn symbol(&self) -> &SymbolId {
    &self.symbol
  }

  pub fn signature(&self) -> HookSignature {
    self.signature
  }

  /// Currently attached prolog. The read lock is only held to clone the pointer.
  pub fn prolog(&self) -> Option<Arc<dyn Prolog>> {
    self.prolog.read().unwrap_or_else(|e| e.into_inner()).clone()
  }

  fn attach(&self, prolog: Arc<dyn Prolog>) -> Result<(), HookError> {
    if prolog.signature() != self.signature {
      return Err(HookError::SignatureMismatch {
        symbol: self.symbol.to_string(),
        expected: prolog.signature(),
        actual: self.signature,
      });
    }
    let mut slot = self.prolog.write().unwrap_or_else(|e| e.into_inner());
    *slot = Some(prolog);
    Ok(())
  }

  fn detach(&self) -> bool {
    let mut slot = self.prolog.write().unwrap_or_else(|e| e.into_inner());
    slot.take().is_some()
  }

  /// Run one invocation of the monitored symbol through its callbacks.
  pub fn run<F>(&self, ctx: &mut dyn ProtectionContext, args: &HookArgs<'_>, body: F) -> CallResult
  where
    F: FnOnce(&mut dyn ProtectionContext) -> CallResult,
  {
    // Single read per invocation: the whole call sees one callback.
    let Some(prolog) = self.prolog() else {
      return body(ctx);
    };

    let epilog = match prolog.on_entry(ctx, args) {
      Ok(epilog) => epilog,
      Err(CallbackError::Abort(e)) => return Err(e),
      Err(e) => {
        tracing::warn!(
          symbol = %self.symbol,
          key = e.key().unwrap_or("unknown"),
          error = %e,
          "callback failed; call proceeds unmonitored"
        );
        None
      }
    };

    let mut result = body(ctx);
    if let Some(epilog) = epilog {
      epilog.on_exit(ctx, &mut result);
    }
    result
  }
}

/// All monitored symbols of the process, created lazily and never removed.
#[derive(Debug, Default)]
pub struct HookRegistry {
  hooks: RwLock<HashMap<SymbolId, Arc<Hook>>>,
}

impl HookRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Return the hook of `class.method`, creating it on first reference.
  pub fn register(
    &self,
    class: &str,
    method: &str,
    signature: HookSignature,
  ) -> Result<Arc<Hook>, HookError> {
    let symbol = SymbolId::new(class, method);
    let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
    let hook = hooks
      .entry(symbol.clone())
      .or_insert_with(|| Arc::new(Hook::new(symbol, signature)))
      .clone();
    if hook.signature != signature {
      return Err(HookError::SignatureMismatch {
        symbol: hook.symbol.to_string(),
        expected: signature,
        actual: hook.signature,
      });
    }
    Ok(hook)
  }

  pub fn lookup(&self, class: &str, method: &str) -> Option<Arc<Hook>> {
    self.get(&SymbolId::new(class, method))
  }

  pub fn get(&self, symbol: &SymbolId) -> Option<Arc<Hook>> {
    self
      .hooks
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .get(symbol)
      .cloned()
  }

  /// Install `prolog` on `symbol`, replacing the previous one in a single swap.
  pub fn attach_prolog(&self, symbol: &SymbolId, prolog: Arc<dyn Prolog>) -> Result<(), HookError> {
    let hook = self
      .get(symbol)
      .ok_or_else(|| HookError::UnknownSymbol(symbol.to_string()))?;
    hook.attach(prolog)
  }

  /// Remove the prolog of `symbol`. No-op when nothing is attached.
  pub fn detach_prolog(&self, symbol: &SymbolId) {
    if let Some(hook) = self.get(symbol) {
      hook.detach();
    }
  }

  pub fn current_prolog(&self, symbol: &SymbolId) -> Option<Arc<dyn Prolog>> {
    self.get(symbol).and_then(|h| h.prolog())
  }

  pub fn attached_symbols(&self) -> Vec<SymbolId> {
    let hooks = self.hooks.read().unwrap_or_else(|e| e.into_inner());
    let mut out: Vec<SymbolId> = hooks
      .values()
      .filter(|h| h.prolog().is_some())
      .map(|h| h.symbol.clone())
      .collect();
    out.sort();
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::errors::CallError;
  use crate::protection::{BlockingResponse, RequestContext};
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct Counting {
    entries: AtomicUsize,
    abort: bool,
  }

  impl Prolog for Counting {
    fn signature(&self) -> HookSignature {
      HookSignature::RequestStart
    }

    fn on_entry(&self, _ctx: &mut dyn ProtectionContext, _args: &HookArgs<'_>) -> PrologResult {
      self.entries.fetch_add(1, Ordering::SeqCst);
      if self.abort {
        return Err(CallbackError::Abort(CallError::SecurityResponse));
      }
      Ok(Some(Box::new(MarkExit)))
    }
  }

  struct MarkExit;

  impl Epilog for MarkExit {
    fn on_exit(self: Box<Self>, ctx: &mut dyn ProtectionContext, result: &mut CallResult) {
      ctx.response_writer().set_header("X-Exit", "1");
      *result = Err(CallError::SecurityResponse);
    }
  }

  struct Failing;

  impl Prolog for Failing {
    fn signature(&self) -> HookSignature {
      HookSignature::RequestStart
    }

    fn on_entry(&self, _ctx: &mut dyn ProtectionContext, _args: &HookArgs<'_>) -> PrologResult {
      Err(CallbackError::keyed("test.failing", anyhow::anyhow!("nope")))
    }
  }

  fn ctx() -> RequestContext {
    RequestContext::new("192.0.2.10".parse().unwrap(), BlockingResponse::default())
  }

  fn counting(abort: bool) -> Arc<Counting> {
    Arc::new(Counting {
      entries: AtomicUsize::new(0),
      abort,
    })
  }

  #[test]
  fn unmonitored_call_runs_body() {
    let reg = HookRegistry::new();
    let hook = reg.register("app", "handle", HookSignature::RequestStart).unwrap();
    let mut c = ctx();
    let mut ran = false;
    let r = hook.run(&mut c, &HookArgs::RequestStart, |_| {
      ran = true;
      Ok(())
    });
    assert!(r.is_ok());
    assert!(ran);
  }

  #[test]
  fn epilog_sees_and_rewrites_result() {
    let reg = HookRegistry::new();
    let hook = reg.register("app", "handle", HookSignature::RequestStart).unwrap();
    let p = counting(false);
    reg.attach_prolog(hook.symbol(), p.clone()).unwrap();

    let mut c = ctx();
    let r = hook.run(&mut c, &HookArgs::RequestStart, |_| Ok(()));
    assert!(r.unwrap_err().is_security_response());
    assert_eq!(c.response().header("x-exit"), Some("1"));
    assert_eq!(p.entries.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn aborting_prolog_skips_body() {
    let reg = HookRegistry::new();
    let hook = reg.register("app", "handle", HookSignature::RequestStart).unwrap();
    reg.attach_prolog(hook.symbol(), counting(true)).unwrap();

    let mut c = ctx();
    let mut ran = false;
    let r = hook.run(&mut c, &HookArgs::RequestStart, |_| {
      ran = true;
      Ok(())
    });
    assert!(r.unwrap_err().is_security_response());
    assert!(!ran);
  }

  #[test]
  fn failing_prolog_does_not_break_the_call() {
    let reg = HookRegistry::new();
    let hook = reg.register("app", "handle", HookSignature::RequestStart).unwrap();
    reg.attach_prolog(hook.symbol(), Arc::new(Failing)).unwrap();
    let mut c = ctx();
    assert!(hook.run(&mut c, &HookArgs::RequestStart, |_| Ok(())).is_ok());
  }

  #[test]
  fn attach_detach_semantics() {
    let reg = HookRegistry::new();
    let hook = reg.register("app", "handle", HookSignature::RequestStart).unwrap();
    let sym = hook.symbol().clone();

    assert_eq!(
      reg.attach_prolog(&SymbolId::new("app", "missing"), counting(false)),
      Err(HookError::UnknownSymbol("app.missing".to_string()))
    );

    let first: Arc<dyn Prolog> = counting(false);
    let second: Arc<dyn Prolog> = counting(false);
    reg.attach_prolog(&sym, first.clone()).unwrap();
    reg.attach_prolog(&sym, second.clone()).unwrap();
    assert!(Arc::ptr_eq(&reg.current_prolog(&sym).unwrap(), &second));
    assert_eq!(reg.attached_symbols(), vec![sym.clone()]);

    reg.detach_prolog(&sym);
    reg.detach_prolog(&sym);
    assert!(reg.current_prolog(&sym).is_none());
    assert!(reg.attached_symbols().is_empty());
  }

  #[test]
  fn signatures_must_match() {
    let reg = HookRegistry::new();
    let hook = reg.register("app", "identify", HookSignature::IdentifyUser).unwrap();
    assert!(matches!(
      reg.attach_prolog(hook.symbol(), counting(false)),
      Err(HookError::SignatureMismatch { .. })
    ));
    assert!(reg.register("app", "identify", HookSignature::RequestStart).is_err());
    let again = reg.register("app", "identify", HookSignature::IdentifyUser).unwrap();
    assert!(Arc::ptr_eq(&hook, &again));
  }

  // A prolog whose two halves must always agree; a torn read would observe a mix.
  struct Paired {
    a: u64,
    b: u64,
  }

  impl Prolog for Paired {
    fn signature(&self) -> HookSignature {
      HookSignature::RequestStart
    }

    fn on_entry(&self, _ctx: &mut dyn ProtectionContext, _args: &HookArgs<'_>) -> PrologResult {
      if self.a != self.b {
        return Err(CallbackError::Abort(CallError::Other(anyhow::anyhow!("torn"))));
      }
      Ok(None)
    }
  }

  #[test]
  fn concurrent_readers_never_see_torn_callbacks() {
    let reg = HookRegistry::new();
    let hook = reg.register("app", "handle", HookSignature::RequestStart).unwrap();
    let sym = hook.symbol().clone();

    std::thread::scope(|s| {
      s.spawn(|| {
        for i in 0..2_000u64 {
          if i % 3 == 0 {
            reg.detach_prolog(&sym);
          } else {
            reg.attach_prolog(&sym, Arc::new(Paired { a: i, b: i })).unwrap();
          }
        }
      });
      for _ in 0..4 {
        let hook = hook.clone();
        s.spawn(move || {
          let mut c = ctx();
          for _ in 0..2_000 {
            assert!(hook.run(&mut c, &HookArgs::RequestStart, |_| Ok(())).is_ok());
          }
        });
      }
    });
  }
}
