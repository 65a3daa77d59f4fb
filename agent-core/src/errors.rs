use thiserror::Error;

/// Outcome of a monitored call as seen by the HTTP protection layer.
#[derive(Debug, Error)]
pub enum CallError {
  /// A security response matched the request. The response has already been
  /// written; the caller must stop handling the request and write nothing else.
  #[error("a security response matched the request")]
  SecurityResponse,

  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

impl CallError {
  pub fn is_security_response(&self) -> bool {
    matches!(self, CallError::SecurityResponse)
  }
}

pub type CallResult = Result<(), CallError>;

/// Error returned by a prolog.
#[derive(Debug, Error)]
pub enum CallbackError {
  /// Short-circuit the monitored call: its body is skipped and this error is
  /// returned to the caller.
  #[error("call aborted by callback: {0}")]
  Abort(CallError),

  /// The callback failed. The call proceeds unmonitored. `key` names the error
  /// site so repeated occurrences can be deduplicated upstream.
  #[error("{key}: {source:#}")]
  Failed {
    key: &'static str,
    #[source]
    source: anyhow::Error,
  },
}

impl CallbackError {
  pub fn keyed(key: &'static str, source: impl Into<anyhow::Error>) -> Self {
    CallbackError::Failed {
      key,
      source: source.into(),
    }
  }

  pub fn key(&self) -> Option<&'static str> {
    match self {
      CallbackError::Failed { key, .. } => Some(key),
      CallbackError::Abort(_) => None,
    }
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HookError {
  #[error("unknown hook symbol {0}")]
  UnknownSymbol(String),

  #[error("callback expects a {expected:?} hook but {symbol} is a {actual:?} hook")]
  SignatureMismatch {
    symbol: String,
    expected: crate::hook::HookSignature,
    actual: crate::hook::HookSignature,
  },
}

/// Why a single rule of a rule pack was dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleRejection {
  #[error("invalid signature: {0}")]
  InvalidSignature(String),

  #[error("signed message does not match the rule")]
  MessageMismatch,

  #[error("unknown hookpoint {class}.{method}")]
  UnknownHookpoint { class: String, method: String },

  #[error("unknown callback kind `{0}`")]
  UnknownCallback(String),

  #[error("callback `{callback}` cannot be attached to this hookpoint: {reason}")]
  IncompatibleCallback { callback: String, reason: String },

  #[error("invalid rule data: {0}")]
  InvalidData(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActorError {
  #[error("unspecified client address `{0}`")]
  InvalidAddress(std::net::IpAddr),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn security_response_is_distinguishable() {
    let e = CallError::SecurityResponse;
    assert!(e.is_security_response());
    let other = CallError::from(anyhow::anyhow!("boom"));
    assert!(!other.is_security_response());
  }

  #[test]
  fn keyed_errors_expose_their_site() {
    let e = CallbackError::keyed("actor.lookup", anyhow::anyhow!("bad ip"));
    assert_eq!(e.key(), Some("actor.lookup"));
    assert!(e.to_string().contains("bad ip"));
    assert_eq!(CallbackError::Abort(CallError::SecurityResponse).key(), None);
  }
}
