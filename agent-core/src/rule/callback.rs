//! Callback construction, one prolog per rule, chosen by the hookpoint's
//! callback kind.

use super::schema::Rule;
use crate::actor::ActorStore;
use crate::errors::{CallError, CallbackError, RuleRejection};
use crate::hook::{HookArgs, HookSignature, Prolog, PrologResult};
use crate::protection::ProtectionContext;
use crate::security_response::{IpSecurityResponse, UserSecurityResponse};
use serde::Deserialize;
use std::sync::Arc;

pub const IP_SECURITY_RESPONSE: &str = "IPSecurityResponse";
pub const USER_SECURITY_RESPONSE: &str = "UserSecurityResponse";
pub const WRITE_CUSTOM_ERROR_PAGE: &str = "WriteCustomErrorPage";
pub const WRITE_HTTP_REDIRECTION: &str = "WriteHttpRedirection";

/// Builds the prolog of a verified rule. Implement this to add callback kinds.
pub trait CallbackFactory: Send + Sync {
  fn build(&self, rule: &Rule) -> Result<Arc<dyn Prolog>, RuleRejection>;
}

/// Callback kinds shipped with the agent.
pub struct NativeCallbacks {
  actors: Arc<ActorStore>,
}

impl NativeCallbacks {
  pub fn new(actors: Arc<ActorStore>) -> Self {
    Self { actors }
  }
}

impl CallbackFactory for NativeCallbacks {
  fn build(&self, rule: &Rule) -> Result<Arc<dyn Prolog>, RuleRejection> {
    match rule.hookpoint.callback.as_str() {
      IP_SECURITY_RESPONSE => Ok(Arc::new(IpSecurityResponse::new(self.actors.clone()))),
      USER_SECURITY_RESPONSE => Ok(Arc::new(UserSecurityResponse::new(self.actors.clone()))),
      WRITE_CUSTOM_ERROR_PAGE => Ok(Arc::new(CustomErrorPage::from_rule(rule)?)),
      WRITE_HTTP_REDIRECTION => Ok(Arc::new(HttpRedirection::from_rule(rule)?)),
      other => Err(RuleRejection::UnknownCallback(other.to_string())),
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DataEntry {
  CustomErrorPage { status_code: u16 },
  Redirection { redirection_url: String },
}

/// First entry of the rule data that decodes as a known entry type.
fn first_entry(rule: &Rule) -> Result<DataEntry, RuleRejection> {
  rule
    .data
    .values
    .iter()
    .find_map(|v| serde_json::from_value::<DataEntry>(v.clone()).ok())
    .ok_or_else(|| RuleRejection::InvalidData("no usable data entry".to_string()))
}

/// Replaces the status code of the default blocking response.
#[derive(Debug)]
pub struct CustomErrorPage {
  status_code: u16,
}

impl CustomErrorPage {
  fn from_rule(rule: &Rule) -> Result<Self, RuleRejection> {
    match first_entry(rule) {
      Ok(DataEntry::CustomErrorPage { status_code }) if (100..=599).contains(&status_code) => {
        Ok(Self { status_code })
      }
      Ok(DataEntry::CustomErrorPage { status_code }) => Err(RuleRejection::InvalidData(format!(
        "invalid status code {status_code}"
      ))),
      Ok(_) => Err(RuleRejection::InvalidData("expected a custom_error_page entry".to_string())),
      // No data: keep the default status.
      Err(_) if rule.data.values.is_empty() => Ok(Self { status_code: 0 }),
      Err(e) => Err(e),
    }
  }
}

impl Prolog for CustomErrorPage {
  fn signature(&self) -> HookSignature {
    HookSignature::BlockingResponse
  }

  fn on_entry(&self, ctx: &mut dyn ProtectionContext, _args: &HookArgs<'_>) -> PrologResult {
    if self.status_code != 0 {
      ctx.set_blocking_status(self.status_code);
    }
    Ok(None)
  }
}

/// Replaces the default blocking response with a redirection.
#[derive(Debug)]
pub struct HttpRedirection {
  url: String,
}

impl HttpRedirection {
  fn from_rule(rule: &Rule) -> Result<Self, RuleRejection> {
    match first_entry(rule)? {
      DataEntry::Redirection { redirection_url } if !redirection_url.trim().is_empty() => Ok(Self {
        url: redirection_url,
      }),
      _ => Err(RuleRejection::InvalidData("expected a redirection entry with a url".to_string())),
    }
  }
}

impl Prolog for HttpRedirection {
  fn signature(&self) -> HookSignature {
    HookSignature::BlockingResponse
  }

  fn on_entry(&self, ctx: &mut dyn ProtectionContext, _args: &HookArgs<'_>) -> PrologResult {
    crate::security_response::write_redirection(ctx, &self.url);
    Err(CallbackError::Abort(CallError::SecurityResponse))
  }
}
