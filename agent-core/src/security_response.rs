//! IP and user security responses.
//!
//! Both callbacks consult the actor store when their hookpoint is reached. A
//! match records the corresponding event, writes the substitute response and
//! reports [`CallError::SecurityResponse`] to the HTTP layer.

use crate::actor::{Action, ActorStore, UserId};
use crate::errors::{CallError, CallResult, CallbackError};
use crate::events::{
  EventProperties, TrackedEvent, BLOCK_IP_EVENT, BLOCK_USER_EVENT, REDIRECT_IP_EVENT,
  REDIRECT_USER_EVENT,
};
use crate::hook::{Epilog, HookArgs, HookSignature, Prolog, PrologResult};
use crate::protection::ProtectionContext;
use std::net::IpAddr;
use std::sync::Arc;

pub const REDIRECT_STATUS: u16 = 303;

/// Write a 303 redirection to `url`.
pub fn write_redirection(ctx: &mut dyn ProtectionContext, url: &str) {
  let w = ctx.response_writer();
  w.set_header("Location", url);
  w.write_header(REDIRECT_STATUS);
}

/// Request-start callback matching the client address.
pub struct IpSecurityResponse {
  actors: Arc<ActorStore>,
}

impl IpSecurityResponse {
  pub fn new(actors: Arc<ActorStore>) -> Self {
    Self { actors }
  }
}

impl Prolog for IpSecurityResponse {
  fn signature(&self) -> HookSignature {
    HookSignature::RequestStart
  }

  fn on_entry(&self, ctx: &mut dyn ProtectionContext, _args: &HookArgs<'_>) -> PrologResult {
    let ip = ctx.client_ip();
    let action = self
      .actors
      .find_action_by_ip(ip)
      .map_err(|e| CallbackError::keyed("security_response.ip.lookup", e))?;
    Ok(action.map(|action| Box::new(IpResponse { ip, action }) as Box<dyn Epilog>))
  }
}

struct IpResponse {
  ip: IpAddr,
  action: Action,
}

impl Epilog for IpResponse {
  fn on_exit(self: Box<Self>, ctx: &mut dyn ProtectionContext, result: &mut CallResult) {
    let properties = EventProperties::for_ip(&self.action, self.ip);
    tracing::info!(
      ip = %self.ip,
      action_id = %self.action.action_id(),
      "ip security response"
    );
    match &self.action {
      Action::Redirect(r) => {
        ctx.track_event(TrackedEvent::new(REDIRECT_IP_EVENT).with_properties(properties));
        write_redirection(ctx, &r.redirection_url);
      }
      Action::Block(_) => {
        ctx.track_event(TrackedEvent::new(BLOCK_IP_EVENT).with_properties(properties));
        ctx.write_default_blocking_response();
      }
    }
    *result = Err(CallError::SecurityResponse);
  }
}

/// User-identification callback matching the identified user.
pub struct UserSecurityResponse {
  actors: Arc<ActorStore>,
}

impl UserSecurityResponse {
  pub fn new(actors: Arc<ActorStore>) -> Self {
    Self { actors }
  }
}

impl Prolog for UserSecurityResponse {
  fn signature(&self) -> HookSignature {
    HookSignature::IdentifyUser
  }

  fn on_entry(&self, _ctx: &mut dyn ProtectionContext, args: &HookArgs<'_>) -> PrologResult {
    let HookArgs::IdentifyUser { user_id } = args else {
      return Err(CallbackError::keyed(
        "security_response.user.args",
        anyhow::anyhow!("expected user identification arguments, got {:?}", args.signature()),
      ));
    };
    let action = self.actors.find_action_by_user_id(user_id);
    Ok(action.map(|action| {
      Box::new(UserResponse {
        user: (*user_id).clone(),
        action,
      }) as Box<dyn Epilog>
    }))
  }
}

struct UserResponse {
  user: UserId,
  action: Action,
}

impl Epilog for UserResponse {
  fn on_exit(self: Box<Self>, ctx: &mut dyn ProtectionContext, result: &mut CallResult) {
    let properties = EventProperties::for_user(&self.action, &self.user);
    tracing::info!(action_id = %self.action.action_id(), "user security response");
    // Protection may already be under way for this request; close it before
    // writing the response.
    match &self.action {
      Action::Redirect(r) => {
        ctx.handle_attack(false);
        ctx.track_event(TrackedEvent::new(REDIRECT_USER_EVENT).with_properties(properties));
        write_redirection(ctx, &r.redirection_url);
      }
      Action::Block(_) => {
        ctx.track_event(TrackedEvent::new(BLOCK_USER_EVENT).with_properties(properties));
        ctx.handle_attack(true);
      }
    }
    *result = Err(CallError::SecurityResponse);
  }
}
