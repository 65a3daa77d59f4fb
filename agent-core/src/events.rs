use crate::actor::{Action, UserId};
use crate::types::now_unix_ms;
use serde::Serialize;
use std::net::IpAddr;

pub const BLOCK_IP_EVENT: &str = "agent.action.block_ip";
pub const BLOCK_USER_EVENT: &str = "agent.action.block_user";
pub const REDIRECT_IP_EVENT: &str = "agent.action.redirect_ip";
pub const REDIRECT_USER_EVENT: &str = "agent.action.redirect_user";

/// A named event recorded on a protection context, shipped by the backend layer.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedEvent {
  pub event_id: String,
  pub name: String,
  pub timestamp_unix_ms: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub properties: Option<EventProperties>,
}

impl TrackedEvent {
  pub fn new(name: &str) -> Self {
    Self {
      event_id: uuid::Uuid::new_v4().to_string(),
      name: name.to_string(),
      timestamp_unix_ms: now_unix_ms(),
      properties: None,
    }
  }

  pub fn with_properties(mut self, properties: EventProperties) -> Self {
    self.properties = Some(properties);
    self
  }
}

/// Properties of the security-response events. Serialized as
/// `{"action_id": ..., "output": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EventProperties {
  BlockedIp {
    action_id: String,
    output: IpOutput,
  },
  BlockedUser {
    action_id: String,
    output: UserOutput,
  },
  RedirectedIp {
    action_id: String,
    output: RedirectedIpOutput,
  },
  RedirectedUser {
    action_id: String,
    output: RedirectedUserOutput,
  },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpOutput {
  pub ip_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserOutput {
  pub user: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedirectedIpOutput {
  pub ip_address: String,
  pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedirectedUserOutput {
  pub user: UserId,
  pub url: String,
}

impl EventProperties {
  /// Properties for an IP-based response, chosen by the action variant.
  pub fn for_ip(action: &Action, ip: IpAddr) -> Self {
    let ip_address = ip.to_string();
    match action {
      Action::Redirect(r) => EventProperties::RedirectedIp {
        action_id: r.action_id.clone(),
        output: RedirectedIpOutput {
          ip_address,
          url: r.redirection_url.clone(),
        },
      },
      Action::Block(b) => EventProperties::BlockedIp {
        action_id: b.action_id.clone(),
        output: IpOutput { ip_address },
      },
    }
  }

  pub fn for_user(action: &Action, user: &UserId) -> Self {
    match action {
      Action::Redirect(r) => EventProperties::RedirectedUser {
        action_id: r.action_id.clone(),
        output: RedirectedUserOutput {
          user: user.clone(),
          url: r.redirection_url.clone(),
        },
      },
      Action::Block(b) => EventProperties::BlockedUser {
        action_id: b.action_id.clone(),
        output: UserOutput { user: user.clone() },
      },
    }
  }

  pub fn action_id(&self) -> &str {
    match self {
      EventProperties::BlockedIp { action_id, .. }
      | EventProperties::BlockedUser { action_id, .. }
      | EventProperties::RedirectedIp { action_id, .. }
      | EventProperties::RedirectedUser { action_id, .. } => action_id,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::actor::{BlockAction, RedirectAction};
  use serde_json::json;

  #[test]
  fn redirected_user_wire_shape() {
    let action = Action::Redirect(RedirectAction::new("a1", "https://example.com/denied"));
    let user: UserId = [("id".to_string(), "42".to_string())].into_iter().collect();
    let value = serde_json::to_value(EventProperties::for_user(&action, &user)).unwrap();
    assert_eq!(
      value,
      json!({
        "action_id": "a1",
        "output": { "user": { "id": "42" }, "url": "https://example.com/denied" }
      })
    );
  }

  #[test]
  fn blocked_ip_wire_shape() {
    let action = Action::Block(BlockAction::new("b7"));
    let ip: IpAddr = "203.0.113.9".parse().unwrap();
    let value = serde_json::to_value(EventProperties::for_ip(&action, ip)).unwrap();
    assert_eq!(
      value,
      json!({ "action_id": "b7", "output": { "ip_address": "203.0.113.9" } })
    );
  }

  #[test]
  fn tracked_event_omits_missing_properties() {
    let value = serde_json::to_value(TrackedEvent::new(BLOCK_IP_EVENT)).unwrap();
    assert_eq!(value["name"], BLOCK_IP_EVENT);
    assert!(value.get("properties").is_none());
  }
}
