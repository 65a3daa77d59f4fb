use crate::errors::ActorError;
use crate::types::now_unix_ms;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

/// User identifier attributes, e.g. `{"id": "42"}`.
pub type UserId = BTreeMap<String, String>;

/// Security action attached to an actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
  Block(BlockAction),
  Redirect(RedirectAction),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAction {
  pub action_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectAction {
  pub action_id: String,
  pub redirection_url: String,
}

impl BlockAction {
  pub fn new(action_id: impl Into<String>) -> Self {
    Self {
      action_id: action_id.into(),
    }
  }
}

impl RedirectAction {
  pub fn new(action_id: impl Into<String>, redirection_url: impl Into<String>) -> Self {
    Self {
      action_id: action_id.into(),
      redirection_url: redirection_url.into(),
    }
  }
}

impl Action {
  pub fn action_id(&self) -> &str {
    match self {
      Action::Block(b) => &b.action_id,
      Action::Redirect(r) => &r.action_id,
    }
  }
}

/// An address or a CIDR network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
  addr: IpAddr,
  prefix_len: u8,
}

impl IpNetwork {
  pub fn new(addr: IpAddr, prefix_len: u8) -> anyhow::Result<Self> {
    let addr = canonical(addr);
    let max = max_prefix(addr);
    if prefix_len > max {
      anyhow::bail!("prefix length {prefix_len} exceeds {max} for {addr}");
    }
    Ok(Self {
      addr: mask(addr, prefix_len),
      prefix_len,
    })
  }

  pub fn host(addr: IpAddr) -> Self {
    let addr = canonical(addr);
    Self {
      addr,
      prefix_len: max_prefix(addr),
    }
  }

  pub fn prefix_len(&self) -> u8 {
    self.prefix_len
  }

  pub fn contains(&self, ip: IpAddr) -> bool {
    let ip = canonical(ip);
    if ip.is_ipv4() != self.addr.is_ipv4() {
      return false;
    }
    mask(ip, self.prefix_len) == self.addr
  }
}

impl FromStr for IpNetwork {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> anyhow::Result<Self> {
    let s = s.trim();
    match s.split_once('/') {
      Some((addr, len)) => {
        let addr: IpAddr = addr.parse().with_context(|| format!("parse address `{addr}`"))?;
        let len: u8 = len.parse().with_context(|| format!("parse prefix length `{len}`"))?;
        IpNetwork::new(addr, len)
      }
      None => {
        let addr: IpAddr = s.parse().with_context(|| format!("parse address `{s}`"))?;
        Ok(IpNetwork::host(addr))
      }
    }
  }
}

fn canonical(ip: IpAddr) -> IpAddr {
  match ip {
    IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
    v4 => v4,
  }
}

fn max_prefix(ip: IpAddr) -> u8 {
  if ip.is_ipv4() {
    32
  } else {
    128
  }
}

fn mask(ip: IpAddr, prefix_len: u8) -> IpAddr {
  match ip {
    IpAddr::V4(v4) => {
      let bits = u32::from(v4);
      let m = if prefix_len == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix_len)) };
      IpAddr::V4(Ipv4Addr::from(bits & m))
    }
    IpAddr::V6(v6) => {
      let bits = u128::from(v6);
      let m = if prefix_len == 0 { 0 } else { u128::MAX << (128 - u32::from(prefix_len)) };
      IpAddr::V6(Ipv6Addr::from(bits & m))
    }
  }
}

#[derive(Debug, Clone)]
struct Entry {
  action: Action,
  expires_at_unix_ms: Option<u64>,
}

impl Entry {
  fn is_live(&self, now_ms: u64) -> bool {
    self.expires_at_unix_ms.map(|t| now_ms < t).unwrap_or(true)
  }
}

/// Immutable snapshot of the IP and user action lists.
#[derive(Debug, Clone, Default)]
pub struct ActorTable {
  // Longest prefix first.
  networks: Vec<(IpNetwork, Entry)>,
  users: HashMap<UserId, Entry>,
}

impl ActorTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_ip(&mut self, network: IpNetwork, action: Action, expires_at_unix_ms: Option<u64>) {
    let at = self
      .networks
      .partition_point(|(n, _)| n.prefix_len() >= network.prefix_len());
    self.networks.insert(
      at,
      (
        network,
        Entry {
          action,
          expires_at_unix_ms,
        },
      ),
    );
  }

  pub fn add_user(&mut self, user: UserId, action: Action, expires_at_unix_ms: Option<u64>) {
    self.users.insert(
      user,
      Entry {
        action,
        expires_at_unix_ms,
      },
    );
  }

  pub fn ip_entries(&self) -> usize {
    self.networks.len()
  }

  pub fn user_entries(&self) -> usize {
    self.users.len()
  }

  pub fn find_by_ip(&self, ip: IpAddr, now_ms: u64) -> Option<&Action> {
    self
      .networks
      .iter()
      .find(|(n, e)| n.contains(ip) && e.is_live(now_ms))
      .map(|(_, e)| &e.action)
  }

  pub fn find_by_user(&self, user: &UserId, now_ms: u64) -> Option<&Action> {
    self
      .users
      .get(user)
      .filter(|e| e.is_live(now_ms))
      .map(|e| &e.action)
  }

  /// Build a table from the backend's security-action list. Entries that cannot
  /// be understood are skipped.
  pub fn from_security_actions(actions: &[SecurityAction], now_ms: u64) -> Self {
    let mut table = Self::new();
    for sa in actions {
      if let Err(e) = table.add_security_action(sa, now_ms) {
        tracing::warn!(action_id = %sa.action_id, error = %e, "skipping security action");
      }
    }
    table
  }

  fn add_security_action(&mut self, sa: &SecurityAction, now_ms: u64) -> anyhow::Result<()> {
    let expires = sa
      .duration
      .filter(|d| *d > 0.0)
      .map(|d| now_ms.saturating_add((d * 1000.0) as u64));

    let action = match sa.action.as_str() {
      "block_ip" | "block_user" => Action::Block(BlockAction::new(&sa.action_id)),
      "redirect_ip" | "redirect_user" => {
        let Some(url) = sa.parameters.url.as_deref().filter(|u| !u.trim().is_empty()) else {
          anyhow::bail!("redirection action without url");
        };
        Action::Redirect(RedirectAction::new(&sa.action_id, url))
      }
      other => anyhow::bail!("unsupported action `{other}`"),
    };

    if sa.action.ends_with("_ip") {
      if sa.parameters.ip_cidr.is_empty() {
        anyhow::bail!("ip action without ip_cidr");
      }
      // All-or-nothing: one bad network drops the whole action.
      let networks = sa
        .parameters
        .ip_cidr
        .iter()
        .map(|cidr| cidr.parse::<IpNetwork>().with_context(|| format!("invalid ip_cidr `{cidr}`")))
        .collect::<anyhow::Result<Vec<_>>>()?;
      for network in networks {
        self.add_ip(network, action.clone(), expires);
      }
    } else {
      if sa.parameters.users.is_empty() {
        anyhow::bail!("user action without users");
      }
      for user in &sa.parameters.users {
        self.add_user(user.clone(), action.clone(), expires);
      }
    }
    Ok(())
  }
}

/// Security action as distributed by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAction {
  pub action_id: String,
  pub action: String,
  /// Lifetime in seconds. Absent or non-positive means no expiry.
  #[serde(default)]
  pub duration: Option<f64>,
  #[serde(default)]
  pub parameters: SecurityActionParameters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityActionParameters {
  #[serde(default)]
  pub ip_cidr: Vec<String>,
  #[serde(default)]
  pub users: Vec<UserId>,
  #[serde(default)]
  pub url: Option<String>,
}

pub fn parse_security_actions(json: &[u8]) -> anyhow::Result<ActorTable> {
  let actions: Vec<SecurityAction> =
    serde_json::from_slice(json).context("parse security actions JSON")?;
  Ok(ActorTable::from_security_actions(&actions, now_unix_ms()))
}

/// Concurrently readable actor table, replaced wholesale by the updater.
#[derive(Debug, Default)]
pub struct ActorStore {
  table: RwLock<Arc<ActorTable>>,
}

impl ActorStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_table(table: ActorTable) -> Self {
    Self {
      table: RwLock::new(Arc::new(table)),
    }
  }

  pub fn replace(&self, table: ActorTable) {
    let next = Arc::new(table);
    tracing::info!(
      ip_entries = next.ip_entries(),
      user_entries = next.user_entries(),
      "actor table replaced"
    );
    let mut guard = self.table.write().unwrap_or_else(|e| e.into_inner());
    *guard = next;
  }

  /// Readers hold the lock only long enough to clone the pointer.
  pub fn snapshot(&self) -> Arc<ActorTable> {
    self.table.read().unwrap_or_else(|e| e.into_inner()).clone()
  }

  pub fn find_action_by_ip(&self, ip: IpAddr) -> Result<Option<Action>, ActorError> {
    if ip.is_unspecified() {
      return Err(ActorError::InvalidAddress(ip));
    }
    Ok(self.snapshot().find_by_ip(ip, now_unix_ms()).cloned())
  }

  pub fn find_action_by_user_id(&self, user: &UserId) -> Option<Action> {
    self.snapshot().find_by_user(user, now_unix_ms()).cloned()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
  }

  fn user(id: &str) -> UserId {
    [("id".to_string(), id.to_string())].into_iter().collect()
  }

  #[test]
  fn longest_prefix_wins() {
    let mut t = ActorTable::new();
    t.add_ip("10.0.0.0/8".parse().unwrap(), Action::Block(BlockAction::new("wide")), None);
    t.add_ip(
      "10.1.2.0/24".parse().unwrap(),
      Action::Redirect(RedirectAction::new("narrow", "https://example.com")),
      None,
    );

    assert_eq!(t.find_by_ip(ip("10.1.2.3"), 0).unwrap().action_id(), "narrow");
    assert_eq!(t.find_by_ip(ip("10.9.9.9"), 0).unwrap().action_id(), "wide");
    assert!(t.find_by_ip(ip("192.168.0.1"), 0).is_none());
  }

  #[test]
  fn ipv4_mapped_addresses_match_ipv4_entries() {
    let mut t = ActorTable::new();
    t.add_ip(IpNetwork::host(ip("192.0.2.1")), Action::Block(BlockAction::new("a")), None);
    assert!(t.find_by_ip(ip("::ffff:192.0.2.1"), 0).is_some());
    assert!(t.find_by_ip(ip("2001:db8::1"), 0).is_none());
  }

  #[test]
  fn expired_entries_do_not_match() {
    let mut t = ActorTable::new();
    t.add_user(user("42"), Action::Block(BlockAction::new("a")), Some(1_000));
    assert!(t.find_by_user(&user("42"), 999).is_some());
    assert!(t.find_by_user(&user("42"), 1_000).is_none());
  }

  #[test]
  fn invalid_networks_are_rejected() {
    assert!("10.0.0.0/33".parse::<IpNetwork>().is_err());
    assert!("not-an-ip".parse::<IpNetwork>().is_err());
    assert!("2001:db8::/32".parse::<IpNetwork>().is_ok());
  }

  #[test]
  fn security_actions_build_table_and_skip_malformed() {
    let json = br#"[
      {"action_id": "a1", "action": "block_ip", "parameters": {"ip_cidr": ["198.51.100.0/24"]}},
      {"action_id": "a2", "action": "redirect_user", "duration": 3600,
       "parameters": {"users": [{"id": "42"}], "url": "https://example.com/bye"}},
      {"action_id": "a3", "action": "redirect_ip", "parameters": {"ip_cidr": ["1.2.3.4"]}},
      {"action_id": "a4", "action": "raise_alarm"}
    ]"#;
    let t = parse_security_actions(json).unwrap();
    assert_eq!(t.ip_entries(), 1);
    assert_eq!(t.user_entries(), 1);

    let now = now_unix_ms();
    assert!(matches!(t.find_by_ip(ip("198.51.100.7"), now), Some(Action::Block(_))));
    match t.find_by_user(&user("42"), now) {
      Some(Action::Redirect(r)) => assert_eq!(r.redirection_url, "https://example.com/bye"),
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn action_with_a_bad_network_is_skipped_whole() {
    let json = br#"[
      {"action_id": "a1", "action": "block_ip",
       "parameters": {"ip_cidr": ["198.51.100.0/24", "bogus"]}},
      {"action_id": "a2", "action": "block_ip", "parameters": {"ip_cidr": ["192.0.2.9"]}}
    ]"#;
    let t = parse_security_actions(json).unwrap();
    assert_eq!(t.ip_entries(), 1);
    assert!(t.find_by_ip(ip("198.51.100.4"), now_unix_ms()).is_none());
    assert_eq!(t.find_by_ip(ip("192.0.2.9"), now_unix_ms()).unwrap().action_id(), "a2");
  }

  #[test]
  fn store_rejects_unspecified_addresses() {
    let store = ActorStore::new();
    assert_eq!(
      store.find_action_by_ip(ip("0.0.0.0")),
      Err(ActorError::InvalidAddress(ip("0.0.0.0")))
    );
    assert_eq!(store.find_action_by_ip(ip("192.0.2.1")), Ok(None));
  }

  #[test]
  fn replacement_is_whole_table() {
    let store = ActorStore::new();
    let mut t = ActorTable::new();
    t.add_user(user("1"), Action::Block(BlockAction::new("old")), None);
    store.replace(t);
    let before = store.snapshot();

    let mut t = ActorTable::new();
    t.add_user(user("2"), Action::Block(BlockAction::new("new")), None);
    store.replace(t);

    assert!(before.find_by_user(&user("1"), 0).is_some());
    assert!(store.find_action_by_user_id(&user("1")).is_none());
    assert!(store.find_action_by_user_id(&user("2")).is_some());
  }
}
