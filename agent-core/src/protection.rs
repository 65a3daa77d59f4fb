use crate::config::ProtectionConfig;
use crate::events::TrackedEvent;
use crate::hook::{Hook, HookArgs};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Live HTTP response of a request.
pub trait ResponseWriter {
  /// Set a header, replacing any previous value of the same name. Has no
  /// effect once the status is written.
  fn set_header(&mut self, name: &str, value: &str);
  fn write_header(&mut self, status: u16);
  fn write(&mut self, body: &[u8]);
}

/// Per-request state owned by the HTTP protection layer. Callbacks only borrow
/// it for the duration of a prolog or epilog.
pub trait ProtectionContext {
  fn client_ip(&self) -> IpAddr;

  fn track_event(&mut self, event: TrackedEvent);

  fn write_default_blocking_response(&mut self);

  /// Status the default blocking response is written with.
  fn blocking_status(&self) -> u16;

  /// Replace the status of the default blocking response of this request.
  fn set_blocking_status(&mut self, status: u16);

  fn response_writer(&mut self) -> &mut dyn ResponseWriter;

  /// Close the attack bookkeeping of the request. When `blocked`, the default
  /// blocking response is written and no further protection runs.
  fn handle_attack(&mut self, blocked: bool);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingResponse {
  pub status: u16,
  pub content_type: String,
  pub body: String,
}

impl Default for BlockingResponse {
  fn default() -> Self {
    Self::from(&ProtectionConfig::default())
  }
}

impl From<&ProtectionConfig> for BlockingResponse {
  fn from(cfg: &ProtectionConfig) -> Self {
    Self {
      status: cfg.blocking_status,
      content_type: cfg.blocking_content_type.clone(),
      body: cfg.blocking_body.clone(),
    }
  }
}

/// Response recorded in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordedResponse {
  pub status: Option<u16>,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl RecordedResponse {
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn is_committed(&self) -> bool {
    self.status.is_some()
  }
}

impl ResponseWriter for RecordedResponse {
  fn set_header(&mut self, name: &str, value: &str) {
    if self.status.is_some() {
      tracing::debug!(header = name, "response already committed; ignoring header");
      return;
    }
    self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    self.headers.push((name.to_string(), value.to_string()));
  }

  fn write_header(&mut self, status: u16) {
    if self.status.is_some() {
      tracing::debug!(status, "response status already written; ignoring");
      return;
    }
    self.status = Some(status);
  }

  fn write(&mut self, body: &[u8]) {
    if self.status.is_none() {
      self.status = Some(200);
    }
    self.body.extend_from_slice(body);
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttackOutcome {
  pub blocked: bool,
}

/// Reference protection context: records events and the response in memory.
/// The default blocking response goes through `blocking_hook` when one is set,
/// so blocking-page rules can replace it.
#[derive(Debug)]
pub struct RequestContext {
  client_ip: IpAddr,
  blocking: BlockingResponse,
  blocking_hook: Option<Arc<Hook>>,
  response: RecordedResponse,
  events: Vec<TrackedEvent>,
  attack: Option<AttackOutcome>,
}

impl RequestContext {
  pub fn new(client_ip: IpAddr, blocking: BlockingResponse) -> Self {
    Self {
      client_ip,
      blocking,
      blocking_hook: None,
      response: RecordedResponse::default(),
      events: Vec::new(),
      attack: None,
    }
  }

  pub fn with_blocking_hook(mut self, hook: Arc<Hook>) -> Self {
    self.blocking_hook = Some(hook);
    self
  }

  pub fn response(&self) -> &RecordedResponse {
    &self.response
  }

  pub fn events(&self) -> &[TrackedEvent] {
    &self.events
  }

  pub fn attack(&self) -> Option<AttackOutcome> {
    self.attack
  }
}

impl ProtectionContext for RequestContext {
  fn client_ip(&self) -> IpAddr {
    self.client_ip
  }

  fn track_event(&mut self, event: TrackedEvent) {
    tracing::info!(
      event = %event.name,
      event_id = %event.event_id,
      action_id = event.properties.as_ref().map(|p| p.action_id()).unwrap_or(""),
      "security event"
    );
    self.events.push(event);
  }

  fn write_default_blocking_response(&mut self) {
    let content_type = self.blocking.content_type.clone();
    let body = self.blocking.body.clone();
    let write = move |ctx: &mut dyn ProtectionContext| {
      // Read late: a blocking-page prolog may have replaced the status.
      let status = ctx.blocking_status();
      let w = ctx.response_writer();
      w.set_header("Content-Type", &content_type);
      w.write_header(status);
      w.write(body.as_bytes());
      Ok(())
    };

    let result = match self.blocking_hook.clone() {
      Some(hook) => hook.run(self, &HookArgs::BlockingResponse, write),
      None => write(self),
    };
    // A replaced blocking page reports the security response; the response is
    // written either way.
    if let Err(e) = result {
      if !e.is_security_response() {
        tracing::warn!(error = %e, "writing the blocking response failed");
      }
    }
  }

  fn blocking_status(&self) -> u16 {
    self.blocking.status
  }

  fn set_blocking_status(&mut self, status: u16) {
    self.blocking.status = status;
  }

  fn response_writer(&mut self) -> &mut dyn ResponseWriter {
    &mut self.response
  }

  fn handle_attack(&mut self, blocked: bool) {
    if self.attack.is_some() {
      return;
    }
    self.attack = Some(AttackOutcome { blocked });
    if blocked {
      self.write_default_blocking_response();
    }
  }
}

/// Headers commonly set by proxies and load balancers, in lookup order.
pub const DEFAULT_IP_HEADERS: &[&str] = &[
  "X-Forwarded-For",
  "X-Real-IP",
  "True-Client-IP",
  "X-Client-IP",
  "X-Forwarded",
  "X-Cluster-Client-IP",
  "Forwarded-For",
  "Fastly-Client-IP",
  "CF-Connecting-IP",
];

/// Resolve the client address of a request. The configured header wins when it
/// carries an address; otherwise the first global address found in the proxy
/// headers, then the first private one, then the remote address.
pub fn client_ip(remote_addr: IpAddr, headers: &[(String, String)], ip_header: Option<&str>) -> IpAddr {
  let header = |name: &str| {
    headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  };

  if let Some(name) = ip_header.filter(|n| !n.trim().is_empty()) {
    if let Some(ip) = header(name).and_then(|v| addresses(v).next()) {
      return ip;
    }
  }

  let mut private = None;
  for name in DEFAULT_IP_HEADERS {
    let Some(value) = header(name) else { continue };
    for ip in addresses(value) {
      if is_global(ip) {
        return ip;
      }
      private.get_or_insert(ip);
    }
  }

  if is_global(remote_addr) {
    return remote_addr;
  }
  private.unwrap_or(remote_addr)
}

fn addresses(value: &str) -> impl Iterator<Item = IpAddr> + '_ {
  value.split(',').filter_map(|part| parse_address(part.trim()))
}

fn parse_address(s: &str) -> Option<IpAddr> {
  if let Ok(ip) = s.parse::<IpAddr>() {
    return Some(ip);
  }
  s.parse::<SocketAddr>().ok().map(|a| a.ip())
}

fn is_global(ip: IpAddr) -> bool {
  match ip {
    IpAddr::V4(v4) => {
      let o = v4.octets();
      let shared = o[0] == 100 && (o[1] & 0xc0) == 64;
      !(v4.is_private()
        || v4.is_loopback()
        || v4.is_link_local()
        || v4.is_unspecified()
        || v4.is_broadcast()
        || shared)
    }
    IpAddr::V6(v6) => {
      if let Some(v4) = v6.to_ipv4_mapped() {
        return is_global(IpAddr::V4(v4));
      }
      let first = v6.segments()[0];
      let unique_local = (first & 0xfe00) == 0xfc00;
      let link_local = (first & 0xffc0) == 0xfe80;
      !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
    }
  }
}
