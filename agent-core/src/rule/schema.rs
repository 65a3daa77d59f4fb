use serde::{Deserialize, Serialize};

/// A signed rule set as distributed by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulePack {
  pub pack_id: String,
  #[serde(default)]
  pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
  pub name: String,
  pub hookpoint: Hookpoint,
  #[serde(default)]
  pub data: RuleData,
  #[serde(default)]
  pub signature: RuleSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hookpoint {
  pub class: String,
  pub method: String,
  /// Callback kind, e.g. `IPSecurityResponse`.
  pub callback: String,
}

/// Ordered callback configuration entries. Each callback kind decodes the
/// entries it understands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleData {
  #[serde(default)]
  pub values: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSignature {
  /// Signed message: the canonical JSON envelope of the rule, `{"name":"..."}`.
  #[serde(default)]
  pub message: String,
  /// Base64 signature over `message`.
  #[serde(default)]
  pub value: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pack_parses_with_optional_fields_missing() {
    let json = br#"{
      "pack_id": "p1",
      "rules": [
        {"name": "r", "hookpoint": {"class": "http", "method": "start", "callback": "IPSecurityResponse"}}
      ]
    }"#;
    let pack: RulePack = serde_json::from_slice(json).unwrap();
    assert_eq!(pack.pack_id, "p1");
    assert_eq!(pack.rules.len(), 1);
    assert!(pack.rules[0].data.values.is_empty());
    assert_eq!(pack.rules[0].signature, RuleSignature::default());
  }
}
