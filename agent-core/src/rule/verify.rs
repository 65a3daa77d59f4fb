use super::schema::{Rule, RuleSignature};
use crate::errors::RuleRejection;
use anyhow::Context;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use sha2::{Digest, Sha512};

/// Verifies rule signatures against the process-wide rule signing key.
///
/// Signatures are ECDSA P-256 over the SHA-512 digest of the message, carried
/// as standard base64 of the ASN.1 DER `(r, s)` sequence.
#[derive(Debug, Clone)]
pub struct RuleVerifier {
  key: Option<VerifyingKey>,
}

impl RuleVerifier {
  pub fn new(key: VerifyingKey) -> Self {
    Self { key: Some(key) }
  }

  /// A verifier with no key rejects every rule.
  pub fn without_key() -> Self {
    Self { key: None }
  }

  pub fn from_encoded(text: &str) -> anyhow::Result<Self> {
    Ok(Self::new(decode_public_key(text)?))
  }

  /// Whether the rule carries a valid signature. The signed message is not
  /// compared with the rule; see [`RuleVerifier::authenticate`].
  pub fn verify(&self, rule: &Rule) -> bool {
    self.check(&rule.signature).is_ok()
  }

  /// Signature check, then binding of the signed message to the rule name.
  pub fn authenticate(&self, rule: &Rule) -> Result<(), RuleRejection> {
    self.check(&rule.signature)?;
    if !message_matches_rule(&rule.signature.message, rule) {
      return Err(RuleRejection::MessageMismatch);
    }
    Ok(())
  }

  pub fn check(&self, signature: &RuleSignature) -> Result<(), RuleRejection> {
    let Some(key) = &self.key else {
      return Err(RuleRejection::InvalidSignature("no rule signing key configured".to_string()));
    };
    if signature.message.is_empty() {
      return Err(RuleRejection::InvalidSignature("empty message".to_string()));
    }
    if signature.value.trim().is_empty() {
      return Err(RuleRejection::InvalidSignature("empty signature value".to_string()));
    }

    let raw = STANDARD
      .decode(signature.value.trim().as_bytes())
      .map_err(|e| RuleRejection::InvalidSignature(format!("decode base64: {e}")))?;
    let sig = Signature::from_der(&raw)
      .map_err(|e| RuleRejection::InvalidSignature(format!("decode DER signature: {e}")))?;

    let digest = Sha512::digest(signature.message.as_bytes());
    key
      .verify_prehash(&digest, &sig)
      .map_err(|e| RuleRejection::InvalidSignature(e.to_string()))
  }
}

/// The signed message must be the JSON envelope naming this rule.
pub fn message_matches_rule(message: &str, rule: &Rule) -> bool {
  #[derive(serde::Deserialize)]
  struct Envelope {
    name: String,
  }

  serde_json::from_str::<Envelope>(message)
    .map(|e| e.name == rule.name)
    .unwrap_or(false)
}

/// Canonical signed message of a rule.
pub fn canonical_message(rule_name: &str) -> String {
  serde_json::json!({ "name": rule_name }).to_string()
}

/// Accepts a PEM `PUBLIC KEY` block, or standard or URL-safe (unpadded)
/// base64 of a SEC1-encoded P-256 point.
pub fn decode_public_key(text: &str) -> anyhow::Result<VerifyingKey> {
  let text = text.trim();
  if text.is_empty() {
    anyhow::bail!("public key is empty");
  }
  if text.starts_with("-----BEGIN") {
    return VerifyingKey::from_public_key_pem(text)
      .map_err(|e| anyhow::anyhow!("parse PEM public key: {e}"));
  }
  let raw = STANDARD
    .decode(text.as_bytes())
    .or_else(|_| URL_SAFE_NO_PAD.decode(text.as_bytes()))
    .context("decode public key base64")?;
  VerifyingKey::from_sec1_bytes(&raw)
    .map_err(|_| anyhow::anyhow!("public key is not a SEC1 P-256 point ({} bytes)", raw.len()))
}

/// Standard base64 of the uncompressed SEC1 point, as read by
/// [`decode_public_key`].
pub fn encode_public_key(key: &VerifyingKey) -> String {
  STANDARD.encode(key.to_encoded_point(false).as_bytes())
}

/// Sign `message` the way rule packs are signed.
pub fn sign_message(key: &SigningKey, message: &str) -> anyhow::Result<RuleSignature> {
  let digest = Sha512::digest(message.as_bytes());
  let sig: Signature = key
    .sign_prehash(&digest)
    .map_err(|e| anyhow::anyhow!("sign rule message: {e}"))?;
  Ok(RuleSignature {
    message: message.to_string(),
    value: STANDARD.encode(sig.to_der().as_bytes()),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::rule::schema::{Hookpoint, RuleData};

  fn key() -> SigningKey {
    SigningKey::from_slice(&[7u8; 32]).unwrap()
  }

  fn rule(name: &str) -> Rule {
    Rule {
      name: name.to_string(),
      hookpoint: Hookpoint {
        class: "http".to_string(),
        method: "start".to_string(),
        callback: "IPSecurityResponse".to_string(),
      },
      data: RuleData::default(),
      signature: RuleSignature::default(),
    }
  }

  fn signed(name: &str, signature: RuleSignature) -> Rule {
    Rule {
      signature,
      ..rule(name)
    }
  }

  #[test]
  fn valid_signature_verifies() {
    let sk = key();
    let v = RuleVerifier::new(VerifyingKey::from(&sk));
    let sig = sign_message(&sk, r#"{"name":"a valid rule"}"#).unwrap();
    assert!(v.verify(&signed("a valid rule", sig)));
  }

  #[test]
  fn signature_is_der_in_standard_base64() {
    let sig = sign_message(&key(), r#"{"name":"r"}"#).unwrap();
    let raw = STANDARD.decode(&sig.value).unwrap();
    // SEQUENCE { INTEGER r, INTEGER s }
    assert_eq!(raw[0], 0x30);
    assert_eq!(raw[1] as usize, raw.len() - 2);
    assert!(Signature::from_der(&raw).is_ok());
  }

  #[test]
  fn malformed_or_mismatched_signatures_are_rejected() {
    let sk = key();
    let v = RuleVerifier::new(VerifyingKey::from(&sk));
    let good = sign_message(&sk, r#"{"name":"a valid rule"}"#).unwrap();
    let fixed = Signature::from_der(&STANDARD.decode(&good.value).unwrap()).unwrap();

    let cases = [
      RuleSignature::default(),
      RuleSignature {
        message: good.message.clone(),
        value: String::new(),
      },
      RuleSignature {
        message: String::new(),
        value: good.value.clone(),
      },
      RuleSignature {
        message: "wrong message".to_string(),
        value: good.value.clone(),
      },
      RuleSignature {
        message: good.message.clone(),
        value: "wrong value".to_string(),
      },
      RuleSignature {
        message: good.message.clone(),
        value: STANDARD.encode([0u8; 64]),
      },
      // Fixed-width r||s is not the wire encoding.
      RuleSignature {
        message: good.message.clone(),
        value: STANDARD.encode(fixed.to_bytes()),
      },
    ];
    for sig in cases {
      let r = signed("a valid rule", sig);
      assert!(!v.verify(&r), "accepted {:?}", r.signature);
    }
  }

  #[test]
  fn other_key_is_rejected() {
    let other = SigningKey::from_slice(&[9u8; 32]).unwrap();
    let v = RuleVerifier::new(VerifyingKey::from(&other));
    let r = signed("r", sign_message(&key(), r#"{"name":"r"}"#).unwrap());
    assert!(!v.verify(&r));
    assert!(!RuleVerifier::without_key().verify(&r));
  }

  #[test]
  fn authenticate_binds_the_message_to_the_rule() {
    let sk = key();
    let v = RuleVerifier::new(VerifyingKey::from(&sk));
    let sig = sign_message(&sk, &canonical_message("r1")).unwrap();

    assert_eq!(v.authenticate(&signed("r1", sig.clone())), Ok(()));
    let moved = signed("r2", sig);
    assert!(v.verify(&moved));
    assert_eq!(v.authenticate(&moved), Err(RuleRejection::MessageMismatch));
    assert!(matches!(
      RuleVerifier::without_key().authenticate(&rule("r1")),
      Err(RuleRejection::InvalidSignature(_))
    ));
  }

  #[test]
  fn message_binding_checks_the_rule_name() {
    assert!(message_matches_rule(r#"{"name":"r1"}"#, &rule("r1")));
    assert!(message_matches_rule(&canonical_message("r1"), &rule("r1")));
    assert!(!message_matches_rule(r#"{"name":"r2"}"#, &rule("r1")));
    assert!(!message_matches_rule("not json", &rule("r1")));
  }

  #[test]
  fn public_key_decodes_from_sec1_base64_and_pem() {
    use p256::pkcs8::{EncodePublicKey, LineEnding};

    let vk = VerifyingKey::from(&key());
    let point = vk.to_encoded_point(false);
    assert_eq!(decode_public_key(&encode_public_key(&vk)).unwrap(), vk);
    assert_eq!(decode_public_key(&URL_SAFE_NO_PAD.encode(point.as_bytes())).unwrap(), vk);
    let compressed = STANDARD.encode(vk.to_encoded_point(true).as_bytes());
    assert_eq!(decode_public_key(&compressed).unwrap(), vk);

    let pem = vk.to_public_key_pem(LineEnding::LF).unwrap();
    assert_eq!(decode_public_key(&pem).unwrap(), vk);

    assert!(decode_public_key("").is_err());
    assert!(decode_public_key("AAAA").is_err());
    assert!(decode_public_key(&STANDARD.encode([7u8; 32])).is_err());
  }
}
