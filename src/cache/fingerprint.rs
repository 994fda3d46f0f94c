//! Deterministic request fingerprints for cache keying.
//!
//! A fingerprint is the SHA-256 digest of a canonicalized request:
//!
//! - `stream` is dropped (streaming never touches the cache anyway, but the
//!   flag must not split otherwise-identical requests);
//! - `temperature` / `top_p` are dropped when the policy ignores them;
//! - under `exact` keying, messages are sorted by `(role, canonical JSON)`;
//!   under `semantic` keying only user messages are retained, lowercased and
//!   whitespace-trimmed;
//! - the remaining object is serialized as canonical JSON: keys sorted
//!   lexicographically, no insignificant whitespace.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::chat::{ModelRequest, Role};

/// How requests are reduced to cache keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKeyStrategy {
    /// Full request content, order-normalized
    #[default]
    Exact,
    /// User messages only, lowercased and whitespace-trimmed
    Semantic,
}

/// Knobs that shape the fingerprint.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyPolicy {
    pub strategy: CacheKeyStrategy,
    pub ignore_temperature: bool,
    pub ignore_top_p: bool,
}

/// 256-bit cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Serialize a JSON value with lexicographically sorted object keys and no
/// insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            let mut first = true;
            for (key, val) in sorted {
                if !first {
                    out.push(',');
                }
                first = false;
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            let mut first = true;
            for item in items {
                if !first {
                    out.push(',');
                }
                first = false;
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            out.push_str(&serde_json::to_string(scalar).expect("scalar serializes"));
        }
    }
}

/// Compute the fingerprint of a request under `policy`.
pub fn fingerprint(req: &ModelRequest, policy: &KeyPolicy) -> Fingerprint {
    let mut value = serde_json::to_value(req).expect("request serializes");
    let object = value.as_object_mut().expect("request is a JSON object");

    object.remove("stream");
    if policy.ignore_temperature {
        object.remove("temperature");
    }
    if policy.ignore_top_p {
        object.remove("top_p");
    }

    let messages = match policy.strategy {
        CacheKeyStrategy::Exact => {
            let mut messages: Vec<Value> = object
                .remove("messages")
                .and_then(|m| m.as_array().cloned())
                .unwrap_or_default();
            messages.sort_by_key(|m| {
                let role = m
                    .get("role")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                (role, canonical_json(m))
            });
            Value::Array(messages)
        }
        CacheKeyStrategy::Semantic => {
            object.remove("messages");
            let user_texts: Vec<Value> = req
                .messages
                .iter()
                .filter(|m| m.role == Role::User)
                .map(|m| Value::String(m.text_content().to_lowercase().trim().to_string()))
                .collect();
            Value::Array(user_texts)
        }
    };
    object.insert("messages".to_string(), messages);

    let canonical = canonical_json(&value);
    let digest = Sha256::digest(canonical.as_bytes());
    Fingerprint(digest.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatMessage;

    fn request(content: &str) -> ModelRequest {
        ModelRequest::new(
            "anthropic/claude-3-opus",
            vec![ChatMessage::text(Role::User, content)],
        )
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = serde_json::json!({"b": 1, "a": {"z": true, "m": [1, 2]}});
        assert_eq!(canonical_json(&value), r#"{"a":{"m":[1,2],"z":true},"b":1}"#);
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let policy = KeyPolicy::default();
        let a = fingerprint(&request("Hello"), &policy);
        let b = fingerprint(&request("Hello"), &policy);
        assert_eq!(a, b);
        assert_ne!(a, fingerprint(&request("Goodbye"), &policy));
    }

    #[test]
    fn test_stream_flag_does_not_split_keys() {
        let policy = KeyPolicy::default();
        let plain = request("Hello");
        let mut streaming = request("Hello");
        streaming.stream = true;
        assert_eq!(fingerprint(&plain, &policy), fingerprint(&streaming, &policy));
    }

    #[test]
    fn test_ignore_temperature_policy() {
        let strict = KeyPolicy::default();
        let loose = KeyPolicy {
            ignore_temperature: true,
            ..Default::default()
        };
        let cold = request("Hello");
        let mut warm = request("Hello");
        warm.temperature = Some(1.5);

        assert_ne!(fingerprint(&cold, &strict), fingerprint(&warm, &strict));
        assert_eq!(fingerprint(&cold, &loose), fingerprint(&warm, &loose));
    }

    #[test]
    fn test_semantic_keying_normalizes_user_text() {
        let policy = KeyPolicy {
            strategy: CacheKeyStrategy::Semantic,
            ..Default::default()
        };
        let a = request("  What Is Rust?  ");
        let b = request("what is rust?");
        assert_eq!(fingerprint(&a, &policy), fingerprint(&b, &policy));

        // System messages are invisible to semantic keys
        let mut with_system = request("what is rust?");
        with_system
            .messages
            .insert(0, ChatMessage::text(Role::System, "Be terse."));
        assert_eq!(fingerprint(&b, &policy), fingerprint(&with_system, &policy));
    }

    #[test]
    fn test_exact_keying_sees_system_messages() {
        let policy = KeyPolicy::default();
        let plain = request("what is rust?");
        let mut with_system = request("what is rust?");
        with_system
            .messages
            .insert(0, ChatMessage::text(Role::System, "Be terse."));
        assert_ne!(fingerprint(&plain, &policy), fingerprint(&with_system, &policy));
    }

    #[test]
    fn test_hex_display() {
        let fp = fingerprint(&request("Hello"), &KeyPolicy::default());
        let hex = fp.to_string();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
