use sha2::{Digest, Sha256};

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let hash = hasher.finalize();
    hex_encode(&hash)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{:02x}", b).unwrap();
    }
    out
}

/// Deterministic serialization of a command's dispatch-relevant fields,
/// used as the idempotency key-hash input. Field order is fixed (not the
/// struct's declaration order) so the hash is stable across serde impl
/// changes.
pub fn canonical_command_payload(
    command_type: &str,
    target: &serde_json::Value,
    args: &serde_json::Value,
    timeout_ms: u64,
) -> String {
    let canon = serde_json::json!({
        "type": command_type,
        "target": target,
        "args": args,
        "timeout_ms": timeout_ms,
    });
    canon.to_string()
}

pub fn idempotency_key_hash(idempotency_key: &str, canonical_payload: &str) -> String {
    let joined = format!("{}:{}", idempotency_key, canonical_payload);
    sha256_hex(joined.as_bytes())
}

/// Names forbidden as keys anywhere secret material might hide (auth_state
/// fields, audit log detail blobs). Per spec: "presence of a key whose
/// lowercased name contains any of {token, password, secret, key, api_key,
/// auth, credential} is a schema violation."
const FORBIDDEN_SUBSTRINGS: [&str; 7] = [
    "token",
    "password",
    "secret",
    "key",
    "api_key",
    "auth",
    "credential",
];

pub fn is_forbidden_field_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    FORBIDDEN_SUBSTRINGS.iter().any(|f| lower.contains(f))
}

/// Best-effort secret redaction for audit log detail blobs. The pattern set
/// is trivial by design (named but not elaborated in the external contract):
/// any object key whose name is forbidden gets its value replaced.
pub fn redact_secrets(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if is_forbidden_field_name(&k) {
                    out.insert(k, serde_json::Value::String("[redacted]".to_string()));
                } else {
                    out.insert(k, redact_secrets(v));
                }
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(redact_secrets).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn forbidden_field_names() {
        assert!(is_forbidden_field_name("API_Key"));
        assert!(is_forbidden_field_name("auth_token"));
        assert!(!is_forbidden_field_name("status"));
    }

    #[test]
    fn redact_nested_secret() {
        let v = serde_json::json!({"env": {"GITHUB_TOKEN": "abc"}, "ok": "fine"});
        let r = redact_secrets(v);
        assert_eq!(r["env"]["GITHUB_TOKEN"], "[redacted]");
        assert_eq!(r["ok"], "fine");
    }
}
