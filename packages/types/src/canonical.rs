use serde_json::Value;

/// Deterministic JSON serialization: object keys are emitted in sorted
/// order at every depth, arrays keep their order, scalars use serde_json's
/// own escaping. Every hash in the system (dedupe tokens, request hashes,
/// diff comparisons) is computed over this form, never over
/// `serde_json::to_string` output.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        // numbers and strings already serialize deterministically
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(_) => {
            out.push_str(&serde_json::to_string(value).unwrap_or_default());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// Lowercase hex sha256 of the canonical form.
pub fn canonical_sha256(value: &Value) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    const_hex::encode(hasher.finalize())
}

/// Lowercase hex md5 of the canonical form. Dedupe tokens and idempotency
/// keys use md5 for compactness; collision resistance is not a requirement
/// there, uniqueness within a bounded window is.
pub fn canonical_md5(value: &Value) -> String {
    use md5::{Digest, Md5};

    let mut hasher = Md5::new();
    hasher.update(canonical_json(value).as_bytes());
    const_hex::encode(hasher.finalize())
}

/// md5 of an arbitrary string, lowercase hex.
pub fn md5_hex(input: &str) -> String {
    use md5::{Digest, Md5};

    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    const_hex::encode(hasher.finalize())
}

/// sha256 of an arbitrary byte string, lowercase hex.
pub fn sha256_hex(input: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(input);
    const_hex::encode(hasher.finalize())
}
