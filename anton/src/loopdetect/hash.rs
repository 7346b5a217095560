//! Stable hashing for tool calls and results.
//!
//! Signatures must be identical for arguments that are equal under
//! canonical JSON: object keys are sorted recursively and serialization is
//! independent of insertion order. Native map iteration order is never
//! relied on.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Byte length above which result content is hashed through the cheaper
/// prefix/suffix scheme.
const LARGE_CONTENT_BYTES: usize = 4096;
const LARGE_PREFIX_BYTES: usize = 2048;
const LARGE_SUFFIX_BYTES: usize = 1024;

/// Serialize a JSON value with recursively sorted object keys.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
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
        other => out.push_str(&other.to_string()),
    }
}

/// Hex-encoded SHA-256 of the given bytes.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Hash tool arguments under canonical JSON.
#[must_use]
pub fn hash_tool_args(args: &Value) -> String {
    sha256_hex(canonical_json(args).as_bytes())
}

/// Build the signature for a tool call: `name + "|" + args-hash`.
#[must_use]
pub fn signature(tool: &str, args: &Value) -> String {
    format!("{tool}|{}", hash_tool_args(args))
}

/// Hash result content, switching to a prefix/suffix digest for large
/// payloads so repeated multi-megabyte results stay cheap to compare.
#[must_use]
pub fn hash_result_content(content: &str) -> String {
    let bytes = content.as_bytes();
    if bytes.len() <= LARGE_CONTENT_BYTES {
        return sha256_hex(bytes);
    }
    let mut hasher = Sha256::new();
    hasher.update(&bytes[..LARGE_PREFIX_BYTES]);
    hasher.update(b"...");
    hasher.update(&bytes[bytes.len() - LARGE_SUFFIX_BYTES..]);
    hasher.update(format!("|len:{}", bytes.len()).as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}
