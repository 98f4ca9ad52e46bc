//! Utility functions for Model Serve
//!
//! This module provides utility functions used throughout the Model Serve system.

use bytesize::ByteSize;
use sha2::{Digest, Sha256};

/// Bytes in a decimal gigabyte, the unit cache budgets are configured in
pub const BYTES_PER_GB: f64 = 1e9;

/// Formats a byte size into a human-readable string
///
/// # Examples
///
/// ```
/// use common::utils::format_bytes;
///
/// assert_eq!(format_bytes(1024), "1.0 kiB");
/// assert_eq!(format_bytes(1048576), "1.0 MiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    ByteSize::b(bytes).to_string_as(true)
}

/// Converts a (possibly fractional) gigabyte budget into bytes
pub fn gigabytes_to_bytes(gb: f64) -> u64 {
    if gb <= 0.0 || !gb.is_finite() {
        return 0;
    }
    (gb * BYTES_PER_GB) as u64
}

/// Hex SHA-256 over the given parts, each terminated by a NUL byte
///
/// The separator keeps `["ab", "c"]` and `["a", "bc"]` apart. The output
/// depends on nothing but the input bytes, so it is stable across runs.
pub fn stable_hash_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Encodes an arbitrary string into a single safe path segment
///
/// `%`, `/`, `\` and NUL are percent-escaped, and the special names `.` and
/// `..` are escaped entirely. The mapping is injective, so distinct inputs
/// never share a segment.
pub fn encode_path_segment(raw: &str) -> String {
    if raw == "." || raw == ".." {
        return raw.replace('.', "%2E");
    }

    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            '\0' => out.push_str("%00"),
            _ => out.push(ch),
        }
    }
    out
}

/// Last non-empty `/`-separated component of a URL path, without query or fragment
pub fn url_basename(url: &str) -> &str {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    let path = match without_query.find("://") {
        Some(idx) => {
            let rest = &without_query[idx + 3..];
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "",
            }
        }
        None => without_query,
    };
    path.rsplit('/').find(|s| !s.is_empty()).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_uses_binary_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.0 kiB");
        assert_eq!(format_bytes(1536), "1.5 kiB");
        assert_eq!(format_bytes(1048576), "1.0 MiB");
    }

    #[test]
    fn test_gigabytes_to_bytes() {
        assert_eq!(gigabytes_to_bytes(50.0), 50_000_000_000);
        assert_eq!(gigabytes_to_bytes(0.5), 500_000_000);
        assert_eq!(gigabytes_to_bytes(-1.0), 0);
    }

    #[test]
    fn test_stable_hash_is_deterministic_and_separated() {
        let a = stable_hash_hex(&["ab", "c"]);
        assert_eq!(a, stable_hash_hex(&["ab", "c"]));
        assert_ne!(a, stable_hash_hex(&["a", "bc"]));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_encode_path_segment() {
        assert_eq!(encode_path_segment("model.bin"), "model.bin");
        assert_eq!(encode_path_segment("a/b"), "a%2Fb");
        assert_eq!(encode_path_segment("a%2Fb"), "a%252Fb");
        assert_eq!(encode_path_segment(".."), "%2E%2E");
        assert_eq!(encode_path_segment("."), "%2E");
        assert_ne!(encode_path_segment("a/b"), encode_path_segment("a%2Fb"));
    }

    #[test]
    fn test_url_basename() {
        assert_eq!(url_basename("https://host/models/w.safetensors"), "w.safetensors");
        assert_eq!(url_basename("https://host/models/w.bin?sig=1#frag"), "w.bin");
        assert_eq!(url_basename("https://host/dir/"), "dir");
        assert_eq!(url_basename("https://host"), "");
    }
}
