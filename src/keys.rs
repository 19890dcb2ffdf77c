//! Length-prefixed key encoding for LMDB storage.
//!
//! Keys are encoded as `[len1][bytes1][len2][bytes2]...` so ids may contain
//! any byte, and a key built from the first N parts is a scan prefix for
//! every key sharing those parts. Parts are limited to 255 bytes.

use crate::error::{Error, Result};

/// Build a length-prefixed key from parts
#[inline]
pub fn build_key(parts: &[&str]) -> Result<Vec<u8>> {
    let total_len: usize = parts.iter().map(|p| 1 + p.len()).sum();
    let mut key = Vec::with_capacity(total_len);
    for part in parts {
        let len = u8::try_from(part.len()).map_err(|_| Error::Validation(format!("id longer than 255 bytes: {}...", part.chars().take(32).collect::<String>())))?;
        key.push(len);
        key.extend_from_slice(part.as_bytes());
    }
    Ok(key)
}

/// Get the Nth part from a key without allocating
#[inline]
pub fn get_part(bytes: &[u8], n: usize) -> Option<&str> {
    let mut i = 0;
    let mut count = 0;
    while i < bytes.len() {
        let len = bytes[i] as usize;
        let part = bytes.get(i + 1..i + 1 + len)?;
        if count == n {
            return std::str::from_utf8(part).ok();
        }
        i += 1 + len;
        count += 1;
    }
    None
}

/// Index key: principals holding a role
#[inline]
pub fn role_member_key(role: &str, principal: &str) -> Result<Vec<u8>> {
    build_key(&[role, principal])
}

/// Failure record key: role, zero-padded version, batch index.
///
/// Padding keeps records of one role sorted by version.
pub fn failure_key(role: &str, version: u64, batch: usize) -> Result<Vec<u8>> {
    build_key(&[role, &format!("{:020}", version), &format!("{:06}", batch)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_part() {
        let key = build_key(&["aaa", "bbb", "ccc"]).unwrap();
        assert_eq!(get_part(&key, 0), Some("aaa"));
        assert_eq!(get_part(&key, 1), Some("bbb"));
        assert_eq!(get_part(&key, 2), Some("ccc"));
        assert_eq!(get_part(&key, 3), None);
    }

    #[test]
    fn test_prefix() {
        let key = role_member_key("manager", "alice").unwrap();
        assert!(key.starts_with(&build_key(&["manager"]).unwrap()));
        // "manage" must not match "manager" members
        assert!(!key.starts_with(&build_key(&["manage"]).unwrap()));
    }

    #[test]
    fn test_special_chars() {
        let key = build_key(&["user/admin", "edit:write", ""]).unwrap();
        assert_eq!(get_part(&key, 0), Some("user/admin"));
        assert_eq!(get_part(&key, 1), Some("edit:write"));
        assert_eq!(get_part(&key, 2), Some(""));
    }

    #[test]
    fn test_truncated_key() {
        let mut key = build_key(&["abc"]).unwrap();
        key.pop();
        assert_eq!(get_part(&key, 0), None);
    }

    #[test]
    fn test_too_long_part() {
        let long = "x".repeat(256);
        assert!(build_key(&[&long]).is_err());
    }

    #[test]
    fn test_failure_key_orders_by_version() {
        let a = failure_key("r", 9, 0).unwrap();
        let b = failure_key("r", 10, 0).unwrap();
        assert!(a < b);
        assert_eq!(get_part(&b, 1), Some("00000000000000000010"));
    }
}
