//! Content hashes and secure randomness

use std::collections::BTreeMap;

use aws_lc_rs::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};
use serde::Serialize;

use crate::{Error, Result};

/// Lowercase hex SHA-1 of `data`
pub fn sha1_hex(data: &[u8]) -> String {
    let d = digest(&SHA1_FOR_LEGACY_USE_ONLY, data);
    d.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
}

/// SHA-1 over a map serialised with its keys in sorted order.
///
/// Used for the `configHash`/`appSecretsHash` pod annotations: the value is
/// independent of the order in which entries were inserted.
pub fn sorted_map_hash<V: Serialize>(map: &BTreeMap<String, V>) -> Result<String> {
    let bytes = serde_json::to_vec(map)?;
    Ok(sha1_hex(&bytes))
}

/// `n` bytes from the system CSPRNG
pub fn random_bytes(n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    aws_lc_rs::rand::fill(&mut buf).map_err(|_| Error::crypto("system random source failed"))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_matches_known_vector() {
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn map_hash_ignores_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), "2".to_string());
        a.insert("a".to_string(), "1".to_string());
        let mut b = BTreeMap::new();
        b.insert("a".to_string(), "1".to_string());
        b.insert("b".to_string(), "2".to_string());
        assert_eq!(sorted_map_hash(&a).unwrap(), sorted_map_hash(&b).unwrap());

        b.insert("b".to_string(), "3".to_string());
        assert_ne!(sorted_map_hash(&a).unwrap(), sorted_map_hash(&b).unwrap());
    }

    #[test]
    fn random_bytes_are_sized_and_vary() {
        let x = random_bytes(32).unwrap();
        let y = random_bytes(32).unwrap();
        assert_eq!(x.len(), 32);
        assert_ne!(x, y);
    }
}
