//! In-flight (part, index) claims.
//!
//! At most one build per (part, index) pair may run at a time. Whoever starts
//! a build takes a [`BuildClaim`] and keeps it until the build reaches a
//! terminal outcome; the selector and the reaper skip claimed pairs.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

type ClaimKey = (String, String);

/// Set of claimed (part name, index name) pairs. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct BuildClaims {
    inner: Arc<Mutex<BTreeSet<ClaimKey>>>,
}

impl BuildClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a pair, `None` if someone else holds it.
    pub fn try_claim(&self, part_name: &str, index_name: &str) -> Option<BuildClaim> {
        let key = (part_name.to_string(), index_name.to_string());
        let mut claims = self.inner.lock();
        if !claims.insert(key.clone()) {
            return None;
        }
        Some(BuildClaim {
            claims: self.inner.clone(),
            key,
        })
    }

    pub fn is_claimed(&self, part_name: &str, index_name: &str) -> bool {
        self.inner
            .lock()
            .contains(&(part_name.to_string(), index_name.to_string()))
    }

    /// Number of live claims.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A held claim; released on drop.
#[derive(Debug)]
pub struct BuildClaim {
    claims: Arc<Mutex<BTreeSet<ClaimKey>>>,
    key: ClaimKey,
}

impl BuildClaim {
    pub fn part_name(&self) -> &str {
        &self.key.0
    }

    pub fn index_name(&self) -> &str {
        &self.key.1
    }
}

impl Drop for BuildClaim {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive() {
        let claims = BuildClaims::new();
        let claim = claims.try_claim("all_1_1_0", "v1").unwrap();
        assert!(claims.try_claim("all_1_1_0", "v1").is_none());
        assert!(claims.try_claim("all_1_1_0", "v2").is_some());
        assert!(claims.is_claimed("all_1_1_0", "v1"));
        assert_eq!(claim.part_name(), "all_1_1_0");

        drop(claim);
        assert!(!claims.is_claimed("all_1_1_0", "v1"));
        assert!(claims.is_empty());
    }
}
