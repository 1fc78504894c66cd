//! Identity resolution: stable legacy-key to target-UUID mapping.
//!
//! Every entity keeps its legacy unique key (domain + key) mapped to exactly
//! one freshly minted v4 UUID, for the lifetime of the migration across any
//! number of runs. The in-memory registry is hydrated from a
//! [`RegistryStore`] at run start and newly minted pairs are flushed back
//! after each wave.

mod store;

pub use store::{FileStore, MemoryStore, PgStore, RegistryStore};

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One persisted `(domain, legacy key) -> target id` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityMapping {
    pub source_domain: String,
    pub source_key: String,
    pub target_id: Uuid,
}

/// Legacy keys arrive with inconsistent case and stray whitespace; the
/// registry matches on the trimmed, lowercased form.
fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// Concurrent map from legacy identity to target UUID.
///
/// `resolve` is first-wins: concurrent calls for the same key all observe the
/// single id minted by whichever caller took the write lock first.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    map: RwLock<HashMap<(String, String), Uuid>>,
    /// Pairs minted since the last [`take_dirty`](Self::take_dirty).
    dirty: Mutex<Vec<IdentityMapping>>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hydrate from previously persisted mappings.
    pub fn with_entries(entries: Vec<IdentityMapping>) -> Self {
        let registry = Self::new();
        registry.absorb(entries);
        registry
    }

    /// Merge persisted mappings into the live map without marking them dirty.
    /// Last write wins, which is harmless: a (domain, key) pair is only ever
    /// persisted with one target id.
    pub fn absorb(&self, entries: Vec<IdentityMapping>) {
        let mut map = self.map.write().expect("registry lock");
        for e in entries {
            map.insert(
                (e.source_domain, normalize_key(&e.source_key)),
                e.target_id,
            );
        }
    }

    /// Map a legacy identity to its target UUID, minting one on first sight.
    pub fn resolve(&self, source_domain: &str, source_key: &str) -> Uuid {
        let key = (source_domain.to_string(), normalize_key(source_key));

        if let Some(id) = self.map.read().expect("registry lock").get(&key) {
            return *id;
        }

        let mut map = self.map.write().expect("registry lock");
        // Double-check: another task may have minted while we waited.
        if let Some(id) = map.get(&key) {
            return *id;
        }
        let id = Uuid::new_v4();
        map.insert(key.clone(), id);
        self.dirty.lock().expect("registry lock").push(IdentityMapping {
            source_domain: key.0,
            source_key: key.1,
            target_id: id,
        });
        id
    }

    /// Read a mapping without minting. Used by the self-reference patch pass,
    /// where an absent parent must stay absent.
    pub fn lookup(&self, source_domain: &str, source_key: &str) -> Option<Uuid> {
        self.map
            .read()
            .expect("registry lock")
            .get(&(source_domain.to_string(), normalize_key(source_key)))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.map.read().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain mappings minted since the last call, for persistence.
    pub fn take_dirty(&self) -> Vec<IdentityMapping> {
        std::mem::take(&mut *self.dirty.lock().expect("registry lock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_resolve_is_stable() {
        let registry = IdentityRegistry::new();
        let a = registry.resolve("companies", "C1");
        let b = registry.resolve("companies", "C1");
        assert_eq!(a, b);
        assert_ne!(a, registry.resolve("companies", "C2"));
        assert_ne!(a, registry.resolve("buildings", "C1"));
    }

    #[test]
    fn test_keys_normalized() {
        let registry = IdentityRegistry::new();
        let a = registry.resolve("users", " 51830E93-AAAA ");
        let b = registry.resolve("users", "51830e93-aaaa");
        assert_eq!(a, b);
    }

    #[test]
    fn test_lookup_does_not_mint() {
        let registry = IdentityRegistry::new();
        assert_eq!(registry.lookup("nodes", "N1"), None);
        let id = registry.resolve("nodes", "N1");
        assert_eq!(registry.lookup("nodes", "N1"), Some(id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_dirty_tracks_only_new_mints() {
        let registry = IdentityRegistry::with_entries(vec![IdentityMapping {
            source_domain: "companies".to_string(),
            source_key: "c1".to_string(),
            target_id: Uuid::new_v4(),
        }]);
        registry.resolve("companies", "C1");
        assert!(registry.take_dirty().is_empty());

        registry.resolve("companies", "C2");
        let dirty = registry.take_dirty();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].source_key, "c2");
        assert!(registry.take_dirty().is_empty());
    }

    #[test]
    fn test_concurrent_resolve_single_mint() {
        let registry = Arc::new(IdentityRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&registry);
                std::thread::spawn(move || r.resolve("udos", "U-42"))
            })
            .collect();
        let ids: Vec<Uuid> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.take_dirty().len(), 1);
    }
}
