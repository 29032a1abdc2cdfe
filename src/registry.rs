// ===============================
// src/registry.rs
// ===============================
//
// Symbol <-> subscription id bookkeeping shared by both venue clients.
// Ids are minted once per symbol and never reused or remapped.
//
use ahash::AHashMap as HashMap;
use rand::{distributions::Uniform, Rng};
use std::sync::Mutex;

use crate::domain::SubscriptionId;

const GUID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const GUID_GROUPS: [usize; 5] = [8, 4, 4, 4, 12];

#[derive(Default)]
struct Maps {
    by_symbol: HashMap<String, SubscriptionId>,
    by_id: HashMap<SubscriptionId, String>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    maps: Mutex<Maps>,
}

fn random_guid<R: Rng>(rng: &mut R) -> SubscriptionId {
    let pick = Uniform::from(0..GUID_ALPHABET.len());
    let groups: Vec<String> = GUID_GROUPS
        .iter()
        .map(|&n| (0..n).map(|_| GUID_ALPHABET[rng.sample(pick)] as char).collect())
        .collect();
    SubscriptionId::new(groups.join("-"))
}

impl SubscriptionRegistry {
    pub fn new() -> Self { Self::default() }

    /// Id for `symbol`, minting a fresh collision-free one on first use.
    pub fn generate(&self, symbol: &str) -> SubscriptionId {
        self.generate_with(symbol, &mut rand::thread_rng())
    }

    fn generate_with<R: Rng>(&self, symbol: &str, rng: &mut R) -> SubscriptionId {
        let mut maps = self.maps.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(id) = maps.by_symbol.get(symbol) {
            return id.clone();
        }
        let id = loop {
            let candidate = random_guid(rng);
            if !maps.by_id.contains_key(&candidate) {
                break candidate;
            }
        };
        maps.by_symbol.insert(symbol.to_string(), id.clone());
        maps.by_id.insert(id.clone(), symbol.to_string());
        id
    }

    pub fn id_of(&self, symbol: &str) -> Option<SubscriptionId> {
        let maps = self.maps.lock().unwrap_or_else(|p| p.into_inner());
        maps.by_symbol.get(symbol).cloned()
    }

    pub fn symbol_of(&self, id: &str) -> Option<String> {
        let maps = self.maps.lock().unwrap_or_else(|p| p.into_inner());
        maps.by_id.get(&SubscriptionId::new(id)).cloned()
    }

    pub fn len(&self) -> usize {
        self.maps.lock().unwrap_or_else(|p| p.into_inner()).by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_across_symbols() {
        let reg = SubscriptionRegistry::new();
        let ids: HashSet<SubscriptionId> =
            (0..500).map(|i| reg.generate(&format!("SYM{i}"))).collect();
        assert_eq!(ids.len(), 500);
        assert_eq!(reg.len(), 500);
    }

    #[test]
    fn guid_shape() {
        let reg = SubscriptionRegistry::new();
        let id = reg.generate("TATN");
        let parts: Vec<&str> = id.as_str().split('-').collect();
        assert_eq!(parts.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![8, 4, 4, 4, 12]);
        assert!(id.as_str().chars().all(|c| c == '-' || c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn symbol_keeps_its_id() {
        let reg = SubscriptionRegistry::new();
        let a = reg.generate("SBER");
        let b = reg.generate("SBER");
        assert_eq!(a, b);
        assert_eq!(reg.symbol_of(a.as_str()).as_deref(), Some("SBER"));
        assert_eq!(reg.id_of("SBER"), Some(a));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn retries_on_collision() {
        // Same seed reproduces the first candidate; it is already taken.
        let reg = SubscriptionRegistry::new();
        let first = random_guid(&mut StdRng::seed_from_u64(7));
        {
            let mut maps = reg.maps.lock().unwrap();
            maps.by_id.insert(first.clone(), "TAKEN".into());
            maps.by_symbol.insert("TAKEN".into(), first.clone());
        }
        let id = reg.generate_with("MTLR", &mut StdRng::seed_from_u64(7));
        assert_ne!(id, first);
        assert_eq!(reg.symbol_of(first.as_str()).as_deref(), Some("TAKEN"));
    }
}
