use std::collections::HashMap;

use rand::Rng;

/// keyed collection that can drop a uniformly random entry in O(1)
///
/// entries live in a dense vector; the index maps a key to its slot. removal
/// swaps the victim with the last slot and patches the moved entry's index.
pub(crate) struct RandomEvictionSet<V> {
    entries: Vec<(String, V)>,
    index: HashMap<String, usize>,
}

impl<V> RandomEvictionSet<V> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.index.get(key).map(|&slot| &self.entries[slot].1)
    }

    /// insert or replace
    pub fn insert(&mut self, key: String, value: V) {
        if let Some(&slot) = self.index.get(&key) {
            self.entries[slot].1 = value;
            return;
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, value));
    }

    pub fn remove_random(&mut self) -> Option<(String, V)> {
        if self.entries.is_empty() {
            return None;
        }
        let slot = rand::thread_rng().gen_range(0..self.entries.len());
        Some(self.remove_slot(slot))
    }

    fn remove_slot(&mut self, slot: usize) -> (String, V) {
        let (key, value) = self.entries.swap_remove(slot);
        self.index.remove(&key);
        if let Some((moved, _)) = self.entries.get(slot) {
            self.index.insert(moved.clone(), slot);
        }
        (key, value)
    }
}
