use std::collections::HashMap;

use crate::engine::Handle;

/// Maps opaque 32-bit tokens to engine-side objects. Token 0 is never issued.
pub(crate) struct HandleRegistry<T> {
    entries: HashMap<Handle, T>,
    next_id: Handle,
}

impl<T> HandleRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn insert(&mut self, entry: T) -> Handle {
        // Skip 0 and tokens still in use after wrap-around.
        while self.next_id == 0 || self.entries.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.insert(id, entry);
        id
    }

    pub(crate) fn get(&self, id: Handle) -> Option<&T> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: Handle) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: Handle) -> Option<T> {
        self.entries.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.entries.drain().map(|(_, entry)| entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_start_at_one_and_skip_live_entries() {
        let mut registry = HandleRegistry::new();
        assert_eq!(registry.insert("a"), 1);
        assert_eq!(registry.insert("b"), 2);
        registry.next_id = u32::MAX;
        assert_eq!(registry.insert("c"), u32::MAX);
        // wraps past 0 and the live tokens 1 and 2
        assert_eq!(registry.insert("d"), 3);
        assert_eq!(registry.remove(1), Some("a"));
        assert_eq!(registry.len(), 3);
    }
}
