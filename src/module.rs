use std::cell::RefCell;
use std::rc::Rc;

use crate::bridge::MemoryBridge;
use crate::engine::{Engine, HostFunction};
use crate::error::SqlBridgeError;

/// An instantiated engine module plus the slot pool of its indirect function table.
///
/// Every database opened from the same module shares the pool; slots released by one
/// database are reused by the next registration.
pub struct Module {
    engine: Rc<dyn Engine>,
    free_slots: RefCell<Vec<u32>>,
}

impl Module {
    #[must_use]
    pub fn new(engine: Rc<dyn Engine>) -> Rc<Self> {
        Rc::new(Self {
            engine,
            free_slots: RefCell::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn engine(&self) -> &Rc<dyn Engine> {
        &self.engine
    }

    #[must_use]
    pub fn bridge(&self) -> MemoryBridge<'_> {
        MemoryBridge::new(&*self.engine)
    }

    /// Install `function` in a free table slot, growing the table by one entry when none
    /// is free.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::TableExhausted` when the table cannot grow.
    pub fn add_function(&self, function: HostFunction) -> Result<u32, SqlBridgeError> {
        let recycled = self.free_slots.borrow_mut().pop();
        let slot = match recycled {
            Some(slot) => slot,
            None => self.engine.table_grow(1).ok_or_else(|| {
                SqlBridgeError::TableExhausted(format!(
                    "cannot grow past {} entries",
                    self.engine.table_len()
                ))
            })?,
        };
        self.engine.table_set(slot, Some(function));
        tracing::trace!(slot, recycled = recycled.is_some(), "function slot assigned");
        Ok(slot)
    }

    /// Clear `slot` and return it to the pool.
    pub fn remove_function(&self, slot: u32) {
        self.engine.table_set(slot, None);
        self.free_slots.borrow_mut().push(slot);
        tracing::trace!(slot, "function slot released");
    }

    #[must_use]
    pub fn free_slot_count(&self) -> usize {
        self.free_slots.borrow().len()
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("table_len", &self.engine.table_len())
            .field("free_slots", &self.free_slots.borrow().len())
            .finish_non_exhaustive()
    }
}
