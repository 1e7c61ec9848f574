//! Per-party context storage.
//!
//! An [`Arena`] travels with a party for the party's whole life and is
//! dropped with it. It is a typed key-value store: collaborators the
//! participants need (an event engine, a memory allocator handle, a metrics
//! sink) are registered once under their type and looked up by type from
//! inside any poll. The scheduler itself stores nothing here; the arena is
//! a seam for the layers above.

use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

/// Typed context store with a lifetime tied to one party.
#[derive(Default)]
pub struct Arena {
    contexts: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl Arena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `value` as the context of type `T`, replacing any previous
    /// registration of the same type.
    pub fn set_context<T: Send + Sync + 'static>(&self, value: T) {
        self.contexts.write().insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Clones out the context of type `T`, if registered.
    #[must_use]
    pub fn get_context<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.with_context(T::clone)
    }

    /// Runs `f` against the context of type `T`, if registered.
    pub fn with_context<T: Send + Sync + 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let contexts = self.contexts.read();
        let value = contexts.get(&TypeId::of::<T>())?;
        // The map is keyed by the concrete TypeId, so the downcast holds.
        value.downcast_ref::<T>().map(f)
    }

    /// Returns `true` if a context of type `T` is registered.
    #[must_use]
    pub fn has_context<T: Send + Sync + 'static>(&self) -> bool {
        self.contexts.read().contains_key(&TypeId::of::<T>())
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("contexts", &self.contexts.read().len())
            .finish()
    }
}
