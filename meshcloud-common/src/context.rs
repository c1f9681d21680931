use std::{
    any::{Any, TypeId},
    collections::HashMap,
    hash::{BuildHasher, BuildHasherDefault, Hasher},
};

use anyhow::{Context as AnyContext, Result};

/// A hasher for `TypeId`s that takes advantage of its known characteristics:
/// `TypeId::hash` always calls `write_u64` exactly once.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHasher(u64);

impl Hasher for NoOpHasher {
    fn write(&mut self, _bytes: &[u8]) {
        #[cfg(debug_assertions)]
        panic!("NoOpHasher::write called; this hasher only supports write_u64 for TypeId.");
        #[cfg(not(debug_assertions))]
        {
            // no-op in release
        }
    }

    fn write_u64(&mut self, i: u64) {
        self.0 = i;
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

#[derive(Clone, Default)]
pub struct NoOpBuildHasher;

impl BuildHasher for NoOpBuildHasher {
    type Hasher = NoOpHasher;

    fn build_hasher(&self) -> Self::Hasher {
        NoOpHasher::default()
    }
}

/// Per-request type map handed to RPC method handlers and command
/// dispatchers so they can reach shared services (the store, the escrow
/// client, the command bus) without a service-locator singleton baked into
/// the handler type itself.
pub struct Context {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>, BuildHasherDefault<NoOpHasher>>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            values: HashMap::default(),
        }
    }

    pub fn store<T: Send + Sync + 'static>(&mut self, data: T) {
        self.values.insert(TypeId::of::<T>(), Box::new(data));
    }

    pub fn remove<T: 'static>(&mut self) {
        self.values.remove(&TypeId::of::<T>());
    }

    pub fn has<T: 'static>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }

    pub fn get_optional<T: 'static>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|b| b.downcast_ref())
    }

    pub fn get<T: 'static>(&self) -> Result<&T> {
        self.get_optional().context("requested type not found in context")
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_retrieves_by_type() {
        let mut ctx = Context::new();
        ctx.store(42u32);
        ctx.store("hello".to_string());

        assert_eq!(*ctx.get::<u32>().unwrap(), 42);
        assert_eq!(ctx.get::<String>().unwrap(), "hello");
        assert!(ctx.get::<u64>().is_err());
    }

    #[test]
    fn remove_drops_value() {
        let mut ctx = Context::new();
        ctx.store(1u32);
        assert!(ctx.has::<u32>());
        ctx.remove::<u32>();
        assert!(!ctx.has::<u32>());
    }
}
