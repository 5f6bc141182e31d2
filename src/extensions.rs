//! A small type map used as [`crate::socket::Socket::data`]'s backing store.
//! Backed by a `DashMap` so it can be read and written from any thread
//! without an external lock.

use std::any::{Any, TypeId};

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct Extensions(DashMap<TypeId, Box<dyn Any + Send + Sync>>);

impl Extensions {
    pub fn new() -> Self {
        Self(DashMap::new())
    }

    pub fn insert<T: Send + Sync + 'static>(&self, value: T) -> Option<T> {
        self.0
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|boxed| boxed.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.0
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_ref::<T>().cloned())
    }

    pub fn remove<T: Send + Sync + 'static>(&self) -> Option<T> {
        self.0
            .remove(&TypeId::of::<T>())
            .and_then(|(_, boxed)| boxed.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.0.contains_key(&TypeId::of::<T>())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_and_get_roundtrip() {
        let ext = Extensions::new();
        assert!(ext.insert(42u32).is_none());
        assert_eq!(ext.get::<u32>(), Some(42));
        assert_eq!(ext.get::<String>(), None);
    }

    #[test]
    fn remove_clears_the_slot() {
        let ext = Extensions::new();
        ext.insert("hello".to_string());
        assert_eq!(ext.remove::<String>(), Some("hello".to_string()));
        assert_eq!(ext.get::<String>(), None);
    }
}
