//! Typed key-value persistence over flash-style namespaces.
//!
//! The store itself is an external collaborator; implementations live
//! behind [`KvStore`]. Namespace names are limited to 15 characters and
//! string values to 4000 characters, matching the flash backend's limits.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::warn;

/// Flash namespace name limit.
pub const MAX_NAMESPACE_LEN: usize = 15;
/// Flash string value limit.
pub const MAX_STRING_LEN: usize = 4000;

/// The persistence seam. Implementations use interior mutability so
/// handles can be shared across components of the single-threaded loop.
pub trait KvStore {
    fn get_u32(&self, namespace: &str, key: &str) -> Option<u32>;
    fn set_u32(&self, namespace: &str, key: &str, value: u32) -> bool;
    fn get_i32(&self, namespace: &str, key: &str) -> Option<i32>;
    fn set_i32(&self, namespace: &str, key: &str, value: i32) -> bool;
    fn get_string(&self, namespace: &str, key: &str) -> Option<String>;
    fn set_string(&self, namespace: &str, key: &str, value: &str) -> bool;
}

/// Checks shared by every implementation.
#[must_use]
pub fn namespace_ok(namespace: &str) -> bool {
    if namespace.is_empty() || namespace.len() > MAX_NAMESPACE_LEN {
        warn!("KvStore: bad namespace '{namespace}'");
        return false;
    }
    true
}

#[must_use]
pub fn string_ok(value: &str) -> bool {
    if value.len() > MAX_STRING_LEN {
        warn!("KvStore: string value too long, length={}", value.len());
        return false;
    }
    true
}

/// A value conversion for [`PersistentValue`].
pub trait KvValue: Clone {
    fn load(store: &dyn KvStore, namespace: &str, key: &str) -> Option<Self>;
    fn save(&self, store: &dyn KvStore, namespace: &str, key: &str) -> bool;
}

impl KvValue for u32 {
    fn load(store: &dyn KvStore, namespace: &str, key: &str) -> Option<Self> {
        store.get_u32(namespace, key)
    }
    fn save(&self, store: &dyn KvStore, namespace: &str, key: &str) -> bool {
        store.set_u32(namespace, key, *self)
    }
}

impl KvValue for i32 {
    fn load(store: &dyn KvStore, namespace: &str, key: &str) -> Option<Self> {
        store.get_i32(namespace, key)
    }
    fn save(&self, store: &dyn KvStore, namespace: &str, key: &str) -> bool {
        store.set_i32(namespace, key, *self)
    }
}

impl KvValue for String {
    fn load(store: &dyn KvStore, namespace: &str, key: &str) -> Option<Self> {
        store.get_string(namespace, key)
    }
    fn save(&self, store: &dyn KvStore, namespace: &str, key: &str) -> bool {
        store.set_string(namespace, key, self)
    }
}

/// One typed binding in a namespace. Reads fall back to the caller's
/// default when nothing is stored yet.
pub struct PersistentValue<T: KvValue> {
    store: Rc<dyn KvStore>,
    namespace: &'static str,
    key: &'static str,
    default: T,
}

impl<T: KvValue> PersistentValue<T> {
    pub fn new(store: Rc<dyn KvStore>, namespace: &'static str, key: &'static str, default: T) -> Self {
        debug_assert!(namespace_ok(namespace));
        Self {
            store,
            namespace,
            key,
            default,
        }
    }

    #[must_use]
    pub fn get(&self) -> T {
        T::load(self.store.as_ref(), self.namespace, self.key).unwrap_or_else(|| self.default.clone())
    }

    pub fn set(&self, value: &T) -> bool {
        value.save(self.store.as_ref(), self.namespace, self.key)
    }
}

/// In-memory implementation, used by tests and as a last-resort fallback
/// when no backing store is provisioned.
#[derive(Default)]
pub struct MemoryKv {
    values: RefCell<HashMap<(String, String), Slot>>,
}

#[derive(Clone)]
enum Slot {
    U32(u32),
    I32(i32),
    Text(String),
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, namespace: &str, key: &str) -> Option<Slot> {
        self.values
            .borrow()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }

    fn set(&self, namespace: &str, key: &str, slot: Slot) -> bool {
        if !namespace_ok(namespace) {
            return false;
        }
        self.values
            .borrow_mut()
            .insert((namespace.to_string(), key.to_string()), slot);
        true
    }
}

impl KvStore for MemoryKv {
    fn get_u32(&self, namespace: &str, key: &str) -> Option<u32> {
        match self.get(namespace, key)? {
            Slot::U32(value) => Some(value),
            _ => None,
        }
    }
    fn set_u32(&self, namespace: &str, key: &str, value: u32) -> bool {
        self.set(namespace, key, Slot::U32(value))
    }
    fn get_i32(&self, namespace: &str, key: &str) -> Option<i32> {
        match self.get(namespace, key)? {
            Slot::I32(value) => Some(value),
            _ => None,
        }
    }
    fn set_i32(&self, namespace: &str, key: &str, value: i32) -> bool {
        self.set(namespace, key, Slot::I32(value))
    }
    fn get_string(&self, namespace: &str, key: &str) -> Option<String> {
        match self.get(namespace, key)? {
            Slot::Text(value) => Some(value),
            _ => None,
        }
    }
    fn set_string(&self, namespace: &str, key: &str, value: &str) -> bool {
        string_ok(value) && self.set(namespace, key, Slot::Text(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_read_returns_default() {
        let store: Rc<dyn KvStore> = Rc::new(MemoryKv::new());
        let drift = PersistentValue::<i32>::new(store.clone(), "nettime", "drift", 0);
        assert_eq!(drift.get(), 0);
        assert!(drift.set(&3600));
        assert_eq!(drift.get(), 3600);
    }

    #[test]
    fn drift_round_trips_across_reopen() {
        // Same backing store stands in for a power cycle: a fresh binding
        // observes the previously persisted value.
        let store: Rc<dyn KvStore> = Rc::new(MemoryKv::new());
        PersistentValue::<i32>::new(store.clone(), "nettime", "drift", 0).set(&-42_000);
        let reloaded = PersistentValue::<i32>::new(store, "nettime", "drift", 0);
        assert_eq!(reloaded.get(), -42_000);
    }

    #[test]
    fn long_namespace_rejected() {
        let store = MemoryKv::new();
        assert!(!store.set_u32("averylongnamespacename", "key", 1));
        assert!(store.set_u32("updates", "previous", 1));
    }

    #[test]
    fn oversize_string_rejected() {
        let store = MemoryKv::new();
        let long = "x".repeat(MAX_STRING_LEN + 1);
        assert!(!store.set_string("updates", "version", &long));
        let ok = "x".repeat(MAX_STRING_LEN);
        assert!(store.set_string("updates", "version", &ok));
    }
}
