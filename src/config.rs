//! Process-wide typed configuration store.
//!
//! Variables are registered on first lookup and shared by name from
//! then on. Setting a value fires registered change listeners before
//! the new value becomes visible, so listeners observe both sides of
//! the transition. The fiber module uses this for its default stack
//! size; changes apply to fibers constructed after the change.

use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

type ListenerFn<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

/// A named, typed configuration variable.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: RwLock<HashMap<u64, ListenerFn<T>>>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> ConfigVar<T> {
    fn new(name: String, default: T, description: String) -> Self {
        ConfigVar {
            name,
            description,
            value: RwLock::new(default),
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the variable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the human-readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns a copy of the current value.
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Replaces the value, notifying listeners with (old, new) first.
    ///
    /// Setting an equal value is a no-op and fires nothing.
    pub fn set(&self, new: T) {
        {
            let old = self.value.read();
            if *old == new {
                return;
            }
            let listeners = self.listeners.read();
            for listener in listeners.values() {
                listener(&old, &new);
            }
        }
        *self.value.write() = new;
    }

    /// Registers a change listener and returns its removal key.
    pub fn add_listener(&self, listener: impl Fn(&T, &T) + Send + Sync + 'static) -> u64 {
        static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(0);
        let key = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().insert(key, Box::new(listener));
        key
    }

    /// Removes a listener previously registered with [`add_listener`].
    ///
    /// [`add_listener`]: ConfigVar::add_listener
    pub fn remove_listener(&self, key: u64) {
        self.listeners.write().remove(&key);
    }
}

lazy_static::lazy_static! {
    static ref REGISTRY: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>> =
        RwLock::new(HashMap::new());
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_')
}

/// Looks up a configuration variable, registering it with `default`
/// and `description` if this is the first lookup of `name`.
///
/// # Panics
///
/// Panics if `name` contains characters outside `[a-z0-9._]`, or if
/// the name is already registered with a different value type.
pub fn lookup<T: Clone + PartialEq + Send + Sync + 'static>(
    name: &str,
    default: T,
    description: &str,
) -> Arc<ConfigVar<T>> {
    assert!(valid_name(name), "invalid config name: {name:?}");

    {
        let registry = REGISTRY.read();
        if let Some(existing) = registry.get(name) {
            match existing.clone().downcast::<ConfigVar<T>>() {
                Ok(var) => return var,
                Err(_) => {
                    error!(target: "system", "config name {name:?} exists with another type");
                    panic!("config name {name:?} registered with a different type");
                }
            }
        }
    }

    let mut registry = REGISTRY.write();
    // Racing lookups of the same name settle on whichever insert won.
    if let Some(existing) = registry.get(name) {
        return existing
            .clone()
            .downcast::<ConfigVar<T>>()
            .unwrap_or_else(|_| panic!("config name {name:?} registered with a different type"));
    }
    let var = Arc::new(ConfigVar::new(
        name.to_string(),
        default,
        description.to_string(),
    ));
    registry.insert(name.to_string(), var.clone());
    var
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_lookup_returns_same_var() {
        let a = lookup::<u32>("test.lookup_same", 7, "test var");
        let b = lookup::<u32>("test.lookup_same", 99, "ignored default");
        assert_eq!(b.get(), 7);
        a.set(11);
        assert_eq!(b.get(), 11);
    }

    #[test]
    fn test_listener_fires_on_change() {
        let var = lookup::<usize>("test.listener", 1, "test var");
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        let key = var.add_listener(move |old, new| {
            assert_ne!(old, new);
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        var.set(2);
        var.set(2); // unchanged, no callback
        var.set(3);
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        var.remove_listener(key);
        var.set(4);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[should_panic(expected = "invalid config name")]
    fn test_rejects_bad_name() {
        let _ = lookup::<u32>("Bad Name!", 0, "rejected");
    }
}
