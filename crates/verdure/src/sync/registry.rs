//! Registry of named semaphores
//!
//! Handles are reference counted explicitly. The entry is evicted when the
//! last handle for a name is dropped, so a later `get` of the same name
//! starts from a fresh semaphore.

use super::Semaphore;
use dashmap::DashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

struct Entry {
    semaphore: Arc<Semaphore>,
    users: usize,
}

/// Named semaphores shared by every holder of a clone of the registry
#[derive(Clone, Default)]
pub struct Semaphores {
    entries: Arc<DashMap<String, Entry>>,
}

impl Semaphores {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-permit semaphore registered under `name`
    pub fn get(&self, name: &str) -> NamedSemaphore {
        self.get_with_permits(name, 1)
    }

    /// Semaphore registered under `name`, created with `permits` if absent.
    ///
    /// `permits` is ignored when the name is already in use.
    pub fn get_with_permits(&self, name: &str, permits: usize) -> NamedSemaphore {
        let semaphore = {
            let mut entry = self.entries.entry(name.to_string()).or_insert_with(|| {
                tracing::trace!(name, permits, "registering semaphore");
                Entry {
                    semaphore: Arc::new(Semaphore::new(permits)),
                    users: 0,
                }
            });
            entry.users += 1;
            entry.semaphore.clone()
        };
        NamedSemaphore {
            name: name.to_string(),
            semaphore,
            entries: self.entries.clone(),
        }
    }

    /// Get the number of registered names
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no name is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `name` currently has live handles
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

impl fmt::Debug for Semaphores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphores").field("len", &self.entries.len()).finish()
    }
}

/// Counted handle to a registered semaphore. Derefs to [`Semaphore`].
pub struct NamedSemaphore {
    name: String,
    semaphore: Arc<Semaphore>,
    entries: Arc<DashMap<String, Entry>>,
}

impl NamedSemaphore {
    /// Name this handle was obtained with
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared semaphore, for owned permits
    pub fn semaphore(&self) -> &Arc<Semaphore> {
        &self.semaphore
    }
}

impl Deref for NamedSemaphore {
    type Target = Semaphore;

    fn deref(&self) -> &Semaphore {
        &self.semaphore
    }
}

impl Clone for NamedSemaphore {
    fn clone(&self) -> Self {
        if let Some(mut entry) = self.entries.get_mut(&self.name) {
            entry.users += 1;
        }
        Self {
            name: self.name.clone(),
            semaphore: self.semaphore.clone(),
            entries: self.entries.clone(),
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entries.get_mut(&self.name) {
            entry.users = entry.users.saturating_sub(1);
        }
        if self.entries.remove_if(&self.name, |_, entry| entry.users == 0).is_some() {
            tracing::trace!(name = %self.name, "evicted semaphore");
        }
    }
}

impl fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedSemaphore")
            .field("name", &self.name)
            .field("semaphore", &self.semaphore)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_creation() {
        let registry = Semaphores::new();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_same_name_shares_semaphore() {
        let registry = Semaphores::new();
        let a = registry.get("db");
        let b = registry.get("db");
        assert!(Arc::ptr_eq(a.semaphore(), b.semaphore()));
        assert_eq!(registry.len(), 1);

        let _permit = a.try_acquire().unwrap();
        assert!(b.try_acquire().is_none());
    }

    #[test]
    fn test_last_handle_evicts() {
        let registry = Semaphores::new();
        let a = registry.get("cache");
        let b = a.clone();
        let first = a.semaphore().id();

        drop(a);
        assert!(registry.contains("cache"));
        drop(b);
        assert!(!registry.contains("cache"));

        let c = registry.get("cache");
        assert_ne!(c.semaphore().id(), first);
    }

    #[test]
    fn test_permits_fixed_by_first_user() {
        let registry = Semaphores::new();
        let a = registry.get_with_permits("pool", 3);
        let b = registry.get_with_permits("pool", 10);
        assert_eq!(a.max_permits(), 3);
        assert_eq!(b.max_permits(), 3);
        assert_eq!(b.name(), "pool");
    }

    #[test]
    fn test_registry_clones_share_entries() {
        let registry = Semaphores::new();
        let other = registry.clone();
        let _a = registry.get("x");
        assert!(other.contains("x"));
    }
}
