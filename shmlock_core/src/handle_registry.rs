use crate::errors::ErrorCode;
use crate::manager::LockManager;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Handle ID type - safer than raw pointers
pub type HandleId = u64;

/// Global handle registry for lock managers opened through the C ABI
struct HandleRegistry {
    handles: DashMap<HandleId, Arc<dyn LockManager>>,
    next_id: AtomicU64,
}

impl HandleRegistry {
    fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1), // Start from 1, reserve 0 for null/invalid
        }
    }

    fn register(&self, manager: Arc<dyn LockManager>) -> HandleId {
        let handle_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(handle_id, manager);
        handle_id
    }

    /// Clone the manager out so no map shard stays locked while a caller
    /// blocks on one of its locks.
    fn get(&self, handle_id: HandleId) -> Result<Arc<dyn LockManager>, ErrorCode> {
        if handle_id == 0 {
            return Err(ErrorCode::InvalidHandle);
        }
        self.handles
            .get(&handle_id)
            .map(|m| Arc::clone(m.value()))
            .ok_or(ErrorCode::InvalidHandle)
    }

    fn unregister(&self, handle_id: HandleId) -> Result<(), ErrorCode> {
        if handle_id == 0 {
            return Err(ErrorCode::InvalidHandle);
        }
        self.handles
            .remove(&handle_id)
            .map(|_| ())
            .ok_or(ErrorCode::InvalidHandle)
    }
}

static REGISTRY: OnceLock<HandleRegistry> = OnceLock::new();

fn get_registry() -> &'static HandleRegistry {
    REGISTRY.get_or_init(HandleRegistry::new)
}

/// Register a lock manager and return its handle ID
pub fn register_handle(manager: Arc<dyn LockManager>) -> HandleId {
    get_registry().register(manager)
}

/// Run `f` with the manager identified by `handle_id`
pub fn with_handle<T, F>(handle_id: HandleId, f: F) -> Result<T, ErrorCode>
where
    F: FnOnce(&dyn LockManager) -> T,
{
    let manager = get_registry().get(handle_id)?;
    Ok(f(manager.as_ref()))
}

/// Unregister a manager. Locks it handed out stay usable until dropped.
pub fn unregister_handle(handle_id: HandleId) -> Result<(), ErrorCode> {
    get_registry().unregister(handle_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_manager::InMemoryManager;

    #[test]
    fn test_handle_registry() {
        let registry = HandleRegistry::new();
        assert!(registry.get(0).is_err());
        assert!(registry.unregister(999).is_err());

        let h = registry.register(Arc::new(InMemoryManager::new(4).unwrap()));
        assert_ne!(h, 0);
        let m = registry.get(h).unwrap();
        assert_eq!(m.available_locks().unwrap(), Some(4));
        registry.unregister(h).unwrap();
        assert_eq!(registry.get(h).err(), Some(ErrorCode::InvalidHandle));
        // The clone taken before unregistering is still usable.
        assert_eq!(m.allocate_lock().unwrap().id(), 0);
    }

    #[test]
    fn with_handle_runs_against_the_global_registry() {
        let h = register_handle(Arc::new(InMemoryManager::new(2).unwrap()));
        let id = with_handle(h, |m| m.allocate_lock().map(|l| l.id())).unwrap().unwrap();
        assert_eq!(id, 0);
        unregister_handle(h).unwrap();
        assert!(with_handle(h, |_| ()).is_err());
    }
}
