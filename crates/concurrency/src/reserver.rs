//! RAII guards and mass reservers over an [`AccessManager`].
//!
//! A guard holds one value; a reserver holds a growable set. Both release on
//! drop, which is what keeps lock bookkeeping correct on every early-return
//! path of the engine.

use crate::manager::{AccessManager, AccessMode};
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use stowage_core::Result;

/// Holds one value in one mode until dropped.
pub struct AccessGuard<V>
where
    V: Ord + Hash + Clone,
{
    manager: Arc<AccessManager<V>>,
    value: V,
    mode: AccessMode,
}

impl<V> AccessGuard<V>
where
    V: Ord + Hash + Clone,
{
    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }
}

impl<V> AccessGuard<V>
where
    V: Ord + Hash + Clone,
{
    /// Take parallel access on `value`, released when the guard drops.
    pub fn parallel(
        manager: Arc<AccessManager<V>>,
        value: V,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        manager.access(&value, AccessMode::Parallel, blocking, timeout)?;
        Ok(Self {
            manager,
            value,
            mode: AccessMode::Parallel,
        })
    }

    /// Take exclusive access on `value`, released when the guard drops.
    pub fn exclusive(
        manager: Arc<AccessManager<V>>,
        value: V,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        manager.access(&value, AccessMode::Exclusive, blocking, timeout)?;
        Ok(Self {
            manager,
            value,
            mode: AccessMode::Exclusive,
        })
    }
}

impl<V> Drop for AccessGuard<V>
where
    V: Ord + Hash + Clone,
{
    fn drop(&mut self) {
        self.manager.leave(&self.value, self.mode);
    }
}

/// A growable reservation set over one namespace.
///
/// Values can be added one at a time (as a writer discovers fragment hashes)
/// or in bulk (deadlock-free mass acquisition); individual values can be
/// released early (as a reader finishes a fragment). Whatever is still held
/// is released on drop.
pub struct MassReserver<V>
where
    V: Ord + Hash + Clone,
{
    manager: Arc<AccessManager<V>>,
    mode: AccessMode,
    blocking: bool,
    timeout: Option<Duration>,
    held: Vec<V>,
    held_set: HashSet<V>,
}

impl<V> MassReserver<V>
where
    V: Ord + Hash + Clone,
{
    /// A reserver taking parallel access on its values.
    pub fn parallel(
        manager: Arc<AccessManager<V>>,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Self {
        Self::new(manager, AccessMode::Parallel, blocking, timeout)
    }

    /// A reserver taking exclusive access on its values.
    pub fn exclusive(
        manager: Arc<AccessManager<V>>,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Self {
        Self::new(manager, AccessMode::Exclusive, blocking, timeout)
    }

    fn new(
        manager: Arc<AccessManager<V>>,
        mode: AccessMode,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            manager,
            mode,
            blocking,
            timeout,
            held: Vec::new(),
            held_set: HashSet::new(),
        }
    }

    /// Reserve a single value. Already-held values are not re-acquired.
    pub fn reserve_one(&mut self, value: V) -> Result<()> {
        if self.held_set.contains(&value) {
            return Ok(());
        }
        self.manager
            .access(&value, self.mode, self.blocking, self.timeout)?;
        self.held_set.insert(value.clone());
        self.held.push(value);
        Ok(())
    }

    /// Reserve a set of values atomically (sorted mass acquisition).
    pub fn reserve_all(&mut self, values: &[V]) -> Result<()> {
        let mut fresh = Vec::new();
        let mut seen = HashSet::new();
        for value in values {
            if !self.held_set.contains(value) && seen.insert(value.clone()) {
                fresh.push(value.clone());
            }
        }
        if fresh.is_empty() {
            return Ok(());
        }
        self.manager
            .mass_access(&fresh, self.mode, self.blocking, self.timeout)?;
        for value in fresh {
            self.held_set.insert(value.clone());
            self.held.push(value);
        }
        Ok(())
    }

    /// Release a single held value early.
    pub fn release_one(&mut self, value: &V) {
        if self.held_set.remove(value) {
            if let Some(pos) = self.held.iter().position(|v| v == value) {
                self.held.remove(pos);
            }
            self.manager.leave(value, self.mode);
        }
    }

    /// Release everything currently held.
    pub fn release_all(&mut self) {
        let values = std::mem::take(&mut self.held);
        self.held_set.clear();
        self.manager.mass_leave(&values, self.mode);
    }

    /// Currently held values, in reservation order.
    pub fn reserved(&self) -> &[V] {
        &self.held
    }

    /// Whether `value` is currently held by this reserver.
    pub fn holds(&self, value: &V) -> bool {
        self.held_set.contains(value)
    }
}

impl<V> Drop for MassReserver<V>
where
    V: Ord + Hash + Clone,
{
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases_on_drop() {
        let manager = Arc::new(AccessManager::<u32>::new());
        {
            let _guard = AccessGuard::exclusive(Arc::clone(&manager), 9, true, None).unwrap();
            assert!(manager.manages_value(&9));
        }
        assert!(!manager.manages_value(&9));
    }

    #[test]
    fn test_reserver_tracks_and_releases() {
        let manager = Arc::new(AccessManager::<u32>::new());
        let mut reserver = MassReserver::parallel(Arc::clone(&manager), true, None);
        reserver.reserve_one(1).unwrap();
        reserver.reserve_all(&[1, 2, 3]).unwrap();
        assert_eq!(reserver.reserved().len(), 3);
        assert!(reserver.holds(&2));

        reserver.release_one(&2);
        assert!(!reserver.holds(&2));
        assert!(!manager.manages_value(&2));

        drop(reserver);
        assert!(manager.managed_values().is_empty());
    }

    #[test]
    fn test_reserve_one_is_idempotent() {
        let manager = Arc::new(AccessManager::<u32>::new());
        let mut reserver = MassReserver::parallel(Arc::clone(&manager), true, None);
        reserver.reserve_one(5).unwrap();
        reserver.reserve_one(5).unwrap();
        assert_eq!(reserver.reserved().len(), 1);
        assert_eq!(manager.access_count(&5), 1);
    }

    #[test]
    fn test_exclusive_reserver_blocks_other_thread() {
        let manager = Arc::new(AccessManager::<u32>::new());
        let mut reserver = MassReserver::exclusive(Arc::clone(&manager), true, None);
        reserver.reserve_all(&[1, 2]).unwrap();

        let clone = Arc::clone(&manager);
        let err = std::thread::spawn(move || clone.access(&1, AccessMode::Parallel, false, None))
            .join()
            .unwrap()
            .unwrap_err();
        assert!(err.is_lock_failure());
    }
}
