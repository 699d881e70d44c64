//! Reference-counted lock table over one namespace of values.
//!
//! The manager is not an object store; it hands out lock semantics for a
//! value (a compound name, a fragment hash, a resource name). Lock objects
//! are created on first use and torn down when the last interested caller
//! leaves, so idle values retain nothing.

use crate::access::Access;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stowage_core::{Error, Result};

/// Lock mode for a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Shared access: many holders, blocks exclusive.
    Parallel,
    /// Single holder, re-entrant per thread, blocks everything.
    Exclusive,
}

struct Entry {
    count: usize,
    access: Arc<Access>,
}

/// Reader-writer lock table keyed by value.
pub struct AccessManager<V> {
    table: Mutex<HashMap<V, Entry>>,
}

impl<V> AccessManager<V>
where
    V: Ord + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    fn create_locked(table: &mut HashMap<V, Entry>, value: &V) -> Arc<Access> {
        let entry = table.entry(value.clone()).or_insert_with(|| Entry {
            count: 0,
            access: Arc::new(Access::default()),
        });
        entry.count += 1;
        Arc::clone(&entry.access)
    }

    fn free_locked(table: &mut HashMap<V, Entry>, value: &V) -> Option<Arc<Access>> {
        let entry = table.get_mut(value)?;
        entry.count -= 1;
        let access = Arc::clone(&entry.access);
        if entry.count == 0 {
            table.remove(value);
        }
        Some(access)
    }

    fn do_acquire(
        access: &Access,
        mode: AccessMode,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        match mode {
            AccessMode::Parallel => access.acquire_parallel(blocking, timeout),
            AccessMode::Exclusive => access.acquire_exclusive(blocking, timeout),
        }
    }

    fn do_release(access: &Access, mode: AccessMode) {
        match mode {
            AccessMode::Parallel => access.release_parallel(),
            AccessMode::Exclusive => access.release_exclusive(),
        }
    }

    /// Acquire `value` in `mode`. Every successful call must be paired with a
    /// [`AccessManager::leave`] in the same mode.
    pub fn access(
        &self,
        value: &V,
        mode: AccessMode,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let access = {
            let mut table = self.table.lock();
            Self::create_locked(&mut table, value)
        };
        let result = Self::do_acquire(&access, mode, blocking, timeout);
        if result.is_err() {
            let mut table = self.table.lock();
            Self::free_locked(&mut table, value);
        }
        result
    }

    /// Release `value` acquired in `mode`.
    pub fn leave(&self, value: &V, mode: AccessMode) {
        let access = {
            let mut table = self.table.lock();
            Self::free_locked(&mut table, value)
        };
        debug_assert!(access.is_some(), "leave without matching access");
        if let Some(access) = access {
            Self::do_release(&access, mode);
        }
    }

    /// Atomically acquire a set of values in `mode`.
    ///
    /// Values are sorted before acquisition so that two callers with
    /// overlapping but differently ordered sets cannot deadlock each other.
    /// Values that are immediately free are taken under the table lock;
    /// contended ones are then acquired in sorted order against a shared
    /// remaining-time budget. On any failure every lock taken within this
    /// call is released before the error is returned.
    pub fn mass_access(
        &self,
        values: &[V],
        mode: AccessMode,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut sorted: Vec<V> = values.to_vec();
        sorted.sort();
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut acquired: Vec<Arc<Access>> = Vec::new();
        let mut deferred: Vec<Arc<Access>> = Vec::new();
        {
            let mut table = self.table.lock();
            for value in &sorted {
                let access = Self::create_locked(&mut table, value);
                match Self::do_acquire(&access, mode, false, None) {
                    Ok(()) => acquired.push(access),
                    Err(_) => deferred.push(access),
                }
            }
        }

        for i in 0..deferred.len() {
            let result = match deadline {
                None => Self::do_acquire(&deferred[i], mode, blocking, None),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        Err(Error::Timeout)
                    } else {
                        Self::do_acquire(&deferred[i], mode, blocking, Some(d - now))
                    }
                }
            };
            if let Err(e) = result {
                {
                    let mut table = self.table.lock();
                    for value in &sorted {
                        Self::free_locked(&mut table, value);
                    }
                }
                for access in &acquired {
                    Self::do_release(access, mode);
                }
                for access in deferred.iter().take(i) {
                    Self::do_release(access, mode);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Release a set of values acquired via [`AccessManager::mass_access`].
    pub fn mass_leave(&self, values: &[V], mode: AccessMode) {
        let mut sorted: Vec<V> = values.to_vec();
        sorted.sort();
        let accesses: Vec<Option<Arc<Access>>> = {
            let mut table = self.table.lock();
            sorted
                .iter()
                .map(|value| Self::free_locked(&mut table, value))
                .collect()
        };
        for access in accesses.into_iter().flatten() {
            Self::do_release(&access, mode);
        }
    }

    /// Values that currently have a live lock object.
    pub fn managed_values(&self) -> Vec<V> {
        self.table.lock().keys().cloned().collect()
    }

    /// Whether `value` currently has a live lock object.
    pub fn manages_value(&self, value: &V) -> bool {
        self.table.lock().contains_key(value)
    }

    /// Number of interested callers for `value` (0 when idle).
    pub fn access_count(&self, value: &V) -> usize {
        self.table.lock().get(value).map_or(0, |e| e.count)
    }
}

impl<V> Default for AccessManager<V>
where
    V: Ord + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
