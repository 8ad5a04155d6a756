//! Reference-counted set of registers consumers currently care about.

use crate::error::RegistryError;
use crate::payload::RegisterKey;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

/// Tracks how many consumers observe each register.
///
/// Every `attach` must be matched by one `detach`; a register is polled
/// while its count is above zero.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    counts: Mutex<BTreeMap<RegisterKey, usize>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn counts(&self) -> MutexGuard<'_, BTreeMap<RegisterKey, usize>> {
        // The map is always left consistent, so a poisoned lock is still usable
        self.counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds one observer of `key`.
    pub fn attach(&self, key: RegisterKey) {
        let count = {
            let mut counts = self.counts();
            let count = counts.entry(key).or_insert(0);
            *count += 1;
            *count
        };
        log::debug!("Attached register {key} (count {count})");
    }

    /// Removes one observer of `key`, forgetting the key at zero.
    ///
    /// Detaching a key that is not attached leaves the registry unchanged.
    pub fn detach(&self, key: RegisterKey) -> Result<(), RegistryError> {
        let remaining = {
            let mut counts = self.counts();
            match counts.get_mut(&key) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    Some(*count)
                }
                Some(_) => {
                    counts.remove(&key);
                    Some(0)
                }
                None => None,
            }
        };

        match remaining {
            Some(count) => {
                log::debug!("Detached register {key} (count {count})");
                Ok(())
            }
            None => {
                log::warn!("Detach of register {key} which is not attached");
                Err(RegistryError::NotAttached(key))
            }
        }
    }

    /// Number of observers of `key`.
    pub fn count(&self, key: RegisterKey) -> usize {
        self.counts().get(&key).copied().unwrap_or(0)
    }

    /// Point-in-time copy of the active keys, in ascending order.
    pub fn snapshot(&self) -> BTreeSet<RegisterKey> {
        self.counts().keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.counts().is_empty()
    }

    pub fn len(&self) -> usize {
        self.counts().len()
    }
}
