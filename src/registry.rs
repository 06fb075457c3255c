//! Table of active redirections.
//!
//! [`RedirectionRegistry`] maps the identity of every rewritten method to its
//! [`PatchRecord`]. A method is identified by a [`MethodKey`]: its token together with
//! the [`HostId`] of the platform that owns its code, since tokens of different hosts
//! overlap. The registry holds at most one active record per key and is the single
//! point where installs and removals are serialized: [`install`](RedirectionRegistry::install)
//! and [`uninstall`](RedirectionRegistry::uninstall) run the actual memory writes while
//! holding the registry lock, so two threads can never patch the same method at once.
//!
//! A process normally uses the [`global`](RedirectionRegistry::global) instance; tests and
//! isolated hosts can create their own.
//!
//! # Events
//!
//! A listener set with [`set_listener`](RedirectionRegistry::set_listener) observes every
//! registration and removal, in order, while the lock is held:
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use redirection::{RedirectionRegistry, RegistryEvent};
//!
//! let registry = RedirectionRegistry::new();
//! let events = Arc::new(Mutex::new(Vec::new()));
//! let sink = events.clone();
//! registry.set_listener(move |event: &RegistryEvent| {
//!     sink.lock().unwrap().push(*event);
//! })?;
//! # Ok::<(), redirection::Error>(())
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, OnceLock},
};

use crate::{metadata::token::Token, patch::PatchRecord, platform::HostId, Error, Result};

/// Process-wide identity of a method: the owning host and the method's token there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodKey {
    /// Platform that owns the method's code
    pub host: HostId,
    /// Token of the method within that host
    pub method: Token,
}

impl MethodKey {
    /// Creates a key.
    #[must_use]
    pub fn new(host: HostId, method: Token) -> Self {
        MethodKey { host, method }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.method, self.host)
    }
}

/// A change of the registry's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryEvent {
    /// A record for the method was registered.
    Registered(MethodKey),
    /// The record for the method was removed.
    Unregistered(MethodKey),
}

/// Observer of [`RegistryEvent`]s.
pub type RegistryListener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    active: HashMap<MethodKey, Arc<PatchRecord>>,
    next_sequence: u64,
    listener: Option<RegistryListener>,
}

impl RegistryState {
    fn insert(&mut self, source: MethodKey, mut record: PatchRecord) -> Arc<PatchRecord> {
        self.next_sequence += 1;
        record.set_sequence(self.next_sequence);

        let record = Arc::new(record);
        self.active.insert(source, record.clone());
        self.notify(RegistryEvent::Registered(source));
        record
    }

    fn remove(&mut self, source: MethodKey) -> Option<Arc<PatchRecord>> {
        let record = self.active.remove(&source)?;
        self.notify(RegistryEvent::Unregistered(source));
        Some(record)
    }

    fn notify(&self, event: RegistryEvent) {
        if let Some(listener) = &self.listener {
            listener(&event);
        }
    }

    /// Follows redirection targets from `target`; `true` if the chain reaches `source`.
    fn closes_cycle(&self, source: MethodKey, target: MethodKey) -> bool {
        let mut current = target;
        let mut hops = 0;
        loop {
            if current == source {
                return true;
            }
            match self.active.get(&current) {
                Some(record) if hops <= self.active.len() => {
                    current = record.target_key();
                    hops += 1;
                }
                _ => return false,
            }
        }
    }
}

/// Active redirections, keyed by the rewritten method; see the
/// [module documentation](self).
#[derive(Default)]
pub struct RedirectionRegistry {
    state: Mutex<RegistryState>,
}

impl RedirectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<RedirectionRegistry> {
        static GLOBAL: OnceLock<Arc<RedirectionRegistry>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(RedirectionRegistry::new()))
            .clone()
    }

    /// Installs `listener`, replacing any previous one.
    ///
    /// The listener runs while the registry lock is held and must not call back into the
    /// registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the registry lock is poisoned.
    pub fn set_listener<F>(&self, listener: F) -> Result<()>
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        lock!(self.state)?.listener = Some(Arc::new(listener));
        Ok(())
    }

    /// Removes the listener.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the registry lock is poisoned.
    pub fn clear_listener(&self) -> Result<()> {
        lock!(self.state)?.listener = None;
        Ok(())
    }

    /// Registers an already applied record under its [`key`](PatchRecord::key).
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyPatched`] if the method has an active record.
    pub fn register(&self, record: PatchRecord) -> Result<Arc<PatchRecord>> {
        let source = record.key();
        let mut state = lock!(self.state)?;
        if state.active.contains_key(&source) {
            return Err(Error::AlreadyPatched(source.method));
        }
        Ok(state.insert(source, record))
    }

    /// Checks, applies and registers a redirection of `source` to `target` as one step.
    ///
    /// `apply` runs under the registry lock, after the duplicate check and (if
    /// `detect_cycles` is set) the cycle check have passed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyPatched`] or [`Error::RedirectCycle`] without calling
    /// `apply`, or whatever `apply` fails with.
    pub fn install<F>(
        &self,
        source: MethodKey,
        target: MethodKey,
        detect_cycles: bool,
        apply: F,
    ) -> Result<Arc<PatchRecord>>
    where
        F: FnOnce() -> Result<PatchRecord>,
    {
        let mut state = lock!(self.state)?;
        if state.active.contains_key(&source) {
            return Err(Error::AlreadyPatched(source.method));
        }
        if detect_cycles && state.closes_cycle(source, target) {
            return Err(Error::RedirectCycle {
                source_method: source.method,
                target: target.method,
            });
        }

        let record = apply()?;
        Ok(state.insert(source, record))
    }

    /// Reverts and removes the record of `source` as one step.
    ///
    /// Returns `Ok(None)` if nothing is registered for `source`. If `revert` fails the
    /// record stays registered.
    ///
    /// # Errors
    ///
    /// Returns whatever `revert` fails with.
    pub fn uninstall<F>(&self, source: MethodKey, revert: F) -> Result<Option<Arc<PatchRecord>>>
    where
        F: FnOnce(&PatchRecord) -> Result<()>,
    {
        let mut state = lock!(self.state)?;
        let Some(record) = state.active.get(&source).cloned() else {
            return Ok(None);
        };

        revert(&record)?;
        Ok(state.remove(source))
    }

    /// The active record of `source`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the registry lock is poisoned.
    pub fn lookup(&self, source: MethodKey) -> Result<Option<Arc<PatchRecord>>> {
        Ok(lock!(self.state)?.active.get(&source).cloned())
    }

    /// Removes the record of `source` without reverting it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the registry lock is poisoned.
    pub fn unregister(&self, source: MethodKey) -> Result<Option<Arc<PatchRecord>>> {
        Ok(lock!(self.state)?.remove(source))
    }

    /// Every active record, in application order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the registry lock is poisoned.
    pub fn all_active(&self) -> Result<Vec<Arc<PatchRecord>>> {
        let mut records: Vec<_> = lock!(self.state)?.active.values().cloned().collect();
        records.sort_by_key(|record| record.sequence());
        Ok(records)
    }

    /// Returns `true` if `source` has an active record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the registry lock is poisoned.
    pub fn contains(&self, source: MethodKey) -> Result<bool> {
        Ok(lock!(self.state)?.active.contains_key(&source))
    }

    /// Number of active records.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the registry lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(lock!(self.state)?.active.len())
    }

    /// Returns `true` if nothing is active.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the registry lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(lock!(self.state)?.active.is_empty())
    }
}

impl fmt::Debug for RedirectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("RedirectionRegistry");
        match self.state.lock() {
            Ok(state) => debug
                .field("active", &state.active.len())
                .field("has_listener", &state.listener.is_some()),
            Err(_) => debug.field("state", &"<poisoned>"),
        };
        debug.finish()
    }
}
