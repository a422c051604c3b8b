//! C3 — process-wide name registry (spec §4.3). `unique` names reject a
//! second registration; `alias` names allow several refs under one name
//! and resolve to the highest-priority live entry, oldest first on ties.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::{Process, Ref};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("name {0} is already registered")]
    NameTaken(String),
    #[error("name {0} was registered in a different mode (unique vs. alias)")]
    ModeMismatch(String),
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum Mode {
    Unique,
    Alias,
}

struct Entry {
    process_ref: Ref,
    process: Arc<dyn Process>,
    mode: Mode,
    priority: i64,
    registered_at: u64,
}

/// Process-wide `name -> Ref` map. One instance is meant to be shared
/// (behind an `Arc`) across everything that can spawn processes on a node.
#[derive(Default)]
pub struct Registry {
    by_name: DashMap<String, Vec<Entry>>,
    names_by_ref: DashMap<Ref, Vec<String>>,
    order: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_order(&self) -> u64 {
        self.order.fetch_add(1, Ordering::Relaxed)
    }

    /// `unique` registration: fails if `name` is already taken.
    pub fn register_unique(
        &self,
        name: impl Into<String>,
        process_ref: Ref,
        process: Arc<dyn Process>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        let mut slot = self.by_name.entry(name.clone()).or_default();
        if !slot.is_empty() {
            return Err(RegistryError::NameTaken(name));
        }
        slot.push(Entry {
            process_ref: process_ref.clone(),
            process,
            mode: Mode::Unique,
            priority: 0,
            registered_at: self.next_order(),
        });
        drop(slot);
        self.names_by_ref.entry(process_ref).or_default().push(name);
        Ok(())
    }

    /// `alias` registration: many refs may share `name`; `lookup` returns
    /// the highest-`priority` live entry, earliest-registered wins ties.
    pub fn register_alias(
        &self,
        name: impl Into<String>,
        process_ref: Ref,
        process: Arc<dyn Process>,
        priority: i64,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        let mut slot = self.by_name.entry(name.clone()).or_default();
        if slot.first().is_some_and(|e| e.mode == Mode::Unique) {
            return Err(RegistryError::ModeMismatch(name));
        }
        slot.push(Entry {
            process_ref: process_ref.clone(),
            process,
            mode: Mode::Alias,
            priority,
            registered_at: self.next_order(),
        });
        drop(slot);
        self.names_by_ref.entry(process_ref).or_default().push(name);
        Ok(())
    }

    /// Removes `name` only if its current entry (for `unique`) or any
    /// entry (for `alias`) matches `process_ref`. No-op otherwise.
    pub fn unregister(&self, name: &str, process_ref: &Ref) {
        if let Some(mut slot) = self.by_name.get_mut(name) {
            slot.retain(|e| &e.process_ref != process_ref);
        }
        if let Some(mut names) = self.names_by_ref.get_mut(process_ref) {
            names.retain(|n| n != name);
        }
    }

    /// Must be called by the runtime when a process terminates: removes
    /// every name entry belonging to it, across every name.
    pub fn on_process_terminated(&self, process_ref: &Ref) {
        if let Some((_, names)) = self.names_by_ref.remove(process_ref) {
            for name in names {
                if let Some(mut slot) = self.by_name.get_mut(&name) {
                    slot.retain(|e| &e.process_ref != process_ref);
                }
            }
        }
    }

    /// Returns the highest-priority live ref registered under `name`, or
    /// `None` if nothing live remains. Dead entries are pruned lazily.
    pub fn lookup(&self, name: &str) -> Option<Ref> {
        let mut slot = self.by_name.get_mut(name)?;
        slot.retain(|e| e.process.is_running());
        slot.iter()
            .max_by_key(|e| (e.priority, std::cmp::Reverse(e.registered_at)))
            .map(|e| e.process_ref.clone())
    }

    pub fn whereis(&self, name: &str) -> Option<Ref> {
        self.lookup(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct Dummy {
        running: AtomicBool,
    }
    #[async_trait::async_trait]
    impl Process for Dummy {
        fn id(&self) -> &str {
            "dummy"
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::Acquire)
        }
        fn send_system(&self, _signal: crate::mailbox::SystemSignal) {}
        async fn stop(&self, _reason: crate::ExitReason, _timeout: std::time::Duration) {}
        async fn wait_stopped(&self) -> crate::ExitReason {
            crate::ExitReason::Normal
        }
    }

    fn dummy(running: bool) -> Arc<dyn Process> {
        Arc::new(Dummy {
            running: AtomicBool::new(running),
        })
    }

    #[test]
    fn unique_rejects_second_registration() {
        let reg = Registry::new();
        let r1 = Ref::local("p1");
        let r2 = Ref::local("p2");
        reg.register_unique("svc", r1.clone(), dummy(true)).unwrap();
        assert!(reg.register_unique("svc", r2, dummy(true)).is_err());
        assert_eq!(reg.lookup("svc"), Some(r1));
    }

    #[test]
    fn alias_picks_highest_priority_then_earliest() {
        let reg = Registry::new();
        let r1 = Ref::local("p1");
        let r2 = Ref::local("p2");
        let r3 = Ref::local("p3");
        reg.register_alias("pool", r1.clone(), dummy(true), 1).unwrap();
        reg.register_alias("pool", r2.clone(), dummy(true), 5).unwrap();
        reg.register_alias("pool", r3, dummy(true), 5).unwrap();
        // r2 and r3 tie at priority 5; r2 registered first.
        assert_eq!(reg.lookup("pool"), Some(r2));
    }

    #[test]
    fn dead_entries_never_resolve() {
        let reg = Registry::new();
        let r1 = Ref::local("p1");
        reg.register_unique("svc", r1, dummy(false)).unwrap();
        assert_eq!(reg.lookup("svc"), None);
    }

    #[test]
    fn termination_unregisters_every_name() {
        let reg = Registry::new();
        let r1 = Ref::local("p1");
        reg.register_unique("a", r1.clone(), dummy(true)).unwrap();
        reg.register_alias("b", r1.clone(), dummy(true), 0).unwrap();
        reg.on_process_terminated(&r1);
        assert_eq!(reg.lookup("a"), None);
        assert_eq!(reg.lookup("b"), None);
    }
}
