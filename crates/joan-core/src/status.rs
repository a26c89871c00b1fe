//! [`StatusRegistry`] – one state machine per module, observable by all.
//!
//! Modules use the registry to look up another module's current state or to
//! subscribe to its transitions, e.g. the simulator bridge following the
//! hardware manager.  Subscribing replaces periodic polling of
//! `current_state`.

use std::collections::HashMap;
use std::sync::Arc;

use joan_types::{JoanError, ModuleId, State};
use parking_lot::RwLock;

use crate::state_machine::{StateChange, StateMachine};

/// Process-scoped registry of module state machines.
///
/// Built once by the application and shared as `Arc<StatusRegistry>`.
#[derive(Default)]
pub struct StatusRegistry {
    machines: RwLock<HashMap<ModuleId, Arc<StateMachine>>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `machine` under its module id.
    ///
    /// # Errors
    ///
    /// [`JoanError::DuplicateModule`] when a machine for that module is
    /// already registered.
    pub fn register(&self, machine: Arc<StateMachine>) -> Result<(), JoanError> {
        let id = machine.module();
        let mut machines = self.machines.write();
        if machines.contains_key(&id) {
            return Err(JoanError::DuplicateModule(id));
        }
        machines.insert(id, machine);
        Ok(())
    }

    /// Remove `machine` if it is the one registered under its module id.
    /// Returns whether it was removed.
    pub fn unregister(&self, machine: &Arc<StateMachine>) -> bool {
        let mut machines = self.machines.write();
        match machines.get(&machine.module()) {
            Some(registered) if Arc::ptr_eq(registered, machine) => {
                machines.remove(&machine.module());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: ModuleId) -> Option<Arc<StateMachine>> {
        self.machines.read().get(&id).cloned()
    }

    pub fn current_state(&self, id: ModuleId) -> Option<State> {
        self.get(id).map(|m| m.current_state())
    }

    /// Add `listener` to the state machine of `id`.
    ///
    /// # Errors
    ///
    /// [`JoanError::NotRegistered`] when `id` has no machine yet.
    pub fn subscribe<F>(&self, id: ModuleId, listener: F) -> Result<(), JoanError>
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let machine = self.get(id).ok_or(JoanError::NotRegistered(id))?;
        machine.add_state_change_listener(listener);
        Ok(())
    }

    /// Registered module ids in [`ModuleId::ALL`] order.
    pub fn available_keys(&self) -> impl Iterator<Item = ModuleId> + Clone + '_ {
        ModuleId::ALL
            .into_iter()
            .filter(move |id| self.machines.read().contains_key(id))
    }

    /// Current state of every registered module.
    pub fn states(&self) -> Vec<(ModuleId, State)> {
        self.available_keys()
            .filter_map(|id| self.current_state(id).map(|s| (id, s)))
            .collect()
    }
}
