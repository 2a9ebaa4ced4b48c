//! Roles: capabilities addressed by name instead of by connection
//!
//! A Role holds weak references into its array's Systems. Members that have
//! disconnected and been dropped fall out on the next send.

use crate::system::System;
use codec::Invoke;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct Role {
    name: String,
    members: RwLock<Vec<Weak<System>>>,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add `system`; adding a current member again is a no-op
    pub fn add(&self, system: &Arc<System>) {
        let mut members = self.members.write();
        let present = members
            .iter()
            .filter_map(Weak::upgrade)
            .any(|member| member.key() == system.key());
        if !present {
            members.push(Arc::downgrade(system));
        }
    }

    pub fn remove(&self, key: u64) {
        self.members
            .write()
            .retain(|member| member.upgrade().is_some_and(|m| m.key() != key));
    }

    /// Live, connected members
    pub fn members(&self) -> Vec<Arc<System>> {
        self.members
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|member| member.is_connected())
            .collect()
    }

    /// Fan `invoke` out to every member; returns how many accepted it
    pub fn send_data(&self, invoke: &Invoke) -> usize {
        self.members.write().retain(|member| member.strong_count() > 0);

        let mut sent = 0;
        for member in self.members() {
            match member.send_data(invoke) {
                Ok(()) => sent += 1,
                Err(e) => warn!(
                    role = %self.name,
                    system = member.key(),
                    error = %e,
                    "Role member send failed"
                ),
            }
        }
        debug!(role = %self.name, listener = invoke.listener(), sent, "Role fan-out");
        sent
    }
}
