//! Listener handler tables
//!
//! Handlers are registered by listener name with a declared arity. Lookup is
//! by name at dispatch time; an unknown name is not an error, it is reported
//! back as `Ok(false)` so the caller can offer the envelope to the next
//! candidate along the relay chain.

use crate::system::System;
use crate::Result;
use codec::Invoke;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Callback invoked with the System the envelope arrived on
pub type Handler = Arc<dyn Fn(&Arc<System>, &Invoke) -> Result<()> + Send + Sync>;

struct Entry {
    arity: usize,
    handler: Handler,
}

/// Listener name to handler mapping
#[derive(Default)]
pub struct HandlerTable {
    entries: RwLock<HashMap<String, Entry>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `listener`, replacing any previous registration
    pub fn register<F>(&self, listener: impl Into<String>, arity: usize, handler: F)
    where
        F: Fn(&Arc<System>, &Invoke) -> Result<()> + Send + Sync + 'static,
    {
        self.entries.write().insert(
            listener.into(),
            Entry {
                arity,
                handler: Arc::new(handler),
            },
        );
    }

    pub fn unregister(&self, listener: &str) -> bool {
        self.entries.write().remove(listener).is_some()
    }

    pub fn contains(&self, listener: &str) -> bool {
        self.entries.read().contains_key(listener)
    }

    pub fn listeners(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the handler for `invoke`.
    ///
    /// Returns `Ok(false)` when no handler is registered, and a format error
    /// when the argument count differs from the declared arity. The handler
    /// runs outside the table lock, so it may register further handlers.
    pub fn apply(&self, invoke: &Invoke, source: &Arc<System>) -> Result<bool> {
        let entry = self
            .entries
            .read()
            .get(invoke.listener())
            .map(|entry| (entry.arity, entry.handler.clone()));

        let Some((arity, handler)) = entry else {
            return Ok(false);
        };

        invoke.expect_arity(arity)?;
        handler(source, invoke)?;
        Ok(true)
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("listeners", &self.listeners())
            .finish()
    }
}
