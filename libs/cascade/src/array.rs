//! SystemArray: a node's set of child Systems
//!
//! Children arrive either through an [`Acceptor`] (the array is a server) or
//! by dialing out with a [`Connector`] (the child is itself a server). Both
//! paths build the System through the application's [`ChildFactory`].
//!
//! # Inbound routing
//!
//! Envelopes a child System does not handle itself are routed here:
//! 1. observers' `intercept` (round bookkeeping consumes replies here)
//! 2. the array's own handler table
//! 3. observers' `unhandled` (a mediator forwards to its chief here)
//! 4. otherwise logged as unhandled and dropped
//!
//! # Lock Ordering
//!
//! `systems` and `observers` are only held long enough to copy them out;
//! no callback or send runs while either is locked.

use crate::handlers::HandlerTable;
use crate::metrics::ArrayMetrics;
use crate::role::Role;
use crate::system::{System, SystemOwner, UNASSIGNED};
use crate::{Result, SystemError};
use codec::{Document, Invoke};
use dashmap::DashMap;
use network::{Acceptor, Connection, Connector};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Builds the System for a new connection from its description
/// (`<system key=".." peer=".."/>`)
pub trait ChildFactory: Send + Sync {
    fn create_child(&self, description: &Document) -> System;
}

impl<F> ChildFactory for F
where
    F: Fn(&Document) -> System + Send + Sync,
{
    fn create_child(&self, description: &Document) -> System {
        self(description)
    }
}

/// Factory producing plain Systems with configured defaults
#[derive(Debug, Clone)]
pub struct SystemFactory {
    pub initial_performance: f64,
    pub history_limit: usize,
}

impl Default for SystemFactory {
    fn default() -> Self {
        Self {
            initial_performance: 1.0,
            history_limit: 256,
        }
    }
}

impl ChildFactory for SystemFactory {
    fn create_child(&self, description: &Document) -> System {
        System::from_description(description)
            .with_performance(self.initial_performance)
            .with_history_limit(self.history_limit)
    }
}

/// Hooks for components layered over an array
pub trait ArrayObserver: Send + Sync {
    /// First look at a routed envelope; return `None` to consume it
    fn intercept(&self, _system: &Arc<System>, invoke: Invoke) -> Option<Invoke> {
        Some(invoke)
    }

    /// Last look at an envelope no handler accepted; return `None` to consume it
    fn unhandled(&self, _system: &Arc<System>, invoke: Invoke) -> Option<Invoke> {
        Some(invoke)
    }

    fn joined(&self, _system: &Arc<System>) {}

    fn departed(&self, _system: &Arc<System>) {}
}

pub struct SystemArray {
    /// Insertion order is the allocation tie-break order
    systems: RwLock<Vec<Arc<System>>>,
    roles: DashMap<String, Arc<Role>>,
    handlers: HandlerTable,
    factory: Arc<dyn ChildFactory>,
    observers: RwLock<Vec<Weak<dyn ArrayObserver>>>,
    metrics: ArrayMetrics,
    next_key: AtomicU64,
    identity: AtomicI64,
    next_child_identity: AtomicI64,
    listening_on: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    self_ref: Weak<SystemArray>,
}

impl SystemArray {
    pub fn new(factory: Arc<dyn ChildFactory>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            systems: RwLock::new(Vec::new()),
            roles: DashMap::new(),
            handlers: HandlerTable::new(),
            factory,
            observers: RwLock::new(Vec::new()),
            metrics: ArrayMetrics::default(),
            next_key: AtomicU64::new(1),
            identity: AtomicI64::new(UNASSIGNED),
            next_child_identity: AtomicI64::new(1),
            listening_on: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn add_observer(&self, observer: Weak<dyn ArrayObserver>) {
        self.observers.write().push(observer);
    }

    fn observers(&self) -> Vec<Arc<dyn ArrayObserver>> {
        let mut observers = self.observers.write();
        observers.retain(|observer| observer.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    /// Wrap an established connection as a child System
    pub fn add_connection(&self, connection: Connection) -> Arc<System> {
        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        let description = Document::new("system")
            .with_attribute("key", key)
            .with_attribute("peer", connection.peer());
        let system = Arc::new(self.factory.create_child(&description));

        // Member before attach, so an immediate disconnect still finds it
        self.systems.write().push(system.clone());
        let owner: Weak<dyn SystemOwner> = self.self_ref.clone();
        system.attach(connection, owner);
        ArrayMetrics::bump(&self.metrics.systems_joined);
        info!(system = key, peer = %system.peer(), "System joined array");

        if self.identity() != UNASSIGNED {
            self.assign_identity(&system);
        }
        for observer in self.observers() {
            observer.joined(&system);
        }
        system
    }

    /// Accept children from `acceptor` until it closes; returns its label
    pub fn open<A>(&self, mut acceptor: A) -> String
    where
        A: Acceptor + 'static,
    {
        let label = acceptor.local_label();
        *self.listening_on.lock() = Some(label.clone());
        info!(listen = %label, "Array accepting children");

        let weak = self.self_ref.clone();
        let handle = tokio::spawn(async move {
            loop {
                match acceptor.accept().await {
                    Ok(connection) => match weak.upgrade() {
                        Some(array) => {
                            array.add_connection(connection);
                        }
                        None => break,
                    },
                    Err(e) if e.is_retryable() => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Err(e) => {
                        info!(error = %e, "Acceptor closed");
                        break;
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
        label
    }

    /// Dial a child that is itself listening
    pub async fn connect_child(&self, connector: &dyn Connector, address: &str) -> Result<Arc<System>> {
        let connection = connector.connect(address).await?;
        Ok(self.add_connection(connection))
    }

    /// Label of the acceptor passed to [`open`](Self::open), if any
    pub fn listening_on(&self) -> Option<String> {
        self.listening_on.lock().clone()
    }

    /// Send to every connected child; returns how many accepted it
    pub fn send_data(&self, invoke: &Invoke) -> usize {
        self.active_systems()
            .iter()
            .filter(|system| match system.send_data(invoke) {
                Ok(()) => true,
                Err(e) => {
                    warn!(system = system.key(), error = %e, "Broadcast send failed");
                    false
                }
            })
            .count()
    }

    /// Send to one child by key
    pub fn send_to(&self, key: u64, invoke: &Invoke) -> Result<()> {
        let system = self
            .system(key)
            .ok_or_else(|| SystemError::connection_lost(format!("system {}", key)))?;
        system.send_data(invoke)
    }

    pub fn system(&self, key: u64) -> Option<Arc<System>> {
        self.systems.read().iter().find(|s| s.key() == key).cloned()
    }

    /// Snapshot of every member, in insertion order
    pub fn systems(&self) -> Vec<Arc<System>> {
        self.systems.read().clone()
    }

    /// Snapshot of connected members, in insertion order
    pub fn active_systems(&self) -> Vec<Arc<System>> {
        self.systems
            .read()
            .iter()
            .filter(|system| system.is_connected())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.systems.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.read().is_empty()
    }

    /// Role by name, created on first reference
    pub fn get_role(&self, name: &str) -> Arc<Role> {
        self.roles
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Role::new(name)))
            .clone()
    }

    pub fn role_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.roles.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn identity(&self) -> i64 {
        self.identity.load(Ordering::SeqCst)
    }

    /// Take an identity and hand identities down to unassigned children
    pub fn set_identity(&self, identity: i64) {
        self.identity.store(identity, Ordering::SeqCst);
        info!(identity, "Array identity assigned");

        for system in self.systems() {
            if system.identity() == UNASSIGNED {
                self.assign_identity(&system);
            }
        }
    }

    fn assign_identity(&self, system: &Arc<System>) {
        let child = self.next_child_identity.fetch_add(1, Ordering::SeqCst);
        system.set_identity(child);

        let result = system
            .send_data(&Invoke::new("set_uid").with(child))
            .and_then(|()| system.send_data(&Invoke::new("set_master_uid").with(self.identity())));
        match result {
            Ok(()) => debug!(system = system.key(), identity = child, "Child identity assigned"),
            Err(e) => warn!(system = system.key(), error = %e, "Failed to send child identity"),
        }
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn metrics(&self) -> &ArrayMetrics {
        &self.metrics
    }

    /// Close every child connection and stop accepting
    pub fn shutdown(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        for system in self.systems() {
            system.close();
        }
    }
}

impl SystemOwner for SystemArray {
    fn reply_data(&self, system: &Arc<System>, invoke: Invoke) {
        let observers = self.observers();

        let mut invoke = invoke;
        for observer in &observers {
            match observer.intercept(system, invoke) {
                Some(passed) => invoke = passed,
                None => return,
            }
        }

        match self.handlers.apply(&invoke, system) {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                ArrayMetrics::bump(&self.metrics.invokes_dropped);
                warn!(system = system.key(), error = %e, "Dropping invoke");
                return;
            }
        }

        for observer in &observers {
            match observer.unhandled(system, invoke) {
                Some(passed) => invoke = passed,
                None => return,
            }
        }

        ArrayMetrics::bump(&self.metrics.invokes_unhandled);
        let error = SystemError::UnhandledInvoke {
            listener: invoke.listener().to_string(),
        };
        warn!(system = system.key(), error = %error, "No handler accepted invoke");
    }

    fn system_disconnected(&self, system: &Arc<System>) {
        let removed = {
            let mut systems = self.systems.write();
            let before = systems.len();
            systems.retain(|member| member.key() != system.key());
            systems.len() != before
        };
        if !removed {
            return;
        }

        for role in self.roles.iter() {
            role.value().remove(system.key());
        }
        ArrayMetrics::bump(&self.metrics.systems_departed);
        info!(system = system.key(), "System departed array");

        for observer in self.observers() {
            observer.departed(system);
        }
    }
}

impl Drop for SystemArray {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}
