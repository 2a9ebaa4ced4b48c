//! System: one end of one connection
//!
//! A parent holds one System per child; a child holds one System for its
//! chief. Each attached System runs two tasks, in the relay pattern:
//!
//! - **Read task**: frames from the transport are decoded and offered to the
//!   System's own handlers, then to the owner.
//! - **Write task**: drains the outbound queue into the transport.
//!
//! `send_data` only enqueues, so it never waits on the network and is safe to
//! call from any dispatch path. Either task ending marks the System
//! disconnected, which is terminal and reported to the owner exactly once.

use crate::handlers::HandlerTable;
use crate::{Result, SystemError};
use bytes::Bytes;
use codec::{Document, Invoke};
use network::Connection;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Identity of a System that has not been assigned one yet
pub const UNASSIGNED: i64 = -1;

const DEFAULT_HISTORY_LIMIT: usize = 256;

/// Receiver of whatever a System could not handle itself
pub trait SystemOwner: Send + Sync {
    /// An envelope no handler on `system` accepted
    fn reply_data(&self, system: &Arc<System>, invoke: Invoke);

    /// `system` lost its connection; called once per System
    fn system_disconnected(&self, system: &Arc<System>);
}

/// One dispatched piece range and its outcome
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeHistory {
    pub uid: u64,
    pub listener: String,
    pub first: u64,
    pub size: u64,
    pub dispatched_at: Instant,
    /// `None` while outstanding, or if the piece was lost
    pub elapsed: Option<Duration>,
}

/// One connection endpoint
pub struct System {
    key: u64,
    peer: String,
    identity: AtomicI64,
    name: RwLock<Option<String>>,
    performance: Mutex<f64>,
    last_elapsed: Mutex<Option<Duration>>,
    history: Mutex<VecDeque<InvokeHistory>>,
    history_limit: usize,
    handlers: HandlerTable,
    connected: AtomicBool,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    owner: RwLock<Option<Weak<dyn SystemOwner>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl System {
    pub fn new(key: u64, peer: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let system = Self {
            key,
            peer: peer.into(),
            identity: AtomicI64::new(UNASSIGNED),
            name: RwLock::new(None),
            performance: Mutex::new(1.0),
            last_elapsed: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
            handlers: HandlerTable::new(),
            connected: AtomicBool::new(false),
            outbound_tx: Mutex::new(Some(tx)),
            outbound_rx: Mutex::new(Some(rx)),
            owner: RwLock::new(None),
            reader: Mutex::new(None),
        };
        system.register_builtin_handlers();
        system
    }

    /// Build from a `<system key=".." peer=".."/>` connection description
    pub fn from_description(description: &Document) -> Self {
        let key = description.attribute_as::<u64>("key").unwrap_or_default();
        let peer = description.attribute("peer").unwrap_or("unknown");
        Self::new(key, peer)
    }

    pub fn with_performance(self, performance: f64) -> Self {
        *self.performance.lock() = performance;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    fn register_builtin_handlers(&self) {
        // Child confirms its identity: construct(<system uid=".." name=".."/>)
        self.handlers.register("construct", 1, |system, invoke| {
            let description = invoke.argument(0)?.as_document()?;
            if let Some(name) = description.attribute("name") {
                *system.name.write() = Some(name.to_string());
            }
            info!(
                system = system.key,
                uid = ?description.attribute_as::<i64>("uid"),
                name = ?description.attribute("name"),
                "System constructed"
            );
            Ok(())
        });
    }

    /// Start the read and write tasks over `connection`
    pub fn attach(self: &Arc<Self>, connection: Connection, owner: Weak<dyn SystemOwner>) {
        let Some(mut outbound) = self.outbound_rx.lock().take() else {
            warn!(system = self.key, "System already attached; dropping connection");
            return;
        };
        *self.owner.write() = Some(owner);
        self.connected.store(true, Ordering::SeqCst);

        let (peer, mut sink, mut source) = connection.into_split();
        let key = self.key;
        debug!(system = key, peer = %peer, "Attaching system");

        // Writing task: queued frames to the transport
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if let Err(e) = sink.send_frame(&frame).await {
                    warn!(system = key, error = %e, "Failed to write to system");
                    if let Some(system) = weak.upgrade() {
                        system.mark_disconnected();
                    }
                    break;
                }
            }
            if let Err(e) = sink.close().await {
                debug!(system = key, error = %e, "Error closing system sink");
            }
        });

        // Reading task: frames from the transport to the handlers
        let weak = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            loop {
                match source.recv_frame().await {
                    Ok(Some(frame)) => {
                        let Some(system) = weak.upgrade() else { break };
                        match Invoke::from_bytes(&frame) {
                            Ok(invoke) => system.receive(invoke),
                            Err(e) => {
                                warn!(system = key, error = %e, "Dropping malformed envelope")
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(system = key, "System read stream closed");
                        break;
                    }
                    Err(e) => {
                        warn!(system = key, error = %e, "System read error");
                        break;
                    }
                }
            }
            if let Some(system) = weak.upgrade() {
                system.mark_disconnected();
            }
        });
        *self.reader.lock() = Some(reader);
    }

    /// Route an inbound envelope: own handlers first, then the owner
    pub fn receive(self: &Arc<Self>, invoke: Invoke) {
        match self.handlers.apply(&invoke, self) {
            Ok(true) => {}
            Ok(false) => match self.owner() {
                Some(owner) => owner.reply_data(self, invoke),
                None => warn!(
                    system = self.key,
                    listener = invoke.listener(),
                    "Unhandled invoke on detached system"
                ),
            },
            Err(e) => warn!(
                system = self.key,
                listener = invoke.listener(),
                error = %e,
                "Dropping invoke"
            ),
        }
    }

    /// Encode and queue `invoke` for the peer
    pub fn send_data(self: &Arc<Self>, invoke: &Invoke) -> Result<()> {
        if !self.is_connected() {
            return Err(SystemError::connection_lost(&self.peer));
        }
        let frame = Bytes::from(invoke.to_bytes()?);

        let queued = match self.outbound_tx.lock().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        };
        if !queued {
            self.mark_disconnected();
            return Err(SystemError::connection_lost(&self.peer));
        }
        Ok(())
    }

    /// Close the connection; queued frames are still flushed
    pub fn close(self: &Arc<Self>) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.mark_disconnected();
    }

    fn mark_disconnected(self: &Arc<Self>) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender lets the write task drain and close the sink
        self.outbound_tx.lock().take();
        info!(system = self.key, peer = %self.peer, "System disconnected");

        if let Some(owner) = self.owner() {
            owner.system_disconnected(self);
        }
    }

    fn owner(&self) -> Option<Arc<dyn SystemOwner>> {
        self.owner.read().as_ref().and_then(Weak::upgrade)
    }

    /// Store this System's measured time for its last round.
    ///
    /// Weights are recomputed by the owning array from all participants
    /// jointly, so this does not touch `performance`.
    pub fn report_performance(&self, elapsed: Duration) {
        *self.last_elapsed.lock() = Some(elapsed);
    }

    pub fn last_elapsed(&self) -> Option<Duration> {
        *self.last_elapsed.lock()
    }

    pub fn performance(&self) -> f64 {
        *self.performance.lock()
    }

    pub(crate) fn set_performance(&self, performance: f64) {
        *self.performance.lock() = performance;
    }

    pub(crate) fn record_dispatch(&self, uid: u64, listener: &str, first: u64, size: u64) {
        let mut history = self.history.lock();
        if history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(InvokeHistory {
            uid,
            listener: listener.to_string(),
            first,
            size,
            dispatched_at: Instant::now(),
            elapsed: None,
        });
    }

    pub(crate) fn record_completion(&self, uid: u64, elapsed: Duration) {
        let mut history = self.history.lock();
        if let Some(entry) = history.iter_mut().rev().find(|entry| entry.uid == uid) {
            entry.elapsed = Some(elapsed);
        }
    }

    /// Dispatch log, oldest first
    pub fn history(&self) -> Vec<InvokeHistory> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn identity(&self) -> i64 {
        self.identity.load(Ordering::SeqCst)
    }

    pub fn set_identity(&self, identity: i64) {
        self.identity.store(identity, Ordering::SeqCst);
    }

    /// Name the peer reported during the identity handshake
    pub fn name(&self) -> Option<String> {
        self.name.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }
}

impl Drop for System {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("key", &self.key)
            .field("peer", &self.peer)
            .field("identity", &self.identity())
            .field("performance", &self.performance())
            .field("connected", &self.is_connected())
            .finish()
    }
}
