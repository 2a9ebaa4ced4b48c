//! Slave: a node's connection upward to its chief
//!
//! Handles the identity handshake (`set_uid`, `set_master_uid`, answered
//! with `construct`) and routes everything else the chief sends through the
//! slave's handler table. What no handler accepts goes to the installed
//! [`ChiefFallback`], if any.

use crate::handlers::HandlerTable;
use crate::system::{System, SystemOwner, UNASSIGNED};
use crate::{Result, SystemError};
use codec::{
    CodecError, Document, Invoke, InvokeParameter, HISTORY_UID, LOST_PIECES, LOST_RANGES, PIECE_FIRST,
    PIECE_SIZE,
};
use network::{Connection, Connector};
use parking_lot::{Mutex, RwLock};
use std::ops::Range;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

type IdentityListener = Arc<dyn Fn(i64) + Send + Sync>;

/// Receiver for chief envelopes the slave's own handlers did not accept
pub trait ChiefFallback: Send + Sync {
    fn unhandled_from_chief(&self, chief: &Arc<System>, invoke: Invoke);
}

pub struct Slave {
    name: String,
    identity: AtomicI64,
    master_identity: AtomicI64,
    chief: RwLock<Option<Arc<System>>>,
    handlers: HandlerTable,
    identity_listeners: Mutex<Vec<IdentityListener>>,
    fallback: RwLock<Option<Weak<dyn ChiefFallback>>>,
    self_ref: Weak<Slave>,
}

impl Slave {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let slave = Arc::new_cyclic(|self_ref: &Weak<Slave>| Self {
            name: name.into(),
            identity: AtomicI64::new(UNASSIGNED),
            master_identity: AtomicI64::new(UNASSIGNED),
            chief: RwLock::new(None),
            handlers: HandlerTable::new(),
            identity_listeners: Mutex::new(Vec::new()),
            fallback: RwLock::new(None),
            self_ref: self_ref.clone(),
        });
        slave.register_handshake();
        slave
    }

    fn register_handshake(&self) {
        let weak = self.self_ref.clone();
        self.handlers.register("set_uid", 1, move |chief, invoke| {
            let identity = invoke.argument(0)?.as_i64()?;
            if let Some(slave) = weak.upgrade() {
                slave.assume_identity(chief, identity)?;
            }
            Ok(())
        });

        let weak = self.self_ref.clone();
        self.handlers.register("set_master_uid", 1, move |chief, invoke| {
            let master = invoke.argument(0)?.as_i64()?;
            chief.set_identity(master);
            if let Some(slave) = weak.upgrade() {
                slave.master_identity.store(master, Ordering::SeqCst);
            }
            debug!(master, "Master identity received");
            Ok(())
        });
    }

    fn assume_identity(&self, chief: &Arc<System>, identity: i64) -> Result<()> {
        self.identity.store(identity, Ordering::SeqCst);
        info!(identity, name = %self.name, "Identity assigned by chief");

        let description = Document::new("system")
            .with_attribute("uid", identity)
            .with_attribute("name", &self.name);
        chief.send_data(&Invoke::new("construct").with(description))?;

        self.notify_identity(identity);
        Ok(())
    }

    /// Become the root of a tree: identity 0, no chief
    pub fn assume_root(&self) {
        self.identity.store(0, Ordering::SeqCst);
        info!(name = %self.name, "Assuming root identity");
        self.notify_identity(0);
    }

    fn notify_identity(&self, identity: i64) {
        let listeners = self.identity_listeners.lock().clone();
        for listener in listeners {
            listener(identity);
        }
    }

    /// Call `listener` each time this node receives an identity
    pub fn on_identity<F>(&self, listener: F)
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        self.identity_listeners.lock().push(Arc::new(listener));
    }

    pub fn set_fallback(&self, fallback: Weak<dyn ChiefFallback>) {
        *self.fallback.write() = Some(fallback);
    }

    /// Use an established connection as the link to the chief
    pub fn attach(&self, connection: Connection) -> Arc<System> {
        let system = Arc::new(System::new(0, connection.peer()));
        let owner: Weak<dyn SystemOwner> = self.self_ref.clone();
        system.attach(connection, owner);

        let previous = self.chief.write().replace(system.clone());
        if let Some(previous) = previous {
            warn!(peer = %previous.peer(), "Replacing existing chief connection");
            previous.close();
        }
        system
    }

    /// Dial the chief at `address`
    pub async fn connect(&self, connector: &dyn Connector, address: &str) -> Result<Arc<System>> {
        let connection = connector.connect(address).await?;
        info!(chief = %address, name = %self.name, "Connected to chief");
        Ok(self.attach(connection))
    }

    /// Send upward to the chief
    pub fn send_data(&self, invoke: &Invoke) -> Result<()> {
        let chief = self.chief().ok_or(SystemError::NotConnected)?;
        chief.send_data(invoke)
    }

    pub fn close(&self) {
        let chief = self.chief.write().take();
        if let Some(chief) = chief {
            chief.close();
        }
    }

    pub fn chief(&self) -> Option<Arc<System>> {
        self.chief.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.chief().is_some_and(|chief| chief.is_connected())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> i64 {
        self.identity.load(Ordering::SeqCst)
    }

    pub fn master_identity(&self) -> i64 {
        self.master_identity.load(Ordering::SeqCst)
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }
}

impl SystemOwner for Slave {
    fn reply_data(&self, system: &Arc<System>, invoke: Invoke) {
        match self.handlers.apply(&invoke, system) {
            Ok(true) => {}
            Ok(false) => {
                let fallback = self.fallback.read().as_ref().and_then(Weak::upgrade);
                match fallback {
                    Some(fallback) => fallback.unhandled_from_chief(system, invoke),
                    None => warn!(listener = invoke.listener(), "Unhandled invoke from chief"),
                }
            }
            Err(e) => warn!(listener = invoke.listener(), error = %e, "Dropping invoke from chief"),
        }
    }

    fn system_disconnected(&self, system: &Arc<System>) {
        warn!(peer = %system.peer(), name = %self.name, "Lost connection to chief");
        let mut chief = self.chief.write();
        if chief.as_ref().is_some_and(|current| Arc::ptr_eq(current, system)) {
            chief.take();
        }
    }
}

/// The piece range a parent assigned, read back from a dispatched envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceRequest {
    pub uid: u64,
    pub first: u64,
    pub size: u64,
}

impl PieceRequest {
    pub fn from_invoke(invoke: &Invoke) -> std::result::Result<Self, CodecError> {
        let reserved = |name: &'static str| {
            invoke
                .find(name)
                .ok_or(CodecError::MissingReserved { name: name.to_string() })?
                .as_u64()
        };
        Ok(Self {
            uid: reserved(HISTORY_UID)?,
            first: reserved(PIECE_FIRST)?,
            size: reserved(PIECE_SIZE)?,
        })
    }

    pub fn range(&self) -> Range<u64> {
        self.first..self.first.saturating_add(self.size)
    }

    /// Start a reply the parent will account against this round
    pub fn reply(&self, listener: impl Into<String>) -> Invoke {
        Invoke::new(listener).with(InvokeParameter::named(HISTORY_UID, self.uid))
    }
}

/// Pieces a sub-tree could not complete, carried upward on a relayed reply
///
/// ```text
/// _Lost_pieces = 5
/// _Lost_ranges = <lost><range first="10" size="3"/><range first="40" size="2"/></lost>
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LostWork {
    pub pieces: u64,
    pub ranges: Vec<Range<u64>>,
}

impl LostWork {
    pub fn is_empty(&self) -> bool {
        self.pieces == 0
    }

    /// Mark a reply with this loss; nothing is added when no work was lost
    pub fn attach(&self, invoke: &mut Invoke) {
        if self.is_empty() {
            return;
        }
        let ranges = self.ranges.iter().fold(Document::new("lost"), |doc, range| {
            doc.with_child(
                Document::new("range")
                    .with_attribute("first", range.start)
                    .with_attribute("size", range.end - range.start),
            )
        });
        invoke.set_named(LOST_PIECES, self.pieces);
        invoke.set_named(LOST_RANGES, ranges);
    }

    /// Strip the loss markers off a reply, if it carries any
    pub fn take_from(invoke: &mut Invoke) -> std::result::Result<Option<Self>, CodecError> {
        let pieces = invoke.take(LOST_PIECES);
        let ranges = invoke.take(LOST_RANGES);
        let Some(pieces) = pieces else {
            return Ok(None);
        };
        let mut lost = Self {
            pieces: pieces.as_u64()?,
            ranges: Vec::new(),
        };
        if let Some(ranges) = ranges {
            for (index, child) in ranges.as_document()?.children().iter().enumerate() {
                let first = child.attribute_as::<u64>("first");
                let size = child.attribute_as::<u64>("size");
                match (first, size) {
                    (Some(first), Some(size)) => lost.ranges.push(first..first.saturating_add(size)),
                    _ => {
                        return Err(CodecError::InvalidValue {
                            type_tag: LOST_RANGES.to_string(),
                            index,
                            value: format!("{:?}", child),
                        })
                    }
                }
            }
        }
        Ok(Some(lost))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use network::{FrameSink, FrameSource};
    use std::time::Duration;

    async fn next(source: &mut Box<dyn FrameSource>) -> Invoke {
        let frame = tokio::time::timeout(Duration::from_secs(2), source.recv_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        Invoke::from_bytes(&frame).unwrap()
    }

    async fn send(sink: &mut Box<dyn FrameSink>, invoke: Invoke) {
        sink.send_frame(&invoke.to_bytes().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_answers_with_construct() {
        let slave = Slave::new("worker");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        slave.on_identity(move |id| sink_seen.lock().push(id));

        let (ours, theirs) = network::duplex("worker", "chief");
        slave.attach(ours);
        let (_, mut chief_sink, mut chief_source) = theirs.into_split();

        send(&mut chief_sink, Invoke::new("set_uid").with(3)).await;
        send(&mut chief_sink, Invoke::new("set_master_uid").with(0)).await;

        let construct = next(&mut chief_source).await;
        assert_eq!(construct.listener(), "construct");
        let description = construct.argument(0).unwrap().as_document().unwrap();
        assert_eq!(description.attribute("name"), Some("worker"));
        assert_eq!(description.attribute_as::<i64>("uid"), Some(3));

        tokio::time::timeout(Duration::from_secs(2), async {
            while slave.master_identity() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(slave.identity(), 3);
        assert_eq!(*seen.lock(), vec![3]);
    }

    #[test]
    fn test_send_without_chief_is_not_connected() {
        let slave = Slave::new("orphan");
        assert!(matches!(
            slave.send_data(&Invoke::new("status")),
            Err(SystemError::NotConnected)
        ));
        assert!(!slave.is_connected());
    }

    #[test]
    fn test_root_identity_notifies_listeners() {
        let slave = Slave::new("root");
        let seen = Arc::new(AtomicI64::new(UNASSIGNED));
        let sink = seen.clone();
        slave.on_identity(move |id| sink.store(id, Ordering::SeqCst));

        slave.assume_root();
        assert_eq!(slave.identity(), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_piece_request_round_trip() {
        let dispatched = Invoke::new("work")
            .with("payload")
            .with(InvokeParameter::named(HISTORY_UID, 5u64))
            .with(InvokeParameter::named(PIECE_FIRST, 10u64))
            .with(InvokeParameter::named(PIECE_SIZE, 4u64));

        let request = PieceRequest::from_invoke(&dispatched).unwrap();
        assert_eq!(request.range(), 10..14);
        assert_eq!(dispatched.arity(), 1);

        let reply = request.reply("result").with(42);
        assert_eq!(reply.find(HISTORY_UID).unwrap().as_u64().unwrap(), 5);
        assert_eq!(reply.argument(0).unwrap().as_u64().unwrap(), 42);
    }

    #[test]
    fn test_piece_range_saturates_on_hostile_size() {
        let request = PieceRequest {
            uid: 1,
            first: u64::MAX - 1,
            size: 10,
        };
        assert_eq!(request.range(), u64::MAX - 1..u64::MAX);
    }

    #[test]
    fn test_lost_work_travels_on_reply() {
        let lost = LostWork {
            pieces: 5,
            ranges: vec![10..13, 40..42],
        };
        let mut reply = Invoke::new("result").with(7);
        lost.attach(&mut reply);
        assert_eq!(reply.arity(), 1);

        let mut decoded = Invoke::from_bytes(&reply.to_bytes().unwrap()).unwrap();
        assert_eq!(LostWork::take_from(&mut decoded).unwrap(), Some(lost));
        assert!(decoded.find(LOST_PIECES).is_none());
        assert!(decoded.find(LOST_RANGES).is_none());

        let mut clean = Invoke::new("result");
        LostWork::default().attach(&mut clean);
        assert_eq!(LostWork::take_from(&mut clean).unwrap(), None);
    }

    #[test]
    fn test_piece_request_requires_reserved_parameters() {
        let err = PieceRequest::from_invoke(&Invoke::new("work").with(1)).unwrap_err();
        assert_eq!(
            err,
            CodecError::MissingReserved {
                name: HISTORY_UID.to_string()
            }
        );
    }
}
