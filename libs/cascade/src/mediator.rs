//! Mediator: a node that is both a parent and a child
//!
//! Downward, a [`ParallelSystemArray`] holds the node's children. Upward, a
//! [`Slave`] holds the connection to the chief. The two are joined three ways:
//!
//! - identity received from the chief is handed down to the array
//! - child envelopes nothing in this node handles are forwarded to the chief
//! - chief envelopes the slave does not handle are offered to the array's
//!   handler table
//!
//! [`Mediator::relay`] adds a fourth, opt-in join: a piece received from the
//! chief is split again across the children and answered with one folded
//! reply, lost work included.
//!
//! ```text
//!              chief
//!                ▲
//!         ┌──────┴──────┐
//!         │    Slave    │  set_uid / set_master_uid / construct
//!         ├─────────────┤
//!         │  Parallel   │  rounds, weights, lost work
//!         │ SystemArray │
//!         └──┬───┬───┬──┘
//!            ▼   ▼   ▼
//!           children
//! ```

use crate::array::{ArrayObserver, ChildFactory, SystemArray, SystemFactory};
use crate::metrics::ArrayMetrics;
use crate::parallel::{ParallelSystemArray, RoundCallbacks, RoundReport};
use crate::slave::{ChiefFallback, LostWork, PieceRequest, Slave};
use crate::system::System;
use crate::{Result, SystemError};
use anyhow::Context;
use codec::{Invoke, InvokeParameter, ParameterValue};
use network::{Connector, TcpAcceptor, TcpConfig, TcpConnector};
use node_config::NodeConfig;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub struct Mediator {
    slave: Arc<Slave>,
    parallel: Arc<ParallelSystemArray>,
}

impl Mediator {
    pub fn new(name: impl Into<String>, factory: Arc<dyn ChildFactory>, smoothing: f64) -> Arc<Self> {
        let array = SystemArray::new(factory);
        let parallel = ParallelSystemArray::new(array.clone(), smoothing);
        let slave = Slave::new(name);

        let weak_array = Arc::downgrade(&array);
        slave.on_identity(move |identity| {
            if let Some(array) = weak_array.upgrade() {
                array.set_identity(identity);
            }
        });

        let mediator = Arc::new(Self { slave, parallel });
        let weak = Arc::downgrade(&mediator);
        let observer: Weak<dyn ArrayObserver> = weak.clone();
        array.add_observer(observer);
        let fallback: Weak<dyn ChiefFallback> = weak;
        mediator.slave.set_fallback(fallback);
        mediator
    }

    /// Build and wire a node from configuration.
    ///
    /// Failing to bind `listen` is fatal. Failing to reach an individual
    /// configured child is logged and skipped.
    pub async fn from_config(config: &NodeConfig) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let factory = SystemFactory {
            initial_performance: config.balancing.initial_performance,
            history_limit: config.balancing.history_limit,
        };
        let mediator = Self::new(config.name.clone(), Arc::new(factory), config.balancing.smoothing);

        let tcp = TcpConfig {
            connect_timeout: config.transport.connect_timeout(),
            max_message_size: config.transport.max_message_size,
            ..TcpConfig::default()
        };

        if let Some(listen) = config.listen {
            let acceptor = TcpAcceptor::bind(listen, tcp.clone())
                .await
                .with_context(|| format!("Failed to open listener on {}", listen))?;
            mediator.array().open(acceptor);
        }

        let connector = TcpConnector::new(tcp);
        match config.chief {
            Some(chief) => {
                mediator
                    .join(&connector, &chief.to_string())
                    .await
                    .with_context(|| format!("Failed to join chief at {}", chief))?;
            }
            None => mediator.become_root(),
        }

        for child in &config.children {
            if let Err(e) = mediator.array().connect_child(&connector, &child.to_string()).await {
                warn!(child = %child, error = %e, "Failed to connect to child");
            }
        }

        info!(name = %config.name, listen = ?mediator.array().listening_on(), "Node ready");
        Ok(mediator)
    }

    /// Take identity 0 and start assigning identities to children
    pub fn become_root(&self) {
        self.slave.assume_root();
    }

    /// Connect upward; identities flow down once the chief assigns one
    pub async fn join(&self, connector: &dyn Connector, address: &str) -> Result<Arc<System>> {
        self.slave.connect(connector, address).await
    }

    /// Split every `listener` piece the chief sends across this node's children.
    ///
    /// Child replies are folded into `initial` with `fold`. When the local
    /// round completes, a single `reply_listener` envelope carrying the folded
    /// value goes back to the chief with the round's lost work attached, so
    /// the chief's own report covers the whole sub-tree. If the piece cannot
    /// be split here (no child connected, or a round already in flight) the
    /// chief is answered at once with the whole piece marked lost.
    pub fn relay<A, F>(
        self: &Arc<Self>,
        listener: impl Into<String>,
        arity: usize,
        reply_listener: impl Into<String>,
        initial: A,
        fold: F,
    ) where
        A: Into<ParameterValue> + Clone + Send + Sync + 'static,
        F: Fn(A, &Invoke) -> A + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(self);
        let reply_listener: Arc<str> = Arc::from(reply_listener.into());
        let fold = Arc::new(fold);
        self.slave.handlers().register(listener, arity, move |chief, invoke| {
            let request = PieceRequest::from_invoke(invoke)?;
            let Some(mediator) = weak.upgrade() else {
                return Ok(());
            };
            let answer = RelayAnswer {
                chief: Arc::downgrade(chief),
                request,
                listener: reply_listener.clone(),
            };

            let folded = Arc::new(Mutex::new(Some(initial.clone())));
            let on_reply = {
                let folded = folded.clone();
                let fold = fold.clone();
                move |_: &Arc<System>, reply: &Invoke| {
                    let mut slot = folded.lock();
                    if let Some(value) = slot.take() {
                        *slot = Some(fold(value, reply));
                    }
                }
            };
            let on_complete = {
                let answer = answer.clone();
                let fallback = initial.clone();
                move |report: RoundReport| {
                    let value = folded.lock().take().unwrap_or(fallback);
                    answer.send(
                        value,
                        LostWork {
                            pieces: report.lost_pieces,
                            ranges: report.lost_ranges,
                        },
                    );
                }
            };

            let callbacks = RoundCallbacks::new(on_reply, on_complete);
            match mediator
                .parallel
                .send_piece_data(invoke.clone(), request.first, request.size, callbacks)
            {
                Ok(_) => Ok(()),
                Err(e) if e.is_allocation() => {
                    warn!(
                        round = request.uid,
                        first = request.first,
                        size = request.size,
                        error = %e,
                        "Relay cannot split piece, reporting it lost"
                    );
                    answer.send(
                        initial.clone(),
                        LostWork {
                            pieces: request.size,
                            ranges: vec![request.range()],
                        },
                    );
                    Ok(())
                }
                Err(e) => Err(e),
            }
        });
    }

    pub fn slave(&self) -> &Arc<Slave> {
        &self.slave
    }

    pub fn parallel(&self) -> &Arc<ParallelSystemArray> {
        &self.parallel
    }

    pub fn array(&self) -> &Arc<SystemArray> {
        self.parallel.array()
    }

    pub fn identity(&self) -> i64 {
        self.array().identity()
    }

    pub fn shutdown(&self) {
        self.slave.close();
        self.array().shutdown();
    }
}

/// Where and how a relayed piece is answered
#[derive(Clone)]
struct RelayAnswer {
    chief: Weak<System>,
    request: PieceRequest,
    listener: Arc<str>,
}

impl RelayAnswer {
    fn send(&self, value: impl Into<ParameterValue>, lost: LostWork) {
        let mut reply = self
            .request
            .reply(self.listener.as_ref())
            .with(InvokeParameter::new(value));
        lost.attach(&mut reply);

        let Some(chief) = self.chief.upgrade() else {
            debug!(round = self.request.uid, "Chief gone before relayed piece completed");
            return;
        };
        match chief.send_data(&reply) {
            Ok(()) => debug!(round = self.request.uid, lost = lost.pieces, "Relayed piece answered"),
            Err(e) => warn!(round = self.request.uid, error = %e, "Failed to answer relayed piece"),
        }
    }
}

impl ArrayObserver for Mediator {
    fn unhandled(&self, system: &Arc<System>, invoke: Invoke) -> Option<Invoke> {
        if !self.slave.is_connected() {
            return Some(invoke);
        }
        match self.slave.send_data(&invoke) {
            Ok(()) => {
                ArrayMetrics::bump(&self.array().metrics().invokes_forwarded);
                debug!(
                    system = system.key(),
                    listener = invoke.listener(),
                    "Forwarded invoke to chief"
                );
                None
            }
            Err(e) => {
                warn!(listener = invoke.listener(), error = %e, "Failed to forward invoke to chief");
                Some(invoke)
            }
        }
    }
}

impl ChiefFallback for Mediator {
    fn unhandled_from_chief(&self, chief: &Arc<System>, invoke: Invoke) {
        match self.array().handlers().apply(&invoke, chief) {
            Ok(true) => {}
            Ok(false) => {
                ArrayMetrics::bump(&self.array().metrics().invokes_unhandled);
                let error = SystemError::UnhandledInvoke {
                    listener: invoke.listener().to_string(),
                };
                warn!(error = %error, "No handler accepted invoke from chief");
            }
            Err(e) => {
                ArrayMetrics::bump(&self.array().metrics().invokes_dropped);
                warn!(listener = invoke.listener(), error = %e, "Dropping invoke from chief");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::UNASSIGNED;

    #[test]
    fn test_root_takes_identity_zero() {
        let mediator = Mediator::new("root", Arc::new(SystemFactory::default()), 0.5);
        assert_eq!(mediator.identity(), UNASSIGNED);

        mediator.become_root();
        assert_eq!(mediator.identity(), 0);
        assert_eq!(mediator.slave().identity(), 0);
    }

    #[tokio::test]
    async fn test_unhandled_child_invoke_stays_local_without_chief() {
        let mediator = Mediator::new("root", Arc::new(SystemFactory::default()), 0.5);
        let (ours, _theirs) = network::duplex("root", "child");
        let system = mediator.array().add_connection(ours);

        let invoke = Invoke::new("status");
        assert_eq!(mediator.unhandled(&system, invoke.clone()), Some(invoke));
    }

    #[tokio::test]
    async fn test_chief_fallback_uses_array_handlers() {
        let mediator = Mediator::new("relay", Arc::new(SystemFactory::default()), 0.5);
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();
        mediator.array().handlers().register("reset", 0, move |_, _| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });

        let chief = Arc::new(System::new(0, "chief"));
        mediator.unhandled_from_chief(&chief, Invoke::new("reset"));
        mediator.unhandled_from_chief(&chief, Invoke::new("unknown"));

        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(mediator.array().metrics().snapshot().invokes_unhandled, 1);
    }
}
