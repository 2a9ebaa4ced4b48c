//! ParallelSystemArray: proportional work rounds over a SystemArray
//!
//! A round splits `size` pieces across the connected Systems by weight,
//! sends each System its contiguous range with the round uid attached, and
//! counts one reply per participating System. Departures during a round
//! shrink `requested_size` and are reported as lost pieces, so a round
//! always reaches completion.
//!
//! # Lock Ordering (CRITICAL for deadlock prevention)
//!
//! 1. `round`
//! 2. per-System `history` / `performance`
//!
//! No send happens while `round` is held. The completion callback and the
//! weight updates run after `round` is released. The per-reply callback runs
//! under `round` and must not start a new round or call back into this array.

use super::allocation::allocate;
use super::round::{Assignment, Completion, Round, RoundCallbacks, RoundPhase, RoundReport};
use crate::array::{ArrayObserver, SystemArray};
use crate::metrics::ArrayMetrics;
use crate::slave::LostWork;
use crate::system::System;
use crate::{Result, SystemError};
use codec::{Invoke, InvokeParameter, HISTORY_UID, MAX_EXACT_INTEGER, PIECE_FIRST, PIECE_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Default EMA weight of the latest measurement
pub const DEFAULT_SMOOTHING: f64 = 0.5;

pub struct ParallelSystemArray {
    array: Arc<SystemArray>,
    round: Mutex<Option<Round>>,
    smoothing: f64,
    next_uid: AtomicU64,
}

impl ParallelSystemArray {
    /// Layer round coordination over `array`
    pub fn new(array: Arc<SystemArray>, smoothing: f64) -> Arc<Self> {
        let parallel = Arc::new(Self {
            array,
            round: Mutex::new(None),
            smoothing: smoothing.clamp(f64::MIN_POSITIVE, 1.0),
            next_uid: AtomicU64::new(1),
        });
        let weak = Arc::downgrade(&parallel);
        let observer: Weak<dyn ArrayObserver> = weak;
        parallel.array.add_observer(observer);
        parallel
    }

    pub fn array(&self) -> &Arc<SystemArray> {
        &self.array
    }

    pub fn smoothing(&self) -> f64 {
        self.smoothing
    }

    /// Split pieces `[0, size)` across the connected Systems
    pub fn send_segment_data(&self, invoke: Invoke, size: u64, callbacks: RoundCallbacks) -> Result<u64> {
        self.send_piece_data(invoke, 0, size, callbacks)
    }

    /// Split pieces `[first, first + size)` across the connected Systems.
    ///
    /// Each participant receives `invoke` with `_History_uid`, `_Piece_first`
    /// and `_Piece_size` set, replacing any copies already on the envelope
    /// (as when re-splitting a piece received from a chief). Returns the round
    /// uid. Fails without sending anything if a round is in flight, no System
    /// is connected, or the range ends beyond [`MAX_EXACT_INTEGER`].
    pub fn send_piece_data(
        &self,
        invoke: Invoke,
        first: u64,
        size: u64,
        mut callbacks: RoundCallbacks,
    ) -> Result<u64> {
        if first.checked_add(size).map_or(true, |end| end > MAX_EXACT_INTEGER) {
            return Err(SystemError::InvalidPieceRange { first, size });
        }
        let systems = self.array.active_systems();

        let mut guard = self.round.lock();
        if let Some(round) = guard.as_ref() {
            return Err(SystemError::RoundInFlight { uid: round.uid });
        }
        if systems.is_empty() {
            return Err(SystemError::NoActiveSystems);
        }

        let uid = self.next_uid.fetch_add(1, Ordering::SeqCst);
        ArrayMetrics::bump(&self.array.metrics().rounds_started);

        if size == 0 {
            drop(guard);
            self.array.metrics().record_round_completed(0);
            debug!(round = uid, "Empty segment completed immediately");
            if let Some(on_complete) = callbacks.on_complete.take() {
                on_complete(RoundReport::empty(uid));
            }
            return Ok(uid);
        }

        let weights: Vec<f64> = systems.iter().map(|system| system.performance()).collect();
        let counts = allocate(size as usize, &weights);

        let now = Instant::now();
        let mut assignments = HashMap::new();
        let mut outgoing = Vec::new();
        let mut offset = first;
        for (system, count) in systems.iter().zip(counts) {
            if count == 0 {
                continue;
            }
            let count = count as u64;
            assignments.insert(
                system.key(),
                Assignment {
                    system: Arc::downgrade(system),
                    first: offset,
                    size: count,
                    dispatched_at: now,
                    finished: None,
                },
            );
            outgoing.push((system.clone(), offset, count));
            offset += count;
        }

        // Commit before sending so no reply can beat the bookkeeping
        *guard = Some(Round {
            uid,
            phase: RoundPhase::Dispatched,
            requested_size: outgoing.len(),
            completed_count: 0,
            lost_pieces: 0,
            lost_ranges: Vec::new(),
            assignments,
            started_at: now,
            callbacks,
        });
        drop(guard);

        info!(
            round = uid,
            listener = invoke.listener(),
            first,
            size,
            participants = outgoing.len(),
            "Dispatching segment"
        );

        for (system, piece_first, piece_size) in &outgoing {
            let mut piece = invoke.clone();
            piece.set_named(HISTORY_UID, uid);
            piece.set_named(PIECE_FIRST, *piece_first);
            piece.set_named(PIECE_SIZE, *piece_size);
            system.record_dispatch(uid, invoke.listener(), *piece_first, *piece_size);
            if let Err(e) = system.send_data(&piece) {
                warn!(round = uid, system = system.key(), error = %e, "Piece dispatch failed");
            }
        }

        // A System that dropped between the snapshot and the commit was
        // never seen by `departed`; account for it now
        for (system, _, _) in &outgoing {
            if !system.is_connected() {
                self.system_lost(system);
            }
        }

        Ok(uid)
    }

    /// Uid of the round in flight
    pub fn current_round(&self) -> Option<u64> {
        self.round.lock().as_ref().map(|round| round.uid)
    }

    pub fn phase(&self) -> RoundPhase {
        self.round
            .lock()
            .as_ref()
            .map_or(RoundPhase::Idle, |round| round.phase)
    }

    fn system_lost(&self, system: &Arc<System>) {
        let completion = {
            let mut guard = self.round.lock();
            let Some(round) = guard.as_mut() else { return };
            if !round.mark_lost(system.key()) {
                return;
            }
            warn!(
                round = round.uid,
                system = system.key(),
                requested = round.requested_size,
                "System departed mid-round; pieces lost"
            );
            self.take_if_complete(&mut guard)
        };
        if let Some(completion) = completion {
            self.complete(completion);
        }
    }

    fn take_if_complete(&self, guard: &mut Option<Round>) -> Option<Completion> {
        if !guard.as_ref().is_some_and(Round::is_complete) {
            return None;
        }
        guard.take().map(|round| round.finish(self.smoothing))
    }

    fn complete(&self, completion: Completion) {
        let Completion {
            report,
            on_complete,
            updates,
        } = completion;

        for (system, weight, elapsed) in updates {
            system.report_performance(elapsed);
            system.set_performance(weight);
            debug!(system = system.key(), weight, ?elapsed, "Performance updated");
        }

        self.array.metrics().record_round_completed(report.lost_pieces);
        info!(
            round = report.uid,
            completed = report.completed_count,
            lost = report.lost_pieces,
            elapsed = ?report.elapsed,
            "Round complete"
        );
        if let Some(on_complete) = on_complete {
            on_complete(report);
        }
    }
}

impl ArrayObserver for ParallelSystemArray {
    fn intercept(&self, system: &Arc<System>, mut invoke: Invoke) -> Option<Invoke> {
        let uid = match invoke.find(HISTORY_UID).map(InvokeParameter::as_u64) {
            // Not a round reply
            None => return Some(invoke),
            Some(Ok(uid)) => uid,
            Some(Err(e)) => {
                warn!(system = system.key(), error = %e, "Discarding reply with bad round uid");
                ArrayMetrics::bump(&self.array.metrics().replies_discarded);
                return None;
            }
        };
        invoke.take(HISTORY_UID);
        invoke.take(PIECE_FIRST);
        invoke.take(PIECE_SIZE);
        let nested_loss = LostWork::take_from(&mut invoke).unwrap_or_else(|e| {
            warn!(system = system.key(), error = %e, "Ignoring malformed lost work on reply");
            None
        });

        let completion = {
            let mut guard = self.round.lock();
            let Some(round) = guard.as_mut().filter(|round| round.uid == uid) else {
                warn!(round = uid, system = system.key(), "Discarding reply for a round not in flight");
                ArrayMetrics::bump(&self.array.metrics().replies_discarded);
                return None;
            };
            let Some(assignment) = round
                .assignments
                .get_mut(&system.key())
                .filter(|assignment| assignment.finished.is_none())
            else {
                warn!(round = uid, system = system.key(), "Discarding reply from a non-participant");
                ArrayMetrics::bump(&self.array.metrics().replies_discarded);
                return None;
            };

            let elapsed = assignment.dispatched_at.elapsed();
            assignment.finished = Some(elapsed);
            round.completed_count += 1;
            round.phase = RoundPhase::Collecting;
            system.record_completion(uid, elapsed);
            if let Some(lost) = nested_loss {
                debug!(round = uid, system = system.key(), pieces = lost.pieces, "Sub-tree lost work");
                round.lost_pieces += lost.pieces;
                round.lost_ranges.extend(lost.ranges);
            }
            ArrayMetrics::bump(&self.array.metrics().replies_accepted);
            debug!(
                round = uid,
                system = system.key(),
                completed = round.completed_count,
                requested = round.requested_size,
                "Reply accounted"
            );

            (round.callbacks.on_reply)(system, &invoke);
            self.take_if_complete(&mut guard)
        };

        if let Some(completion) = completion {
            self.complete(completion);
        }
        None
    }

    fn departed(&self, system: &Arc<System>) {
        self.system_lost(system);
    }
}
