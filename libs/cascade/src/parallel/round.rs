//! Work round bookkeeping and reweighting
//!
//! Completion is tracked per System: each System that received a piece range
//! owes exactly one reply, so `requested_size` starts at the number of
//! participating Systems.

use crate::system::System;
use codec::Invoke;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Shortest elapsed time used when computing a rate
const MIN_ELAPSED_SECS: f64 = 1e-6;

/// Round lifecycle; `Idle` is represented by the absence of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    Idle,
    /// Bookkeeping committed and pieces sent, no reply yet
    Dispatched,
    /// At least one reply accounted
    Collecting,
}

/// Per-reply and completion callbacks for one round
pub struct RoundCallbacks {
    pub(crate) on_reply: Box<dyn FnMut(&Arc<System>, &Invoke) + Send>,
    pub(crate) on_complete: Option<Box<dyn FnOnce(RoundReport) + Send>>,
}

impl RoundCallbacks {
    pub fn new<R, C>(on_reply: R, on_complete: C) -> Self
    where
        R: FnMut(&Arc<System>, &Invoke) + Send + 'static,
        C: FnOnce(RoundReport) + Send + 'static,
    {
        Self {
            on_reply: Box::new(on_reply),
            on_complete: Some(Box::new(on_complete)),
        }
    }

    /// Only observe completion
    pub fn on_complete<C>(on_complete: C) -> Self
    where
        C: FnOnce(RoundReport) + Send + 'static,
    {
        Self::new(|_, _| {}, on_complete)
    }
}

/// Outcome handed to the completion callback
#[derive(Debug, Clone, PartialEq)]
pub struct RoundReport {
    pub uid: u64,
    /// Systems still owing a reply when the round closed, after departures
    pub requested_size: usize,
    pub completed_count: usize,
    /// Pieces held by Systems that departed before replying, plus pieces
    /// relaying children reported lost further down
    pub lost_pieces: u64,
    pub lost_ranges: Vec<Range<u64>>,
    pub elapsed: Duration,
}

impl RoundReport {
    pub(crate) fn empty(uid: u64) -> Self {
        Self {
            uid,
            requested_size: 0,
            completed_count: 0,
            lost_pieces: 0,
            lost_ranges: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Whether any work was lost and needs re-dispatching
    pub fn is_partial(&self) -> bool {
        self.lost_pieces > 0
    }
}

pub(crate) struct Assignment {
    pub system: Weak<System>,
    pub first: u64,
    pub size: u64,
    pub dispatched_at: Instant,
    pub finished: Option<Duration>,
}

pub(crate) struct Round {
    pub uid: u64,
    pub phase: RoundPhase,
    pub requested_size: usize,
    pub completed_count: usize,
    pub lost_pieces: u64,
    pub lost_ranges: Vec<Range<u64>>,
    pub assignments: HashMap<u64, Assignment>,
    pub started_at: Instant,
    pub callbacks: RoundCallbacks,
}

/// What a closed round leaves to do once the round lock is released
pub(crate) struct Completion {
    pub report: RoundReport,
    pub on_complete: Option<Box<dyn FnOnce(RoundReport) + Send>>,
    /// (system, new weight, elapsed) for every System that replied
    pub updates: Vec<(Arc<System>, f64, Duration)>,
}

impl Round {
    pub fn is_complete(&self) -> bool {
        self.completed_count >= self.requested_size
    }

    /// Remove an outstanding assignment and account its pieces as lost.
    /// Returns false if the System had already replied or never took part.
    pub fn mark_lost(&mut self, key: u64) -> bool {
        match self.assignments.get(&key) {
            Some(assignment) if assignment.finished.is_none() => {}
            _ => return false,
        }
        if let Some(assignment) = self.assignments.remove(&key) {
            self.requested_size = self.requested_size.saturating_sub(1);
            self.lost_pieces += assignment.size;
            self.lost_ranges
                .push(assignment.first..assignment.first + assignment.size);
        }
        true
    }

    /// Close the round: compute new weights for every System that replied
    pub fn finish(mut self, smoothing: f64) -> Completion {
        let mut samples = Vec::new();
        let mut systems = Vec::new();
        for assignment in self.assignments.values() {
            let (Some(elapsed), Some(system)) = (assignment.finished, assignment.system.upgrade()) else {
                continue;
            };
            samples.push(RateSample {
                pieces: assignment.size,
                elapsed,
                prior: system.performance(),
            });
            systems.push((system, elapsed));
        }

        let weights = reweight(&samples, smoothing);
        let updates = systems
            .into_iter()
            .zip(weights)
            .map(|((system, elapsed), weight)| (system, weight, elapsed))
            .collect();

        self.lost_ranges.sort_by_key(|range| range.start);
        Completion {
            report: RoundReport {
                uid: self.uid,
                requested_size: self.requested_size,
                completed_count: self.completed_count,
                lost_pieces: self.lost_pieces,
                lost_ranges: self.lost_ranges,
                elapsed: self.started_at.elapsed(),
            },
            on_complete: self.callbacks.on_complete.take(),
            updates,
        }
    }
}

/// One participant's measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSample {
    pub pieces: u64,
    pub elapsed: Duration,
    /// Weight before this round
    pub prior: f64,
}

/// Rates (pieces per second) scaled so their mean is 1.0
pub fn normalized_rates(samples: &[RateSample]) -> Vec<f64> {
    if samples.is_empty() {
        return Vec::new();
    }
    let rates: Vec<f64> = samples
        .iter()
        .map(|sample| sample.pieces as f64 / sample.elapsed.as_secs_f64().max(MIN_ELAPSED_SECS))
        .collect();
    let mean = rates.iter().sum::<f64>() / rates.len() as f64;
    if !(mean.is_finite() && mean > 0.0) {
        return vec![1.0; rates.len()];
    }
    rates.into_iter().map(|rate| rate / mean).collect()
}

/// Blend normalized rates into prior weights:
/// `w = smoothing * normalized + (1 - smoothing) * prior`
pub fn reweight(samples: &[RateSample], smoothing: f64) -> Vec<f64> {
    normalized_rates(samples)
        .into_iter()
        .zip(samples)
        .map(|(normalized, sample)| smoothing * normalized + (1.0 - smoothing) * sample.prior)
        .collect()
}
