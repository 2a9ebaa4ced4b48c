//! Integration Tests for Parallel Rounds
//!
//! A master ParallelSystemArray drives child Slaves over in-process duplex
//! connections: piece splitting, completion accounting, lost work after a
//! mid-round disconnect, and reweighting from measured reply times, which
//! must leave every System outside the round at its prior weight.

use std::sync::Arc;
use std::time::Duration;

use cascade::{
    allocate, ParallelSystemArray, PieceRequest, RoundCallbacks, RoundPhase, RoundReport, Slave,
    SystemError, SystemFactory, SystemArray, DEFAULT_SMOOTHING,
};
use codec::{Invoke, InvokeParameter, HISTORY_UID, MAX_EXACT_INTEGER, PIECE_FIRST, PIECE_SIZE};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn master() -> Arc<ParallelSystemArray> {
    ParallelSystemArray::new(
        SystemArray::new(Arc::new(SystemFactory::default())),
        DEFAULT_SMOOTHING,
    )
}

/// Connect a new child Slave to `parallel`
fn child(parallel: &ParallelSystemArray, name: &str) -> Arc<Slave> {
    let (parent_end, child_end) = network::duplex("master", name);
    parallel.array().add_connection(parent_end);
    let slave = Slave::new(name);
    slave.attach(child_end);
    slave
}

/// Child answers `work` with the sum of its piece indices
fn summing_worker(slave: &Slave, seen: Arc<Mutex<Vec<PieceRequest>>>) {
    slave.handlers().register("work", 1, move |chief, invoke| {
        let request = PieceRequest::from_invoke(invoke)?;
        seen.lock().push(request);
        chief.send_data(&request.reply("result").with(request.range().sum::<u64>()))
    });
}

fn completion() -> (RoundCallbacks, oneshot::Receiver<(RoundReport, u64)>) {
    let (tx, rx) = oneshot::channel();
    let total = Arc::new(Mutex::new(0u64));
    let acc = total.clone();
    let callbacks = RoundCallbacks::new(
        move |_system, reply: &Invoke| {
            assert!(reply.find(HISTORY_UID).is_none());
            *acc.lock() += reply.argument(0).unwrap().as_u64().unwrap();
        },
        move |report| {
            let _ = tx.send((report, *total.lock()));
        },
    );
    (callbacks, rx)
}

async fn wait(rx: oneshot::Receiver<(RoundReport, u64)>) -> (RoundReport, u64) {
    timeout(Duration::from_secs(5), rx)
        .await
        .expect("round did not complete")
        .expect("completion callback dropped")
}

#[tokio::test]
async fn test_segment_split_and_reduce() {
    init_tracing();
    let parallel = master();
    let seen: Vec<_> = (0..3).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();
    let slaves: Vec<_> = ["a", "b", "c"]
        .iter()
        .zip(&seen)
        .map(|(name, seen)| {
            let slave = child(&parallel, name);
            summing_worker(&slave, seen.clone());
            slave
        })
        .collect();

    let (callbacks, rx) = completion();
    let uid = parallel
        .send_segment_data(Invoke::new("work").with("sum"), 10, callbacks)
        .unwrap();
    let (report, total) = wait(rx).await;

    assert_eq!(report.uid, uid);
    assert_eq!(report.requested_size, 3);
    assert_eq!(report.completed_count, 3);
    assert!(!report.is_partial());
    assert_eq!(total, (0..10).sum::<u64>());

    // [4, 3, 3] in insertion order, as contiguous ranges
    let ranges: Vec<_> = seen.iter().map(|s| s.lock()[0].range()).collect();
    assert_eq!(ranges, vec![0..4, 4..7, 7..10]);

    assert_eq!(parallel.phase(), RoundPhase::Idle);
    let history = parallel.array().systems()[0].history();
    assert_eq!(history.len(), 1);
    assert!(history[0].elapsed.is_some());
    drop(slaves);
}

#[tokio::test]
async fn test_piece_range_offsets_from_first() {
    let parallel = master();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let slave = child(&parallel, "only");
    summing_worker(&slave, seen.clone());

    let (callbacks, rx) = completion();
    parallel
        .send_piece_data(Invoke::new("work").with("sum"), 100, 5, callbacks)
        .unwrap();
    let (_, total) = wait(rx).await;

    assert_eq!(seen.lock()[0].range(), 100..105);
    assert_eq!(total, 100 + 101 + 102 + 103 + 104);
}

#[tokio::test]
async fn test_mid_round_disconnect_reports_lost_piece() {
    init_tracing();
    let parallel = master();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut slaves = Vec::new();
    for index in 0..4 {
        let slave = child(&parallel, &format!("worker-{}", index));
        if index == 2 {
            // Drops its connection instead of answering
            slave.handlers().register("work", 1, |chief, _| {
                chief.close();
                Ok(())
            });
        } else {
            summing_worker(&slave, seen.clone());
        }
        slaves.push(slave);
    }

    let (callbacks, rx) = completion();
    parallel
        .send_segment_data(Invoke::new("work").with("sum"), 4, callbacks)
        .unwrap();
    let (report, total) = wait(rx).await;

    assert_eq!(report.requested_size, 3);
    assert_eq!(report.completed_count, 3);
    assert_eq!(report.lost_pieces, 1);
    assert_eq!(report.lost_ranges, vec![2..3]);
    assert!(report.is_partial());
    assert_eq!(total, 0 + 1 + 3);

    let stats = parallel.array().metrics().snapshot();
    assert_eq!(stats.pieces_lost, 1);
    assert_eq!(stats.rounds_completed, 1);
    assert_eq!(parallel.array().len(), 3);
}

#[tokio::test]
async fn test_round_rejected_while_in_flight_sends_nothing() {
    let parallel = master();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let slave = child(&parallel, "slow");
    // Never answers
    slave.handlers().register("work", 1, {
        let seen = seen.clone();
        move |_, invoke| {
            seen.lock().push(PieceRequest::from_invoke(invoke)?);
            Ok(())
        }
    });

    let first = parallel
        .send_segment_data(Invoke::new("work").with("x"), 2, RoundCallbacks::on_complete(|_| {}))
        .unwrap();
    let err = parallel
        .send_segment_data(Invoke::new("work").with("x"), 2, RoundCallbacks::on_complete(|_| {}))
        .unwrap_err();
    assert!(matches!(err, SystemError::RoundInFlight { uid } if uid == first));
    assert!(err.is_allocation());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn test_faster_child_earns_larger_share() {
    init_tracing();
    let parallel = master();
    let fast_seen = Arc::new(Mutex::new(Vec::new()));
    let slow_seen = Arc::new(Mutex::new(Vec::new()));

    let fast = child(&parallel, "fast");
    summing_worker(&fast, fast_seen.clone());

    let slow = child(&parallel, "slow");
    slow.handlers().register("work", 1, {
        let seen = slow_seen.clone();
        move |chief, invoke| {
            let request = PieceRequest::from_invoke(invoke)?;
            seen.lock().push(request);
            let chief = chief.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(80)).await;
                let _ = chief.send_data(&request.reply("result").with(0u64));
            });
            Ok(())
        }
    });

    let (callbacks, rx) = completion();
    parallel
        .send_segment_data(Invoke::new("work").with("sum"), 10, callbacks)
        .unwrap();
    wait(rx).await;

    let systems = parallel.array().systems();
    let (fast_weight, slow_weight) = (systems[0].performance(), systems[1].performance());
    assert!(fast_weight > slow_weight);
    // Normalized rates average 1.0, so blending with equal priors keeps the mean
    assert!((fast_weight + slow_weight - 2.0).abs() < 1e-9);
    assert!(systems[1].last_elapsed().unwrap() >= Duration::from_millis(80));

    let (callbacks, rx) = completion();
    parallel
        .send_segment_data(Invoke::new("work").with("sum"), 10, callbacks)
        .unwrap();
    wait(rx).await;

    let fast_share = fast_seen.lock()[1].size;
    let slow_share = slow_seen.lock()[1].size;
    assert_eq!(fast_share + slow_share, 10);
    assert!(fast_share > slow_share);
}

#[tokio::test]
async fn test_resplit_piece_replaces_reserved_parameters() {
    init_tracing();
    let parallel = master();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let slave = child(&parallel, "grandchild");
    slave.handlers().register("work", 1, {
        let seen = seen.clone();
        move |chief, invoke| {
            let copies = |name: &str| invoke.parameters().iter().filter(|p| p.name() == Some(name)).count();
            assert_eq!(copies(HISTORY_UID), 1);
            assert_eq!(copies(PIECE_FIRST), 1);
            assert_eq!(copies(PIECE_SIZE), 1);
            let request = PieceRequest::from_invoke(invoke)?;
            seen.lock().push(request);
            chief.send_data(&request.reply("result").with(request.range().sum::<u64>()))
        }
    });

    // As received from a chief, then split again here
    let received = Invoke::new("work")
        .with("sum")
        .with(InvokeParameter::named(HISTORY_UID, 77u64))
        .with(InvokeParameter::named(PIECE_FIRST, 40u64))
        .with(InvokeParameter::named(PIECE_SIZE, 8u64));
    let (callbacks, rx) = completion();
    let uid = parallel.send_piece_data(received, 40, 8, callbacks).unwrap();
    let (report, total) = wait(rx).await;

    assert_ne!(uid, 77);
    let request = seen.lock()[0];
    assert_eq!(request.uid, uid);
    assert_eq!(request.range(), 40..48);
    assert_eq!(report.completed_count, 1);
    assert_eq!(total, (40..48).sum::<u64>());
    assert_eq!(parallel.array().metrics().snapshot().replies_discarded, 0);
}

#[tokio::test]
async fn test_unrepresentable_piece_range_is_rejected() {
    let parallel = master();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let slave = child(&parallel, "only");
    summing_worker(&slave, seen.clone());

    for (first, size) in [(u64::MAX, 2), (MAX_EXACT_INTEGER, 1), (0, MAX_EXACT_INTEGER + 1)] {
        let err = parallel
            .send_piece_data(Invoke::new("work").with("sum"), first, size, RoundCallbacks::on_complete(|_| {}))
            .unwrap_err();
        assert!(matches!(err, SystemError::InvalidPieceRange { first: f, size: s } if f == first && s == size));
        assert!(err.is_allocation());
        assert_eq!(parallel.phase(), RoundPhase::Idle);
    }

    // The last exactly representable piece is still fine
    let (callbacks, rx) = completion();
    parallel
        .send_piece_data(Invoke::new("work").with("sum"), MAX_EXACT_INTEGER - 1, 1, callbacks)
        .unwrap();
    let (report, _) = wait(rx).await;
    assert!(!report.is_partial());
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(seen.lock()[0].range(), MAX_EXACT_INTEGER - 1..MAX_EXACT_INTEGER);
}

/// Child answers `work` after `delay`
fn delayed_worker(slave: &Slave, delay: Duration) {
    slave.handlers().register("work", 1, move |chief, invoke| {
        let request = PieceRequest::from_invoke(invoke)?;
        let chief = chief.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = chief.send_data(&request.reply("result").with(request.range().sum::<u64>()));
        });
        Ok(())
    });
}

#[tokio::test]
async fn test_systems_outside_round_keep_their_weight() {
    init_tracing();
    let parallel = master();
    let fast = child(&parallel, "fast");
    summing_worker(&fast, Arc::new(Mutex::new(Vec::new())));
    let slow = child(&parallel, "slow");
    delayed_worker(&slow, Duration::from_millis(60));

    // Round 1: a System joins while the slow reply is outstanding
    let (callbacks, rx) = completion();
    parallel
        .send_segment_data(Invoke::new("work").with("sum"), 10, callbacks)
        .unwrap();
    let late = child(&parallel, "late");
    summing_worker(&late, Arc::new(Mutex::new(Vec::new())));
    let (report, _) = wait(rx).await;
    assert_eq!(report.requested_size, 2);

    let systems = parallel.array().systems();
    assert_eq!(systems.len(), 3);
    assert!(systems[0].performance() > systems[1].performance());
    assert_eq!(systems[2].performance(), 1.0);
    assert!(systems[2].last_elapsed().is_none());

    // Round 2: one piece for three Systems, so two of them sit it out
    let before: Vec<f64> = systems.iter().map(|s| s.performance()).collect();
    let shares = allocate(1, &before);
    let (callbacks, rx) = completion();
    parallel
        .send_segment_data(Invoke::new("work").with("sum"), 1, callbacks)
        .unwrap();
    let (report, _) = wait(rx).await;
    assert_eq!(report.completed_count, 1);
    for ((system, share), weight) in systems.iter().zip(&shares).zip(&before) {
        if *share == 0 {
            assert_eq!(system.performance(), *weight, "{} sat out but was reweighted", system.key());
        }
    }

    // Round 3: a System that departs mid-round keeps its weight too
    let quitter = child(&parallel, "quitter");
    quitter.handlers().register("work", 1, |chief, _| {
        chief.close();
        Ok(())
    });
    let departing = parallel.array().systems()[3].clone();
    let departing_weight = departing.performance();
    let (callbacks, rx) = completion();
    parallel
        .send_segment_data(Invoke::new("work").with("sum"), 20, callbacks)
        .unwrap();
    let (report, _) = wait(rx).await;
    assert!(report.lost_pieces > 0);
    assert_eq!(report.completed_count, 3);
    assert_eq!(departing.performance(), departing_weight);
    assert_eq!(parallel.array().len(), 3);
    drop((fast, slow, late, quitter));
}
