use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use proptest::prelude::*;
use sqlmux_router::{
    current_id, ExecuteMode, Fleet, FleetConfig, RunState, Semaphore, StatKind, Worker, WorkerId,
};

fn started(threads: usize) -> Fleet {
    let fleet = Fleet::init(FleetConfig::new(threads)).unwrap();
    fleet.start_workers().unwrap();
    fleet
}

#[test]
fn four_workers_have_dense_ids_and_main_alias() {
    let fleet = Fleet::init(FleetConfig::new(4)).unwrap();

    assert_eq!(fleet.len(), 4);
    assert_eq!(fleet.id_min(), WorkerId::new(0));
    assert_eq!(fleet.id_max(), WorkerId::new(3));
    assert_eq!(fleet.id_main(), WorkerId::new(0));
    assert_eq!(fleet.get(WorkerId::MAIN).unwrap().id(), WorkerId::new(0));
    for i in 0..4 {
        assert_eq!(fleet.get(WorkerId::new(i)).unwrap().id(), WorkerId::new(i));
    }
    assert!(fleet.current().is_none());

    fleet.finish();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn pick_worker_cycles_from_id_min(threads in 1usize..8) {
        let fleet = Fleet::init(FleetConfig::new(threads)).unwrap();

        let picked: Vec<usize> = (0..2 * threads)
            .map(|_| fleet.pick_worker().id().index())
            .collect();
        let expected: Vec<usize> = (0..threads).chain(0..threads).collect();
        prop_assert_eq!(picked, expected);

        fleet.finish();
    }
}

#[test]
fn workers_know_their_own_id() {
    let fleet = started(3);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let n = fleet.execute_concurrently_fn(move |w| {
        sink.lock().push((w.id(), current_id()));
    });
    assert_eq!(n, 3);

    let mut seen = seen.lock().clone();
    seen.sort();
    for (i, (id, current)) in seen.into_iter().enumerate() {
        assert_eq!(id, WorkerId::new(i));
        assert_eq!(current, Some(id));
    }

    fleet.finish();
}

#[test]
fn execute_serially_never_overlaps() {
    let fleet = started(4);
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    let (a, m, o) = (Arc::clone(&active), Arc::clone(&max_active), Arc::clone(&order));
    let n = fleet.execute_serially_fn(move |w: &mut Worker| {
        let now = a.fetch_add(1, Ordering::SeqCst) + 1;
        m.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        o.lock().push(w.id());
        a.fetch_sub(1, Ordering::SeqCst);
    });

    assert_eq!(n, 4);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    let expected: Vec<WorkerId> = (0..4).map(WorkerId::new).collect();
    assert_eq!(*order.lock(), expected);

    fleet.finish();
}

#[test]
fn execute_concurrently_dispatches_all_before_waiting() {
    const K: usize = 4;
    let fleet = started(K);
    let arrived = Arc::new(AtomicUsize::new(0));
    let saw_all = Arc::new(AtomicUsize::new(0));

    let (a, s) = (Arc::clone(&arrived), Arc::clone(&saw_all));
    let n = fleet.execute_concurrently_fn(move |_| {
        a.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(5);
        while a.load(Ordering::SeqCst) < K && Instant::now() < deadline {
            thread::yield_now();
        }
        if a.load(Ordering::SeqCst) == K {
            s.fetch_add(1, Ordering::SeqCst);
        }
    });

    assert_eq!(n, K);
    assert_eq!(saw_all.load(Ordering::SeqCst), K);

    fleet.finish();
}

#[test]
fn broadcast_with_semaphore() {
    let fleet = started(3);
    let hits = Arc::new(AtomicUsize::new(0));
    let sem = Arc::new(Semaphore::new(0));

    let h = Arc::clone(&hits);
    let posted = fleet.broadcast(
        Arc::new(move |_: &mut Worker| {
            h.fetch_add(1, Ordering::SeqCst);
        }),
        Some(&sem),
    );
    assert_eq!(posted, 3);
    assert_eq!(sem.wait_n(posted), 3);
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    fleet.finish();
}

#[test]
fn blocking_fan_out_refused_on_worker_thread() {
    let fleet = Arc::new(started(2));
    let inner = Arc::clone(&fleet);

    let result = fleet.call(WorkerId::new(1), move |_| {
        (
            inner.execute_concurrently_fn(|_| {}),
            inner.execute_serially_fn(|_| {}),
            inner.watchdog(Duration::from_millis(10)),
        )
    });
    assert_eq!(result, Some((0, 0, false)));

    // Non-blocking broadcast is fine from a worker.
    let inner = Arc::clone(&fleet);
    let posted = fleet.call(WorkerId::new(0), move |_| {
        inner.broadcast_fn(|_| {}, None, ExecuteMode::Checked)
    });
    assert_eq!(posted, Some(2));

    let fleet = Arc::try_unwrap(fleet).unwrap();
    fleet.finish();
}

#[test]
fn watchdog_passes_on_healthy_fleet() {
    let fleet = started(2);
    assert!(fleet.watchdog(Duration::from_secs(5)));
    fleet.finish();
}

#[test]
fn watchdog_fails_on_stuck_worker() {
    let fleet = started(2);
    let release = Arc::new(Semaphore::new(0));

    let r = Arc::clone(&release);
    fleet
        .get(WorkerId::new(1))
        .unwrap()
        .call(move |_| r.wait(), None, ExecuteMode::Checked)
        .unwrap();

    assert!(!fleet.watchdog(Duration::from_millis(100)));
    release.post();
    assert!(fleet.watchdog(Duration::from_secs(5)));

    fleet.finish();
}

#[test]
fn statistics_cover_every_worker() {
    let fleet = started(3);
    fleet.execute_concurrently_fn(|_| {});

    let snaps = fleet.snapshots();
    assert_eq!(snaps.len(), 3);
    assert!(snaps.windows(2).all(|w| w[0].id < w[1].id));
    assert!(fleet.one_statistic(StatKind::Polls) >= 3);

    let doc = fleet.list_to_json("http://localhost:8989");
    let data = doc["data"].as_array().unwrap();
    assert_eq!(data.len(), 3);
    assert_eq!(data[2]["id"], "2");

    let one = fleet
        .worker_to_json("http://localhost:8989", WorkerId::MAIN)
        .unwrap();
    assert_eq!(one["data"]["id"], "0");

    let all = fleet.statistics_to_json("http://localhost:8989");
    assert_eq!(all["data"]["id"], "all");
    assert_eq!(all["data"]["attributes"]["workers"], 3);

    fleet.finish();
}

#[test]
fn shutdown_and_join_stop_every_worker() {
    let fleet = started(2);
    assert!(fleet.is_running());

    fleet.shutdown_all();
    fleet.join_workers();
    assert!(!fleet.is_running());
    for worker in fleet.workers() {
        assert_eq!(worker.state(), RunState::Stopped);
    }
    assert_eq!(fleet.execute_concurrently_fn(|_| {}), 0);

    fleet.finish();
}

#[test]
fn dropping_a_running_fleet_stops_its_workers() {
    let fleet = started(2);
    let workers: Vec<_> = fleet.workers().to_vec();
    assert!(workers.iter().all(|w| w.state() == RunState::Running));

    drop(fleet);
    for worker in &workers {
        assert_eq!(worker.state(), RunState::Stopped);
    }
}

#[test]
fn tasks_queued_before_exit_still_run() {
    let fleet = started(1);
    let gate = Arc::new(Semaphore::new(0));
    let ran = Arc::new(AtomicUsize::new(0));

    // Hold the worker inside a task so it cannot exit before the post below.
    let g = Arc::clone(&gate);
    fleet
        .get(WorkerId::MAIN)
        .unwrap()
        .call(move |_| g.wait(), None, ExecuteMode::Checked)
        .unwrap();

    fleet.shutdown_all();
    let r = Arc::clone(&ran);
    let posted = fleet.broadcast_disposable(Arc::new(move |_: &mut Worker| {
        r.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(posted, 1);
    gate.post();

    fleet.join_workers();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    fleet.finish();
}
