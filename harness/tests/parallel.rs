//! Integration tests for several workers sharing one checkpoint directory.
//!
//! Workers are engines on separate threads. Each opens its own lock files, so
//! they contend exactly like separate processes would.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Barrier, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use inctune_config::TuneParams;
use inctune_core::{
    Candidate, ResourceUsage,
    test_utils::{ScriptedCandidate, tiny_dataset},
};
use inctune_harness::{
    BuildReport, BuildStatus, ByScore, CheckpointStore, SearchAgent, StepOutcome, TuningEngine,
};
use tempfile::tempdir;

fn params(dir: &Path) -> TuneParams {
    TuneParams {
        checkpoint_dir: Some(dir.display().to_string()),
        ..Default::default()
    }
}

fn pool(names: &[&str], counter: &Arc<AtomicUsize>) -> Vec<Box<dyn Candidate>> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            Box::new(
                ScriptedCandidate::new(*name, 0.1 * (i + 1) as f64)
                    .with_train_counter(Arc::clone(counter)),
            ) as Box<dyn Candidate>
        })
        .collect()
}

/// Candidate `a` needs two steps, `b` one; every step is checkpointed.
fn exploiting_worker(
    dir: &Path,
    counter: &Arc<AtomicUsize>,
    elsewhere: impl Fn(&CheckpointStore) + Send + 'static,
) -> (TuningEngine, Arc<Mutex<Vec<(String, StepOutcome)>>>) {
    let candidates: Vec<Box<dyn Candidate>> = vec![
        Box::new(
            ScriptedCandidate::new("a", 0.8)
                .with_steps(2)
                .with_train_counter(Arc::clone(counter)),
        ),
        Box::new(ScriptedCandidate::new("b", 0.4).with_train_counter(Arc::clone(counter))),
    ];
    let params = TuneParams {
        min_checkpoint_interval_secs: 0.0,
        ..params(dir)
    };
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let store = CheckpointStore::new(dir);
    let worker = TuningEngine::new(
        params,
        Box::new(SearchAgent::new(candidates)),
        Box::new(ByScore::new()),
    )
    .with_observer(move |event| {
        sink.lock().unwrap().push((event.candidate.clone(), event.outcome));
        // another worker takes over `a` between its two steps
        if event.step == 1 {
            elsewhere(&store);
        }
    });
    (worker, events)
}

/// Finish `a` from its saved first step, as a second worker would.
fn finish_a(store: &CheckpointStore) {
    let lock = store.try_lock("a").unwrap();
    assert!(lock.is_locked());
    let mut a = ScriptedCandidate::new("a", 0.8).with_steps(2);
    assert!(store.load(&mut a).unwrap().is_some());
    a.train(&tiny_dataset()).unwrap();
    store.save(&mut a, ResourceUsage::default()).unwrap();
    assert!(store.mark_done("a").unwrap());
    store.unlock(lock).unwrap();
}

fn engine(dir: &Path, agent: SearchAgent) -> TuningEngine {
    TuningEngine::new(params(dir), Box::new(agent), Box::new(ByScore::new()))
}

#[test]
fn test_concurrent_try_lock_has_one_winner() {
    let dir = tempdir().unwrap();
    let workers = 8;
    let barrier = Arc::new(Barrier::new(workers));
    let winners = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let root = dir.path().to_path_buf();
            let barrier = Arc::clone(&barrier);
            let winners = Arc::clone(&winners);
            thread::spawn(move || {
                let store = CheckpointStore::new(root);
                barrier.wait();
                let lock = store.try_lock("shared").unwrap();
                if lock.is_locked() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
                // hold until everyone has tried
                barrier.wait();
                store.unlock(lock).unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(winners.load(Ordering::SeqCst), 1);
}

#[test]
fn test_contended_candidate_defers_finalization() {
    let dir = tempdir().unwrap();
    let data = tiny_dataset();
    let store = CheckpointStore::new(dir.path());

    // worker A is mid-way through x
    let lock_a = store.try_lock("x").unwrap();
    assert!(lock_a.is_locked());

    // worker B skips x, finishes y, and may not finalize
    let counter_b = Arc::new(AtomicUsize::new(0));
    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let mut worker_b = engine(dir.path(), SearchAgent::new(pool(&["x", "y"], &counter_b)))
        .with_observer(move |event| sink.lock().unwrap().push(event.outcome));
    assert_eq!(worker_b.build(&data).unwrap(), BuildStatus::Deferred);
    assert!(!worker_b.is_final_model());
    assert_eq!(counter_b.load(Ordering::SeqCst), 1);
    assert_eq!(
        *events.lock().unwrap(),
        [
            StepOutcome::Skipped,
            StepOutcome::Trained {
                fully_trained: true
            }
        ]
    );
    assert!(store.is_done("y").unwrap());
    assert!(!store.is_done("x").unwrap());
    assert!(!store.is_run_done());

    // worker A finishes x
    let mut x = ScriptedCandidate::new("x", 0.1);
    x.train(&data).unwrap();
    store.save(&mut x, ResourceUsage::default()).unwrap();
    assert!(store.mark_done("x").unwrap());
    store.unlock(lock_a).unwrap();

    // a later worker restores both and finalizes
    let counter_c = Arc::new(AtomicUsize::new(0));
    let mut worker_c = engine(dir.path(), SearchAgent::new(pool(&["x", "y"], &counter_c)));
    assert_eq!(worker_c.build(&data).unwrap(), BuildStatus::Done);
    assert!(worker_c.is_final_model());
    assert_eq!(counter_c.load(Ordering::SeqCst), 0);
    assert!(store.is_run_done());

    let report: BuildReport = store.read_report().unwrap().unwrap();
    let names: Vec<&str> = report.members.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, ["y", "x"]);
}

#[test]
fn test_concurrent_workers_train_each_candidate_once() {
    let dir = tempdir().unwrap();
    let names = ["c0", "c1", "c2", "c3", "c4", "c5"];
    let workers = 4;
    let counter = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(workers));

    let handles: Vec<_> = (0..workers)
        .map(|worker_id| {
            let root = dir.path().to_path_buf();
            let counter = Arc::clone(&counter);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let agent = SearchAgent::new(pool(&names, &counter)).with_shuffle(worker_id as u64);
                let mut worker = engine(&root, agent);
                barrier.wait();
                let status = worker.build(&tiny_dataset()).unwrap();
                (status, worker.is_final_model())
            })
        })
        .collect();

    let results: Vec<(BuildStatus, bool)> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    let finalizers = results
        .iter()
        .filter(|(status, _)| *status == BuildStatus::Done)
        .count();
    assert!(finalizers <= 1);
    for (status, is_final) in &results {
        assert_eq!(*is_final, *status == BuildStatus::Done);
        assert_ne!(*status, BuildStatus::OutOfBudget);
    }
    assert_eq!(counter.load(Ordering::SeqCst), names.len());

    let store = CheckpointStore::new(dir.path());
    for name in names {
        assert!(store.is_done(name).unwrap());
    }

    if finalizers == 0 {
        // everyone deferred or yielded; a finishing worker completes the run
        let finisher_counter = Arc::new(AtomicUsize::new(0));
        let mut finisher = engine(dir.path(), SearchAgent::new(pool(&names, &finisher_counter)));
        assert_eq!(finisher.build(&tiny_dataset()).unwrap(), BuildStatus::Done);
        assert_eq!(finisher_counter.load(Ordering::SeqCst), 0);
    }

    assert!(store.is_run_done());
    let report: BuildReport = store.read_report().unwrap().unwrap();
    assert_eq!(report.members.len(), names.len());
    assert_eq!(report.members[0].name, "c5");
}

#[test]
fn test_status_reflects_locks_and_markers() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());
    let counter = Arc::new(AtomicUsize::new(0));

    let mut worker = engine(dir.path(), SearchAgent::new(pool(&["a", "b"], &counter)));
    worker.build(&tiny_dataset()).unwrap();

    let lock = store.try_lock("pending").unwrap();
    let status = store.status().unwrap();
    assert!(status.finalized);

    let summary: Vec<(&str, bool, bool)> = status
        .candidates
        .iter()
        .map(|c| (c.name.as_str(), c.done, c.locked))
        .collect();
    assert_eq!(
        summary,
        [("a", true, false), ("b", true, false), ("pending", false, true)]
    );
    store.unlock(lock).unwrap();
}

#[test]
fn test_candidate_finished_elsewhere_during_exploitation_is_restored() {
    let dir = tempdir().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let (mut worker, events) = exploiting_worker(dir.path(), &counter, finish_a);

    assert_eq!(worker.build(&tiny_dataset()).unwrap(), BuildStatus::Done);
    assert!(worker.is_final_model());
    // a's second step ran in the other worker
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(
        *events.lock().unwrap(),
        [
            ("a".to_string(), StepOutcome::Trained { fully_trained: false }),
            ("b".to_string(), StepOutcome::Trained { fully_trained: true }),
            ("a".to_string(), StepOutcome::Restored),
        ]
    );

    let names: Vec<&str> = worker.members().iter().map(|m| m.candidate.name()).collect();
    assert_eq!(names, ["a", "b"]);
    assert!(worker.members().iter().all(|m| m.candidate.is_fully_trained()));
}

#[test]
fn test_done_marker_without_finished_checkpoint_defers() {
    let dir = tempdir().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    // the marker appears but the saved state is still a's first step
    let (mut worker, events) = exploiting_worker(dir.path(), &counter, |store| {
        assert!(store.mark_done("a").unwrap());
    });

    assert_eq!(worker.build(&tiny_dataset()).unwrap(), BuildStatus::Deferred);
    assert!(!worker.is_final_model());
    assert!(!worker.is_fully_trained());
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(
        events.lock().unwrap().last(),
        Some(&("a".to_string(), StepOutcome::Skipped))
    );
    assert!(!CheckpointStore::new(dir.path()).is_run_done());
}

#[test]
fn test_status_during_build_does_not_cause_skips() {
    let dir = tempdir().unwrap();
    let root: PathBuf = dir.path().to_path_buf();
    let counter = Arc::new(AtomicUsize::new(0));
    let names = ["c0", "c1", "c2", "c3"];
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let watcher = {
        let root = root.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let store = CheckpointStore::new(root);
            while !stop.load(Ordering::SeqCst) {
                store.status().unwrap();
            }
        })
    };

    let mut worker = engine(&root, SearchAgent::new(pool(&names, &counter)));
    let status = worker.build(&tiny_dataset()).unwrap();
    stop.store(true, Ordering::SeqCst);
    watcher.join().unwrap();

    assert_eq!(status, BuildStatus::Done);
    assert_eq!(counter.load(Ordering::SeqCst), names.len());
}
