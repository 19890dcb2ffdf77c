//! Propagation: convergence, retries, failure records, supersession, resume

mod common;

use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use rolecap::{
    shard_of, Actor, Capability, Directory, Engine, EngineConfig, FailureStage, Job, SyncState, ROLE_ADMIN, ROLE_DIRECTOR,
    ROLE_EMPLOYEE, ROLE_GUEST, ROLE_MANAGER, ROLE_TEAM_LEAD,
};
use tempfile::TempDir;

use common::{fast_config, populate, setup, setup_faulty};

fn admin() -> Actor {
    Actor::role(ROLE_ADMIN)
}

/// Poll `f` for up to five seconds.
fn eventually(mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    f()
}

fn all_match(dir: &dyn Directory, ids: &[String], engine: &Engine, role: &str) -> bool {
    let role = engine.get_role(role).unwrap();
    ids.iter().all(|id| {
        let p = dir.get_principal(id).unwrap().unwrap();
        p.snapshot.map_or(false, |s| s.role_version == role.version && s.matches(role.capabilities))
    })
}

#[test]
fn test_converges_across_batches() {
    let h = setup(fast_config(3));
    let ids = populate(&h.engine, &h.directory, "e", 10, ROLE_EMPLOYEE);

    let role = h.engine.get_role(ROLE_EMPLOYEE).unwrap();
    let caps = role.capabilities.with(Capability::ViewReports, true);
    h.engine.update_role_capabilities(&admin(), ROLE_EMPLOYEE, caps, role.version).unwrap();
    h.engine.flush().unwrap();

    assert!(all_match(h.directory.as_ref(), &ids, &h.engine, ROLE_EMPLOYEE));
    assert!(ids.iter().all(|id| h.engine.sync_state(id).unwrap() == SyncState::Synced));
    assert!(h.engine.registry().pending().unwrap().is_empty());
    assert!(h.engine.propagation_failures().unwrap().is_empty());
}

#[test]
fn test_report_counts_batches() {
    let h = setup(fast_config(4));
    populate(&h.engine, &h.directory, "e", 10, ROLE_EMPLOYEE);
    let role = h.engine.get_role(ROLE_EMPLOYEE).unwrap();
    let update = h
        .engine
        .registry()
        .update_capabilities(&admin(), ROLE_EMPLOYEE, role.capabilities.with(Capability::ViewAnalytics, true), role.version)
        .unwrap();

    let report = h.engine.coordinator().run(&Job { role: ROLE_EMPLOYEE.into(), version: update.role.version }).unwrap();
    assert_eq!(report.principals, 10);
    assert_eq!(report.batches, 3);
    assert_eq!(report.written, 10);
    assert_eq!(report.failed_batches, 0);
    assert!(!report.superseded);

    // A second run changes nothing
    let again = h.engine.coordinator().run(&Job { role: ROLE_EMPLOYEE.into(), version: update.role.version }).unwrap();
    assert_eq!(again.written, 0);
}

#[test]
fn test_synchronous_propagate() {
    let h = setup(fast_config(2));
    let ids = populate(&h.engine, &h.directory, "e", 5, ROLE_EMPLOYEE);
    let role = h.engine.get_role(ROLE_EMPLOYEE).unwrap();
    h.engine
        .registry()
        .update_capabilities(&admin(), ROLE_EMPLOYEE, role.capabilities.with(Capability::ViewAnalytics, true), role.version)
        .unwrap();
    assert_eq!(h.engine.sync_state(&ids[0]).unwrap(), SyncState::PendingPropagation);

    let report = h.engine.propagate(ROLE_EMPLOYEE).unwrap();
    assert_eq!(report.batches, 3);
    assert!(all_match(h.directory.as_ref(), &ids, &h.engine, ROLE_EMPLOYEE));
}

#[test]
fn test_other_roles_untouched() {
    let h = setup(fast_config(8));
    populate(&h.engine, &h.directory, "e", 3, ROLE_EMPLOYEE);
    let managers = populate(&h.engine, &h.directory, "m", 3, ROLE_MANAGER);

    let role = h.engine.get_role(ROLE_EMPLOYEE).unwrap();
    h.engine.update_role_capabilities(&admin(), ROLE_EMPLOYEE, role.capabilities.with(Capability::ViewReports, true), role.version).unwrap();
    h.engine.flush().unwrap();

    for id in &managers {
        assert_eq!(h.directory.get_principal(id).unwrap().unwrap().snapshot.unwrap().role_version, 1);
    }
}

#[test]
fn test_transient_timeouts_are_retried() {
    let h = setup_faulty(fast_config(4));
    let ids = populate(&h.engine, &h.inner, "e", 6, ROLE_EMPLOYEE);
    h.faulty.transient_writes.store(2, Ordering::SeqCst);

    let role = h.engine.get_role(ROLE_EMPLOYEE).unwrap();
    h.engine.update_role_capabilities(&admin(), ROLE_EMPLOYEE, role.capabilities.with(Capability::ViewBudgets, true), role.version).unwrap();
    h.engine.flush().unwrap();

    assert!(all_match(h.inner.as_ref(), &ids, &h.engine, ROLE_EMPLOYEE));
    assert!(h.engine.propagation_failures().unwrap().is_empty());
    // 2 batches plus 2 timed-out attempts
    assert_eq!(h.faulty.write_calls.load(Ordering::SeqCst), 4);
}

#[test]
fn test_exhausted_batch_is_recorded_and_retried() {
    let h = setup_faulty(fast_config(2));
    let ids = populate(&h.engine, &h.inner, "e", 5, ROLE_EMPLOYEE);
    let bad = ids[2].clone();
    h.faulty.poison(&bad);

    let role = h.engine.get_role(ROLE_EMPLOYEE).unwrap();
    let edited = h
        .engine
        .update_role_capabilities(&admin(), ROLE_EMPLOYEE, role.capabilities.with(Capability::ViewBudgets, true), role.version)
        .unwrap();
    h.engine.flush().unwrap();

    let failures = h.engine.propagation_failures().unwrap();
    assert_eq!(failures.len(), 1);
    let f = &failures[0];
    assert_eq!(f.role, ROLE_EMPLOYEE);
    assert_eq!(f.version, edited.version);
    assert_eq!(f.stage, FailureStage::Write);
    assert_eq!(f.attempts, 3);
    assert!(f.principals.contains(&bad));

    for id in &ids {
        let expected = if f.principals.contains(id) { SyncState::FailedPropagation } else { SyncState::Synced };
        assert_eq!(h.engine.sync_state(id).unwrap(), expected, "{}", id);
    }
    // The failed principals still answer from their old snapshot
    assert!(!h.engine.has_capability_for(&bad, Capability::ViewBudgets));
    assert!(h.engine.registry().pending().unwrap().is_empty());

    h.faulty.heal();
    assert_eq!(h.engine.retry_failed_propagations().unwrap(), 1);
    h.engine.flush().unwrap();

    assert!(h.engine.propagation_failures().unwrap().is_empty());
    assert!(all_match(h.inner.as_ref(), &ids, &h.engine, ROLE_EMPLOYEE));
    assert!(h.engine.has_capability_for(&bad, Capability::ViewBudgets));
}

#[test]
fn test_enumeration_failure_covers_every_holder() {
    let h = setup_faulty(fast_config(4));
    let ids = populate(&h.engine, &h.inner, "e", 3, ROLE_EMPLOYEE);
    h.faulty.fail_enumerate.store(true, Ordering::SeqCst);

    let role = h.engine.get_role(ROLE_EMPLOYEE).unwrap();
    h.engine.update_role_capabilities(&admin(), ROLE_EMPLOYEE, role.capabilities.with(Capability::ViewBudgets, true), role.version).unwrap();
    h.engine.flush().unwrap();

    let failures = h.engine.propagation_failures().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].stage, FailureStage::Enumerate);
    assert!(ids.iter().all(|id| h.engine.sync_state(id).unwrap() == SyncState::FailedPropagation));

    h.faulty.heal();
    h.engine.retry_failed_propagations().unwrap();
    h.engine.flush().unwrap();
    assert!(ids.iter().all(|id| h.engine.sync_state(id).unwrap() == SyncState::Synced));
}

#[test]
fn test_newer_run_clears_older_failures() {
    let h = setup_faulty(fast_config(2));
    let ids = populate(&h.engine, &h.inner, "e", 4, ROLE_EMPLOYEE);
    h.faulty.poison(&ids[0]);

    let role = h.engine.get_role(ROLE_EMPLOYEE).unwrap();
    let v2 = h.engine.update_role_capabilities(&admin(), ROLE_EMPLOYEE, role.capabilities.with(Capability::ViewBudgets, true), role.version).unwrap();
    h.engine.flush().unwrap();
    assert_eq!(h.engine.propagation_failures().unwrap().len(), 1);

    h.faulty.heal();
    h.engine.update_role_capabilities(&admin(), ROLE_EMPLOYEE, v2.capabilities.with(Capability::ViewAnalytics, true), v2.version).unwrap();
    h.engine.flush().unwrap();

    assert!(h.engine.propagation_failures().unwrap().is_empty());
    assert!(all_match(h.inner.as_ref(), &ids, &h.engine, ROLE_EMPLOYEE));
}

#[test]
fn test_stale_job_is_superseded_before_start() {
    let h = setup(fast_config(4));
    populate(&h.engine, &h.directory, "e", 3, ROLE_EMPLOYEE);
    let registry = h.engine.registry();

    let r1 = h.engine.get_role(ROLE_EMPLOYEE).unwrap();
    let v2 = registry.update_capabilities(&admin(), ROLE_EMPLOYEE, r1.capabilities.with(Capability::ViewBudgets, true), r1.version).unwrap().role;
    let v3 = registry.update_capabilities(&admin(), ROLE_EMPLOYEE, v2.capabilities.with(Capability::ViewAnalytics, true), v2.version).unwrap().role;

    let stale = h.engine.coordinator().run(&Job { role: ROLE_EMPLOYEE.into(), version: v2.version }).unwrap();
    assert!(stale.superseded);
    assert_eq!(stale.written, 0);
    // The newer marker is kept
    assert_eq!(registry.pending().unwrap(), vec![(ROLE_EMPLOYEE.to_string(), v3.version)]);

    let fresh = h.engine.coordinator().run(&Job { role: ROLE_EMPLOYEE.into(), version: v3.version }).unwrap();
    assert_eq!(fresh.written, 3);
    assert!(registry.pending().unwrap().is_empty());
}

#[test]
fn test_edit_mid_run_abandons_remaining_batches() {
    let h = setup_faulty(fast_config(1));
    let ids = populate(&h.engine, &h.inner, "e", 3, ROLE_EMPLOYEE);
    let registry = h.engine.registry().clone();

    let r1 = h.engine.get_role(ROLE_EMPLOYEE).unwrap();
    let v2 = registry.update_capabilities(&admin(), ROLE_EMPLOYEE, r1.capabilities.with(Capability::ViewBudgets, true), r1.version).unwrap().role;

    let hook_registry = registry.clone();
    let v2_caps = v2.capabilities;
    h.faulty.on_next_write(move || {
        hook_registry
            .update_capabilities(&Actor::super_admin(), ROLE_EMPLOYEE, v2_caps.with(Capability::ViewAnalytics, true), 2)
            .unwrap();
    });

    let report = h.engine.coordinator().run(&Job { role: ROLE_EMPLOYEE.into(), version: v2.version }).unwrap();
    assert!(report.superseded);
    assert_eq!(report.batches, 1);

    let v3 = h.engine.get_role(ROLE_EMPLOYEE).unwrap();
    assert_eq!(v3.version, 3);
    h.engine.coordinator().run(&Job { role: ROLE_EMPLOYEE.into(), version: v3.version }).unwrap();
    assert!(all_match(h.inner.as_ref(), &ids, &h.engine, ROLE_EMPLOYEE));
}

#[test]
fn test_older_snapshot_never_overwrites_newer() {
    let h = setup(fast_config(4));
    let ids = populate(&h.engine, &h.directory, "e", 2, ROLE_EMPLOYEE);
    let registry = h.engine.registry();

    let r1 = h.engine.get_role(ROLE_EMPLOYEE).unwrap();
    let v2 = registry.update_capabilities(&admin(), ROLE_EMPLOYEE, r1.capabilities.with(Capability::ViewBudgets, true), r1.version).unwrap().role;
    let v3 = registry.update_capabilities(&admin(), ROLE_EMPLOYEE, v2.capabilities.with(Capability::ViewAnalytics, true), v2.version).unwrap().role;

    h.engine.coordinator().run(&Job { role: ROLE_EMPLOYEE.into(), version: v3.version }).unwrap();
    // Replaying the stale batch directly must not regress anyone
    let stale = rolecap::Snapshot::of(&v2);
    let writes: Vec<_> = ids
        .iter()
        .map(|id| rolecap::SnapshotWrite { principal: id.clone(), role: ROLE_EMPLOYEE.into(), snapshot: stale.clone() })
        .collect();
    assert_eq!(h.directory.write_snapshots(&writes).unwrap(), 0);
    assert!(all_match(h.directory.as_ref(), &ids, &h.engine, ROLE_EMPLOYEE));
}

#[test]
fn test_pending_edit_resumes_after_reopen() {
    let dir = TempDir::new().unwrap();
    let ids;
    let edited;
    {
        let (engine, directory) = Engine::open(dir.path(), fast_config(4)).unwrap();
        ids = populate(&engine, &directory, "e", 5, ROLE_EMPLOYEE);
        let r1 = engine.get_role(ROLE_EMPLOYEE).unwrap();
        // Commit the edit without queueing it, as if the process died right after
        edited = engine
            .registry()
            .update_capabilities(&admin(), ROLE_EMPLOYEE, r1.capabilities.with(Capability::ViewBudgets, true), r1.version)
            .unwrap()
            .role;
        assert!(ids.iter().all(|id| engine.sync_state(id).unwrap() == SyncState::PendingPropagation));
        engine.shutdown();
    }

    let (engine, directory) = Engine::open(dir.path(), fast_config(4)).unwrap();
    engine.flush().unwrap();
    assert_eq!(engine.get_role(ROLE_EMPLOYEE).unwrap(), edited);
    assert!(all_match(directory.as_ref(), &ids, &engine, ROLE_EMPLOYEE));
    assert!(engine.registry().pending().unwrap().is_empty());
}

#[test]
fn test_batches_respect_directory_limit() {
    let h = setup_faulty(fast_config(50));
    let ids = populate(&h.engine, &h.inner, "e", 7, ROLE_EMPLOYEE);
    let role = h.engine.get_role(ROLE_EMPLOYEE).unwrap();
    h.engine.registry().update_capabilities(&admin(), ROLE_EMPLOYEE, role.capabilities.with(Capability::ViewBudgets, true), role.version).unwrap();

    // Directory limit is the configured 50; engine never sends more
    let report = h.engine.coordinator().run(&Job { role: ROLE_EMPLOYEE.into(), version: role.version + 1 }).unwrap();
    assert_eq!(report.batches, 1);
    assert_eq!(report.written, ids.len());
}

#[test]
fn test_stalled_marker_is_swept_without_restart() {
    let config = EngineConfig { resume_interval: Duration::from_millis(20), ..fast_config(4) };
    let h = setup(config);
    let ids = populate(&h.engine, &h.directory, "e", 5, ROLE_EMPLOYEE);
    let role = h.engine.get_role(ROLE_EMPLOYEE).unwrap();

    // Marker committed but no job queued, as when submit fails
    h.engine
        .registry()
        .update_capabilities(&admin(), ROLE_EMPLOYEE, role.capabilities.with(Capability::ViewBudgets, true), role.version)
        .unwrap();

    assert!(eventually(|| ids.iter().all(|id| h.engine.sync_state(id).unwrap() == SyncState::Synced)));
    assert!(all_match(h.directory.as_ref(), &ids, &h.engine, ROLE_EMPLOYEE));
    assert!(eventually(|| h.engine.registry().pending().unwrap().is_empty()));
}

#[test]
fn test_slow_role_does_not_block_other_shards() {
    let config = EngineConfig { workers: 4, ..fast_config(4) };
    let roles = [ROLE_EMPLOYEE, ROLE_GUEST, ROLE_TEAM_LEAD, ROLE_MANAGER, ROLE_DIRECTOR];
    let (slow, fast) = roles
        .iter()
        .flat_map(|a| roles.iter().map(move |b| (*a, *b)))
        .find(|(a, b)| shard_of(a, 4) != shard_of(b, 4))
        .expect("seeded roles spread over shards");

    let h = setup_faulty(config);
    populate(&h.engine, &h.inner, "s", 2, slow);
    populate(&h.engine, &h.inner, "f", 2, fast);

    // The slow role's first batch hangs until released
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    h.faulty.on_next_write(move || {
        entered_tx.send(()).unwrap();
        let _ = release_rx.recv_timeout(Duration::from_secs(10));
    });

    let su = Actor::super_admin();
    let r = h.engine.get_role(slow).unwrap();
    h.engine.update_role_capabilities(&su, slow, r.capabilities.with(Capability::ViewBudgets, !r.capabilities.contains(Capability::ViewBudgets)), r.version).unwrap();
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let r = h.engine.get_role(fast).unwrap();
    h.engine.update_role_capabilities(&su, fast, r.capabilities.with(Capability::ViewBudgets, !r.capabilities.contains(Capability::ViewBudgets)), r.version).unwrap();
    assert!(eventually(|| (0..2).all(|i| h.engine.sync_state(&format!("f{}", i)).unwrap() == SyncState::Synced)));
    assert_eq!(h.engine.sync_state("s0").unwrap(), SyncState::PendingPropagation);

    release_tx.send(()).unwrap();
    h.engine.flush().unwrap();
    assert!((0..2).all(|i| h.engine.sync_state(&format!("s{}", i)).unwrap() == SyncState::Synced));
}
