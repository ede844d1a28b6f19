//! Mutual exclusion of index operations within one repository.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use p2_aggregator::{ArtifactStore, DescriptorKind, Outcome, RebuildOutcome};

#[path = "./support/mod.rs"]
mod support;

use support::{BUNDLE, REPOSITORY_ID, SlowToolkit, TestRepository};

#[test]
fn concurrent_updates_never_interleave() {
    let toolkit = Arc::new(SlowToolkit::new(Duration::from_millis(150)));
    let repo = Arc::new(TestRepository::with_toolkit(toolkit.clone()));
    repo.enable();

    let modules: Vec<_> = ["foo", "bar", "baz"]
        .into_iter()
        .map(|id| repo.publish("org/acme", id, "1.0", BUNDLE))
        .collect();

    let handles: Vec<_> = modules
        .iter()
        .map(|module| {
            let repo = repo.clone();
            let fragment = repo.fragment(&module.artifacts);
            thread::spawn(move || repo.aggregator.update_artifacts(&fragment))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), Outcome::Applied);
    }

    // no update was lost to a concurrent swap
    let artifacts = repo.exposed_text(DescriptorKind::Artifacts);
    assert!(artifacts.contains("<artifacts size='3'>"), "{artifacts}");
    for id in ["foo", "bar", "baz"] {
        assert!(artifacts.contains(&format!("id='{id}'")));
    }

    let mut intervals = toolkit.intervals.lock().clone();
    assert_eq!(intervals.len(), 3);
    intervals.sort_by_key(|(start, _)| *start);
    for pair in intervals.windows(2) {
        assert!(pair[1].0 >= pair[0].1, "merges overlapped: {pair:?}");
    }
}

#[test]
fn metadata_and_artifacts_share_the_repository_lock() {
    let toolkit = Arc::new(SlowToolkit::new(Duration::from_millis(100)));
    let repo = Arc::new(TestRepository::with_toolkit(toolkit.clone()));
    repo.enable();
    let module = repo.publish("org/acme", "foo", "1.0", BUNDLE);

    let artifacts = {
        let repo = repo.clone();
        let fragment = repo.fragment(&module.artifacts);
        thread::spawn(move || repo.aggregator.update_artifacts(&fragment))
    };
    let metadata = {
        let repo = repo.clone();
        let fragment = repo.fragment(&module.content);
        thread::spawn(move || repo.aggregator.update_metadata(&fragment))
    };
    assert_eq!(artifacts.join().unwrap(), Outcome::Applied);
    assert_eq!(metadata.join().unwrap(), Outcome::Applied);

    let mut intervals = toolkit.intervals.lock().clone();
    intervals.sort_by_key(|(start, _)| *start);
    assert!(intervals[1].0 >= intervals[0].1);
}

#[test]
fn disable_wins_over_an_update_waiting_for_the_lock() {
    let repo = Arc::new(TestRepository::with_update_lock_delay(Duration::from_millis(300)));
    repo.enable();
    let module = repo.publish("org/acme", "foo", "1.0", BUNDLE);

    let update = {
        let repo = repo.clone();
        let fragment = repo.fragment(&module.content);
        thread::spawn(move || repo.aggregator.update_metadata(&fragment))
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(repo.aggregator.disable(REPOSITORY_ID), Outcome::Applied);

    assert_eq!(update.join().unwrap(), Outcome::Disabled);
    assert!(!repo.aggregator.is_enabled(REPOSITORY_ID));
    assert!(
        repo.store.lookup(repo.aggregator.index_root()).unwrap().is_none(),
        "index subtree exists for a disabled repository"
    );
    assert!(repo.store.lookup(&repo.link("plugins/foo_1.0.0.jar")).unwrap().is_none());
}

#[test]
fn rebuild_and_update_are_serialized() {
    let toolkit = Arc::new(SlowToolkit::new(Duration::from_millis(150)));
    let repo = Arc::new(TestRepository::with_toolkit(toolkit.clone()));
    repo.publish("org/acme", "foo", "1.0", BUNDLE);
    repo.enable();

    let rebuild = {
        let repo = repo.clone();
        thread::spawn(move || repo.aggregator.scan_and_rebuild(REPOSITORY_ID))
    };
    thread::sleep(Duration::from_millis(50));
    let bar = repo.publish("org/acme", "bar", "1.0", BUNDLE);
    let update = {
        let repo = repo.clone();
        let fragment = repo.fragment(&bar.artifacts);
        thread::spawn(move || repo.aggregator.update_artifacts(&fragment))
    };

    assert!(matches!(rebuild.join().unwrap(), RebuildOutcome::Completed(_)));
    assert_eq!(update.join().unwrap(), Outcome::Applied);

    let artifacts = repo.exposed_text(DescriptorKind::Artifacts);
    assert!(artifacts.contains("id='foo'"), "{artifacts}");
    assert!(artifacts.contains("id='bar'"), "{artifacts}");

    let mut intervals = toolkit.intervals.lock().clone();
    intervals.sort_by_key(|(start, _)| *start);
    for pair in intervals.windows(2) {
        assert!(pair[1].0 >= pair[0].1, "merges overlapped: {pair:?}");
    }
}
