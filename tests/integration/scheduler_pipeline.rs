//! Integration tests for the scheduling pipeline
//!
//! These tests drive a full runner over an in-memory fleet:
//! - Every resource is polled and exported repeatedly
//! - Fleet changes are picked up by the periodic rescan
//! - Deleted and failing resources never stall the rest

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use fleet_monitor::bus::LocalBus;
use fleet_monitor::repartitioner::{Repartitioner, RepartitionerConfig};
use fleet_monitor::resource::ResourceType;
use fleet_monitor::tsdb::TsdbClient;
use uuid::Uuid;

use crate::helpers::*;

fn repartitioner() -> Arc<Repartitioner> {
    Arc::new(Repartitioner::new(RepartitionerConfig::new(1), Arc::new(LocalBus::new())).unwrap())
}

fn tsdb() -> Option<Arc<TsdbClient>> {
    // Test resources never talk to it.
    Some(Arc::new(TsdbClient::new("http://127.0.0.1:9").unwrap()))
}

#[tokio::test]
async fn test_every_resource_is_polled_repeatedly() {
    let resources: Vec<_> = (1..=20).map(|n| TestResource::new(Uuid::from_u128(n))).collect();
    let fleet = TestFleet::new(resources.clone());
    let types: Vec<Arc<dyn ResourceType>> = vec![fleet];
    let mut runner = create_runner(types, tsdb(), repartitioner()).await;
    let handle = runner.handle();

    let task = tokio::spawn(async move {
        runner.run().await.unwrap();
        runner
    });

    let watched = resources.clone();
    wait_until(10, || watched.iter().all(|r| r.checks() >= 2 && r.exports() >= 2)).await;

    handle.shutdown();
    let mut runner = task.await.unwrap();
    runner.wait_cleanup(Some(Duration::from_secs(2))).await;

    assert_eq!(runner.health_pool().resources().len(), 20);
    for resource in &resources {
        // One session per pool, reused across cycles.
        assert_eq!(resource.opens.load(Ordering::SeqCst), 2);
    }
}

#[tokio::test]
async fn test_rescan_picks_up_fleet_changes() {
    let first = TestResource::new(Uuid::from_u128(1));
    let second = TestResource::new(Uuid::from_u128(2));
    let fleet = TestFleet::new(vec![first.clone()]);
    let types: Vec<Arc<dyn ResourceType>> = vec![fleet.clone()];
    let mut runner = create_runner(types, None, repartitioner()).await;
    let handle = runner.handle();

    let task = tokio::spawn(async move {
        runner.run().await.unwrap();
        runner
    });

    wait_until(5, || first.checks() >= 1).await;
    fleet.set(vec![second.clone()]);
    wait_until(5, || second.checks() >= 2).await;

    // Give the old resource time to be polled again if it were still tracked.
    let checks_after_removal = first.checks();
    tokio::time::sleep(Duration::from_millis(200)).await;

    handle.shutdown();
    let mut runner = task.await.unwrap();
    runner.wait_cleanup(Some(Duration::from_secs(2))).await;

    assert!(first.checks() <= checks_after_removal + 1);
    let tracked: Vec<_> = runner.health_pool().resources().keys().copied().collect();
    assert_eq!(tracked, vec![second.id]);
}

#[tokio::test]
async fn test_deleted_resource_is_retired() {
    let keep = TestResource::new(Uuid::from_u128(1));
    let doomed = TestResource::new(Uuid::from_u128(2));
    let fleet = TestFleet::new(vec![keep.clone(), doomed.clone()]);
    let types: Vec<Arc<dyn ResourceType>> = vec![fleet];
    let mut runner = create_runner(types, None, repartitioner()).await;
    let handle = runner.handle();

    // Deleted at the source but still listed until the next rescan.
    doomed.deleted.store(true, Ordering::SeqCst);

    let task = tokio::spawn(async move {
        runner.run().await.unwrap();
        runner
    });

    wait_until(5, || keep.checks() >= 3).await;

    handle.shutdown();
    let mut runner = task.await.unwrap();
    runner.wait_cleanup(Some(Duration::from_secs(2))).await;

    assert_eq!(doomed.checks(), 0);
    assert!(runner.health_pool().resources().contains_key(&keep.id));
}

#[tokio::test]
async fn test_failing_resource_does_not_stall_others() {
    let healthy = TestResource::new(Uuid::from_u128(1));
    let failing = TestResource::new(Uuid::from_u128(2));
    failing.failing.store(true, Ordering::SeqCst);
    let fleet = TestFleet::new(vec![healthy.clone(), failing.clone()]);
    let types: Vec<Arc<dyn ResourceType>> = vec![fleet];
    let mut runner = create_runner(types, None, repartitioner()).await;
    let handle = runner.handle();

    let task = tokio::spawn(async move {
        runner.run().await.unwrap();
        runner
    });

    // Failures are retried every cycle, without backoff.
    wait_until(5, || healthy.checks() >= 3 && failing.checks() >= 3).await;

    handle.shutdown();
    let mut runner = task.await.unwrap();
    runner.wait_cleanup(Some(Duration::from_secs(2))).await;

    let wrapper = runner.health_pool().resources()[&failing.id].clone();
    assert!(wrapper.pulse().await.is_none());
}

#[tokio::test]
async fn test_shutdown_is_observed_promptly() {
    let fleet = TestFleet::new(Vec::new());
    let types: Vec<Arc<dyn ResourceType>> = vec![fleet];
    let health = health_pool(types.clone()).await;
    let metrics = metrics_pool(types, None).await;
    let settings = fleet_monitor::runner::RunnerSettings {
        enqueue_every: Duration::from_secs(60),
        ..fast_settings()
    };
    let mut runner = fleet_monitor::runner::MonitorRunner::new(health, metrics, repartitioner(), settings);
    let handle = runner.handle();

    let task = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("runner slept through shutdown")
        .unwrap();
    assert!(result.is_ok());
}
