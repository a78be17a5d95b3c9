//! Integration tests for keyspace partitioning between processes
//!
//! Two repartitioners share one notification bus, the way two monitor
//! processes share a database channel.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fleet_monitor::bus::{LocalBus, PubSub};
use fleet_monitor::repartitioner::{IdRange, Repartitioner, RepartitionerConfig};
use fleet_monitor::resource::ResourceType;
use uuid::Uuid;

use crate::helpers::*;

fn config(partition: u32) -> RepartitionerConfig {
    RepartitionerConfig {
        listen_timeout: Duration::from_millis(10),
        recheck_interval: Duration::from_millis(200),
        stale_after: Duration::from_millis(500),
        ..RepartitionerConfig::new(partition)
    }
}

fn spread_ids(count: u128) -> Vec<Uuid> {
    (0..count)
        .map(|n| Uuid::from_u128(n * (u128::MAX / count)))
        .collect()
}

#[tokio::test]
async fn test_two_processes_split_the_fleet() {
    let bus: Arc<dyn PubSub> = Arc::new(LocalBus::new());
    let first = Arc::new(Repartitioner::new(config(1), bus.clone()).unwrap());
    let second = Arc::new(Repartitioner::new(config(2), bus.clone()).unwrap());

    let listeners = [first.clone(), second.clone()].map(|r| {
        tokio::spawn(async move {
            r.listen().await.unwrap();
        })
    });

    wait_until(5, || first.num_partitions() == 2).await;
    assert_eq!(first.id_range(), IdRange::for_partition(1, 2));
    assert_eq!(second.id_range(), IdRange::for_partition(2, 2));

    let ids = spread_ids(64);
    let resources: Vec<_> = ids.iter().map(|id| TestResource::new(*id)).collect();
    let fleet = TestFleet::new(resources);

    let types: Vec<Arc<dyn ResourceType>> = vec![fleet];
    let mut first_pool = health_pool(types.clone()).await;
    let mut second_pool = health_pool(types).await;
    first_pool.scan(&first.id_range()).await.unwrap();
    second_pool.scan(&second.id_range()).await.unwrap();

    let first_ids: HashSet<Uuid> = first_pool.resources().keys().copied().collect();
    let second_ids: HashSet<Uuid> = second_pool.resources().keys().copied().collect();
    assert!(first_ids.is_disjoint(&second_ids));
    assert_eq!(first_ids.len() + second_ids.len(), ids.len());
    assert!(!first_ids.is_empty() && !second_ids.is_empty());

    first.shutdown();
    second.shutdown();
    for listener in listeners {
        listener.await.unwrap();
    }
}

#[tokio::test]
async fn test_survivor_takes_over_whole_keyspace() {
    let bus: Arc<dyn PubSub> = Arc::new(LocalBus::new());
    let first = Arc::new(Repartitioner::new(config(1), bus.clone()).unwrap());
    let second = Arc::new(Repartitioner::new(config(2), bus.clone()).unwrap());

    let first_listener = tokio::spawn({
        let first = first.clone();
        async move { first.listen().await.unwrap() }
    });
    let second_listener = tokio::spawn({
        let second = second.clone();
        async move { second.listen().await.unwrap() }
    });

    wait_until(5, || first.num_partitions() == 2).await;
    assert!(first.take_repartitioned());

    // The second process goes away and stops announcing itself.
    second.shutdown();
    second_listener.await.unwrap();

    wait_until(5, || first.num_partitions() == 1).await;
    assert_eq!(first.id_range(), IdRange::full());
    assert!(first.take_repartitioned());

    first.shutdown();
    first_listener.await.unwrap();
}
