//! Integration tests for monitoring agent hosts end to end
//!
//! Agent and TSDB are both mocked with wiremock.

use std::sync::Arc;
use std::time::Duration;

use fleet_monitor::agent::AgentInventory;
use fleet_monitor::bus::LocalBus;
use fleet_monitor::repartitioner::{IdRange, Repartitioner, RepartitionerConfig};
use fleet_monitor::resource::{Reading, ResourceType};
use fleet_monitor::tsdb::TsdbClient;
use fleet_monitor::wrapper::MonitorWrapper;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn repartitioner() -> Arc<Repartitioner> {
    Arc::new(Repartitioner::new(RepartitionerConfig::new(1), Arc::new(LocalBus::new())).unwrap())
}

#[tokio::test]
async fn test_agent_host_is_polled_and_exported() {
    let agent = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metrics"))
        .and(header("X-MONITORING-SECRET", "test-token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(create_mock_metrics_json(42.0, Some(55.0))),
        )
        .mount(&agent)
        .await;

    let tsdb_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/import/prometheus"))
        .and(body_string_contains("cpu_usage_percent"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&tsdb_server)
        .await;

    let host_id = Uuid::from_u128(7);
    let inventory = Arc::new(AgentInventory::new(vec![create_host_config(&agent, host_id)]).unwrap());
    let types: Vec<Arc<dyn ResourceType>> = vec![inventory];
    let tsdb = Arc::new(TsdbClient::new(tsdb_server.uri()).unwrap());
    let mut runner = create_runner(types, Some(tsdb), repartitioner()).await;
    let handle = runner.handle();

    let task = tokio::spawn(async move {
        runner.run().await.unwrap();
        runner
    });

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let requests = tsdb_server.received_requests().await.unwrap_or_default();
            if requests.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("metrics were not exported");

    handle.shutdown();
    let mut runner = task.await.unwrap();
    runner.wait_cleanup(Some(Duration::from_secs(2))).await;

    let wrapper = runner.health_pool().resources()[&host_id].clone();
    let pulse = wrapper.pulse().await.expect("host was never probed");
    assert_eq!(pulse.reading, Reading::Up);

    let metrics_wrapper = runner.metrics_pool().resources()[&host_id].clone();
    assert!(metrics_wrapper.last_export_success().await);
}

#[tokio::test]
async fn test_unreachable_agent_reads_down() {
    let agent = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&agent)
        .await;

    let host_id = Uuid::from_u128(8);
    let inventory = Arc::new(AgentInventory::new(vec![create_host_config(&agent, host_id)]).unwrap());
    let types: Vec<Arc<dyn ResourceType>> = vec![inventory];
    let mut pool = health_pool(types).await;

    let created = pool
        .scan(&IdRange::full())
        .await
        .unwrap();
    for wrapper in created {
        pool.submit(wrapper).await.unwrap();
    }
    pool.wait_cleanup(Some(Duration::from_secs(5))).await;

    let wrapper = pool.resources()[&host_id].clone();
    let pulse = wrapper.pulse().await.unwrap();
    assert_eq!(pulse.reading, Reading::Down);
    assert_eq!(pulse.reading_rpt, 1);
}

#[tokio::test]
async fn test_removed_host_is_retired() {
    let agent = MockServer::start().await;
    let host_id = Uuid::from_u128(9);
    let inventory = Arc::new(AgentInventory::new(vec![create_host_config(&agent, host_id)]).unwrap());
    let types: Vec<Arc<dyn ResourceType>> = vec![inventory.clone()];
    let mut pool = health_pool(types).await;

    let created = pool
        .scan(&IdRange::full())
        .await
        .unwrap();
    inventory.remove(&host_id);
    for wrapper in created.iter().cloned() {
        pool.submit(wrapper).await.unwrap();
    }

    wait_until(5, || created[0].is_deleted()).await;
    // Let the worker hand the wrapper back before draining.
    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.enqueue(chrono::Utc::now()).await.unwrap();

    assert!(pool.resources().is_empty());
    pool.wait_cleanup(Some(Duration::from_secs(2))).await;
}
