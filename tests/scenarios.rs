//! End-to-end scenarios over the public API: a single client registering,
//! listing, and watching against a live region source.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use global_resource_service::aggregator::Aggregator;
use global_resource_service::distributor::Distributor;
use global_resource_service::errors::CoreError;
use global_resource_service::event_log::NodeEventLog;
use global_resource_service::location::LocationTable;
use global_resource_service::registry::{ClientRegistry, RegisterRequest};
use global_resource_service::simulator::{DataPattern, RegionSimulator};
use global_resource_service::store::MemoryStore;
use global_resource_service::types::RvLocation;

fn local_logs(region_id: u32, rp_num: usize, capacity: usize) -> Arc<HashMap<RvLocation, Arc<NodeEventLog>>> {
    let mut logs = HashMap::new();
    for rp in 0..rp_num as u32 {
        let loc = RvLocation { region: region_id, partition: rp };
        logs.insert(loc, Arc::new(NodeEventLog::new(loc, capacity)));
    }
    Arc::new(logs)
}

/// Scenario 1: a client can query a single node and get its current value.
#[tokio::test]
async fn single_node_query_returns_current_value() {
    let locations = Arc::new(LocationTable::new(["Beijing".to_string()], 1));
    let logs = local_logs(0, 1, 1_000);
    let registry = ClientRegistry::new(locations, logs.clone(), Arc::new(MemoryStore::new()));
    let distributor = Distributor::new(logs.clone(), registry.clone());

    let loc = RvLocation { region: 0, partition: 0 };
    let log = logs.get(&loc).unwrap();
    log.append(
        global_resource_service::types::NodeEventType::Added,
        global_resource_service::types::LogicalNode::new(
            "beijing.rp-0.0".to_string(),
            global_resource_service::types::GeoInfo { region: 0, resource_partition: 0 },
            serde_json::json!({"cpu_cores": 16}),
        ),
    );

    let (client_id, _alloc) = registry
        .register(RegisterRequest {
            friendly_name: "query-client".to_string(),
            regions: vec!["Beijing".to_string()],
            requested_quota: 1,
        })
        .await
        .unwrap();

    let (nodes, _crv) = distributor.list(&client_id).await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].id, "beijing.rp-0.0");
    assert_eq!(nodes[0].payload["cpu_cores"], 16);
}

/// Scenario 2: registering with a small requested quota against a region
/// with many more nodes than that quota still draws the whole region — every
/// resource partition, every node currently in it — rather than truncating
/// mid-region. `requested_quota` is a floor the registration tries to clear,
/// not a cap on what a client ends up with; the CRV returned by List has one
/// entry per resource partition touched.
#[tokio::test]
async fn register_draws_the_whole_region_even_past_quota() {
    let rp_num = 10;
    let nodes_per_rp = 3000;
    let locations = Arc::new(LocationTable::new(["Beijing".to_string()], rp_num));
    let logs = local_logs(0, rp_num, nodes_per_rp * 2);
    for rp in 0..rp_num as u32 {
        let log = logs.get(&RvLocation { region: 0, partition: rp }).unwrap();
        for i in 0..nodes_per_rp {
            log.append(
                global_resource_service::types::NodeEventType::Added,
                global_resource_service::types::LogicalNode::new(
                    format!("rp{rp}.{i}"),
                    global_resource_service::types::GeoInfo { region: 0, resource_partition: rp },
                    serde_json::json!({}),
                ),
            );
        }
    }
    let registry = ClientRegistry::new(locations, logs.clone(), Arc::new(MemoryStore::new()));
    let distributor = Distributor::new(logs.clone(), registry.clone());

    let (client_id, alloc) = registry
        .register(RegisterRequest {
            friendly_name: "quota-client".to_string(),
            regions: vec!["Beijing".to_string()],
            requested_quota: 2500,
        })
        .await
        .unwrap();
    assert_eq!(alloc.node_ids.len(), rp_num * nodes_per_rp);
    assert_eq!(alloc.per_partition_base.len(), rp_num, "CRV must cover every RP the region touched");

    let (nodes, crv) = distributor.list(&client_id).await.unwrap();
    assert_eq!(nodes.len(), rp_num * nodes_per_rp);
    assert_eq!(crv.len(), rp_num);
}

/// Scenario 3: the Daily pattern's steady trickle of updates reaches a
/// watching client through the full Aggregator -> Distributor pipeline.
/// The production cadence is 10 events/RP/minute; the tick is shortened here
/// so the test completes in well under a second.
#[tokio::test]
async fn watch_receives_daily_pattern_updates_through_the_pipeline() {
    let region_name = "Beijing".to_string();
    let rp_num = 2;
    let sim = RegionSimulator::new(0, region_name.clone(), rp_num, 20, 1_000_000);
    sim.spawn_pattern(DataPattern::Daily { tick: Duration::from_millis(20) });

    let locations = Arc::new(LocationTable::new([region_name.clone()], rp_num));
    let logs = local_logs(0, rp_num, 1_000_000);
    let store = Arc::new(MemoryStore::new());
    let registry = ClientRegistry::new(locations, logs.clone(), store.clone());

    let aggregator = Aggregator::new(logs.clone(), store, 10_000);
    aggregator.spawn_source(sim);

    // Give the aggregator a moment to pull the initial Added burst before
    // the client registers, so its allocation is non-empty.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (client_id, alloc) = registry
        .register(RegisterRequest {
            friendly_name: "daily-watcher".to_string(),
            regions: vec!["Beijing".to_string()],
            requested_quota: 40,
        })
        .await
        .unwrap();
    assert!(!alloc.node_ids.is_empty());

    let distributor = Distributor::new(logs, registry);
    let (_initial, crv) = distributor.list(&client_id).await.unwrap();
    let mut rx = distributor.watch(&client_id, crv).await.unwrap();

    let mut received = 0usize;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while received < 40 && tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(Ok(_event))) => received += 1,
            Ok(Some(Err(e))) => panic!("unexpected watch error: {e}"),
            Ok(None) => break,
            Err(_) => continue,
        }
    }
    assert!(received >= 40, "expected at least 40 events from the Daily pattern, got {received}");
}

/// Scenario 6: a watching client that never drains its channel is
/// disconnected with `ClientSlow` once it exceeds `WatchIdleTimeout`.
#[tokio::test]
async fn slow_client_is_evicted_after_idle_timeout() {
    let locations = Arc::new(LocationTable::new(["Beijing".to_string()], 1));
    let logs = local_logs(0, 1, 100_000);
    let registry = ClientRegistry::new(locations, logs.clone(), Arc::new(MemoryStore::new()));

    let loc = RvLocation { region: 0, partition: 0 };
    let log = logs.get(&loc).unwrap();
    for i in 0..20 {
        log.append(
            global_resource_service::types::NodeEventType::Added,
            global_resource_service::types::LogicalNode::new(
                format!("n{i}"),
                global_resource_service::types::GeoInfo { region: 0, resource_partition: 0 },
                serde_json::json!({}),
            ),
        );
    }

    let (client_id, _alloc) = registry
        .register(RegisterRequest {
            friendly_name: "slow-client".to_string(),
            regions: vec!["Beijing".to_string()],
            requested_quota: 20,
        })
        .await
        .unwrap();

    // Tiny channel and idle timeout so the pump blocks on a full channel
    // almost immediately, and the eviction fires quickly.
    let distributor = Distributor::with_config(logs.clone(), registry, 2, Duration::from_millis(200));

    // Keep appending so the pump always has more to push once the channel
    // backs up, simulating a client that never reads.
    tokio::spawn({
        let log = log.clone();
        async move {
            for i in 20..200 {
                log.append(
                    global_resource_service::types::NodeEventType::Modified,
                    global_resource_service::types::LogicalNode::new(
                        format!("n{}", i % 20),
                        global_resource_service::types::GeoInfo { region: 0, resource_partition: 0 },
                        serde_json::json!({}),
                    ),
                );
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    });

    let mut rx = distributor.watch(&client_id, Default::default()).await.unwrap();

    let mut saw_client_slow = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(Err(CoreError::ClientSlow(_)))) => {
                saw_client_slow = true;
                break;
            }
            Ok(Some(Ok(_))) => {
                // Don't drain further; let the backlog pile up behind us.
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Ok(None) => break,
            Err(_) => continue,
        }
    }
    assert!(saw_client_slow, "expected the slow client to be disconnected with ClientSlow");
}
