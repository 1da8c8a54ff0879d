//! Distributor: List and Watch over a client's fixed Allocation, with
//! watch backpressure and prolonged-event observability (spec §4.6).
//!
//! Deliberately holds only a read-only Allocation snapshot and an owned
//! output channel, never a back-pointer into the Registry or the logs it
//! doesn't own, so Registry -> Distributor -> Registry cycles can't form
//! (spec §9).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::CoreError;
use crate::event_log::NodeEventLog;
use crate::metrics::{PROLONGED_EVENTS_TOTAL, WATCH_CONNECTIONS, WATCH_EVICTIONS_TOTAL};
use crate::registry::ClientRegistry;
use crate::types::{Allocation, Crv, LogicalNode, NodeEvent, NodeEventType, RvLocation};

/// How many events a watch channel holds before a slow client starts
/// blocking the pump (spec §4.6's backpressure knob).
pub const DEFAULT_WATCH_CHANNEL_CAPACITY: usize = 256;
/// How long the pump will block on a full channel before giving up on the
/// client (spec §4.6 `WatchIdleTimeout`).
pub const DEFAULT_WATCH_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Above this multiple of `WatchIdleTimeout` since an event's last update,
/// a delivered event is logged as "prolonged" (observability only).
const PROLONGED_EVENT_MULTIPLE: u32 = 10;
const WATCH_BATCH_SIZE: usize = 256;
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Distributor {
    logs: Arc<HashMap<RvLocation, Arc<NodeEventLog>>>,
    registry: Arc<ClientRegistry>,
    watch_channel_capacity: usize,
    watch_idle_timeout: Duration,
    /// Per-client "caught up through" cursor: `PerPartitionBase` until the
    /// client's first List/Watch activity, then the CRV of the last event
    /// actually delivered to it. List reports this back as the starting
    /// point for the client's next Watch, rather than the log's live head,
    /// so a client that hasn't drained a Watch yet doesn't silently skip
    /// events it was never shown. Shared with spawned `WatchPump`s so they
    /// can advance it as events are actually delivered.
    last_crv: Arc<Mutex<HashMap<String, Crv>>>,
}

impl Distributor {
    pub fn new(logs: Arc<HashMap<RvLocation, Arc<NodeEventLog>>>, registry: Arc<ClientRegistry>) -> Arc<Self> {
        Self::with_config(
            logs,
            registry,
            DEFAULT_WATCH_CHANNEL_CAPACITY,
            DEFAULT_WATCH_IDLE_TIMEOUT,
        )
    }

    pub fn with_config(
        logs: Arc<HashMap<RvLocation, Arc<NodeEventLog>>>,
        registry: Arc<ClientRegistry>,
        watch_channel_capacity: usize,
        watch_idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Distributor {
            logs,
            registry,
            watch_channel_capacity,
            watch_idle_timeout,
            last_crv: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Current snapshot of every node in the client's allocation, plus the
    /// CRV a subsequent Watch should resume from: `PerPartitionBase` on the
    /// first call, or the CRV of the last event actually delivered to this
    /// client on every call after that (spec §4.6).
    pub async fn list(&self, client_id: &str) -> Result<(Vec<LogicalNode>, Crv), CoreError> {
        let allocation = self.registry.allocation_for(client_id).await?;
        let mut nodes = Vec::with_capacity(allocation.node_ids.len());
        for loc in allocation.touched_locations() {
            let Some(log) = self.logs.get(loc) else { continue };
            for node in log.snapshot_latest() {
                if allocation.node_ids.contains(&node.id) {
                    nodes.push(node);
                }
            }
        }

        let crv = {
            let mut last_crv = self.last_crv.lock().unwrap();
            last_crv
                .entry(client_id.to_string())
                .or_insert_with(|| allocation.per_partition_base.iter().map(|(loc, rv)| (*loc, *rv)).collect())
                .clone()
        };

        debug!(client_id, count = nodes.len(), crv_entries = crv.len(), "list served");
        Ok((nodes, crv))
    }

    /// Starts a watch pump from `from`, returning the receiving half of a
    /// bounded channel. The pump runs until the client disconnects, is
    /// evicted for exceeding `WatchIdleTimeout`, or the process shuts down.
    pub async fn watch(
        self: &Arc<Self>,
        client_id: &str,
        from: Crv,
    ) -> Result<mpsc::Receiver<Result<NodeEvent, CoreError>>, CoreError> {
        let allocation = self.registry.allocation_for(client_id).await?;
        let (tx, rx) = mpsc::channel(self.watch_channel_capacity);

        let pump = WatchPump {
            client_id: client_id.to_string(),
            logs: self.logs.clone(),
            allocation,
            cursor: from,
            idle_timeout: self.watch_idle_timeout,
            deleted_sent: Arc::new(Mutex::new(HashSet::new())),
            last_crv: self.last_crv.clone(),
        };
        WATCH_CONNECTIONS.inc();
        tokio::spawn(pump.run(tx));
        Ok(rx)
    }
}

struct WatchPump {
    client_id: String,
    logs: Arc<HashMap<RvLocation, Arc<NodeEventLog>>>,
    allocation: Arc<Allocation>,
    cursor: Crv,
    idle_timeout: Duration,
    deleted_sent: Arc<Mutex<HashSet<String>>>,
    last_crv: Arc<Mutex<HashMap<String, Crv>>>,
}

impl WatchPump {
    async fn run(mut self, tx: mpsc::Sender<Result<NodeEvent, CoreError>>) {
        loop {
            let batch = match self.collect_batch() {
                Ok(batch) => batch,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    WATCH_CONNECTIONS.dec();
                    return;
                }
            };

            if batch.is_empty() {
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                continue;
            }

            let deadline = Instant::now() + self.idle_timeout;
            for (loc, event) in batch {
                if !self.should_deliver(&event) {
                    continue;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::select! {
                    biased;
                    result = tx.send(Ok(event.as_ref().clone())) => {
                        if result.is_err() {
                            debug!(client_id = %self.client_id, "watch receiver dropped");
                            WATCH_EVICTIONS_TOTAL.with_label_values(&["client_dropped"]).inc();
                            WATCH_CONNECTIONS.dec();
                            return;
                        }
                        self.mark_delivered(loc, event.node.resource_version);
                        self.warn_if_prolonged(&event);
                    }
                    _ = tokio::time::sleep(remaining) => {
                        warn!(client_id = %self.client_id, "watch idle timeout exceeded, disconnecting slow client");
                        let _ = tx.try_send(Err(CoreError::ClientSlow(self.client_id.clone())));
                        WATCH_EVICTIONS_TOTAL.with_label_values(&["idle_timeout"]).inc();
                        WATCH_CONNECTIONS.dec();
                        return;
                    }
                }
            }
        }
    }

    fn should_deliver(&self, event: &Arc<NodeEvent>) -> bool {
        if event.event_type == NodeEventType::Deleted {
            let mut sent = self.deleted_sent.lock().unwrap();
            return sent.insert(event.node.id.clone());
        }
        true
    }

    /// Advances the client's durably-reported cursor to reflect an event
    /// that has actually reached the channel, so a subsequent List sees
    /// exactly what this client has been shown so far.
    fn mark_delivered(&self, loc: RvLocation, rv: u64) {
        let mut last_crv = self.last_crv.lock().unwrap();
        last_crv.entry(self.client_id.clone()).or_default().insert(loc, rv);
    }

    fn warn_if_prolonged(&self, event: &Arc<NodeEvent>) {
        let age_ms = crate::types::now_millis() - event.node.last_updated_unix_millis;
        let threshold_ms = self.idle_timeout.as_millis() as i64;
        if threshold_ms > 0 && age_ms > threshold_ms * PROLONGED_EVENT_MULTIPLE as i64 {
            warn!(
                client_id = %self.client_id,
                node_id = %event.node.id,
                age_ms,
                "delivered a prolonged event (observability only, not an error)"
            );
            PROLONGED_EVENTS_TOTAL
                .with_label_values(&[&event.node.geo_info.region.to_string()])
                .inc();
        }
    }

    /// Pulls up to `WATCH_BATCH_SIZE` events across every touched location,
    /// filtered to the allocation's node set, advancing `self.cursor`.
    fn collect_batch(&mut self) -> Result<Vec<(RvLocation, Arc<NodeEvent>)>, CoreError> {
        let mut batch = Vec::new();
        for loc in self.allocation.touched_locations() {
            let Some(log) = self.logs.get(loc) else { continue };
            let after = self.cursor.at(loc);
            if after >= log.head_rv() {
                continue;
            }
            let (events, next_rv, _has_more) = log.range_since(after, WATCH_BATCH_SIZE)?;
            for event in events {
                if self.allocation.node_ids.contains(&event.node.id) {
                    batch.push((*loc, event));
                }
            }
            self.cursor.insert(*loc, next_rv);
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::LocationTable;
    use crate::registry::{ClientRegistry, RegisterRequest};
    use crate::store::MemoryStore;
    use crate::types::GeoInfo;
    use serde_json::json;

    async fn setup() -> (Arc<Distributor>, String) {
        let locations = Arc::new(LocationTable::new(["Beijing".to_string()], 1));
        let mut logs = HashMap::new();
        let loc = RvLocation { region: 0, partition: 0 };
        let log = Arc::new(NodeEventLog::new(loc, 10_000));
        for i in 0..5 {
            log.append(
                NodeEventType::Added,
                LogicalNode::new(format!("n{i}"), GeoInfo { region: 0, resource_partition: 0 }, json!({})),
            );
        }
        logs.insert(loc, log);
        let logs = Arc::new(logs);
        let registry = ClientRegistry::new(locations, logs.clone(), Arc::new(MemoryStore::new()));
        let (client_id, _alloc) = registry
            .register(RegisterRequest {
                friendly_name: "watcher".to_string(),
                regions: vec!["Beijing".to_string()],
                requested_quota: 5,
            })
            .await
            .unwrap();
        (Distributor::new(logs, registry), client_id)
    }

    #[tokio::test]
    async fn list_returns_only_allocated_nodes() {
        let (dist, client_id) = setup().await;
        let (nodes, crv) = dist.list(&client_id).await.unwrap();
        assert_eq!(nodes.len(), 5);
        assert_eq!(crv.at(&RvLocation { region: 0, partition: 0 }), 5);
    }

    #[tokio::test]
    async fn watch_delivers_subsequent_events() {
        let (dist, client_id) = setup().await;
        let (_, crv) = dist.list(&client_id).await.unwrap();

        let log = dist.logs.get(&RvLocation { region: 0, partition: 0 }).unwrap().clone();
        log.append(
            NodeEventType::Modified,
            LogicalNode::new("n0".to_string(), GeoInfo { region: 0, resource_partition: 0 }, json!({"x": 1})),
        );

        let mut rx = dist.watch(&client_id, crv).await.unwrap();
        let event = rx.recv().await.unwrap().unwrap();
        assert_eq!(event.node.id, "n0");
        assert_eq!(event.event_type, NodeEventType::Modified);
    }

    #[tokio::test]
    async fn watch_ignores_events_outside_allocation() {
        let (dist, client_id) = setup().await;
        let (_, crv) = dist.list(&client_id).await.unwrap();

        let log = dist.logs.get(&RvLocation { region: 0, partition: 0 }).unwrap().clone();
        log.append(
            NodeEventType::Added,
            LogicalNode::new("outsider".to_string(), GeoInfo { region: 0, resource_partition: 0 }, json!({})),
        );
        log.append(
            NodeEventType::Modified,
            LogicalNode::new("n1".to_string(), GeoInfo { region: 0, resource_partition: 0 }, json!({})),
        );

        let mut rx = dist.watch(&client_id, crv).await.unwrap();
        let event = rx.recv().await.unwrap().unwrap();
        assert_eq!(event.node.id, "n1");
    }

    #[tokio::test]
    async fn list_reports_last_delivered_crv_not_live_head() {
        let (dist, client_id) = setup().await;
        let loc = RvLocation { region: 0, partition: 0 };

        // First List: nothing delivered yet, so the CRV is PerPartitionBase
        // (the allocation cut point), independent of what the log does next.
        let (_, first_crv) = dist.list(&client_id).await.unwrap();
        assert_eq!(first_crv.at(&loc), 5);

        let log = dist.logs.get(&loc).unwrap().clone();
        log.append(
            NodeEventType::Modified,
            LogicalNode::new("n0".to_string(), GeoInfo { region: 0, resource_partition: 0 }, json!({})),
        );
        log.append(
            NodeEventType::Modified,
            LogicalNode::new("n1".to_string(), GeoInfo { region: 0, resource_partition: 0 }, json!({})),
        );

        // Log head has moved to 7, but nothing has been delivered through a
        // Watch yet, so List must still report the original cursor.
        let (_, still_base_crv) = dist.list(&client_id).await.unwrap();
        assert_eq!(still_base_crv.at(&loc), 5);

        let mut rx = dist.watch(&client_id, first_crv).await.unwrap();
        let _ = rx.recv().await.unwrap().unwrap(); // delivers rv 6

        // Give the pump a moment to record the delivered cursor.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (_, advanced_crv) = dist.list(&client_id).await.unwrap();
        assert_eq!(advanced_crv.at(&loc), 6, "should reflect only what was actually delivered");
    }
}
