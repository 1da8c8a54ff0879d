//! Long-lived pull loop merging RegionSimulator (or real RRM) events into
//! the service's own per-(region, RP) logs (spec §4.4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::errors::CoreError;
use crate::event_log::NodeEventLog;
use crate::location::LocationTable;
use crate::metrics::{PULL_DURATION_SECONDS, PULL_ERRORS_TOTAL};
use crate::simulator::EventSource;
use crate::store::PersistentStore;
use crate::types::{node_store_key, node_store_prefix, Crv, LogicalNode, NodeStoreStatus, RvLocation};

/// Default `maxPullUpdateEventsSize` (spec §4.4).
pub const DEFAULT_MAX_PULL_BATCH: usize = 10_000;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const PERSIST_EVERY_N_PULLS: u32 = 50;
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct Aggregator {
    pub logs: Arc<HashMap<RvLocation, Arc<NodeEventLog>>>,
    store: Arc<dyn PersistentStore>,
    max_pull_batch: usize,
}

impl Aggregator {
    pub fn new(
        logs: Arc<HashMap<RvLocation, Arc<NodeEventLog>>>,
        store: Arc<dyn PersistentStore>,
        max_pull_batch: usize,
    ) -> Arc<Self> {
        Arc::new(Aggregator { logs, store, max_pull_batch })
    }

    /// Spawns the pull loop for one source region. Runs until the process
    /// exits; source errors are retried with capped exponential backoff.
    pub fn spawn_source(self: &Arc<Self>, source: Arc<dyn EventSource>) {
        let agg = self.clone();
        tokio::spawn(async move {
            agg.run_source(source).await;
        });
    }

    async fn run_source(self: Arc<Self>, source: Arc<dyn EventSource>) {
        let mut crv = Crv::new();
        let mut backoff = INITIAL_BACKOFF;
        let mut pulls_since_persist = 0u32;

        loop {
            let started = std::time::Instant::now();
            let result = source.pull_events(&crv, self.max_pull_batch).await;
            PULL_DURATION_SECONDS
                .with_label_values(&[source.region_name()])
                .observe(started.elapsed().as_secs_f64());

            match result {
                Ok((events, new_crv, has_more)) => {
                    for (loc, event) in events {
                        if let Some(log) = self.logs.get(&loc) {
                            log.append(event.event_type, event.node.clone());
                        } else {
                            warn!(?loc, "aggregator has no local log for source location");
                        }
                    }
                    crv = new_crv;
                    backoff = INITIAL_BACKOFF;
                    pulls_since_persist += 1;
                    if pulls_since_persist >= PERSIST_EVERY_N_PULLS {
                        self.persist_status(&source, &crv).await;
                        self.persist_nodes(&source).await;
                        pulls_since_persist = 0;
                    }
                    if !has_more {
                        tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                    }
                }
                Err(CoreError::TooOld { location }) => {
                    PULL_ERRORS_TOTAL.with_label_values(&[source.region_name(), "too_old"]).inc();
                    warn!(?location, region = source.region_name(), "source too old, re-listing");
                    match source.list_initial().await {
                        Ok((nodes, new_crv)) => {
                            self.relist_region(&source, nodes);
                            crv = new_crv;
                        }
                        Err(e) => {
                            PULL_ERRORS_TOTAL.with_label_values(&[source.region_name(), "relist_failed"]).inc();
                            warn!(error = %e, "re-list failed, backing off");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                    }
                }
                Err(e) => {
                    PULL_ERRORS_TOTAL.with_label_values(&[source.region_name(), "pull_failed"]).inc();
                    warn!(error = %e, region = source.region_name(), ?backoff, "pull failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    fn relist_region(&self, source: &Arc<dyn EventSource>, nodes: Vec<crate::types::LogicalNode>) {
        let mut by_rp: HashMap<u32, Vec<crate::types::LogicalNode>> = HashMap::new();
        for node in nodes {
            by_rp.entry(node.geo_info.resource_partition).or_default().push(node);
        }
        for rp in 0..source.rp_count() as u32 {
            let loc = RvLocation { region: source.region_id(), partition: rp };
            if let Some(log) = self.logs.get(&loc) {
                log.reset_with(by_rp.remove(&rp).unwrap_or_default());
            }
        }
        info!(region = source.region_name(), "region state replaced from re-list");
    }

    async fn persist_status(&self, source: &Arc<dyn EventSource>, crv: &Crv) {
        let status = NodeStoreStatus {
            regions: vec![source.region_name().to_string()],
            last_seen_crv: crv.clone(),
        };
        if let Err(e) = self.store.put_node_store_status(&status).await {
            warn!(error = %e, "failed to persist node store status (best-effort, non-fatal)");
        }
    }

    /// Snapshots every log's current latest-known nodes for `source`'s
    /// region into the store, best-effort, so a restarted process can
    /// recover them via `restore_region` instead of starting cold.
    async fn persist_nodes(&self, source: &Arc<dyn EventSource>) {
        for rp in 0..source.rp_count() as u32 {
            let loc = RvLocation { region: source.region_id(), partition: rp };
            let Some(log) = self.logs.get(&loc) else { continue };
            let rp_name = format!("rp-{rp}");
            let entries: Vec<(String, LogicalNode)> = log
                .snapshot_latest()
                .into_iter()
                .map(|node| (node_store_key(source.region_name(), &rp_name, &node.id), node))
                .collect();
            if entries.is_empty() {
                continue;
            }
            if let Err(e) = self.store.put_nodes(&entries).await {
                warn!(error = %e, region = source.region_name(), "failed to persist node snapshot (best-effort, non-fatal)");
            }
        }
    }

    /// Restores a region's logs from whatever was last persisted for it,
    /// so a restarted process doesn't serve an empty allocation to clients
    /// until the next full pull cycle completes. Best-effort: a store error
    /// just means the region starts cold, same as before this existed.
    pub async fn restore_region(&self, locations: &LocationTable, region_id: u32, region_name: &str) {
        let prefix = node_store_prefix(region_name);
        let mut by_rp: HashMap<u32, Vec<LogicalNode>> = HashMap::new();
        let mut cursor = None;
        loop {
            match self.store.scan_nodes(&prefix, cursor.take(), 1000).await {
                Ok((nodes, next_cursor)) => {
                    let done = next_cursor.is_none();
                    for node in nodes {
                        by_rp.entry(node.geo_info.resource_partition).or_default().push(node);
                    }
                    if done {
                        break;
                    }
                    cursor = next_cursor;
                }
                Err(e) => {
                    warn!(error = %e, region_name, "failed to restore nodes from persistent store, starting cold");
                    return;
                }
            }
        }
        if by_rp.is_empty() {
            return;
        }
        let mut restored = 0usize;
        for rp in 0..locations.rp_count() as u32 {
            let loc = RvLocation { region: region_id, partition: rp };
            if let (Some(log), Some(nodes)) = (self.logs.get(&loc), by_rp.remove(&rp)) {
                restored += nodes.len();
                log.reset_with(nodes);
            }
        }
        info!(region_name, restored, "restored nodes from persistent store on cold start");
    }
}
