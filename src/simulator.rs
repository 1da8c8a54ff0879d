//! RegionSimulator: synthetic initial node set plus the Outage/Daily update
//! patterns, and the bounded, resumable pull API RRMs expose (spec §4.3).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tokio::time::interval;
use tracing::{info, warn};

use crate::errors::CoreError;
use crate::event_log::NodeEventLog;
use crate::types::{Crv, GeoInfo, LogicalNode, NodeEvent, NodeEventType, RvLocation};

/// 10 Modified events per RP every minute, indefinitely.
pub const DAILY_EVENTS_PER_TICK: usize = 10;

#[derive(Debug, Clone)]
pub enum DataPattern {
    /// Every minute, bump `DAILY_EVENTS_PER_TICK` random nodes per RP.
    Daily { tick: Duration },
    /// After `wait`, mark every node in `rp_down_number` RPs "down", then stop.
    Outage { wait: Duration, rp_down_number: usize },
}

/// Replayed by the Aggregator (or a real client) against a RegionSimulator
/// or an equivalent remote RRM.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn pull_events(
        &self,
        crv: &Crv,
        max_batch: usize,
    ) -> Result<(Vec<(RvLocation, Arc<NodeEvent>)>, Crv, bool), CoreError>;

    async fn list_initial(&self) -> Result<(Vec<LogicalNode>, Crv), CoreError>;

    fn region_id(&self) -> u32;
    fn region_name(&self) -> &str;
    fn rp_count(&self) -> usize;
}

pub struct RegionSimulator {
    region_id: u32,
    region_name: String,
    logs: Vec<Arc<NodeEventLog>>,
}

impl RegionSimulator {
    /// Generates `nodes_per_rp` `Added` events per RP with synthesized ids
    /// `"<region>.<rp>.<seq>"` and seeded pseudo-random attributes.
    pub fn new(
        region_id: u32,
        region_name: String,
        rp_count: usize,
        nodes_per_rp: usize,
        log_capacity: usize,
    ) -> Arc<Self> {
        let logs: Vec<_> = (0..rp_count)
            .map(|rp| {
                Arc::new(NodeEventLog::new(
                    RvLocation { region: region_id, partition: rp as u32 },
                    log_capacity,
                ))
            })
            .collect();

        let mut rng = rand::thread_rng();
        for (rp, log) in logs.iter().enumerate() {
            for seq in 0..nodes_per_rp {
                let id = format!("{region_name}.rp-{rp}.{seq}");
                let payload = json!({
                    "cpu_cores": rng.gen_range(2..=128),
                    "memory_gb": rng.gen_range(4..=512),
                    "taints": [],
                });
                let node = LogicalNode::new(
                    id,
                    GeoInfo { region: region_id, resource_partition: rp as u32 },
                    payload,
                );
                log.append(NodeEventType::Added, node);
            }
        }

        info!(region = %region_name, rp_count, nodes_per_rp, "region simulator initialized");
        Arc::new(RegionSimulator { region_id, region_name, logs })
    }

    pub fn log(&self, rp: usize) -> Option<&Arc<NodeEventLog>> {
        self.logs.get(rp)
    }

    /// Bumps `count` randomly selected nodes in `rp`, advancing their RV and
    /// `LastUpdatedTime` (the Daily pattern's per-minute, per-RP update).
    pub fn bump_random_nodes(&self, rp: usize, count: usize) {
        let Some(log) = self.logs.get(rp) else { return };
        for _ in 0..count {
            let Some(id) = log.random_id() else { continue };
            let Some(mut node) = log.latest_node(&id) else { continue };
            node.last_updated_unix_millis = crate::types::now_millis();
            log.append(NodeEventType::Modified, node);
        }
    }

    /// Marks every node in `rp` "down" and stops emitting further events for
    /// it (the Outage pattern). This is a Modified event, not a deletion.
    pub fn mark_rp_down(&self, rp: usize) {
        let Some(log) = self.logs.get(rp) else { return };
        let nodes = log.snapshot_latest();
        let count = nodes.len();
        for mut node in nodes {
            if let Some(obj) = node.payload.as_object_mut() {
                obj.insert("status".to_string(), json!("down"));
            }
            node.last_updated_unix_millis = crate::types::now_millis();
            log.append(NodeEventType::Modified, node);
        }
        warn!(region = %self.region_name, rp, nodes_marked_down = count, "resource partition marked down");
    }

    /// Spawns the background task driving the configured update pattern.
    pub fn spawn_pattern(self: &Arc<Self>, pattern: DataPattern) {
        let sim = self.clone();
        tokio::spawn(async move {
            match pattern {
                DataPattern::Daily { tick } => {
                    let mut ticker = interval(tick);
                    loop {
                        ticker.tick().await;
                        for rp in 0..sim.logs.len() {
                            sim.bump_random_nodes(rp, DAILY_EVENTS_PER_TICK);
                        }
                    }
                }
                DataPattern::Outage { wait, rp_down_number } => {
                    tokio::time::sleep(wait).await;
                    let mut rps: Vec<usize> = (0..sim.logs.len()).collect();
                    use rand::seq::SliceRandom;
                    rps.shuffle(&mut rand::thread_rng());
                    for rp in rps.into_iter().take(rp_down_number) {
                        sim.mark_rp_down(rp);
                    }
                    // Outage is one-shot: the generator stops after emission.
                }
            }
        });
    }
}

#[async_trait]
impl EventSource for RegionSimulator {
    async fn pull_events(
        &self,
        crv: &Crv,
        max_batch: usize,
    ) -> Result<(Vec<(RvLocation, Arc<NodeEvent>)>, Crv, bool), CoreError> {
        // Per-RP pending counts, restricted to RPs that actually have
        // anything beyond the caller's CRV ("active" RPs for fair-share).
        struct Pending {
            rp: usize,
            loc: RvLocation,
            after: u64,
            available: u64,
        }
        let mut pending = Vec::new();
        for (rp, log) in self.logs.iter().enumerate() {
            let loc = RvLocation { region: self.region_id, partition: rp as u32 };
            let after = crv.at(&loc);
            if after < log.tail_rv() {
                return Err(CoreError::TooOld { location: loc });
            }
            let head = log.head_rv();
            if head > after {
                pending.push(Pending { rp, loc, after, available: head - after });
            }
        }

        if pending.is_empty() {
            return Ok((Vec::new(), crv.clone(), false));
        }

        let active = pending.len();
        let base_share = max_batch / active;
        let mut residual = max_batch % active;

        let mut events = Vec::new();
        let mut new_crv = crv.clone();
        let mut has_more = false;

        for p in pending {
            let mut share = base_share;
            if residual > 0 {
                share += 1;
                residual -= 1;
            }
            let take = (share as u64).min(p.available) as usize;
            if take == 0 {
                new_crv.insert(p.loc, p.after);
                if p.available > 0 {
                    has_more = true;
                }
                continue;
            }
            let (batch, next_rv, log_has_more) = self.logs[p.rp].range_since(p.after, take)?;
            for event in batch {
                events.push((p.loc, event));
            }
            new_crv.insert(p.loc, next_rv);
            if log_has_more || (take as u64) < p.available {
                has_more = true;
            }
        }

        Ok((events, new_crv, has_more))
    }

    async fn list_initial(&self) -> Result<(Vec<LogicalNode>, Crv), CoreError> {
        let mut nodes = Vec::new();
        let mut crv = Crv::new();
        for (rp, log) in self.logs.iter().enumerate() {
            nodes.extend(log.snapshot_latest());
            crv.insert(RvLocation { region: self.region_id, partition: rp as u32 }, log.head_rv());
        }
        Ok((nodes, crv))
    }

    fn region_id(&self) -> u32 {
        self.region_id
    }

    fn region_name(&self) -> &str {
        &self.region_name
    }

    fn rp_count(&self) -> usize {
        self.logs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fair_share_gives_each_active_rp_its_floor_share() {
        let sim = RegionSimulator::new(0, "Beijing".to_string(), 10, 5, 1_000_000);
        // Put 100 extra Modified events into every RP.
        for rp in 0..10 {
            sim.bump_random_nodes(rp, 100);
        }
        let crv = Crv::new(); // nothing observed yet: initial Added events are pending too
        let (events, new_crv, has_more) = sim.pull_events(&crv, 1000).await.unwrap();
        // 10 active RPs, budget 1000 => 100 each exactly, matches both initial
        // Added (5) and Modified bursts; assert the floor-share bound holds.
        assert!(!has_more || events.len() == 1000);
        for rp in 0..10 {
            let loc = RvLocation { region: 0, partition: rp };
            assert!(new_crv.at(&loc) >= 100 / 10);
        }
    }

    #[tokio::test]
    async fn bounded_pull_drains_single_hot_rp_in_three_calls() {
        let sim = RegionSimulator::new(0, "Beijing".to_string(), 10, 25_000, 60_000);
        sim.mark_rp_down(3);
        let mut crv = Crv::new();
        for rp in 0..10u32 {
            crv.insert(RvLocation { region: 0, partition: rp }, 25_000);
        }
        let mut total = 0usize;
        let mut calls = 0usize;
        loop {
            let (events, new_crv, has_more) = sim.pull_events(&crv, 10_000).await.unwrap();
            total += events.len();
            crv = new_crv;
            calls += 1;
            if !has_more {
                break;
            }
            assert!(calls <= 5, "should drain well within a handful of calls");
        }
        assert_eq!(total, 25_000);
        assert_eq!(calls, 3);
        assert_eq!(crv.at(&RvLocation { region: 0, partition: 3 }), 50_000);
    }

    #[tokio::test]
    async fn resume_from_stale_crv_returns_only_the_new_events() {
        let sim = RegionSimulator::new(0, "Beijing".to_string(), 10, 50, 10_000);
        sim.bump_random_nodes(0, 10);
        let mut crv = Crv::new();
        crv.insert(RvLocation { region: 0, partition: 0 }, 50);
        for rp in 1..10u32 {
            crv.insert(RvLocation { region: 0, partition: rp }, 50);
        }
        let (events, new_crv, has_more) = sim.pull_events(&crv, 10_000).await.unwrap();
        assert_eq!(events.len(), 10);
        assert_eq!(new_crv.at(&RvLocation { region: 0, partition: 0 }), 60);
        for rp in 1..10u32 {
            assert_eq!(new_crv.at(&RvLocation { region: 0, partition: rp }), 50);
        }
        assert!(!has_more);
    }

    #[tokio::test]
    async fn stale_rv_before_log_head_is_too_old() {
        let sim = RegionSimulator::new(0, "Beijing".to_string(), 1, 10, 5);
        for _ in 0..10 {
            sim.bump_random_nodes(0, 1);
        }
        let mut crv = Crv::new();
        crv.insert(RvLocation { region: 0, partition: 0 }, 0);
        assert!(matches!(
            sim.pull_events(&crv, 100).await,
            Err(CoreError::TooOld { .. })
        ));
    }
}
