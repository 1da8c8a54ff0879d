//! Per-(region, RP) append-only event ring (spec §4.2).
//!
//! Writers are serialized per log (the lock is held only for the in-memory
//! mutation, never across an await). Readers snapshot `(tail_rv, head_rv)`
//! before iterating so a concurrent append never exposes a torn entry.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use tokio::sync::Notify;
use tracing::trace;

use crate::errors::CoreError;
use crate::metrics::{EVENTS_APPENDED_TOTAL, LOG_HEAD_RV};
use crate::types::{LogicalNode, NodeEvent, NodeEventType, RvLocation};

fn event_type_label(event_type: NodeEventType) -> &'static str {
    match event_type {
        NodeEventType::Added => "added",
        NodeEventType::Modified => "modified",
        NodeEventType::Deleted => "deleted",
    }
}

struct LogInner {
    events: VecDeque<Arc<NodeEvent>>,
    /// RV of the entry just before the oldest retained one (the compaction
    /// horizon). 0 means nothing has been compacted yet.
    tail_rv: u64,
    head_rv: u64,
    /// Materialized latest-known state per node id, used to serve List and
    /// single-node queries without replaying the whole log.
    latest: HashMap<String, LogicalNode>,
    /// Insertion-ordered ids, used by the simulator to pick a node at random
    /// without re-deriving order from a HashMap.
    ids: Vec<String>,
}

pub struct NodeEventLog {
    location: RvLocation,
    capacity: usize,
    inner: RwLock<LogInner>,
    notify: Notify,
}

impl NodeEventLog {
    pub fn new(location: RvLocation, capacity: usize) -> Self {
        NodeEventLog {
            location,
            capacity,
            inner: RwLock::new(LogInner {
                events: VecDeque::with_capacity(capacity.min(1024)),
                tail_rv: 0,
                head_rv: 0,
                latest: HashMap::new(),
                ids: Vec::new(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn location(&self) -> RvLocation {
        self.location
    }

    /// Assigns the next RV, stamps `node.resource_version`, and stores the
    /// event. Returns the assigned RV.
    pub fn append(&self, event_type: NodeEventType, mut node: LogicalNode) -> u64 {
        let mut inner = self.inner.write().unwrap();
        let rv = inner.head_rv + 1;
        node.resource_version = rv;

        if event_type == NodeEventType::Added {
            inner.ids.push(node.id.clone());
        }
        inner.latest.insert(node.id.clone(), node.clone());

        if inner.events.len() == self.capacity {
            inner.events.pop_front();
            inner.tail_rv += 1;
        }
        inner.events.push_back(Arc::new(NodeEvent { event_type, node }));
        inner.head_rv = rv;
        drop(inner);

        trace!(region = self.location.region, partition = self.location.partition, rv, "appended event");

        let region = self.location.region.to_string();
        let partition = self.location.partition.to_string();
        EVENTS_APPENDED_TOTAL
            .with_label_values(&[&region, &partition, event_type_label(event_type)])
            .inc();
        LOG_HEAD_RV.with_label_values(&[&region, &partition]).set(rv as f64);

        self.notify.notify_waiters();
        rv
    }

    /// Returns up to `limit` events with RV > `after_rv`, in RV order, plus
    /// the RV to resume from and whether more events remain beyond it.
    pub fn range_since(
        &self,
        after_rv: u64,
        limit: usize,
    ) -> Result<(Vec<Arc<NodeEvent>>, u64, bool), CoreError> {
        let inner = self.inner.read().unwrap();
        if after_rv < inner.tail_rv {
            return Err(CoreError::TooOld { location: self.location });
        }
        let start = (after_rv - inner.tail_rv) as usize;
        let total = inner.events.len();
        if start > total {
            return Err(CoreError::Internal(format!(
                "requested rv {after_rv} is ahead of log head {}",
                inner.head_rv
            )));
        }
        let take = (total - start).min(limit);
        let events: Vec<_> = inner.events.iter().skip(start).take(take).cloned().collect();
        let next_rv = after_rv + take as u64;
        let has_more = start + take < total;
        Ok((events, next_rv, has_more))
    }

    pub fn head_rv(&self) -> u64 {
        self.inner.read().unwrap().head_rv
    }

    pub fn tail_rv(&self) -> u64 {
        self.inner.read().unwrap().tail_rv
    }

    pub fn latest_node(&self, id: &str) -> Option<LogicalNode> {
        self.inner.read().unwrap().latest.get(id).cloned()
    }

    pub fn snapshot_latest(&self) -> Vec<LogicalNode> {
        self.inner.read().unwrap().latest.values().cloned().collect()
    }

    pub fn random_id(&self) -> Option<String> {
        use rand::seq::SliceRandom;
        let inner = self.inner.read().unwrap();
        inner.ids.choose(&mut rand::thread_rng()).cloned()
    }

    /// Waits for the next append. Used by watch pumps instead of busy-polling.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Replaces the authoritative state with a freshly re-listed node set,
    /// advancing RVs, as the Aggregator does after an `ErrTooOld` from its
    /// source (spec §4.4).
    pub fn reset_with(&self, nodes: Vec<LogicalNode>) {
        let mut inner = self.inner.write().unwrap();
        inner.events.clear();
        inner.latest.clear();
        inner.ids.clear();
        inner.tail_rv = inner.head_rv;
        drop(inner);
        for node in nodes {
            self.append(NodeEventType::Added, node);
        }
    }
}
