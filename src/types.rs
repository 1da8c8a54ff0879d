//! Core data model (spec §3): LogicalNode, NodeEvent, RvLocation, the
//! composite resource version, Allocation, Client, and the two opaque
//! durability blobs the Aggregator periodically snapshots.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Fixed persistence keys for the two process-wide durability blobs.
///
/// The original Go source dereferences an uninitialized pointer to call
/// `GetKey()` for these two types — a bug. We define the keys explicitly
/// instead, per the Open Question in spec.md §9.
pub const NODE_STORE_STATUS_KEY: &str = "NodeStoreStatus";
pub const VIRTUAL_NODE_ASSIGNMENT_KEY: &str = "VirtualNodeAssignment";
pub const NODE_KEY_PREFIX: &str = "MinNode";

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// `{Region: int, ResourcePartition: int}` addressing info carried on every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeoInfo {
    pub region: u32,
    pub resource_partition: u32,
}

/// A compute node as seen by the service. `(region, resource_partition)` never
/// changes for a given id; `resource_version` is strictly monotonic per node
/// within its RP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalNode {
    pub id: String,
    #[serde(with = "rv_as_decimal_string")]
    pub resource_version: u64,
    pub last_updated_unix_millis: i64,
    pub geo_info: GeoInfo,
    /// Capacity labels, taints, etc. — not interpreted by the core, preserved
    /// verbatim on encode/decode.
    pub payload: serde_json::Value,
}

impl LogicalNode {
    pub fn new(id: String, geo_info: GeoInfo, payload: serde_json::Value) -> Self {
        LogicalNode {
            id,
            resource_version: 0,
            last_updated_unix_millis: now_millis(),
            geo_info,
            payload,
        }
    }

    pub fn location(&self) -> RvLocation {
        RvLocation {
            region: self.geo_info.region,
            partition: self.geo_info.resource_partition,
        }
    }
}

/// Persistence key for a node: `MinNode.<region>.<rp>.<id>` (spec §6).
/// Region/RP are rendered via the LocationTable's names, not raw integer ids,
/// matching the original key layout.
pub fn node_store_key(region_name: &str, rp_name: &str, id: &str) -> String {
    format!("{NODE_KEY_PREFIX}.{region_name}.{rp_name}.{id}")
}

/// Prefix matching every node key persisted for a region, across all of its
/// resource partitions. Used by `PersistentStore::scan_nodes` on cold start.
pub fn node_store_prefix(region_name: &str) -> String {
    format!("{NODE_KEY_PREFIX}.{region_name}.")
}

/// Persistence key for a client record: `Client.<client_id>`. The original Go
/// source reused its node key layout for this (with a throwaway RP name);
/// client records aren't scoped to a region or RP, so they get their own key.
pub fn client_store_key(client_id: &str) -> String {
    format!("Client.{client_id}")
}

/// RV values are transmitted as decimal strings to avoid integer-size
/// ambiguity across languages (spec §6), even though we keep them as u64
/// internally for arithmetic.
mod rv_as_decimal_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEventType {
    Added,
    Modified,
    Deleted,
}

/// `{Type, Node}`. `Added` for a given node id must precede any
/// `Modified`/`Deleted` for the same id in the same log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub event_type: NodeEventType,
    pub node: LogicalNode,
}

/// The key type of a CRV map. Ordering is irrelevant; keys are unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RvLocation {
    pub region: u32,
    pub partition: u32,
}

/// Composite Resource Version: "I have observed all events with RV <= value
/// in that partition." A missing key means "I have seen nothing from that
/// partition." Encoded on the wire as an array of `{region, partition, rv}`
/// triples (spec §6), hence the manual Serialize/Deserialize below rather
/// than deriving one over the inner map directly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Crv(BTreeMap<RvLocation, u64>);

#[derive(Serialize, Deserialize)]
struct CrvEntryDto {
    region: u32,
    partition: u32,
    rv: u64,
}

impl Serialize for Crv {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let entries: Vec<CrvEntryDto> = self
            .0
            .iter()
            .map(|(loc, rv)| CrvEntryDto {
                region: loc.region,
                partition: loc.partition,
                rv: *rv,
            })
            .collect();
        entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Crv {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<CrvEntryDto>::deserialize(deserializer)?;
        let mut map = BTreeMap::new();
        for entry in entries {
            map.insert(
                RvLocation {
                    region: entry.region,
                    partition: entry.partition,
                },
                entry.rv,
            );
        }
        Ok(Crv(map))
    }
}

impl Crv {
    pub fn new() -> Self {
        Crv(BTreeMap::new())
    }

    pub fn get(&self, loc: &RvLocation) -> Option<u64> {
        self.0.get(loc).copied()
    }

    pub fn at(&self, loc: &RvLocation) -> u64 {
        self.get(loc).unwrap_or(0)
    }

    pub fn insert(&mut self, loc: RvLocation, rv: u64) {
        self.0.insert(loc, rv);
    }

    pub fn keys(&self) -> impl Iterator<Item = &RvLocation> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RvLocation, &u64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(RvLocation, u64)> for Crv {
    fn from_iter<T: IntoIterator<Item = (RvLocation, u64)>>(iter: T) -> Self {
        Crv(iter.into_iter().collect())
    }
}

/// The fixed set of node ids assigned to one client at registration.
/// `PerPartitionBase` records the RV at which the allocation was cut, so the
/// initial list is internally consistent. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub client_id: String,
    pub quota: usize,
    pub regions: Vec<u32>,
    pub node_ids: HashSet<String>,
    pub per_partition_base: HashMap<RvLocation, u64>,
}

impl Allocation {
    pub fn touched_locations(&self) -> impl Iterator<Item = &RvLocation> {
        self.per_partition_base.keys()
    }
}

/// Persistent client record. Created by Register; never mutated after
/// creation in this core (update is a non-goal, see `UpdateClient`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub friendly_name: String,
    pub region: String,
    pub requested_quota: usize,
    pub regions: Vec<String>,
    pub created_at_unix_millis: i64,
}

/// Global view of region membership plus last-seen CRV. An opaque,
/// periodically persisted snapshot of Aggregator state, not consulted on
/// the request hot path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStoreStatus {
    pub regions: Vec<String>,
    pub last_seen_crv: Crv,
}

/// Maps virtual-node buckets (a consistent-hash style sharding of logical
/// nodes) to owner shards. Opaque, periodically persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualNodeAssignment {
    pub bucket_owners: HashMap<u32, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crv_round_trips_through_json() {
        let mut crv = Crv::new();
        crv.insert(RvLocation { region: 0, partition: 1 }, 42);
        crv.insert(RvLocation { region: 2, partition: 0 }, 7);

        let encoded = serde_json::to_string(&crv).unwrap();
        let decoded: Crv = serde_json::from_str(&encoded).unwrap();

        assert_eq!(crv, decoded);
        assert_eq!(decoded.at(&RvLocation { region: 0, partition: 1 }), 42);
        assert_eq!(decoded.at(&RvLocation { region: 9, partition: 9 }), 0);
    }

    #[test]
    fn resource_version_encodes_as_decimal_string() {
        let node = LogicalNode::new(
            "beijing.rp-0.1".to_string(),
            GeoInfo { region: 0, resource_partition: 0 },
            serde_json::json!({"cpu": 4}),
        );
        let encoded = serde_json::to_value(&node).unwrap();
        assert!(encoded["resource_version"].is_string());
    }
}
