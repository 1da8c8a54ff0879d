//! Durable key-value persistence (spec §4.7). The service never blocks a
//! hot-path request on this; it is used for periodic snapshots and for
//! best-effort client registration records.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::errors::CoreError;
use crate::types::{
    client_store_key, Client, LogicalNode, NodeStoreStatus, VirtualNodeAssignment, NODE_STORE_STATUS_KEY,
    VIRTUAL_NODE_ASSIGNMENT_KEY,
};

#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), CoreError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError>;
    async fn delete(&self, key: &str) -> Result<(), CoreError>;

    /// Cursor-based scan over every key starting with `prefix`, in key order.
    /// `cursor` is the last key a previous call returned; `None` starts from
    /// the beginning. Mirrors the original store's `BatchLogicalNodesInquiry`
    /// chunked-scan shape rather than returning an entire region at once.
    async fn scan(
        &self,
        prefix: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<(Vec<(String, Vec<u8>)>, Option<String>), CoreError>;

    async fn put_node_store_status(&self, status: &NodeStoreStatus) -> Result<(), CoreError> {
        put_json(self, NODE_STORE_STATUS_KEY, status).await
    }

    async fn get_node_store_status(&self) -> Result<Option<NodeStoreStatus>, CoreError> {
        get_json(self, NODE_STORE_STATUS_KEY).await
    }

    async fn put_virtual_node_assignment(&self, assignment: &VirtualNodeAssignment) -> Result<(), CoreError> {
        put_json(self, VIRTUAL_NODE_ASSIGNMENT_KEY, assignment).await
    }

    async fn get_virtual_node_assignment(&self) -> Result<Option<VirtualNodeAssignment>, CoreError> {
        get_json(self, VIRTUAL_NODE_ASSIGNMENT_KEY).await
    }

    async fn put_client(&self, key: &str, client: &Client) -> Result<(), CoreError> {
        put_json(self, key, client).await
    }

    async fn get_client(&self, client_id: &str) -> Result<Option<Client>, CoreError> {
        get_json(self, &client_store_key(client_id)).await
    }

    async fn put_node(&self, key: &str, node: &LogicalNode) -> Result<(), CoreError> {
        put_json(self, key, node).await
    }

    async fn get_node(&self, key: &str) -> Result<Option<LogicalNode>, CoreError> {
        get_json(self, key).await
    }

    /// Persists a batch of nodes in one call. The original batches these
    /// into a single pipelined write; here each key still goes through
    /// `put_node`, but callers get one fallible call instead of N.
    async fn put_nodes(&self, nodes: &[(String, LogicalNode)]) -> Result<(), CoreError> {
        for (key, node) in nodes {
            self.put_node(key, node).await?;
        }
        Ok(())
    }

    /// Cursor-scans every node key under `prefix`, decoding each value.
    async fn scan_nodes(
        &self,
        prefix: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<(Vec<LogicalNode>, Option<String>), CoreError> {
        let (entries, next_cursor) = self.scan(prefix, cursor, limit).await?;
        let nodes = entries
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(|e| CoreError::Internal(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((nodes, next_cursor))
    }
}

async fn put_json<S: PersistentStore + ?Sized, T: Serialize + Sync>(
    store: &S,
    key: &str,
    value: &T,
) -> Result<(), CoreError> {
    let bytes = serde_json::to_vec(value).map_err(|e| CoreError::Internal(e.to_string()))?;
    store.put(key, &bytes).await
}

async fn get_json<S: PersistentStore + ?Sized, T: DeserializeOwned>(
    store: &S,
    key: &str,
) -> Result<Option<T>, CoreError> {
    match store.get(key).await? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| CoreError::Internal(e.to_string()))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// In-process store used for local runs and tests. A real deployment would
/// back this with etcd/Redis/whatever `--store_backend` names; nothing in
/// this core depends on which one.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), CoreError> {
        self.data.lock().unwrap().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    async fn scan(
        &self,
        prefix: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<(Vec<(String, Vec<u8>)>, Option<String>), CoreError> {
        let data = self.data.lock().unwrap();
        let mut keys: Vec<&String> = data.keys().filter(|k| k.starts_with(prefix)).collect();
        keys.sort();

        let start = match &cursor {
            Some(c) => keys.partition_point(|k| *k <= c),
            None => 0,
        };
        let page: Vec<(String, Vec<u8>)> = keys[start..]
            .iter()
            .take(limit)
            .map(|k| ((*k).clone(), data[*k].clone()))
            .collect();
        let next_cursor = if start + page.len() < keys.len() {
            page.last().map(|(k, _)| k.clone())
        } else {
            None
        };
        Ok((page, next_cursor))
    }
}

/// Wraps a store so a write failure only ever produces a warning, never an
/// error the caller has to handle. Used for the periodic snapshots the
/// Aggregator takes, where durability is best-effort by design (spec §4.4).
pub async fn best_effort_put_node_store_status(store: &dyn PersistentStore, status: &NodeStoreStatus) {
    if let Err(e) = store.put_node_store_status(status).await {
        warn!(error = %e, "node store status snapshot failed");
    }
}
