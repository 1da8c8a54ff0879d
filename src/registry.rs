//! ClientRegistry: registration and the fixed node Allocation it carves out
//! of the current snapshot at registration time (spec §4.5).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::errors::CoreError;
use crate::event_log::NodeEventLog;
use crate::location::LocationTable;
use crate::metrics::CLIENTS_REGISTERED;
use crate::store::PersistentStore;
use crate::types::{client_store_key, Allocation, Client, RvLocation};

pub struct RegisterRequest {
    pub friendly_name: String,
    /// Ordered region preference list, most-preferred first (spec §4.5). The
    /// first entry is the client's home region.
    pub regions: Vec<String>,
    pub requested_quota: usize,
}

/// Serializes registration end to end: a single mutex guards both quota
/// accounting and allocation cutting, so two concurrent registrations never
/// observe the same snapshot and double-allocate. Registration order also
/// doubles as the tie-break for "earliest registered wins" (spec §4.5); with
/// a single critical section, genuine ties are unobservable.
pub struct ClientRegistry {
    locations: Arc<LocationTable>,
    logs: Arc<HashMap<RvLocation, Arc<NodeEventLog>>>,
    store: Arc<dyn PersistentStore>,
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    clients: HashMap<String, Client>,
    allocations: HashMap<String, Arc<Allocation>>,
}

impl ClientRegistry {
    pub fn new(
        locations: Arc<LocationTable>,
        logs: Arc<HashMap<RvLocation, Arc<NodeEventLog>>>,
        store: Arc<dyn PersistentStore>,
    ) -> Arc<Self> {
        Arc::new(ClientRegistry {
            locations,
            logs,
            store,
            state: Mutex::new(RegistryState::default()),
        })
    }

    /// Mints a fresh client id and walks the ordered region preference list
    /// (spec §4.5), drawing whole regions — every RP, every node currently
    /// visible in each — until the accumulated node count meets
    /// `requested_quota`. A region is never partially drawn: once one RP of a
    /// region is included, every RP of that region is, even if that pushes
    /// the total past quota. `requested_quota` is therefore a floor the
    /// registration tries to clear, not a ceiling on what's returned (a
    /// single region can easily hold far more nodes than a client asked for).
    pub async fn register(self: &Arc<Self>, req: RegisterRequest) -> Result<(String, Arc<Allocation>), CoreError> {
        if req.requested_quota == 0 {
            return Err(CoreError::BadRequest("requested_quota must be > 0".to_string()));
        }
        if req.regions.is_empty() {
            return Err(CoreError::BadRequest("at least one region is required".to_string()));
        }
        let mut region_ids = Vec::with_capacity(req.regions.len());
        for name in &req.regions {
            let id = self.locations.region_id_of(name)?;
            if !region_ids.contains(&id) {
                region_ids.push(id);
            }
        }

        let mut state = self.state.lock().await;

        let client_id = Uuid::new_v4().to_string();
        let mut node_ids = HashSet::new();
        let mut per_partition_base = HashMap::new();
        let mut drawn_regions = Vec::new();

        for &region_id in &region_ids {
            if node_ids.len() >= req.requested_quota {
                break;
            }
            drawn_regions.push(region_id);
            for rp in 0..self.locations.rp_count() as u32 {
                let loc = RvLocation { region: region_id, partition: rp };
                let Some(log) = self.logs.get(&loc) else { continue };
                per_partition_base.insert(loc, log.head_rv());
                for node in log.snapshot_latest() {
                    node_ids.insert(node.id);
                }
            }
        }

        let allocation = Arc::new(Allocation {
            client_id: client_id.clone(),
            quota: req.requested_quota,
            regions: drawn_regions,
            node_ids,
            per_partition_base,
        });

        let client = Client {
            id: client_id.clone(),
            friendly_name: req.friendly_name,
            region: req.regions[0].clone(),
            requested_quota: req.requested_quota,
            regions: req.regions.clone(),
            created_at_unix_millis: crate::types::now_millis(),
        };

        state.clients.insert(client_id.clone(), client.clone());
        state.allocations.insert(client_id.clone(), allocation.clone());
        drop(state);

        let key = client_store_key(&client_id);
        if let Err(e) = self.store.put_client(&key, &client).await {
            tracing::warn!(error = %e, client_id, "best-effort client persistence failed");
        }
        CLIENTS_REGISTERED.inc();

        info!(
            client_id,
            home_region = %req.regions[0],
            quota = req.requested_quota,
            regions_drawn = allocation.regions.len(),
            allocated = allocation.node_ids.len(),
            "client registered"
        );
        Ok((client_id, allocation))
    }

    pub async fn allocation_for(&self, client_id: &str) -> Result<Arc<Allocation>, CoreError> {
        self.state
            .lock()
            .await
            .allocations
            .get(client_id)
            .cloned()
            .ok_or_else(|| CoreError::UnknownClient(client_id.to_string()))
    }

    /// Matches the original's unimplemented `UpdateClient` RPC: reallocating
    /// quota mid-lifetime is out of scope for this core (spec §9 Open
    /// Questions).
    pub async fn update_client(&self, _client_id: &str) -> Result<(), CoreError> {
        Err(CoreError::NotImplemented("UpdateClient"))
    }

    pub async fn get_clients(&self) -> Result<Vec<Client>, CoreError> {
        Err(CoreError::NotImplemented("GetClients"))
    }
}
