//! gRPC surface (spec §6): the client-facing `ResourceService` and the
//! `RegionSimulatorService` a region simulator (or a real RRM) exposes to
//! the Aggregator. `CoreError` is converted to `tonic::Status` only here —
//! the core itself never depends on tonic.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};

use crate::errors::CoreError;
use crate::event_log::NodeEventLog;
use crate::location::LocationTable;
use crate::registry::{ClientRegistry, RegisterRequest};
use crate::distributor::Distributor;
use crate::simulator::{EventSource, RegionSimulator};
use crate::types::{Crv, GeoInfo, LogicalNode, NodeEvent, NodeEventType, RvLocation};

pub mod proto {
    tonic::include_proto!("resource");
}

use proto::region_simulator_service_client::RegionSimulatorServiceClient;
use proto::region_simulator_service_server::{RegionSimulatorService, RegionSimulatorServiceServer};
use proto::resource_service_server::{ResourceService, ResourceServiceServer};
use proto::*;

fn core_error_to_status(e: CoreError) -> Status {
    match e {
        CoreError::BadRequest(m) => Status::invalid_argument(m),
        CoreError::UnknownClient(m) => Status::not_found(m),
        CoreError::UnknownLocation(m) => Status::not_found(m),
        CoreError::TooOld { location } => {
            Status::failed_precondition(format!("{location:?} requires a re-list"))
        }
        CoreError::ClientSlow(m) => Status::resource_exhausted(m),
        CoreError::SourceUnavailable(m) => Status::unavailable(m),
        CoreError::Storage(m) => Status::internal(m),
        CoreError::Internal(m) => Status::internal(m),
        CoreError::NotImplemented(m) => Status::unimplemented(m),
        CoreError::Closed => Status::unavailable("log closed"),
        CoreError::Canceled => Status::cancelled("canceled"),
    }
}

fn node_to_proto(node: &LogicalNode, locations: &LocationTable) -> Result<Node, Status> {
    let region = locations
        .region_name_of(node.geo_info.region)
        .map_err(core_error_to_status)?
        .to_string();
    Ok(Node {
        id: node.id.clone(),
        resource_version: node.resource_version.to_string(),
        last_updated_unix_millis: node.last_updated_unix_millis,
        region,
        resource_partition: node.geo_info.resource_partition as i32,
        payload_json: node.payload.to_string(),
    })
}

fn proto_to_event_type(t: i32) -> NodeEventType {
    match t {
        1 => NodeEventType::Modified,
        2 => NodeEventType::Deleted,
        _ => NodeEventType::Added,
    }
}

fn event_type_to_proto(t: NodeEventType) -> i32 {
    match t {
        NodeEventType::Added => 0,
        NodeEventType::Modified => 1,
        NodeEventType::Deleted => 2,
    }
}

fn crv_to_entries(crv: &Crv, locations: &LocationTable) -> Result<Vec<CrvEntry>, Status> {
    crv.iter()
        .map(|(loc, rv)| {
            let region = locations
                .region_name_of(loc.region)
                .map_err(core_error_to_status)?
                .to_string();
            Ok(CrvEntry { region, partition: loc.partition as i32, rv: *rv })
        })
        .collect()
}

fn entries_to_crv(entries: &[CrvEntry], locations: &LocationTable) -> Result<Crv, Status> {
    let mut crv = Crv::new();
    for entry in entries {
        let region = locations.region_id_of(&entry.region).map_err(core_error_to_status)?;
        crv.insert(RvLocation { region, partition: entry.partition as u32 }, entry.rv);
    }
    Ok(crv)
}

/// Server-side implementation of the client-facing `ResourceService`.
pub struct ResourceServiceImpl {
    locations: Arc<LocationTable>,
    logs: Arc<HashMap<RvLocation, Arc<NodeEventLog>>>,
    registry: Arc<ClientRegistry>,
    distributor: Arc<Distributor>,
}

impl ResourceServiceImpl {
    pub fn new(
        locations: Arc<LocationTable>,
        logs: Arc<HashMap<RvLocation, Arc<NodeEventLog>>>,
        registry: Arc<ClientRegistry>,
        distributor: Arc<Distributor>,
    ) -> ResourceServiceServer<Self> {
        ResourceServiceServer::new(ResourceServiceImpl { locations, logs, registry, distributor })
    }
}

#[tonic::async_trait]
impl ResourceService for ResourceServiceImpl {
    async fn register_client(
        &self,
        req: Request<RegisterClientRequest>,
    ) -> Result<Response<RegisterClientResponse>, Status> {
        let req = req.into_inner();
        let mut regions = vec![req.home_region];
        for r in req.region_preference {
            if !regions.contains(&r) {
                regions.push(r);
            }
        }
        let (client_id, _allocation) = self
            .registry
            .register(RegisterRequest {
                friendly_name: req.friendly_name,
                regions,
                requested_quota: req.requested_quota.max(0) as usize,
            })
            .await
            .map_err(core_error_to_status)?;
        Ok(Response::new(RegisterClientResponse { client_id }))
    }

    async fn list_nodes(
        &self,
        req: Request<ListNodesRequest>,
    ) -> Result<Response<ListNodesResponse>, Status> {
        let req = req.into_inner();
        let (mut nodes, crv) = self.distributor.list(&req.client_id).await.map_err(core_error_to_status)?;
        if req.limit > 0 {
            nodes.truncate(req.limit as usize);
        }
        let proto_nodes = nodes
            .iter()
            .map(|n| node_to_proto(n, &self.locations))
            .collect::<Result<Vec<_>, _>>()?;
        let crv_entries = crv_to_entries(&crv, &self.locations)?;
        Ok(Response::new(ListNodesResponse { nodes: proto_nodes, crv: crv_entries }))
    }

    type WatchNodesStream = Pin<Box<dyn Stream<Item = Result<NodeEventFrame, Status>> + Send + 'static>>;

    async fn watch_nodes(
        &self,
        req: Request<WatchNodesRequest>,
    ) -> Result<Response<Self::WatchNodesStream>, Status> {
        let req = req.into_inner();
        let from = entries_to_crv(&req.from_crv, &self.locations)?;
        let rx = self
            .distributor
            .watch(&req.client_id, from)
            .await
            .map_err(core_error_to_status)?;
        let locations = self.locations.clone();
        let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(move |result| {
            let event = result.map_err(core_error_to_status)?;
            Ok(NodeEventFrame {
                r#type: event_type_to_proto(event.event_type),
                node: Some(node_to_proto(&event.node, &locations)?),
            })
        });
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_node(&self, req: Request<GetNodeRequest>) -> Result<Response<GetNodeResponse>, Status> {
        let req = req.into_inner();
        let region = self.locations.region_id_of(&req.region).map_err(core_error_to_status)?;
        let loc = RvLocation { region, partition: req.resource_partition as u32 };
        let log = self
            .logs
            .get(&loc)
            .ok_or_else(|| Status::not_found(format!("no log for {loc:?}")))?;
        let node = log
            .latest_node(&req.id)
            .ok_or_else(|| Status::not_found(format!("node {} not found", req.id)))?;
        Ok(Response::new(GetNodeResponse { node: Some(node_to_proto(&node, &self.locations)?) }))
    }
}

/// Server-side implementation of `RegionSimulatorService`, exposing a
/// `RegionSimulator` over gRPC so the Aggregator can pull from it remotely.
pub struct RegionSimulatorServiceImpl {
    simulator: Arc<RegionSimulator>,
    locations: Arc<LocationTable>,
}

impl RegionSimulatorServiceImpl {
    pub fn new(simulator: Arc<RegionSimulator>, locations: Arc<LocationTable>) -> RegionSimulatorServiceServer<Self> {
        RegionSimulatorServiceServer::new(RegionSimulatorServiceImpl { simulator, locations })
    }
}

#[tonic::async_trait]
impl RegionSimulatorService for RegionSimulatorServiceImpl {
    async fn pull_events(
        &self,
        req: Request<PullEventsRequest>,
    ) -> Result<Response<PullEventsResponse>, Status> {
        let req = req.into_inner();
        let crv = entries_to_crv(&req.crv, &self.locations)?;
        let (events, new_crv, has_more) = self
            .simulator
            .pull_events(&crv, req.max_batch.max(1) as usize)
            .await
            .map_err(core_error_to_status)?;
        let frames = events
            .iter()
            .map(|(_loc, event)| {
                Ok(NodeEventFrame {
                    r#type: event_type_to_proto(event.event_type),
                    node: Some(node_to_proto(&event.node, &self.locations)?),
                })
            })
            .collect::<Result<Vec<_>, Status>>()?;
        Ok(Response::new(PullEventsResponse {
            events: frames,
            crv: crv_to_entries(&new_crv, &self.locations)?,
            has_more,
        }))
    }

    async fn initial_nodes(
        &self,
        _req: Request<InitialNodesRequest>,
    ) -> Result<Response<InitialNodesResponse>, Status> {
        let (nodes, crv) = self.simulator.list_initial().await.map_err(core_error_to_status)?;
        let proto_nodes = nodes
            .iter()
            .map(|n| node_to_proto(n, &self.locations))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Response::new(InitialNodesResponse {
            nodes: proto_nodes,
            crv: crv_to_entries(&crv, &self.locations)?,
        }))
    }
}

/// Client-side `EventSource` for the Aggregator, talking to a remote
/// `RegionSimulatorService` (a real RRM would implement the same interface).
pub struct RemoteEventSource {
    client: tokio::sync::Mutex<RegionSimulatorServiceClient<tonic::transport::Channel>>,
    locations: Arc<LocationTable>,
    region_id: u32,
    region_name: String,
}

impl RemoteEventSource {
    pub async fn connect(
        url: String,
        region_id: u32,
        region_name: String,
        locations: Arc<LocationTable>,
    ) -> Result<Self, CoreError> {
        let client = RegionSimulatorServiceClient::connect(url)
            .await
            .map_err(|e| CoreError::SourceUnavailable(e.to_string()))?;
        Ok(RemoteEventSource { client: tokio::sync::Mutex::new(client), locations, region_id, region_name })
    }
}

fn proto_node_to_logical(node: Node, locations: &LocationTable) -> Result<LogicalNode, CoreError> {
    let region = locations.region_id_of(&node.region)?;
    let payload: serde_json::Value =
        serde_json::from_str(&node.payload_json).map_err(|e| CoreError::Internal(e.to_string()))?;
    let resource_version: u64 = node
        .resource_version
        .parse()
        .map_err(|_| CoreError::Internal("malformed resource_version".to_string()))?;
    Ok(LogicalNode {
        id: node.id,
        resource_version,
        last_updated_unix_millis: node.last_updated_unix_millis,
        geo_info: GeoInfo { region, resource_partition: node.resource_partition as u32 },
        payload,
    })
}

#[async_trait]
impl EventSource for RemoteEventSource {
    async fn pull_events(
        &self,
        crv: &Crv,
        max_batch: usize,
    ) -> Result<(Vec<(RvLocation, Arc<NodeEvent>)>, Crv, bool), CoreError> {
        let entries = crv
            .iter()
            .map(|(loc, rv)| {
                let region = self.locations.region_name_of(loc.region)?.to_string();
                Ok(CrvEntry { region, partition: loc.partition as i32, rv: *rv })
            })
            .collect::<Result<Vec<_>, CoreError>>()?;
        let request = PullEventsRequest { crv: entries, max_batch: max_batch as i32 };
        let response = self
            .client
            .lock()
            .await
            .pull_events(request)
            .await
            .map_err(|e| CoreError::SourceUnavailable(e.to_string()))?
            .into_inner();

        let mut events = Vec::with_capacity(response.events.len());
        for frame in response.events {
            let node = frame.node.ok_or_else(|| CoreError::Internal("event frame missing node".to_string()))?;
            let logical = proto_node_to_logical(node, &self.locations)?;
            let loc = logical.location();
            let event = NodeEvent { event_type: proto_to_event_type(frame.r#type), node: logical };
            events.push((loc, Arc::new(event)));
        }
        let mut new_crv = Crv::new();
        for entry in response.crv {
            let region = self.locations.region_id_of(&entry.region)?;
            new_crv.insert(RvLocation { region, partition: entry.partition as u32 }, entry.rv);
        }
        Ok((events, new_crv, response.has_more))
    }

    async fn list_initial(&self) -> Result<(Vec<LogicalNode>, Crv), CoreError> {
        let response = self
            .client
            .lock()
            .await
            .initial_nodes(InitialNodesRequest {})
            .await
            .map_err(|e| CoreError::SourceUnavailable(e.to_string()))?
            .into_inner();

        let mut nodes = Vec::with_capacity(response.nodes.len());
        for node in response.nodes {
            nodes.push(proto_node_to_logical(node, &self.locations)?);
        }
        let mut crv = Crv::new();
        for entry in response.crv {
            let region = self.locations.region_id_of(&entry.region)?;
            crv.insert(RvLocation { region, partition: entry.partition as u32 }, entry.rv);
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
        self.locations.rp_count()
    }
}
