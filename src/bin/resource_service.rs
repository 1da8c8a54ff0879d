use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use tonic::transport::Server;
use tracing::{error, info};

use global_resource_service::aggregator::Aggregator;
use global_resource_service::config::ServiceArgs;
use global_resource_service::distributor::Distributor;
use global_resource_service::event_log::NodeEventLog;
use global_resource_service::grpc::{RemoteEventSource, ResourceServiceImpl};
use global_resource_service::location::LocationTable;
use global_resource_service::metrics;
use global_resource_service::registry::ClientRegistry;
use global_resource_service::store::MemoryStore;
use global_resource_service::types::RvLocation;

/// Connects to one region's source, retrying with capped backoff until it
/// succeeds, then hands the live source off to the Aggregator for good.
async fn connect_and_run(
    region_id: u32,
    name: String,
    url: String,
    locations: Arc<LocationTable>,
    aggregator: Arc<Aggregator>,
) {
    let mut backoff = std::time::Duration::from_millis(100);
    loop {
        match RemoteEventSource::connect(url.clone(), region_id, name.clone(), locations.clone()).await {
            Ok(source) => {
                info!(region = %name, %url, "connected to region source");
                aggregator.spawn_source(Arc::new(source));
                return;
            }
            Err(e) => {
                error!(region = %name, %url, error = %e, ?backoff, "failed to connect to region source, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(std::time::Duration::from_secs(30));
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt::init();
    let args = ServiceArgs::parse();
    let resource_urls = args.parsed_resource_urls()?;

    let region_names: Vec<String> = resource_urls.iter().map(|(name, _)| name.clone()).collect();
    let locations = Arc::new(LocationTable::new(region_names.clone(), args.rp_num));

    let mut logs = HashMap::new();
    for region_id in 0..region_names.len() as u32 {
        for rp in 0..args.rp_num as u32 {
            let loc = RvLocation { region: region_id, partition: rp };
            logs.insert(loc, Arc::new(NodeEventLog::new(loc, args.log_capacity)));
        }
    }
    let logs = Arc::new(logs);

    let store = Arc::new(MemoryStore::new());
    let registry = ClientRegistry::new(locations.clone(), logs.clone(), store.clone());
    let distributor = Distributor::new(logs.clone(), registry.clone());

    let aggregator = Aggregator::new(logs.clone(), store.clone(), args.max_pull_batch);
    for (region_id, name) in region_names.iter().enumerate() {
        aggregator.restore_region(&locations, region_id as u32, name).await;
    }
    for (region_id, (name, url)) in resource_urls.into_iter().enumerate() {
        let locations = locations.clone();
        let aggregator = aggregator.clone();
        tokio::spawn(connect_and_run(region_id as u32, name, url, locations, aggregator));
    }

    if args.enable_metrics {
        metrics::register_metrics()?;
        tokio::spawn(metrics::start_metrics_server(args.metrics_port));
    }

    let addr = args.master_ip.parse()?;
    info!(%addr, "resource service listening");
    let service = ResourceServiceImpl::new(locations, logs, registry, distributor);
    Server::builder().add_service(service).serve(addr).await?;

    Ok(())
}
