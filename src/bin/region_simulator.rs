use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tonic::transport::Server;
use tracing::info;

use global_resource_service::config::SimulatorArgs;
use global_resource_service::grpc::RegionSimulatorServiceImpl;
use global_resource_service::location::LocationTable;
use global_resource_service::metrics;
use global_resource_service::simulator::{DataPattern, RegionSimulator};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt::init();
    let args = SimulatorArgs::parse();

    let locations = Arc::new(LocationTable::new([args.region_name.clone()], args.rp_num));
    let simulator = RegionSimulator::new(
        args.region_id,
        args.region_name.clone(),
        args.rp_num,
        args.nodes_per_rp,
        args.log_capacity,
    );

    let pattern = if args.outage {
        DataPattern::Outage {
            wait: Duration::from_secs(args.outage_wait_secs),
            rp_down_number: args.outage_rp_count,
        }
    } else {
        DataPattern::Daily { tick: Duration::from_secs(args.daily_tick_secs) }
    };
    simulator.spawn_pattern(pattern);

    if args.enable_metrics {
        metrics::register_metrics()?;
        tokio::spawn(metrics::start_metrics_server(args.metrics_port));
    }

    let addr = args.listen_addr.parse()?;
    info!(%addr, region = %args.region_name, "region simulator listening");
    let service = RegionSimulatorServiceImpl::new(simulator, locations);
    Server::builder().add_service(service).serve(addr).await?;

    Ok(())
}
