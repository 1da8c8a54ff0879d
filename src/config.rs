//! CLI configuration for both binaries (spec §6).
//!
//! Flags are parsed with `clap` rather than the raw `env::var` reads some of
//! our other services use, since the external interface here is a process
//! invoked with flags, not a container configured purely by environment.

use clap::Parser;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {flag}: {message}")]
    InvalidValue { flag: String, message: String },

    #[error("{flag} is required when {because}")]
    MissingDependentFlag { flag: String, because: String },
}

/// The global resource service: aggregates region simulators (or real RRMs)
/// and serves List/Watch to clients.
#[derive(Parser, Debug, Clone)]
#[command(name = "resource-service", version, about)]
pub struct ServiceArgs {
    /// Address this service's gRPC server binds to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub master_ip: String,

    /// Comma-separated `name=url` pairs, one per source region, e.g.
    /// `Beijing=http://127.0.0.1:9001,Shanghai=http://127.0.0.1:9002`.
    #[arg(long, value_delimiter = ',')]
    pub resource_urls: Vec<String>,

    /// Resource partitions per region. Uniform across every region.
    #[arg(long, default_value_t = 10)]
    pub rp_num: usize,

    /// Ring buffer capacity per (region, RP) log.
    #[arg(long, default_value_t = 100_000)]
    pub log_capacity: usize,

    /// Max events returned across a single PullEvents call to one source.
    #[arg(long, default_value_t = crate::aggregator::DEFAULT_MAX_PULL_BATCH)]
    pub max_pull_batch: usize,

    /// Watch channel depth before a client starts blocking the pump.
    #[arg(long, default_value_t = crate::distributor::DEFAULT_WATCH_CHANNEL_CAPACITY)]
    pub watch_channel_capacity: usize,

    /// Seconds a watch pump may block on a full channel before the client
    /// is disconnected with `ClientSlow`.
    #[arg(long, default_value_t = 30)]
    pub watch_idle_timeout_secs: u64,

    #[arg(long, default_value_t = false)]
    pub enable_metrics: bool,

    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,
}

impl ServiceArgs {
    pub fn parsed_resource_urls(&self) -> Result<Vec<(String, String)>, ConfigError> {
        if self.resource_urls.is_empty() {
            return Err(ConfigError::MissingDependentFlag {
                flag: "--resource_urls".to_string(),
                because: "the service has no source regions to aggregate from".to_string(),
            });
        }
        self.resource_urls
            .iter()
            .map(|pair| {
                pair.split_once('=')
                    .map(|(name, url)| (name.to_string(), url.to_string()))
                    .ok_or_else(|| ConfigError::InvalidValue {
                        flag: "--resource_urls".to_string(),
                        message: format!("expected `name=url`, got `{pair}`"),
                    })
            })
            .collect()
    }
}

/// The region simulator: a synthetic RRM standing in for a real one,
/// serving PullEvents/InitialNodes over gRPC.
#[derive(Parser, Debug, Clone)]
#[command(name = "region-simulator", version, about)]
pub struct SimulatorArgs {
    #[arg(long, default_value = "0.0.0.0:9001")]
    pub listen_addr: String,

    #[arg(long)]
    pub region_name: String,

    #[arg(long, default_value_t = 0)]
    pub region_id: u32,

    #[arg(long, default_value_t = 10)]
    pub rp_num: usize,

    #[arg(long, default_value_t = 1_000)]
    pub nodes_per_rp: usize,

    #[arg(long, default_value_t = 100_000)]
    pub log_capacity: usize,

    /// Runs the Daily pattern (periodic small updates) unless `--outage` is set.
    #[arg(long, default_value_t = 60)]
    pub daily_tick_secs: u64,

    /// Runs the Outage pattern instead of Daily: after `--outage_wait_secs`,
    /// marks `--outage_rp_count` resource partitions down, then stops.
    #[arg(long, default_value_t = false)]
    pub outage: bool,

    #[arg(long, default_value_t = 60)]
    pub outage_wait_secs: u64,

    #[arg(long, default_value_t = 1)]
    pub outage_rp_count: usize,

    #[arg(long, default_value_t = false)]
    pub enable_metrics: bool,

    #[arg(long, default_value_t = 9091)]
    pub metrics_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_resource_urls() {
        let args = ServiceArgs::parse_from(["resource-service"]);
        assert!(matches!(
            args.parsed_resource_urls(),
            Err(ConfigError::MissingDependentFlag { .. })
        ));
    }

    #[test]
    fn parses_name_equals_url_pairs() {
        let args = ServiceArgs::parse_from([
            "resource-service",
            "--resource_urls",
            "Beijing=http://127.0.0.1:9001,Shanghai=http://127.0.0.1:9002",
        ]);
        let parsed = args.parsed_resource_urls().unwrap();
        assert_eq!(
            parsed,
            vec![
                ("Beijing".to_string(), "http://127.0.0.1:9001".to_string()),
                ("Shanghai".to_string(), "http://127.0.0.1:9002".to_string()),
            ]
        );
    }

    #[test]
    fn rejects_malformed_pair() {
        let args = ServiceArgs::parse_from(["resource-service", "--resource_urls", "Beijing"]);
        assert!(matches!(
            args.parsed_resource_urls(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
