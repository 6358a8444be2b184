use crate::config::cli::{CliOpt, Command};
use std::path::PathBuf;
use std::time::Duration;
use testbed_network::tcp::TcpConfig;

pub mod cli;
pub mod traffic;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed traffic descriptor: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("flow entry {entry}: `{tag}` directive parameter {index} is missing or not a number")]
    DirectiveParameter {
        entry: usize,
        tag: &'static str,
        index: usize,
    },
    #[error("flow entry {entry}: {kind} change to {value} is out of range ({reason})")]
    ChangeOutOfRange {
        entry: usize,
        kind: traffic::ChangeKind,
        value: f64,
        reason: &'static str,
    },
    #[error("flow entry {entry}: start time {start}s is after the end time {end}s")]
    InvalidFlowWindow { entry: usize, start: u64, end: u64 },
    #[error("flow entry {entry}: unknown congestion control `{name}` (known: {known})")]
    UnknownCongestionControl {
        entry: usize,
        name: String,
        known: String,
    },
    #[error("the {topology} topology needs {expected}, but the traffic descriptor has {actual}")]
    FlowCountMismatch {
        topology: &'static str,
        expected: String,
        actual: usize,
    },
    #[error("invalid {parameter}: {reason}")]
    InvalidParameter {
        parameter: &'static str,
        reason: String,
    },
}

/// Everything needed to run one experiment, independent of how it was specified
#[derive(Clone, Debug)]
pub struct ExperimentParams {
    pub traffic_config: PathBuf,
    pub output_dir: PathBuf,
    pub seed: u64,
    pub tcp: TcpConfig,
    pub pcap: bool,
    /// Simulated times (in seconds) at which the routing tables are dumped
    pub route_snapshots: Vec<f64>,
    pub topology: TopologyParams,
}

#[derive(Clone, Debug)]
pub enum TopologyParams {
    Dumbbell(DumbbellParams),
    CrossPath(CrossPathParams),
}

impl TopologyParams {
    pub fn name(&self) -> &'static str {
        match self {
            TopologyParams::Dumbbell(_) => "dumbbell",
            TopologyParams::CrossPath(_) => "cross-path",
        }
    }
}

#[derive(Clone, Debug)]
pub struct DumbbellParams {
    /// One-way delay of the sender access links
    pub delay: Duration,
    /// One-way delay of the access links of every flow but the first (zero means `delay`)
    pub delay2: Duration,
    pub bandwidth_mbps: u64,
    pub queue_packets: usize,
}

#[derive(Clone, Debug)]
pub struct CrossPathParams {
    pub num_clients: usize,
    /// Per-dumbbell parameters, index 0 being the first dumbbell
    pub delay: [Duration; 2],
    pub bandwidth_mbps: [u64; 2],
    pub queue_packets: [usize; 2],
    pub reroute_at: f64,
    pub reroute_back_at: f64,
}

impl ExperimentParams {
    pub fn from_cli(options: CliOpt) -> Result<Self, ConfigError> {
        let topology = match options.command {
            Command::Dumbbell(opt) => {
                positive("bandwidth", opt.bandwidth)?;
                positive("queue size", opt.queue_size as u64)?;
                TopologyParams::Dumbbell(DumbbellParams {
                    delay: Duration::from_millis(opt.delay),
                    delay2: Duration::from_millis(opt.delay2),
                    bandwidth_mbps: opt.bandwidth,
                    queue_packets: opt.queue_size,
                })
            }
            Command::CrossPath(opt) => {
                positive("number of clients", opt.num_clients as u64)?;
                positive("bandwidth1", opt.bandwidth1)?;
                positive("bandwidth2", opt.bandwidth2)?;
                positive("queue size1", opt.queue_size1 as u64)?;
                positive("queue size2", opt.queue_size2 as u64)?;
                if !(0.0 <= opt.reroute_at && opt.reroute_at <= opt.reroute_back_at) {
                    return Err(ConfigError::InvalidParameter {
                        parameter: "reroute times",
                        reason: format!(
                            "expected 0 <= reroute-at ({}) <= reroute-back-at ({})",
                            opt.reroute_at, opt.reroute_back_at
                        ),
                    });
                }

                TopologyParams::CrossPath(CrossPathParams {
                    num_clients: opt.num_clients,
                    delay: [
                        Duration::from_millis(opt.delay1),
                        Duration::from_millis(opt.delay2),
                    ],
                    bandwidth_mbps: [opt.bandwidth1, opt.bandwidth2],
                    queue_packets: [opt.queue_size1, opt.queue_size2],
                    reroute_at: opt.reroute_at,
                    reroute_back_at: opt.reroute_back_at,
                })
            }
        };

        positive("segment size", options.segment_size as u64)?;
        positive("initial congestion window", options.initial_cwnd as u64)?;
        if let Some(t) = options.route_snapshot_at.iter().find(|t| !t.is_finite() || **t < 0.0) {
            return Err(ConfigError::InvalidParameter {
                parameter: "route snapshot time",
                reason: format!("{t} is not a valid simulated time"),
            });
        }

        let tcp = TcpConfig {
            segment_size: options.segment_size,
            initial_cwnd_segments: options.initial_cwnd,
            initial_ssthresh_bytes: (options.initial_ssthresh != 0)
                .then_some(options.initial_ssthresh),
            min_rto: Duration::from_millis(options.min_rto_ms),
            ..TcpConfig::default()
        };

        Ok(Self {
            traffic_config: options.traffic_config,
            output_dir: options.output_dir,
            seed: options.seed,
            tcp,
            pcap: options.pcap,
            route_snapshots: options.route_snapshot_at,
            topology,
        })
    }
}

fn positive(parameter: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidParameter {
            parameter,
            reason: "must be greater than zero".to_string(),
        });
    }

    Ok(())
}
