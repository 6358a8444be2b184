use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
pub struct CliOpt {
    /// Path to the JSON file describing the flows and link changes
    #[arg(long)]
    pub traffic_config: PathBuf,

    /// Directory where the measured series are written (created if missing)
    #[arg(long)]
    pub output_dir: PathBuf,

    /// The random seed used for the simulated network (governing receive errors)
    #[arg(long, default_value_t = 123456789)]
    pub seed: u64,

    /// TCP segment size, in bytes
    #[arg(long, default_value_t = 1448)]
    pub segment_size: u32,

    /// Initial congestion window, in segments
    #[arg(long, default_value_t = 10)]
    pub initial_cwnd: u32,

    /// Initial slow start threshold, in bytes (0 leaves it unset, so flows start in slow start)
    #[arg(long, default_value_t = 10)]
    pub initial_ssthresh: u32,

    /// Lower bound of the retransmission timeout
    #[arg(long, default_value_t = 200)]
    pub min_rto_ms: u64,

    /// Whether to write a pcapng capture of every bottleneck device
    #[arg(long)]
    pub pcap: bool,

    /// Simulated time (in seconds) at which the routing tables are appended to routes.txt (may
    /// be repeated)
    #[arg(long)]
    pub route_snapshot_at: Vec<f64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// One flow per sender/receiver pair, all sharing a single bottleneck
    Dumbbell(DumbbellOpt),
    /// Two dumbbells joined by cross links, with the second dumbbell's traffic temporarily
    /// rerouted through the first one
    CrossPath(CrossPathOpt),
}

#[derive(Parser, Debug, Clone)]
pub struct DumbbellOpt {
    /// One-way delay of the sender access links, in milliseconds
    #[arg(long, default_value_t = 5)]
    pub delay: u64,

    /// One-way delay, in milliseconds, of the access links of every flow but the first (0 means
    /// all flows use `--delay`)
    #[arg(long, default_value_t = 0)]
    pub delay2: u64,

    /// Bottleneck bandwidth, in Mbps
    #[arg(long, default_value_t = 10)]
    pub bandwidth: u64,

    /// Queue size of every device, in packets
    #[arg(long, default_value_t = 100)]
    pub queue_size: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct CrossPathOpt {
    /// Number of client/server pairs per dumbbell
    #[arg(long, default_value_t = 2)]
    pub num_clients: usize,

    /// One-way delay of the client links of dumbbell 1, in milliseconds
    #[arg(long, default_value_t = 5)]
    pub delay1: u64,

    /// One-way delay of the client links of dumbbell 2, in milliseconds
    #[arg(long, default_value_t = 10)]
    pub delay2: u64,

    /// Bottleneck bandwidth of dumbbell 1, in Mbps
    #[arg(long, default_value_t = 10)]
    pub bandwidth1: u64,

    /// Bottleneck bandwidth of dumbbell 2, in Mbps
    #[arg(long, default_value_t = 10)]
    pub bandwidth2: u64,

    /// Queue size of the devices of dumbbell 1, in packets
    #[arg(long, default_value_t = 100)]
    pub queue_size1: usize,

    /// Queue size of the devices of dumbbell 2, in packets
    #[arg(long, default_value_t = 150)]
    pub queue_size2: usize,

    /// Simulated time (in seconds) at which dumbbell 2's traffic is moved to the cross links
    #[arg(long, default_value_t = 100.0)]
    pub reroute_at: f64,

    /// Simulated time (in seconds) at which dumbbell 2's traffic goes back to its own bottleneck
    #[arg(long, default_value_t = 200.0)]
    pub reroute_back_at: f64,
}
