//! Files produced by an experiment
//!
//! Per-flow series are named `{congestion control}-{flow label}-{metric}.csv`. The directory also
//! receives the queue series named by the topology, optional pcapng captures, route snapshots and
//! a `manifest.json` describing the run.

use crate::config::traffic::Change;
use crate::sampler::Series;
use anyhow::Context;
use serde::Serialize;
use serde_with::{DisplayFromStr, DurationSecondsWithFrac, serde_as};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use testbed_network::clock::SimTime;
use testbed_network::network::Network;
use testbed_network::network::ip::Ipv4Cidr;
use testbed_network::network::spec::NodeKind;
use testbed_network::pcap_exporter::PcapExporter;

const ROUTES_FILE: &str = "routes.txt";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Clone)]
pub struct OutputDir {
    root: PathBuf,
}

impl OutputDir {
    pub fn create(root: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("failed to create output directory at {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn flow_series(
        &self,
        congestion_control: &str,
        label: &str,
        metric: &str,
    ) -> anyhow::Result<Series> {
        self.series(&format!("{congestion_control}-{label}-{metric}.csv"), metric)
    }

    pub fn series(&self, file_name: &str, metric: &str) -> anyhow::Result<Series> {
        Series::create(&self.root.join(file_name), metric)
    }

    pub fn capture(&self, file_stem: &str) -> anyhow::Result<PcapExporter> {
        PcapExporter::create(&self.root.join(format!("{file_stem}.pcapng")))
    }

    /// Appends the route tables of every router
    pub fn append_route_snapshot(&self, network: &Network, now: SimTime) -> anyhow::Result<()> {
        let path = self.root.join(ROUTES_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut out = BufWriter::new(file);

        for node in network.nodes().iter().filter(|n| n.kind() == NodeKind::Router) {
            writeln!(out, "Time: {:.3}s, Node: {}", now.as_secs_f64(), node.name())?;
            writeln!(out, "{}", node.routes())?;
        }

        out.flush()?;
        Ok(())
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> anyhow::Result<()> {
        let path = self.root.join(MANIFEST_FILE);
        let file =
            File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, manifest).context("failed to write run manifest")?;
        out.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
pub struct Manifest {
    pub seed: u64,
    pub topology: &'static str,
    pub stop_time_secs: u64,
    pub nodes: Vec<NodeManifest>,
    pub links: Vec<LinkManifest>,
    pub flows: Vec<FlowManifest>,
    pub changes: Vec<Change>,
}

#[serde_as]
#[derive(Serialize)]
pub struct NodeManifest {
    pub name: String,
    #[serde_as(as = "Vec<DisplayFromStr>")]
    pub addresses: Vec<Ipv4Cidr>,
}

#[serde_as]
#[derive(Serialize)]
pub struct LinkManifest {
    pub name: String,
    pub nodes: [String; 2],
    pub data_rate_bps: u64,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub delay: Duration,
}

#[serde_as]
#[derive(Serialize)]
pub struct FlowManifest {
    pub label: String,
    pub congestion_control: String,
    #[serde_as(as = "DisplayFromStr")]
    pub sender: Ipv4Addr,
    #[serde_as(as = "DisplayFromStr")]
    pub receiver: Ipv4Addr,
    pub receiver_port: u16,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub start: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub end: Duration,
}

impl Manifest {
    /// Describes the nodes and links of the network in their initial state
    pub fn describe_network(network: &Network) -> (Vec<NodeManifest>, Vec<LinkManifest>) {
        let nodes = network
            .nodes()
            .iter()
            .map(|node| NodeManifest {
                name: node.name().to_string(),
                addresses: node
                    .interfaces()
                    .iter()
                    .map(|&d| network.devices()[d.index()].address())
                    .collect(),
            })
            .collect();

        let links = network
            .links()
            .iter()
            .map(|link| {
                let [a, b] = link.devices().map(|d| &network.devices()[d.index()]);
                LinkManifest {
                    name: link.name().to_string(),
                    nodes: [a.node(), b.node()]
                        .map(|n| network.nodes()[n.index()].name().to_string()),
                    data_rate_bps: a.data_rate_bps(),
                    delay: link.delay(),
                }
            })
            .collect();

        (nodes, links)
    }
}
