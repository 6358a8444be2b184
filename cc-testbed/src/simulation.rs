use crate::config::ExperimentParams;
use crate::config::traffic::{ExperimentConfig, Flow};
use crate::mutator::{LinkMutator, RerouteMutator, RouteMode};
use crate::output::{FlowManifest, Manifest, OutputDir};
use crate::sampler::{self, CounterSource, PeriodicSampler, SamplerKind, Series};
use crate::topology::{FlowEndpoints, Topology};
use anyhow::Context;
use fastrand::Rng;
use std::time::Duration;
use testbed_network::clock::{RunSummary, Scheduler, SimTime};
use testbed_network::network::Network;
use testbed_network::tcp::{FlowCounters, FlowId, FlowSpec, TimeTrace, WindowTrace, congestion};

const RATE_INTERVAL: Duration = Duration::from_secs(1);
const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(100);
const QUEUE_DROPS_INTERVAL: Duration = Duration::from_secs(1);
/// Delay between a flow's start and the first sample of its periodic series
const FIRST_SAMPLE_DELAY: Duration = Duration::from_millis(101);
/// Delay between a flow's start and the connection of its socket traces
const TRACE_CONNECT_DELAY: Duration = Duration::from_millis(1);
const FIRST_QUEUE_DROPS_SAMPLE: Duration = Duration::from_millis(100);

const WINDOW_TRACES: [(WindowTrace, &str); 3] = [
    (WindowTrace::CongestionWindow, "cwnd"),
    (WindowTrace::BytesInFlight, "bytes"),
    (WindowTrace::SlowStartThreshold, "ssthresh"),
];
const TIME_TRACES: [(TimeTrace, &str); 3] = [
    (TimeTrace::Rtt, "rtt"),
    (TimeTrace::LastRtt, "lastrtt"),
    (TimeTrace::RetransmissionTimeout, "rto"),
];

/// What happened during a run, for reporting and tests
pub struct ExperimentOutcome {
    pub run: RunSummary,
    pub flows: Vec<FlowCounters>,
    /// Drops of every observed queue, in topology order
    pub queue_drops: Vec<u64>,
    pub route_mode: Option<RouteMode>,
}

pub fn run(params: &ExperimentParams) -> anyhow::Result<ExperimentOutcome> {
    println!("--- Params ---");
    println!("* Seed: {}", params.seed);
    println!("* Topology: {}", params.topology.name());
    println!("* Traffic config path: {}", params.traffic_config.display());
    println!("* Output directory: {}", params.output_dir.display());

    let config = ExperimentConfig::load(&params.traffic_config)?;
    let stop_time = SimTime::from_secs(config.stop_time());
    let output = OutputDir::create(&params.output_dir)?;
    let topology = Topology::build(&params.topology, config.flows.len())
        .context("failed to assemble the topology")?;
    let Topology {
        spec,
        flows: endpoints,
        observed_queues,
        targets,
        bottlenecks,
        reroute,
    } = topology;

    let mut network = Network::initialize(spec, Rng::with_seed(params.seed))?;
    // Captured before any change is applied
    let (manifest_nodes, manifest_links) = Manifest::describe_network(&network);
    let link_mutator = LinkMutator::install(&mut network, targets)?;
    let reroute = reroute
        .map(|plan| RerouteMutator::install(&mut network, plan))
        .transpose()?;

    println!("--- Network ---");
    println!(
        "* {} nodes, {} links",
        network.nodes().len(),
        network.links().len()
    );
    for (flow, endpoints) in config.flows.iter().zip(&endpoints) {
        println!(
            "* Flow {}: {} -> {}:{} ({}, {}s-{}s)",
            endpoints.label,
            endpoints.sender_address,
            endpoints.receiver_address,
            endpoints.receiver_port,
            flow.congestion_control,
            flow.start,
            flow.end
        );
    }
    println!("* {} link changes scheduled", config.changes.len());
    if let Some(reroute) = &reroute {
        let (at, back_at) = reroute.times();
        println!("* Rerouting at {at}s, back at {back_at}s");
    }

    let mut scheduler = Scheduler::new();
    let mut series = Vec::new();
    let mut flow_ids = Vec::with_capacity(endpoints.len());
    for (flow, endpoints) in config.flows.iter().zip(&endpoints) {
        let id = install_flow(&mut network, params, flow, endpoints)?;
        schedule_flow(&mut scheduler, id, flow, stop_time);
        series.extend(install_flow_samplers(&mut scheduler, &output, id, flow, endpoints)?);
        flow_ids.push(id);
    }

    for queue in &observed_queues {
        let size = output.series(&queue.size_file, "root_pkts")?;
        network.connect_queue_trace(queue.device, sampler::counter_hook(size.clone()))?;

        let drops = output.series(&queue.drops_file, "root_drop")?;
        scheduler.schedule_repeating(
            SimTime::ZERO + FIRST_QUEUE_DROPS_SAMPLE,
            PeriodicSampler::new(
                CounterSource::QueueDrops(queue.device),
                SamplerKind::RawCount,
                QUEUE_DROPS_INTERVAL,
                drops.clone(),
                0,
                SimTime::ZERO,
            ),
        );
        series.extend([size, drops]);
    }

    for change in &config.changes {
        link_mutator.schedule(&mut scheduler, change);
    }

    if let Some(reroute) = &reroute {
        reroute.schedule(&mut scheduler);
    }

    if params.pcap {
        for &device in &bottlenecks {
            let node = network.node(network.device(device)?.node())?.name().to_string();
            let link = network.link(network.device(device)?.link())?.name().to_string();
            let exporter = output.capture(&format!("{link}-{node}"))?;
            network.capture_device(device, exporter)?;
        }
    }

    for &at in &params.route_snapshots {
        let output = output.clone();
        scheduler.schedule_at(SimTime::from_secs_f64(at), move |network, scheduler| {
            output.append_route_snapshot(network, scheduler.now())
        });
    }

    scheduler.stop_at(stop_time);
    tracing::info!(%stop_time, "starting simulation");
    let run = scheduler.run(&mut network)?;
    tracing::info!(end = %run.end_time, events = run.events_fired, "simulation finished");

    for series in &series {
        series.flush()?;
    }
    network.flush_captures()?;

    println!("--- Flows ---");
    let mut flows = Vec::with_capacity(flow_ids.len());
    for (&id, endpoints) in flow_ids.iter().zip(&endpoints) {
        let counters = network.flow_counters(id)?;
        println!(
            "* {} ({}): {} bytes sent, {} bytes delivered, {} retransmitted segments",
            endpoints.label,
            network.flow_name(id)?,
            counters.tx_bytes,
            counters.rx_bytes,
            counters.retransmits
        );
        flows.push(counters);
    }

    println!("--- Results ---");
    println!(
        "* Simulated time: {} ({} events)",
        run.end_time, run.events_fired
    );
    let mut queue_drops = Vec::with_capacity(observed_queues.len());
    for queue in &observed_queues {
        let device = network.device(queue.device)?;
        let drops = device.stats().queue_drops;
        println!(
            "* {} (interface {}): {drops} packets dropped at the queue",
            network.node(device.node())?.name(),
            device.interface()
        );
        queue_drops.push(drops);
    }
    let route_mode = reroute.as_ref().map(|r| r.mode());
    if let Some(mode) = route_mode {
        println!("* Final routes: {mode}");
    }

    output.write_manifest(&Manifest {
        seed: params.seed,
        topology: params.topology.name(),
        stop_time_secs: config.stop_time(),
        nodes: manifest_nodes,
        links: manifest_links,
        flows: config
            .flows
            .iter()
            .zip(&endpoints)
            .map(|(flow, endpoints)| FlowManifest {
                label: endpoints.label.clone(),
                congestion_control: flow.congestion_control.clone(),
                sender: endpoints.sender_address,
                receiver: endpoints.receiver_address,
                receiver_port: endpoints.receiver_port,
                start: Duration::from_secs(flow.start),
                end: Duration::from_secs(flow.end),
            })
            .collect(),
        changes: config.changes.clone(),
    })?;

    Ok(ExperimentOutcome {
        run,
        flows,
        queue_drops,
        route_mode,
    })
}

fn install_flow(
    network: &mut Network,
    params: &ExperimentParams,
    flow: &Flow,
    endpoints: &FlowEndpoints,
) -> anyhow::Result<FlowId> {
    tracing::debug!(
        src = %flow.src,
        dst = %flow.dst,
        label = %endpoints.label,
        "mapping flow onto topology"
    );

    let congestion_control = congestion::by_name(&flow.congestion_control)
        .with_context(|| format!("unknown congestion control `{}`", flow.congestion_control))?;
    let id = network.add_flow(FlowSpec {
        name: flow.congestion_control.clone(),
        sender: endpoints.sender,
        receiver: endpoints.receiver,
        sender_address: endpoints.sender_address,
        receiver_address: endpoints.receiver_address,
        receiver_port: endpoints.receiver_port,
        congestion_control,
        config: params.tcp.clone(),
    })?;

    Ok(id)
}

/// Starts the sink and sender at the flow's start, stops the sender at its end and the sink when
/// the experiment stops
fn schedule_flow(scheduler: &mut Scheduler<Network>, id: FlowId, flow: &Flow, stop_time: SimTime) {
    scheduler.schedule_at(SimTime::from_secs(flow.start), move |network, scheduler| {
        network.start_sink(id)?;
        network.start_sender(scheduler, id)
    });
    scheduler.schedule_at(SimTime::from_secs(flow.end), move |network, _| {
        Ok(network.stop_sender(id)?)
    });
    scheduler.schedule_at(stop_time, move |network, _| Ok(network.stop_sink(id)?));
}

fn install_flow_samplers(
    scheduler: &mut Scheduler<Network>,
    output: &OutputDir,
    id: FlowId,
    flow: &Flow,
    endpoints: &FlowEndpoints,
) -> anyhow::Result<Vec<Series>> {
    let cc = &flow.congestion_control;
    let label = &endpoints.label;
    let start = SimTime::from_secs(flow.start);
    let mut series = Vec::new();

    for (metric, source, kind, interval) in [
        (
            "throughput",
            CounterSource::FlowTxBytes(id),
            SamplerKind::ByteRate,
            RATE_INTERVAL,
        ),
        (
            "goodput",
            CounterSource::FlowRxBytes(id),
            SamplerKind::ByteRate,
            RATE_INTERVAL,
        ),
        (
            "retransmits",
            CounterSource::FlowRetransmits(id),
            SamplerKind::RawCount,
            RETRANSMIT_INTERVAL,
        ),
    ] {
        let out = output.flow_series(cc, label, metric)?;
        scheduler.schedule_repeating(
            start + FIRST_SAMPLE_DELAY,
            PeriodicSampler::new(source, kind, interval, out.clone(), 0, start),
        );
        series.push(out);
    }

    // Socket traces are connected once the sender is running
    let mut window_traces = Vec::new();
    for (trace, metric) in WINDOW_TRACES {
        let out = output.flow_series(cc, label, metric)?;
        window_traces.push((trace, out.clone()));
        series.push(out);
    }
    let mut time_traces = Vec::new();
    for (trace, metric) in TIME_TRACES {
        let out = output.flow_series(cc, label, metric)?;
        time_traces.push((trace, out.clone()));
        series.push(out);
    }

    scheduler.schedule_at(start + TRACE_CONNECT_DELAY, move |network, _| {
        for (trace, out) in window_traces {
            network.connect_window_trace(id, trace, sampler::counter_hook(out))?;
        }
        for (trace, out) in time_traces {
            network.connect_time_trace(id, trace, sampler::time_hook(out))?;
        }
        Ok(())
    });

    Ok(series)
}
