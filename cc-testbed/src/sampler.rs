//! Metric samplers
//!
//! Periodic samplers read a cumulative counter at a fixed interval and write either the byte rate
//! (in Mbps) or the raw increase since their previous firing. Event-driven samplers are trace hooks
//! that write every change of a traced value.

use anyhow::Context;
use parking_lot::Mutex;
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use testbed_network::clock::{RepeatingTask, SimTime};
use testbed_network::network::{DeviceId, Network, NetworkError};
use testbed_network::tcp::FlowId;
use testbed_network::trace::TraceHook;

/// A `time,<metric>` CSV series
#[derive(Clone)]
pub struct Series {
    writer: Arc<Mutex<csv::Writer<Box<dyn Write + Send>>>>,
}

impl Series {
    pub fn create(path: &Path, metric: &str) -> anyhow::Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create series file at {}", path.display()))?;
        Self::new(Box::new(BufWriter::new(file)), metric)
    }

    pub fn new(writer: Box<dyn Write + Send>, metric: &str) -> anyhow::Result<Self> {
        let mut writer = csv::Writer::from_writer(writer);
        writer
            .write_record(["time", metric])
            .context("failed to write series header")?;

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    pub fn record(&self, now: SimTime, value: impl Display) -> anyhow::Result<()> {
        self.writer
            .lock()
            .write_record([format!("{:.6}", now.as_secs_f64()), value.to_string()])
            .context("failed to write series record")
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.writer
            .lock()
            .flush()
            .context("failed to flush series")
    }
}

/// A cumulative counter exposed by the network
#[derive(Clone, Copy, Debug)]
pub enum CounterSource {
    /// Wire bytes sent by the flow's sender
    FlowTxBytes(FlowId),
    /// Application bytes delivered to the flow's sink
    FlowRxBytes(FlowId),
    FlowRetransmits(FlowId),
    QueueDrops(DeviceId),
}

impl CounterSource {
    pub fn read(&self, network: &Network) -> Result<u64, NetworkError> {
        Ok(match *self {
            CounterSource::FlowTxBytes(flow) => network.flow_counters(flow)?.tx_bytes,
            CounterSource::FlowRxBytes(flow) => network.flow_counters(flow)?.rx_bytes,
            CounterSource::FlowRetransmits(flow) => network.flow_counters(flow)?.retransmits,
            CounterSource::QueueDrops(device) => network.device_stats(device)?.queue_drops,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplerKind {
    /// Byte counter increase per second, in Mbps
    ByteRate,
    /// Counter increase since the previous sample
    RawCount,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Sample {
    Rate(f64),
    Count(u64),
}

impl Display for Sample {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Sample::Rate(mbps) => write!(f, "{mbps}"),
            Sample::Count(count) => write!(f, "{count}"),
        }
    }
}

pub struct PeriodicSampler {
    source: CounterSource,
    kind: SamplerKind,
    interval: Duration,
    series: Series,
    previous_value: u64,
    previous_time: SimTime,
}

impl PeriodicSampler {
    /// Creates a sampler whose first sample is computed against `(baseline_value, baseline_time)`
    pub fn new(
        source: CounterSource,
        kind: SamplerKind,
        interval: Duration,
        series: Series,
        baseline_value: u64,
        baseline_time: SimTime,
    ) -> Self {
        Self {
            source,
            kind,
            interval,
            series,
            previous_value: baseline_value,
            previous_time: baseline_time,
        }
    }

    /// Computes the sample for `current` at `now` and makes them the new baseline
    pub fn advance(&mut self, current: u64, now: SimTime) -> anyhow::Result<Sample> {
        let elapsed = now.saturating_since(self.previous_time);
        anyhow::ensure!(
            !elapsed.is_zero(),
            "two samples of the same series at {now}"
        );

        let delta = current.saturating_sub(self.previous_value);
        self.previous_value = current;
        self.previous_time = now;

        Ok(match self.kind {
            SamplerKind::ByteRate => Sample::Rate(byte_rate_mbps(delta, elapsed)),
            SamplerKind::RawCount => Sample::Count(delta),
        })
    }
}

impl RepeatingTask<Network> for PeriodicSampler {
    fn interval(&self) -> Duration {
        self.interval
    }

    fn fire(&mut self, network: &mut Network, now: SimTime) -> anyhow::Result<()> {
        let current = self.source.read(network)?;
        let sample = self.advance(current, now)?;
        self.series.record(now, sample)
    }
}

pub fn byte_rate_mbps(bytes: u64, elapsed: Duration) -> f64 {
    8.0 * bytes as f64 / (1e6 * elapsed.as_secs_f64())
}

/// Maps the "unset" sentinels of integer traces to zero
pub fn normalize_sentinel(value: u32) -> u32 {
    if value == u32::MAX || value == i32::MAX as u32 {
        0
    } else {
        value
    }
}

/// Writes every change of a queue length or window trace
pub fn counter_hook(series: Series) -> TraceHook<u32> {
    Box::new(move |now, value| series.record(now, normalize_sentinel(value)))
}

/// Writes every change of a time trace, in milliseconds
pub fn time_hook(series: Series) -> TraceHook<Duration> {
    Box::new(move |now, value| series.record(now, value.as_millis()))
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use testbed_network::clock::Scheduler;

    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        pub(crate) fn rows(&self) -> Vec<(f64, String)> {
            let data = self.0.lock().clone();
            let mut reader = csv::Reader::from_reader(data.as_slice());
            reader
                .records()
                .map(|r| {
                    let r = r.unwrap();
                    (r[0].parse().unwrap(), r[1].to_string())
                })
                .collect()
        }
    }

    pub(crate) fn memory_series(metric: &str) -> (Series, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let series = Series::new(Box::new(buffer.clone()), metric).unwrap();
        (series, buffer)
    }

    fn dumbbell_network() -> (Network, DeviceId) {
        let topology = crate::topology::dumbbell::build(
            &crate::config::DumbbellParams {
                delay: Duration::from_millis(5),
                delay2: Duration::ZERO,
                bandwidth_mbps: 10,
                queue_packets: 100,
            },
            1,
        )
        .unwrap();
        let device = topology.observed_queues[0].device;
        let network = Network::initialize(topology.spec, fastrand::Rng::with_seed(1)).unwrap();
        (network, device)
    }

    fn sampler(kind: SamplerKind, series: Series) -> PeriodicSampler {
        let (_, device) = dumbbell_network();
        PeriodicSampler::new(
            CounterSource::QueueDrops(device),
            kind,
            Duration::from_secs(1),
            series,
            0,
            SimTime::ZERO,
        )
    }

    #[test]
    fn test_byte_rate() {
        let (series, _) = memory_series("goodput");
        let mut sampler = sampler(SamplerKind::ByteRate, series);

        // 1.25 MB in one second is 10 Mbps
        let sample = sampler.advance(1_250_000, SimTime::from_secs(1)).unwrap();
        assert_eq!(sample, Sample::Rate(10.0));

        // Half a second later, another 250 KB
        let sample = sampler.advance(1_500_000, SimTime::from_millis(1500)).unwrap();
        let Sample::Rate(rate) = sample else {
            panic!("expected a rate");
        };
        assert!((rate - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_raw_count() {
        let (series, _) = memory_series("retransmits");
        let mut sampler = sampler(SamplerKind::RawCount, series);

        assert_eq!(sampler.advance(3, SimTime::from_millis(100)).unwrap(), Sample::Count(3));
        assert_eq!(sampler.advance(3, SimTime::from_millis(200)).unwrap(), Sample::Count(0));
        assert_eq!(sampler.advance(7, SimTime::from_millis(300)).unwrap(), Sample::Count(4));
    }

    #[test]
    fn test_same_timestamp_is_rejected() {
        let (series, _) = memory_series("throughput");
        let mut sampler = sampler(SamplerKind::ByteRate, series);
        sampler.advance(10, SimTime::from_secs(1)).unwrap();

        assert!(sampler.advance(20, SimTime::from_secs(1)).is_err());
    }

    #[test]
    fn test_sentinel_is_written_as_zero() {
        let (series, buffer) = memory_series("root_pkts");
        let mut hook = counter_hook(series.clone());

        hook(SimTime::from_millis(10), 4).unwrap();
        hook(SimTime::from_millis(20), u32::MAX).unwrap();
        hook(SimTime::from_millis(30), i32::MAX as u32).unwrap();
        series.flush().unwrap();

        let values: Vec<_> = buffer.rows().into_iter().map(|(_, v)| v).collect();
        assert_eq!(values, ["4", "0", "0"]);
    }

    #[test]
    fn test_time_hook_writes_millis() {
        let (series, buffer) = memory_series("rtt");
        let mut hook = time_hook(series.clone());

        hook(SimTime::from_secs(2), Duration::from_micros(20_400)).unwrap();
        series.flush().unwrap();

        assert_eq!(buffer.rows(), vec![(2.0, "20".to_string())]);
        let header = String::from_utf8(buffer.0.lock().clone()).unwrap();
        assert!(header.starts_with("time,rtt\n"));
    }

    #[test]
    fn test_scheduled_samples_have_increasing_timestamps() {
        let (series, buffer) = memory_series("drops");
        let (mut network, device) = dumbbell_network();

        let mut scheduler = Scheduler::new();
        scheduler.schedule_repeating(
            SimTime::from_millis(100),
            PeriodicSampler::new(
                CounterSource::QueueDrops(device),
                SamplerKind::RawCount,
                Duration::from_secs(1),
                series.clone(),
                0,
                SimTime::ZERO,
            ),
        );
        scheduler.stop_at(SimTime::from_secs(5));
        scheduler.run(&mut network).unwrap();
        series.flush().unwrap();

        let times: Vec<_> = buffer.rows().into_iter().map(|(t, _)| t).collect();
        assert_eq!(times, [0.1, 1.1, 2.1, 3.1, 4.1]);
    }
}
