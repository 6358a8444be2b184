//! Pluggable congestion control
//!
//! Implementations only decide how the congestion window grows on new acknowledgements and where
//! the slow start threshold lands after a loss. Loss detection and recovery live in the sender.

use crate::clock::SimTime;

/// Names of the registered congestion control implementations
pub const REGISTERED: [&str; 3] = ["TcpNewReno", "TcpCubic", "TcpScalable"];

/// Sender window state, in bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub cwnd: u32,
    pub ssthresh: u32,
    pub segment_size: u32,
}

impl Window {
    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    fn segments(&self) -> u32 {
        self.cwnd / self.segment_size
    }
}

pub trait CongestionControl {
    fn name(&self) -> &'static str;

    /// Grows the window after `segments_acked` segments were newly acknowledged
    fn increase_window(&mut self, window: &mut Window, segments_acked: u32, now: SimTime);

    /// The slow start threshold to use after a loss
    fn ssthresh(&mut self, window: &Window, bytes_in_flight: u32, now: SimTime) -> u32;
}

/// Looks up a congestion control implementation by name, ignoring ASCII case
pub fn by_name(name: &str) -> Option<Box<dyn CongestionControl>> {
    if name.eq_ignore_ascii_case("TcpNewReno") {
        Some(Box::new(NewReno::default()))
    } else if name.eq_ignore_ascii_case("TcpCubic") {
        Some(Box::new(Cubic::default()))
    } else if name.eq_ignore_ascii_case("TcpScalable") {
        Some(Box::new(Scalable::default()))
    } else {
        None
    }
}

/// Exponential growth up to ssthresh, returning the acked segments that were not consumed
fn slow_start(window: &mut Window, segments_acked: u32) -> u32 {
    if segments_acked == 0 {
        return 0;
    }

    let before = window.cwnd;
    let grown = window
        .cwnd
        .saturating_add(segments_acked.saturating_mul(window.segment_size));
    window.cwnd = grown.min(window.ssthresh.max(before));
    let used = (window.cwnd - before) / window.segment_size;
    segments_acked.saturating_sub(used)
}

/// Adds one segment to the window per `per_segments` acknowledged segments
fn additive_increase(
    window: &mut Window,
    counter: &mut u32,
    segments_acked: u32,
    per_segments: u32,
) {
    let per_segments = per_segments.max(1);
    *counter += segments_acked;
    if *counter >= per_segments {
        let delta = *counter / per_segments;
        *counter -= delta * per_segments;
        window.cwnd = window
            .cwnd
            .saturating_add(delta.saturating_mul(window.segment_size));
    }
}

#[derive(Default)]
pub struct NewReno {
    cwnd_count: u32,
}

impl CongestionControl for NewReno {
    fn name(&self) -> &'static str {
        "TcpNewReno"
    }

    fn increase_window(&mut self, window: &mut Window, mut segments_acked: u32, _now: SimTime) {
        if window.in_slow_start() {
            segments_acked = slow_start(window, segments_acked);
        }

        if !window.in_slow_start() && segments_acked > 0 {
            let segments = window.segments();
            additive_increase(window, &mut self.cwnd_count, segments_acked, segments);
        }
    }

    fn ssthresh(&mut self, window: &Window, bytes_in_flight: u32, _now: SimTime) -> u32 {
        (bytes_in_flight / 2).max(2 * window.segment_size)
    }
}

/// Scalable TCP: a fixed increase per acknowledged window chunk and a gentle decrease
pub struct Scalable {
    ai_factor: u32,
    md_factor: f64,
    cwnd_count: u32,
}

impl Default for Scalable {
    fn default() -> Self {
        Self {
            ai_factor: 50,
            md_factor: 0.125,
            cwnd_count: 0,
        }
    }
}

impl CongestionControl for Scalable {
    fn name(&self) -> &'static str {
        "TcpScalable"
    }

    fn increase_window(&mut self, window: &mut Window, mut segments_acked: u32, _now: SimTime) {
        if window.in_slow_start() {
            segments_acked = slow_start(window, segments_acked);
        }

        if !window.in_slow_start() && segments_acked > 0 {
            let per_segments = window.segments().min(self.ai_factor);
            additive_increase(window, &mut self.cwnd_count, segments_acked, per_segments);
        }
    }

    fn ssthresh(&mut self, window: &Window, bytes_in_flight: u32, _now: SimTime) -> u32 {
        let segments = (bytes_in_flight / window.segment_size) as f64;
        let reduced = (segments * (1.0 - self.md_factor)) as u32;
        reduced.max(2) * window.segment_size
    }
}

/// CUBIC window growth (RFC 8312), without HyStart
pub struct Cubic {
    c: f64,
    beta: f64,
    fast_convergence: bool,
    cwnd_count: u32,
    last_max_cwnd: u32,
    epoch: Option<CubicEpoch>,
}

struct CubicEpoch {
    start: SimTime,
    k: f64,
    origin_point: u32,
}

impl Default for Cubic {
    fn default() -> Self {
        Self {
            c: 0.4,
            beta: 0.7,
            fast_convergence: true,
            cwnd_count: 0,
            last_max_cwnd: 0,
            epoch: None,
        }
    }
}

impl Cubic {
    /// Number of acknowledged segments needed before the window grows by one segment
    fn update(&mut self, window: &Window, now: SimTime) -> u32 {
        let segments = window.segments();
        let last_max_cwnd = self.last_max_cwnd;
        let c = self.c;
        let epoch = self.epoch.get_or_insert_with(|| {
            if last_max_cwnd <= segments {
                CubicEpoch {
                    start: now,
                    k: 0.0,
                    origin_point: segments,
                }
            } else {
                CubicEpoch {
                    start: now,
                    k: ((last_max_cwnd - segments) as f64 / c).cbrt(),
                    origin_point: last_max_cwnd,
                }
            }
        });

        let t = now.saturating_since(epoch.start).as_secs_f64();
        let offset = t - epoch.k;
        let target = epoch.origin_point as f64 + c * offset * offset * offset;
        let segments = segments as f64;

        let count = if target > segments {
            segments / (target - segments)
        } else {
            // Barely grow while below the previous maximum plateau
            100.0 * segments
        };

        (count as u32).max(1)
    }
}

impl CongestionControl for Cubic {
    fn name(&self) -> &'static str {
        "TcpCubic"
    }

    fn increase_window(&mut self, window: &mut Window, mut segments_acked: u32, now: SimTime) {
        if window.in_slow_start() {
            segments_acked = slow_start(window, segments_acked);
        }

        if !window.in_slow_start() && segments_acked > 0 {
            let count = self.update(window, now);
            self.cwnd_count += segments_acked;
            if self.cwnd_count >= count {
                window.cwnd = window.cwnd.saturating_add(window.segment_size);
                self.cwnd_count = 0;
            }
        }
    }

    fn ssthresh(&mut self, window: &Window, _bytes_in_flight: u32, _now: SimTime) -> u32 {
        let segments = window.segments();
        self.epoch = None;
        self.cwnd_count = 0;

        self.last_max_cwnd = if segments < self.last_max_cwnd && self.fast_convergence {
            (segments as f64 * (1.0 + self.beta) / 2.0) as u32
        } else {
            segments
        };

        let reduced = (segments as f64 * self.beta) as u32;
        reduced.max(2) * window.segment_size
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MSS: u32 = 1000;

    fn window(cwnd_segments: u32, ssthresh: u32) -> Window {
        Window {
            cwnd: cwnd_segments * MSS,
            ssthresh,
            segment_size: MSS,
        }
    }

    #[test]
    fn test_registry_ignores_case() {
        assert_eq!(by_name("TcpCubic").unwrap().name(), "TcpCubic");
        assert_eq!(by_name("tcpcubic").unwrap().name(), "TcpCubic");
        assert_eq!(by_name("TCPNEWRENO").unwrap().name(), "TcpNewReno");
        assert_eq!(by_name("TcpScalable").unwrap().name(), "TcpScalable");
        assert!(by_name("TcpBbr").is_none());

        for name in REGISTERED {
            assert_eq!(by_name(name).unwrap().name(), name);
        }
    }

    #[test]
    fn test_new_reno_slow_start_stops_at_ssthresh() {
        let mut cc = NewReno::default();
        let mut w = window(10, 12 * MSS);

        cc.increase_window(&mut w, 1, SimTime::ZERO);
        assert_eq!(w.cwnd, 11 * MSS);

        // One segment takes us to ssthresh, the rest is spent in congestion avoidance
        cc.increase_window(&mut w, 5, SimTime::ZERO);
        assert_eq!(w.cwnd, 12 * MSS);
    }

    #[test]
    fn test_new_reno_congestion_avoidance_grows_one_segment_per_window() {
        let mut cc = NewReno::default();
        let mut w = window(10, 10);

        for _ in 0..9 {
            cc.increase_window(&mut w, 1, SimTime::ZERO);
        }
        assert_eq!(w.cwnd, 10 * MSS);

        cc.increase_window(&mut w, 1, SimTime::ZERO);
        assert_eq!(w.cwnd, 11 * MSS);
    }

    #[test]
    fn test_new_reno_halves_on_loss() {
        let mut cc = NewReno::default();
        let w = window(20, 10);
        assert_eq!(cc.ssthresh(&w, 20 * MSS, SimTime::ZERO), 10 * MSS);
        assert_eq!(cc.ssthresh(&w, MSS, SimTime::ZERO), 2 * MSS);
    }

    #[test]
    fn test_scalable_decreases_by_an_eighth() {
        let mut cc = Scalable::default();
        let w = window(80, 10);
        assert_eq!(cc.ssthresh(&w, 80 * MSS, SimTime::ZERO), 70 * MSS);
    }

    #[test]
    fn test_scalable_increase_is_capped_by_ai_factor() {
        let mut cc = Scalable::default();
        let mut w = window(200, 10);

        cc.increase_window(&mut w, 49, SimTime::ZERO);
        assert_eq!(w.cwnd, 200 * MSS);
        cc.increase_window(&mut w, 1, SimTime::ZERO);
        assert_eq!(w.cwnd, 201 * MSS);
    }

    #[test]
    fn test_cubic_reduces_by_beta_and_remembers_max() {
        let mut cc = Cubic::default();
        let w = window(100, 10);

        assert_eq!(cc.ssthresh(&w, 100 * MSS, SimTime::ZERO), 70 * MSS);
        assert_eq!(cc.last_max_cwnd, 100);

        // A second loss below the previous maximum triggers fast convergence
        let w = window(80, 10);
        cc.ssthresh(&w, 80 * MSS, SimTime::ZERO);
        assert_eq!(cc.last_max_cwnd, 68);
    }

    #[test]
    fn test_cubic_grows_back_towards_previous_max() {
        let mut cc = Cubic::default();
        let mut w = window(100, 10);
        let ssthresh = cc.ssthresh(&w, 100 * MSS, SimTime::ZERO);
        w.cwnd = ssthresh;

        let mut now = SimTime::ZERO;
        for _ in 0..2000 {
            now = now + std::time::Duration::from_millis(10);
            cc.increase_window(&mut w, 1, now);
        }

        // K is ~4.2s for these parameters, so after 20s we are past the plateau
        assert!(w.cwnd > 100 * MSS, "cwnd = {}", w.cwnd / MSS);
    }
}
