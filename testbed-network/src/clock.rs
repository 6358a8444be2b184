//! Discrete-event clock
//!
//! Every callback in a simulation run is dispatched from here, one at a time, in strictly
//! non-decreasing simulated time. Callbacks scheduled for the same instant fire in the order they
//! were scheduled.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::time::Duration;

/// A point in simulated time, measured from the start of the run
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimTime(Duration);

impl SimTime {
    pub const ZERO: SimTime = SimTime(Duration::ZERO);

    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self(Duration::from_secs_f64(secs.max(0.0)))
    }

    pub fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }

    pub fn since_start(&self) -> Duration {
        self.0
    }

    /// The time elapsed since `earlier`, or zero if `earlier` is in the future
    pub fn saturating_since(&self, earlier: SimTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Duration) -> Self::Output {
        SimTime(self.0 + rhs)
    }
}

impl Display for SimTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}s", self.as_secs_f64())
    }
}

pub type Action<W> = Box<dyn FnOnce(&mut W, &mut Scheduler<W>) -> anyhow::Result<()>>;

/// A task that fires at a fixed interval until the run stops
pub trait RepeatingTask<W> {
    /// The time between two consecutive firings (must be non-zero)
    fn interval(&self) -> Duration;

    fn fire(&mut self, world: &mut W, now: SimTime) -> anyhow::Result<()>;
}

enum EventPayload<W> {
    Once(Action<W>),
    Repeating(Box<dyn RepeatingTask<W>>),
    Stop,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct EventKey {
    time: SimTime,
    sequence: u64,
}

struct ScheduledEvent<W> {
    key: EventKey,
    payload: EventPayload<W>,
}

impl<W> Eq for ScheduledEvent<W> {}

impl<W> PartialEq<Self> for ScheduledEvent<W> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<W> PartialOrd<Self> for ScheduledEvent<W> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<W> Ord for ScheduledEvent<W> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed, so the binary heap pops the earliest event first
        other.key.cmp(&self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub end_time: SimTime,
    pub events_fired: u64,
    pub stopped: bool,
}

pub struct Scheduler<W> {
    now: SimTime,
    next_sequence: u64,
    events_fired: u64,
    stopped: bool,
    queue: BinaryHeap<ScheduledEvent<W>>,
}

impl<W> Default for Scheduler<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> Scheduler<W> {
    pub fn new() -> Self {
        Self {
            now: SimTime::ZERO,
            next_sequence: 0,
            events_fired: 0,
            stopped: false,
            queue: BinaryHeap::new(),
        }
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// Schedules `action` at the absolute time `at`
    ///
    /// Times in the past are clamped to the current time, so the action fires after everything
    /// already scheduled for now.
    pub fn schedule_at(
        &mut self,
        at: SimTime,
        action: impl FnOnce(&mut W, &mut Scheduler<W>) -> anyhow::Result<()> + 'static,
    ) {
        self.push(at, EventPayload::Once(Box::new(action)));
    }

    /// Schedules `action` after `delay`, relative to the current time
    pub fn schedule_in(
        &mut self,
        delay: Duration,
        action: impl FnOnce(&mut W, &mut Scheduler<W>) -> anyhow::Result<()> + 'static,
    ) {
        self.schedule_at(self.now + delay, action);
    }

    /// Schedules the first firing of `task` at `first_at`, after which it reschedules itself every
    /// `task.interval()`
    pub fn schedule_repeating(&mut self, first_at: SimTime, task: impl RepeatingTask<W> + 'static) {
        assert!(
            !task.interval().is_zero(),
            "repeating tasks must have a non-zero interval"
        );
        self.push(first_at, EventPayload::Repeating(Box::new(task)));
    }

    /// Stops the run at `at`
    ///
    /// Events scheduled for `at` before this call still fire, events scheduled for `at` afterwards
    /// (and everything later) do not.
    pub fn stop_at(&mut self, at: SimTime) {
        self.push(at, EventPayload::Stop);
    }

    fn push(&mut self, at: SimTime, payload: EventPayload<W>) {
        let key = EventKey {
            time: at.max(self.now),
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.queue.push(ScheduledEvent { key, payload });
    }

    /// Fires the next pending event, returning `false` if nothing is left to do
    pub fn step(&mut self, world: &mut W) -> anyhow::Result<bool> {
        if self.stopped {
            return Ok(false);
        }

        let Some(event) = self.queue.pop() else {
            return Ok(false);
        };

        debug_assert!(event.key.time >= self.now);
        self.now = event.key.time;

        match event.payload {
            EventPayload::Once(action) => {
                self.events_fired += 1;
                action(world, self)?;
            }
            EventPayload::Repeating(mut task) => {
                self.events_fired += 1;
                task.fire(world, self.now)?;
                let next = self.now + task.interval();
                self.push(next, EventPayload::Repeating(task));
            }
            EventPayload::Stop => {
                self.stopped = true;
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Drains the pending events until none are left or a stop marker is reached
    ///
    /// The first failing event aborts the run.
    pub fn run(&mut self, world: &mut W) -> anyhow::Result<RunSummary> {
        while self.step(world)? {}

        Ok(RunSummary {
            end_time: self.now,
            events_fired: self.events_fired,
            stopped: self.stopped,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct Log {
        entries: Vec<(SimTime, &'static str)>,
    }

    fn record(
        label: &'static str,
    ) -> impl FnOnce(&mut Log, &mut Scheduler<Log>) -> anyhow::Result<()> + 'static {
        move |log, scheduler| {
            log.entries.push((scheduler.now(), label));
            Ok(())
        }
    }

    #[test]
    fn test_same_time_events_fire_in_insertion_order() {
        let mut scheduler = Scheduler::new();
        let mut log = Log::default();

        scheduler.schedule_at(SimTime::from_secs(7), record("late"));
        scheduler.schedule_at(SimTime::from_secs(5), record("x"));
        scheduler.schedule_at(SimTime::from_secs(2), record("early"));
        scheduler.schedule_at(SimTime::from_secs(5), record("y"));

        scheduler.run(&mut log).unwrap();

        let labels: Vec<_> = log.entries.iter().map(|(_, l)| *l).collect();
        assert_eq!(labels, vec!["early", "x", "y", "late"]);
    }

    #[test]
    fn test_actions_can_schedule_more_actions() {
        let mut scheduler = Scheduler::new();
        let mut log = Log::default();

        scheduler.schedule_at(SimTime::from_secs(1), |log: &mut Log, scheduler| {
            log.entries.push((scheduler.now(), "first"));
            scheduler.schedule_in(Duration::from_secs(2), record("nested"));
            // Same instant, goes after anything already pending for now
            scheduler.schedule_in(Duration::ZERO, record("immediate"));
            Ok(())
        });
        scheduler.schedule_at(SimTime::from_secs(1), record("sibling"));

        scheduler.run(&mut log).unwrap();

        assert_eq!(
            log.entries,
            vec![
                (SimTime::from_secs(1), "first"),
                (SimTime::from_secs(1), "sibling"),
                (SimTime::from_secs(1), "immediate"),
                (SimTime::from_secs(3), "nested"),
            ]
        );
    }

    #[test]
    fn test_scheduling_in_the_past_clamps_to_now() {
        let mut scheduler = Scheduler::new();
        let mut log = Log::default();

        scheduler.schedule_at(SimTime::from_secs(4), |_: &mut Log, scheduler| {
            scheduler.schedule_at(SimTime::from_secs(1), record("past"));
            Ok(())
        });

        scheduler.run(&mut log).unwrap();
        assert_eq!(log.entries, vec![(SimTime::from_secs(4), "past")]);
    }

    #[test]
    fn test_stop_prevents_later_events() {
        let mut scheduler = Scheduler::new();
        let mut log = Log::default();

        scheduler.schedule_at(SimTime::from_secs(3), record("before"));
        scheduler.stop_at(SimTime::from_secs(3));
        scheduler.schedule_at(SimTime::from_secs(3), record("after-marker"));
        scheduler.schedule_at(SimTime::from_secs(4), record("later"));

        let summary = scheduler.run(&mut log).unwrap();

        assert_eq!(log.entries, vec![(SimTime::from_secs(3), "before")]);
        assert!(summary.stopped);
        assert_eq!(summary.end_time, SimTime::from_secs(3));
        assert_eq!(summary.events_fired, 1);
        assert_eq!(scheduler.pending_events(), 2);
    }

    struct Ticker {
        interval: Duration,
    }

    impl RepeatingTask<Log> for Ticker {
        fn interval(&self) -> Duration {
            self.interval
        }

        fn fire(&mut self, log: &mut Log, now: SimTime) -> anyhow::Result<()> {
            log.entries.push((now, "tick"));
            Ok(())
        }
    }

    #[test]
    fn test_repeating_task_fires_until_stop() {
        let mut scheduler = Scheduler::new();
        let mut log = Log::default();

        scheduler.schedule_repeating(
            SimTime::from_millis(100),
            Ticker {
                interval: Duration::from_millis(100),
            },
        );
        scheduler.stop_at(SimTime::from_millis(450));
        scheduler.run(&mut log).unwrap();

        let times: Vec<_> = log.entries.iter().map(|(t, _)| *t).collect();
        assert_eq!(
            times,
            vec![
                SimTime::from_millis(100),
                SimTime::from_millis(200),
                SimTime::from_millis(300),
                SimTime::from_millis(400),
            ]
        );
    }

    #[test]
    #[should_panic(expected = "non-zero interval")]
    fn test_repeating_task_rejects_zero_interval() {
        let mut scheduler = Scheduler::<Log>::new();
        scheduler.schedule_repeating(
            SimTime::ZERO,
            Ticker {
                interval: Duration::ZERO,
            },
        );
    }

    #[test]
    fn test_failing_action_aborts_run() {
        let mut scheduler = Scheduler::new();
        let mut log = Log::default();

        scheduler.schedule_at(SimTime::from_secs(1), |_: &mut Log, _| {
            anyhow::bail!("route index out of range")
        });
        scheduler.schedule_at(SimTime::from_secs(2), record("never"));

        let err = scheduler.run(&mut log).unwrap_err();
        assert_eq!(err.to_string(), "route index out of range");
        assert!(log.entries.is_empty());
    }
}
