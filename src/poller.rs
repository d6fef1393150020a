use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::bus::Bus;
use crate::psu::PsuMonitor;
use crate::report::ReportSink;

/// Upper bound on one idle sleep, so a cleared run flag is noticed quickly.
const MAX_IDLE: Duration = Duration::from_millis(100);

/// Time since the poller started.
pub trait Clock {
    fn elapsed(&self) -> Duration;
}

pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Refreshes and reports every monitor, in order, once per interval.
///
/// The loop owns the bus, so passes and the transactions inside them never
/// overlap.
pub struct PollingLoop<B: Bus, C: Clock> {
    bus: B,
    monitors: Vec<PsuMonitor>,
    sinks: Vec<Box<dyn ReportSink + Send>>,
    clock: C,
    interval: Duration,
    last_tick: Duration,
}

impl<B: Bus, C: Clock> PollingLoop<B, C> {
    pub fn new(bus: B, monitors: Vec<PsuMonitor>, clock: C, interval: Duration) -> Self {
        Self {
            bus,
            monitors,
            sinks: Vec::new(),
            clock,
            interval,
            last_tick: Duration::ZERO,
        }
    }

    pub fn add_sink(&mut self, sink: Box<dyn ReportSink + Send>) {
        self.sinks.push(sink);
    }

    #[cfg(test)]
    pub fn monitors(&self) -> &[PsuMonitor] {
        &self.monitors
    }

    #[cfg(test)]
    pub fn bus(&self) -> &B {
        &self.bus
    }

    #[cfg(test)]
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Time left until the next pass is due.
    pub fn time_until_due(&self) -> Duration {
        let since = self.clock.elapsed().saturating_sub(self.last_tick);
        self.interval.saturating_sub(since)
    }

    /// Run a pass if the interval has elapsed since the previous one.
    /// Returns whether a pass ran.
    pub fn poll(&mut self) -> bool {
        let now = self.clock.elapsed();
        if now.saturating_sub(self.last_tick) < self.interval {
            return false;
        }
        self.last_tick = now;
        self.run_pass(now);
        true
    }

    /// Refresh then report each monitor, then close the pass on every sink.
    pub fn run_pass(&mut self, now: Duration) {
        trace!("Polling pass at {:?}", now);
        let mut online = 0;
        for monitor in &mut self.monitors {
            if monitor.refresh(&mut self.bus) {
                online += 1;
            }
            let report = monitor.report(now);
            for sink in &mut self.sinks {
                sink.emit(&report);
            }
        }
        for sink in &mut self.sinks {
            sink.end_pass();
        }
        debug!("Pass done: {}/{} PSUs online", online, self.monitors.len());
    }

    /// Poll until `running` is cleared.
    pub fn run(&mut self, running: &AtomicBool) {
        while running.load(Ordering::Relaxed) {
            self.poll();
            std::thread::sleep(self.time_until_due().min(MAX_IDLE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::sim::{BusEvent, SimulatedBus, SimulatedPsu};
    use crate::test_utils::{scenario_a_psu, CaptureSink, ManualClock};

    fn two_psu_loop(
        bus: SimulatedBus,
    ) -> (PollingLoop<SimulatedBus, ManualClock>, ManualClock, CaptureSink) {
        let clock = ManualClock::default();
        let sink = CaptureSink::default();
        let monitors = vec![PsuMonitor::new(1, 0x38), PsuMonitor::new(2, 0x39)];
        let mut poller = PollingLoop::new(bus, monitors, clock.clone(), Duration::from_secs(2));
        poller.add_sink(Box::new(sink.clone()));
        (poller, clock, sink)
    }

    #[test]
    fn waits_for_interval() {
        let (mut poller, clock, sink) = two_psu_loop(SimulatedBus::new());

        assert!(!poller.poll());
        clock.advance(Duration::from_millis(1_999));
        assert!(!poller.poll());
        assert_eq!(poller.time_until_due(), Duration::from_millis(1));

        clock.advance(Duration::from_millis(1));
        assert!(poller.poll());
        assert!(!poller.poll());
        assert_eq!(sink.pass_count(), 1);

        clock.advance(Duration::from_secs(2));
        assert!(poller.poll());
        assert_eq!(sink.pass_count(), 2);
    }

    #[test]
    fn every_monitor_reports_every_pass() {
        let bus = SimulatedBus::new().with_device(0x39, scenario_a_psu());
        let (mut poller, clock, sink) = two_psu_loop(bus);

        clock.advance(Duration::from_secs(2));
        poller.poll();
        clock.advance(Duration::from_secs(2));
        poller.poll();

        assert_eq!(
            sink.lines(),
            vec![
                "[2s] PSU #1: --- OFFLINE ---",
                "[2s] PSU #2: 45C | 11450/0 rpm | DC OK | 12V / 2.00A / 100W",
                "[4s] PSU #1: --- OFFLINE ---",
                "[4s] PSU #2: 45C | 11450/0 rpm | DC OK | 12V / 2.00A / 100W",
            ]
        );
    }

    #[test]
    fn transactions_never_interleave() {
        let bus = SimulatedBus::new()
            .with_device(0x38, SimulatedPsu::healthy(40, 350))
            .with_device(0x39, SimulatedPsu::healthy(42, 360));
        let (mut poller, _clock, _sink) = two_psu_loop(bus);

        poller.run_pass(Duration::ZERO);

        let addresses: Vec<u8> = poller.bus().events().iter().map(BusEvent::address).collect();
        let first_b = addresses.iter().position(|&a| a == 0x39).unwrap();
        assert!(addresses[..first_b].iter().all(|&a| a == 0x38));
        assert!(addresses[first_b..].iter().all(|&a| a == 0x39));

        // Every opened transaction is closed before the next one opens.
        let mut open = false;
        for event in poller.bus().events() {
            match event {
                BusEvent::Begin(_) => {
                    assert!(!open);
                    open = true;
                }
                BusEvent::End { .. } => open = false,
                BusEvent::Request { .. } => assert!(!open),
            }
        }
    }

    #[test]
    fn device_failure_does_not_skip_others() {
        let bus = SimulatedBus::new()
            .with_device(0x38, scenario_a_psu())
            .with_device(0x39, scenario_a_psu());
        let (mut poller, _clock, sink) = two_psu_loop(bus);

        poller.bus_mut().device_mut(0x38).unwrap().set_present(false);
        poller.run_pass(Duration::from_secs(10));

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "[10s] PSU #1: --- OFFLINE ---");
        assert!(lines[1].starts_with("[10s] PSU #2: 45C"));
        assert!(!poller.monitors()[0].is_online());
        assert!(poller.monitors()[1].is_online());
    }

    /// Clears the run flag once `passes` passes have ended.
    struct StopAfter {
        passes: usize,
        running: Arc<AtomicBool>,
        inner: CaptureSink,
    }

    impl ReportSink for StopAfter {
        fn emit(&mut self, report: &crate::psu::Report) {
            self.inner.emit(report);
        }

        fn end_pass(&mut self) {
            self.inner.end_pass();
            if self.inner.pass_count() >= self.passes {
                self.running.store(false, Ordering::Relaxed);
            }
        }
    }

    #[test]
    fn run_polls_until_flag_is_cleared() {
        let bus = SimulatedBus::new().with_device(0x38, scenario_a_psu());
        let monitors = vec![PsuMonitor::new(1, 0x38)];
        let mut poller =
            PollingLoop::new(bus, monitors, MonotonicClock::new(), Duration::from_millis(5));
        let running = Arc::new(AtomicBool::new(true));
        let capture = CaptureSink::default();
        poller.add_sink(Box::new(StopAfter {
            passes: 3,
            running: running.clone(),
            inner: capture.clone(),
        }));

        poller.run(&running);

        assert!(!running.load(Ordering::Relaxed));
        assert_eq!(capture.pass_count(), 3);
        let reports = capture.reports.lock().unwrap();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.telemetry().is_some()));
        // Per pass: the probe, six byte reads and both halves of the power word.
        assert_eq!(poller.bus().selected_registers(0x38).len(), 3 * 9);
    }

    #[test]
    fn run_stops_when_flag_is_cleared() {
        let (mut poller, _clock, sink) = two_psu_loop(SimulatedBus::new());
        let running = AtomicBool::new(false);
        poller.run(&running);
        assert_eq!(sink.pass_count(), 0);
    }
}
