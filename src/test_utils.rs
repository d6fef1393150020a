//! Shared fixtures for unit tests.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::poller::Clock;
use crate::psu::{regs, Report};
use crate::report::ReportSink;
use crate::sim::SimulatedPsu;

/// 45 C, DC good, fans at 100 and 0 ticks, 12 V, 2 A, 100 W.
pub fn scenario_a_psu() -> SimulatedPsu {
    let mut psu = SimulatedPsu::new();
    psu.set_register(regs::TEMPERATURE, 45);
    psu.set_register(regs::POWER_STATUS, 0x01);
    psu.set_register(regs::FAN1_SPEED, 100);
    psu.set_register(regs::FAN2_SPEED, 0);
    psu.set_register(regs::INPUT_VOLTAGE, 12);
    psu.set_register(regs::AC_CURRENT, 32);
    psu.set_register(regs::INPUT_POWER_L, 0x64);
    psu.set_register(regs::INPUT_POWER_H, 0x00);
    psu
}

/// Clock advanced by hand.
#[derive(Clone, Default)]
pub struct ManualClock(Rc<Cell<Duration>>);

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        self.0.set(self.0.get() + by);
    }
}

impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        self.0.get()
    }
}

/// Sink that records what it is given. Clones share the record.
#[derive(Clone, Default)]
pub struct CaptureSink {
    pub reports: Arc<Mutex<Vec<Report>>>,
    pub passes: Arc<Mutex<usize>>,
}

impl CaptureSink {
    pub fn lines(&self) -> Vec<String> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.to_string())
            .collect()
    }

    pub fn pass_count(&self) -> usize {
        *self.passes.lock().unwrap()
    }
}

impl ReportSink for CaptureSink {
    fn emit(&mut self, report: &Report) {
        self.reports.lock().unwrap().push(*report);
    }

    fn end_pass(&mut self) {
        *self.passes.lock().unwrap() += 1;
    }
}
