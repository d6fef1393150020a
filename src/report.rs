use std::io::Write;

use clap::ValueEnum;
use log::warn;
use serde::{Deserialize, Serialize};
use tabled::settings::object::Rows;
use tabled::settings::{Alignment, Modify, Panel, Style};
use tabled::Table;

use crate::psu::Report;
use crate::table_types::PsuRow;

/// Consumer of per-device reports, fed once per device per polling pass.
pub trait ReportSink {
    fn emit(&mut self, report: &Report);

    /// Called after every device of a pass has been emitted.
    fn end_pass(&mut self) {}
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// `[12s] PSU #1: 45C | ...` lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
    /// One table per polling pass
    Table,
}

/// Build the sink for `format` writing to `out`.
pub fn sink_for<W: Write + Send + 'static>(
    format: ReportFormat,
    out: W,
) -> Box<dyn ReportSink + Send> {
    match format {
        ReportFormat::Text | ReportFormat::Json => Box::new(LineSink::new(out, format)),
        ReportFormat::Table => Box::new(TableSink::new(out)),
    }
}

#[derive(Serialize)]
struct JsonReport {
    id: u8,
    uptime: u64,
    online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temp: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fan1: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fan2: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    v_in: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    i_in: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    p_in: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ok: Option<u8>,
}

impl From<&Report> for JsonReport {
    fn from(report: &Report) -> Self {
        let t = report.telemetry();
        JsonReport {
            id: report.index(),
            uptime: report.elapsed_secs(),
            online: t.is_some(),
            temp: t.map(|t| t.temperature),
            fan1: t.map(|t| t.fan1_rpm),
            fan2: t.map(|t| t.fan2_rpm),
            v_in: t.map(|t| t.input_voltage),
            i_in: t.map(|t| t.input_current),
            p_in: t.map(|t| t.input_power),
            ok: t.map(|t| u8::from(t.dc_good)),
        }
    }
}

/// Writes one line per report, flushed immediately.
pub struct LineSink<W: Write> {
    out: W,
    format: ReportFormat,
}

impl<W: Write> LineSink<W> {
    pub fn new(out: W, format: ReportFormat) -> Self {
        Self { out, format }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    fn render(&self, report: &Report) -> String {
        match self.format {
            ReportFormat::Json => match serde_json::to_string(&JsonReport::from(report)) {
                Ok(line) => line,
                Err(e) => {
                    warn!("Can't encode report for PSU #{}: {}", report.index(), e);
                    report.to_string()
                }
            },
            _ => report.to_string(),
        }
    }
}

impl<W: Write> ReportSink for LineSink<W> {
    fn emit(&mut self, report: &Report) {
        let line = self.render(report);
        if let Err(e) = writeln!(self.out, "{}", line).and_then(|_| self.out.flush()) {
            warn!("Failed to write report: {}", e);
        }
    }
}

/// Collects a pass worth of reports and prints them as one table.
pub struct TableSink<W: Write> {
    out: W,
    rows: Vec<PsuRow>,
}

impl<W: Write> TableSink<W> {
    pub fn new(out: W) -> Self {
        Self { out, rows: Vec::new() }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ReportSink for TableSink<W> {
    fn emit(&mut self, report: &Report) {
        self.rows.push(PsuRow::from(report));
    }

    fn end_pass(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        let table = Table::builder(&self.rows)
            .build()
            .with(Panel::header("PSU readings"))
            .with(Style::sharp())
            .with(Modify::new(Rows::first()).with(Alignment::center()))
            .to_string();
        self.rows.clear();

        if let Err(e) = writeln!(self.out, "{}", table).and_then(|_| self.out.flush()) {
            warn!("Failed to write report table: {}", e);
        }
    }
}
