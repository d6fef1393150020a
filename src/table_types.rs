use tabled::Tabled;

use crate::psu::Report;

#[derive(Tabled)]
pub struct PsuRow {
    #[tabled(rename = "PSU")]
    pub index: u8,
    pub uptime: String,
    pub status: &'static str,
    pub temperature: String,
    pub fans: String,
    pub voltage: String,
    pub current: String,
    pub power: String,
}

impl From<&Report> for PsuRow {
    fn from(report: &Report) -> Self {
        let uptime = humantime::format_duration(std::time::Duration::from_secs(
            report.elapsed_secs(),
        ))
        .to_string();

        match report.telemetry() {
            None => PsuRow {
                index: report.index(),
                uptime,
                status: "OFFLINE",
                temperature: "-".to_string(),
                fans: "-".to_string(),
                voltage: "-".to_string(),
                current: "-".to_string(),
                power: "-".to_string(),
            },
            Some(t) => PsuRow {
                index: report.index(),
                uptime,
                status: if t.dc_good { "DC OK" } else { "FAULT" },
                temperature: format!("{}C", t.temperature),
                fans: format!("{}/{} rpm", t.fan1_rpm, t.fan2_rpm),
                voltage: format!("{:.0}V", t.input_voltage),
                current: format!("{:.2}A", t.input_current),
                power: format!("{}W", t.input_power),
            },
        }
    }
}
