//! Prometheus view of the latest PSU readings.
//!
//! Online reports update the gauges and offline reports remove them. A PSU
//! that has not reported at all for longer than the staleness timeout has
//! its series removed too, so scrapes never show frozen values for a unit
//! that went away.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use log::{error, info};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;

use crate::psu::{Report, Telemetry};
use crate::report::ReportSink;

const CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

type FloatGauge = Gauge<f64, AtomicU64>;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PsuLabels {
    pub psu_id: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FanLabels {
    pub psu_id: String,
    pub fan_index: String,
}

pub struct Metrics {
    registry: Registry,
    temperature: Family<PsuLabels, FloatGauge>,
    fan_speed: Family<FanLabels, FloatGauge>,
    voltage: Family<PsuLabels, FloatGauge>,
    current: Family<PsuLabels, FloatGauge>,
    power: Family<PsuLabels, FloatGauge>,
    status: Family<PsuLabels, FloatGauge>,
    last_seen: Mutex<HashMap<u8, Instant>>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let temperature = Family::<PsuLabels, FloatGauge>::default();
        let fan_speed = Family::<FanLabels, FloatGauge>::default();
        let voltage = Family::<PsuLabels, FloatGauge>::default();
        let current = Family::<PsuLabels, FloatGauge>::default();
        let power = Family::<PsuLabels, FloatGauge>::default();
        let status = Family::<PsuLabels, FloatGauge>::default();

        registry.register("psu_temperature_celsius", "PSU Temperature", temperature.clone());
        registry.register("psu_fan_speed_rpm", "PSU Fan Speed", fan_speed.clone());
        registry.register("psu_input_voltage_volts", "Input Voltage", voltage.clone());
        registry.register("psu_input_current_amps", "Input Current", current.clone());
        registry.register("psu_input_power_watts", "Input Power", power.clone());
        registry.register("psu_status_ok", "PSU Status (1=OK, 0=Fail)", status.clone());

        Self {
            registry,
            temperature,
            fan_speed,
            voltage,
            current,
            power,
            status,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn observe(&self, index: u8, t: &Telemetry, now: Instant) {
        let psu = PsuLabels { psu_id: index.to_string() };
        self.temperature.get_or_create(&psu).set(f64::from(t.temperature));
        self.fan_speed
            .get_or_create(&fan_labels(index, 1))
            .set(f64::from(t.fan1_rpm));
        self.fan_speed
            .get_or_create(&fan_labels(index, 2))
            .set(f64::from(t.fan2_rpm));
        self.voltage.get_or_create(&psu).set(f64::from(t.input_voltage));
        self.current.get_or_create(&psu).set(f64::from(t.input_current));
        self.power.get_or_create(&psu).set(f64::from(t.input_power));
        self.status
            .get_or_create(&psu)
            .set(if t.dc_good { 1.0 } else { 0.0 });

        if let Ok(mut seen) = self.last_seen.lock() {
            seen.insert(index, now);
        }
    }

    /// Drop the series of every PSU not seen within `timeout` of `now`.
    /// Returns the indexes that were cleared.
    pub fn remove_stale(&self, now: Instant, timeout: Duration) -> Vec<u8> {
        let stale: Vec<u8> = match self.last_seen.lock() {
            Ok(mut seen) => {
                let stale: Vec<u8> = seen
                    .iter()
                    .filter(|(_, at)| now.saturating_duration_since(**at) > timeout)
                    .map(|(&index, _)| index)
                    .collect();
                for index in &stale {
                    seen.remove(index);
                }
                stale
            }
            Err(_) => return Vec::new(),
        };

        for &index in &stale {
            self.clear(index);
            info!("Cleared metrics for PSU #{}", index);
        }
        stale
    }

    /// Remove every series of PSU `index` and forget when it was last seen.
    pub fn forget(&self, index: u8) {
        if let Ok(mut seen) = self.last_seen.lock() {
            seen.remove(&index);
        }
        self.clear(index);
    }

    fn clear(&self, index: u8) {
        let psu = PsuLabels { psu_id: index.to_string() };
        self.temperature.remove(&psu);
        self.fan_speed.remove(&fan_labels(index, 1));
        self.fan_speed.remove(&fan_labels(index, 2));
        self.voltage.remove(&psu);
        self.current.remove(&psu);
        self.power.remove(&psu);
        self.status.remove(&psu);
    }

    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn fan_labels(index: u8, fan: u8) -> FanLabels {
    FanLabels {
        psu_id: index.to_string(),
        fan_index: fan.to_string(),
    }
}

/// Feeds polling reports into [`Metrics`].
pub struct MetricsSink {
    metrics: Arc<Metrics>,
}

impl MetricsSink {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl ReportSink for MetricsSink {
    fn emit(&mut self, report: &Report) {
        match report.telemetry() {
            Some(t) => self.metrics.observe(report.index(), t, Instant::now()),
            None => self.metrics.forget(report.index()),
        }
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!("Can't encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

pub async fn bind(listen: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(listen).await?;
    info!("Serving metrics on http://{}/metrics", listener.local_addr()?);
    Ok(listener)
}

/// Serve `/metrics` until the task is dropped.
pub async fn serve(listener: TcpListener, metrics: Arc<Metrics>) {
    if let Err(e) = axum::serve(listener, router(metrics)).await {
        error!("Metrics server stopped: {}", e);
    }
}

/// Periodically remove series of PSUs that stopped reporting.
pub async fn sweep_stale(metrics: Arc<Metrics>, every: Duration, timeout: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        metrics.remove_stale(Instant::now(), timeout);
    }
}
