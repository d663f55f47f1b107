// ===============================
// src/metrics.rs
// ===============================
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use tracing::{error, info};

use crate::domain::{Candle, Order, Position};

/// Receives run measurements. Every value carries the candle or symbol it
/// belongs to, nothing is read from ambient context.
pub trait MetricsSink: Send + Sync {
    fn record_tick(&self, _tick: &Candle) {}
    fn record_bucket(&self, _bucket: &Candle) {}
    fn record_cash(&self, _at: &Candle, _cash: f64) {}
    fn record_fill(&self, _order: &Order, _qty: i64, _price: f64) {}
    fn record_position(&self, _position: &Position) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;
impl MetricsSink for NoopMetrics {}

pub fn noop() -> Arc<dyn MetricsSink> { Arc::new(NoopMetrics) }

/// Prometheus-backed sink with its own registry.
pub struct PromMetrics {
    registry: Registry,
    ticks: IntCounterVec,
    buckets: IntCounterVec,
    candle_close: GaugeVec,
    fills: IntCounterVec,
    cash: Gauge,
    position: GaugeVec,
}

impl PromMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let ticks = IntCounterVec::new(
            Opts::new("ticks_total_by_symbol", "raw ticks matched against the book"),
            &["symbol"],
        )?;
        let buckets = IntCounterVec::new(
            Opts::new("buckets_total_by_symbol", "completed buckets handed to the strategy"),
            &["symbol"],
        )?;
        let candle_close = GaugeVec::new(
            Opts::new("candle_close", "close of the latest completed bucket"),
            &["symbol"],
        )?;
        let fills = IntCounterVec::new(
            Opts::new("fills_total", "order fills (labels: symbol, side)"),
            &["symbol", "side"],
        )?;
        let cash = Gauge::new("cash", "available cash")?;
        let position = GaugeVec::new(
            Opts::new("position", "net position size per symbol"),
            &["symbol"],
        )?;

        registry.register(Box::new(ticks.clone()))?;
        registry.register(Box::new(buckets.clone()))?;
        registry.register(Box::new(candle_close.clone()))?;
        registry.register(Box::new(fills.clone()))?;
        registry.register(Box::new(cash.clone()))?;
        registry.register(Box::new(position.clone()))?;

        Ok(Self { registry, ticks, buckets, candle_close, fills, cash, position })
    }

    /// Prometheus text exposition of everything recorded so far.
    pub fn encode(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
            buf.extend_from_slice(b"# no metrics\n");
        }
        buf
    }
}

impl MetricsSink for PromMetrics {
    fn record_tick(&self, tick: &Candle) {
        self.ticks.with_label_values(&[tick.symbol.as_str()]).inc();
    }

    fn record_bucket(&self, bucket: &Candle) {
        let sym = bucket.symbol.as_str();
        self.buckets.with_label_values(&[sym]).inc();
        self.candle_close.with_label_values(&[sym]).set(bucket.close);
    }

    fn record_cash(&self, _at: &Candle, cash: f64) {
        self.cash.set(cash);
    }

    fn record_fill(&self, order: &Order, _qty: i64, _price: f64) {
        self.fills.with_label_values(&[order.symbol.as_str(), order.side.as_str()]).inc();
    }

    fn record_position(&self, position: &Position) {
        self.position.with_label_values(&[position.symbol.as_str()]).set(position.size as f64);
    }
}

// Serve one HTTP request (GET / or /metrics)
fn handle_client(mut stream: TcpStream, metrics: &PromMetrics) {
    // consume headers, no parsing
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = metrics.encode();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

/// Metrics endpoint on a dedicated OS thread, outside the Tokio runtime.
pub fn serve_metrics(port: u16, metrics: Arc<PromMetrics>) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)?;
    info!(%addr, "metrics listening (GET / or /metrics)");

    thread::spawn(move || {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream, &metrics),
                Err(e) => error!(?e, "metrics accept error"),
            }
        }
    });
    Ok(())
}
