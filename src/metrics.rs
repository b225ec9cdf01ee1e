// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Signal intake --------
pub static SIGNALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("signals_total", "signals handled (label: outcome)"),
        &["outcome"],
    )
    .unwrap()
});

// -------- Execution --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("orders_submitted_total", "orders accepted by venue"), &["pair", "side"]).unwrap()
});

pub static CONFLICTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("conflicts_total", "in-flight orders met by a new signal (label: result)"),
        &["result"],
    )
    .unwrap()
});

pub static VENUE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("venue_errors_total", "failed venue calls"), &["op", "kind"]).unwrap()
});

// -------- Reconciliation --------
pub static RECONCILED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("reconciled_total", "pending order outcomes per tick (label: outcome)"),
        &["outcome"],
    )
    .unwrap()
});

pub static TICKS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("reconcile_ticks_total", "reconciliation ticks"), &["result"]).unwrap()
});

pub static PENDING: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("pending_orders", "orders awaiting reconciliation").unwrap());

pub static CONFIG_PAIRS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("config_pairs", "configured pairs").unwrap());

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(SIGNALS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(CONFLICTS.clone())),
        REGISTRY.register(Box::new(VENUE_ERRORS.clone())),
        REGISTRY.register(Box::new(RECONCILED.clone())),
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(PENDING.clone())),
        REGISTRY.register(Box::new(CONFIG_PAIRS.clone())),
    ] {
        if let Err(e) = m {
            tracing::warn!(?e, "metric registration failed");
        }
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(%addr, ?e, "metrics bind failed, metrics disabled");
                return;
            }
        };
        tracing::info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(?e, "metrics accept error"),
            }
        }
    });
}
