// ===============================
// src/main.rs
// ===============================
/*
 # paper trading dengan file sinyal lokal
 VENUE_MODE=paper PAPER_BALANCE="XETH=4,XXBT=0.5" SIGNAL_FILE=signals.json cargo run --release

 # cek metrik
curl -s localhost:9898/metrics | grep '^signals_total'
curl -s localhost:9898/metrics | egrep '^(pending_orders|reconciled_total)'

*/
/*
=============================================================================
Project : swing_trader_rust - signal-driven margin swing trader in Rust
Module  : main.rs
Version : 0.5.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
License : MIT (see LICENSE)

Summary : Polls a signal feed, turns buy/sell calls into leveraged market
          orders (swinging any opposite position), and reconciles pending
          orders against the venue until they fill or vanish. Exposes
          Prometheus metrics and records JSONL events.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
mod domain;
mod error;
mod config;
mod metrics;
mod recorder;
mod pairs;
mod state;
mod venue;            // port + paper venue + timeout decorator
mod kraken;           // Kraken REST (signed private endpoints)
mod sizing;
mod conflict;
mod executor;
mod reconcile;
mod signals;
mod engine;

use std::process::ExitCode;
use std::sync::Arc;

use tokio::{
    select,
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::VenueMode;
use crate::domain::Event;
use crate::engine::Engine;
use crate::error::{EngineError, StateError};
use crate::signals::{FileSignalSource, HttpSignalSource, SignalSource};
use crate::state::{JsonFileStore, PersistentState};
use crate::venue::{PaperVenue, TimeoutVenue, VenueGateway};

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal, shutting down");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), EngineError> {
    // ---- Load config & pairs ----
    let (args, registry) = config::load();
    let registry = registry?;

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);
    metrics::CONFIG_PAIRS.set(registry.names().len() as i64);

    info!(
        venue_mode = args.venue_mode.as_str(),
        pairs = ?registry.names(),
        state_file = %args.state_file,
        feed = args.signal_feed_url.as_deref().unwrap_or(&args.signal_file),
        poll_secs = args.poll_interval_secs,
        "startup config"
    );

    // ---- Venue ----
    let venue: Arc<dyn VenueGateway> = match args.venue_mode {
        VenueMode::Paper => {
            let paper = PaperVenue::default();
            for (cur, amount) in config::parse_balances(&args.paper_balance)? {
                paper.set_balance(&cur, amount);
            }
            for (sym, ask, bid) in config::parse_tickers(&args.paper_tickers)? {
                paper.set_ticker(&sym, ask, bid);
            }
            Arc::new(TimeoutVenue::new(paper, args.venue_timeout()))
        }
        VenueMode::Kraken => {
            let client = kraken::KrakenClient::new(args.kraken()?)?;
            Arc::new(TimeoutVenue::new(client, args.venue_timeout()))
        }
    };

    // ---- Signal source ----
    let source: Arc<dyn SignalSource> = match &args.signal_feed_url {
        Some(url) => Arc::new(
            HttpSignalSource::new(url.clone(), args.signal_batch, args.venue_timeout())
                .map_err(|e| config_invalid("SIGNAL_FEED_URL", e))?,
        ),
        None => Arc::new(FileSignalSource::new(&args.signal_file, args.signal_batch)),
    };

    // ---- State (corrupt file = stop) ----
    let state = PersistentState::open(Box::new(JsonFileStore::new(&args.state_file)))?;
    metrics::PENDING.set(state.get().pending_orders.len() as i64);

    let mut engine = Engine::new(venue, registry, state).skip_backlog(args.skip_backlog);

    // ---- Recorder (optional) ----
    if let Some(path) = args.record_file.clone() {
        let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
        tokio::spawn(recorder::run(rec_rx, path));
        engine = engine.with_journal(rec_tx);
    }

    let engine = Arc::new(Mutex::new(engine));
    let period = args.poll_interval();

    // ---- Intake & rekonsiliasi: dua task, engine dikunci selama satu siklus ----
    let intake: JoinHandle<Result<(), StateError>> = tokio::spawn(intake_loop(engine.clone(), source, period));
    let reconcile: JoinHandle<Result<(), StateError>> = tokio::spawn(reconcile_loop(engine.clone(), period));

    select! {
        r = intake => finish("intake", r),
        r = reconcile => finish("reconcile", r),
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, stopping");
            Ok(())
        }
    }
}

async fn intake_loop(engine: Arc<Mutex<Engine>>, source: Arc<dyn SignalSource>, period: Duration) -> Result<(), StateError> {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let mut eng = engine.lock().await;
        let report = eng.process_signals(source.as_ref()).await?;
        if !report.handled.is_empty() {
            info!(handled = report.handled.len(), "intake cycle done");
        }
    }
}

async fn reconcile_loop(engine: Arc<Mutex<Engine>>, period: Duration) -> Result<(), StateError> {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let mut eng = engine.lock().await;
        eng.reconcile().await?;
    }
}

fn finish(task: &str, r: Result<Result<(), StateError>, tokio::task::JoinError>) -> Result<(), EngineError> {
    match r {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(task, error = %e, "state could not be persisted");
            Err(e.into())
        }
        Err(e) => {
            warn!(task, ?e, "task ended unexpectedly");
            Err(StateError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())).into())
        }
    }
}

fn config_invalid(key: &'static str, e: impl std::fmt::Display) -> error::ConfigError {
    error::ConfigError::Invalid { key, reason: e.to_string() }
}
