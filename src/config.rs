// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : swing_trader_rust - signal-driven margin swing trader in Rust
Module  : config.rs
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
use std::time::Duration;

use clap::{Parser, ValueEnum};
use dotenvy::dotenv;

use crate::error::ConfigError;
use crate::kraken::{KrakenConfig, DEFAULT_REST_URL};
use crate::pairs::PairRegistry;

/// Venue trading: paper (in-memory) atau Kraken asli
#[derive(Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum VenueMode {
    Paper,
    Kraken,
}

impl VenueMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VenueMode::Paper => "paper",
            VenueMode::Kraken => "kraken",
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(name = "swing_trader_rust", version, about = "Signal-driven swing trader")]
pub struct Args {
    // venue
    #[arg(long, env = "VENUE_MODE", value_enum, default_value = "paper")]
    pub venue_mode: VenueMode,
    #[arg(long, env = "KRAKEN_REST_URL", default_value = DEFAULT_REST_URL)]
    pub kraken_rest_url: String,
    #[arg(long, env = "KRAKEN_API_KEY", hide_env_values = true)]
    pub kraken_api_key: Option<String>,
    #[arg(long, env = "KRAKEN_API_SECRET", hide_env_values = true)]
    pub kraken_api_secret: Option<String>,
    /// Batas waktu per panggilan venue / feed (detik)
    #[arg(long, env = "VENUE_TIMEOUT_SECS", default_value_t = 10)]
    pub venue_timeout_secs: u64,

    // paper venue seed: "XXBT=1.5,ZUSD=1000" dan "XETHXXBT=0.051:0.050"
    #[arg(long, env = "PAPER_BALANCE", default_value = "")]
    pub paper_balance: String,
    #[arg(long, env = "PAPER_TICKERS", default_value = "")]
    pub paper_tickers: String,

    // signals
    #[arg(long, env = "SIGNAL_FEED_URL")]
    pub signal_feed_url: Option<String>,
    #[arg(long, env = "SIGNAL_FILE", default_value = "signals.json")]
    pub signal_file: String,
    #[arg(long, env = "SIGNAL_BATCH", default_value_t = 5)]
    pub signal_batch: usize,
    /// Start pertama (belum ada id diproses): seluruh batch pertama ditandai sudah diproses tanpa trading
    #[arg(long, env = "SKIP_BACKLOG", default_value_t = true, action = clap::ArgAction::Set)]
    pub skip_backlog: bool,

    // loop
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 20)]
    pub poll_interval_secs: u64,

    // files/metrics
    #[arg(long, env = "STATE_FILE", default_value = "app.data")]
    pub state_file: String,
    #[arg(long, env = "PAIRS_FILE")]
    pub pairs_file: Option<String>,
    #[arg(long, env = "RECORD_FILE")]
    pub record_file: Option<String>,
    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,
}

impl Args {
    pub fn poll_interval(&self) -> Duration { Duration::from_secs(self.poll_interval_secs.max(1)) }

    pub fn venue_timeout(&self) -> Duration { Duration::from_secs(self.venue_timeout_secs.max(1)) }

    pub fn kraken(&self) -> Result<KrakenConfig, ConfigError> {
        Ok(KrakenConfig {
            rest_url: self.kraken_rest_url.clone(),
            api_key: self.kraken_api_key.clone().ok_or(ConfigError::Missing("KRAKEN_API_KEY"))?,
            api_secret: self.kraken_api_secret.clone().ok_or(ConfigError::Missing("KRAKEN_API_SECRET"))?,
            timeout: self.venue_timeout(),
        })
    }

    pub fn registry(&self) -> Result<PairRegistry, ConfigError> {
        match &self.pairs_file {
            Some(path) => PairRegistry::load_file(path),
            None => PairRegistry::builtin(),
        }
    }
}

/// `A=1,B=2` -> [(A, 1.0), (B, 2.0)]
pub fn parse_balances(raw: &str) -> Result<Vec<(String, f64)>, ConfigError> {
    split_kv(raw, "PAPER_BALANCE")?
        .into_iter()
        .map(|(k, v)| {
            let amount = v
                .parse::<f64>()
                .map_err(|e| ConfigError::Invalid { key: "PAPER_BALANCE", reason: format!("{k}: {e}") })?;
            Ok((k, amount))
        })
        .collect()
}

/// `SYM=ask:bid,...` -> [(SYM, ask, bid)]
pub fn parse_tickers(raw: &str) -> Result<Vec<(String, f64, f64)>, ConfigError> {
    split_kv(raw, "PAPER_TICKERS")?
        .into_iter()
        .map(|(k, v)| {
            let bad = |reason: String| ConfigError::Invalid { key: "PAPER_TICKERS", reason: format!("{k}: {reason}") };
            let (ask, bid) = v.split_once(':').ok_or_else(|| bad("expected ask:bid".into()))?;
            let ask = ask.trim().parse::<f64>().map_err(|e| bad(e.to_string()))?;
            let bid = bid.trim().parse::<f64>().map_err(|e| bad(e.to_string()))?;
            Ok((k, ask, bid))
        })
        .collect()
}

fn split_kv(raw: &str, key: &'static str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|item| {
            item.split_once('=')
                .map(|(k, v)| (k.trim().to_ascii_uppercase(), v.trim().to_string()))
                .ok_or_else(|| ConfigError::Invalid { key, reason: format!("expected NAME=value, got {item:?}") })
        })
        .collect()
}

pub fn load() -> (Args, Result<PairRegistry, ConfigError>) {
    // Pastikan .env dibaca sebelum clap membaca env
    let _ = dotenv();
    let args = Args::parse();
    let registry = args.registry();
    (args, registry)
}
