// ===============================
// src/signals.rs
// ===============================
//
// Sumber sinyal + parser teks:
// - HttpSignalSource : GET feed JSON `[{"id": "...", "text": "..."}]`, terbaru dulu
// - FileSignalSource : file JSON dengan format sama (paper trading / replay)
// Parser: "short" -> sell, "long" -> buy; pair dicari dari signal_symbol di registry.
//
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{RawSignal, Side, Signal};
use crate::error::SourceError;
use crate::pairs::PairRegistry;

#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Most recent first, at most the configured batch size.
    async fn fetch_recent(&self) -> Result<Vec<RawSignal>, SourceError>;
}

pub fn parse_side(text: &str) -> Option<Side> {
    let lower = text.to_lowercase();
    if lower.contains("short") {
        Some(Side::Sell)
    } else if lower.contains("long") {
        Some(Side::Buy)
    } else {
        None
    }
}

/// Turns feed text into a tradable signal, or `None` if it names no
/// direction or no configured pair.
pub fn parse_signal(raw: &RawSignal, registry: &PairRegistry) -> Option<Signal> {
    let side = parse_side(&raw.text)?;
    let pair = registry.match_text(&raw.text)?;
    Some(Signal { id: raw.id.clone(), side, pair: pair.to_string() })
}

pub struct HttpSignalSource {
    http: reqwest::Client,
    url: String,
    limit: usize,
}

impl HttpSignalSource {
    pub fn new(url: String, limit: usize, timeout: Duration) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, url, limit })
    }
}

#[async_trait]
impl SignalSource for HttpSignalSource {
    async fn fetch_recent(&self) -> Result<Vec<RawSignal>, SourceError> {
        let rsp = self.http.get(&self.url).send().await?.error_for_status()?;
        let mut items: Vec<RawSignal> = rsp.json().await?;
        items.truncate(self.limit);
        debug!(url = %self.url, n = items.len(), "signal feed polled");
        Ok(items)
    }
}

pub struct FileSignalSource {
    path: PathBuf,
    limit: usize,
}

impl FileSignalSource {
    pub fn new(path: impl Into<PathBuf>, limit: usize) -> Self { Self { path: path.into(), limit } }
}

#[async_trait]
impl SignalSource for FileSignalSource {
    async fn fetch_recent(&self) -> Result<Vec<RawSignal>, SourceError> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let mut items: Vec<RawSignal> = serde_json::from_str(&raw)?;
        items.truncate(self.limit);
        Ok(items)
    }
}
