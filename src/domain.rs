// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side { Buy, Sell }

impl Side {
    pub fn opposite(&self) -> Side { match self { Side::Buy => Side::Sell, Side::Sell => Side::Buy } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind { Market }

impl OrderKind {
    pub fn as_str(&self) -> &'static str { match self { OrderKind::Market => "market" } }
}

/// Raw item from the signal feed, before parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSignal { pub id: String, pub text: String }

/// A parsed, actionable trade instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal { pub id: String, pub side: Side, pub pair: String }

// ---- Venue snapshots (validated at the gateway boundary) ----
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot { pub amounts: std::collections::HashMap<String, f64> }

impl BalanceSnapshot {
    /// Amount held in `currency`, zero when absent.
    pub fn available(&self, currency: &str) -> f64 { self.amounts.get(currency).copied().unwrap_or(0.0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickerSnapshot { pub ask: f64, pub bid: f64 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord { pub symbol: String, pub side: Side, pub volume: f64, pub origin_txid: String }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSubmitResult { pub txid: String, pub descr: String }

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionFilter { All, Symbol(String), OriginTxid(String) }

/// Order the engine has submitted and is waiting to see filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub txid: String,
    pub pair: String,
    pub side: Side,
    /// Net of any volume that only closed an opposing position.
    pub requested_volume: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum ExecutionResult {
    Submitted { txid: String, volume: f64 },
    NoOp,
    Failed(EngineError),
}

/// Outcome of reconciling one pending order against the venue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum FillStatus {
    Open,
    Fulfilled { observed: f64 },
    PartiallyFulfilled { observed: f64, requested: f64 },
    Disappeared,
}

impl FillStatus {
    pub fn is_terminal(&self) -> bool { matches!(self, FillStatus::Fulfilled { .. } | FillStatus::Disappeared) }
}

// ---- Journal events (see recorder.rs) ----
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    SignalSeen { id: String, text: String },
    OrderSubmitted { txid: String, pair: String, side: Side, volume: f64, requested_volume: f64 },
    OrderCanceled { txid: String, pair: String },
    Reconciled { txid: String, pair: String, outcome: FillStatus },
    Note { msg: String },
}
