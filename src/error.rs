// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

/// Failure of a single venue call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VenueError {
    /// Network failure, timeout, or a response we could not decode.
    #[error("venue transient: {0}")]
    Transient(String),
    /// Business error reported by the exchange.
    #[error("venue rejected: {0}")]
    Rejected(String),
}

impl VenueError {
    pub fn label(&self) -> &'static str {
        match self {
            VenueError::Transient(_) => "transient",
            VenueError::Rejected(_) => "rejected",
        }
    }
}

impl From<reqwest::Error> for VenueError {
    fn from(e: reqwest::Error) -> Self { VenueError::Transient(e.to_string()) }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown pair: {0}")]
    UnknownPair(String),
    #[error("insufficient funds: neither {base} nor {quote} held")]
    InsufficientFunds { base: String, quote: String },
    #[error("conflict: in-flight order(s) {0:?} could not be canceled")]
    Conflict(Vec<String>),
    #[error("venue rejected: {0}")]
    VenueRejected(String),
    #[error("venue transient: {0}")]
    VenueTransient(String),
    /// Transport failed while submitting; the order may or may not exist.
    #[error("submit unconfirmed: {0}")]
    SubmitUnconfirmed(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    State(#[from] StateError),
}

impl From<VenueError> for EngineError {
    fn from(e: VenueError) -> Self {
        match e {
            VenueError::Transient(m) => EngineError::VenueTransient(m),
            VenueError::Rejected(m) => EngineError::VenueRejected(m),
        }
    }
}

impl EngineError {
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::UnknownPair(_) => "unknown_pair",
            EngineError::InsufficientFunds { .. } => "insufficient_funds",
            EngineError::Conflict(_) => "conflict",
            EngineError::VenueRejected(_) => "venue_rejected",
            EngineError::VenueTransient(_) => "venue_transient",
            EngineError::SubmitUnconfirmed(_) => "submit_unconfirmed",
            EngineError::Config(_) => "config",
            EngineError::State(_) => "state",
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state io: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("pairs file {path}: {source}")]
    PairsFile { path: String, source: std::io::Error },
    #[error("pairs file is not valid JSON: {0}")]
    PairsJson(#[from] serde_json::Error),
    #[error("invalid pair {pair}: {reason}")]
    InvalidPair { pair: String, reason: String },
    #[error("budget fractions sum to {0}, must not exceed 1")]
    BudgetExceeded(f64),
    #[error("no pairs configured")]
    Empty,
    #[error("missing setting {0}")]
    Missing(&'static str),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("signal feed request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("signal feed io: {0}")]
    Io(#[from] std::io::Error),
    #[error("signal feed payload: {0}")]
    Decode(#[from] serde_json::Error),
}
