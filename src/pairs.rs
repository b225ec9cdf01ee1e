// ===============================
// src/pairs.rs
// ===============================
use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, EngineError};

/// Static configuration for one tradable instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairConfig {
    /// Symbol on the venue, e.g. `XETHXXBT`.
    pub venue_symbol: String,
    /// Fraction of the funding balance committed per trade (0..=1).
    pub budget_fraction: f64,
    pub leverage: u32,
    /// Token that names this pair inside signal text, e.g. `ETHBTC`.
    #[serde(default)]
    pub signal_symbol: Option<String>,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub quote: Option<String>,
}

impl PairConfig {
    /// Base and quote currency codes. Falls back to splitting the venue
    /// symbol in half (Kraken's 4+4 asset codes) when not given explicitly.
    pub fn legs(&self) -> (String, String) {
        match (&self.base, &self.quote) {
            (Some(b), Some(q)) => (b.clone(), q.clone()),
            _ => {
                let mid = self.venue_symbol.chars().count() / 2;
                let b: String = self.venue_symbol.chars().take(mid).collect();
                let q: String = self.venue_symbol.chars().skip(mid).collect();
                (b, q)
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PairRegistry {
    pairs: HashMap<String, PairConfig>,
}

impl PairRegistry {
    /// Builds and validates a registry. Fails fast on any bad entry.
    pub fn new(pairs: impl IntoIterator<Item = (String, PairConfig)>) -> Result<Self, ConfigError> {
        let reg = Self { pairs: pairs.into_iter().collect() };
        reg.validate()?;
        Ok(reg)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let map: std::collections::BTreeMap<String, PairConfig> = serde_json::from_str(raw)?;
        Self::new(map)
    }

    pub fn load_file(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::PairsFile { path: path.to_string(), source })?;
        Self::from_json(&raw)
    }

    /// Default table. Budgets sum to exactly 1.
    pub fn builtin() -> Result<Self, ConfigError> {
        let entry = |symbol: &str, signal: &str, budget: f64, leverage: u32| PairConfig {
            venue_symbol: symbol.into(),
            budget_fraction: budget,
            leverage,
            signal_symbol: Some(signal.into()),
            base: None,
            quote: None,
        };
        Self::new([
            ("ETH/BTC".to_string(), entry("XETHXXBT", "ETHBTC", 0.5, 5)),
            ("XMR/BTC".to_string(), entry("XXMRXXBT", "XMRBTC", 0.3, 3)),
            ("ETH/USD".to_string(), entry("XETHZUSD", "ETHUSD", 0.2, 5)),
        ])
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pairs.is_empty() {
            return Err(ConfigError::Empty);
        }
        let invalid = |pair: &str, reason: &str| ConfigError::InvalidPair { pair: pair.to_string(), reason: reason.to_string() };
        let mut total = 0.0;
        for (name, p) in &self.pairs {
            if p.venue_symbol.trim().is_empty() {
                return Err(invalid(name, "empty venue symbol"));
            }
            if !(0.0..=1.0).contains(&p.budget_fraction) {
                return Err(invalid(name, "budget fraction outside [0, 1]"));
            }
            if p.leverage == 0 {
                return Err(invalid(name, "leverage must be positive"));
            }
            if p.base.is_some() != p.quote.is_some() {
                return Err(invalid(name, "base and quote must be given together"));
            }
            if p.base.is_none() && (!p.venue_symbol.is_ascii() || p.venue_symbol.len() % 2 != 0) {
                return Err(invalid(name, "cannot split venue symbol into base/quote, set them explicitly"));
            }
            total += p.budget_fraction;
        }
        if total > 1.0 + 1e-9 {
            return Err(ConfigError::BudgetExceeded(total));
        }
        Ok(())
    }

    pub fn resolve(&self, pair: &str) -> Result<&PairConfig, EngineError> {
        self.pairs.get(pair).ok_or_else(|| EngineError::UnknownPair(pair.to_string()))
    }

    /// Finds the pair whose signal symbol occurs in `text`. Longest token wins.
    pub fn match_text(&self, text: &str) -> Option<&str> {
        self.pairs
            .iter()
            .filter_map(|(name, p)| p.signal_symbol.as_deref().map(|s| (name, s)))
            .filter(|(_, s)| !s.is_empty() && text.contains(s))
            .max_by(|(an, a), (bn, b)| a.len().cmp(&b.len()).then_with(|| bn.cmp(an)))
            .map(|(name, _)| name.as_str())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut v: Vec<&str> = self.pairs.keys().map(|k| k.as_str()).collect();
        v.sort_unstable();
        v
    }
}
