// ===============================
// src/conflict.rs
// ===============================
use tracing::{info, warn};

use crate::domain::{PositionFilter, Side};
use crate::error::{StateError, VenueError};
use crate::metrics::CONFLICTS;
use crate::pairs::PairConfig;
use crate::state::PersistentState;
use crate::venue::VenueGateway;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictCheck {
    pub may_proceed: bool,
    /// Pending orders whose cancel failed; they stay tracked.
    pub blocking: Vec<String>,
    pub canceled: Vec<String>,
}

/// Open venue exposure on one symbol, summed per direction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Exposure { pub long: f64, pub short: f64 }

impl Exposure {
    pub fn same(&self, side: Side) -> f64 { match side { Side::Buy => self.long, Side::Sell => self.short } }
    pub fn opposite(&self, side: Side) -> f64 { self.same(side.opposite()) }
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Tries to cancel every tracked order on `pair`. Canceled ones are
    /// dropped from state; any failed cancel blocks the new signal.
    pub async fn check_and_clear<G: VenueGateway + ?Sized>(
        venue: &G,
        state: &mut PersistentState,
        pair: &str,
    ) -> Result<ConflictCheck, StateError> {
        let in_flight: Vec<(String, Side)> = state.get().pending_for(pair).map(|p| (p.txid.clone(), p.side)).collect();
        let mut check = ConflictCheck { may_proceed: true, ..Default::default() };

        for (txid, side) in in_flight {
            warn!(%pair, %txid, %side, "conflict: order still in flight, trying to cancel it first");
            match venue.cancel_order(&txid).await {
                Ok(()) => {
                    info!(%pair, %txid, "in-flight order canceled");
                    state.remove_pending(&txid)?;
                    CONFLICTS.with_label_values(&["canceled"]).inc();
                    check.canceled.push(txid);
                }
                Err(e) => {
                    warn!(%pair, %txid, error = %e, "could not cancel in-flight order, skipping this signal");
                    CONFLICTS.with_label_values(&["blocked"]).inc();
                    check.blocking.push(txid);
                }
            }
        }
        check.may_proceed = check.blocking.is_empty();
        Ok(check)
    }

    pub async fn exposure<G: VenueGateway + ?Sized>(venue: &G, pair: &PairConfig) -> Result<Exposure, VenueError> {
        let positions = venue.open_positions(&PositionFilter::Symbol(pair.venue_symbol.clone())).await?;
        let mut exp = Exposure::default();
        for p in positions.iter().filter(|p| p.symbol == pair.venue_symbol) {
            match p.side {
                Side::Buy => exp.long += p.volume,
                Side::Sell => exp.short += p.volume,
            }
        }
        Ok(exp)
    }

    /// Volume held against `side` on the pair; zero when flat.
    pub async fn net_position<G: VenueGateway + ?Sized>(venue: &G, pair: &PairConfig, side: Side) -> Result<f64, VenueError> {
        Ok(Self::exposure(venue, pair).await?.opposite(side))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PendingOrder;
    use crate::state::MemoryStore;
    use crate::venue::PaperVenue;
    use chrono::Utc;

    fn pair() -> PairConfig {
        PairConfig { venue_symbol: "XETHXXBT".into(), budget_fraction: 0.5, leverage: 5, signal_symbol: None, base: None, quote: None }
    }

    fn pending(txid: &str, pair: &str) -> PendingOrder {
        PendingOrder { txid: txid.into(), pair: pair.into(), side: Side::Buy, requested_volume: 1.0, created_at: Utc::now() }
    }

    #[tokio::test]
    async fn successful_cancel_clears_the_way() {
        let v = PaperVenue::new(false);
        v.add_resting("O1", "XETHXXBT", Side::Buy, 1.0);
        let mut st = PersistentState::open(Box::new(MemoryStore::new())).unwrap();
        st.add_pending(pending("O1", "ETH/BTC")).unwrap();
        st.add_pending(pending("O2", "XMR/BTC")).unwrap();

        let c = ConflictResolver::check_and_clear(&v, &mut st, "ETH/BTC").await.unwrap();
        assert!(c.may_proceed);
        assert_eq!(c.canceled, vec!["O1".to_string()]);
        assert_eq!(st.get().pending_orders.len(), 1);
        assert_eq!(st.get().pending_orders[0].txid, "O2");
    }

    #[tokio::test]
    async fn failed_cancel_blocks_and_keeps_entry() {
        let v = PaperVenue::new(false);
        v.fail_next("cancel", VenueError::Transient("timeout".into()));
        let mut st = PersistentState::open(Box::new(MemoryStore::new())).unwrap();
        st.add_pending(pending("O1", "ETH/BTC")).unwrap();

        let c = ConflictResolver::check_and_clear(&v, &mut st, "ETH/BTC").await.unwrap();
        assert!(!c.may_proceed);
        assert_eq!(c.blocking, vec!["O1".to_string()]);
        assert_eq!(st.get().pending_orders.len(), 1);
    }

    #[tokio::test]
    async fn no_pending_means_no_venue_calls() {
        let v = PaperVenue::default();
        let mut st = PersistentState::open(Box::new(MemoryStore::new())).unwrap();
        let c = ConflictResolver::check_and_clear(&v, &mut st, "ETH/BTC").await.unwrap();
        assert!(c.may_proceed);
        assert_eq!(v.calls("cancel"), 0);
    }

    #[tokio::test]
    async fn net_position_sums_opposite_side_only() {
        let v = PaperVenue::default();
        v.add_position("XETHXXBT", Side::Sell, 1.0, "A");
        v.add_position("XETHXXBT", Side::Sell, 2.0, "B");
        v.add_position("XXMRXXBT", Side::Sell, 7.0, "C");
        assert!((ConflictResolver::net_position(&v, &pair(), Side::Buy).await.unwrap() - 3.0).abs() < 1e-12);
        assert_eq!(ConflictResolver::net_position(&v, &pair(), Side::Sell).await.unwrap(), 0.0);
    }
}
