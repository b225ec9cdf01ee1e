// ===============================
// src/sizing.rs
// ===============================
//
// Ukuran order dari saldo:
// - saldo base > 0  -> base * budget * leverage (tanpa ticker)
// - saldo quote > 0 -> quote dikonversi lewat ticker (1/bid saat sell, 1/ask saat buy),
//                      diskon 10% untuk spread/slippage, lalu * budget * leverage
// - selain itu      -> InsufficientFunds
// Volume tambahan untuk menutup posisi lawan (swing) ditambahkan di akhir.
// Tidak ada pembulatan di sini; presisi diurus gateway.
//
use tracing::{debug, warn};

use crate::domain::{Side, TickerSnapshot};
use crate::error::{EngineError, VenueError};
use crate::pairs::PairConfig;
use crate::venue::VenueGateway;

/// Haircut applied to the quote->base conversion rate.
pub const CONVERSION_DISCOUNT: f64 = 0.9;

pub struct SizingEngine;

impl SizingEngine {
    pub async fn compute_volume<G: VenueGateway + ?Sized>(
        venue: &G,
        pair: &PairConfig,
        side: Side,
        extra_volume_to_net: f64,
    ) -> Result<f64, EngineError> {
        let (base, quote) = pair.legs();
        let balance = venue.balance().await?;
        let scale = pair.budget_fraction * pair.leverage as f64;

        let held_base = balance.available(&base);
        let volume = if held_base > 0.0 {
            held_base * scale
        } else {
            let held_quote = balance.available(&quote);
            if !(held_quote > 0.0) {
                warn!(%base, %quote, "no funds in either leg of the pair");
                return Err(EngineError::InsufficientFunds { base, quote });
            }
            let ticker = venue.ticker(&pair.venue_symbol).await?;
            held_quote * conversion_rate(&ticker, side)? * scale
        };

        debug!(symbol = %pair.venue_symbol, %side, volume, extra = extra_volume_to_net, "sized order");
        Ok(volume + extra_volume_to_net)
    }
}

/// Units of base bought with one unit of quote, after the safety discount.
pub fn conversion_rate(ticker: &TickerSnapshot, side: Side) -> Result<f64, VenueError> {
    let px = match side {
        Side::Sell => ticker.bid,
        Side::Buy => ticker.ask,
    };
    if !(px > 0.0) || !px.is_finite() {
        return Err(VenueError::Transient(format!("ticker has unusable {side} price {px}")));
    }
    Ok((1.0 / px) * CONVERSION_DISCOUNT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::PaperVenue;

    fn pair() -> PairConfig {
        PairConfig {
            venue_symbol: "XETHXXBT".into(),
            budget_fraction: 0.5,
            leverage: 5,
            signal_symbol: None,
            base: None,
            quote: None,
        }
    }

    #[tokio::test]
    async fn base_balance_sizes_without_ticker() {
        let v = PaperVenue::default();
        v.set_balance("XETH", 10.0);
        let vol = SizingEngine::compute_volume(&v, &pair(), Side::Buy, 0.0).await.unwrap();
        assert!((vol - 25.0).abs() < 1e-9);
        assert_eq!(v.calls("ticker"), 0);
    }

    #[tokio::test]
    async fn quote_balance_converts_at_discounted_ask_when_buying() {
        let v = PaperVenue::default();
        v.set_balance("XXBT", 1000.0);
        v.set_ticker("XETHXXBT", 100.0, 98.0);
        let vol = SizingEngine::compute_volume(&v, &pair(), Side::Buy, 0.0).await.unwrap();
        assert!((vol - 22.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn quote_balance_converts_at_bid_when_selling() {
        let v = PaperVenue::default();
        v.set_balance("XXBT", 1000.0);
        v.set_ticker("XETHXXBT", 100.0, 90.0);
        let vol = SizingEngine::compute_volume(&v, &pair(), Side::Sell, 0.0).await.unwrap();
        assert!((vol - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn extra_volume_is_added_unconditionally() {
        let v = PaperVenue::default();
        v.set_balance("XETH", 10.0);
        let vol = SizingEngine::compute_volume(&v, &pair(), Side::Sell, 3.0).await.unwrap();
        assert!((vol - 28.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn no_funds_is_insufficient() {
        let v = PaperVenue::default();
        v.set_balance("ZUSD", 500.0);
        let err = SizingEngine::compute_volume(&v, &pair(), Side::Buy, 0.0).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
    }

    #[test]
    fn zero_price_is_rejected_as_malformed() {
        let t = TickerSnapshot { ask: 0.0, bid: 1.0 };
        assert!(conversion_rate(&t, Side::Buy).is_err());
        assert!(conversion_rate(&t, Side::Sell).is_ok());
    }
}
