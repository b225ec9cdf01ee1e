// ===============================
// src/reconcile.rs
// ===============================
//
// Rekonsiliasi periodik: cocokkan pending order lokal dengan kondisi venue.
// - txid masih di open orders          -> Open (biarkan)
// - volume posisi dari txid ~= request -> Fulfilled (hapus)
// - 0 < volume < request              -> PartiallyFulfilled (biarkan, lapor progres)
// - volume 0                          -> Disappeared (hapus, warning)
// Semua hasil dihitung dulu; kalau ada satu panggilan venue gagal, tick dibatalkan
// dan state tidak berubah sama sekali.
//
use tracing::{debug, info, warn};

use crate::domain::{FillStatus, PendingOrder, PositionFilter};
use crate::error::{EngineError, VenueError};
use crate::metrics::{PENDING, RECONCILED, TICKS};
use crate::state::PersistentState;
use crate::venue::VenueGateway;

const ABS_TOLERANCE: f64 = 1e-8;
const REL_TOLERANCE: f64 = 1e-6;

/// Equality used for fills: venues round volumes to instrument precision.
pub fn volumes_match(observed: f64, requested: f64) -> bool {
    (observed - requested).abs() <= ABS_TOLERANCE.max(REL_TOLERANCE * requested.abs())
}

pub fn classify(observed: f64, requested: f64) -> FillStatus {
    if volumes_match(observed, requested) || observed > requested {
        FillStatus::Fulfilled { observed }
    } else if observed > ABS_TOLERANCE {
        FillStatus::PartiallyFulfilled { observed, requested }
    } else {
        FillStatus::Disappeared
    }
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub outcomes: Vec<(PendingOrder, FillStatus)>,
}

impl ReconcileReport {
    pub fn removed(&self) -> usize { self.outcomes.iter().filter(|(_, s)| s.is_terminal()).count() }
}

pub struct ReconciliationLoop;

impl ReconciliationLoop {
    /// One pass over all pending orders.
    pub async fn tick<G: VenueGateway + ?Sized>(
        venue: &G,
        state: &mut PersistentState,
    ) -> Result<ReconcileReport, EngineError> {
        let pending = state.get().pending_orders.clone();
        if pending.is_empty() {
            TICKS.with_label_values(&["idle"]).inc();
            PENDING.set(0);
            return Ok(ReconcileReport::default());
        }

        let mut report = ReconcileReport::default();
        for p in pending {
            let status = match Self::observe(venue, &p).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(txid = %p.txid, error = %e, "reconcile aborted, retrying next tick");
                    TICKS.with_label_values(&["aborted"]).inc();
                    return Err(e.into());
                }
            };
            report.outcomes.push((p, status));
        }

        for (p, status) in &report.outcomes {
            match status {
                FillStatus::Open => {
                    debug!(txid = %p.txid, pair = %p.pair, "order still open on the book");
                    RECONCILED.with_label_values(&["open"]).inc();
                }
                FillStatus::Fulfilled { observed } => {
                    if !volumes_match(*observed, p.requested_volume) {
                        warn!(txid = %p.txid, observed, requested = p.requested_volume, "order filled above requested volume");
                    }
                    info!(txid = %p.txid, pair = %p.pair, volume = p.requested_volume, "order fulfilled");
                    RECONCILED.with_label_values(&["fulfilled"]).inc();
                }
                FillStatus::PartiallyFulfilled { observed, requested } => {
                    info!(txid = %p.txid, pair = %p.pair, "order partially fulfilled ({observed}/{requested})");
                    RECONCILED.with_label_values(&["partial"]).inc();
                }
                FillStatus::Disappeared => {
                    warn!(txid = %p.txid, pair = %p.pair, "order disappeared without a position, check the venue");
                    RECONCILED.with_label_values(&["disappeared"]).inc();
                }
            }
        }

        let done: Vec<String> = report
            .outcomes
            .iter()
            .filter(|(_, s)| s.is_terminal())
            .map(|(p, _)| p.txid.clone())
            .collect();
        state.remove_many(&done)?;
        PENDING.set(state.get().pending_orders.len() as i64);
        TICKS.with_label_values(&["ok"]).inc();
        Ok(report)
    }

    async fn observe<G: VenueGateway + ?Sized>(venue: &G, p: &PendingOrder) -> Result<FillStatus, VenueError> {
        let open = venue.open_orders(Some(&p.txid)).await?;
        if open.iter().any(|t| t == &p.txid) {
            return Ok(FillStatus::Open);
        }
        let positions = venue.open_positions(&PositionFilter::OriginTxid(p.txid.clone())).await?;
        let observed: f64 = positions.iter().filter(|x| x.origin_txid == p.txid).map(|x| x.volume).sum();
        Ok(classify(observed, p.requested_volume))
    }
}
