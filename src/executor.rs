// ===============================
// src/executor.rs (swing execution)
// ===============================
//
// Satu sinyal = satu unit kerja, urutannya tetap:
// 1) bersihkan order in-flight di pair yang sama (gagal cancel -> Conflict)
// 2) sudah ada posisi searah -> NoOp
// 3) volume posisi lawan (untuk di-swing)
// 4) sizing
// 5) kirim market order dengan leverage pair
// 6) catat PendingOrder (volume bersih = volume - extra) lalu persist
//
use chrono::Utc;
use tracing::{error, info, warn};

use crate::conflict::ConflictResolver;
use crate::domain::{ExecutionResult, OrderKind, PendingOrder, Side};
use crate::error::{EngineError, VenueError};
use crate::metrics::ORDERS;
use crate::pairs::PairRegistry;
use crate::sizing::SizingEngine;
use crate::state::PersistentState;
use crate::venue::VenueGateway;

pub struct SwingExecutor;

impl SwingExecutor {
    /// Runs one signal end to end. Only a `State` error is returned as `Err`;
    /// every trading outcome is an `ExecutionResult`.
    pub async fn execute<G: VenueGateway + ?Sized>(
        venue: &G,
        registry: &PairRegistry,
        state: &mut PersistentState,
        pair: &str,
        side: Side,
    ) -> Result<ExecutionResult, EngineError> {
        let cfg = match registry.resolve(pair) {
            Ok(c) => c,
            Err(e) => return Ok(ExecutionResult::Failed(e)),
        };

        // 1) conflicts
        let check = ConflictResolver::check_and_clear(venue, state, pair).await?;
        if !check.may_proceed {
            return Ok(ExecutionResult::Failed(EngineError::Conflict(check.blocking)));
        }

        // 2) + 3) one positions snapshot serves both checks
        let exposure = match ConflictResolver::exposure(venue, cfg).await {
            Ok(x) => x,
            Err(e) => return Ok(ExecutionResult::Failed(e.into())),
        };
        let same = exposure.same(side);
        if same > 0.0 {
            info!(%pair, %side, volume = same, "position already open in this direction, nothing to do");
            return Ok(ExecutionResult::NoOp);
        }
        let extra = exposure.opposite(side);
        if extra > 0.0 {
            info!(%pair, %side, closing = extra, "opposite position open, order will swing it");
        }

        // 4) sizing
        let volume = match SizingEngine::compute_volume(venue, cfg, side, extra).await {
            Ok(v) => v,
            Err(e) => return Ok(ExecutionResult::Failed(e)),
        };

        // 5) submit
        let submitted = venue
            .submit_order(&cfg.venue_symbol, side, OrderKind::Market, volume, cfg.leverage)
            .await;
        let res = match submitted {
            Ok(r) => r,
            Err(VenueError::Rejected(msg)) => {
                error!(%pair, %side, volume, reason = %msg, "venue rejected order");
                return Ok(ExecutionResult::Failed(EngineError::VenueRejected(msg)));
            }
            Err(VenueError::Transient(msg)) => {
                warn!(%pair, %side, volume, reason = %msg, "order submit unconfirmed, check the venue");
                return Ok(ExecutionResult::Failed(EngineError::SubmitUnconfirmed(msg)));
            }
        };

        // 6) record
        let requested_volume = volume - extra;
        info!(%pair, txid = %res.txid, descr = %res.descr, volume, requested_volume, "order submitted");
        state.add_pending(PendingOrder {
            txid: res.txid.clone(),
            pair: pair.to_string(),
            side,
            requested_volume,
            created_at: Utc::now(),
        })?;
        ORDERS.with_label_values(&[pair, side.as_str()]).inc();
        Ok(ExecutionResult::Submitted { txid: res.txid, volume })
    }
}
