// ===============================
// src/engine.rs
// ===============================
//
// Engine = satu-satunya critical section. main.rs membungkusnya dengan
// Arc<tokio::sync::Mutex<Engine>>; task intake & task rekonsiliasi masing-masing
// lock selama satu siklus penuh, jadi AppState tidak pernah diubah bersamaan.
//
// Intake:
// - ambil batch sinyal terbaru (terbaru dulu), proses dari yang paling lama
// - id yang sudah diproses dilewati (idempotent)
// - start pertama (state kosong saat engine dibuat) + SKIP_BACKLOG -> batch pertama
//   yang berhasil diambil ditandai tanpa trading; diputuskan sekali saja
// - VenueTransient sebelum submit -> id TIDAK ditandai dan siklus berhenti di situ,
//   sinyal yang lebih baru menunggu sampai sinyal lama selesai
//
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::{Event, ExecutionResult, RawSignal};
use crate::error::{EngineError, StateError};
use crate::executor::SwingExecutor;
use crate::metrics::SIGNALS;
use crate::pairs::PairRegistry;
use crate::reconcile::{ReconcileReport, ReconciliationLoop};
use crate::signals::{parse_signal, SignalSource};
use crate::state::PersistentState;
use crate::venue::VenueGateway;

/// What happened to one signal during intake.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Ignored,
    Submitted { txid: String },
    NoOp,
    /// Left unprocessed, picked up again next interval.
    Retry,
    Dropped(&'static str),
}

impl SignalOutcome {
    fn label(&self) -> &'static str {
        match self {
            SignalOutcome::Ignored => "ignored",
            SignalOutcome::Submitted { .. } => "submitted",
            SignalOutcome::NoOp => "noop",
            SignalOutcome::Retry => "retry",
            SignalOutcome::Dropped(_) => "dropped",
        }
    }
}

#[derive(Debug, Default)]
pub struct IntakeReport {
    pub skipped_backlog: usize,
    pub handled: Vec<(String, SignalOutcome)>,
}

pub struct Engine {
    venue: Arc<dyn VenueGateway>,
    registry: PairRegistry,
    state: PersistentState,
    journal: Option<mpsc::Sender<Event>>,
    skip_backlog: bool,
    /// No signal had ever been processed when the engine was built; cleared
    /// by the first successful fetch.
    first_start: bool,
}

impl Engine {
    pub fn new(venue: Arc<dyn VenueGateway>, registry: PairRegistry, state: PersistentState) -> Self {
        let first_start = state.get().processed_signal_ids.is_empty();
        Self { venue, registry, state, journal: None, skip_backlog: true, first_start }
    }

    pub fn with_journal(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.journal = Some(tx);
        self
    }

    pub fn skip_backlog(mut self, on: bool) -> Self {
        self.skip_backlog = on;
        self
    }

    pub fn state(&self) -> &PersistentState { &self.state }

    fn emit(&self, ev: Event) {
        if let Some(tx) = &self.journal {
            // Jurnal best-effort: channel penuh -> event dibuang
            if tx.try_send(ev).is_err() {
                debug!("journal channel full or closed, event dropped");
            }
        }
    }

    /// One intake cycle. Only a state error is fatal.
    pub async fn process_signals(&mut self, source: &dyn SignalSource) -> Result<IntakeReport, StateError> {
        let mut report = IntakeReport::default();
        let batch = match source.fetch_recent().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "signal feed unavailable, retrying next interval");
                SIGNALS.with_label_values(&["feed_error"]).inc();
                return Ok(report);
            }
        };
        let first_start = std::mem::take(&mut self.first_start);
        if batch.is_empty() {
            debug!("no signals in feed");
            return Ok(report);
        }

        if self.skip_backlog && first_start {
            info!(newest = %batch[0].id, n = batch.len(), "first start, marking existing signals as seen without trading");
            for raw in batch.iter().rev() {
                if self.state.mark_processed(&raw.id)? {
                    report.skipped_backlog += 1;
                }
            }
            self.emit(Event::Note { msg: format!("skipped {} backlog signal(s)", report.skipped_backlog) });
            SIGNALS.with_label_values(&["backlog"]).inc_by(report.skipped_backlog as u64);
            return Ok(report);
        }

        // feed: terbaru dulu -> proses dari yang paling lama
        for raw in batch.iter().rev() {
            if self.state.get().is_processed(&raw.id) {
                continue;
            }
            let outcome = self.handle(raw).await?;
            SIGNALS.with_label_values(&[outcome.label()]).inc();
            if outcome == SignalOutcome::Retry {
                // sinyal lebih baru tidak boleh jalan sebelum yang ini selesai
                report.handled.push((raw.id.clone(), outcome));
                break;
            }
            self.state.mark_processed(&raw.id)?;
            report.handled.push((raw.id.clone(), outcome));
        }
        Ok(report)
    }

    async fn handle(&mut self, raw: &RawSignal) -> Result<SignalOutcome, StateError> {
        self.emit(Event::SignalSeen { id: raw.id.clone(), text: raw.text.clone() });

        let Some(sig) = parse_signal(raw, &self.registry) else {
            info!(id = %raw.id, "nothing interesting in signal");
            return Ok(SignalOutcome::Ignored);
        };
        info!(id = %sig.id, pair = %sig.pair, side = %sig.side, "signal detected");

        let in_flight: Vec<String> = self.state.get().pending_for(&sig.pair).map(|p| p.txid.clone()).collect();
        let result =
            match SwingExecutor::execute(self.venue.as_ref(), &self.registry, &mut self.state, &sig.pair, sig.side).await {
                Ok(r) => r,
                Err(EngineError::State(e)) => return Err(e),
                Err(other) => ExecutionResult::Failed(other),
            };

        for txid in in_flight {
            if self.state.get().pending_orders.iter().all(|p| p.txid != txid) {
                self.emit(Event::OrderCanceled { txid, pair: sig.pair.clone() });
            }
        }

        Ok(match result {
            ExecutionResult::Submitted { txid, volume } => {
                let requested_volume = self
                    .state
                    .get()
                    .pending_orders
                    .iter()
                    .find(|p| p.txid == txid)
                    .map(|p| p.requested_volume)
                    .unwrap_or(volume);
                self.emit(Event::OrderSubmitted {
                    txid: txid.clone(),
                    pair: sig.pair.clone(),
                    side: sig.side,
                    volume,
                    requested_volume,
                });
                SignalOutcome::Submitted { txid }
            }
            ExecutionResult::NoOp => SignalOutcome::NoOp,
            ExecutionResult::Failed(EngineError::VenueTransient(msg)) => {
                warn!(id = %sig.id, pair = %sig.pair, reason = %msg, "venue unavailable, signal will be retried");
                SignalOutcome::Retry
            }
            ExecutionResult::Failed(e) => {
                warn!(id = %sig.id, pair = %sig.pair, error = %e, "signal dropped");
                self.emit(Event::Note { msg: format!("signal {} dropped: {e}", sig.id) });
                SignalOutcome::Dropped(e.label())
            }
        })
    }

    /// One reconciliation tick. Venue errors abort the tick and are not
    /// fatal; a state error is.
    pub async fn reconcile(&mut self) -> Result<ReconcileReport, StateError> {
        match ReconciliationLoop::tick(self.venue.as_ref(), &mut self.state).await {
            Ok(report) => {
                for (p, outcome) in &report.outcomes {
                    self.emit(Event::Reconciled { txid: p.txid.clone(), pair: p.pair.clone(), outcome: *outcome });
                }
                Ok(report)
            }
            Err(EngineError::State(e)) => Err(e),
            Err(_) => Ok(ReconcileReport::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use crate::error::{SourceError, VenueError};
    use crate::state::MemoryStore;
    use crate::venue::PaperVenue;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Feed whose content the test rewrites between cycles.
    #[derive(Default)]
    struct ScriptedFeed { items: Mutex<Vec<RawSignal>> }

    impl ScriptedFeed {
        fn set(&self, items: &[(&str, &str)]) {
            *self.items.lock().unwrap() =
                items.iter().map(|(id, text)| RawSignal { id: id.to_string(), text: text.to_string() }).collect();
        }
    }

    #[async_trait]
    impl SignalSource for ScriptedFeed {
        async fn fetch_recent(&self) -> Result<Vec<RawSignal>, SourceError> { Ok(self.items.lock().unwrap().clone()) }
    }

    fn engine(venue: Arc<PaperVenue>, skip: bool) -> (Engine, MemoryStore) {
        let store = MemoryStore::new();
        let st = PersistentState::open(Box::new(store.clone())).unwrap();
        let e = Engine::new(venue, PairRegistry::builtin().unwrap(), st).skip_backlog(skip);
        (e, store)
    }

    #[tokio::test]
    async fn same_signal_is_executed_once() {
        let v = Arc::new(PaperVenue::default());
        v.set_balance("XETH", 4.0);
        let (mut e, store) = engine(v.clone(), false);
        let feed = ScriptedFeed::default();
        feed.set(&[("100", "going long ETHBTC")]);

        e.process_signals(&feed).await.unwrap();
        e.process_signals(&feed).await.unwrap();

        assert_eq!(v.submitted().len(), 1);
        assert_eq!(store.saved().unwrap().processed_signal_ids, vec!["100".to_string()]);
    }

    #[tokio::test]
    async fn first_start_skips_backlog() {
        let v = Arc::new(PaperVenue::default());
        v.set_balance("XETH", 4.0);
        let (mut e, _) = engine(v.clone(), true);
        let feed = ScriptedFeed::default();
        feed.set(&[("2", "short ETHBTC"), ("1", "long ETHBTC")]);

        let r = e.process_signals(&feed).await.unwrap();
        assert_eq!(r.skipped_backlog, 2);
        assert!(v.submitted().is_empty());

        feed.set(&[("3", "long ETHBTC"), ("2", "short ETHBTC"), ("1", "long ETHBTC")]);
        let r = e.process_signals(&feed).await.unwrap();
        assert_eq!(r.handled.len(), 1);
        assert_eq!(v.submitted().len(), 1);
        assert_eq!(v.submitted()[0].side, Side::Buy);
    }

    #[tokio::test]
    async fn older_signals_run_first() {
        let v = Arc::new(PaperVenue::default());
        v.set_balance("XETH", 4.0);
        v.set_balance("XXMR", 2.0);
        let (mut e, _) = engine(v.clone(), false);
        let feed = ScriptedFeed::default();
        feed.set(&[("11", "now short XMRBTC"), ("10", "long ETHBTC")]);

        let r = e.process_signals(&feed).await.unwrap();
        let ids: Vec<&str> = r.handled.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["10", "11"]);
        let symbols: Vec<String> = v.submitted().iter().map(|o| o.symbol.clone()).collect();
        assert_eq!(symbols, vec!["XETHXXBT".to_string(), "XXMRXXBT".to_string()]);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_next_cycle() {
        let v = Arc::new(PaperVenue::default());
        v.set_balance("XETH", 4.0);
        let (mut e, _) = engine(v.clone(), false);
        let feed = ScriptedFeed::default();
        feed.set(&[("7", "long ETHBTC")]);

        v.fail_next("balance", VenueError::Transient("timeout".into()));
        let r = e.process_signals(&feed).await.unwrap();
        assert_eq!(r.handled[0].1, SignalOutcome::Retry);
        assert!(!e.state().get().is_processed("7"));

        let r = e.process_signals(&feed).await.unwrap();
        assert!(matches!(r.handled[0].1, SignalOutcome::Submitted { .. }));
        assert!(e.state().get().is_processed("7"));
    }

    #[tokio::test]
    async fn retried_signal_holds_back_newer_ones() {
        let v = Arc::new(PaperVenue::new(false));
        v.set_balance("XETH", 4.0);
        let (mut e, _) = engine(v.clone(), false);
        let feed = ScriptedFeed::default();
        feed.set(&[("2", "short ETHBTC"), ("1", "long ETHBTC")]);

        v.fail_next("balance", VenueError::Transient("timeout".into()));
        let r = e.process_signals(&feed).await.unwrap();
        assert_eq!(r.handled, vec![("1".to_string(), SignalOutcome::Retry)]);
        assert!(!e.state().get().is_processed("2"));
        assert!(v.submitted().is_empty());

        e.reconcile().await.unwrap();
        let r = e.process_signals(&feed).await.unwrap();
        let ids: Vec<&str> = r.handled.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);

        // the newer short cancels the resting long and is the only live intent
        let sides: Vec<Side> = v.submitted().iter().map(|o| o.side).collect();
        assert_eq!(sides, vec![Side::Buy, Side::Sell]);
        let pending = &e.state().get().pending_orders;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].side, Side::Sell);
    }

    #[tokio::test]
    async fn empty_feed_at_startup_does_not_swallow_first_signal() {
        let v = Arc::new(PaperVenue::default());
        v.set_balance("XETH", 4.0);
        let (mut e, _) = engine(v.clone(), true);
        let feed = ScriptedFeed::default();

        let r = e.process_signals(&feed).await.unwrap();
        assert_eq!(r.skipped_backlog, 0);

        feed.set(&[("9", "long ETHBTC")]);
        let r = e.process_signals(&feed).await.unwrap();
        assert_eq!(r.skipped_backlog, 0);
        assert!(matches!(r.handled[0].1, SignalOutcome::Submitted { .. }));
        assert_eq!(v.submitted().len(), 1);
    }

    #[tokio::test]
    async fn restart_with_history_does_not_skip() {
        let v = Arc::new(PaperVenue::default());
        v.set_balance("XETH", 4.0);
        let store = MemoryStore::new();
        let mut st = PersistentState::open(Box::new(store.clone())).unwrap();
        st.mark_processed("old").unwrap();
        let mut e = Engine::new(v.clone(), PairRegistry::builtin().unwrap(), st);
        let feed = ScriptedFeed::default();
        feed.set(&[("new", "long ETHBTC"), ("old", "short ETHBTC")]);

        let r = e.process_signals(&feed).await.unwrap();
        assert_eq!(r.skipped_backlog, 0);
        assert_eq!(r.handled.len(), 1);
        assert_eq!(v.submitted().len(), 1);
    }

    #[tokio::test]
    async fn blocked_conflict_drops_signal() {
        let v = Arc::new(PaperVenue::new(false));
        v.set_balance("XETH", 4.0);
        let (mut e, _) = engine(v.clone(), false);
        let feed = ScriptedFeed::default();
        feed.set(&[("1", "long ETHBTC")]);
        e.process_signals(&feed).await.unwrap();
        assert_eq!(e.state().get().pending_orders.len(), 1);

        v.fail_next("cancel", VenueError::Rejected("EOrder:Locked".into()));
        feed.set(&[("2", "short ETHBTC"), ("1", "long ETHBTC")]);
        let r = e.process_signals(&feed).await.unwrap();
        assert_eq!(r.handled[0].1, SignalOutcome::Dropped("conflict"));
        assert!(e.state().get().is_processed("2"));
        assert_eq!(v.submitted().len(), 1);
    }

    #[tokio::test]
    async fn chatter_is_marked_processed() {
        let v = Arc::new(PaperVenue::default());
        let (mut e, _) = engine(v.clone(), false);
        let feed = ScriptedFeed::default();
        feed.set(&[("5", "good morning everyone")]);
        let r = e.process_signals(&feed).await.unwrap();
        assert_eq!(r.handled[0].1, SignalOutcome::Ignored);
        assert!(e.state().get().is_processed("5"));
        assert_eq!(v.calls("balance"), 0);
    }

    #[tokio::test]
    async fn reconcile_clears_filled_orders_and_journals() {
        let v = Arc::new(PaperVenue::default());
        v.set_balance("XETH", 4.0);
        let (tx, mut rx) = mpsc::channel(32);
        let (e, _) = engine(v.clone(), false);
        let mut e = e.with_journal(tx);
        let feed = ScriptedFeed::default();
        feed.set(&[("1", "long ETHBTC")]);
        e.process_signals(&feed).await.unwrap();

        let r = e.reconcile().await.unwrap();
        assert_eq!(r.removed(), 1);
        assert!(e.state().get().pending_orders.is_empty());

        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            kinds.push(match ev {
                Event::SignalSeen { .. } => "seen",
                Event::OrderSubmitted { .. } => "submitted",
                Event::Reconciled { .. } => "reconciled",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["seen", "submitted", "reconciled"]);
    }
}
