// ===============================
// src/venue.rs (gateway port + paper venue)
// ===============================
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use tracing::{debug, info};

use crate::domain::{
    BalanceSnapshot, OrderKind, OrderSubmitResult, PositionFilter, PositionRecord, Side, TickerSnapshot,
};
use crate::error::VenueError;
use crate::metrics::VENUE_ERRORS;

/// Everything the engine needs from a trading venue.
#[async_trait]
pub trait VenueGateway: Send + Sync {
    async fn submit_order(
        &self,
        symbol: &str,
        side: Side,
        kind: OrderKind,
        volume: f64,
        leverage: u32,
    ) -> Result<OrderSubmitResult, VenueError>;
    async fn cancel_order(&self, txid: &str) -> Result<(), VenueError>;
    async fn balance(&self) -> Result<BalanceSnapshot, VenueError>;
    async fn ticker(&self, symbol: &str) -> Result<TickerSnapshot, VenueError>;
    async fn open_positions(&self, filter: &PositionFilter) -> Result<Vec<PositionRecord>, VenueError>;
    /// Txids of orders still resting on the book.
    async fn open_orders(&self, origin_txid: Option<&str>) -> Result<Vec<String>, VenueError>;
}

// -----------------------------------------------------------------------------
// Timeout decorator: every call is bounded, a timeout becomes Transient.
// -----------------------------------------------------------------------------
pub struct TimeoutVenue<G> {
    inner: G,
    limit: Duration,
}

impl<G: VenueGateway> TimeoutVenue<G> {
    pub fn new(inner: G, limit: Duration) -> Self { Self { inner, limit } }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, VenueError>
    where
        F: std::future::Future<Output = Result<T, VenueError>> + Send,
    {
        let res = match tokio::time::timeout(self.limit, fut).await {
            Ok(r) => r,
            Err(_) => Err(VenueError::Transient(format!("{op} timed out after {:?}", self.limit))),
        };
        if let Err(e) = &res {
            VENUE_ERRORS.with_label_values(&[op, e.label()]).inc();
        }
        res
    }
}

#[async_trait]
impl<G: VenueGateway> VenueGateway for TimeoutVenue<G> {
    async fn submit_order(
        &self,
        symbol: &str,
        side: Side,
        kind: OrderKind,
        volume: f64,
        leverage: u32,
    ) -> Result<OrderSubmitResult, VenueError> {
        self.bounded("submit", self.inner.submit_order(symbol, side, kind, volume, leverage)).await
    }
    async fn cancel_order(&self, txid: &str) -> Result<(), VenueError> {
        self.bounded("cancel", self.inner.cancel_order(txid)).await
    }
    async fn balance(&self) -> Result<BalanceSnapshot, VenueError> {
        self.bounded("balance", self.inner.balance()).await
    }
    async fn ticker(&self, symbol: &str) -> Result<TickerSnapshot, VenueError> {
        self.bounded("ticker", self.inner.ticker(symbol)).await
    }
    async fn open_positions(&self, filter: &PositionFilter) -> Result<Vec<PositionRecord>, VenueError> {
        self.bounded("positions", self.inner.open_positions(filter)).await
    }
    async fn open_orders(&self, origin_txid: Option<&str>) -> Result<Vec<String>, VenueError> {
        self.bounded("orders", self.inner.open_orders(origin_txid)).await
    }
}

// -----------------------------------------------------------------------------
// Paper venue: in-memory book, market orders fill immediately (or on demand).
// A fill first closes opposite positions on the symbol, the rest opens a new
// position tagged with the order txid, like a margin swing on the real venue.
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq)]
pub struct PaperOrder { pub txid: String, pub symbol: String, pub side: Side, pub volume: f64, pub leverage: u32 }

#[derive(Debug, Default)]
struct PaperBook {
    balances: HashMap<String, f64>,
    tickers: HashMap<String, TickerSnapshot>,
    positions: Vec<PositionRecord>,
    resting: Vec<PaperOrder>,
    submitted: Vec<PaperOrder>,
    /// op -> (calls still allowed to pass, error to return after that)
    failures: HashMap<&'static str, (u32, VenueError)>,
    calls: HashMap<&'static str, u32>,
}

impl PaperBook {
    fn enter(&mut self, op: &'static str) -> Result<(), VenueError> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.failures.get_mut(op) {
            Some((pass, _)) if *pass > 0 => {
                *pass -= 1;
                Ok(())
            }
            Some(_) => match self.failures.remove(op) {
                Some((_, e)) => Err(e),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn fill(&mut self, order: &PaperOrder, volume: f64) {
        let mut remaining = volume;
        for pos in self.positions.iter_mut().filter(|p| p.symbol == order.symbol && p.side != order.side) {
            let closed = remaining.min(pos.volume);
            pos.volume -= closed;
            remaining -= closed;
        }
        self.positions.retain(|p| p.volume > 0.0);
        if remaining > 0.0 {
            self.positions.push(PositionRecord {
                symbol: order.symbol.clone(),
                side: order.side,
                volume: remaining,
                origin_txid: order.txid.clone(),
            });
        }
    }
}

pub struct PaperVenue {
    book: Mutex<PaperBook>,
    fill_immediately: bool,
}

impl Default for PaperVenue {
    fn default() -> Self { Self::new(true) }
}

impl PaperVenue {
    pub fn new(fill_immediately: bool) -> Self { Self { book: Mutex::new(PaperBook::default()), fill_immediately } }

    fn book(&self) -> Result<std::sync::MutexGuard<'_, PaperBook>, VenueError> {
        self.book.lock().map_err(|_| VenueError::Transient("paper book poisoned".into()))
    }

    fn with_book<T>(&self, f: impl FnOnce(&mut PaperBook) -> T) -> T {
        let mut guard = match self.book.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn set_balance(&self, currency: &str, amount: f64) {
        self.with_book(|b| { b.balances.insert(currency.to_string(), amount); });
    }

    pub fn set_ticker(&self, symbol: &str, ask: f64, bid: f64) {
        self.with_book(|b| { b.tickers.insert(symbol.to_string(), TickerSnapshot { ask, bid }); });
    }

    pub fn add_position(&self, symbol: &str, side: Side, volume: f64, origin_txid: &str) {
        self.with_book(|b| b.positions.push(PositionRecord {
            symbol: symbol.to_string(),
            side,
            volume,
            origin_txid: origin_txid.to_string(),
        }));
    }

    /// Puts a resting order on the book without going through submit.
    pub fn add_resting(&self, txid: &str, symbol: &str, side: Side, volume: f64) {
        self.with_book(|b| b.resting.push(PaperOrder { txid: txid.into(), symbol: symbol.into(), side, volume, leverage: 1 }));
    }

    /// Fills `volume` of a resting order; the order leaves the book.
    pub fn fill_resting(&self, txid: &str, volume: f64) -> bool {
        self.with_book(|b| {
            let Some(idx) = b.resting.iter().position(|o| o.txid == txid) else { return false };
            let order = b.resting.remove(idx);
            b.fill(&order, volume);
            true
        })
    }

    /// Makes the next call of `op` fail once. Ops: submit, cancel, balance,
    /// ticker, positions, orders.
    pub fn fail_next(&self, op: &'static str, err: VenueError) { self.fail_nth(op, 1, err) }

    /// Lets `n - 1` calls of `op` through, then fails the `n`-th one once.
    pub fn fail_nth(&self, op: &'static str, n: u32, err: VenueError) {
        self.with_book(|b| { b.failures.insert(op, (n.saturating_sub(1), err)); });
    }

    pub fn submitted(&self) -> Vec<PaperOrder> { self.with_book(|b| b.submitted.clone()) }

    pub fn positions(&self) -> Vec<PositionRecord> { self.with_book(|b| b.positions.clone()) }

    pub fn calls(&self, op: &'static str) -> u32 { self.with_book(|b| b.calls.get(op).copied().unwrap_or(0)) }

    fn new_txid() -> String {
        let mut rng = rand::thread_rng();
        let mut part = |n: usize| (&mut rng).sample_iter(&Alphanumeric).take(n).map(char::from).collect::<String>().to_uppercase();
        let (a, b, c) = (part(5), part(5), part(6));
        format!("O{a}-{b}-{c}")
    }
}

#[async_trait]
impl VenueGateway for PaperVenue {
    async fn submit_order(
        &self,
        symbol: &str,
        side: Side,
        kind: OrderKind,
        volume: f64,
        leverage: u32,
    ) -> Result<OrderSubmitResult, VenueError> {
        let mut book = self.book()?;
        book.enter("submit")?;
        if !(volume > 0.0) {
            return Err(VenueError::Rejected("EOrder:Invalid volume".into()));
        }
        let order = PaperOrder { txid: Self::new_txid(), symbol: symbol.to_string(), side, volume, leverage };
        let descr = format!("{} {:.8} {} @ {} leverage {}", side, volume, symbol, kind.as_str(), leverage);
        book.submitted.push(order.clone());
        if self.fill_immediately {
            book.fill(&order, volume);
        } else {
            book.resting.push(order.clone());
        }
        info!(txid = %order.txid, %descr, "paper order accepted");
        Ok(OrderSubmitResult { txid: order.txid, descr })
    }

    async fn cancel_order(&self, txid: &str) -> Result<(), VenueError> {
        let mut book = self.book()?;
        book.enter("cancel")?;
        let before = book.resting.len();
        book.resting.retain(|o| o.txid != txid);
        if book.resting.len() == before {
            return Err(VenueError::Rejected("EOrder:Unknown order".into()));
        }
        debug!(%txid, "paper order canceled");
        Ok(())
    }

    async fn balance(&self) -> Result<BalanceSnapshot, VenueError> {
        let mut book = self.book()?;
        book.enter("balance")?;
        Ok(BalanceSnapshot { amounts: book.balances.clone() })
    }

    async fn ticker(&self, symbol: &str) -> Result<TickerSnapshot, VenueError> {
        let mut book = self.book()?;
        book.enter("ticker")?;
        book.tickers
            .get(symbol)
            .copied()
            .ok_or_else(|| VenueError::Rejected(format!("EQuery:Unknown asset pair {symbol}")))
    }

    async fn open_positions(&self, filter: &PositionFilter) -> Result<Vec<PositionRecord>, VenueError> {
        let mut book = self.book()?;
        book.enter("positions")?;
        Ok(book
            .positions
            .iter()
            .filter(|p| match filter {
                PositionFilter::All => true,
                PositionFilter::Symbol(s) => &p.symbol == s,
                PositionFilter::OriginTxid(t) => &p.origin_txid == t,
            })
            .cloned()
            .collect())
    }

    async fn open_orders(&self, origin_txid: Option<&str>) -> Result<Vec<String>, VenueError> {
        let mut book = self.book()?;
        book.enter("orders")?;
        Ok(book
            .resting
            .iter()
            .filter(|o| origin_txid.map_or(true, |t| o.txid == t))
            .map(|o| o.txid.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fill_closes_opposite_position_before_opening() {
        let v = PaperVenue::default();
        v.add_position("XETHXXBT", Side::Sell, 3.0, "OLD");
        let r = v.submit_order("XETHXXBT", Side::Buy, OrderKind::Market, 13.0, 5).await.unwrap();
        let pos = v.positions();
        assert_eq!(pos.len(), 1);
        assert_eq!(pos[0].side, Side::Buy);
        assert!((pos[0].volume - 10.0).abs() < 1e-12);
        assert_eq!(pos[0].origin_txid, r.txid);
    }

    #[tokio::test]
    async fn cancel_unknown_order_is_rejected() {
        let v = PaperVenue::new(false);
        let r = v.submit_order("XETHXXBT", Side::Buy, OrderKind::Market, 1.0, 1).await.unwrap();
        assert_eq!(v.open_orders(Some(&r.txid)).await.unwrap(), vec![r.txid.clone()]);
        v.cancel_order(&r.txid).await.unwrap();
        assert!(matches!(v.cancel_order(&r.txid).await, Err(VenueError::Rejected(_))));
    }

    #[tokio::test]
    async fn nth_call_failure_skips_earlier_calls() {
        let v = PaperVenue::default();
        v.fail_nth("orders", 2, VenueError::Transient("boom".into()));
        assert!(v.open_orders(None).await.is_ok());
        assert!(v.open_orders(None).await.is_err());
        assert!(v.open_orders(None).await.is_ok());
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let v = PaperVenue::default();
        v.fail_next("balance", VenueError::Transient("boom".into()));
        assert!(v.balance().await.is_err());
        assert!(v.balance().await.is_ok());
        assert_eq!(v.calls("balance"), 2);
    }

    struct Stuck;

    #[async_trait]
    impl VenueGateway for Stuck {
        async fn submit_order(&self, _: &str, _: Side, _: OrderKind, _: f64, _: u32) -> Result<OrderSubmitResult, VenueError> {
            std::future::pending().await
        }
        async fn cancel_order(&self, _: &str) -> Result<(), VenueError> { std::future::pending().await }
        async fn balance(&self) -> Result<BalanceSnapshot, VenueError> { std::future::pending().await }
        async fn ticker(&self, _: &str) -> Result<TickerSnapshot, VenueError> { std::future::pending().await }
        async fn open_positions(&self, _: &PositionFilter) -> Result<Vec<PositionRecord>, VenueError> {
            std::future::pending().await
        }
        async fn open_orders(&self, _: Option<&str>) -> Result<Vec<String>, VenueError> { std::future::pending().await }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_becomes_transient() {
        let v = TimeoutVenue::new(Stuck, Duration::from_secs(10));
        assert!(matches!(v.balance().await, Err(VenueError::Transient(_))));
    }
}
