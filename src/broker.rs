// ===============================
// src/broker.rs
// ===============================
//
// Broker contract + simulated matching engine for backtests.
//
// Matching rules (BacktestBroker):
// - orders fill at the open of the next matching tick of their symbol
// - buys need cash for the whole remaining size plus commission, otherwise
//   they wait (or expire, see FundingPolicy)
// - sells always fill in full, shorts included; there is no margin check
// - orders are matched FIFO in submission order
//
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap as HashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::domain::{Candle, Order, OrderId, OrderStatus, Position, Side, Symbol};
use crate::metrics::{self, MetricsSink};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    #[error("order size must be > 0, got {0}")]
    InvalidOrderSize(i64),
    #[error("order not found: {0}")]
    OrderNotFound(OrderId),
    #[error("insufficient funds: need ${required}, have ${available}")]
    InsufficientFunds { required: f64, available: f64 },
}

/// Resolves once the closing order reaches a terminal state.
#[derive(Debug)]
pub struct PendingClose {
    pub order_id: OrderId,
    pub done: oneshot::Receiver<Order>,
}

pub trait Broker: Send + Sync {
    fn submit_order(&self, order: Order) -> Result<OrderId, BrokerError>;
    fn get_order_by_id(&self, id: &OrderId) -> Result<Order, BrokerError>;
    /// Matches resting orders against one raw tick. Must never block.
    fn process_orders(&self, tick: &Candle) -> Vec<Order>;
    /// Zero-sized position when nothing is held.
    fn get_position(&self, symbol: &Symbol) -> Position;
    fn get_positions(&self) -> Vec<Position>;
    fn available_cash(&self) -> f64;
    fn close_position(&self, position: &Position) -> Result<PendingClose, BrokerError>;
    fn shutdown(&self);
}

/// `(order, fill price) -> commission`. Runs with the book locked, so it must
/// not call back into the broker.
pub type CommissionFn = Arc<dyn Fn(&Order, f64) -> f64 + Send + Sync>;

pub fn no_commissions() -> CommissionFn { Arc::new(|_, _| 0.0) }

/// `rate` per unit of the remaining size.
pub fn per_share(rate: f64) -> CommissionFn {
    Arc::new(move |o: &Order, _px| rate * o.remaining() as f64)
}

pub fn flat_fee(fee: f64) -> CommissionFn { Arc::new(move |_, _| fee) }

/// What happens to a buy that cannot be funded on a matching tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FundingPolicy {
    /// Keep the order open and retry on every later tick.
    #[default]
    RetryIndefinitely,
    /// Reject after this many consecutive unfunded ticks.
    ExpireAfter(u32),
}

#[derive(Default)]
struct Book {
    cash: f64,
    orders: Vec<Order>,
    index: HashMap<OrderId, usize>,
    positions: HashMap<Symbol, Position>,
    waiters: HashMap<OrderId, oneshot::Sender<Order>>,
}

impl Book {
    fn insert(&mut self, order: Order) {
        self.index.insert(order.id.clone(), self.orders.len());
        self.orders.push(order);
    }
}

/// Default broker to back-test a strategy.
pub struct BacktestBroker {
    book: Mutex<Book>,
    seq: AtomicU64,
    commissions: CommissionFn,
    funding: FundingPolicy,
    metrics: Arc<dyn MetricsSink>,
}

impl fmt::Debug for BacktestBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BacktestBroker")
            .field("funding", &self.funding)
            .field("cash", &self.available_cash())
            .finish_non_exhaustive()
    }
}

impl BacktestBroker {
    pub fn new(initial_cash: f64) -> Self {
        Self {
            book: Mutex::new(Book { cash: initial_cash, ..Default::default() }),
            seq: AtomicU64::new(0),
            commissions: no_commissions(),
            funding: FundingPolicy::default(),
            metrics: metrics::noop(),
        }
    }

    pub fn with_commissions(mut self, f: CommissionFn) -> Self { self.commissions = f; self }
    pub fn with_funding_policy(mut self, p: FundingPolicy) -> Self { self.funding = p; self }
    pub fn with_metrics(mut self, m: Arc<dyn MetricsSink>) -> Self { self.metrics = m; self }

    /// Receiver resolved with the order once it is filled or rejected.
    /// `None` for unknown ids; an already terminal order resolves immediately.
    pub fn on_complete(&self, id: &OrderId) -> Option<oneshot::Receiver<Order>> {
        let mut book = self.lock();
        let order = book.index.get(id).map(|&i| book.orders[i].clone())?;
        let (tx, rx) = oneshot::channel();
        if order.status.is_terminal() {
            let _ = tx.send(order);
        } else {
            book.waiters.insert(id.clone(), tx);
        }
        Some(rx)
    }

    fn lock(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> OrderId {
        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let prefix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .filter(|c| c.is_ascii_alphabetic())
            .take(6)
            .map(char::from)
            .collect();
        OrderId::new(format!("{prefix}-{n:06}"))
    }

    /// Cash a buy of `qty` at `price` needs, commission included.
    fn buy_cost(qty: i64, price: f64, commission: f64) -> f64 {
        qty as f64 * price + commission
    }

    fn check_funds(cash: f64, required: f64) -> Result<(), BrokerError> {
        if cash < required {
            return Err(BrokerError::InsufficientFunds { required, available: cash });
        }
        Ok(())
    }

    /// Applies one fill of `qty` (signed) at `price` to cash, book and order.
    /// Returns the position after the fill.
    fn execute(book: &mut Book, idx: usize, qty: i64, price: f64, commission: f64) -> Position {
        let symbol = book.orders[idx].symbol.clone();

        if qty > 0 {
            // same amount the funding check accepted, so cash stays >= 0
            book.cash -= Self::buy_cost(qty, price, commission);
        } else {
            book.cash += -qty as f64 * price;
            book.cash -= commission;
        }

        let mut pos = book.positions.remove(&symbol).unwrap_or_else(|| Position::flat(symbol.clone()));
        let new_size = pos.size + qty;
        if new_size != 0 {
            pos.avg_price = if pos.size == 0 {
                price
            } else {
                (pos.size as f64 * pos.avg_price + qty as f64 * price) / new_size as f64
            };
        }
        pos.size = new_size;
        if new_size != 0 {
            book.positions.insert(symbol, pos.clone());
        }

        let order = &mut book.orders[idx];
        let abs = qty.abs();
        order.avg_filled_price =
            (order.avg_filled_price * order.size_filled as f64 + price * abs as f64) / (order.size_filled + abs) as f64;
        order.size_filled += abs;
        if order.size_filled == order.size {
            order.status = OrderStatus::FullFilled;
        }
        pos
    }

    fn resolve_waiter(book: &mut Book, idx: usize) {
        let order = &book.orders[idx];
        if !order.status.is_terminal() {
            return;
        }
        if let Some(tx) = book.waiters.remove(&order.id) {
            let _ = tx.send(order.clone());
        }
    }
}

impl Broker for BacktestBroker {
    fn submit_order(&self, mut order: Order) -> Result<OrderId, BrokerError> {
        if order.size <= 0 {
            return Err(BrokerError::InvalidOrderSize(order.size));
        }
        order.id = self.next_id();
        order.status = OrderStatus::Accepted;
        order.size_filled = 0;
        order.avg_filled_price = 0.0;
        order.submitted_time = None;
        order.unfunded_ticks = 0;

        debug!(order = %order, "order accepted");
        let id = order.id.clone();
        self.lock().insert(order);
        Ok(id)
    }

    fn get_order_by_id(&self, id: &OrderId) -> Result<Order, BrokerError> {
        let book = self.lock();
        book.index
            .get(id)
            .map(|&i| book.orders[i].clone())
            .ok_or_else(|| BrokerError::OrderNotFound(id.clone()))
    }

    fn process_orders(&self, tick: &Candle) -> Vec<Order> {
        let mut guard = self.lock();
        let book = &mut *guard;
        let mut touched = Vec::new();
        // reported to the metrics sink once the book is unlocked
        let mut fills: Vec<(Order, i64, Position)> = Vec::new();
        let price = tick.open;

        for idx in 0..book.orders.len() {
            {
                let order = &mut book.orders[idx];
                if order.status.is_terminal() || order.symbol != tick.symbol {
                    continue;
                }
                if order.submitted_time.is_none() {
                    order.submitted_time = Some(tick.time);
                }
                order.status = OrderStatus::PartiallyFilled;
            }

            let (side, remaining) = (book.orders[idx].side, book.orders[idx].remaining());
            let commission = (self.commissions)(&book.orders[idx], price);
            let qty = match side {
                Side::Buy => {
                    if let Err(e) = Self::check_funds(book.cash, Self::buy_cost(remaining, price, commission)) {
                        let order = &mut book.orders[idx];
                        order.unfunded_ticks += 1;
                        debug!(tick = %tick.time_str(), order = %order, error = %e, "buy not funded, waiting");
                        if let FundingPolicy::ExpireAfter(n) = self.funding {
                            if order.unfunded_ticks >= n {
                                order.status = OrderStatus::Rejected;
                                warn!(order = %order, ticks = n, "buy expired without funding");
                                Self::resolve_waiter(book, idx);
                            }
                        }
                        touched.push(book.orders[idx].clone());
                        continue;
                    }
                    remaining
                }
                // sells (and shorts) are never refused
                Side::Sell => -remaining,
            };

            book.orders[idx].unfunded_ticks = 0;
            let pos = Self::execute(book, idx, qty, price, commission);
            info!(tick = %tick.time_str(), order = %book.orders[idx], qty, px = price, "filled");
            Self::resolve_waiter(book, idx);
            touched.push(book.orders[idx].clone());
            fills.push((book.orders[idx].clone(), qty, pos));
        }
        drop(guard);

        for (order, qty, pos) in &fills {
            self.metrics.record_position(pos);
            self.metrics.record_fill(order, *qty, price);
        }
        touched
    }

    fn get_position(&self, symbol: &Symbol) -> Position {
        self.lock()
            .positions
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Position::flat(symbol.clone()))
    }

    fn get_positions(&self) -> Vec<Position> {
        let mut out: Vec<Position> = self.lock().positions.values().cloned().collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    fn available_cash(&self) -> f64 { self.lock().cash }

    fn close_position(&self, position: &Position) -> Result<PendingClose, BrokerError> {
        let held = if position.size > 0 { Side::Buy } else { Side::Sell };
        let side = held.opposite();
        let order_id = self.submit_order(Order::new(position.symbol.clone(), side, position.size.abs()))?;
        let done = self.on_complete(&order_id).ok_or_else(|| BrokerError::OrderNotFound(order_id.clone()))?;
        info!(symbol = %position.symbol, size = position.size, order_id = %order_id, "closing position");
        Ok(PendingClose { order_id, done })
    }

    fn shutdown(&self) {
        let mut book = self.lock();
        book.orders.clear();
        book.index.clear();
        book.positions.clear();
        // dropping the senders wakes every pending close with an error
        book.waiters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn tick(sym: &str, open: f64) -> Candle {
        Candle {
            open, high: open, low: open, close: open, volume: 100,
            symbol: sym.into(),
            time: Utc.with_ymd_and_hms(2021, 1, 11, 15, 30, 0).unwrap(),
        }
    }

    #[test]
    fn unknown_order_is_not_found() {
        let b = BacktestBroker::new(1000.0);
        let id = OrderId::new("order that does not exist");
        assert_eq!(b.get_order_by_id(&id), Err(BrokerError::OrderNotFound(id)));
    }

    #[test]
    fn submit_overrides_id_and_status() {
        let b = BacktestBroker::new(1000.0);
        let mut o = Order::new("AMZN", Side::Buy, 178);
        o.id = OrderId::new("this will be changed");
        o.status = OrderStatus::FullFilled;
        let id = b.submit_order(o).unwrap();
        assert_ne!(id.as_str(), "this will be changed");

        let stored = b.get_order_by_id(&id).unwrap();
        assert_eq!(stored.status, OrderStatus::Accepted);
        assert_eq!(stored.size_filled, 0);
    }

    #[test]
    fn ids_are_unique() {
        let b = BacktestBroker::new(0.0);
        let a = b.submit_order(Order::new("X", Side::Sell, 1)).unwrap();
        let c = b.submit_order(Order::new("X", Side::Sell, 1)).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn non_positive_size_is_rejected() {
        let b = BacktestBroker::new(1000.0);
        assert_eq!(b.submit_order(Order::new("X", Side::Buy, 0)), Err(BrokerError::InvalidOrderSize(0)));
        assert_eq!(b.submit_order(Order::new("X", Side::Buy, -3)), Err(BrokerError::InvalidOrderSize(-3)));
    }

    #[test]
    fn submission_does_not_fill() {
        let b = BacktestBroker::new(1000.0);
        b.submit_order(Order::new("X", Side::Buy, 1)).unwrap();
        assert_eq!(b.available_cash(), 1000.0);
        assert!(b.get_positions().is_empty());
    }

    #[test]
    fn other_symbols_are_untouched() {
        let b = BacktestBroker::new(1000.0);
        let id = b.submit_order(Order::new("X", Side::Buy, 1)).unwrap();
        assert!(b.process_orders(&tick("Y", 10.0)).is_empty());
        let o = b.get_order_by_id(&id).unwrap();
        assert_eq!(o.status, OrderStatus::Accepted);
        assert_eq!(o.submitted_time, None);
    }

    #[test]
    fn unfunded_buy_expires_under_expiry_policy() {
        let b = BacktestBroker::new(50.0).with_funding_policy(FundingPolicy::ExpireAfter(2));
        let id = b.submit_order(Order::new("X", Side::Buy, 1)).unwrap();

        b.process_orders(&tick("X", 100.0));
        assert_eq!(b.get_order_by_id(&id).unwrap().status, OrderStatus::PartiallyFilled);

        let touched = b.process_orders(&tick("X", 100.0));
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].status, OrderStatus::Rejected);

        // terminal orders are never matched again
        assert!(b.process_orders(&tick("X", 1.0)).is_empty());
        assert_eq!(b.available_cash(), 50.0);
    }

    #[test]
    fn commission_counts_in_funding_check_and_cash() {
        let b = BacktestBroker::new(100.0).with_commissions(flat_fee(1.0));
        let id = b.submit_order(Order::new("X", Side::Buy, 1)).unwrap();

        // 100 + 1 commission > 100 cash
        b.process_orders(&tick("X", 100.0));
        assert_eq!(b.get_order_by_id(&id).unwrap().size_filled, 0);

        b.process_orders(&tick("X", 99.0));
        assert_eq!(b.get_order_by_id(&id).unwrap().status, OrderStatus::FullFilled);
        assert_eq!(b.available_cash(), 0.0);
    }

    #[test]
    fn sell_opens_short_without_cash() {
        let b = BacktestBroker::new(0.0);
        b.submit_order(Order::new("X", Side::Sell, 5)).unwrap();
        b.process_orders(&tick("X", 20.0));

        let p = b.get_position(&"X".into());
        assert_eq!(p.size, -5);
        assert_eq!(p.avg_price, 20.0);
        assert_eq!(b.available_cash(), 100.0);
    }

    #[test]
    fn adding_to_position_averages_price() {
        let b = BacktestBroker::new(1000.0);
        b.submit_order(Order::new("X", Side::Buy, 1)).unwrap();
        b.process_orders(&tick("X", 100.0));
        b.submit_order(Order::new("X", Side::Buy, 3)).unwrap();
        b.process_orders(&tick("X", 200.0));

        let p = b.get_position(&"X".into());
        assert_eq!(p.size, 4);
        assert!((p.avg_price - 175.0).abs() < 1e-9);
        assert_eq!(b.available_cash(), 300.0);
    }

    #[test]
    fn matching_is_fifo_by_submission() {
        let b = BacktestBroker::new(1000.0);
        let first = b.submit_order(Order::new("X", Side::Buy, 1)).unwrap();
        let second = b.submit_order(Order::new("X", Side::Sell, 1)).unwrap();
        let touched = b.process_orders(&tick("X", 10.0));
        let ids: Vec<&OrderId> = touched.iter().map(|o| &o.id).collect();
        assert_eq!(ids, vec![&first, &second]);
        assert!(b.get_positions().is_empty());
    }

    #[test]
    fn close_position_resolves_on_fill() {
        let b = BacktestBroker::new(1000.0);
        b.submit_order(Order::new("X", Side::Buy, 2)).unwrap();
        b.process_orders(&tick("X", 100.0));

        let pos = b.get_position(&"X".into());
        let mut pending = b.close_position(&pos).unwrap();
        assert!(pending.done.try_recv().is_err());

        b.process_orders(&tick("X", 110.0));
        let order = pending.done.try_recv().unwrap();
        assert_eq!(order.id, pending.order_id);
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.status, OrderStatus::FullFilled);
        assert!(b.get_position(&"X".into()).is_flat());
        assert_eq!(b.available_cash(), 1020.0);
    }

    #[test]
    fn closing_a_flat_position_is_invalid() {
        let b = BacktestBroker::new(1000.0);
        let err = b.close_position(&Position::flat("X".into())).unwrap_err();
        assert_eq!(err, BrokerError::InvalidOrderSize(0));
    }

    #[test]
    fn shutdown_clears_book_and_wakes_waiters() {
        let b = BacktestBroker::new(1000.0);
        let id = b.submit_order(Order::new("X", Side::Buy, 1)).unwrap();
        let mut rx = b.on_complete(&id).unwrap();
        b.shutdown();

        assert!(matches!(b.get_order_by_id(&id), Err(BrokerError::OrderNotFound(_))));
        assert!(b.get_positions().is_empty());
        assert!(matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
        assert_eq!(b.available_cash(), 1000.0);
    }

    /// Sink that reads the broker back while it is being notified.
    #[derive(Default)]
    struct ReadBack {
        broker: Mutex<Option<Arc<BacktestBroker>>>,
        seen: Mutex<Vec<(i64, f64)>>,
    }

    impl MetricsSink for ReadBack {
        fn record_fill(&self, order: &Order, _qty: i64, _price: f64) {
            let broker = self.broker.lock().unwrap().clone();
            if let Some(b) = broker {
                let pos = b.get_position(&order.symbol);
                self.seen.lock().unwrap().push((pos.size, b.available_cash()));
            }
        }
    }

    #[test]
    fn metrics_sink_may_read_the_broker() {
        let sink = Arc::new(ReadBack::default());
        let b = Arc::new(BacktestBroker::new(1000.0).with_metrics(sink.clone()));
        *sink.broker.lock().unwrap() = Some(b.clone());

        b.submit_order(Order::new("X", Side::Buy, 2)).unwrap();
        b.process_orders(&tick("X", 100.0));

        assert_eq!(*sink.seen.lock().unwrap(), vec![(2, 800.0)]);
        // break the cycle
        sink.broker.lock().unwrap().take();
    }

    #[test]
    fn avg_filled_price_is_size_weighted() {
        let b = BacktestBroker::new(150.0).with_funding_policy(FundingPolicy::RetryIndefinitely);
        let id = b.submit_order(Order::new("X", Side::Buy, 1)).unwrap();
        b.process_orders(&tick("X", 141.5));
        let o = b.get_order_by_id(&id).unwrap();
        assert_eq!(o.avg_filled_price, 141.5);
        assert_eq!(o.unfunded_ticks, 0);
    }
}
