// ===============================
// src/strategy.rs
// ===============================
//
// Strategy contract + one reference strategy.
//
// MOVING AVERAGE CROSSOVER (trend-following), evaluated per symbol on
// completed buckets:
//   - fast SMA crosses above slow SMA -> buy `size` when flat (golden cross)
//   - fast SMA crosses below slow SMA -> close the long (dead cross)
//   - `min_edge` filters crosses smaller than the noise
//   - `cooldown` buckets must pass between two signals
//
use std::collections::VecDeque;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use tracing::{debug, info, warn};

use crate::broker::{Broker, PendingClose};
use crate::domain::{Candle, Order, Side, Symbol};

pub trait Strategy: Send {
    /// Called once before the first `eval`.
    fn initialize(&mut self, broker: Arc<dyn Broker>);
    /// `history` is ordered oldest to newest; the last element is the bucket that just completed.
    fn eval(&mut self, history: &[Candle]);
    fn shutdown(&mut self) {}
}

struct MaCrossState {
    fast_w: usize,
    slow_w: usize,
    fast_win: VecDeque<f64>,
    slow_win: VecDeque<f64>,
    fast_sum: f64,
    slow_sum: f64,
    prev_diff_sign: i8, // -1, 0, +1
    since_last: u32,
}

impl MaCrossState {
    fn new(fast_w: usize, slow_w: usize, cooldown: u32) -> Self {
        Self {
            fast_w,
            slow_w,
            fast_win: VecDeque::with_capacity(fast_w),
            slow_win: VecDeque::with_capacity(slow_w),
            fast_sum: 0.0,
            slow_sum: 0.0,
            prev_diff_sign: 0,
            since_last: cooldown, // can signal right away
        }
    }

    fn push_window(win: &mut VecDeque<f64>, sum: &mut f64, cap: usize, v: f64) {
        if win.len() == cap {
            if let Some(x) = win.pop_front() { *sum -= x; }
        }
        win.push_back(v);
        *sum += v;
    }

    /// Returns the side of a fresh cross, if any.
    fn on_close(&mut self, close: f64, min_edge: f64, cooldown: u32) -> Option<Side> {
        Self::push_window(&mut self.fast_win, &mut self.fast_sum, self.fast_w, close);
        Self::push_window(&mut self.slow_win, &mut self.slow_sum, self.slow_w, close);
        self.since_last = self.since_last.saturating_add(1);

        if self.fast_win.len() < self.fast_w || self.slow_win.len() < self.slow_w {
            return None;
        }
        let diff = self.fast_sum / self.fast_w as f64 - self.slow_sum / self.slow_w as f64;
        if diff.abs() < min_edge { return None; }

        let cur_sign: i8 = if diff > 0.0 { 1 } else { -1 };
        if self.prev_diff_sign == 0 {
            // first full window only sets the reference side
            self.prev_diff_sign = cur_sign;
            return None;
        }
        if cur_sign != self.prev_diff_sign && self.since_last >= cooldown {
            self.prev_diff_sign = cur_sign;
            self.since_last = 0;
            return Some(if cur_sign > 0 { Side::Buy } else { Side::Sell });
        }
        None
    }
}

pub struct MaCrossover {
    pub fast: usize,
    pub slow: usize,
    pub size: i64,
    pub min_edge: f64,
    pub cooldown: u32,
    broker: Option<Arc<dyn Broker>>,
    states: HashMap<Symbol, MaCrossState>,
    closing: HashMap<Symbol, PendingClose>,
}

impl MaCrossover {
    pub fn new(fast: usize, slow: usize, size: i64) -> Self {
        Self {
            fast: fast.max(1),
            slow: slow.max(1),
            size,
            min_edge: 0.0,
            cooldown: 0,
            broker: None,
            states: HashMap::new(),
            closing: HashMap::new(),
        }
    }

    pub fn with_min_edge(mut self, edge: f64) -> Self { self.min_edge = edge; self }
    pub fn with_cooldown(mut self, buckets: u32) -> Self { self.cooldown = buckets; self }

    fn poll_closing(&mut self, symbol: &Symbol) -> bool {
        let Some(pending) = self.closing.get_mut(symbol) else { return false };
        match pending.done.try_recv() {
            Ok(order) => {
                info!(symbol = %symbol, order = %order, status = ?order.status, "position closed");
                self.closing.remove(symbol);
                false
            }
            Err(tokio::sync::oneshot::error::TryRecvError::Empty) => true,
            Err(tokio::sync::oneshot::error::TryRecvError::Closed) => {
                self.closing.remove(symbol);
                false
            }
        }
    }
}

impl Strategy for MaCrossover {
    fn initialize(&mut self, broker: Arc<dyn Broker>) {
        info!(fast = self.fast, slow = self.slow, size = self.size, "ma crossover ready");
        self.broker = Some(broker);
    }

    fn eval(&mut self, history: &[Candle]) {
        let Some(bucket) = history.last() else { return };
        let Some(broker) = self.broker.clone() else {
            warn!("eval before initialize, skipping");
            return;
        };
        let symbol = bucket.symbol.clone();
        let (fast, slow, min_edge, cooldown) = (self.fast, self.slow, self.min_edge, self.cooldown);
        let signal = self
            .states
            .entry(symbol.clone())
            .or_insert_with(|| MaCrossState::new(fast, slow, cooldown))
            .on_close(bucket.close, min_edge, cooldown);

        let Some(side) = signal else { return };
        if self.poll_closing(&symbol) {
            debug!(symbol = %symbol, "close still pending, signal ignored");
            return;
        }

        let position = broker.get_position(&symbol);
        match side {
            Side::Buy if position.is_flat() => {
                match broker.submit_order(Order::new(symbol.clone(), Side::Buy, self.size)) {
                    Ok(id) => info!(bucket = %bucket, order_id = %id, "golden cross, buy"),
                    Err(e) => warn!(?e, symbol = %symbol, "buy submission failed"),
                }
            }
            Side::Sell if position.size > 0 => match broker.close_position(&position) {
                Ok(pending) => {
                    info!(bucket = %bucket, order_id = %pending.order_id, "dead cross, close");
                    self.closing.insert(symbol, pending);
                }
                Err(e) => warn!(?e, symbol = %symbol, "close submission failed"),
            },
            _ => {}
        }
    }

    fn shutdown(&mut self) {
        self.closing.clear();
        self.states.clear();
        self.broker = None;
    }
}
