// ===============================
// src/domain.rs
// ===============================
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self { Self(s.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<&str> for Symbol { fn from(s: &str) -> Self { Self(s.to_string()) } }
impl From<String> for Symbol { fn from(s: String) -> Self { Self(s) } }
impl fmt::Display for Symbol {
    // pad, so `{:<5}` lines symbols up in logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.pad(&self.0) }
}

/// One OHLCV bar. Never mutated once a feed has produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub symbol: Symbol,
    pub time: DateTime<Utc>,
}

impl Candle {
    pub fn time_str(&self) -> String {
        format!(" {:<5} {}", self.symbol, self.time.format("%H:%M:%S"))
    }
}

impl fmt::Display for Candle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:<5} {}] open:{} high:{} close:{} low:{} volume:{}",
            self.symbol,
            self.time.format("%H:%M:%S"),
            self.open,
            self.high,
            self.close,
            self.low,
            self.volume
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side { Buy, Sell }
impl Side {
    pub fn opposite(&self) -> Side { match self { Side::Buy => Side::Sell, Side::Sell => Side::Buy } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus { Accepted, PartiallyFilled, FullFilled, Rejected }
impl OrderStatus {
    /// Terminal orders are never matched again.
    pub fn is_terminal(&self) -> bool { matches!(self, OrderStatus::FullFilled | OrderStatus::Rejected) }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn new(s: impl Into<String>) -> Self { Self(s.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}
impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Assigned by the broker on submission; anything set by the caller is overwritten.
    pub id: OrderId,
    /// Always > 0 once accepted.
    pub size: i64,
    pub symbol: Symbol,
    pub side: Side,
    pub status: OrderStatus,
    pub size_filled: i64,
    pub avg_filled_price: f64,
    /// Time of the first tick that matched this order.
    pub submitted_time: Option<DateTime<Utc>>,
    /// Consecutive ticks on which a buy could not be funded.
    pub unfunded_ticks: u32,
}

impl Order {
    pub fn new(symbol: impl Into<Symbol>, side: Side, size: i64) -> Self {
        Self {
            id: OrderId::default(),
            size,
            symbol: symbol.into(),
            side,
            status: OrderStatus::Accepted,
            size_filled: 0,
            avg_filled_price: 0.0,
            submitted_time: None,
            unfunded_ticks: 0,
        }
    }

    pub fn remaining(&self) -> i64 { self.size - self.size_filled }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ [{}]: {:>5} {} {} }}", self.id, self.side.as_str(), self.size, self.symbol)
    }
}

/// Net holding of a symbol. Negative size is a short.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub size: i64,
    pub avg_price: f64,
}

impl Position {
    pub fn flat(symbol: Symbol) -> Self { Self { symbol, size: 0, avg_price: 0.0 } }
    pub fn is_flat(&self) -> bool { self.size == 0 }
}

/// A raw tick paired with the running bucket of its symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedCandle {
    pub original: Candle,
    pub aggregate: Candle,
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub total_time: Duration,
    #[serde(rename = "total_time_S")]
    pub total_time_string: String,
    pub initial_cash: f64,
    pub final_cash: f64,
    pub pl: f64,
}

impl ExecutionResult {
    pub fn compute(started: Instant, initial_cash: f64, final_cash: f64) -> Self {
        let total_time = started.elapsed();
        // an unfunded account has no meaningful return
        let pl = if initial_cash == 0.0 { 0.0 } else { (final_cash / initial_cash - 1.0) * 100.0 };
        Self {
            total_time,
            total_time_string: format!("{total_time:?}"),
            initial_cash,
            final_cash,
            pl,
        }
    }
}

/// Recorder payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event { Bucket(Candle), Fill(Order), Summary(ExecutionResult), Note(String) }

pub fn opens(candles: &[Candle]) -> Vec<f64> { candles.iter().map(|c| c.open).collect() }
pub fn highs(candles: &[Candle]) -> Vec<f64> { candles.iter().map(|c| c.high).collect() }
pub fn lows(candles: &[Candle]) -> Vec<f64> { candles.iter().map(|c| c.low).collect() }
pub fn closes(candles: &[Candle]) -> Vec<f64> { candles.iter().map(|c| c.close).collect() }

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn pl_is_percent_over_initial_cash() {
        let r = ExecutionResult::compute(Instant::now(), 1000.0, 1100.0);
        assert!((r.pl - 10.0).abs() < 1e-9);
        let zero = ExecutionResult::compute(Instant::now(), 0.0, 50.0);
        assert_eq!(zero.pl, 0.0);
    }

    #[test]
    fn execution_result_uses_legacy_json_names() {
        let r = ExecutionResult::compute(Instant::now(), 100.0, 100.0);
        let v = serde_json::to_value(&r).unwrap();
        assert!(v.get("total_time_S").is_some());
        assert!(v.get("initial_cash").is_some());
        assert_eq!(v["pl"], 0.0);
    }

    #[test]
    fn candle_renders_symbol_and_clock() {
        let c = Candle {
            open: 1.0, high: 2.0, low: 0.5, close: 1.5, volume: 7,
            symbol: "FB".into(),
            time: Utc.with_ymd_and_hms(2021, 1, 11, 15, 30, 5).unwrap(),
        };
        assert_eq!(c.time_str(), " FB    15:30:05");
        assert!(c.to_string().starts_with("[FB    15:30:05] open:1"));
        assert_eq!(format!("{:>4}|{:<3}|", Symbol::from("X"), Symbol::from("AB")), "   X|AB |");
    }

    #[test]
    fn series_helpers_keep_order() {
        let mk = |x: f64| Candle { open: x, high: x + 1.0, low: x - 1.0, close: x + 0.5, ..Default::default() };
        let cs = vec![mk(1.0), mk(2.0)];
        assert_eq!(opens(&cs), vec![1.0, 2.0]);
        assert_eq!(highs(&cs), vec![2.0, 3.0]);
        assert_eq!(lows(&cs), vec![0.0, 1.0]);
        assert_eq!(closes(&cs), vec![1.5, 2.5]);
    }

    #[test]
    fn order_display_and_terminal_states() {
        let mut o = Order::new("AMZN", Side::Buy, 10);
        o.id = OrderId::new("abc-1");
        assert_eq!(o.to_string(), "{ [abc-1]:   BUY 10 AMZN }");
        assert!(!o.status.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }
}
