// ===============================
// src/aggregation.rs
// ===============================
//
// Time buckets:
// - None        : every tick is its own complete bucket
// - BySeconds(k): per-symbol running bucket, complete every k ticks
//
// Every raw tick is forwarded downstream together with the running bucket,
// so the broker can match at tick resolution while the strategy only sees
// completed buckets.
//
use std::num::NonZeroU32;

use ahash::AHashMap as HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::{AggregatedCandle, Candle, Symbol};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregationError {
    #[error("bucket width must be at least one second")]
    ZeroWidth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeAggregation {
    #[default]
    None,
    BySeconds(NonZeroU32),
}

impl TimeAggregation {
    pub fn none() -> Self { TimeAggregation::None }

    pub fn by_seconds(sec: u32) -> Result<Self, AggregationError> {
        NonZeroU32::new(sec).map(TimeAggregation::BySeconds).ok_or(AggregationError::ZeroWidth)
    }

    /// Spawns the aggregation task. The output closes once `input` closes.
    pub fn spawn(self, mut input: mpsc::Receiver<Candle>, capacity: usize) -> mpsc::Receiver<AggregatedCandle> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            let mut agg = Aggregator::new(self);
            while let Some(tick) = input.recv().await {
                if tx.send(agg.push(tick)).await.is_err() {
                    debug!("aggregation consumer gone, stopping");
                    break;
                }
            }
        });
        rx
    }
}

#[derive(Debug, Default)]
struct Bucket {
    acc: Candle,
    count: u32,
}

/// Synchronous core of [`TimeAggregation`], one state per symbol.
#[derive(Debug)]
pub struct Aggregator {
    mode: TimeAggregation,
    buckets: HashMap<Symbol, Bucket>,
}

impl Aggregator {
    pub fn new(mode: TimeAggregation) -> Self { Self { mode, buckets: HashMap::new() } }

    pub fn push(&mut self, tick: Candle) -> AggregatedCandle {
        let width = match self.mode {
            TimeAggregation::None => {
                return AggregatedCandle { aggregate: tick.clone(), original: tick, is_complete: true };
            }
            TimeAggregation::BySeconds(w) => w.get(),
        };

        let bucket = self.buckets.entry(tick.symbol.clone()).or_default();
        let merged = merge_candles(&bucket.acc, &tick);
        let is_complete = bucket.count == width;

        if is_complete {
            bucket.acc = Candle::default();
            bucket.count = 0;
        } else {
            bucket.acc = merged.clone();
        }
        bucket.count += 1;

        AggregatedCandle { original: tick, aggregate: merged, is_complete }
    }
}

/// Merges `b` into `a`; `a` is the earlier (possibly empty) candle.
/// Zero open/low mark an empty accumulator.
pub fn merge_candles(a: &Candle, b: &Candle) -> Candle {
    Candle {
        open: if a.open == 0.0 { b.open } else { a.open },
        high: if a.high > b.high { a.high } else { b.high },
        low: if a.low > 0.0 && a.low < b.low { a.low } else { b.low },
        close: b.close,
        volume: a.volume + b.volume,
        symbol: b.symbol.clone(),
        time: b.time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn tick(sym: &str, i: i64, px: f64) -> Candle {
        Candle {
            open: px, high: px + 1.0, low: px - 1.0, close: px + 0.5, volume: 10,
            symbol: sym.into(),
            time: Utc.with_ymd_and_hms(2021, 1, 11, 15, 30, 0).unwrap() + Duration::seconds(i),
        }
    }

    #[test]
    fn zero_width_is_rejected() {
        assert_eq!(TimeAggregation::by_seconds(0), Err(AggregationError::ZeroWidth));
        assert!(TimeAggregation::by_seconds(5).is_ok());
    }

    #[test]
    fn merge_keeps_first_open_and_last_close() {
        let a = tick("X", 0, 10.0);
        let b = tick("X", 1, 12.0);
        let m = merge_candles(&merge_candles(&Candle::default(), &a), &b);
        assert_eq!(m.open, 10.0);
        assert_eq!(m.close, 12.5);
        assert_eq!(m.high, 13.0);
        assert_eq!(m.low, 9.0);
        assert_eq!(m.volume, 20);
        assert_eq!(m.time, b.time);
    }

    #[test]
    fn empty_accumulator_takes_the_later_low() {
        let b = tick("X", 0, 5.0);
        assert_eq!(merge_candles(&Candle::default(), &b).low, 4.0);
    }

    #[test]
    fn no_aggregation_completes_every_tick() {
        let mut agg = Aggregator::new(TimeAggregation::none());
        for i in 0..3 {
            let out = agg.push(tick("X", i, 1.0 + i as f64));
            assert!(out.is_complete);
            assert_eq!(out.aggregate, out.original);
        }
    }

    #[test]
    fn buckets_complete_at_multiples_of_width() {
        let mut agg = Aggregator::new(TimeAggregation::by_seconds(3).unwrap());
        let flags: Vec<bool> = (0..10).map(|i| agg.push(tick("X", i, 100.0)).is_complete).collect();
        let complete: Vec<usize> = flags.iter().enumerate().filter(|(_, c)| **c).map(|(i, _)| i).collect();
        assert_eq!(complete, vec![3, 6, 9]);
    }

    #[test]
    fn symbols_keep_independent_buckets() {
        let mut agg = Aggregator::new(TimeAggregation::by_seconds(2).unwrap());
        let mut done = Vec::new();
        for i in 0..3 {
            for sym in ["A", "B"] {
                let out = agg.push(tick(sym, i, if sym == "A" { 10.0 } else { 50.0 }));
                if out.is_complete {
                    done.push(out.aggregate);
                }
            }
        }
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].symbol, Symbol::from("A"));
        assert_eq!(done[0].open, 10.0);
        assert_eq!(done[0].volume, 30);
        assert_eq!(done[1].symbol, Symbol::from("B"));
        assert_eq!(done[1].open, 50.0);
    }

    #[tokio::test]
    async fn spawned_stage_preserves_order_and_closes() {
        let (tx, rx) = mpsc::channel(16);
        let mut out = TimeAggregation::by_seconds(2).unwrap().spawn(rx, 16);
        for i in 0..5 {
            tx.send(tick("X", i, i as f64 + 1.0)).await.unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(a) = out.recv().await {
            seen.push(a.original.open);
        }
        assert_eq!(seen, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }
}
