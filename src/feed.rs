// ===============================
// src/feed.rs
// ===============================
//
// Market data sources:
// - VecFeed  : replays candles already in memory, in order
// - MockFeed : seeded random walk, several symbols interleaved, 1s bars
//
// A feed owns its producer task and closes the channel when it is done.
// A broken feed pushes one Err and stops.
//
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::domain::{Candle, Symbol};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("feed could not start: {0}")]
    Open(String),
    #[error("feed broke mid-stream: {0}")]
    Broken(String),
}

pub type FeedItem = Result<Candle, FeedError>;

/// Produces an ordered-per-symbol stream of raw ticks.
pub trait DataFeed: Send {
    fn run(&mut self) -> Result<mpsc::Receiver<FeedItem>, FeedError>;
}

/// Replays a fixed candle list.
#[derive(Debug, Clone)]
pub struct VecFeed {
    candles: Vec<Candle>,
    capacity: usize,
}

impl VecFeed {
    pub fn new(candles: Vec<Candle>) -> Self { Self { candles, capacity: 1024 } }
    pub fn with_capacity(mut self, capacity: usize) -> Self { self.capacity = capacity.max(1); self }
}

impl DataFeed for VecFeed {
    fn run(&mut self) -> Result<mpsc::Receiver<FeedItem>, FeedError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let candles = std::mem::take(&mut self.candles);
        tokio::spawn(async move {
            let n = candles.len();
            for c in candles {
                if tx.send(Ok(c)).await.is_err() {
                    debug!("vec feed consumer gone");
                    return;
                }
            }
            debug!(ticks = n, "vec feed exhausted");
        });
        Ok(rx)
    }
}

/// Random-walk generator. Deterministic for a given seed.
#[derive(Debug, Clone)]
pub struct MockFeed {
    pub symbols: Vec<Symbol>,
    /// Rounds to emit; each round is one tick per symbol.
    pub ticks: usize,
    pub start: DateTime<Utc>,
    pub start_price: f64,
    pub seed: u64,
    /// Sleep between rounds, zero replays as fast as possible.
    pub pace: Duration,
    pub capacity: usize,
}

impl MockFeed {
    pub fn new(symbols: Vec<Symbol>, ticks: usize) -> Self {
        Self {
            symbols,
            ticks,
            start: Utc::now(),
            start_price: 100.0,
            seed: 42,
            pace: Duration::ZERO,
            capacity: 86_400,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self { self.seed = seed; self }
    pub fn with_start(mut self, start: DateTime<Utc>) -> Self { self.start = start; self }
    pub fn with_pace(mut self, pace: Duration) -> Self { self.pace = pace; self }
}

impl DataFeed for MockFeed {
    fn run(&mut self) -> Result<mpsc::Receiver<FeedItem>, FeedError> {
        if self.symbols.is_empty() {
            return Err(FeedError::Open("mock feed needs at least one symbol".into()));
        }
        if self.start_price <= 0.0 {
            return Err(FeedError::Open(format!("start price must be > 0, got {}", self.start_price)));
        }

        let (tx, rx) = mpsc::channel(self.capacity.max(1));
        let cfg = self.clone();
        info!(symbols = ?cfg.symbols, ticks = cfg.ticks, seed = cfg.seed, "mock feed started");

        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(cfg.seed);
            let mut last: Vec<f64> = vec![cfg.start_price; cfg.symbols.len()];

            for i in 0..cfg.ticks {
                let time = cfg.start + ChronoDuration::seconds(i as i64);
                for (sym, px) in cfg.symbols.iter().zip(last.iter_mut()) {
                    // random walk in cents, floored at half the start price
                    let step = rng.gen_range(-3..=3) as f64 / 100.0;
                    let open = *px;
                    let close = (open + step).max(cfg.start_price / 2.0);
                    let wick = rng.gen_range(0..=2) as f64 / 100.0;
                    let candle = Candle {
                        open,
                        high: open.max(close) + wick,
                        low: open.min(close) - wick,
                        close,
                        volume: rng.gen_range(1..=500),
                        symbol: sym.clone(),
                        time,
                    };
                    *px = close;
                    if tx.send(Ok(candle)).await.is_err() {
                        debug!("mock feed consumer gone");
                        return;
                    }
                }
                if !cfg.pace.is_zero() {
                    sleep(cfg.pace).await;
                }
            }
            info!("closing mock feed");
        });

        Ok(rx)
    }
}
