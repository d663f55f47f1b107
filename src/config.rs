// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : cerbero — backtesting orchestrator for bar-driven strategies
Module  : config.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Replays or streams candles through a time-bucket aggregator into
          a pluggable strategy, while a simulated broker matches orders at
          tick resolution and keeps cash and positions consistent.
=============================================================================
*/
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;

use crate::broker::FundingPolicy;
use crate::cerbero::DEFAULT_QUEUE_CAPACITY;
use crate::domain::Symbol;

/// Command-line overrides; anything left out falls back to the environment.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "cerbero", about = "Backtest a moving-average crossover on a mock feed")]
pub struct Cli {
    /// Comma-separated symbols, e.g. AMZN,TSLA
    #[arg(long)]
    pub symbols: Option<String>,
    /// Bucket width in seconds, 0 disables aggregation
    #[arg(long)]
    pub bucket_secs: Option<u32>,
    #[arg(long)]
    pub initial_cash: Option<f64>,
    /// Ticks per symbol to generate
    #[arg(long)]
    pub ticks: Option<usize>,
    #[arg(long)]
    pub seed: Option<u64>,
    /// JSONL event log
    #[arg(long)]
    pub record_file: Option<PathBuf>,
    #[arg(long)]
    pub metrics_port: Option<u16>,
}

#[derive(Clone, Debug)]
pub struct Args {
    pub symbols: Vec<Symbol>,
    pub bucket_secs: u32,

    // broker
    pub initial_cash: f64,
    pub commission_per_share: f64,
    pub funding: FundingPolicy,

    // mock feed
    pub feed_ticks: usize,
    pub feed_seed: u64,
    pub feed_pace: Duration,

    // pipeline
    pub queue_capacity: usize,
    pub history_limit: Option<usize>,

    // strategy
    pub fast_window: usize,
    pub slow_window: usize,
    pub order_size: i64,

    // files/metrics
    pub record_file: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

/// `SYMBOLS=amzn, tsla` -> `[AMZN, TSLA]`; empty entries are dropped.
pub fn parse_symbols(raw: &str) -> Vec<Symbol> {
    raw.split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| Symbol::new(x.to_ascii_uppercase()))
        .collect()
}

/// `0` or absent means retry forever.
pub fn parse_funding(expiry_ticks: Option<u32>) -> FundingPolicy {
    match expiry_ticks {
        Some(n) if n > 0 => FundingPolicy::ExpireAfter(n),
        _ => FundingPolicy::RetryIndefinitely,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

pub fn load(cli: &Cli) -> Args {
    // .env is optional
    let _ = dotenv();

    let symbols = cli
        .symbols
        .clone()
        .or_else(|| env::var("SYMBOLS").ok())
        .map(|s| parse_symbols(&s))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![Symbol::from("AMZN")]);

    let metrics_port = cli
        .metrics_port
        .or_else(|| env_parse("METRICS_PORT"))
        .filter(|p| *p != 0);

    Args {
        symbols,
        bucket_secs: cli.bucket_secs.or_else(|| env_parse("BUCKET_SECS")).unwrap_or(15),
        initial_cash: cli.initial_cash.or_else(|| env_parse("INITIAL_CASH")).unwrap_or(30_000.0),
        commission_per_share: env_parse("COMMISSION_PER_SHARE").unwrap_or(0.0),
        funding: parse_funding(env_parse("UNFUNDED_EXPIRY_TICKS")),
        feed_ticks: cli.ticks.or_else(|| env_parse("FEED_TICKS")).unwrap_or(23_400),
        feed_seed: cli.seed.or_else(|| env_parse("FEED_SEED")).unwrap_or(42),
        feed_pace: Duration::from_millis(env_parse("FEED_PACE_MS").unwrap_or(0)),
        queue_capacity: env_parse("QUEUE_CAPACITY").unwrap_or(DEFAULT_QUEUE_CAPACITY),
        history_limit: env_parse("HISTORY_LIMIT").filter(|n: &usize| *n > 0),
        fast_window: env_parse("FAST_WINDOW").unwrap_or(16),
        slow_window: env_parse("SLOW_WINDOW").unwrap_or(64),
        order_size: env_parse("ORDER_SIZE").unwrap_or(10),
        record_file: cli.record_file.clone().or_else(|| env::var("RECORD_FILE").ok().map(PathBuf::from)),
        metrics_port,
    }
}
