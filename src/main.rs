// ===============================
// src/main.rs
// ===============================
/*
 # quick run, 15s buckets over a 2 symbol mock session
 cargo run --release -- --symbols AMZN,TSLA --bucket-secs 15 --ticks 23400

 # with metrics + JSONL events
 METRICS_PORT=9898 RECORD_FILE=out/events.jsonl cargo run --release
 curl -s localhost:9898/metrics | grep '^fills_total'
*/
/*
=============================================================================
Project : cerbero — backtesting orchestrator for bar-driven strategies
Module  : main.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Replays or streams candles through a time-bucket aggregator into
          a pluggable strategy, while a simulated broker matches orders at
          tick resolution and keeps cash and positions consistent.
=============================================================================
*/
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cerbero::broker::{self, BacktestBroker};
use cerbero::config::{self, Cli};
use cerbero::domain::Event;
use cerbero::metrics::{self, MetricsSink, PromMetrics};
use cerbero::strategy::MaCrossover;
use cerbero::{Cerbero, CerberoError, MockFeed, TimeAggregation};

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config ----
    let cli = Cli::parse();
    let args = config::load(&cli);
    info!(
        symbols = ?args.symbols,
        bucket_secs = args.bucket_secs,
        initial_cash = args.initial_cash,
        ticks = args.feed_ticks,
        seed = args.feed_seed,
        funding = ?args.funding,
        "startup config"
    );

    // ---- Metrics ----
    let sink: Arc<dyn MetricsSink> = match args.metrics_port {
        Some(port) => match PromMetrics::new() {
            Ok(prom) => {
                let prom = Arc::new(prom);
                if let Err(e) = metrics::serve_metrics(port, prom.clone()) {
                    warn!(?e, port, "metrics endpoint disabled");
                }
                prom as Arc<dyn MetricsSink>
            }
            Err(e) => {
                warn!(?e, "metrics registry failed, running without metrics");
                metrics::noop()
            }
        },
        None => metrics::noop(),
    };

    // ---- Recorder (optional) ----
    let (rec_tx, recorder) = match args.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            (Some(tx), Some(tokio::spawn(cerbero::recorder::run(rx, path))))
        }
        None => (None, None),
    };

    // ---- Pipeline ----
    // zero width means no aggregation
    let aggregation = TimeAggregation::by_seconds(args.bucket_secs).unwrap_or_default();

    let broker = Arc::new(
        BacktestBroker::new(args.initial_cash)
            .with_commissions(broker::per_share(args.commission_per_share))
            .with_funding_policy(args.funding)
            .with_metrics(sink.clone()),
    );
    let strategy = MaCrossover::new(args.fast_window, args.slow_window, args.order_size);
    let feed = MockFeed::new(args.symbols.clone(), args.feed_ticks)
        .with_seed(args.feed_seed)
        .with_pace(args.feed_pace);

    // ---- Ctrl-C cancels the run, the pipeline still drains ----
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received, stopping feed");
            let _ = cancel_tx.send(true);
        }
    });

    let mut service = Cerbero::new(broker, Box::new(strategy), Box::new(feed))
        .with_aggregation(aggregation)
        .with_metrics(sink)
        .with_cancel(cancel_rx)
        .with_queue_capacity(args.queue_capacity);
    if let Some(limit) = args.history_limit {
        service = service.with_history_limit(limit);
    }
    if let Some(tx) = rec_tx {
        service = service.with_recorder(tx);
    }

    let outcome = service.run().await;
    // last sender lives in the service
    drop(service);
    if let Some(task) = recorder {
        match task.await {
            Ok(Err(e)) => error!(?e, "recorder failed"),
            Err(e) => error!(?e, "recorder task panicked"),
            Ok(Ok(())) => {}
        }
    }

    match outcome {
        Ok(result) => {
            info!(
                elapsed = %result.total_time_string,
                initial_cash = result.initial_cash,
                final_cash = result.final_cash,
                pl_pct = result.pl,
                "backtest done"
            );
            ExitCode::SUCCESS
        }
        Err(CerberoError::Feed { source, partial }) => {
            error!(%source, final_cash = partial.final_cash, pl_pct = partial.pl, "backtest aborted");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(%e, "backtest failed");
            ExitCode::FAILURE
        }
    }
}
