// ===============================
// src/cerbero.rs
// ===============================
//
// Orchestrator, named after backtrader's Cerebro.
//
//   DataFeed -> [feed pump] -> relay -> TimeAggregation -> [evaluation]
//                                                            |-> Broker::process_orders (every tick)
//                                                            '-> Strategy::eval (completed buckets)
//
// The pump and the evaluation loop are separate tasks that only share the
// bounded channels between them. A feed error stops the pump, closes the relay
// and lets everything downstream drain before the run reports the failure.
//
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::aggregation::TimeAggregation;
use crate::broker::Broker;
use crate::domain::{Candle, Event, ExecutionResult};
use crate::feed::{DataFeed, FeedError};
use crate::metrics::{self, MetricsSink};
use crate::strategy::Strategy;

/// Enough to buffer one day of 1-second ticks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 86_400;

/// How long the final summary may wait for room in the recorder queue.
const SUMMARY_SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum CerberoError {
    #[error("data feed failed: {source}")]
    Feed {
        #[source]
        source: FeedError,
        /// Summary of whatever was filled before the failure.
        partial: ExecutionResult,
    },
    #[error("cerbero instances run once")]
    AlreadyRan,
    #[error("pipeline task failed: {0}")]
    Task(#[from] JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState { Idle, Running, Draining, Terminated }

pub struct Cerbero {
    broker: Arc<dyn Broker>,
    strategy: Option<Box<dyn Strategy>>,
    feed: Box<dyn DataFeed>,
    aggregation: TimeAggregation,
    metrics: Arc<dyn MetricsSink>,
    recorder: Option<mpsc::Sender<Event>>,
    cancel: Option<watch::Receiver<bool>>,
    queue_capacity: usize,
    history_limit: Option<usize>,
    state: Arc<Mutex<RunState>>,
}

impl fmt::Debug for Cerbero {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cerbero")
            .field("aggregation", &self.aggregation)
            .field("queue_capacity", &self.queue_capacity)
            .field("history_limit", &self.history_limit)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Cerbero {
    pub fn new(broker: Arc<dyn Broker>, strategy: Box<dyn Strategy>, feed: Box<dyn DataFeed>) -> Self {
        Self {
            broker,
            strategy: Some(strategy),
            feed,
            aggregation: TimeAggregation::None,
            metrics: metrics::noop(),
            recorder: None,
            cancel: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            history_limit: None,
            state: Arc::new(Mutex::new(RunState::Idle)),
        }
    }

    pub fn with_aggregation(mut self, a: TimeAggregation) -> Self { self.aggregation = a; self }
    pub fn with_metrics(mut self, m: Arc<dyn MetricsSink>) -> Self { self.metrics = m; self }
    pub fn with_recorder(mut self, tx: mpsc::Sender<Event>) -> Self { self.recorder = Some(tx); self }
    /// Flipping the watch to `true` stops the feed early; the run still drains and succeeds.
    pub fn with_cancel(mut self, rx: watch::Receiver<bool>) -> Self { self.cancel = Some(rx); self }
    pub fn with_queue_capacity(mut self, n: usize) -> Self { self.queue_capacity = n.max(1); self }
    /// Keep only the newest `n` buckets in the strategy history.
    pub fn with_history_limit(mut self, n: usize) -> Self { self.history_limit = Some(n.max(1)); self }

    pub fn broker(&self) -> Arc<dyn Broker> { self.broker.clone() }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(state: &Mutex<RunState>, next: RunState) {
        *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
        debug!(state = ?next, "cerbero state");
    }

    pub async fn run(&mut self) -> Result<ExecutionResult, CerberoError> {
        let Some(mut strategy) = self.strategy.take() else {
            return Err(CerberoError::AlreadyRan);
        };
        Self::set_state(&self.state, RunState::Running);

        let started = Instant::now();
        let initial_cash = self.broker.available_cash();
        info!(initial_cash, aggregation = ?self.aggregation, "cerbero run started");
        record(
            &self.recorder,
            Event::Note(format!("run started: initial_cash={initial_cash} aggregation={:?}", self.aggregation)),
        );

        let (relay_tx, relay_rx) = mpsc::channel::<Candle>(self.queue_capacity);
        let mut aggregated = self.aggregation.spawn(relay_rx, self.queue_capacity);

        // an open error goes through the pump, it is as fatal as a mid-stream one
        let opened = self.feed.run();
        let cancel = self.cancel.clone();
        let state = self.state.clone();
        let pump = tokio::spawn(async move {
            let result = pump_feed(opened, relay_tx, cancel).await;
            Self::set_state(&state, RunState::Draining);
            result
        });

        strategy.initialize(self.broker.clone());

        let broker = self.broker.clone();
        let metrics = self.metrics.clone();
        let recorder = self.recorder.clone();
        let history_limit = self.history_limit;
        let evaluation = tokio::spawn(async move {
            let mut history: VecDeque<Candle> = VecDeque::new();
            let mut buckets: u64 = 0;
            info!("started strategy routine");

            while let Some(agg) = aggregated.recv().await {
                // orders are matched at raw tick resolution
                metrics.record_tick(&agg.original);
                for order in broker.process_orders(&agg.original) {
                    if order.size_filled > 0 {
                        record(&recorder, Event::Fill(order));
                    }
                }
                metrics.record_cash(&agg.original, broker.available_cash());

                if !agg.is_complete {
                    continue;
                }

                metrics.record_bucket(&agg.aggregate);
                record(&recorder, Event::Bucket(agg.aggregate.clone()));
                history.push_back(agg.aggregate);
                if let Some(limit) = history_limit {
                    while history.len() > limit {
                        history.pop_front();
                    }
                }
                buckets += 1;
                strategy.eval(history.make_contiguous());
            }

            debug!(buckets, "strategy routine drained");
            strategy
        });

        let (pumped, evaluated) = tokio::join!(pump, evaluation);

        // the broker is shut down even when the strategy routine died
        self.broker.shutdown();
        let evaluated = evaluated.map(|mut strategy| strategy.shutdown());
        Self::set_state(&self.state, RunState::Terminated);

        let result = ExecutionResult::compute(started, initial_cash, self.broker.available_cash());
        record_summary(&self.recorder, &result).await;

        if let Err(e) = evaluated {
            error!(%e, final_cash = result.final_cash, "strategy routine failed");
            return Err(CerberoError::Task(e));
        }

        match pumped? {
            Ok(ticks) => {
                info!(ticks, final_cash = result.final_cash, pl = result.pl, elapsed = %result.total_time_string, "cerbero run finished");
                Ok(result)
            }
            Err(source) => {
                error!(%source, final_cash = result.final_cash, "cerbero run aborted by feed");
                Err(CerberoError::Feed { source, partial: result })
            }
        }
    }
}

fn record(recorder: &Option<mpsc::Sender<Event>>, ev: Event) {
    if let Some(tx) = recorder {
        // the recorder never slows the pipeline down
        if tx.try_send(ev).is_err() {
            debug!("recorder busy or closed, event dropped");
        }
    }
}

/// The summary is sent once everything has drained, so it may wait for room.
async fn record_summary(recorder: &Option<mpsc::Sender<Event>>, result: &ExecutionResult) {
    let Some(tx) = recorder else { return };
    match tokio::time::timeout(SUMMARY_SEND_TIMEOUT, tx.send(Event::Summary(result.clone()))).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => debug!("recorder closed, summary not recorded"),
        Err(_) => warn!("recorder stuck, summary dropped"),
    }
}

enum Next {
    Item(Option<Result<Candle, FeedError>>),
    Cancelled,
    Changed,
    Unwatched,
}

/// Forwards every tick to the relay. Returns the number of ticks forwarded.
/// Dropping `relay` on return closes the pipeline.
async fn pump_feed(
    opened: Result<mpsc::Receiver<Result<Candle, FeedError>>, FeedError>,
    relay: mpsc::Sender<Candle>,
    mut cancel: Option<watch::Receiver<bool>>,
) -> Result<u64, FeedError> {
    let mut feed = opened?;
    info!("started base feed consumer routine");
    let mut ticks: u64 = 0;

    loop {
        let next = match cancel.as_mut() {
            Some(c) if *c.borrow() => Next::Cancelled,
            Some(c) => tokio::select! {
                item = feed.recv() => Next::Item(item),
                changed = c.changed() => if changed.is_ok() { Next::Changed } else { Next::Unwatched },
            },
            None => Next::Item(feed.recv().await),
        };

        match next {
            Next::Cancelled => {
                warn!(ticks, "run cancelled, closing relay");
                return Ok(ticks);
            }
            Next::Changed => continue,
            Next::Unwatched => {
                // nobody can cancel anymore
                cancel = None;
            }
            Next::Item(Some(Ok(tick))) => {
                if relay.send(tick).await.is_err() {
                    warn!("relay closed downstream, stopping feed pump");
                    return Ok(ticks);
                }
                ticks += 1;
            }
            Next::Item(Some(Err(e))) => {
                error!(%e, ticks, "error consuming base feed");
                return Err(e);
            }
            Next::Item(None) => {
                info!(ticks, "base feed closed");
                return Ok(ticks);
            }
        }
    }
}
