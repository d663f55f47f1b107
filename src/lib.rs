// ===============================
// src/lib.rs
// ===============================
pub mod aggregation;
pub mod broker;
pub mod cerbero;
pub mod config;
pub mod domain;
pub mod feed;
pub mod metrics;
pub mod recorder;
pub mod strategy;

pub use aggregation::TimeAggregation;
pub use broker::{BacktestBroker, Broker, BrokerError, FundingPolicy};
pub use cerbero::{Cerbero, CerberoError, RunState};
pub use domain::{AggregatedCandle, Candle, ExecutionResult, Order, OrderId, OrderStatus, Position, Side, Symbol};
pub use feed::{DataFeed, FeedError, MockFeed, VecFeed};
pub use strategy::Strategy;
