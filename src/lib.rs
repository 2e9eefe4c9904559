#![allow(clippy::too_many_arguments)]

pub mod client;
pub mod config;
pub mod engine;
pub mod errors;
pub mod inventory;
pub mod quoting;
pub mod runner;
pub mod simulation;
pub mod telemetry;
pub(crate) mod timings;
pub mod types;

pub use client::{ApiClient, KalshiClient, TradingApi};
pub use config::{load_strategies, parse_strategies, Credentials, StrategyConfig};
pub use engine::{LifecycleState, StrategyInstance, TickOutcome};
pub use errors::{Error, Result};
pub use quoting::{AvellanedaQuoter, QuoteModel, SimpleQuoter};
pub use runner::{InstanceExit, RunReport, Runner};
pub use simulation::{SimulatedExchange, SimulatedMarket};
pub use telemetry::{TelemetryFeed, TelemetryRecord};
pub use types::{Fill, MarketState, Order, OrderId, OrderRequest, OrderStatus, Quote, Side, TradeSide};
