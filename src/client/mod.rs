//! Trading API clients.
//!
//! [`TradingApi`] is the capability set the lifecycle engine depends on. It is
//! implemented by the real exchange adapter ([`KalshiClient`]) and by the
//! in-process simulator ([`SimulatedExchange`]); [`ApiClient`] closes over the
//! two so the choice is made once, from configuration.

mod auth;
mod rest;

pub use rest::KalshiClient;

use async_trait::async_trait;

use crate::{
    config::{ApiKind, Credentials, StrategyConfig},
    errors::{Error, Result},
    simulation::SimulatedExchange,
    types::{Fill, MarketState, Order, OrderId, OrderRequest, TradeSide},
};

#[async_trait]
pub trait TradingApi: Send + Sync {
    fn market_ticker(&self) -> &str;

    fn trade_side(&self) -> TradeSide;

    /// Establishes or refreshes credentials. Fails with [`Error::Auth`].
    async fn authenticate(&self) -> Result<()>;

    /// Fails with [`Error::MarketData`] on timeout or malformed payloads.
    async fn get_market_state(&self) -> Result<MarketState>;

    /// Resting orders on the traded side, oldest first.
    async fn get_open_orders(&self) -> Result<Vec<Order>>;

    async fn get_position(&self) -> Result<i64>;

    /// Recent fills. The same fill may be returned by several calls.
    async fn get_fills(&self) -> Result<Vec<Fill>>;

    /// Fails with [`Error::OrderPlacement`], split into transient and
    /// permanent failures.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderId>;

    /// Canceling an order that is already terminal is a no-op.
    async fn cancel_order(&self, order_id: &OrderId) -> Result<()>;

    async fn logout(&self) -> Result<()> {
        Ok(())
    }
}

/// Client variant chosen from a strategy's `api.type`.
pub enum ApiClient {
    Real(KalshiClient),
    Simulated(SimulatedExchange),
}

impl ApiClient {
    pub fn from_config(config: &StrategyConfig, credentials: Option<&Credentials>) -> Result<Self> {
        match &config.api.kind {
            ApiKind::Real => {
                let credentials = credentials.ok_or_else(|| {
                    Error::config(
                        config.name.clone(),
                        "api.type",
                        "real api requires KALSHI_* credentials",
                    )
                })?;
                Ok(Self::Real(KalshiClient::new(
                    credentials.clone(),
                    config.api.market_ticker.clone(),
                    config.api.trade_side,
                    config.api_timeout,
                )?))
            }
            ApiKind::Simulated(sim) => Ok(Self::Simulated(SimulatedExchange::new(
                sim,
                config.api.market_ticker.clone(),
                config.api.trade_side,
                config.dt,
            )?)),
        }
    }
}

#[async_trait]
impl TradingApi for ApiClient {
    fn market_ticker(&self) -> &str {
        match self {
            Self::Real(client) => client.market_ticker(),
            Self::Simulated(client) => client.market_ticker(),
        }
    }

    fn trade_side(&self) -> TradeSide {
        match self {
            Self::Real(client) => client.trade_side(),
            Self::Simulated(client) => client.trade_side(),
        }
    }

    async fn authenticate(&self) -> Result<()> {
        match self {
            Self::Real(client) => client.authenticate().await,
            Self::Simulated(client) => client.authenticate().await,
        }
    }

    async fn get_market_state(&self) -> Result<MarketState> {
        match self {
            Self::Real(client) => client.get_market_state().await,
            Self::Simulated(client) => client.get_market_state().await,
        }
    }

    async fn get_open_orders(&self) -> Result<Vec<Order>> {
        match self {
            Self::Real(client) => client.get_open_orders().await,
            Self::Simulated(client) => client.get_open_orders().await,
        }
    }

    async fn get_position(&self) -> Result<i64> {
        match self {
            Self::Real(client) => client.get_position().await,
            Self::Simulated(client) => client.get_position().await,
        }
    }

    async fn get_fills(&self) -> Result<Vec<Fill>> {
        match self {
            Self::Real(client) => client.get_fills().await,
            Self::Simulated(client) => client.get_fills().await,
        }
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderId> {
        match self {
            Self::Real(client) => client.place_order(request).await,
            Self::Simulated(client) => client.place_order(request).await,
        }
    }

    async fn cancel_order(&self, order_id: &OrderId) -> Result<()> {
        match self {
            Self::Real(client) => client.cancel_order(order_id).await,
            Self::Simulated(client) => client.cancel_order(order_id).await,
        }
    }

    async fn logout(&self) -> Result<()> {
        match self {
            Self::Real(client) => client.logout().await,
            Self::Simulated(client) => client.logout().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_strategies;

    #[tokio::test]
    async fn test_simulated_client_from_config() {
        let configs = parse_strategies(
            r#"
            [strategies.sim.api]
            type = "simulated"
            market_ticker = "SIM-TEST"
            [strategies.sim.market_maker]
            type = "simple"
            spread = 0.02
            "#,
        )
        .unwrap();
        let client = ApiClient::from_config(&configs[0], None).unwrap();
        assert!(matches!(client, ApiClient::Simulated(_)));
        assert_eq!(client.market_ticker(), "SIM-TEST");
        client.authenticate().await.unwrap();
        let state = client.get_market_state().await.unwrap();
        assert!(state.mid_price > 0.0 && state.mid_price < 1.0);
    }

    #[test]
    fn test_real_client_requires_credentials() {
        let configs = parse_strategies(
            r#"
            [strategies.live.api]
            type = "real"
            market_ticker = "PRES-2028"
            [strategies.live.market_maker]
            type = "simple"
            spread = 0.02
            "#,
        )
        .unwrap();
        let err = ApiClient::from_config(&configs[0], None).err().unwrap();
        assert!(matches!(err, Error::Config { .. }));
    }
}
