//! Strategy configuration.
//!
//! Raw TOML tables are deserialized with defaults, then validated into
//! strongly typed [`StrategyConfig`] records. Any invalid strategy fails the
//! whole load with [`Error::Config`] before an instance is started.

use std::{collections::BTreeMap, env, fs, path::Path, str::FromStr, time::Duration};

use serde::Deserialize;
use tracing::Level;
use url::Url;

use crate::{
    errors::{Error, Result},
    quoting::{AvellanedaParams, AvellanedaQuoter, QuoteModel, SimpleParams, SimpleQuoter},
    types::TradeSide,
};

const DEFAULT_API_TIMEOUT_MS: u64 = 10_000;
const SIMULATED_TICKER: &str = "SIM";

#[derive(Clone, Debug)]
pub struct StrategyConfig {
    pub name: String,
    pub api: ApiConfig,
    pub market_maker: MarketMakerConfig,
    pub dt: Duration,
    pub log_level: Level,
    /// Upper bound on any single trading API call.
    pub api_timeout: Duration,
}

impl StrategyConfig {
    /// Builds the quoting model once; instances never re-dispatch on the
    /// config afterwards.
    pub fn quote_model(&self) -> QuoteModel {
        let mm = &self.market_maker;
        match &mm.model {
            ModelConfig::Simple {
                spread,
                inventory_skew_factor,
            } => QuoteModel::Simple(SimpleQuoter::new(SimpleParams {
                spread: *spread,
                inventory_skew_factor: *inventory_skew_factor,
                order_size: mm.order_size,
                max_position: mm.max_position,
            })),
            ModelConfig::Avellaneda {
                gamma,
                k,
                sigma,
                horizon_secs,
                min_spread,
                position_limit_buffer,
                inventory_skew_factor,
                dynamic_gamma,
            } => QuoteModel::Avellaneda(AvellanedaQuoter::new(AvellanedaParams {
                gamma: *gamma,
                k: *k,
                sigma: *sigma,
                horizon_secs: *horizon_secs,
                min_spread: *min_spread,
                position_limit_buffer: *position_limit_buffer,
                inventory_skew_factor: *inventory_skew_factor,
                dynamic_gamma: *dynamic_gamma,
                order_size: mm.order_size,
                max_position: mm.max_position,
                time_floor_secs: self.dt.as_secs_f64(),
            })),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub kind: ApiKind,
    pub market_ticker: String,
    pub trade_side: TradeSide,
}

#[derive(Clone, Debug)]
pub enum ApiKind {
    Real,
    Simulated(SimulationConfig),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimulationConfig {
    pub initial_price: f64,
    pub volatility: f64,
    pub seed: u64,
}

#[derive(Clone, Debug)]
pub struct MarketMakerConfig {
    pub max_position: i64,
    pub order_expiration: Duration,
    pub order_size: i64,
    pub model: ModelConfig,
}

#[derive(Clone, Debug)]
pub enum ModelConfig {
    Simple {
        spread: f64,
        inventory_skew_factor: f64,
    },
    Avellaneda {
        gamma: f64,
        k: f64,
        sigma: f64,
        horizon_secs: f64,
        min_spread: f64,
        position_limit_buffer: f64,
        inventory_skew_factor: f64,
        dynamic_gamma: bool,
    },
}

/// Credentials for the real exchange, read from the environment.
#[derive(Clone)]
pub struct Credentials {
    pub base_url: Url,
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("base_url", &self.base_url.as_str())
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        let base_url = required_env("KALSHI_BASE_URL")?;
        let email = required_env("KALSHI_EMAIL")?;
        let password = required_env("KALSHI_PASSWORD")?;
        let base_url = Url::parse(&base_url)
            .map_err(|err| Error::config("env", "KALSHI_BASE_URL", err.to_string()))?;
        Ok(Self {
            base_url,
            email,
            password,
        })
    }
}

fn required_env(key: &'static str) -> Result<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(Error::config("env", key, "environment variable missing")),
    }
}

#[derive(Debug, Deserialize)]
struct RawConfigFile {
    #[serde(default)]
    strategies: BTreeMap<String, RawStrategy>,
}

#[derive(Debug, Deserialize)]
struct RawStrategy {
    #[serde(default = "default_dt")]
    dt: f64,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    api_timeout_ms: Option<u64>,
    api: RawApi,
    market_maker: RawMarketMaker,
}

#[derive(Debug, Deserialize)]
struct RawApi {
    #[serde(rename = "type", default = "default_api_type")]
    kind: String,
    #[serde(default)]
    market_ticker: Option<String>,
    #[serde(default)]
    trade_side: TradeSide,
    #[serde(default)]
    simulation: RawSimulation,
}

#[derive(Debug, Deserialize)]
struct RawSimulation {
    #[serde(default = "default_initial_price")]
    initial_price: f64,
    #[serde(default = "default_volatility")]
    volatility: f64,
    #[serde(default = "default_seed")]
    seed: u64,
}

impl Default for RawSimulation {
    fn default() -> Self {
        Self {
            initial_price: default_initial_price(),
            volatility: default_volatility(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawMarketMaker {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default = "default_max_position")]
    max_position: i64,
    #[serde(default)]
    order_expiration: Option<u64>,
    #[serde(default = "default_order_size")]
    order_size: i64,
    #[serde(default)]
    spread: Option<f64>,
    #[serde(default = "default_gamma")]
    gamma: f64,
    #[serde(default = "default_k")]
    k: f64,
    #[serde(default = "default_sigma")]
    sigma: f64,
    #[serde(rename = "T", alias = "t", default = "default_horizon")]
    horizon: f64,
    #[serde(default = "default_min_spread")]
    min_spread: f64,
    #[serde(default = "default_position_limit_buffer")]
    position_limit_buffer: f64,
    #[serde(default)]
    inventory_skew_factor: Option<f64>,
    #[serde(default)]
    dynamic_gamma: bool,
}

fn default_dt() -> f64 {
    1.0
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_api_type() -> String {
    "real".to_string()
}

fn default_initial_price() -> f64 {
    0.5
}

fn default_volatility() -> f64 {
    0.01
}

fn default_seed() -> u64 {
    42
}

fn default_max_position() -> i64 {
    100
}

fn default_order_size() -> i64 {
    1
}

fn default_gamma() -> f64 {
    0.1
}

fn default_k() -> f64 {
    1.5
}

fn default_sigma() -> f64 {
    0.5
}

fn default_horizon() -> f64 {
    3600.0
}

fn default_min_spread() -> f64 {
    0.01
}

fn default_position_limit_buffer() -> f64 {
    0.1
}

const DEFAULT_SIMPLE_SKEW: f64 = 0.001;
const DEFAULT_AVELLANEDA_SKEW: f64 = 0.01;
const DEFAULT_SIMPLE_EXPIRATION_SECS: u64 = 60;
const DEFAULT_AVELLANEDA_EXPIRATION_SECS: u64 = 300;

/// Loads and validates every strategy in a TOML file.
pub fn load_strategies(path: impl AsRef<Path>) -> Result<Vec<StrategyConfig>> {
    let data = fs::read_to_string(path.as_ref())?;
    parse_strategies(&data)
}

pub fn parse_strategies(data: &str) -> Result<Vec<StrategyConfig>> {
    let raw: RawConfigFile = toml::from_str(data)?;
    if raw.strategies.is_empty() {
        return Err(Error::config("*", "strategies", "no strategies configured"));
    }
    let timeout_override = env_u64("MM_API_TIMEOUT_MS");
    raw.strategies
        .into_iter()
        .map(|(name, strategy)| {
            let mut cfg = strategy.validate(name)?;
            if let Some(ms) = timeout_override {
                cfg.api_timeout = Duration::from_millis(ms.max(1));
            }
            Ok(cfg)
        })
        .collect()
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse::<u64>().ok())
}

impl RawStrategy {
    fn validate(self, name: String) -> Result<StrategyConfig> {
        let fail = |field: &'static str, why: &str| Error::config(name.clone(), field, why);

        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(fail("dt", "must be a positive number of seconds"));
        }
        let log_level = Level::from_str(&self.log_level)
            .map_err(|_| fail("log_level", "expected trace, debug, info, warn or error"))?;

        let kind = match self.api.kind.to_ascii_lowercase().as_str() {
            "real" => ApiKind::Real,
            "simulated" => {
                let sim = &self.api.simulation;
                if !(sim.initial_price > 0.0 && sim.initial_price < 1.0) {
                    return Err(fail("api.simulation.initial_price", "must be within (0, 1)"));
                }
                if !(sim.volatility.is_finite() && sim.volatility >= 0.0) {
                    return Err(fail("api.simulation.volatility", "must be non-negative"));
                }
                ApiKind::Simulated(SimulationConfig {
                    initial_price: sim.initial_price,
                    volatility: sim.volatility,
                    seed: sim.seed,
                })
            }
            _ => return Err(fail("api.type", "expected \"real\" or \"simulated\"")),
        };
        let market_ticker = match (&kind, self.api.market_ticker) {
            (_, Some(ticker)) if !ticker.trim().is_empty() => ticker,
            (ApiKind::Simulated(_), _) => SIMULATED_TICKER.to_string(),
            (ApiKind::Real, _) => return Err(fail("api.market_ticker", "required for real api")),
        };

        let mm = self.market_maker;
        if mm.max_position <= 0 {
            return Err(fail("market_maker.max_position", "must be positive"));
        }
        if mm.order_size <= 0 || mm.order_size > mm.max_position {
            return Err(fail(
                "market_maker.order_size",
                "must be positive and not exceed max_position",
            ));
        }
        let (model, default_expiration) = match mm.kind.to_ascii_lowercase().as_str() {
            "simple" => {
                let spread = mm
                    .spread
                    .ok_or_else(|| fail("market_maker.spread", "required for simple maker"))?;
                if !(spread.is_finite() && spread > 0.0) {
                    return Err(fail("market_maker.spread", "must be positive"));
                }
                let skew = mm.inventory_skew_factor.unwrap_or(DEFAULT_SIMPLE_SKEW);
                if !(skew.is_finite() && skew >= 0.0) {
                    return Err(fail("market_maker.inventory_skew_factor", "must be non-negative"));
                }
                (
                    ModelConfig::Simple {
                        spread,
                        inventory_skew_factor: skew,
                    },
                    DEFAULT_SIMPLE_EXPIRATION_SECS,
                )
            }
            "avellaneda" => {
                if !(mm.gamma.is_finite() && mm.gamma > 0.0) {
                    return Err(fail("market_maker.gamma", "must be positive"));
                }
                if !(mm.k.is_finite() && mm.k > 0.0) {
                    return Err(fail("market_maker.k", "must be positive"));
                }
                if !(mm.sigma.is_finite() && mm.sigma >= 0.0) {
                    return Err(fail("market_maker.sigma", "must be non-negative"));
                }
                if !(mm.horizon.is_finite() && mm.horizon > 0.0) {
                    return Err(fail("market_maker.T", "must be positive"));
                }
                if !(mm.min_spread.is_finite() && mm.min_spread >= 0.0) {
                    return Err(fail("market_maker.min_spread", "must be non-negative"));
                }
                if !(0.0..1.0).contains(&mm.position_limit_buffer) {
                    return Err(fail("market_maker.position_limit_buffer", "must be within [0, 1)"));
                }
                let buffered_cap =
                    ((mm.max_position as f64) * (1.0 - mm.position_limit_buffer)).floor() as i64;
                if mm.order_size > buffered_cap {
                    return Err(fail(
                        "market_maker.order_size",
                        &format!("exceeds the buffered position cap {buffered_cap}"),
                    ));
                }
                let skew = mm.inventory_skew_factor.unwrap_or(DEFAULT_AVELLANEDA_SKEW);
                if !(skew.is_finite() && skew >= 0.0) {
                    return Err(fail("market_maker.inventory_skew_factor", "must be non-negative"));
                }
                (
                    ModelConfig::Avellaneda {
                        gamma: mm.gamma,
                        k: mm.k,
                        sigma: mm.sigma,
                        horizon_secs: mm.horizon,
                        min_spread: mm.min_spread,
                        position_limit_buffer: mm.position_limit_buffer,
                        inventory_skew_factor: skew,
                        dynamic_gamma: mm.dynamic_gamma,
                    },
                    DEFAULT_AVELLANEDA_EXPIRATION_SECS,
                )
            }
            _ => {
                return Err(fail(
                    "market_maker.type",
                    "expected \"simple\" or \"avellaneda\"",
                ))
            }
        };

        Ok(StrategyConfig {
            api: ApiConfig {
                kind,
                market_ticker,
                trade_side: self.api.trade_side,
            },
            market_maker: MarketMakerConfig {
                max_position: mm.max_position,
                order_expiration: Duration::from_secs(
                    mm.order_expiration.unwrap_or(default_expiration),
                ),
                order_size: mm.order_size,
                model,
            },
            dt: Duration::from_secs_f64(self.dt),
            log_level,
            api_timeout: Duration::from_millis(
                self.api_timeout_ms.unwrap_or(DEFAULT_API_TIMEOUT_MS).max(1),
            ),
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [strategies.alpha]
        dt = 2.0
        log_level = "debug"

        [strategies.alpha.api]
        type = "simulated"
        trade_side = "no"

        [strategies.alpha.api.simulation]
        initial_price = 0.4
        volatility = 0.02
        seed = 7

        [strategies.alpha.market_maker]
        type = "avellaneda"
        max_position = 20
        order_expiration = 30
        gamma = 0.2
        T = 28800

        [strategies.beta.api]
        market_ticker = "PRES-2028"

        [strategies.beta.market_maker]
        type = "simple"
        spread = 0.04
    "#;

    #[test]
    fn test_parse_and_defaults() {
        let configs = parse_strategies(SAMPLE).unwrap();
        assert_eq!(configs.len(), 2);

        let alpha = &configs[0];
        assert_eq!(alpha.name, "alpha");
        assert_eq!(alpha.dt, Duration::from_secs(2));
        assert_eq!(alpha.log_level, Level::DEBUG);
        assert_eq!(alpha.api.market_ticker, SIMULATED_TICKER);
        assert_eq!(alpha.api.trade_side, TradeSide::No);
        match &alpha.api.kind {
            ApiKind::Simulated(sim) => assert_eq!(sim.seed, 7),
            other => panic!("unexpected api kind {other:?}"),
        }
        assert_eq!(alpha.market_maker.order_expiration, Duration::from_secs(30));
        match alpha.market_maker.model {
            ModelConfig::Avellaneda {
                gamma,
                horizon_secs,
                k,
                ..
            } => {
                assert_eq!(gamma, 0.2);
                assert_eq!(horizon_secs, 28_800.0);
                assert_eq!(k, 1.5);
            }
            _ => panic!("expected avellaneda"),
        }
        assert_eq!(alpha.quote_model().name(), "avellaneda");

        let beta = &configs[1];
        assert!(matches!(beta.api.kind, ApiKind::Real));
        assert_eq!(beta.market_maker.order_expiration, Duration::from_secs(60));
        assert_eq!(beta.market_maker.max_position, 100);
        assert_eq!(beta.quote_model().name(), "simple");
    }

    #[test]
    fn test_unknown_model_is_config_error() {
        let data = r#"
            [strategies.bad.api]
            type = "simulated"
            [strategies.bad.market_maker]
            type = "grid"
        "#;
        let err = parse_strategies(data).unwrap_err();
        assert!(matches!(
            err,
            Error::Config {
                field: "market_maker.type",
                ..
            }
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_api_type_rejected() {
        let data = r#"
            [strategies.bad.api]
            type = "paper"
            [strategies.bad.market_maker]
            type = "simple"
            spread = 0.02
        "#;
        assert!(matches!(
            parse_strategies(data),
            Err(Error::Config { field: "api.type", .. })
        ));
    }

    #[test]
    fn test_simple_requires_spread() {
        let data = r#"
            [strategies.s.api]
            type = "simulated"
            [strategies.s.market_maker]
            type = "simple"
        "#;
        assert!(matches!(
            parse_strategies(data),
            Err(Error::Config {
                field: "market_maker.spread",
                ..
            })
        ));
    }

    #[test]
    fn test_real_requires_ticker() {
        let data = r#"
            [strategies.r.api]
            type = "real"
            [strategies.r.market_maker]
            type = "simple"
            spread = 0.02
        "#;
        assert!(matches!(
            parse_strategies(data),
            Err(Error::Config {
                field: "api.market_ticker",
                ..
            })
        ));
    }

    #[test]
    fn test_order_size_must_fit_buffered_cap() {
        let data = r#"
            [strategies.tight.api]
            type = "simulated"
            [strategies.tight.market_maker]
            type = "avellaneda"
            max_position = 1
        "#;
        let err = parse_strategies(data).unwrap_err();
        assert!(matches!(
            err,
            Error::Config {
                field: "market_maker.order_size",
                ..
            }
        ));

        let relaxed = data.replace("max_position = 1", "max_position = 1\nposition_limit_buffer = 0.0");
        assert!(parse_strategies(&relaxed).is_ok());
    }

    #[test]
    fn test_empty_file_rejected() {
        assert!(parse_strategies("").is_err());
    }
}
