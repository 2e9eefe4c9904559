use std::fmt;

use thiserror::Error;

use crate::types::{OrderId, OrderStatus};

pub type Result<T> = std::result::Result<T, Error>;

/// Whether a failed order submission is worth retrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlacementFailure {
    /// Rate limited, timed out or the venue was unreachable.
    Transient,
    /// Rejected by the venue; retrying the same request will not help.
    Permanent,
}

impl fmt::Display for PlacementFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid config for strategy {strategy}: {field}: {why}")]
    Config {
        strategy: String,
        field: &'static str,
        why: String,
    },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("market data unavailable: {0}")]
    MarketData(String),
    #[error("order placement failed ({kind}): {message}")]
    OrderPlacement {
        kind: PlacementFailure,
        message: String,
    },
    #[error("cancel of order {order_id} failed: {message}")]
    Cancel { order_id: OrderId, message: String },
    #[error("simulation error: {0}")]
    Simulation(String),
    #[error("order {order_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(strategy: impl Into<String>, field: &'static str, why: impl Into<String>) -> Self {
        Error::Config {
            strategy: strategy.into(),
            field,
            why: why.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Error::OrderPlacement {
            kind: PlacementFailure::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Error::OrderPlacement {
            kind: PlacementFailure::Permanent,
            message: message.into(),
        }
    }

    /// Fatal errors stop the owning strategy instance. Everything else is
    /// handled inside the tick that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config { .. } | Error::Auth(_) | Error::Simulation(_)
        )
    }

    pub fn is_transient_placement(&self) -> bool {
        matches!(
            self,
            Error::OrderPlacement {
                kind: PlacementFailure::Transient,
                ..
            }
        )
    }

    /// Short label used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config",
            Error::Auth(_) => "auth",
            Error::MarketData(_) => "market_data",
            Error::OrderPlacement {
                kind: PlacementFailure::Transient,
                ..
            } => "order_placement_transient",
            Error::OrderPlacement {
                kind: PlacementFailure::Permanent,
                ..
            } => "order_placement_permanent",
            Error::Cancel { .. } => "cancel",
            Error::Simulation(_) => "simulation",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::Http { .. } => "http",
            Error::Reqwest(_) => "transport",
            Error::Json(_) => "json",
            Error::Url(_) => "url",
            Error::Toml(_) => "toml",
            Error::Io(_) => "io",
        }
    }

    /// Builds an error from a non-success HTTP response, mirroring the
    /// status-with-body format the REST client logs.
    pub fn with_http_status(status: reqwest::StatusCode, body: &str) -> Self {
        Error::Http {
            status: status.as_u16(),
            body: body.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Auth("expired".into()).is_fatal());
        assert!(Error::Simulation("bad seed".into()).is_fatal());
        assert!(Error::config("alpha", "dt", "must be positive").is_fatal());
        assert!(!Error::MarketData("timeout".into()).is_fatal());
        assert!(!Error::transient("429").is_fatal());
        assert!(!Error::permanent("rejected").is_fatal());
    }

    #[test]
    fn test_placement_kinds() {
        assert!(Error::transient("rate limited").is_transient_placement());
        assert!(!Error::permanent("rejected").is_transient_placement());
        assert_eq!(Error::permanent("x").kind(), "order_placement_permanent");
    }
}
