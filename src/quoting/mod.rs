//! Quote calculators.
//!
//! Both models are pure: the same market snapshot, position and elapsed time
//! always produce the same [`Quote`]. Randomness lives only in the simulator.

pub mod avellaneda;
pub mod simple;

pub use avellaneda::{AvellanedaParams, AvellanedaQuoter};
pub use simple::{SimpleParams, SimpleQuoter};

use crate::types::{MarketState, Quote};

/// Closed set of quoting models, selected once when an instance is built.
#[derive(Clone, Debug)]
pub enum QuoteModel {
    Simple(SimpleQuoter),
    Avellaneda(AvellanedaQuoter),
}

impl QuoteModel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Simple(_) => "simple",
            Self::Avellaneda(_) => "avellaneda",
        }
    }

    /// `elapsed_secs` is the time since the instance started quoting.
    pub fn compute(&self, market: &MarketState, position: i64, elapsed_secs: f64) -> Quote {
        match self {
            Self::Simple(quoter) => quoter.compute(market, position),
            Self::Avellaneda(quoter) => quoter.compute(market, position, elapsed_secs),
        }
    }
}

/// Zeroes every side whose full fill would move `|position|` above `cap`.
/// Only the breaching side is touched; the other side keeps quoting so the
/// inventory can unwind.
pub fn apply_position_limit(quote: &mut Quote, position: i64, cap: i64) {
    if position + quote.bid.size > cap {
        quote.bid.suppress();
    }
    if position - quote.ask.size < -cap {
        quote.ask.suppress();
    }
}
