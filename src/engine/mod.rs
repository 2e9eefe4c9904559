//! Per-strategy order lifecycle.
//!
//! A [`StrategyInstance`] owns one quoting model, one trading client and the
//! local position and order state for a single market. Each tick it observes
//! the venue, recomputes its quote and converges the resting orders onto it:
//! at most one order per side, never marketable, never above the position cap.

mod ledger;
mod lifecycle;
pub mod pricing;
pub mod reconcile;

pub use ledger::OrderLedger;
pub use lifecycle::LifecycleState;
pub use reconcile::{CancelReason, PlannedCancel, ReconcilePlan};

use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::watch,
    time::{interval, sleep, timeout, MissedTickBehavior},
};
use tracing::{debug, error, info, info_span, trace, warn, Span};

use crate::{
    client::TradingApi,
    config::StrategyConfig,
    errors::{Error, Result},
    inventory::PositionState,
    quoting::QuoteModel,
    telemetry::{OrdersBySide, TelemetryFeed, TelemetryRecord},
    timings::{time_async_block, time_block},
    types::{ClientOrderIds, Fill, MarketState, Order, OrderId, OrderRequest, Quote, Side},
};

const INITIAL_BACKOFF_MS: u64 = 50;
const MAX_BACKOFF_MS: u64 = 1_000;
pub const MAX_PLACEMENT_ATTEMPTS: u8 = 3;

struct Observation {
    market: MarketState,
    open_orders: Vec<Order>,
    fills: Vec<Fill>,
    venue_position: i64,
}

/// What a completed tick did.
#[derive(Clone, Debug)]
pub struct TickOutcome {
    pub at: DateTime<Utc>,
    pub mid_price: f64,
    /// Venue-priced quote the orders were reconciled against.
    pub quote: Quote,
    pub position: i64,
    pub new_fills: usize,
    pub canceled: Vec<OrderId>,
    pub placed: Vec<(Side, OrderId)>,
    pub skipped: Vec<Side>,
    pub resting: OrdersBySide,
    /// A stop request arrived before placements ran.
    pub interrupted: bool,
}

impl TickOutcome {
    fn new(market: &MarketState, quote: Quote, position: i64, new_fills: usize) -> Self {
        Self {
            at: market.observed_at,
            mid_price: market.mid_price,
            quote,
            position,
            new_fills,
            canceled: Vec::new(),
            placed: Vec::new(),
            skipped: Vec::new(),
            resting: OrdersBySide::default(),
            interrupted: false,
        }
    }
}

pub struct StrategyInstance<C> {
    config: StrategyConfig,
    client: C,
    model: QuoteModel,
    position: PositionState,
    ledger: OrderLedger,
    client_ids: ClientOrderIds,
    state: LifecycleState,
    started_at: Option<DateTime<Utc>>,
    telemetry: Option<TelemetryFeed>,
    stop: Option<watch::Receiver<bool>>,
}

impl<C: TradingApi> StrategyInstance<C> {
    pub fn new(config: StrategyConfig, client: C) -> Self {
        let model = config.quote_model();
        let position = PositionState::new(config.market_maker.max_position);
        Self {
            config,
            client,
            model,
            position,
            ledger: OrderLedger::new(),
            client_ids: ClientOrderIds::default(),
            state: LifecycleState::Idle,
            started_at: None,
            telemetry: None,
            stop: None,
        }
    }

    pub fn with_telemetry(mut self, feed: TelemetryFeed) -> Self {
        self.telemetry = Some(feed);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn position(&self) -> &PositionState {
        &self.position
    }

    pub fn ledger(&self) -> &OrderLedger {
        &self.ledger
    }

    /// Span every log line of this instance is recorded under. Per-strategy
    /// log levels are expressed as filter directives on it.
    pub fn span(&self) -> Span {
        info_span!(
            "strategy",
            name = %self.config.name,
            ticker = %self.client.market_ticker(),
            side = %self.client.trade_side(),
        )
    }

    fn set_state(&mut self, next: LifecycleState) {
        if self.state.can_transition_to(next) {
            trace!(from = %self.state, to = %next, "lifecycle transition");
            self.state = next;
        } else {
            debug!(from = %self.state, to = %next, "ignoring lifecycle transition");
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Bounds a client call by `api_timeout`; a timeout becomes the error
    /// built by `on_timeout`.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T>>,
        on_timeout: impl FnOnce(String) -> Error,
    ) -> Result<T> {
        match timeout(self.config.api_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(format!(
                "timed out after {:?}",
                self.config.api_timeout
            ))),
        }
    }

    pub async fn authenticate(&self) -> Result<()> {
        self.bounded(self.client.authenticate(), Error::Auth).await
    }

    async fn observe(&self) -> Result<Observation> {
        let market = self
            .bounded(self.client.get_market_state(), Error::MarketData)
            .await?;
        let (open_orders, fills, venue_position) = tokio::try_join!(
            self.bounded(self.client.get_open_orders(), Error::MarketData),
            self.bounded(self.client.get_fills(), Error::MarketData),
            self.bounded(self.client.get_position(), Error::MarketData),
        )?;
        Ok(Observation {
            market,
            open_orders,
            fills,
            venue_position,
        })
    }

    /// Runs one observe, quote, reconcile pass. Errors abort the tick; the
    /// caller decides whether they are fatal.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        self.set_state(LifecycleState::Quoting);
        let observation = match self.observe().await {
            Ok(observation) => observation,
            Err(err) => {
                self.set_state(LifecycleState::Idle);
                return Err(err);
            }
        };
        let now = observation.market.observed_at;
        let started_at = *self.started_at.get_or_insert(now);

        let mut new_fills = 0;
        for fill in &observation.fills {
            if self.position.apply_fill(fill) {
                self.ledger.apply_fill(fill);
                new_fills += 1;
                info!(
                    fill_id = %fill.fill_id,
                    side = %fill.side,
                    price = fill.price,
                    size = fill.size,
                    position = self.position.net_position(),
                    "fill applied"
                );
            }
        }
        if self.position.net_position() != observation.venue_position {
            warn!(
                local = self.position.net_position(),
                venue = observation.venue_position,
                "position drift; resyncing to venue"
            );
            self.position.resync(observation.venue_position, now);
        }
        self.ledger.observe_open(&observation.open_orders);

        let elapsed_secs = (now - started_at).num_milliseconds().max(0) as f64 / 1_000.0;
        let net_position = self.position.net_position();
        let raw = time_block("quote_compute", || {
            self.model
                .compute(&observation.market, net_position, elapsed_secs)
        });
        let quote = pricing::to_venue_quote(&raw, observation.market.mid_price);
        debug!(
            model = self.model.name(),
            reservation = raw.reservation_price,
            spread = raw.spread,
            raw_bid = raw.bid.price,
            raw_ask = raw.ask.price,
            "quote computed"
        );

        let mut outcome = TickOutcome::new(
            &observation.market,
            quote.clone(),
            self.position.net_position(),
            new_fills,
        );
        if self.stop_requested() {
            outcome.interrupted = true;
            self.set_state(LifecycleState::Idle);
            return Ok(outcome);
        }

        self.set_state(LifecycleState::Reconciling);
        let plan = reconcile::plan(
            &observation.open_orders,
            &quote,
            now,
            self.config.market_maker.order_expiration,
        );
        let executed = self.execute(&plan, &mut outcome, now).await;
        self.ledger.prune();
        self.set_state(LifecycleState::Idle);
        executed?;

        outcome.resting = OrdersBySide {
            buy: plan.kept_on(Side::Buy) + placed_on(&outcome, Side::Buy),
            sell: plan.kept_on(Side::Sell) + placed_on(&outcome, Side::Sell),
        };
        info!(
            mid = outcome.mid_price,
            bid = quote.bid.price,
            bid_size = quote.bid.size,
            ask = quote.ask.price,
            ask_size = quote.ask.size,
            position = outcome.position,
            fills = outcome.new_fills,
            canceled = outcome.canceled.len(),
            placed = outcome.placed.len(),
            skipped = ?outcome.skipped,
            "tick complete"
        );
        self.publish(&outcome);
        Ok(outcome)
    }

    /// Cancels first, then places. A side whose cancel failed gets no new
    /// order this tick. Only fatal errors are returned.
    async fn execute(
        &mut self,
        plan: &ReconcilePlan,
        outcome: &mut TickOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut blocked: Vec<Side> = Vec::new();
        for cancel in &plan.cancels {
            debug!(
                order_id = %cancel.order_id,
                side = %cancel.side,
                reason = %cancel.reason,
                "canceling order"
            );
            let order_id = cancel.order_id.clone();
            let result = self
                .bounded(self.client.cancel_order(&cancel.order_id), |message| {
                    Error::Cancel { order_id, message }
                })
                .await;
            match result {
                Ok(()) => {
                    self.ledger.mark_canceled(&cancel.order_id);
                    outcome.canceled.push(cancel.order_id.clone());
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(
                        error = %err,
                        kind = err.kind(),
                        side = %cancel.side,
                        "cancel failed; holding placements on side"
                    );
                    if !blocked.contains(&cancel.side) {
                        blocked.push(cancel.side);
                    }
                }
            }
        }

        if self.stop_requested() {
            outcome.interrupted = true;
            return Ok(());
        }

        for planned in &plan.placements {
            if blocked.contains(&planned.side) {
                outcome.skipped.push(planned.side);
                continue;
            }
            let request = OrderRequest {
                client_order_id: Some(self.client_ids.next()),
                ..planned.clone()
            };
            match self.place_with_retry(&request).await {
                Ok(order_id) => {
                    debug!(
                        %order_id,
                        side = %request.side,
                        price = request.price,
                        size = request.size,
                        "order placed"
                    );
                    self.ledger
                        .record_submitted(order_id.clone(), &request, now);
                    outcome.placed.push((request.side, order_id));
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(
                        error = %err,
                        kind = err.kind(),
                        side = %request.side,
                        "placement skipped"
                    );
                    outcome.skipped.push(request.side);
                }
            }
        }
        Ok(())
    }

    /// Places `request`, retrying transient failures with the same client
    /// order id. Before each retry the venue is asked whether an earlier
    /// attempt was accepted anyway, so a lost ack never doubles the side.
    async fn place_with_retry(&self, request: &OrderRequest) -> Result<OrderId> {
        let mut backoff = Duration::from_millis(INITIAL_BACKOFF_MS);
        let mut attempt: u8 = 1;
        loop {
            let result = self
                .bounded(self.client.place_order(request), Error::transient)
                .await;
            let err = match result {
                Err(err) if err.is_transient_placement() => err,
                other => return other,
            };
            if let Some(order_id) = self.find_accepted(request).await {
                info!(
                    %order_id,
                    attempt,
                    error = %err,
                    "placement failed but order is resting; adopting it"
                );
                return Ok(order_id);
            }
            if attempt >= MAX_PLACEMENT_ATTEMPTS || self.stop_requested() {
                return Err(err);
            }
            debug!(
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "transient placement failure; retrying"
            );
            sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_millis(MAX_BACKOFF_MS));
            attempt += 1;
        }
    }

    /// Resting order carrying `request`'s client order id, if any.
    async fn find_accepted(&self, request: &OrderRequest) -> Option<OrderId> {
        let client_order_id = request.client_order_id.as_deref()?;
        match self
            .bounded(self.client.get_open_orders(), Error::MarketData)
            .await
        {
            Ok(resting) => resting
                .into_iter()
                .find(|o| o.client_order_id.as_deref() == Some(client_order_id))
                .map(|o| o.id),
            Err(err) => {
                debug!(error = %err, client_order_id, "could not check for accepted order");
                None
            }
        }
    }

    fn publish(&self, outcome: &TickOutcome) {
        let Some(feed) = &self.telemetry else {
            return;
        };
        feed.publish(TelemetryRecord {
            strategy_name: self.config.name.clone(),
            trade_side: self.client.trade_side(),
            market_ticker: self.client.market_ticker().to_string(),
            open_orders_by_side: outcome.resting,
            position: self.position.snapshot(),
            mid_price: outcome.mid_price,
            quote: Some(outcome.quote.clone()),
            timestamp: outcome.at,
        });
    }

    /// Cancels every order this instance may have resting and logs out.
    /// Returns how many cancels failed.
    pub async fn shutdown(&mut self) -> usize {
        if self.state.is_stopped() {
            return 0;
        }
        self.set_state(LifecycleState::Stopping);

        let mut ids = self.ledger.live_ids();
        match self
            .bounded(self.client.get_open_orders(), Error::MarketData)
            .await
        {
            Ok(resting) => {
                for order in resting {
                    if !ids.contains(&order.id) {
                        ids.push(order.id);
                    }
                }
            }
            Err(err) => warn!(error = %err, "could not list resting orders during shutdown"),
        }

        let mut failed = 0;
        for order_id in &ids {
            let id = order_id.clone();
            let result = self
                .bounded(self.client.cancel_order(order_id), |message| Error::Cancel {
                    order_id: id,
                    message,
                })
                .await;
            match result {
                Ok(()) => self.ledger.mark_canceled(order_id),
                Err(err) => {
                    failed += 1;
                    warn!(error = %err, "cancel during shutdown failed");
                }
            }
        }
        self.ledger.prune();

        if let Err(err) = self.bounded(self.client.logout(), Error::Auth).await {
            warn!(error = %err, "logout failed");
        }
        self.set_state(LifecycleState::Stopped);
        info!(
            canceled = ids.len() - failed,
            failed,
            position = self.position.net_position(),
            "strategy stopped"
        );
        failed
    }

    /// Ticks every `dt` until `stop` flips to `true` or a fatal error occurs,
    /// then shuts down. Ticks never overlap; a slow tick delays the next one.
    pub async fn run(mut self, stop: watch::Receiver<bool>) -> Result<()> {
        self.stop = Some(stop.clone());
        let mut stop = stop;
        info!(
            model = self.model.name(),
            dt_ms = self.config.dt.as_millis() as u64,
            max_position = self.config.market_maker.max_position,
            "starting strategy"
        );

        if let Err(err) = self.authenticate().await {
            error!(error = %err, kind = err.kind(), "authentication failed");
            self.set_state(LifecycleState::Stopping);
            self.set_state(LifecycleState::Stopped);
            return Err(err);
        }

        let mut ticker = interval(self.config.dt);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failure = None;
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    let budget = self.config.dt;
                    match time_async_block("strategy_tick", budget, self.tick()).await {
                        Ok(_) => {}
                        Err(err) if err.is_fatal() => {
                            error!(error = %err, kind = err.kind(), "fatal error; stopping strategy");
                            failure = Some(err);
                            break;
                        }
                        Err(err) => {
                            warn!(error = %err, kind = err.kind(), "tick aborted");
                        }
                    }
                }
            }
        }

        self.shutdown().await;
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn placed_on(outcome: &TickOutcome, side: Side) -> usize {
    outcome.placed.iter().filter(|(s, _)| *s == side).count()
}
