use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    auth::{AuthCache, Session},
    TradingApi,
};
use crate::{
    config::Credentials,
    errors::{Error, Result},
    types::{
        ClientOrderIds, Fill, MarketState, Order, OrderId, OrderRequest, OrderStatus, Side,
        TradeSide,
    },
};

const AUTH_MAX_ATTEMPTS: u32 = 3;
const AUTH_INITIAL_BACKOFF_MS: u64 = 500;
const CENTS_PER_DOLLAR: f64 = 100.0;

/// REST adapter for a Kalshi-style exchange.
pub struct KalshiClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: Credentials,
    market_ticker: String,
    trade_side: TradeSide,
    auth: AuthCache,
    client_ids: ClientOrderIds,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
    #[serde(default)]
    member_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MarketEnvelope {
    market: MarketQuote,
}

#[derive(Debug, Deserialize)]
struct MarketQuote {
    #[serde(default)]
    yes_bid: Option<f64>,
    #[serde(default)]
    yes_ask: Option<f64>,
    #[serde(default)]
    no_bid: Option<f64>,
    #[serde(default)]
    no_ask: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PositionsEnvelope {
    #[serde(default)]
    market_positions: Vec<MarketPosition>,
}

#[derive(Debug, Deserialize)]
struct MarketPosition {
    ticker: String,
    position: i64,
}

#[derive(Debug, Deserialize)]
struct OrdersEnvelope {
    #[serde(default)]
    orders: Vec<RestOrder>,
}

#[derive(Debug, Deserialize)]
struct RestOrder {
    order_id: String,
    action: Side,
    side: TradeSide,
    #[serde(default)]
    yes_price: Option<f64>,
    #[serde(default)]
    no_price: Option<f64>,
    #[serde(default)]
    remaining_count: Option<i64>,
    #[serde(default)]
    initial_count: Option<i64>,
    #[serde(default)]
    created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    expiration_time: Option<DateTime<Utc>>,
    #[serde(default)]
    client_order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FillsEnvelope {
    #[serde(default)]
    fills: Vec<RestFill>,
}

#[derive(Debug, Deserialize)]
struct RestFill {
    trade_id: String,
    order_id: String,
    action: Side,
    side: TradeSide,
    count: i64,
    #[serde(default)]
    yes_price: Option<f64>,
    #[serde(default)]
    no_price: Option<f64>,
    #[serde(default)]
    created_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderResponse {
    order: PlacedOrder,
}

#[derive(Debug, Deserialize)]
struct PlacedOrder {
    order_id: String,
}

impl KalshiClient {
    pub fn new(
        credentials: Credentials,
        market_ticker: String,
        trade_side: TradeSide,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let mut base_url = credentials.base_url.clone();
        // Url::join drops the last path segment unless it ends with '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http,
            base_url,
            credentials,
            market_ticker,
            trade_side,
            auth: AuthCache::default(),
            client_ids: ClientOrderIds::default(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    async fn login(&self) -> Result<Session> {
        let url = self.endpoint("login")?;
        let body = json!({
            "email": self.credentials.email,
            "password": self.credentials.password,
        });
        let response = self.http.post(url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        let parsed: LoginResponse = decode(status, &text)?;
        Ok(Session {
            token: parsed.token,
            member_id: parsed.member_id,
        })
    }

    /// Logs in with doubling backoff; exhausting the attempts is an
    /// [`Error::Auth`].
    async fn login_with_retry(&self) -> Result<Session> {
        let mut backoff = Duration::from_millis(AUTH_INITIAL_BACKOFF_MS);
        let mut last_error = String::new();
        for attempt in 1..=AUTH_MAX_ATTEMPTS {
            match self.login().await {
                Ok(session) => {
                    info!(
                        member_id = session.member_id.as_deref().unwrap_or("-"),
                        "Successfully logged in"
                    );
                    return Ok(session);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "login failed");
                    last_error = err.to_string();
                    if attempt < AUTH_MAX_ATTEMPTS {
                        sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        Err(Error::Auth(format!(
            "login failed after {AUTH_MAX_ATTEMPTS} attempts: {last_error}"
        )))
    }

    /// Cached session token. `rejected` forces a new login unless a
    /// concurrent request already replaced that token.
    async fn bearer(&self, rejected: Option<&str>) -> Result<String> {
        self.auth
            .token_or_login(rejected, || self.login_with_retry())
            .await
    }

    async fn send_raw(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        token: &str,
    ) -> Result<reqwest::Response> {
        let url = self.endpoint(path)?;
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(token)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Sends an authenticated request. A 401 replaces the session and
    /// retries once; a second 401 is an [`Error::Auth`].
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<T> {
        let token = self.bearer(None).await?;
        let mut response = self
            .send_raw(method.clone(), path, query, body, &token)
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            debug!(path, "session rejected; re-authenticating");
            let token = self.bearer(Some(token.as_str())).await?;
            response = self.send_raw(method, path, query, body, &token).await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                self.auth.invalidate().await;
                return Err(Error::Auth(format!("{path} rejected fresh session")));
            }
        }
        let status = response.status();
        let text = response.text().await?;
        debug!(path, status = status.as_u16(), "response received");
        decode(status, &text)
    }
}

fn decode<T: DeserializeOwned>(status: StatusCode, text: &str) -> Result<T> {
    if !status.is_success() {
        return Err(Error::with_http_status(status, text));
    }
    Ok(serde_json::from_str(text)?)
}

/// Price of the traded side in dollars; the venue quotes cents.
fn side_price(side: TradeSide, yes: Option<f64>, no: Option<f64>) -> Option<f64> {
    let cents = match side {
        TradeSide::Yes => yes,
        TradeSide::No => no,
    }?;
    Some(cents / CENTS_PER_DOLLAR)
}

fn two_sided_mid(market: &MarketQuote, side: TradeSide) -> Option<f64> {
    let bid = side_price(side, market.yes_bid, market.no_bid)?;
    let ask = side_price(side, market.yes_ask, market.no_ask)?;
    (bid > 0.0 && ask > bid).then(|| (bid + ask) / 2.0)
}

/// The venue reports YES contracts; a NO position is the negation.
fn side_position(positions: &[MarketPosition], ticker: &str, side: TradeSide) -> i64 {
    let total: i64 = positions
        .iter()
        .filter(|p| p.ticker == ticker)
        .map(|p| p.position)
        .sum();
    match side {
        TradeSide::Yes => total,
        TradeSide::No => -total,
    }
}

fn resting_orders(orders: Vec<RestOrder>, side: TradeSide) -> Vec<Order> {
    let mut resting: Vec<Order> = orders
        .into_iter()
        .filter(|o| o.side == side)
        .filter_map(|o| {
            let price = side_price(side, o.yes_price, o.no_price)?;
            let remaining = o.remaining_count.unwrap_or(0);
            let size = o.initial_count.unwrap_or(remaining);
            let mut order = Order::new(
                OrderId::new(o.order_id),
                o.action,
                price,
                size,
                o.created_time.unwrap_or_else(Utc::now),
                o.expiration_time,
            );
            order.remaining = remaining;
            order.status = OrderStatus::Open;
            order.client_order_id = o.client_order_id;
            Some(order)
        })
        .collect();
    resting.sort_by_key(|o| o.placed_at);
    resting
}

fn side_fills(fills: Vec<RestFill>, side: TradeSide) -> Vec<Fill> {
    fills
        .into_iter()
        .filter(|f| f.side == side)
        .map(|f| Fill {
            price: side_price(side, f.yes_price, f.no_price).unwrap_or_default(),
            fill_id: f.trade_id,
            order_id: OrderId::new(f.order_id),
            side: f.action,
            size: f.count,
            filled_at: f.created_time.unwrap_or_else(Utc::now),
        })
        .collect()
}

fn order_body(
    ticker: &str,
    side: TradeSide,
    request: &OrderRequest,
    client_order_id: &str,
) -> Value {
    let cents = (request.price * CENTS_PER_DOLLAR).round() as i64;
    let mut body = json!({
        "ticker": ticker,
        "action": request.side.as_str(),
        "type": "limit",
        "side": side.as_str(),
        "count": request.size,
        "client_order_id": client_order_id,
    });
    body[format!("{}_price", side.as_str())] = json!(cents);
    if let Some(expires_at) = request.expires_at {
        body["expiration_ts"] = json!(expires_at.timestamp());
    }
    body
}

/// Keeps auth failures fatal and folds everything else into `wrap`.
fn classify(err: Error, wrap: impl FnOnce(String) -> Error) -> Error {
    match err {
        Error::Auth(_) => err,
        other => wrap(other.to_string()),
    }
}

fn placement_error(err: Error) -> Error {
    match err {
        Error::Auth(_) => err,
        Error::Http { status, body } if status == 429 || status >= 500 => {
            Error::transient(format!("http {status}: {body}"))
        }
        Error::Http { status, body } => Error::permanent(format!("http {status}: {body}")),
        Error::Reqwest(inner) => Error::transient(inner.to_string()),
        other => Error::permanent(other.to_string()),
    }
}

/// 404 means the order is already gone.
fn cancel_outcome(order_id: &OrderId, result: Result<Value>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(Error::Http { status: 404, .. }) => {
            debug!(%order_id, "cancel of unknown or terminal order ignored");
            Ok(())
        }
        Err(err @ Error::Auth(_)) => Err(err),
        Err(err) => Err(Error::Cancel {
            order_id: order_id.clone(),
            message: err.to_string(),
        }),
    }
}

#[async_trait]
impl TradingApi for KalshiClient {
    fn market_ticker(&self) -> &str {
        &self.market_ticker
    }

    fn trade_side(&self) -> TradeSide {
        self.trade_side
    }

    async fn authenticate(&self) -> Result<()> {
        self.auth.invalidate().await;
        self.bearer(None).await.map(|_| ())
    }

    async fn get_market_state(&self) -> Result<MarketState> {
        let path = format!("markets/{}", self.market_ticker);
        let envelope: MarketEnvelope = self
            .request(Method::GET, &path, &[], None)
            .await
            .map_err(|err| classify(err, Error::MarketData))?;
        let mid = two_sided_mid(&envelope.market, self.trade_side).ok_or_else(|| {
            Error::MarketData(format!(
                "{} has no two-sided {} market",
                self.market_ticker, self.trade_side
            ))
        })?;
        debug!(side = %self.trade_side, mid, "mid-market price");
        Ok(MarketState {
            ticker: self.market_ticker.clone(),
            mid_price: mid,
            observed_at: Utc::now(),
        })
    }

    async fn get_open_orders(&self) -> Result<Vec<Order>> {
        let query = [
            ("ticker", self.market_ticker.clone()),
            ("status", "resting".to_string()),
        ];
        let envelope: OrdersEnvelope = self
            .request(Method::GET, "portfolio/orders", &query, None)
            .await
            .map_err(|err| classify(err, Error::MarketData))?;
        Ok(resting_orders(envelope.orders, self.trade_side))
    }

    async fn get_position(&self) -> Result<i64> {
        let query = [
            ("ticker", self.market_ticker.clone()),
            ("settlement_status", "unsettled".to_string()),
        ];
        let envelope: PositionsEnvelope = self
            .request(Method::GET, "portfolio/positions", &query, None)
            .await
            .map_err(|err| classify(err, Error::MarketData))?;
        Ok(side_position(
            &envelope.market_positions,
            &self.market_ticker,
            self.trade_side,
        ))
    }

    async fn get_fills(&self) -> Result<Vec<Fill>> {
        let query = [("ticker", self.market_ticker.clone())];
        let envelope: FillsEnvelope = self
            .request(Method::GET, "portfolio/fills", &query, None)
            .await
            .map_err(|err| classify(err, Error::MarketData))?;
        Ok(side_fills(envelope.fills, self.trade_side))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderId> {
        let client_order_id = request
            .client_order_id
            .clone()
            .unwrap_or_else(|| self.client_ids.next());
        let body = order_body(
            &self.market_ticker,
            self.trade_side,
            request,
            &client_order_id,
        );
        let response: PlaceOrderResponse = self
            .request(Method::POST, "portfolio/orders", &[], Some(&body))
            .await
            .map_err(placement_error)?;
        info!(
            side = %request.side,
            price = request.price,
            size = request.size,
            order_id = %response.order.order_id,
            %client_order_id,
            "placed order"
        );
        Ok(OrderId::new(response.order.order_id))
    }

    async fn cancel_order(&self, order_id: &OrderId) -> Result<()> {
        let path = format!("portfolio/orders/{order_id}");
        let result = self.request::<Value>(Method::DELETE, &path, &[], None).await;
        cancel_outcome(order_id, result)
    }

    async fn logout(&self) -> Result<()> {
        let Some(session) = self.auth.take().await else {
            return Ok(());
        };
        let url = self.endpoint("logout")?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&session.token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::with_http_status(status, &text));
        }
        info!("Successfully logged out");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use super::*;

    const TICKER: &str = "PRES-2028";

    fn client(side: TradeSide, base: &str) -> KalshiClient {
        KalshiClient::new(
            Credentials {
                base_url: Url::parse(base).unwrap(),
                email: "mm@example.com".into(),
                password: "secret".into(),
            },
            TICKER.into(),
            side,
            Duration::from_secs(2),
        )
        .unwrap()
    }

    /// HTTP/1.1 server answering every request from `route(method, path, n)`,
    /// where `n` counts earlier requests to the same method and path.
    struct CannedVenue {
        base: String,
        requests: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl CannedVenue {
        async fn start<F>(route: F) -> Self
        where
            F: Fn(&str, &str, usize) -> (u16, String) + Send + Sync + 'static,
        {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}/", listener.local_addr().unwrap());
            let route = Arc::new(route);
            let requests = Arc::new(Mutex::new(Vec::new()));
            let log = Arc::clone(&requests);
            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    let route = Arc::clone(&route);
                    let log = Arc::clone(&log);
                    tokio::spawn(async move {
                        let Some((method, path, body)) = read_request(&mut stream).await else {
                            return;
                        };
                        let key = format!("{method} {path}");
                        let nth = {
                            let mut log = log.lock().unwrap();
                            let nth = log.iter().filter(|(k, _)| *k == key).count();
                            log.push((key, body));
                            nth
                        };
                        let (status, reply) = route(&method, &path, nth);
                        let response = format!(
                            "HTTP/1.1 {status} Canned\r\ncontent-type: application/json\r\n\
                             content-length: {}\r\nconnection: close\r\n\r\n{reply}",
                            reply.len()
                        );
                        let _ = stream.write_all(response.as_bytes()).await;
                        let _ = stream.shutdown().await;
                    });
                }
            });
            Self { base, requests }
        }

        fn count(&self, key: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| k == key)
                .count()
        }

        fn bodies(&self, key: &str) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, body)| body.clone())
                .collect()
        }
    }

    async fn read_request(stream: &mut TcpStream) -> Option<(String, String, String)> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let content_length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < header_end + content_length {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let mut parts = head.split_whitespace();
        let method = parts.next()?.to_string();
        let target = parts.next()?;
        let path = target.split('?').next().unwrap_or(target).to_string();
        let body = String::from_utf8_lossy(&buf[header_end..]).to_string();
        Some((method, path, body))
    }

    fn ok(body: &str) -> (u16, String) {
        (200, body.to_string())
    }

    fn login_ok(nth: usize) -> (u16, String) {
        (200, format!(r#"{{"token":"t{nth}","member_id":"m-1"}}"#))
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let c = client(TradeSide::Yes, "https://example.com/trade-api/v2");
        assert_eq!(
            c.endpoint("/portfolio/orders").unwrap().as_str(),
            "https://example.com/trade-api/v2/portfolio/orders"
        );
    }

    #[test]
    fn test_side_price_uses_trade_side() {
        assert_eq!(side_price(TradeSide::Yes, Some(45.0), Some(55.0)), Some(0.45));
        assert_eq!(side_price(TradeSide::No, Some(45.0), Some(55.0)), Some(0.55));
        assert_eq!(side_price(TradeSide::No, Some(45.0), None), None);
    }

    #[test]
    fn test_two_sided_mid() {
        let market: MarketQuote = serde_json::from_str(
            r#"{"yes_bid":40,"yes_ask":44,"no_bid":56,"no_ask":60}"#,
        )
        .unwrap();
        assert!((two_sided_mid(&market, TradeSide::Yes).unwrap() - 0.42).abs() < 1e-12);
        assert!((two_sided_mid(&market, TradeSide::No).unwrap() - 0.58).abs() < 1e-12);

        let empty_bid: MarketQuote =
            serde_json::from_str(r#"{"yes_bid":0,"yes_ask":44}"#).unwrap();
        assert_eq!(two_sided_mid(&empty_bid, TradeSide::Yes), None);
        assert_eq!(two_sided_mid(&empty_bid, TradeSide::No), None);
    }

    #[test]
    fn test_no_side_position_is_negated() {
        let positions = vec![
            MarketPosition {
                ticker: TICKER.into(),
                position: 3,
            },
            MarketPosition {
                ticker: "OTHER".into(),
                position: 9,
            },
        ];
        assert_eq!(side_position(&positions, TICKER, TradeSide::Yes), 3);
        assert_eq!(side_position(&positions, TICKER, TradeSide::No), -3);
    }

    #[test]
    fn test_cancel_outcome_treats_missing_order_as_done() {
        let id = OrderId::from("gone");
        assert!(cancel_outcome(&id, Ok(Value::Null)).is_ok());
        let missing = decode::<Value>(StatusCode::NOT_FOUND, "not found");
        assert!(cancel_outcome(&id, missing).is_ok());

        let busy = decode::<Value>(StatusCode::SERVICE_UNAVAILABLE, "busy");
        assert!(matches!(
            cancel_outcome(&id, busy),
            Err(Error::Cancel { .. })
        ));
        let expired = cancel_outcome(&id, Err(Error::Auth("expired".into())));
        assert!(expired.unwrap_err().is_fatal());
    }

    #[test]
    fn test_decode_maps_status() {
        let err = decode::<Value>(StatusCode::BAD_REQUEST, "bad ticker").unwrap_err();
        assert!(matches!(err, Error::Http { status: 400, .. }));
        let parsed: LoginResponse = decode(StatusCode::OK, r#"{"token":"abc"}"#).unwrap();
        assert_eq!(parsed.token, "abc");
        assert!(decode::<LoginResponse>(StatusCode::OK, "<html>").is_err());
    }

    #[test]
    fn test_placement_error_classification() {
        let rate_limited = placement_error(Error::Http {
            status: 429,
            body: "slow down".into(),
        });
        assert!(rate_limited.is_transient_placement());
        let unavailable = placement_error(Error::Http {
            status: 503,
            body: String::new(),
        });
        assert!(unavailable.is_transient_placement());
        let rejected = placement_error(Error::Http {
            status: 400,
            body: "insufficient balance".into(),
        });
        assert_eq!(rejected.kind(), "order_placement_permanent");
        assert!(placement_error(Error::Auth("expired".into())).is_fatal());
    }

    #[test]
    fn test_resting_orders_filter_side_and_keep_client_id() {
        let raw = r#"{"orders":[
            {"order_id":"b","action":"buy","side":"yes","yes_price":44,"no_price":56,
             "remaining_count":1,"initial_count":2,"created_time":"2024-05-01T12:00:05Z",
             "client_order_id":"mm-7"},
            {"order_id":"a","action":"sell","side":"yes","yes_price":48,"no_price":52,
             "remaining_count":1,"created_time":"2024-05-01T12:00:00Z"},
            {"order_id":"n","action":"buy","side":"no","yes_price":40,"no_price":60,
             "remaining_count":1,"created_time":"2024-05-01T12:00:00Z"}]}"#;
        let parsed: OrdersEnvelope = serde_json::from_str(raw).unwrap();
        let orders = resting_orders(parsed.orders, TradeSide::Yes);
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].id, OrderId::from("a"));
        assert_eq!(orders[1].price, 0.44);
        assert_eq!(orders[1].size, 2);
        assert_eq!(orders[1].remaining, 1);
        assert_eq!(orders[1].client_order_id.as_deref(), Some("mm-7"));
        assert!(orders.iter().all(|o| o.status == OrderStatus::Open));
    }

    #[test]
    fn test_order_body_prices_traded_side_in_cents() {
        let request = OrderRequest {
            side: Side::Buy,
            price: 0.45,
            size: 2,
            expires_at: None,
            client_order_id: None,
        };
        let body = order_body(TICKER, TradeSide::No, &request, "mm-1");
        assert_eq!(body["no_price"], json!(45));
        assert_eq!(body["side"], json!("no"));
        assert_eq!(body["action"], json!("buy"));
        assert_eq!(body["client_order_id"], json!("mm-1"));
        assert!(body.get("yes_price").is_none());
        assert!(body.get("expiration_ts").is_none());
    }

    #[tokio::test]
    async fn test_login_then_no_side_mid() {
        let venue = CannedVenue::start(|method, path, nth| match (method, path) {
            ("POST", "/login") => login_ok(nth),
            ("GET", "/markets/PRES-2028") => ok(
                r#"{"market":{"yes_bid":40,"yes_ask":44,"no_bid":56,"no_ask":60}}"#,
            ),
            _ => (404, "{}".into()),
        })
        .await;
        let c = client(TradeSide::No, &venue.base);
        c.authenticate().await.unwrap();
        let state = c.get_market_state().await.unwrap();
        assert!((state.mid_price - 0.58).abs() < 1e-12);
        assert_eq!(state.ticker, TICKER);
        assert_eq!(venue.count("POST /login"), 1);
    }

    #[tokio::test]
    async fn test_one_sided_market_is_market_data_error() {
        let venue = CannedVenue::start(|method, path, nth| match (method, path) {
            ("POST", "/login") => login_ok(nth),
            _ => ok(r#"{"market":{"yes_bid":40,"yes_ask":44,"no_ask":60}}"#),
        })
        .await;
        let err = client(TradeSide::No, &venue.base)
            .get_market_state()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MarketData(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_rejected_session_logs_in_again() {
        let venue = CannedVenue::start(|method, path, nth| match (method, path) {
            ("POST", "/login") => login_ok(nth),
            ("GET", "/portfolio/positions") if nth == 0 => (401, "{}".into()),
            ("GET", "/portfolio/positions") => ok(
                r#"{"market_positions":[{"ticker":"PRES-2028","position":3},
                    {"ticker":"OTHER","position":9}]}"#,
            ),
            _ => (404, "{}".into()),
        })
        .await;
        let c = client(TradeSide::No, &venue.base);
        assert_eq!(c.get_position().await.unwrap(), -3);
        assert_eq!(venue.count("POST /login"), 2);
        assert_eq!(venue.count("GET /portfolio/positions"), 2);
    }

    #[tokio::test]
    async fn test_repeated_rejection_is_fatal_auth() {
        let venue = CannedVenue::start(|method, path, nth| match (method, path) {
            ("POST", "/login") => login_ok(nth),
            _ => (401, "{}".into()),
        })
        .await;
        let err = client(TradeSide::Yes, &venue.base)
            .get_open_orders()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_login_exhaustion_is_auth_error() {
        let venue = CannedVenue::start(|_, _, _| (500, "{}".into())).await;
        let err = client(TradeSide::Yes, &venue.base)
            .authenticate()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(venue.count("POST /login"), AUTH_MAX_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_login() {
        let venue = CannedVenue::start(|method, path, nth| match (method, path) {
            ("POST", "/login") => login_ok(nth),
            ("GET", "/portfolio/orders") => ok(r#"{"orders":[]}"#),
            ("GET", "/portfolio/fills") => ok(r#"{"fills":[]}"#),
            ("GET", "/portfolio/positions") => ok(r#"{"market_positions":[]}"#),
            _ => (404, "{}".into()),
        })
        .await;
        let c = client(TradeSide::Yes, &venue.base);
        let (orders, fills, position) =
            tokio::try_join!(c.get_open_orders(), c.get_fills(), c.get_position()).unwrap();
        assert!(orders.is_empty() && fills.is_empty());
        assert_eq!(position, 0);
        assert_eq!(venue.count("POST /login"), 1);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let venue = CannedVenue::start(|method, path, nth| match (method, path) {
            ("POST", "/login") => login_ok(nth),
            ("DELETE", "/portfolio/orders/live") => ok(r#"{"order":{"order_id":"live"}}"#),
            ("DELETE", "/portfolio/orders/busy") => (503, "{}".into()),
            _ => (404, r#"{"error":"not found"}"#.into()),
        })
        .await;
        let c = client(TradeSide::Yes, &venue.base);
        c.cancel_order(&OrderId::from("live")).await.unwrap();
        c.cancel_order(&OrderId::from("gone")).await.unwrap();
        c.cancel_order(&OrderId::from("gone")).await.unwrap();
        let err = c.cancel_order(&OrderId::from("busy")).await.unwrap_err();
        assert!(matches!(err, Error::Cancel { .. }));
    }

    #[tokio::test]
    async fn test_place_order_reuses_request_client_id() {
        let venue = CannedVenue::start(|method, path, nth| match (method, path) {
            ("POST", "/login") => login_ok(nth),
            ("POST", "/portfolio/orders") if nth == 0 => (503, "{}".into()),
            ("POST", "/portfolio/orders") => ok(r#"{"order":{"order_id":"k-1"}}"#),
            _ => (404, "{}".into()),
        })
        .await;
        let c = client(TradeSide::Yes, &venue.base);
        let request = OrderRequest {
            side: Side::Sell,
            price: 0.55,
            size: 1,
            expires_at: None,
            client_order_id: Some("mm-fixed".into()),
        };
        let err = c.place_order(&request).await.unwrap_err();
        assert!(err.is_transient_placement());
        assert_eq!(c.place_order(&request).await.unwrap(), OrderId::from("k-1"));

        let bodies = venue.bodies("POST /portfolio/orders");
        assert_eq!(bodies.len(), 2);
        for body in bodies {
            let sent: Value = serde_json::from_str(&body).unwrap();
            assert_eq!(sent["client_order_id"], json!("mm-fixed"));
            assert_eq!(sent["yes_price"], json!(55));
        }
    }
}
