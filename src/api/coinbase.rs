use crate::config::CandleInterval;
use crate::error::{BotError, Delivery};
use crate::execution::{PlaceAck, Venue, VenueError, VenueOrderStatus};
use crate::feed::CandleFetcher;
use crate::models::{Candle, IdempotencyKey, OrderRequest, OrderType, Side};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const RATE_LIMIT_RPS: u32 = 10; // Advanced Trade private endpoints: 30/s, stay well below
const MAX_RETRIES: u32 = 3;
/// Coinbase returns at most 350 candles per request
const MAX_CANDLES_PER_REQUEST: i64 = 300;

type CoinbaseRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Coinbase Advanced Trade REST client with rate limiting
///
/// Cloneable; all clones share the same rate limiter. `api_key` is sent as a
/// bearer token.
#[derive(Clone)]
pub struct CoinbaseClient {
    client: Client,
    base_url: String,
    api_key: String,
    rate_limiter: Arc<CoinbaseRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    candles: Vec<CandleEntry>,
}

/// Numeric fields arrive as strings
#[derive(Debug, Deserialize)]
struct CandleEntry {
    start: String,
    low: String,
    high: String,
    open: String,
    close: String,
    volume: String,
}

#[derive(Debug, Deserialize)]
struct CreateOrderResponse {
    success: bool,
    success_response: Option<CreateOrderSuccess>,
    error_response: Option<CreateOrderError>,
    failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateOrderSuccess {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateOrderError {
    error: Option<String>,
    message: Option<String>,
    preview_failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderEnvelope {
    order: OrderEntry,
}

#[derive(Debug, Deserialize)]
struct OrderList {
    orders: Vec<OrderEntry>,
}

#[derive(Debug, Deserialize)]
struct OrderEntry {
    order_id: String,
    client_order_id: String,
    status: String,
    #[serde(default)]
    filled_size: Option<String>,
    #[serde(default)]
    average_filled_price: Option<String>,
    #[serde(default)]
    reject_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    accounts: Vec<AccountEntry>,
}

#[derive(Debug, Deserialize)]
struct AccountEntry {
    currency: String,
    available_balance: Balance,
}

#[derive(Debug, Deserialize)]
struct Balance {
    value: String,
}

fn parse_num(field: &str, value: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|_| BotError::Feed(format!("invalid {} '{}'", field, value)))
}

impl CandleEntry {
    fn into_candle(self) -> Result<Candle> {
        let secs: i64 = self
            .start
            .parse()
            .map_err(|_| BotError::Feed(format!("invalid candle start '{}'", self.start)))?;
        let open_time = DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| BotError::Feed(format!("candle start out of range: {}", secs)))?;

        Ok(Candle {
            open_time,
            open: parse_num("open", &self.open)?,
            high: parse_num("high", &self.high)?,
            low: parse_num("low", &self.low)?,
            close: parse_num("close", &self.close)?,
            volume: parse_num("volume", &self.volume)?,
        })
    }
}

impl OrderEntry {
    fn to_status(&self) -> VenueOrderStatus {
        let filled_size = self
            .filled_size
            .as_deref()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        let fill_price = self
            .average_filled_price
            .as_deref()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        match self.status.as_str() {
            "FILLED" => VenueOrderStatus::Filled {
                fill_price,
                fill_size: filled_size,
            },
            // a partially filled order that was cancelled still moved the position
            "CANCELLED" | "EXPIRED" | "FAILED" if filled_size > 0.0 => VenueOrderStatus::Filled {
                fill_price,
                fill_size: filled_size,
            },
            "CANCELLED" | "EXPIRED" | "FAILED" => VenueOrderStatus::Rejected {
                reason: self
                    .reject_reason
                    .clone()
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| self.status.to_lowercase()),
            },
            _ => VenueOrderStatus::Pending,
        }
    }
}

/// Classify a transport error by whether the request may have reached the venue
fn transport_error(e: reqwest::Error) -> VenueError {
    let delivery = if e.is_connect() || e.is_builder() {
        Delivery::NotSent
    } else {
        Delivery::MaybeReceived
    };
    VenueError::transient(e.to_string(), delivery)
}

impl CoinbaseClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        let quota = Quota::per_second(NonZeroU32::new(RATE_LIMIT_RPS).unwrap_or(NonZeroU32::MIN));
        let rate_limiter = Arc::new(RateLimiter::direct(quota));

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            rate_limiter,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.api_key.is_empty() {
            request
        } else {
            request.bearer_auth(&self.api_key)
        }
    }

    /// Rate-limited GET with retry on 429, 5xx and network errors
    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.url(path);

        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            let request = self.authorize(self.client.get(&url).query(query));
            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    if (status.as_u16() == 429 || status.is_server_error()) && attempt < MAX_RETRIES {
                        let backoff_secs = 2u64.pow(attempt);
                        tracing::warn!(
                            "Coinbase returned {}, retrying in {}s (attempt {}/{})",
                            status,
                            backoff_secs,
                            attempt,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        continue;
                    }

                    let error_text = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    return Err(BotError::Feed(format!(
                        "Coinbase API error ({}): {}",
                        status, error_text
                    )));
                }
                Err(e) if attempt < MAX_RETRIES => {
                    let backoff_secs = 2u64.pow(attempt);
                    tracing::warn!(
                        "Network error: {}, retrying in {}s (attempt {}/{})",
                        e,
                        backoff_secs,
                        attempt,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(BotError::Feed(format!("Failed after {} retries", MAX_RETRIES)))
    }

    /// Single rate-limited request for order flow; retry policy belongs to the caller
    async fn send_once(&self, request: RequestBuilder) -> std::result::Result<Response, VenueError> {
        self.rate_limiter.until_ready().await;

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 {
            Err(VenueError::transient(
                format!("rate limited: {}", body),
                Delivery::NotSent,
            ))
        } else if status.is_server_error() {
            Err(VenueError::transient(
                format!("{}: {}", status, body),
                Delivery::MaybeReceived,
            ))
        } else {
            Err(VenueError::Rejected {
                reason: format!("{}: {}", status, body),
            })
        }
    }

    async fn read_json<T: DeserializeOwned>(response: Response) -> std::result::Result<T, VenueError> {
        response
            .json()
            .await
            .map_err(|e| VenueError::transient(format!("bad response body: {}", e), Delivery::MaybeReceived))
    }

    /// Candles in `[start, end]`, oldest first, split into venue-sized requests
    pub async fn get_candles(
        &self,
        product_id: &str,
        interval: CandleInterval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let path = format!("/api/v3/brokerage/market/products/{}/candles", product_id);
        let chunk = interval.duration() * MAX_CANDLES_PER_REQUEST as i32;

        let mut candles = Vec::new();
        let mut chunk_start = start;
        while chunk_start <= end {
            let chunk_end = (chunk_start + chunk).min(end);
            let query = [
                ("start", chunk_start.timestamp().to_string()),
                ("end", chunk_end.timestamp().to_string()),
                ("granularity", interval.granularity().to_string()),
            ];
            let response: CandlesResponse = self.get_json(&path, &query).await?;
            for entry in response.candles {
                candles.push(entry.into_candle()?);
            }
            chunk_start = chunk_end + interval.duration();
        }

        // newest first on the wire
        candles.sort_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);
        candles.retain(|c| c.open_time >= start && c.open_time <= end);

        tracing::debug!(
            product_id,
            count = candles.len(),
            granularity = interval.granularity(),
            "Fetched candles"
        );
        Ok(candles)
    }
}

#[async_trait]
impl CandleFetcher for CoinbaseClient {
    async fn fetch_candles(
        &self,
        instrument: &str,
        interval: CandleInterval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        self.get_candles(instrument, interval, start, end).await
    }
}

/// Live order routing through Coinbase Advanced Trade.
///
/// The idempotency key is sent as `client_order_id`; Coinbase collapses
/// duplicate client ids into the original order.
pub struct CoinbaseVenue {
    client: CoinbaseClient,
    product_id: String,
    order_ids: Mutex<HashMap<IdempotencyKey, String>>,
}

impl CoinbaseVenue {
    pub fn new(client: CoinbaseClient, product_id: impl Into<String>) -> Self {
        Self {
            client,
            product_id: product_id.into(),
            order_ids: Mutex::new(HashMap::new()),
        }
    }

    fn remember(&self, key: &IdempotencyKey, order_id: &str) {
        if let Ok(mut ids) = self.order_ids.lock() {
            ids.insert(key.clone(), order_id.to_string());
        }
    }

    fn known_order_id(&self, key: &IdempotencyKey) -> Option<String> {
        self.order_ids
            .lock()
            .ok()
            .and_then(|ids| ids.get(key).cloned())
    }

    fn order_body(&self, request: &OrderRequest) -> serde_json::Value {
        let configuration = match (request.order_type, request.limit_price) {
            (OrderType::Limit, Some(limit_price)) => json!({
                "limit_limit_gtc": {
                    "base_size": format!("{:.8}", request.size_in_base),
                    "limit_price": format!("{:.2}", limit_price),
                    "post_only": false,
                }
            }),
            // market buys are sized in quote currency
            _ if request.side == Side::Buy => json!({
                "market_market_ioc": {
                    "quote_size": format!("{:.2}", request.quote_value()),
                }
            }),
            _ => json!({
                "market_market_ioc": {
                    "base_size": format!("{:.8}", request.size_in_base),
                }
            }),
        };

        json!({
            "client_order_id": request.idempotency_key.as_str(),
            "product_id": request.instrument,
            "side": request.side.to_string(),
            "order_configuration": configuration,
        })
    }

    /// Find an order by client id among recent orders for the product
    async fn find_order(&self, key: &IdempotencyKey) -> std::result::Result<Option<OrderEntry>, VenueError> {
        if let Some(order_id) = self.known_order_id(key) {
            let request = self
                .client
                .client
                .get(self.client.url(&format!("/api/v3/brokerage/orders/historical/{}", order_id)));
            let envelope: OrderEnvelope = CoinbaseClient::read_json(self.client.send_once(request).await?).await?;
            return Ok(Some(envelope.order));
        }

        let request = self
            .client
            .client
            .get(self.client.url("/api/v3/brokerage/orders/historical/batch"))
            .query(&[("product_ids", self.product_id.as_str()), ("limit", "100")]);
        let list: OrderList = CoinbaseClient::read_json(self.client.send_once(request).await?).await?;

        let found = list
            .orders
            .into_iter()
            .find(|o| o.client_order_id == key.as_str());
        if let Some(order) = &found {
            self.remember(key, &order.order_id);
        }
        Ok(found)
    }
}

#[async_trait]
impl Venue for CoinbaseVenue {
    async fn place_order(&self, request: &OrderRequest) -> std::result::Result<PlaceAck, VenueError> {
        let body = self.order_body(request);
        let http = self
            .client
            .client
            .post(self.client.url("/api/v3/brokerage/orders"))
            .json(&body);

        let response: CreateOrderResponse = CoinbaseClient::read_json(self.client.send_once(http).await?).await?;

        if !response.success {
            let reason = response
                .error_response
                .map(|e| {
                    e.preview_failure_reason
                        .filter(|r| !r.is_empty() && r != "UNKNOWN_PREVIEW_FAILURE_REASON")
                        .or(e.message)
                        .or(e.error)
                        .unwrap_or_default()
                })
                .filter(|r| !r.is_empty())
                .or(response.failure_reason)
                .unwrap_or_else(|| "order rejected".to_string());
            return Err(VenueError::Rejected { reason });
        }

        let order_id = response
            .success_response
            .map(|s| s.order_id)
            .ok_or_else(|| VenueError::transient("success without order id", Delivery::MaybeReceived))?;
        self.remember(&request.idempotency_key, &order_id);

        tracing::info!(
            key = %request.idempotency_key,
            order_id = %order_id,
            side = %request.side,
            "Order accepted by Coinbase"
        );
        Ok(PlaceAck::Accepted {
            venue_order_id: order_id,
        })
    }

    async fn order_status(&self, key: &IdempotencyKey) -> std::result::Result<VenueOrderStatus, VenueError> {
        Ok(self
            .find_order(key)
            .await?
            .map(|order| order.to_status())
            .unwrap_or(VenueOrderStatus::NotFound))
    }

    async fn cancel_order(&self, key: &IdempotencyKey) -> std::result::Result<(), VenueError> {
        let order_id = match self.known_order_id(key) {
            Some(id) => id,
            None => match self.find_order(key).await? {
                Some(order) => order.order_id,
                None => return Ok(()),
            },
        };

        let request = self
            .client
            .client
            .post(self.client.url("/api/v3/brokerage/orders/batch_cancel"))
            .json(&json!({ "order_ids": [order_id] }));
        self.client.send_once(request).await?;
        Ok(())
    }

    async fn available_balance(&self, currency: &str) -> std::result::Result<Option<f64>, VenueError> {
        let request = self
            .client
            .client
            .get(self.client.url("/api/v3/brokerage/accounts"))
            .query(&[("limit", "250")]);
        let accounts: AccountsResponse = CoinbaseClient::read_json(self.client.send_once(request).await?).await?;

        let balance = accounts
            .accounts
            .iter()
            .find(|a| a.currency.eq_ignore_ascii_case(currency))
            .and_then(|a| a.available_balance.value.parse::<f64>().ok())
            .unwrap_or(0.0);
        Ok(Some(balance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderReason;
    use chrono::TimeZone;
    use mockito::Matcher;

    fn request(side: Side, order_type: OrderType) -> OrderRequest {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        OrderRequest {
            side,
            instrument: "BTC-USD".to_string(),
            size_in_base: 0.02,
            order_type,
            idempotency_key: IdempotencyKey::derive("BTC-USD", t, side),
            reference_price: 50_000.0,
            limit_price: match order_type {
                OrderType::Limit => Some(49_950.0),
                OrderType::Market => None,
            },
            reason: OrderReason::Signal,
            decided_at: t,
        }
    }

    #[tokio::test]
    async fn test_candles_sorted_oldest_first() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/brokerage/market/products/BTC-USD/candles")
            .match_query(Matcher::UrlEncoded(
                "granularity".into(),
                "ONE_MINUTE".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"candles":[
                    {"start":"1709294520","low":"99","high":"102","open":"100","close":"101","volume":"3.5"},
                    {"start":"1709294460","low":"98","high":"101","open":"99","close":"100","volume":"2.0"}
                ]}"#,
            )
            .create_async()
            .await;

        let client = CoinbaseClient::new(server.url(), "").unwrap();
        let start = DateTime::<Utc>::from_timestamp(1709294400, 0).unwrap();
        let end = DateTime::<Utc>::from_timestamp(1709294580, 0).unwrap();
        let candles = client
            .get_candles("BTC-USD", CandleInterval::OneMinute, start, end)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(candles.len(), 2);
        assert!(candles[0].open_time < candles[1].open_time);
        assert_eq!(candles[1].close, 101.0);
    }

    #[tokio::test]
    async fn test_place_market_buy_uses_quote_size() {
        let mut server = mockito::Server::new_async().await;
        let req = request(Side::Buy, OrderType::Market);
        let mock = server
            .mock("POST", "/api/v3/brokerage/orders")
            .match_header("authorization", "Bearer secret")
            .match_body(Matcher::PartialJson(json!({
                "client_order_id": req.idempotency_key.as_str(),
                "side": "BUY",
                "order_configuration": { "market_market_ioc": { "quote_size": "1000.00" } }
            })))
            .with_status(200)
            .with_body(r#"{"success":true,"success_response":{"order_id":"abc-123"}}"#)
            .create_async()
            .await;

        let venue = CoinbaseVenue::new(CoinbaseClient::new(server.url(), "secret").unwrap(), "BTC-USD");
        let ack = venue.place_order(&req).await.unwrap();

        mock.assert_async().await;
        assert_eq!(
            ack,
            PlaceAck::Accepted {
                venue_order_id: "abc-123".to_string()
            }
        );
    }

    #[test]
    fn test_place_limit_sell_body() {
        let venue = CoinbaseVenue::new(CoinbaseClient::new("http://localhost", "").unwrap(), "BTC-USD");
        let body = venue.order_body(&request(Side::Sell, OrderType::Limit));
        assert_eq!(body["order_configuration"]["limit_limit_gtc"]["base_size"], "0.02000000");
        assert_eq!(body["order_configuration"]["limit_limit_gtc"]["limit_price"], "49950.00");
        assert_eq!(body["side"], "SELL");
    }

    #[tokio::test]
    async fn test_place_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v3/brokerage/orders")
            .with_status(200)
            .with_body(
                r#"{"success":false,"error_response":{"error":"INSUFFICIENT_FUND","message":"Insufficient balance in source account","preview_failure_reason":"PREVIEW_INSUFFICIENT_FUND"}}"#,
            )
            .create_async()
            .await;

        let venue = CoinbaseVenue::new(CoinbaseClient::new(server.url(), "").unwrap(), "BTC-USD");
        let err = venue
            .place_order(&request(Side::Buy, OrderType::Market))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            VenueError::Rejected {
                reason: "PREVIEW_INSUFFICIENT_FUND".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v3/brokerage/orders")
            .with_status(503)
            .create_async()
            .await;

        let venue = CoinbaseVenue::new(CoinbaseClient::new(server.url(), "").unwrap(), "BTC-USD");
        let err = venue
            .place_order(&request(Side::Buy, OrderType::Market))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VenueError::Transient {
                delivery: Delivery::MaybeReceived,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_status_lookup_by_client_id() {
        let mut server = mockito::Server::new_async().await;
        let req = request(Side::Buy, OrderType::Market);
        let body = format!(
            r#"{{"orders":[
                {{"order_id":"o-1","client_order_id":"other","status":"OPEN"}},
                {{"order_id":"o-2","client_order_id":"{}","status":"FILLED","filled_size":"0.02","average_filled_price":"50010.5"}}
            ]}}"#,
            req.idempotency_key
        );
        server
            .mock("GET", "/api/v3/brokerage/orders/historical/batch")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let venue = CoinbaseVenue::new(CoinbaseClient::new(server.url(), "").unwrap(), "BTC-USD");
        let status = venue.order_status(&req.idempotency_key).await.unwrap();
        assert_eq!(
            status,
            VenueOrderStatus::Filled {
                fill_price: 50010.5,
                fill_size: 0.02
            }
        );
        assert_eq!(venue.known_order_id(&req.idempotency_key).as_deref(), Some("o-2"));

        let missing = venue
            .order_status(&IdempotencyKey::from("never-sent"))
            .await
            .unwrap();
        assert_eq!(missing, VenueOrderStatus::NotFound);
    }

    #[test]
    fn test_cancelled_partial_fill_counts_as_fill() {
        let entry = OrderEntry {
            order_id: "o".to_string(),
            client_order_id: "k".to_string(),
            status: "CANCELLED".to_string(),
            filled_size: Some("0.01".to_string()),
            average_filled_price: Some("100".to_string()),
            reject_reason: None,
        };
        assert_eq!(
            entry.to_status(),
            VenueOrderStatus::Filled {
                fill_price: 100.0,
                fill_size: 0.01
            }
        );

        let open = OrderEntry {
            status: "OPEN".to_string(),
            filled_size: None,
            ..entry
        };
        assert_eq!(open.to_status(), VenueOrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_available_balance() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v3/brokerage/accounts")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"accounts":[
                    {"currency":"BTC","available_balance":{"value":"0.5","currency":"BTC"}},
                    {"currency":"USD","available_balance":{"value":"1234.56","currency":"USD"}}
                ]}"#,
            )
            .create_async()
            .await;

        let venue = CoinbaseVenue::new(CoinbaseClient::new(server.url(), "").unwrap(), "BTC-USD");
        assert_eq!(venue.available_balance("USD").await.unwrap(), Some(1234.56));
        assert_eq!(venue.available_balance("EUR").await.unwrap(), Some(0.0));
    }
}
