//! Kite Connect REST client.

use super::totp;
use super::traits::BrokerClient;
use super::types::*;
use crate::config::{BrokerConfig, Credentials};
use crate::error::BrokerError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
use reqwest::{redirect, Client, Response, Url};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

const KITE_VERSION: &str = "3";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/70.0.3538.77";

/// Kite Connect API client.
pub struct KiteClient {
    http: Client,
    api_key: String,
    access_token: Option<String>,
    api_url: String,
}

impl KiteClient {
    /// Create an unauthenticated client.
    pub fn new(config: &BrokerConfig, api_key: &str) -> Result<Self, BrokerError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BrokerError::Auth(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_key: api_key.to_string(),
            access_token: None,
            api_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    /// Attach an access token obtained from the session endpoint.
    pub fn with_access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(access_token.into());
        self
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    /// Run the full web login (password + TOTP), exchange the request token and
    /// return an authenticated client.
    #[instrument(skip_all, fields(user_id = %creds.user_id))]
    pub async fn login(config: &BrokerConfig, creds: &Credentials) -> Result<Self, BrokerError> {
        let request_token = fetch_request_token(config, creds).await?;
        debug!("Request token obtained");

        let client = Self::new(config, &creds.api_key)?;
        let access_token = client
            .generate_session(&request_token, &creds.api_secret)
            .await?;

        info!("Broker login successful");
        Ok(client.with_access_token(access_token))
    }

    /// Exchange a request token for an access token.
    #[instrument(skip_all)]
    pub async fn generate_session(
        &self,
        request_token: &str,
        api_secret: &str,
    ) -> Result<String, BrokerError> {
        let body = encode_form(&[
            ("api_key", self.api_key.clone()),
            ("request_token", request_token.to_string()),
            (
                "checksum",
                session_checksum(&self.api_key, request_token, api_secret),
            ),
        ]);

        let response = self
            .http
            .post(format!("{}/session/token", self.api_url))
            .header("X-Kite-Version", KITE_VERSION)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| BrokerError::Auth(format!("Failed to reach session endpoint: {}", e)))?;

        let session: SessionData = read_envelope(response, BrokerError::Auth).await?;
        if session.access_token.is_empty() {
            return Err(BrokerError::Auth("Session endpoint returned an empty access token".into()));
        }
        Ok(session.access_token)
    }

    /// Download the full instrument master as CSV text.
    #[instrument(skip(self))]
    pub async fn download_instruments(&self) -> Result<String, BrokerError> {
        let response = self
            .http
            .get(format!("{}/instruments", self.api_url))
            .header("X-Kite-Version", KITE_VERSION)
            .send()
            .await
            .map_err(|e| BrokerError::InstrumentLookup(format!("Failed to fetch instruments: {}", e)))?;

        if !response.status().is_success() {
            return Err(BrokerError::InstrumentLookup(format!(
                "Instrument download returned {}",
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| BrokerError::InstrumentLookup(format!("Failed to read instruments: {}", e)))
    }

    fn authorization(&self) -> String {
        format!(
            "token {}:{}",
            self.api_key,
            self.access_token.as_deref().unwrap_or_default()
        )
    }
}

#[async_trait]
impl BrokerClient for KiteClient {
    #[instrument(skip(self), fields(symbol = %order.tradingsymbol, side = %order.transaction_type))]
    async fn place_order(&self, order: &OrderRequest) -> Result<String, BrokerError> {
        debug!("Placing order: {:?}", order);

        let response = self
            .http
            .post(format!("{}/orders/regular", self.api_url))
            .header("X-Kite-Version", KITE_VERSION)
            .header(AUTHORIZATION, self.authorization())
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(encode_form(&order.form_fields()))
            .send()
            .await
            .map_err(|e| BrokerError::OrderPlacement(format!("Failed to place order: {}", e)))?;

        let data: OrderIdData = read_envelope(response, BrokerError::OrderPlacement).await?;
        Ok(data.order_id)
    }

    #[instrument(skip(self))]
    async fn order_history(&self, order_id: &str) -> Result<Vec<OrderEvent>, BrokerError> {
        let response = self
            .http
            .get(format!("{}/orders/{}", self.api_url, order_id))
            .header("X-Kite-Version", KITE_VERSION)
            .header(AUTHORIZATION, self.authorization())
            .send()
            .await
            .map_err(|e| BrokerError::OrderPlacement(format!("Failed to fetch order history: {}", e)))?;

        read_envelope(response, BrokerError::OrderPlacement).await
    }

    #[instrument(skip(self))]
    async fn historical_candles(
        &self,
        instrument_token: u32,
        day: NaiveDate,
        interval: CandleInterval,
    ) -> Result<Vec<Candle>, BrokerError> {
        let from = format!("{} 09:15:00", day.format("%Y-%m-%d"));
        let to = format!("{} 15:30:00", day.format("%Y-%m-%d"));
        let url = format!(
            "{}/instruments/historical/{}/{}?from={}&to={}",
            self.api_url,
            instrument_token,
            interval.as_path(),
            urlencoding::encode(&from),
            urlencoding::encode(&to)
        );

        let response = self
            .http
            .get(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .header(AUTHORIZATION, self.authorization())
            .send()
            .await
            .map_err(|e| BrokerError::DataFetch(format!("Failed to fetch candles: {}", e)))?;

        let data: HistoricalData = read_envelope(response, BrokerError::DataFetch).await?;
        data.candles.iter().map(|row| parse_candle(row.as_slice())).collect()
    }
}

/// SHA-256 checksum the session endpoint expects.
pub fn session_checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(request_token.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Walk the browser login: connect page, password, TOTP, then capture the
/// `request_token` from the redirect to the app's callback.
async fn fetch_request_token(
    config: &BrokerConfig,
    creds: &Credentials,
) -> Result<String, BrokerError> {
    let policy = redirect::Policy::custom(|attempt| {
        if attempt.url().query_pairs().any(|(k, _)| k == "request_token") {
            attempt.stop()
        } else if attempt.previous().len() > 10 {
            attempt.error("too many redirects during login")
        } else {
            attempt.follow()
        }
    });

    let http = Client::builder()
        .cookie_store(true)
        .redirect(policy)
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| BrokerError::Auth(format!("Failed to create login client: {}", e)))?;

    let auth_err = |step: &str, e: reqwest::Error| BrokerError::Auth(format!("{}: {}", step, e));
    let login_base = config.login_url.trim_end_matches('/');

    let connect = http
        .get(format!(
            "{}?v={}&api_key={}",
            config.connect_url,
            KITE_VERSION,
            urlencoding::encode(&creds.api_key)
        ))
        .send()
        .await
        .map_err(|e| auth_err("Connect page failed", e))?;
    let connect_url = connect.url().clone();

    let login = http
        .post(format!("{}/api/login", login_base))
        .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
        .body(encode_form(&[
            ("user_id", creds.user_id.clone()),
            ("password", creds.password.clone()),
        ]))
        .send()
        .await
        .map_err(|e| auth_err("Password login failed", e))?;
    let login: LoginData = read_envelope(login, BrokerError::Auth).await?;

    let twofa = http
        .post(format!("{}/api/twofa", login_base))
        .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
        .body(encode_form(&[
            ("user_id", creds.user_id.clone()),
            ("request_id", login.request_id),
            ("twofa_value", totp::totp_now(&creds.totp_code)?),
            ("twofa_type", "totp".to_string()),
        ]))
        .send()
        .await
        .map_err(|e| auth_err("Two-factor step failed", e))?;
    let _: serde_json::Value = read_envelope(twofa, BrokerError::Auth).await?;

    let mut finish_url = connect_url;
    finish_url
        .query_pairs_mut()
        .append_pair("skip_session", "true");
    let finish = http
        .get(finish_url)
        .send()
        .await
        .map_err(|e| auth_err("Connect redirect failed", e))?;

    extract_request_token(&finish)
        .ok_or_else(|| BrokerError::Auth("Request token missing from login redirect".into()))
}

fn extract_request_token(response: &Response) -> Option<String> {
    let location = response.headers().get(LOCATION)?.to_str().ok()?;
    let url = Url::parse(location)
        .or_else(|_| response.url().join(location))
        .ok()?;
    url.query_pairs()
        .find(|(k, _)| k == "request_token")
        .map(|(_, v)| v.into_owned())
}

fn encode_form(fields: &[(&str, String)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Unwrap the `{status, data, message}` envelope, mapping failures to `kind`.
async fn read_envelope<T: DeserializeOwned>(
    response: Response,
    kind: fn(String) -> BrokerError,
) -> Result<T, BrokerError> {
    let http_status = response.status();
    let body: ApiResponse<T> = response
        .json()
        .await
        .map_err(|e| kind(format!("Unreadable response ({}): {}", http_status, e)))?;

    if body.status != "success" {
        return Err(kind(format!(
            "{}: {}",
            body.error_type.unwrap_or_else(|| http_status.to_string()),
            body.message.unwrap_or_default()
        )));
    }

    body.data
        .ok_or_else(|| kind("Response is missing its data field".to_string()))
}

fn parse_candle(row: &[serde_json::Value]) -> Result<Candle, BrokerError> {
    let bad = |what: &str| BrokerError::DataFetch(format!("Malformed candle {:?}: {}", row, what));

    let timestamp = row
        .first()
        .and_then(|v| v.as_str())
        .ok_or_else(|| bad("timestamp"))?;
    let timestamp = DateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%z")
        .map_err(|_| bad("timestamp format"))?
        .naive_local();

    let price = |idx: usize, what: &str| -> Result<Decimal, BrokerError> {
        row.get(idx)
            .and_then(|v| match v {
                serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
                _ => None,
            })
            .ok_or_else(|| bad(what))
    };

    Ok(Candle {
        timestamp,
        open: price(1, "open")?,
        high: price(2, "high")?,
        low: price(3, "low")?,
        close: price(4, "close")?,
        volume: row.get(5).and_then(|v| v.as_u64()).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> BrokerConfig {
        BrokerConfig {
            api_url: server.uri(),
            login_url: server.uri(),
            connect_url: format!("{}/connect/entry", server.uri()),
            ..BrokerConfig::default()
        }
    }

    fn authed_client(server: &MockServer) -> KiteClient {
        KiteClient::new(&config_for(server), "kite_key")
            .unwrap()
            .with_access_token("tok")
    }

    #[test]
    fn test_session_checksum() {
        assert_eq!(
            session_checksum("kite_key", "req_tok_123", "kite_secret"),
            "b80b7581191adfcb1e67f920a313a0b2490edab869b65b3f48b50be3e8a58020"
        );
    }

    #[test]
    fn test_parse_candle_row() {
        let row = vec![
            json!("2024-03-04T09:20:00+0530"),
            json!(47100.5),
            json!(47180),
            json!(47050.25),
            json!(47120),
            json!(1500),
        ];
        let candle = parse_candle(&row).unwrap();
        assert_eq!(candle.timestamp.to_string(), "2024-03-04 09:20:00");
        assert_eq!(candle.open, dec!(47100.5));
        assert_eq!(candle.low, dec!(47050.25));
        assert_eq!(candle.volume, 1500);
    }

    #[tokio::test]
    async fn test_place_order_returns_order_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders/regular"))
            .and(header("Authorization", "token kite_key:tok"))
            .and(body_string_contains("transaction_type=SELL"))
            .and(body_string_contains("tradingsymbol=BANKNIFTY24MAR47000CE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {"order_id": "240304000012345"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let order = OrderRequest {
            exchange: "NFO".into(),
            tradingsymbol: "BANKNIFTY24MAR47000CE".into(),
            transaction_type: TransactionType::Sell,
            quantity: 25,
        };
        let order_id = authed_client(&server).place_order(&order).await.unwrap();
        assert_eq!(order_id, "240304000012345");
    }

    #[tokio::test]
    async fn test_place_order_error_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders/regular"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "status": "error",
                "message": "Insufficient funds",
                "error_type": "MarginException"
            })))
            .mount(&server)
            .await;

        let order = OrderRequest {
            exchange: "NFO".into(),
            tradingsymbol: "BANKNIFTY24MAR47000PE".into(),
            transaction_type: TransactionType::Buy,
            quantity: 25,
        };
        let err = authed_client(&server).place_order(&order).await.unwrap_err();
        assert_eq!(
            err,
            BrokerError::OrderPlacement("MarginException: Insufficient funds".into())
        );
    }

    #[tokio::test]
    async fn test_order_history_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orders/240304000012345"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": [
                    {"order_id": "240304000012345", "status": "PUT ORDER REQ RECEIVED"},
                    {"order_id": "240304000012345", "status": "OPEN"},
                    {"order_id": "240304000012345", "status": "COMPLETE",
                     "average_price": 312.5, "filled_quantity": 25, "status_message": null}
                ]
            })))
            .mount(&server)
            .await;

        let history = authed_client(&server)
            .order_history("240304000012345")
            .await
            .unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].status, OrderStatus::Complete);
        assert_eq!(history[2].average_price, Some(dec!(312.5)));
        assert!(!history[1].status.is_terminal());
    }

    #[tokio::test]
    async fn test_historical_candles() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instruments/historical/12345/5minute"))
            .and(query_param("from", "2024-03-04 09:15:00"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {"candles": [
                    ["2024-03-04T09:15:00+0530", 47000, 47100, 46950, 47080, 1200],
                    ["2024-03-04T09:20:00+0530", 47080, 47150, 47010, 47020, 900]
                ]}
            })))
            .mount(&server)
            .await;

        let day = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let candles = authed_client(&server)
            .historical_candles(12345, day, CandleInterval::FiveMinute)
            .await
            .unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, dec!(47020));
    }

    #[tokio::test]
    async fn test_login_flow_captures_request_token() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/connect/entry"))
            .respond_with(ResponseTemplate::new(302).insert_header(
                "Location",
                format!("{}/connect/login?api_key=kite_key&v=3", server.uri()).as_str(),
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/connect/login"))
            .and(query_param("skip_session", "true"))
            .respond_with(ResponseTemplate::new(302).insert_header(
                "Location",
                "http://127.0.0.1:9/callback?action=login&status=success&request_token=req_tok_123",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/connect/login"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/login"))
            .and(body_string_contains("user_id=AB1234"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {"user_id": "AB1234", "request_id": "rid-1"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/twofa"))
            .and(body_string_contains("request_id=rid-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/token"))
            .and(body_string_contains(
                "checksum=b80b7581191adfcb1e67f920a313a0b2490edab869b65b3f48b50be3e8a58020",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {"user_id": "AB1234", "access_token": "acc_tok"}
            })))
            .mount(&server)
            .await;

        let creds = Credentials {
            user_id: "AB1234".into(),
            password: "pw".into(),
            api_key: "kite_key".into(),
            api_secret: "kite_secret".into(),
            totp_code: "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ".into(),
        };
        let client = KiteClient::login(&config_for(&server), &creds).await.unwrap();
        assert_eq!(client.access_token(), Some("acc_tok"));
    }
}
