use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use super::{ExchangeClient, FetchError, HourlyConverter};
use crate::config::CoinGeckoSettings;
use crate::models::Observation;
use crate::Result;

// Type alias for the rate limiter to simplify signatures
type CoinGeckoRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// CoinGecko API client with rate limiting
///
/// This struct is cloneable to allow sharing across async tasks.
/// All clones share the same rate limiter. Retrying is left to the caller;
/// each call makes exactly one request and classifies the failure.
#[derive(Clone)]
pub struct CoinGeckoClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    /// Maps uppercase symbol -> CoinGecko coin_id
    coin_ids: Arc<HashMap<String, String>>,
    rate_limiter: Arc<CoinGeckoRateLimiter>,
    converter: Arc<HourlyConverter>,
}

/// Response from /market_chart/range endpoint
#[derive(Debug, Deserialize)]
pub struct MarketChartData {
    pub prices: Vec<[f64; 2]>, // [timestamp_ms, price]
    #[serde(default)]
    pub market_caps: Vec<[f64; 2]>, // [timestamp_ms, market_cap]
    #[serde(default)]
    pub total_volumes: Vec<[f64; 2]>, // [timestamp_ms, volume_24h]
}

impl CoinGeckoClient {
    pub fn new(settings: &CoinGeckoSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(settings.timeout_secs))
            .build()?;

        let rpm = NonZeroU32::new(settings.rate_limit_rpm).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        let coin_ids = settings
            .coin_ids
            .iter()
            .map(|(symbol, id)| (symbol.to_uppercase(), id.clone()))
            .collect();

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone().filter(|k| !k.is_empty()),
            coin_ids: Arc::new(coin_ids),
            rate_limiter,
            converter: Arc::new(HourlyConverter::new()),
        })
    }

    /// CoinGecko coin_id for a symbol, falling back to the lowercase symbol
    pub fn coin_id(&self, symbol: &str) -> String {
        self.coin_ids
            .get(&symbol.to_uppercase())
            .cloned()
            .unwrap_or_else(|| symbol.to_lowercase())
    }

    /// Make a single rate-limited request and classify any failure
    async fn make_request(&self, url: &str) -> std::result::Result<reqwest::Response, FetchError> {
        self.rate_limiter.until_ready().await;

        let mut request = self.client.get(url);
        if let Some(api_key) = &self.api_key {
            request = request.header("x-cg-demo-api-key", api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("network error: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status.as_u16() == 429 {
            tracing::warn!("Rate limited by CoinGecko (429)");
            return Err(FetchError::Transient("rate limited (429)".to_string()));
        }

        if status.is_server_error() {
            tracing::warn!("Server error {} from CoinGecko", status);
            return Err(FetchError::Transient(format!("server error {}", status)));
        }

        // Other errors (4xx) - don't retry
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(FetchError::Permanent(format!(
            "CoinGecko API error ({}): {}",
            status, error_text
        )))
    }

    /// Fetch raw market chart samples between two instants
    pub async fn get_market_chart_range(
        &self,
        coin_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> std::result::Result<MarketChartData, FetchError> {
        let url = format!(
            "{}/coins/{}/market_chart/range?vs_currency=usd&from={}&to={}",
            self.base_url,
            coin_id,
            from.timestamp(),
            to.timestamp()
        );

        tracing::debug!("Fetching market chart range for {} ({} -> {})", coin_id, from, to);

        let response = self.make_request(&url).await?;

        let data: MarketChartData = response.json().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Transient(format!("timed out reading body: {}", e))
            } else {
                FetchError::Permanent(format!("failed to parse market chart: {}", e))
            }
        })?;

        tracing::debug!("Fetched {} price points for {}", data.prices.len(), coin_id);

        Ok(data)
    }
}

#[async_trait]
impl ExchangeClient for CoinGeckoClient {
    async fn fetch_range(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> std::result::Result<Vec<Observation>, FetchError> {
        let coin_id = self.coin_id(symbol);
        let data = self.get_market_chart_range(&coin_id, start, end).await?;
        Ok(self.converter.convert(symbol, data, start, end))
    }

    fn name(&self) -> &str {
        "coingecko"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mockito::Matcher;

    fn settings_for(base_url: &str) -> CoinGeckoSettings {
        CoinGeckoSettings {
            base_url: base_url.to_string(),
            api_key: Some("test-key".to_string()),
            rate_limit_rpm: 600,
            timeout_secs: 5,
            ..CoinGeckoSettings::default()
        }
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_coin_id_lookup() {
        let client = CoinGeckoClient::new(&CoinGeckoSettings::default()).unwrap();
        assert_eq!(client.coin_id("BTC"), "bitcoin");
        assert_eq!(client.coin_id("eth"), "ethereum");
        // Unknown symbols fall back to their lowercase form
        assert_eq!(client.coin_id("DOGE"), "doge");
    }

    #[tokio::test]
    async fn test_fetch_range_parses_hourly_observations() {
        let mut server = mockito::Server::new_async().await;
        let (start, end) = window();
        let body = serde_json::json!({
            "prices": [
                [start.timestamp_millis(), 42000.0],
                [start.timestamp_millis() + 3_600_000, 42100.0],
                [start.timestamp_millis() + 7_200_000 + 60_000, 42200.0]
            ],
            "market_caps": [[start.timestamp_millis(), 8.2e11]],
            "total_volumes": [[start.timestamp_millis(), 2.5e10]]
        });

        let mock = server
            .mock("GET", "/coins/bitcoin/market_chart/range")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("vs_currency".into(), "usd".into()),
                Matcher::UrlEncoded("from".into(), start.timestamp().to_string()),
                Matcher::UrlEncoded("to".into(), end.timestamp().to_string()),
            ]))
            .match_header("x-cg-demo-api-key", "test-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let client = CoinGeckoClient::new(&settings_for(&server.url())).unwrap();
        let observations = client.fetch_range("BTC", start, end).await.unwrap();

        mock.assert_async().await;
        assert_eq!(observations.len(), 3);
        assert_eq!(observations[0].symbol, "BTC");
        assert_eq!(observations[0].price, 42000.0);
        assert_eq!(observations[0].market_cap, 8.2e11);
        assert_eq!(observations[2].timestamp, start + chrono::Duration::hours(2));
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", Matcher::Any)
            .with_status(429)
            .create_async()
            .await;

        let client = CoinGeckoClient::new(&settings_for(&server.url())).unwrap();
        let (start, end) = window();
        let err = client.fetch_range("BTC", start, end).await.unwrap_err();

        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let client = CoinGeckoClient::new(&settings_for(&server.url())).unwrap();
        let (start, end) = window();
        let err = client.fetch_range("ETH", start, end).await.unwrap_err();

        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", Matcher::Any)
            .with_status(404)
            .with_body("coin not found")
            .create_async()
            .await;

        let client = CoinGeckoClient::new(&settings_for(&server.url())).unwrap();
        let (start, end) = window();
        let err = client.fetch_range("NOPE", start, end).await.unwrap_err();

        assert!(!err.is_transient());
        assert!(err.to_string().contains("coin not found"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", Matcher::Any)
            .with_status(200)
            .with_body("{\"unexpected\": true}")
            .create_async()
            .await;

        let client = CoinGeckoClient::new(&settings_for(&server.url())).unwrap();
        let (start, end) = window();
        let err = client.fetch_range("BTC", start, end).await.unwrap_err();

        assert_eq!(
            std::mem::discriminant(&err),
            std::mem::discriminant(&FetchError::Permanent(String::new()))
        );
    }

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_fetch_range_live() {
        let settings = CoinGeckoSettings {
            api_key: std::env::var("COINGECKO_API_KEY").ok(),
            ..CoinGeckoSettings::default()
        };
        let client = CoinGeckoClient::new(&settings).unwrap();

        let end = crate::models::floor_hour(Utc::now());
        let start = end - chrono::Duration::hours(24);
        let observations = client.fetch_range("BTC", start, end).await.unwrap();

        assert!(
            observations.len() > 20,
            "Expected ~24 hourly observations, got {}",
            observations.len()
        );
        assert!(observations.iter().all(|o| o.price > 0.0));
    }
}
