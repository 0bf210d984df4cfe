use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::ServiceError;

pub const COINGECKO_BTC_URL: &str =
    "https://api.coingecko.com/api/v3/simple/price?ids=bitcoin&vs_currencies=usd";

/// Source of the quotes shown by the `$` price reply.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn bitcoin_usd(&self) -> Result<f64, ServiceError>;
    /// No live feed is wired for oil; implementations return a configured quote.
    fn oil_usd(&self) -> f64;
}

pub struct CoinGeckoPrices {
    client: Client,
    url: String,
    oil_usd: f64,
}

impl CoinGeckoPrices {
    pub fn new(url: String, oil_usd: f64, timeout: Duration) -> Result<Self, ServiceError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url,
            oil_usd,
        })
    }
}

#[async_trait]
impl PriceSource for CoinGeckoPrices {
    async fn bitcoin_usd(&self) -> Result<f64, ServiceError> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(ServiceError::HttpStatus(response.status()));
        }
        let body: serde_json::Value = response.json().await?;
        parse_bitcoin_usd(&body)
    }

    fn oil_usd(&self) -> f64 {
        self.oil_usd
    }
}

/// Extract `bitcoin.usd` from a CoinGecko simple-price body.
pub fn parse_bitcoin_usd(body: &serde_json::Value) -> Result<f64, ServiceError> {
    body.get("bitcoin")
        .and_then(|b| b.get("usd"))
        .and_then(|v| v.as_f64())
        .ok_or(ServiceError::EmptyResponse)
}

/// Render a quote for display; whole numbers drop the fractional part.
pub fn format_price(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{:.2}", value)
    }
}
