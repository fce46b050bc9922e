//! PHR exchange-rate cache fed by HTTP price providers.

use log::{debug, error, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::ExchangeConfig;
use crate::error::{Error, Result};
use crate::wallet::UNITS_PER_COIN;

pub const COINMARKETCAP_URL: &str = "https://api.coinmarketcap.com/v1/ticker/phore";

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Turns a provider's JSON body into rates.
pub trait RateDecoder: Send + Sync {
    fn decode(&self, data: &Value, rates: &mut HashMap<String, f64>) -> Result<()>;
}

/// CoinMarketCap v1 ticker: `[{"price_usd": "0.54", ...}]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CmcDecoder;

impl RateDecoder for CmcDecoder {
    fn decode(&self, data: &Value, rates: &mut HashMap<String, f64>) -> Result<()> {
        let fail = |msg: &str| Error::ExchangeRate(msg.to_string());
        let info = data
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| fail("could not get currency"))?;
        let price = info.get("price_usd").ok_or_else(|| fail("could not get USD price"))?;
        let price = price.as_str().ok_or_else(|| fail("could not decode current USD price"))?;
        let price: f64 = price.parse().map_err(|_| fail("usd price is not a number"))?;
        rates.insert("PHR".to_string(), price);
        Ok(())
    }
}

pub struct RateProvider {
    url: String,
    client: reqwest::Client,
    decoder: Box<dyn RateDecoder>,
}

impl RateProvider {
    pub fn new(url: impl Into<String>, client: reqwest::Client, decoder: Box<dyn RateDecoder>) -> Self {
        Self { url: url.into(), client, decoder }
    }

    pub fn coinmarketcap(client: reqwest::Client) -> Self {
        Self::new(COINMARKETCAP_URL, client, Box::new(CmcDecoder))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch and decode into a fresh map; the shared cache is only
    /// touched by the caller once this succeeds.
    async fn fetch(&self) -> Result<HashMap<String, f64>> {
        if self.url.is_empty() {
            return Err(Error::ExchangeRate("provider has no fetch url".into()));
        }
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::ExchangeRate(format!("failed to fetch from {}: {}", self.url, e)))?;
        let data: Value = resp
            .json()
            .await
            .map_err(|e| Error::ExchangeRate(format!("failed to decode JSON from {}: {}", self.url, e)))?;
        let mut rates = HashMap::new();
        self.decoder.decode(&data, &mut rates)?;
        Ok(rates)
    }
}

/// Build the HTTP client providers share, optionally through a SOCKS proxy.
pub fn http_client(socks_proxy: Option<&str>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(HTTP_TIMEOUT);
    if let Some(proxy) = socks_proxy.filter(|p| !p.is_empty()) {
        let proxy = reqwest::Proxy::all(proxy).map_err(|e| Error::Config(format!("socks proxy {}: {}", proxy, e)))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("failed to build http client: {}", e)))
}

pub struct ExchangeRates {
    cache: std::sync::Mutex<HashMap<String, f64>>,
    providers: Vec<RateProvider>,
    // one refresh at a time
    refresh: Mutex<()>,
}

impl ExchangeRates {
    pub fn new(providers: Vec<RateProvider>) -> Self {
        Self { cache: std::sync::Mutex::new(HashMap::new()), providers, refresh: Mutex::new(()) }
    }

    /// CoinMarketCap behind the configured proxy.
    pub fn from_config(cfg: &ExchangeConfig) -> Result<Self> {
        let client = http_client(cfg.socks_proxy.as_deref())?;
        Ok(Self::new(vec![RateProvider::coinmarketcap(client)]))
    }

    /// Refresh now and then every `every` until the task is aborted.
    pub fn spawn_refresh(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let rates = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let _ = rates.fetch_current_rates().await;
            }
        })
    }

    /// Try providers in order; the first success wins.
    pub async fn fetch_current_rates(&self) -> Result<()> {
        let _guard = self.refresh.lock().await;
        for provider in &self.providers {
            match provider.fetch().await {
                Ok(rates) => {
                    debug!("exchange rates updated from {}", provider.url);
                    self.lock_cache().extend(rates);
                    return Ok(());
                }
                Err(e) => warn!("exchange rate provider {} failed: {}", provider.url, e),
            }
        }
        error!("failed to fetch exchange rates");
        Err(Error::ExchangeRate("all exchange rate API queries failed".into()))
    }

    pub fn get_exchange_rate(&self, currency_code: &str) -> Result<f64> {
        self.lock_cache()
            .get(currency_code)
            .copied()
            .ok_or_else(|| Error::CurrencyUnknown(currency_code.to_string()))
    }

    /// Refresh first, then read. A failed refresh falls back to the cache.
    pub async fn get_latest_rate(&self, currency_code: &str) -> Result<f64> {
        let _ = self.fetch_current_rates().await;
        self.get_exchange_rate(currency_code)
    }

    pub fn get_all_rates(&self) -> HashMap<String, f64> {
        self.lock_cache().clone()
    }

    pub fn units_per_coin(&self) -> u64 {
        UNITS_PER_COIN
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, f64>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn set_rate(&self, code: &str, rate: f64) {
        self.lock_cache().insert(code.to_string(), rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use serde_json::json;

    fn sample() -> Value {
        json!([{
            "id": "phore",
            "name": "Phore",
            "symbol": "PHR",
            "rank": "180",
            "price_usd": "0.542017",
            "price_btc": "0.00003918",
            "last_updated": "1513986550"
        }])
    }

    async fn serve(body: Value) -> String {
        let app = Router::new().route(
            "/",
            get(move || {
                let body = body.clone();
                async move { Json(body) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        url
    }

    fn provider(url: &str) -> RateProvider {
        RateProvider::new(url, http_client(None).unwrap(), Box::new(CmcDecoder))
    }

    fn err_text(r: Result<()>) -> String {
        r.unwrap_err().to_string()
    }

    #[test]
    fn cmc_sample_payload() {
        let mut rates = HashMap::new();
        CmcDecoder.decode(&sample(), &mut rates).unwrap();
        assert_eq!(rates, HashMap::from([("PHR".to_string(), 0.542017)]));
    }

    #[test]
    fn cmc_decode_errors() {
        let mut rates = HashMap::from([("PHR".to_string(), 1.0)]);
        let d = CmcDecoder;
        assert!(err_text(d.decode(&json!([]), &mut rates)).ends_with("could not get currency"));
        assert!(err_text(d.decode(&json!([{}]), &mut rates)).ends_with("could not get USD price"));
        assert!(err_text(d.decode(&json!([{"price_usd": 0.5}]), &mut rates))
            .ends_with("could not decode current USD price"));
        assert!(err_text(d.decode(&json!([{"price_usd": "abc"}]), &mut rates)).ends_with("usd price is not a number"));
        assert_eq!(rates["PHR"], 1.0);
    }

    #[tokio::test]
    async fn latest_rate_from_provider() {
        let url = serve(sample()).await;
        let rates = ExchangeRates::new(vec![provider(&url)]);
        assert!(matches!(rates.get_exchange_rate("PHR"), Err(Error::CurrencyUnknown(_))));
        assert_eq!(rates.get_latest_rate("PHR").await.unwrap(), 0.542017);
        assert_eq!(rates.get_exchange_rate("PHR").unwrap(), 0.542017);
    }

    #[tokio::test]
    async fn first_working_provider_wins() {
        let empty = serve(json!([])).await;
        let good = serve(sample()).await;
        let rates = ExchangeRates::new(vec![provider(&empty), provider(&good)]);
        rates.fetch_current_rates().await.unwrap();
        assert_eq!(rates.get_all_rates().len(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_cache() {
        let empty = serve(json!([])).await;
        let rates = ExchangeRates::new(vec![provider(&empty), provider("")]);
        rates.set_rate("PHR", 650.0);
        assert!(matches!(rates.fetch_current_rates().await, Err(Error::ExchangeRate(_))));
        assert_eq!(rates.get_latest_rate("PHR").await.unwrap(), 650.0);
    }

    #[tokio::test]
    async fn refresh_task_fills_cache() {
        let url = serve(sample()).await;
        let rates = Arc::new(ExchangeRates::new(vec![provider(&url)]));
        let task = rates.spawn_refresh(Duration::from_secs(900));
        for _ in 0..100 {
            if rates.get_exchange_rate("PHR").is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        task.abort();
        assert_eq!(rates.get_exchange_rate("PHR").unwrap(), 0.542017);
    }

    #[test]
    fn rates_and_units() {
        let rates = ExchangeRates::new(Vec::new());
        rates.set_rate("USD", 650.0);
        rates.set_rate("EUR", 600.0);
        let all = rates.get_all_rates();
        assert_eq!(all["USD"], 650.0);
        assert_eq!(all["EUR"], 600.0);
        assert_eq!(rates.units_per_coin(), 100_000_000);
        assert!(matches!(rates.get_exchange_rate("usd"), Err(Error::CurrencyUnknown(_))));
    }

    #[test]
    fn proxy_config() {
        assert!(http_client(Some("socks5h://127.0.0.1:9050")).is_ok());
        assert!(ExchangeRates::from_config(&ExchangeConfig::default()).is_ok());
    }
}
