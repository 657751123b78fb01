use crate::config::USER_AGENT;
use crate::error::{FxError, FxResult};
use crate::models::{normalize_code, RateTable, Rates};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Source of rate tables keyed by base currency.
#[async_trait]
pub trait RateProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_rates(&self, base: &str) -> FxResult<RateTable>;
}

/// Fetches `{"rates": {...}}` documents from a URL template containing
/// `{base}`.
pub struct HttpRateProvider {
    client: Client,
    url_template: String,
}

impl HttpRateProvider {
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> FxResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self::with_client(client, url_template))
    }

    pub fn with_client(client: Client, url_template: impl Into<String>) -> Self {
        Self {
            client,
            url_template: url_template.into(),
        }
    }

    fn url_for(&self, base: &str) -> String {
        self.url_template.replace("{base}", base)
    }
}

#[async_trait]
impl RateProvider for HttpRateProvider {
    fn name(&self) -> &str {
        &self.url_template
    }

    async fn fetch_rates(&self, base: &str) -> FxResult<RateTable> {
        let api_url = self.url_for(base);
        debug!(url = %api_url, "Requesting exchange rates");

        let response = self.client.get(&api_url).send().await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.text().await?;
                let rates: Rates = serde_json::from_str(&body)
                    .map_err(|e| FxError::MalformedResponse(e.to_string()))?;
                parse_rates(base, rates)
            }
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                Err(FxError::Network("API request limit exceeded".into()))
            }
            status => Err(FxError::Network(format!(
                "Error fetching exchange rates: {}",
                status
            ))),
        }
    }
}

/// Checks a decoded response against the expected contract: matching base,
/// numeric positive rates, at least one quote besides the base.
pub fn parse_rates(base: &str, response: Rates) -> FxResult<RateTable> {
    let base = normalize_code(base);

    if let Some(reported) = response.base.as_deref() {
        if normalize_code(reported) != base {
            return Err(FxError::MalformedResponse(format!(
                "requested base {} but response is for {}",
                base, reported
            )));
        }
    }

    let mut rates = Vec::with_capacity(response.rates.len());
    for (code, value) in response.rates {
        let rate = value.as_f64().ok_or_else(|| {
            FxError::MalformedResponse(format!("rate for {} is not a number: {}", code, value))
        })?;
        rates.push((code, rate));
    }

    let table = RateTable::new(&base, rates).map_err(FxError::MalformedResponse)?;
    if table.len() < 2 {
        return Err(FxError::MalformedResponse("response contains no rates".into()));
    }
    Ok(table)
}

/// Tries each provider in order and returns the first valid table.
pub struct ProviderChain {
    providers: Vec<Arc<dyn RateProvider>>,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn RateProvider>>) -> Self {
        Self { providers }
    }

    pub fn from_urls(urls: &[String], timeout: Duration) -> FxResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        let providers = urls
            .iter()
            .map(|url| {
                Arc::new(HttpRateProvider::with_client(client.clone(), url.clone()))
                    as Arc<dyn RateProvider>
            })
            .collect();
        Ok(Self::new(providers))
    }
}

#[async_trait]
impl RateProvider for ProviderChain {
    fn name(&self) -> &str {
        "chain"
    }

    async fn fetch_rates(&self, base: &str) -> FxResult<RateTable> {
        let mut last_error = FxError::Network("no rate providers configured".into());

        for provider in &self.providers {
            match provider.fetch_rates(base).await {
                Ok(table) => {
                    debug!(provider = provider.name(), base, codes = table.len(), "Got rates");
                    return Ok(table);
                }
                Err(e) => {
                    warn!(provider = provider.name(), base, error = %e, "Provider failed");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }
}
