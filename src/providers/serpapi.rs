//! SerpAPI Google Trends provider.
//!
//! Priority-one trend source: a paid API that fronts Google Trends, so it
//! rarely sees challenges but needs a key.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::transport::{HttpClientPool, transport_error};
use super::{ProviderContext, ProviderError, TrendProvider, TrendQuery, mean};
use crate::config::ProviderSettings;

pub const NAME: &str = "serpapi";

#[derive(Debug)]
pub struct SerpApiProvider {
    api_key: Option<String>,
    base_url: String,
    clients: HttpClientPool,
}

impl SerpApiProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            base_url: "https://serpapi.com".to_string(),
            clients: HttpClientPool::default(),
        }
    }

    pub fn from_settings(settings: &ProviderSettings) -> Self {
        Self::new(settings.serpapi_key.clone()).with_base_url(settings.serpapi_base_url.clone())
    }

    pub fn with_clients(mut self, clients: HttpClientPool) -> Self {
        self.clients = clients;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/search", self.base_url.trim_end_matches('/'))
    }

    async fn request(
        &self,
        api_key: &str,
        query: &TrendQuery,
        ctx: &ProviderContext<'_>,
    ) -> Result<f64, ProviderError> {
        let proxy = ctx.acquire_proxy()?;
        let client = self.clients.client(proxy.as_ref()).await?;
        self.clients.throttle(ctx.cancel).await?;
        let outcome = self.call(&client, api_key, query, ctx.timeout).await;
        ctx.report_proxy(proxy.as_ref(), &outcome);
        outcome
    }

    async fn call(
        &self,
        client: &reqwest::Client,
        api_key: &str,
        query: &TrendQuery,
        timeout: Duration,
    ) -> Result<f64, ProviderError> {
        let response = client
            .get(self.endpoint())
            .query(&[
                ("engine", "google_trends"),
                ("q", query.keyword.as_str()),
                ("geo", query.geo.as_str()),
                ("date", query.timeframe.as_str()),
                ("data_type", "TIMESERIES"),
                ("api_key", api_key),
            ])
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| transport_error(err, timeout))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|err| transport_error(err, timeout))?;
        match status {
            200..=299 => {}
            401 | 403 => {
                return Err(ProviderError::Configuration(format!(
                    "serpapi rejected the api key ({status})"
                )));
            }
            429 | 500..=599 => return Err(ProviderError::Transient(format!("serpapi status {status}"))),
            _ => return Err(ProviderError::InvalidResponse(format!("serpapi status {status}"))),
        }

        let data: Value = serde_json::from_str(&body)
            .map_err(|err| ProviderError::InvalidResponse(format!("serpapi payload: {err}")))?;
        if let Some(message) = data.get("error").and_then(Value::as_str) {
            return Err(classify_api_error(message));
        }
        extract_score(&data, &query.keyword)
            .ok_or_else(|| ProviderError::InvalidResponse(format!("no interest data for '{}'", query.keyword)))
    }
}

fn classify_api_error(message: &str) -> ProviderError {
    let lowered = message.to_lowercase();
    if lowered.contains("api key") || lowered.contains("run out of searches") || lowered.contains("account") {
        ProviderError::Configuration(message.to_string())
    } else if lowered.contains("hasn't returned any results") {
        ProviderError::InvalidResponse(message.to_string())
    } else {
        ProviderError::Transient(message.to_string())
    }
}

fn value_of(entry: &Value) -> Option<f64> {
    entry
        .get("extracted_value")
        .and_then(Value::as_f64)
        .or_else(|| match entry.get("value")? {
            Value::Number(number) => number.as_f64(),
            Value::String(raw) => raw.trim().trim_end_matches('%').parse().ok(),
            _ => None,
        })
}

fn matches_keyword(entry: &Value, keyword: &str) -> bool {
    match entry.get("query").and_then(Value::as_str) {
        Some(query) => query.eq_ignore_ascii_case(keyword),
        None => true,
    }
}

/// Mean of the keyword's timeline values, else its reported average.
fn extract_score(data: &Value, keyword: &str) -> Option<f64> {
    let interest = data.get("interest_over_time")?;

    let timeline: Vec<f64> = interest
        .get("timeline_data")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|point| point.get("values").and_then(Value::as_array))
        .flat_map(|values| values.iter().filter(|entry| matches_keyword(entry, keyword)))
        .filter_map(value_of)
        .collect();
    if let Some(score) = mean(&timeline) {
        return Some(score);
    }

    match interest.get("averages")? {
        Value::Array(averages) => averages
            .iter()
            .find(|entry| matches_keyword(entry, keyword))
            .and_then(value_of),
        Value::Object(map) => map
            .iter()
            .find(|(query, _)| query.eq_ignore_ascii_case(keyword))
            .and_then(|(_, value)| value.as_f64()),
        _ => None,
    }
}

#[async_trait]
impl TrendProvider for SerpApiProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn fetch_score(&self, query: &TrendQuery, ctx: &ProviderContext<'_>) -> Result<f64, ProviderError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(ProviderError::Configuration("SERPAPI_KEY is not set".into()));
        };
        self.request(api_key, query, ctx).await
    }
}
