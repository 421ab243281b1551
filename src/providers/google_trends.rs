//! Google Trends provider driven through a stealth session.
//!
//! Mirrors what the Trends web app does: land on the home page, ask the
//! `explore` endpoint for the TIMESERIES widget token, then read
//! `widgetdata/multiline`. Both JSON endpoints prefix their body with an
//! anti-XSSI guard that is stripped before parsing.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use url::Url;

use super::{ProviderContext, ProviderError, TrendProvider, TrendQuery, mean, screen_page, submit_token};
use crate::challenges::{ChallengeDetector, PageSignal};
use crate::config::TrendDefaults;
use crate::modules::stealth::{Session, StealthSession};

pub const NAME: &str = "google_trends";

const TIMESERIES_WIDGET: &str = "TIMESERIES";

#[derive(Debug)]
pub struct GoogleTrendsProvider {
    stealth: Arc<StealthSession>,
    detector: ChallengeDetector,
    base_url: String,
    hl: String,
    tz: i32,
}

impl GoogleTrendsProvider {
    pub fn new(stealth: Arc<StealthSession>) -> Self {
        let defaults = TrendDefaults::default();
        Self {
            stealth,
            detector: ChallengeDetector::default(),
            base_url: "https://trends.google.com".to_string(),
            hl: defaults.hl,
            tz: defaults.tz,
        }
    }

    pub fn from_settings(stealth: Arc<StealthSession>, trends: &TrendDefaults) -> Self {
        Self::new(stealth).with_locale(trends.hl.clone(), trends.tz)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_locale(mut self, hl: impl Into<String>, tz: i32) -> Self {
        self.hl = hl.into();
        self.tz = tz;
        self
    }

    pub fn with_detector(mut self, detector: ChallengeDetector) -> Self {
        self.detector = detector;
        self
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&self.base_url)
            .and_then(|base| base.join(path))
            .map_err(|err| ProviderError::Configuration(format!("bad trends url: {err}")))?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url)
    }

    fn home_url(&self, query: &TrendQuery) -> Result<Url, ProviderError> {
        self.endpoint("/trends/", &[("geo", query.geo.as_str()), ("hl", self.hl.as_str())])
    }

    fn explore_url(&self, query: &TrendQuery) -> Result<Url, ProviderError> {
        let req = json!({
            "comparisonItem": [{
                "keyword": query.keyword,
                "geo": query.geo,
                "time": query.timeframe,
            }],
            "category": 0,
            "property": "",
        })
        .to_string();
        let tz = self.tz.to_string();
        self.endpoint(
            "/trends/api/explore",
            &[("hl", self.hl.as_str()), ("tz", tz.as_str()), ("req", req.as_str())],
        )
    }

    fn multiline_url(&self, widget: &TimeseriesWidget) -> Result<Url, ProviderError> {
        let tz = self.tz.to_string();
        let req = widget.request.to_string();
        self.endpoint(
            "/trends/api/widgetdata/multiline",
            &[
                ("hl", self.hl.as_str()),
                ("tz", tz.as_str()),
                ("req", req.as_str()),
                ("token", widget.token.as_str()),
            ],
        )
    }

    async fn load(&self, session: &mut Session, url: &Url) -> Result<PageSignal, ProviderError> {
        let signal = session.navigate(url).await?;
        screen_page(&self.detector, &signal)?;
        Ok(signal)
    }

    async fn run(
        &self,
        session: &mut Session,
        query: &TrendQuery,
        ctx: &ProviderContext<'_>,
    ) -> Result<f64, ProviderError> {
        if let Some(token) = ctx.captcha_token {
            submit_token(session, &self.detector, token).await?;
        }

        self.load(session, &self.home_url(query)?).await?;

        let explore = self.load(session, &self.explore_url(query)?).await?;
        let widget = timeseries_widget(&parse_guarded(&explore.body)?)?;

        let data = self.load(session, &self.multiline_url(&widget)?).await?;
        timeline_mean(&parse_guarded(&data.body)?)
            .ok_or_else(|| ProviderError::InvalidResponse(format!("no timeline data for '{}'", query.keyword)))
    }
}

#[derive(Debug, Clone)]
struct TimeseriesWidget {
    token: String,
    request: Value,
}

/// Parse a JSON body that may carry the `)]}'` anti-XSSI prefix.
fn parse_guarded(body: &str) -> Result<Value, ProviderError> {
    let trimmed = body.trim_start();
    let payload = match trimmed.strip_prefix(")]}'") {
        Some(rest) => rest.trim_start_matches(',').trim_start(),
        None => trimmed,
    };
    if payload.is_empty() {
        return Err(ProviderError::InvalidResponse("empty trends payload".into()));
    }
    serde_json::from_str(payload)
        .map_err(|err| ProviderError::InvalidResponse(format!("trends payload: {err}")))
}

fn timeseries_widget(explore: &Value) -> Result<TimeseriesWidget, ProviderError> {
    explore
        .get("widgets")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|widget| widget.get("id").and_then(Value::as_str) == Some(TIMESERIES_WIDGET))
        .and_then(|widget| {
            Some(TimeseriesWidget {
                token: widget.get("token")?.as_str()?.to_string(),
                request: widget.get("request")?.clone(),
            })
        })
        .ok_or_else(|| ProviderError::InvalidResponse("explore response lacks a TIMESERIES widget".into()))
}

fn timeline_mean(data: &Value) -> Option<f64> {
    let values: Vec<f64> = data
        .pointer("/default/timelineData")?
        .as_array()?
        .iter()
        .filter_map(|point| point.get("value")?.as_array()?.first()?.as_f64())
        .collect();
    mean(&values)
}

#[async_trait]
impl TrendProvider for GoogleTrendsProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn fetch_score(&self, query: &TrendQuery, ctx: &ProviderContext<'_>) -> Result<f64, ProviderError> {
        let proxy = ctx.acquire_proxy()?;
        let mut session = match self.stealth.open(proxy.clone(), ctx.cancel).await {
            Ok(session) => session,
            Err(err) => {
                let outcome = Err(ProviderError::from(err));
                ctx.report_proxy(proxy.as_ref(), &outcome);
                return outcome;
            }
        };

        let outcome = self.run(&mut session, query, ctx).await;
        if let Err(err) = session.close().await {
            log::debug!("google trends session close failed: {}", err);
        }
        ctx.report_proxy(proxy.as_ref(), &outcome);
        outcome
    }
}
