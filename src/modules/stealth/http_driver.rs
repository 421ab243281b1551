//! Reqwest-based implementation of the `BrowserDriver` trait.
//!
//! Emulates a browser context over plain HTTP: fingerprint-derived headers,
//! a cookie jar seeded from the session vault, and an optional proxy.
//! Pointer, scroll and typing actions have no effect over HTTP.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, header};
use url::Url;

use super::{BrowserDriver, BrowserPage, LaunchProfile, StealthError, StoredCookie};
use crate::challenges::PageSignal;

/// Browser driver that speaks HTTP only.
#[derive(Debug, Clone, Default)]
pub struct HttpBrowser;

impl HttpBrowser {
    pub fn new() -> Self {
        Self
    }
}

struct HttpPage {
    client: Client,
    jar: Arc<Jar>,
    origins: BTreeSet<String>,
    referer: Option<Url>,
}

#[async_trait]
impl BrowserDriver for HttpBrowser {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn launch(&self, profile: &LaunchProfile) -> Result<Box<dyn BrowserPage>, StealthError> {
        let jar = Arc::new(Jar::default());
        let mut origins = BTreeSet::new();
        for cookie in &profile.cookies {
            let host = cookie.domain.trim_start_matches('.');
            let Ok(origin) = Url::parse(&format!("https://{host}/")) else {
                continue;
            };
            jar.add_cookie_str(
                &format!(
                    "{}={}; Domain={}; Path={}",
                    cookie.name, cookie.value, cookie.domain, cookie.path
                ),
                &origin,
            );
            origins.insert(origin.to_string());
        }

        let mut builder = Client::builder()
            .cookie_provider(jar.clone())
            .default_headers(profile.fingerprint.headers());
        if let Some(proxy) = &profile.proxy {
            let proxy = reqwest::Proxy::all(proxy.proxy_url())
                .map_err(|err| StealthError::Launch(err.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|err| StealthError::Launch(err.to_string()))?;

        Ok(Box::new(HttpPage {
            client,
            jar,
            origins,
            referer: None,
        }))
    }
}

impl HttpPage {
    fn remember_origin(&mut self, url: &Url) {
        if url.has_host() {
            self.origins.insert(format!("{}/", url.origin().ascii_serialization()));
        }
    }

    async fn finish(
        &mut self,
        request: reqwest::RequestBuilder,
        url: &Url,
        timeout: Duration,
    ) -> Result<PageSignal, StealthError> {
        let mut request = request.timeout(timeout);
        if let Some(referer) = &self.referer {
            request = request.header(header::REFERER, referer.as_str());
        }
        let response = request.send().await.map_err(|err| navigation_error(url, timeout, err))?;

        let final_url = response.url().clone();
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body: Bytes = response
            .bytes()
            .await
            .map_err(|err| navigation_error(url, timeout, err))?;

        self.remember_origin(&final_url);
        self.referer = Some(final_url.clone());
        Ok(PageSignal::new(final_url, status, String::from_utf8_lossy(&body)).with_headers(headers))
    }
}

fn navigation_error(url: &Url, timeout: Duration, err: reqwest::Error) -> StealthError {
    if err.is_timeout() {
        StealthError::Timeout(timeout)
    } else {
        StealthError::Navigation {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl BrowserPage for HttpPage {
    async fn navigate(&mut self, url: &Url, timeout: Duration) -> Result<PageSignal, StealthError> {
        let request = self.client.get(url.as_str());
        self.finish(request, url, timeout).await
    }

    async fn submit_form(
        &mut self,
        action: &Url,
        fields: &[(String, String)],
        timeout: Duration,
    ) -> Result<PageSignal, StealthError> {
        let request = self.client.post(action.as_str()).form(fields);
        self.finish(request, action, timeout).await
    }

    async fn mouse_move(&mut self, _x: f64, _y: f64) -> Result<(), StealthError> {
        Ok(())
    }

    async fn scroll(&mut self, _delta_y: i32) -> Result<(), StealthError> {
        Ok(())
    }

    async fn type_text(&mut self, _text: &str) -> Result<(), StealthError> {
        Ok(())
    }

    async fn cookies(&mut self) -> Result<Vec<StoredCookie>, StealthError> {
        let mut cookies = Vec::new();
        for origin in &self.origins {
            let Ok(url) = Url::parse(origin) else {
                continue;
            };
            let Some(header) = self.jar.cookies(&url) else {
                continue;
            };
            let Ok(raw) = header.to_str() else {
                continue;
            };
            let domain = url.host_str().unwrap_or_default().to_string();
            for pair in raw.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    cookies.push(StoredCookie {
                        name: name.to_string(),
                        value: value.to_string(),
                        domain: domain.clone(),
                        path: "/".to_string(),
                    });
                }
            }
        }
        Ok(cookies)
    }

    async fn close(&mut self) -> Result<(), StealthError> {
        self.referer = None;
        Ok(())
    }
}
