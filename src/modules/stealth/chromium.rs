//! Chromium-backed browser driver using chromiumoxide.
//!
//! One browser process per session, each with its own profile directory.
//! Cookies carry over between runs through the session vault. Authenticated
//! proxies are answered over the Fetch domain, since Chromium takes no
//! credentials on `--proxy-server`.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, InsertTextParams,
};
use chromiumoxide::cdp::browser_protocol::fetch::{
    AuthChallengeResponse, AuthChallengeResponseResponse, ContinueRequestParams,
    ContinueWithAuthParams, EnableParams, EventAuthRequired, EventRequestPaused,
};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use url::Url;

use super::{BrowserDriver, BrowserPage, LaunchProfile, StealthError, StoredCookie};
use crate::challenges::PageSignal;
use crate::modules::proxy::ProxyCredentials;

const STATUS_SCRIPT: &str = "(() => { const nav = performance.getEntriesByType('navigation')[0]; return nav && nav.responseStatus ? nav.responseStatus : 200; })()";

/// Browser driver that launches a real Chromium instance.
#[derive(Debug, Clone, Default)]
pub struct ChromiumBrowser {
    executable: Option<PathBuf>,
}

impl ChromiumBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }
}

struct ChromiumPage {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
    proxy_auth: Option<JoinHandle<()>>,
    pointer: (f64, f64),
}

/// Enable request interception with auth handling on `page`, then answer
/// every proxy challenge with `credentials`. Paused requests are released
/// unchanged.
async fn answer_proxy_auth(page: &Page, credentials: ProxyCredentials) -> Result<JoinHandle<()>, StealthError> {
    let launch = |err: chromiumoxide::error::CdpError| StealthError::Launch(err.to_string());
    let mut paused = page.event_listener::<EventRequestPaused>().await.map_err(launch)?;
    let mut challenges = page.event_listener::<EventAuthRequired>().await.map_err(launch)?;
    page.execute(EnableParams::builder().handle_auth_requests(true).build())
        .await
        .map_err(launch)?;

    let answer = AuthChallengeResponse::builder()
        .response(AuthChallengeResponseResponse::ProvideCredentials)
        .username(credentials.username.clone())
        .password(credentials.password().to_string())
        .build()
        .map_err(StealthError::Launch)?;
    let page = page.clone();
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = paused.next() => {
                    if let Err(err) = page.execute(ContinueRequestParams::new(event.request_id.clone())).await {
                        log::debug!("could not release paused request: {}", err);
                    }
                }
                Some(event) = challenges.next() => {
                    let params = ContinueWithAuthParams::new(event.request_id.clone(), answer.clone());
                    if let Err(err) = page.execute(params).await {
                        log::debug!("could not answer proxy auth: {}", err);
                    }
                }
                else => break,
            }
        }
    }))
}

#[async_trait]
impl BrowserDriver for ChromiumBrowser {
    fn name(&self) -> &'static str {
        "chromium"
    }

    async fn launch(&self, profile: &LaunchProfile) -> Result<Box<dyn BrowserPage>, StealthError> {
        let fingerprint = &profile.fingerprint;
        let (width, height) = fingerprint.viewport;

        let mut builder = BrowserConfig::builder()
            .window_size(u32::from(width), u32::from(height))
            .arg(format!("--user-agent={}", fingerprint.user_agent))
            .arg(format!("--lang={}", fingerprint.languages.join(",")))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        if profile.headless {
            builder = builder.arg("--headless=new");
        } else {
            builder = builder.with_head();
        }
        if let Some(executable) = &self.executable {
            builder = builder.chrome_executable(executable);
        }
        if let Some(dir) = &profile.profile_dir {
            builder = builder.user_data_dir(dir);
        }
        if let Some(proxy) = &profile.proxy {
            builder = builder.arg(format!(
                "--proxy-server={}://{}",
                proxy.protocol().scheme(),
                proxy.address()
            ));
        }
        let config = builder.build().map_err(StealthError::Launch)?;

        let (browser, mut events) = Browser::launch(config)
            .await
            .map_err(|err| StealthError::Launch(err.to_string()))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let _ = event;
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|err| StealthError::Launch(err.to_string()))?;
        let proxy_auth = match profile.proxy.as_ref().and_then(|proxy| proxy.credentials()) {
            Some(credentials) => Some(answer_proxy_auth(&page, credentials.clone()).await?),
            None => None,
        };
        page.evaluate_on_new_document(fingerprint.init_script())
            .await
            .map_err(|err| StealthError::Launch(err.to_string()))?;

        if !profile.cookies.is_empty() {
            let cookies = profile
                .cookies
                .iter()
                .filter_map(|cookie| {
                    CookieParam::builder()
                        .name(cookie.name.clone())
                        .value(cookie.value.clone())
                        .domain(cookie.domain.clone())
                        .path(cookie.path.clone())
                        .build()
                        .ok()
                })
                .collect::<Vec<_>>();
            if let Err(err) = page.set_cookies(cookies).await {
                log::debug!("could not restore cookies for {}: {}", profile.identity, err);
            }
        }

        Ok(Box::new(ChromiumPage {
            browser,
            page,
            handler,
            proxy_auth,
            pointer: (f64::from(width) / 2.0, f64::from(height) / 2.0),
        }))
    }
}

impl ChromiumPage {
    async fn snapshot(&self, requested: &Url) -> Result<PageSignal, StealthError> {
        let final_url = self
            .page
            .url()
            .await
            .ok()
            .flatten()
            .and_then(|raw| Url::parse(&raw).ok())
            .unwrap_or_else(|| requested.clone());
        let status = match self.page.evaluate(STATUS_SCRIPT).await {
            Ok(result) => result.into_value::<u16>().unwrap_or(200),
            Err(_) => 200,
        };
        let html: String = self
            .page
            .evaluate("document.documentElement.outerHTML")
            .await
            .map_err(|err| interaction(err.to_string()))?
            .into_value()
            .map_err(|err| interaction(format!("{err:?}")))?;
        Ok(PageSignal::new(final_url, status, html).with_content_type("text/html"))
    }

    async fn dispatch_mouse(&self, params: DispatchMouseEventParams) -> Result<(), StealthError> {
        self.page
            .execute(params)
            .await
            .map(|_| ())
            .map_err(|err| interaction(err.to_string()))
    }
}

fn interaction(reason: String) -> StealthError {
    StealthError::Interaction(reason)
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn navigate(&mut self, url: &Url, timeout: Duration) -> Result<PageSignal, StealthError> {
        match tokio::time::timeout(timeout, self.page.goto(url.as_str())).await {
            Ok(Ok(_)) => {
                let _ = self.page.wait_for_navigation().await;
                self.snapshot(url).await
            }
            Ok(Err(err)) => Err(StealthError::Navigation {
                url: url.to_string(),
                reason: err.to_string(),
            }),
            Err(_) => Err(StealthError::Timeout(timeout)),
        }
    }

    async fn submit_form(
        &mut self,
        action: &Url,
        fields: &[(String, String)],
        timeout: Duration,
    ) -> Result<PageSignal, StealthError> {
        let fields = serde_json::to_string(fields).map_err(|err| interaction(err.to_string()))?;
        let action_json =
            serde_json::to_string(action.as_str()).map_err(|err| interaction(err.to_string()))?;
        let script = format!(
            "(() => {{ const form = document.createElement('form'); form.method = 'POST'; form.action = {action_json}; \
             for (const [name, value] of {fields}) {{ const input = document.createElement('input'); input.type = 'hidden'; input.name = name; input.value = value; form.appendChild(input); }} \
             document.body.appendChild(form); form.submit(); return true; }})()"
        );
        self.page
            .evaluate(script)
            .await
            .map_err(|err| interaction(err.to_string()))?;
        match tokio::time::timeout(timeout, self.page.wait_for_navigation()).await {
            Ok(_) => self.snapshot(action).await,
            Err(_) => Err(StealthError::Timeout(timeout)),
        }
    }

    async fn mouse_move(&mut self, x: f64, y: f64) -> Result<(), StealthError> {
        self.dispatch_mouse(DispatchMouseEventParams::new(DispatchMouseEventType::MouseMoved, x, y))
            .await?;
        self.pointer = (x, y);
        Ok(())
    }

    async fn scroll(&mut self, delta_y: i32) -> Result<(), StealthError> {
        let params = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseWheel)
            .x(self.pointer.0)
            .y(self.pointer.1)
            .delta_x(0.0)
            .delta_y(f64::from(delta_y))
            .build()
            .map_err(interaction)?;
        self.dispatch_mouse(params).await
    }

    async fn type_text(&mut self, text: &str) -> Result<(), StealthError> {
        self.page
            .execute(InsertTextParams::new(text))
            .await
            .map(|_| ())
            .map_err(|err| interaction(err.to_string()))
    }

    async fn cookies(&mut self) -> Result<Vec<StoredCookie>, StealthError> {
        let cookies = self
            .page
            .get_cookies()
            .await
            .map_err(|err| interaction(err.to_string()))?;
        Ok(cookies
            .into_iter()
            .map(|cookie| StoredCookie {
                name: cookie.name,
                value: cookie.value,
                domain: cookie.domain,
                path: cookie.path,
            })
            .collect())
    }

    async fn close(&mut self) -> Result<(), StealthError> {
        let _ = self.page.clone().close().await;
        let closed = self.browser.close().await;
        let _ = self.browser.wait().await;
        if let Some(proxy_auth) = self.proxy_auth.take() {
            proxy_auth.abort();
        }
        self.handler.abort();
        closed
            .map(|_| ())
            .map_err(|err| interaction(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::spoofing::FingerprintGenerator;

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn launches_and_reads_page() {
        let profile = LaunchProfile {
            identity: "chromium-test".into(),
            fingerprint: FingerprintGenerator::default().next_fingerprint(),
            proxy: None,
            cookies: Vec::new(),
            headless: true,
            profile_dir: None,
        };
        let mut page = ChromiumBrowser::new().launch(&profile).await.unwrap();
        let url = Url::parse("data:text/html,<h1>Hello</h1>").unwrap();
        let signal = page.navigate(&url, Duration::from_secs(10)).await.unwrap();
        assert!(signal.body.contains("<h1>Hello</h1>"));
        page.close().await.unwrap();
    }
}
