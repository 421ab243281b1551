use super::{
    CaptchaConfig, CaptchaError, CaptchaKind, CaptchaProvider, CaptchaResult, CaptchaSolution,
    CaptchaTask, classify_error_code,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::{Instant, sleep};

const DEFAULT_BASE_URL: &str = "https://2captcha.com";
const NOT_READY: &str = "CAPCHA_NOT_READY";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: i64,
    request: Value,
}

impl ApiResponse {
    fn request_text(&self) -> String {
        match &self.request {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

/// Adapter for the TwoCaptcha `in.php` / `res.php` API.
#[derive(Debug, Clone)]
pub struct TwoCaptchaProvider {
    pub api_key: String,
    pub config: CaptchaConfig,
    base_url: String,
    client: reqwest::Client,
}

impl TwoCaptchaProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_config(api_key, CaptchaConfig::default())
    }

    pub fn with_config(api_key: impl Into<String>, config: CaptchaConfig) -> Self {
        Self {
            api_key: api_key.into(),
            config,
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the adapter at a different host (self-hosted mirrors, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn submit_params(&self, task: &CaptchaTask) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("key", self.api_key.clone()),
            ("json", "1".to_string()),
            ("pageurl", task.page_url.to_string()),
        ];
        match task.kind {
            CaptchaKind::RecaptchaV2 => {
                params.push(("method", "userrecaptcha".into()));
                params.push(("googlekey", task.site_key.clone()));
                if let Some(data_s) = task.data.get("data-s") {
                    params.push(("data-s", data_s.clone()));
                }
                if task.data.get("invisible").is_some_and(|flag| flag == "1") {
                    params.push(("invisible", "1".into()));
                }
            }
            CaptchaKind::RecaptchaV3 => {
                params.push(("method", "userrecaptcha".into()));
                params.push(("version", "v3".into()));
                params.push(("googlekey", task.site_key.clone()));
                params.push((
                    "action",
                    task.action.clone().unwrap_or_else(|| "verify".into()),
                ));
                params.push(("min_score", "0.3".into()));
            }
            CaptchaKind::HCaptcha => {
                params.push(("method", "hcaptcha".into()));
                params.push(("sitekey", task.site_key.clone()));
            }
            CaptchaKind::Turnstile => {
                params.push(("method", "turnstile".into()));
                params.push(("sitekey", task.site_key.clone()));
                if let Some(action) = &task.action {
                    params.push(("action", action.clone()));
                }
            }
        }
        params
    }

    async fn call(&self, path: &str, params: &[(&str, String)]) -> Result<ApiResponse, CaptchaError> {
        let response = self
            .client
            .get(self.endpoint(path))
            .query(params)
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|_| CaptchaError::InvalidResponse(body))
    }

    async fn submit(&self, task: &CaptchaTask) -> Result<String, CaptchaError> {
        let response = self.call("in.php", &self.submit_params(task)).await?;
        if response.status == 1 {
            Ok(response.request_text())
        } else {
            Err(classify_error_code(&response.request_text()))
        }
    }

    async fn poll(&self, id: &str) -> CaptchaResult {
        let deadline = Instant::now() + self.config.timeout;
        let params = [
            ("key", self.api_key.clone()),
            ("action", "get".to_string()),
            ("id", id.to_string()),
            ("json", "1".to_string()),
        ];

        loop {
            sleep(self.config.poll_interval).await;
            let response = self.call("res.php", &params).await?;
            let text = response.request_text();
            if response.status == 1 {
                return Ok(CaptchaSolution::new(text).insert_metadata("captcha_id", id));
            }
            if text != NOT_READY {
                return Err(classify_error_code(&text));
            }
            if Instant::now() >= deadline {
                return Err(CaptchaError::Timeout(self.config.timeout));
            }
        }
    }

    /// Remaining account balance.
    pub async fn balance(&self) -> Result<f64, CaptchaError> {
        let params = [
            ("key", self.api_key.clone()),
            ("action", "getbalance".to_string()),
            ("json", "1".to_string()),
        ];
        let response = self.call("res.php", &params).await?;
        let text = response.request_text();
        if response.status != 1 {
            return Err(classify_error_code(&text));
        }
        text.trim_matches('"')
            .parse::<f64>()
            .map_err(|_| CaptchaError::InvalidResponse(text))
    }
}

#[async_trait]
impl CaptchaProvider for TwoCaptchaProvider {
    fn name(&self) -> &'static str {
        "2captcha"
    }

    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult {
        if self.api_key.is_empty() {
            return Err(CaptchaError::Configuration("missing 2captcha api key".into()));
        }
        let id = self.submit(task).await?;
        log::debug!("2captcha accepted task {id} for {}", task.page_url);
        self.poll(&id).await
    }
}
