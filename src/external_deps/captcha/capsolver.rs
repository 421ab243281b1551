use super::{
    CaptchaConfig, CaptchaError, CaptchaKind, CaptchaProvider, CaptchaResult, CaptchaSolution,
    CaptchaTask, classify_error_code,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::{Instant, sleep};

const DEFAULT_BASE_URL: &str = "https://api.capsolver.com";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskResponse {
    #[serde(default)]
    error_id: i64,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    solution: Option<Value>,
}

impl TaskResponse {
    fn into_error(self) -> CaptchaError {
        let code = self
            .error_code
            .or(self.error_description)
            .unwrap_or_else(|| format!("errorId {}", self.error_id));
        classify_error_code(&code)
    }
}

/// Adapter for the CapSolver `createTask` / `getTaskResult` API.
#[derive(Debug, Clone)]
pub struct CapSolverProvider {
    pub api_key: String,
    pub config: CaptchaConfig,
    base_url: String,
    client: reqwest::Client,
}

impl CapSolverProvider {
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

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn task_payload(&self, task: &CaptchaTask) -> Value {
        let task_type = match task.kind {
            CaptchaKind::RecaptchaV2 => "ReCaptchaV2TaskProxyLess",
            CaptchaKind::RecaptchaV3 => "ReCaptchaV3TaskProxyLess",
            CaptchaKind::HCaptcha => "HCaptchaTaskProxyLess",
            CaptchaKind::Turnstile => "AntiTurnstileTaskProxyLess",
        };
        let mut body = json!({
            "type": task_type,
            "websiteURL": task.page_url.as_str(),
            "websiteKey": task.site_key,
        });
        if let Some(action) = &task.action {
            body["pageAction"] = json!(action);
        }
        if let Some(data_s) = task.data.get("data-s") {
            body["enterprisePayload"] = json!({ "s": data_s });
        }
        if task.data.get("invisible").is_some_and(|flag| flag == "1") {
            body["isInvisible"] = json!(true);
        }
        body
    }

    async fn post(&self, path: &str, body: &Value) -> Result<TaskResponse, CaptchaError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let response = self.client.post(url).json(body).send().await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|_| CaptchaError::InvalidResponse(text))
    }

    fn extract_token(solution: &Value) -> Option<String> {
        ["gRecaptchaResponse", "token", "captchaResponse"]
            .iter()
            .find_map(|field| solution.get(*field).and_then(Value::as_str))
            .map(str::to_string)
    }
}

#[async_trait]
impl CaptchaProvider for CapSolverProvider {
    fn name(&self) -> &'static str {
        "capsolver"
    }

    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult {
        if self.api_key.is_empty() {
            return Err(CaptchaError::Configuration("missing capsolver api key".into()));
        }

        let created = self
            .post(
                "createTask",
                &json!({ "clientKey": self.api_key, "task": self.task_payload(task) }),
            )
            .await?;
        if created.error_id != 0 {
            return Err(created.into_error());
        }
        let task_id = created
            .task_id
            .ok_or_else(|| CaptchaError::InvalidResponse("createTask without taskId".into()))?;

        let deadline = Instant::now() + self.config.timeout;
        let poll_body = json!({ "clientKey": self.api_key, "taskId": task_id });
        loop {
            sleep(self.config.poll_interval).await;
            let result = self.post("getTaskResult", &poll_body).await?;
            if result.error_id != 0 {
                return Err(result.into_error());
            }
            if result.status.as_deref() == Some("ready") {
                let token = result
                    .solution
                    .as_ref()
                    .and_then(Self::extract_token)
                    .ok_or_else(|| CaptchaError::InvalidResponse("solution without token".into()))?;
                return Ok(CaptchaSolution::new(token).insert_metadata("task_id", task_id));
            }
            if Instant::now() >= deadline {
                return Err(CaptchaError::Timeout(self.config.timeout));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn task(kind: CaptchaKind) -> CaptchaTask {
        CaptchaTask::new(kind, "site-key", Url::parse("https://example.com/login").unwrap())
    }

    #[test]
    fn payload_uses_vendor_task_types() {
        let provider = CapSolverProvider::new("key");
        let payload = provider.task_payload(&task(CaptchaKind::Turnstile).with_action("login"));
        assert_eq!(payload["type"], "AntiTurnstileTaskProxyLess");
        assert_eq!(payload["websiteKey"], "site-key");
        assert_eq!(payload["pageAction"], "login");
    }

    #[tokio::test]
    async fn polls_until_solution_is_ready() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/createTask"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"errorId":0,"taskId":"t-1"}"#))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/getTaskResult"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"errorId":0,"status":"ready","solution":{"gRecaptchaResponse":"03AGdBq"}}"#,
            ))
            .mount(&server)
            .await;

        let provider = CapSolverProvider::with_config(
            "key",
            CaptchaConfig {
                timeout: Duration::from_secs(1),
                poll_interval: Duration::from_millis(5),
            },
        )
        .with_base_url(server.uri());
        let solution = provider.solve(&task(CaptchaKind::RecaptchaV2)).await.unwrap();
        assert_eq!(solution.token, "03AGdBq");
    }

    #[tokio::test]
    async fn denied_key_is_configuration_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/createTask"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"errorId":1,"errorCode":"ERROR_KEY_DENIED_ACCESS"}"#,
            ))
            .mount(&server)
            .await;

        let provider = CapSolverProvider::new("key").with_base_url(server.uri());
        let err = provider.solve(&task(CaptchaKind::HCaptcha)).await.unwrap_err();
        assert!(matches!(err, CaptchaError::Configuration(_)));
    }
}
