//! Captcha provider integrations.
//!
//! These adapters provide a unified interface for third-party captcha
//! solvers such as TwoCaptcha and CapSolver. The resolver stays agnostic of
//! vendor-specific details while still retrieving challenge tokens when a
//! provider session runs into a verification page.

mod capsolver;
mod twocaptcha;

pub use capsolver::CapSolverProvider;
pub use twocaptcha::TwoCaptchaProvider;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::config::{CaptchaService, CaptchaSettings};

/// High-level configuration that controls captcha solving behaviour.
#[derive(Debug, Clone)]
pub struct CaptchaConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl From<&CaptchaSettings> for CaptchaConfig {
    fn from(settings: &CaptchaSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.timeout_secs),
            poll_interval: Duration::from_secs(settings.poll_interval_secs.max(1)),
        }
    }
}

/// Widget families the solving services understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptchaKind {
    RecaptchaV2,
    RecaptchaV3,
    HCaptcha,
    Turnstile,
}

/// Details describing the captcha a page presented.
#[derive(Debug, Clone)]
pub struct CaptchaTask {
    pub kind: CaptchaKind,
    pub site_key: String,
    pub page_url: Url,
    pub action: Option<String>,
    pub data: HashMap<String, String>,
}

impl CaptchaTask {
    pub fn new(kind: CaptchaKind, site_key: impl Into<String>, page_url: Url) -> Self {
        Self {
            kind,
            site_key: site_key.into(),
            page_url,
            action: None,
            data: HashMap::new(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn insert_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Resolved captcha token and optional metadata.
#[derive(Debug, Clone)]
pub struct CaptchaSolution {
    pub token: String,
    pub expires_in: Option<Duration>,
    pub metadata: HashMap<String, String>,
}

impl CaptchaSolution {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_in: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_expiry(mut self, ttl: Duration) -> Self {
        self.expires_in = Some(ttl);
        self
    }

    pub fn insert_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Common result type returned by captcha providers.
pub type CaptchaResult = Result<CaptchaSolution, CaptchaError>;

/// Shared interface implemented by captcha vendors.
#[async_trait]
pub trait CaptchaProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult;
}

/// Errors surfaced by captcha providers.
#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("captcha provider misconfigured: {0}")]
    Configuration(String),
    #[error("captcha provider request failed: {0}")]
    Provider(String),
    #[error("captcha solving timed out after {0:?}")]
    Timeout(Duration),
    #[error("captcha provider returned an unexpected payload: {0}")]
    InvalidResponse(String),
    #[error("captcha transport error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Instantiate the provider selected in settings. Returns `None` when the
/// service is disabled or has no API key.
pub fn provider_from_settings(settings: &CaptchaSettings) -> Option<Arc<dyn CaptchaProvider>> {
    let config = CaptchaConfig::from(settings);
    let key = settings.api_key.clone().filter(|key| !key.is_empty());
    match (settings.service, key) {
        (CaptchaService::Disabled, _) => None,
        (service, None) => {
            log::warn!("captcha service {service:?} selected but no API key configured");
            None
        }
        (CaptchaService::TwoCaptcha, Some(key)) => {
            Some(Arc::new(TwoCaptchaProvider::with_config(key, config)))
        }
        (CaptchaService::CapSolver, Some(key)) => {
            Some(Arc::new(CapSolverProvider::with_config(key, config)))
        }
    }
}

/// Vendors report failures as error codes; account-level codes mean the
/// provider cannot work until its configuration changes.
fn classify_error_code(code: &str) -> CaptchaError {
    const ACCOUNT_ERRORS: &[&str] = &[
        "ERROR_WRONG_USER_KEY",
        "ERROR_KEY_DOES_NOT_EXIST",
        "ERROR_ZERO_BALANCE",
        "ERROR_IP_NOT_ALLOWED",
        "ERROR_KEY_DENIED_ACCESS",
        "ERROR_INVALID_KEY",
    ];
    if ACCOUNT_ERRORS.iter().any(|known| code.eq_ignore_ascii_case(known)) {
        CaptchaError::Configuration(code.to_string())
    } else {
        CaptchaError::Provider(code.to_string())
    }
}
