//! Captcha resolution.
//!
//! Wraps the challenge detector and an optional solving service behind one
//! call. A resolver with no service configured, or a challenge the service
//! cannot handle, fails fast so the fallback chain can move on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::detectors::{CaptchaChallenge, ChallengeDetector};
use super::signal::PageSignal;
use crate::config::CaptchaSettings;
use crate::external_deps::captcha::{
    CaptchaConfig, CaptchaError, CaptchaProvider, provider_from_settings,
};
use crate::fallback::CancelSignal;

/// Why a challenge could not be resolved.
#[derive(Debug, Error)]
pub enum ResolutionFailed {
    #[error("no captcha solving service configured")]
    Unavailable,
    #[error("challenge not supported by solving service: {0}")]
    Unsupported(String),
    #[error("captcha resolution timed out after {0:?}")]
    Timeout(Duration),
    #[error("captcha resolution cancelled")]
    Cancelled,
    #[error(transparent)]
    Service(#[from] CaptchaError),
}

impl ResolutionFailed {
    /// Failures that will repeat until configuration changes.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ResolutionFailed::Unavailable | ResolutionFailed::Service(CaptchaError::Configuration(_))
        )
    }
}

/// Solved challenge token, valid for the attempt that requested it.
#[derive(Debug, Clone)]
pub struct CaptchaToken {
    pub token: String,
    pub challenge: CaptchaChallenge,
    pub provider: &'static str,
    pub solved_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Detects challenges and dispatches them to the configured solving service.
#[derive(Clone)]
pub struct CaptchaResolver {
    detector: ChallengeDetector,
    provider: Option<Arc<dyn CaptchaProvider>>,
    config: CaptchaConfig,
}

impl std::fmt::Debug for CaptchaResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptchaResolver")
            .field("provider", &self.provider.as_ref().map(|provider| provider.name()))
            .field("config", &self.config)
            .finish()
    }
}

impl Default for CaptchaResolver {
    fn default() -> Self {
        Self::disabled()
    }
}

impl CaptchaResolver {
    /// Resolver that detects but never solves.
    pub fn disabled() -> Self {
        Self {
            detector: ChallengeDetector::new(),
            provider: None,
            config: CaptchaConfig::default(),
        }
    }

    pub fn new(provider: Arc<dyn CaptchaProvider>, config: CaptchaConfig) -> Self {
        Self {
            detector: ChallengeDetector::new(),
            provider: Some(provider),
            config,
        }
    }

    pub fn from_settings(settings: &CaptchaSettings) -> Self {
        Self {
            detector: ChallengeDetector::new(),
            provider: provider_from_settings(settings),
            config: CaptchaConfig::from(settings),
        }
    }

    pub fn with_detector(mut self, detector: ChallengeDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn detector(&self) -> &ChallengeDetector {
        &self.detector
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Inspect a navigation result for a challenge.
    pub fn detect(&self, signal: &PageSignal) -> Option<CaptchaChallenge> {
        self.detector.inspect(signal)
    }

    /// Solve `challenge`, bounded by the configured timeout and `cancel`.
    pub async fn resolve(
        &self,
        challenge: &CaptchaChallenge,
        cancel: &CancelSignal,
    ) -> Result<CaptchaToken, ResolutionFailed> {
        let provider = self.provider.as_ref().ok_or(ResolutionFailed::Unavailable)?;
        let task = challenge.to_task().ok_or_else(|| {
            ResolutionFailed::Unsupported(format!(
                "{:?} without a solvable site key",
                challenge.challenge_type
            ))
        })?;

        log::info!(
            "submitting {:?} challenge for {} to {}",
            challenge.challenge_type,
            challenge.page_url,
            provider.name()
        );

        let started = Instant::now();
        let timeout = self.config.timeout;
        let solution = tokio::select! {
            result = tokio::time::timeout(timeout, provider.solve(&task)) => match result {
                Ok(solved) => solved?,
                Err(_) => return Err(ResolutionFailed::Timeout(timeout)),
            },
            _ = cancel.cancelled() => return Err(ResolutionFailed::Cancelled),
        };

        let elapsed = started.elapsed();
        log::info!("{} solved challenge in {:?}", provider.name(), elapsed);
        Ok(CaptchaToken {
            token: solution.token,
            challenge: challenge.clone(),
            provider: provider.name(),
            solved_at: Utc::now(),
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenges::detectors::ChallengeType;
    use crate::external_deps::captcha::{CaptchaResult, CaptchaSolution, CaptchaTask};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use url::Url;

    struct SlowProvider(Duration);

    #[async_trait]
    impl CaptchaProvider for SlowProvider {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn solve(&self, _task: &CaptchaTask) -> CaptchaResult {
            tokio::time::sleep(self.0).await;
            Ok(CaptchaSolution::new("token-123"))
        }
    }

    fn challenge(site_key: Option<&str>) -> CaptchaChallenge {
        CaptchaChallenge {
            challenge_type: ChallengeType::RecaptchaV2,
            site_key: site_key.map(str::to_string),
            page_url: Url::parse("https://www.google.com/sorry/index").unwrap(),
            context: HashMap::new(),
            indicators: vec!["recaptcha_widget".into()],
        }
    }

    fn config(timeout: Duration) -> CaptchaConfig {
        CaptchaConfig {
            timeout,
            poll_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn disabled_resolver_fails_fast() {
        let resolver = CaptchaResolver::disabled();
        let err = resolver
            .resolve(&challenge(Some("key")), &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionFailed::Unavailable));
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn returns_token_from_service() {
        let resolver = CaptchaResolver::new(
            Arc::new(SlowProvider(Duration::from_millis(1))),
            config(Duration::from_secs(1)),
        );
        let token = resolver
            .resolve(&challenge(Some("key")), &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(token.token, "token-123");
        assert_eq!(token.provider, "slow");
    }

    #[tokio::test]
    async fn enforces_timeout() {
        let resolver = CaptchaResolver::new(
            Arc::new(SlowProvider(Duration::from_secs(30))),
            config(Duration::from_millis(20)),
        );
        let err = resolver
            .resolve(&challenge(Some("key")), &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionFailed::Timeout(_)));
    }

    #[tokio::test]
    async fn honours_cancellation() {
        let resolver = CaptchaResolver::new(
            Arc::new(SlowProvider(Duration::from_secs(30))),
            config(Duration::from_secs(60)),
        );
        let (handle, signal) = CancelSignal::pair();
        handle.cancel();
        let err = resolver.resolve(&challenge(Some("key")), &signal).await.unwrap_err();
        assert!(matches!(err, ResolutionFailed::Cancelled));
    }

    #[tokio::test]
    async fn missing_site_key_is_unsupported() {
        let resolver = CaptchaResolver::new(
            Arc::new(SlowProvider(Duration::from_millis(1))),
            config(Duration::from_secs(1)),
        );
        let err = resolver
            .resolve(&challenge(None), &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionFailed::Unsupported(_)));
    }
}
