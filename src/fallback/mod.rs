//! Priority-ordered fallback across providers.
//!
//! Each request walks `TryPrimary -> TrySecondary -> TryHeuristic -> Done`.
//! Within a state, soft failures are retried with a doubling backoff up to
//! the policy bound; a hard failure moves to the next state. A detected
//! challenge goes to the captcha resolver once per state, and a solved token
//! is handed to the provider's next attempt. Configuration failures disable
//! the provider for the lifetime of the chain.

pub mod cancel;

pub use cancel::{CancelHandle, CancelSignal};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use url::Url;

use crate::challenges::{CaptchaResolver, CaptchaToken};
use crate::config::{ProviderSettings, ProxyPolicy};
use crate::modules::events::{
    AcquisitionEvent, ChallengeEvent, EventDispatcher, ProviderAttemptEvent, ProviderDisabledEvent,
    TransitionEvent,
};
use crate::modules::proxy::ProxyPool;
use crate::providers::{
    ArticleDocument, ArticleProvider, FailureClass, HeuristicEstimator, ProviderContext, ProviderError,
    TrendProvider, TrendQuery, TrendScore, heuristic,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainState {
    TryPrimary,
    TrySecondary,
    TryHeuristic,
    Done,
}

impl ChainState {
    /// State entered after the current one gives up. Chains without a
    /// heuristic step finish after the secondary provider.
    pub fn next_on_failure(self, has_heuristic: bool) -> Self {
        match self {
            ChainState::TryPrimary => ChainState::TrySecondary,
            ChainState::TrySecondary if has_heuristic => ChainState::TryHeuristic,
            ChainState::TrySecondary | ChainState::TryHeuristic | ChainState::Done => ChainState::Done,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    SoftFail,
    HardFail,
}

/// Diagnostic record of one provider invocation.
#[derive(Debug, Clone)]
pub struct ProviderAttempt {
    pub provider_name: &'static str,
    pub state: ChainState,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub latency: Duration,
    pub error_detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainPolicy {
    /// Retries after the first soft failure within one state.
    pub max_soft_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff: Duration,
}

impl Default for ChainPolicy {
    fn default() -> Self {
        Self {
            max_soft_retries: 2,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl From<&ProviderSettings> for ChainPolicy {
    fn from(settings: &ProviderSettings) -> Self {
        Self {
            max_soft_retries: settings.max_soft_retries,
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
        }
    }
}

impl ChainPolicy {
    fn backoff(&self, retry: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }
}

/// What happened while satisfying one request.
#[derive(Debug, Clone)]
pub struct ChainReport {
    pub attempts: Vec<ProviderAttempt>,
    pub transitions: Vec<(ChainState, ChainState)>,
    pub final_state: ChainState,
}

impl Default for ChainReport {
    fn default() -> Self {
        Self {
            attempts: Vec::new(),
            transitions: Vec::new(),
            final_state: ChainState::TryPrimary,
        }
    }
}

impl ChainReport {
    pub fn attempts_for(&self, provider: &str) -> usize {
        self.attempts
            .iter()
            .filter(|attempt| attempt.provider_name == provider)
            .count()
    }

    pub fn invoked(&self, provider: &str) -> bool {
        self.attempts_for(provider) > 0
    }

    pub fn used_heuristic(&self) -> bool {
        self.invoked(heuristic::NAME)
    }
}

#[derive(Debug, Error)]
#[error("all providers exhausted after {} attempts", .report.attempts.len())]
pub struct AllProvidersExhausted {
    pub report: ChainReport,
}

struct Slot<P: ?Sized> {
    provider: Arc<P>,
    timeout: Duration,
}

/// One provider call with its request bound in, so trend and article slots
/// share the retry loop.
#[async_trait]
trait Invoke<T>: Send + Sync {
    fn name(&self) -> &'static str;
    async fn invoke(&self, ctx: &ProviderContext<'_>) -> Result<T, ProviderError>;
}

struct TrendCall<'a> {
    provider: &'a dyn TrendProvider,
    query: &'a TrendQuery,
}

#[async_trait]
impl Invoke<f64> for TrendCall<'_> {
    fn name(&self) -> &'static str {
        self.provider.name()
    }

    async fn invoke(&self, ctx: &ProviderContext<'_>) -> Result<f64, ProviderError> {
        self.provider.fetch_score(self.query, ctx).await
    }
}

struct ArticleCall<'a> {
    provider: &'a dyn ArticleProvider,
    url: &'a Url,
}

#[async_trait]
impl Invoke<ArticleDocument> for ArticleCall<'_> {
    fn name(&self) -> &'static str {
        self.provider.name()
    }

    async fn invoke(&self, ctx: &ProviderContext<'_>) -> Result<ArticleDocument, ProviderError> {
        self.provider.fetch_article(self.url, ctx).await
    }
}

pub struct FallbackChain {
    trend_primary: Option<Slot<dyn TrendProvider>>,
    trend_secondary: Option<Slot<dyn TrendProvider>>,
    article_primary: Option<Slot<dyn ArticleProvider>>,
    article_secondary: Option<Slot<dyn ArticleProvider>>,
    heuristic: HeuristicEstimator,
    proxies: Option<ProxyPool>,
    proxy_policy: ProxyPolicy,
    policy: ChainPolicy,
    resolver: Arc<CaptchaResolver>,
    events: EventDispatcher,
    disabled: Mutex<HashSet<&'static str>>,
}

impl std::fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = |slot: &Option<Slot<dyn TrendProvider>>| slot.as_ref().map(|slot| slot.provider.name());
        let article = |slot: &Option<Slot<dyn ArticleProvider>>| slot.as_ref().map(|slot| slot.provider.name());
        f.debug_struct("FallbackChain")
            .field("trend_primary", &name(&self.trend_primary))
            .field("trend_secondary", &name(&self.trend_secondary))
            .field("article_primary", &article(&self.article_primary))
            .field("article_secondary", &article(&self.article_secondary))
            .field("policy", &self.policy)
            .field("resolver", &self.resolver)
            .finish()
    }
}

impl Default for FallbackChain {
    fn default() -> Self {
        Self::new(HeuristicEstimator::default())
    }
}

impl FallbackChain {
    /// Chain with no live providers: every trend request resolves to the
    /// heuristic estimate.
    pub fn new(heuristic: HeuristicEstimator) -> Self {
        Self {
            trend_primary: None,
            trend_secondary: None,
            article_primary: None,
            article_secondary: None,
            heuristic,
            proxies: None,
            proxy_policy: ProxyPolicy::Preferred,
            policy: ChainPolicy::default(),
            resolver: Arc::new(CaptchaResolver::disabled()),
            events: EventDispatcher::with_logging(),
            disabled: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_trend_primary(mut self, provider: Arc<dyn TrendProvider>, timeout: Duration) -> Self {
        self.trend_primary = Some(Slot { provider, timeout });
        self
    }

    pub fn with_trend_secondary(mut self, provider: Arc<dyn TrendProvider>, timeout: Duration) -> Self {
        self.trend_secondary = Some(Slot { provider, timeout });
        self
    }

    pub fn with_article_primary(mut self, provider: Arc<dyn ArticleProvider>, timeout: Duration) -> Self {
        self.article_primary = Some(Slot { provider, timeout });
        self
    }

    pub fn with_article_secondary(mut self, provider: Arc<dyn ArticleProvider>, timeout: Duration) -> Self {
        self.article_secondary = Some(Slot { provider, timeout });
        self
    }

    pub fn with_proxies(mut self, proxies: ProxyPool, policy: ProxyPolicy) -> Self {
        self.proxies = Some(proxies);
        self.proxy_policy = policy;
        self
    }

    pub fn with_policy(mut self, policy: ChainPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<CaptchaResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    pub fn heuristic(&self) -> &HeuristicEstimator {
        &self.heuristic
    }

    pub fn is_disabled(&self, provider: &str) -> bool {
        self.disabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(provider)
    }

    /// Trend score for `query`. Never fails: the heuristic estimate is the
    /// last resort.
    pub async fn run_trend(&self, query: &TrendQuery, cancel: &CancelSignal) -> (TrendScore, ChainReport) {
        let mut report = ChainReport::default();
        let mut state = ChainState::TryPrimary;

        loop {
            let slot = match state {
                ChainState::TryPrimary => self.trend_primary.as_ref(),
                ChainState::TrySecondary => self.trend_secondary.as_ref(),
                ChainState::TryHeuristic | ChainState::Done => break,
            };
            if let Some(slot) = slot {
                let call = TrendCall {
                    provider: slot.provider.as_ref(),
                    query,
                };
                if let Some(raw) = self.run_slot(state, &call, slot.timeout, cancel, &mut report).await {
                    self.finish(state, &mut report);
                    return (TrendScore::live(raw, call.name()), report);
                }
            }
            state = self.advance(state, true, &mut report);
        }

        let started = Instant::now();
        let estimate = self.heuristic.estimate(&query.keyword);
        self.record(
            &mut report,
            ProviderAttempt {
                provider_name: heuristic::NAME,
                state,
                attempt: 1,
                outcome: AttemptOutcome::Success,
                latency: started.elapsed(),
                error_detail: None,
            },
        );
        log::info!("using heuristic estimate {} for '{}'", estimate, query.keyword);
        self.finish(state, &mut report);
        (TrendScore::estimate(estimate), report)
    }

    /// Article content for `url`, or [`AllProvidersExhausted`] once both
    /// article providers have given up.
    pub async fn run_article(
        &self,
        url: &Url,
        cancel: &CancelSignal,
    ) -> Result<(ArticleDocument, ChainReport), AllProvidersExhausted> {
        let mut report = ChainReport::default();
        let mut state = ChainState::TryPrimary;

        loop {
            let slot = match state {
                ChainState::TryPrimary => self.article_primary.as_ref(),
                ChainState::TrySecondary => self.article_secondary.as_ref(),
                ChainState::TryHeuristic | ChainState::Done => break,
            };
            if let Some(slot) = slot {
                let call = ArticleCall {
                    provider: slot.provider.as_ref(),
                    url,
                };
                if let Some(document) = self.run_slot(state, &call, slot.timeout, cancel, &mut report).await {
                    self.finish(state, &mut report);
                    return Ok((document, report));
                }
            }
            state = self.advance(state, false, &mut report);
        }

        report.final_state = ChainState::Done;
        log::warn!("no article provider could fetch {}", url);
        Err(AllProvidersExhausted { report })
    }

    fn advance(&self, from: ChainState, has_heuristic: bool, report: &mut ChainReport) -> ChainState {
        let to = from.next_on_failure(has_heuristic);
        report.transitions.push((from, to));
        report.final_state = to;
        self.events.dispatch(AcquisitionEvent::StateTransition(TransitionEvent {
            from,
            to,
            timestamp: Utc::now(),
        }));
        to
    }

    fn finish(&self, from: ChainState, report: &mut ChainReport) {
        report.transitions.push((from, ChainState::Done));
        report.final_state = ChainState::Done;
        self.events.dispatch(AcquisitionEvent::StateTransition(TransitionEvent {
            from,
            to: ChainState::Done,
            timestamp: Utc::now(),
        }));
    }

    fn record(&self, report: &mut ChainReport, attempt: ProviderAttempt) {
        self.events.dispatch(AcquisitionEvent::ProviderAttempt(ProviderAttemptEvent {
            provider: attempt.provider_name,
            state: attempt.state,
            attempt: attempt.attempt,
            outcome: attempt.outcome,
            latency: attempt.latency,
            error: attempt.error_detail.clone(),
            timestamp: Utc::now(),
        }));
        report.attempts.push(attempt);
    }

    fn disable(&self, provider: &'static str, err: &ProviderError) {
        let newly = self
            .disabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider);
        if newly {
            self.events.dispatch(AcquisitionEvent::ProviderDisabled(ProviderDisabledEvent {
                provider,
                reason: err.to_string(),
                timestamp: Utc::now(),
            }));
        }
    }

    /// Run one provider within `state` until it succeeds or gives up.
    async fn run_slot<T>(
        &self,
        state: ChainState,
        call: &dyn Invoke<T>,
        timeout: Duration,
        cancel: &CancelSignal,
        report: &mut ChainReport,
    ) -> Option<T>
    where
        T: Send,
    {
        let name = call.name();
        if self.is_disabled(name) {
            log::debug!("skipping disabled provider {}", name);
            return None;
        }

        let mut token: Option<CaptchaToken> = None;
        let mut challenge_routed = false;
        let mut soft_failures = 0u32;
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                log::debug!("request cancelled before {} attempt", name);
                return None;
            }
            attempt += 1;

            let solved = token.take();
            let ctx = ProviderContext {
                proxies: self.proxies.as_ref(),
                policy: self.proxy_policy,
                cancel,
                captcha_token: solved.as_ref(),
                attempt,
                timeout,
            };

            let started = Instant::now();
            let result = tokio::select! {
                outcome = tokio::time::timeout(timeout, call.invoke(&ctx)) => {
                    outcome.unwrap_or(Err(ProviderError::Timeout(timeout)))
                }
                _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            };
            let latency = started.elapsed();

            let err = match result {
                Ok(value) => {
                    self.record(
                        report,
                        ProviderAttempt {
                            provider_name: name,
                            state,
                            attempt,
                            outcome: AttemptOutcome::Success,
                            latency,
                            error_detail: None,
                        },
                    );
                    return Some(value);
                }
                Err(err) => err,
            };

            let class = err.class();
            self.record(
                report,
                ProviderAttempt {
                    provider_name: name,
                    state,
                    attempt,
                    outcome: match class {
                        FailureClass::Soft => AttemptOutcome::SoftFail,
                        FailureClass::Hard | FailureClass::Fatal => AttemptOutcome::HardFail,
                    },
                    latency,
                    error_detail: Some(err.to_string()),
                },
            );

            match (err, class) {
                (ProviderError::ChallengeDetected(challenge), _) => {
                    self.events.dispatch(AcquisitionEvent::ChallengeDetected(ChallengeEvent {
                        provider: name,
                        challenge_type: challenge.challenge_type,
                        page: challenge.page_url.to_string(),
                        resolved: None,
                        timestamp: Utc::now(),
                    }));
                    if challenge_routed {
                        log::warn!("{} challenged again after a solved token; giving up", name);
                        return None;
                    }
                    challenge_routed = true;

                    let resolution = self.resolver.resolve(&challenge, cancel).await;
                    self.events.dispatch(AcquisitionEvent::ChallengeResolved(ChallengeEvent {
                        provider: name,
                        challenge_type: challenge.challenge_type,
                        page: challenge.page_url.to_string(),
                        resolved: Some(resolution.is_ok()),
                        timestamp: Utc::now(),
                    }));
                    match resolution {
                        Ok(solved) => token = Some(solved),
                        Err(failure) => {
                            log::warn!("{} challenge unresolved: {}", name, failure);
                            return None;
                        }
                    }
                }
                (err, FailureClass::Fatal) => {
                    self.disable(name, &err);
                    return None;
                }
                (_, FailureClass::Soft) => {
                    soft_failures += 1;
                    if soft_failures > self.policy.max_soft_retries {
                        log::info!("{} exhausted {} soft retries", name, self.policy.max_soft_retries);
                        return None;
                    }
                    let backoff = self.policy.backoff(soft_failures);
                    if !backoff.is_zero() && !cancel.sleep(backoff).await {
                        return None;
                    }
                }
                (_, FailureClass::Hard) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenges::{CaptchaChallenge, ChallengeType};
    use crate::config::TrendDefaults;
    use crate::external_deps::captcha::{CaptchaConfig, CaptchaProvider, CaptchaResult, CaptchaSolution, CaptchaTask};
    use crate::modules::events::ProviderStatsHandler;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Script = Box<dyn Fn(usize, Option<&CaptchaToken>) -> Result<f64, ProviderError> + Send + Sync>;

    struct ScriptedTrend {
        name: &'static str,
        calls: AtomicUsize,
        delay: Duration,
        script: Script,
    }

    impl ScriptedTrend {
        fn new(
            name: &'static str,
            script: impl Fn(usize, Option<&CaptchaToken>) -> Result<f64, ProviderError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                script: Box::new(script),
            })
        }

        fn slow(name: &'static str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                delay,
                script: Box::new(|_, _| Ok(99.0)),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TrendProvider for ScriptedTrend {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch_score(&self, _query: &TrendQuery, ctx: &ProviderContext<'_>) -> Result<f64, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.script)(call, ctx.captcha_token)
        }
    }

    struct HangingSolver;

    #[async_trait]
    impl CaptchaProvider for HangingSolver {
        fn name(&self) -> &'static str {
            "hanging"
        }

        async fn solve(&self, _task: &CaptchaTask) -> CaptchaResult {
            std::future::pending::<()>().await;
            Ok(CaptchaSolution::new("never"))
        }
    }

    struct InstantSolver;

    #[async_trait]
    impl CaptchaProvider for InstantSolver {
        fn name(&self) -> &'static str {
            "instant"
        }

        async fn solve(&self, _task: &CaptchaTask) -> CaptchaResult {
            Ok(CaptchaSolution::new("solved-token"))
        }
    }

    fn resolver(provider: Arc<dyn CaptchaProvider>, timeout: Duration) -> Arc<CaptchaResolver> {
        Arc::new(CaptchaResolver::new(
            provider,
            CaptchaConfig {
                timeout,
                poll_interval: Duration::from_millis(5),
            },
        ))
    }

    fn challenge() -> ProviderError {
        ProviderError::ChallengeDetected(Box::new(CaptchaChallenge {
            challenge_type: ChallengeType::RecaptchaV2,
            site_key: Some("site-key".into()),
            page_url: Url::parse("https://www.google.com/sorry/index").unwrap(),
            context: HashMap::new(),
            indicators: vec!["recaptcha_widget".into()],
        }))
    }

    fn query(keyword: &str) -> TrendQuery {
        TrendQuery::new(keyword, "CA", "now 7-d", &TrendDefaults::default())
    }

    fn fast_policy() -> ChainPolicy {
        ChainPolicy {
            max_soft_retries: 2,
            retry_backoff: Duration::ZERO,
        }
    }

    fn chain(primary: Arc<ScriptedTrend>, secondary: Arc<ScriptedTrend>) -> FallbackChain {
        FallbackChain::default()
            .with_trend_primary(primary, Duration::from_secs(5))
            .with_trend_secondary(secondary, Duration::from_secs(5))
            .with_policy(fast_policy())
    }

    #[test]
    fn transitions_are_fixed() {
        assert_eq!(ChainState::TryPrimary.next_on_failure(true), ChainState::TrySecondary);
        assert_eq!(ChainState::TrySecondary.next_on_failure(true), ChainState::TryHeuristic);
        assert_eq!(ChainState::TrySecondary.next_on_failure(false), ChainState::Done);
        assert_eq!(ChainState::TryHeuristic.next_on_failure(true), ChainState::Done);
        assert_eq!(ChainState::Done.next_on_failure(true), ChainState::Done);
    }

    #[test]
    fn backoff_doubles() {
        let policy = ChainPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn primary_hard_failure_falls_to_secondary() {
        let primary = ScriptedTrend::new("primary", |_, _| Err(ProviderError::InvalidResponse("bad".into())));
        let secondary = ScriptedTrend::new("secondary", |_, _| Ok(64.4));
        let chain = chain(primary.clone(), secondary.clone());

        let (score, report) = chain.run_trend(&query("Work permit"), &CancelSignal::never()).await;
        assert_eq!(score.value, 64);
        assert_eq!(score.source, "secondary");
        assert!(!score.estimated);
        assert_eq!(primary.calls(), 1);
        assert!(!report.used_heuristic());
        assert_eq!(report.final_state, ChainState::Done);
        assert_eq!(
            report.transitions,
            vec![
                (ChainState::TryPrimary, ChainState::TrySecondary),
                (ChainState::TrySecondary, ChainState::Done)
            ]
        );
    }

    #[tokio::test]
    async fn all_failures_yield_deterministic_estimate() {
        let estimates: Vec<u8> = {
            let mut values = Vec::new();
            for _ in 0..2 {
                let primary = ScriptedTrend::new("primary", |_, _| Err(ProviderError::NoProxyAvailable));
                let secondary = ScriptedTrend::new("secondary", |_, _| Err(ProviderError::InvalidResponse("x".into())));
                let (score, report) = chain(primary, secondary)
                    .run_trend(&query("Express Entry"), &CancelSignal::never())
                    .await;
                assert!(score.estimated);
                assert!(report.used_heuristic());
                values.push(score.value);
            }
            values
        };
        assert_eq!(estimates, vec![85, 85]);
    }

    #[tokio::test]
    async fn soft_failures_retry_within_state() {
        let primary = ScriptedTrend::new("primary", |call, _| {
            if call < 3 {
                Err(ProviderError::Transient("reset".into()))
            } else {
                Ok(70.0)
            }
        });
        let secondary = ScriptedTrend::new("secondary", |_, _| Ok(10.0));
        let (score, report) = chain(primary.clone(), secondary.clone())
            .run_trend(&query("PNP"), &CancelSignal::never())
            .await;
        assert_eq!(score.value, 70);
        assert_eq!(primary.calls(), 3);
        assert_eq!(secondary.calls(), 0);
        assert_eq!(report.attempts_for("primary"), 3);
    }

    #[tokio::test]
    async fn soft_retry_bound_is_enforced() {
        let primary = ScriptedTrend::new("primary", |_, _| Err(ProviderError::Transient("429".into())));
        let secondary = ScriptedTrend::new("secondary", |_, _| Ok(55.0));
        let (score, _) = chain(primary.clone(), secondary)
            .run_trend(&query("PNP"), &CancelSignal::never())
            .await;
        assert_eq!(score.value, 55);
        assert_eq!(primary.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out_as_soft_failure() {
        let primary = ScriptedTrend::slow("primary", Duration::from_secs(60));
        let secondary = ScriptedTrend::new("secondary", |_, _| Ok(42.0));
        let chain = FallbackChain::default()
            .with_trend_primary(primary.clone(), Duration::from_secs(1))
            .with_trend_secondary(secondary, Duration::from_secs(5))
            .with_policy(ChainPolicy {
                max_soft_retries: 1,
                retry_backoff: Duration::from_millis(100),
            });

        let (score, report) = chain.run_trend(&query("CRS cutoff"), &CancelSignal::never()).await;
        assert_eq!(score.value, 42);
        assert_eq!(primary.calls(), 2);
        assert!(
            report
                .attempts
                .iter()
                .filter(|attempt| attempt.provider_name == "primary")
                .all(|attempt| attempt.outcome == AttemptOutcome::SoftFail)
        );
    }

    #[tokio::test]
    async fn unresolved_challenge_is_hard_failure() {
        let primary = ScriptedTrend::new("primary", |_, _| Err(challenge()));
        let secondary = ScriptedTrend::new("secondary", |_, _| Ok(61.0));
        let chain = chain(primary.clone(), secondary.clone())
            .with_resolver(resolver(Arc::new(HangingSolver), Duration::from_millis(20)));

        let (score, report) = chain.run_trend(&query("Super visa"), &CancelSignal::never()).await;
        assert_eq!(score.value, 61);
        assert_eq!(primary.calls(), 1);
        assert_eq!(report.attempts[0].outcome, AttemptOutcome::HardFail);
        assert!(!chain.is_disabled("primary"));
    }

    #[tokio::test]
    async fn solved_challenge_reinvokes_with_token() {
        let primary = ScriptedTrend::new("primary", |_, token| match token {
            Some(token) if token.token == "solved-token" => Ok(77.0),
            _ => Err(challenge()),
        });
        let secondary = ScriptedTrend::new("secondary", |_, _| Ok(1.0));
        let chain = chain(primary.clone(), secondary.clone())
            .with_resolver(resolver(Arc::new(InstantSolver), Duration::from_secs(1)));

        let (score, _) = chain.run_trend(&query("Study permit"), &CancelSignal::never()).await;
        assert_eq!(score.value, 77);
        assert_eq!(primary.calls(), 2);
        assert_eq!(secondary.calls(), 0);
    }

    #[tokio::test]
    async fn repeated_challenge_gives_up() {
        let primary = ScriptedTrend::new("primary", |_, _| Err(challenge()));
        let secondary = ScriptedTrend::new("secondary", |_, _| Ok(33.0));
        let chain = chain(primary.clone(), secondary)
            .with_resolver(resolver(Arc::new(InstantSolver), Duration::from_secs(1)));

        let (score, _) = chain.run_trend(&query("Visitor visa"), &CancelSignal::never()).await;
        assert_eq!(score.value, 33);
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test]
    async fn configuration_failure_disables_provider() {
        let primary = ScriptedTrend::new("primary", |_, _| Err(ProviderError::Configuration("no key".into())));
        let secondary = ScriptedTrend::new("secondary", |_, _| Ok(50.0));
        let stats = ProviderStatsHandler::new();
        let mut events = EventDispatcher::new();
        events.register_handler(Arc::new(stats.clone()));
        let chain = chain(primary.clone(), secondary.clone()).with_events(events);

        chain.run_trend(&query("PGWP"), &CancelSignal::never()).await;
        chain.run_trend(&query("PGWP"), &CancelSignal::never()).await;
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 2);
        assert!(chain.is_disabled("primary"));
        assert_eq!(stats.stats_for("primary").unwrap().hard_failures, 1);
        assert_eq!(stats.stats_for("secondary").unwrap().successes, 2);
    }

    #[tokio::test]
    async fn cancellation_advances_to_heuristic() {
        let primary = ScriptedTrend::slow("primary", Duration::from_secs(30));
        let secondary = ScriptedTrend::new("secondary", |_, _| Ok(12.0));
        let chain = chain(primary.clone(), secondary.clone());
        let (handle, signal) = CancelSignal::pair();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });
        let (score, report) = chain.run_trend(&query("Family sponsorship"), &signal).await;
        canceller.await.unwrap();

        assert!(score.estimated);
        assert_eq!(score.value, 58);
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 0);
        assert!(report.used_heuristic());
    }

    struct ScriptedArticle {
        name: &'static str,
        calls: AtomicUsize,
        content: Option<&'static str>,
    }

    #[async_trait]
    impl ArticleProvider for ScriptedArticle {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch_article(&self, url: &Url, _ctx: &ProviderContext<'_>) -> Result<ArticleDocument, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.content {
                Some(content) => Ok(ArticleDocument {
                    url: url.to_string(),
                    title: None,
                    content: content.to_string(),
                    source: self.name.to_string(),
                    fetched_at: Utc::now(),
                }),
                None => Err(ProviderError::InvalidResponse("empty page".into())),
            }
        }
    }

    fn article(name: &'static str, content: Option<&'static str>) -> Arc<ScriptedArticle> {
        Arc::new(ScriptedArticle {
            name,
            calls: AtomicUsize::new(0),
            content,
        })
    }

    #[tokio::test]
    async fn article_chain_has_no_heuristic() {
        let url = Url::parse("https://example.ca/news").unwrap();
        let chain = FallbackChain::default()
            .with_article_primary(article("browser", None), Duration::from_secs(5))
            .with_article_secondary(article("http", Some("body")), Duration::from_secs(5));
        let (doc, report) = chain.run_article(&url, &CancelSignal::never()).await.unwrap();
        assert_eq!(doc.source, "http");
        assert_eq!(report.attempts.len(), 2);

        let failing = FallbackChain::default()
            .with_article_primary(article("browser", None), Duration::from_secs(5))
            .with_article_secondary(article("http", None), Duration::from_secs(5));
        let exhausted = failing.run_article(&url, &CancelSignal::never()).await.unwrap_err();
        assert_eq!(exhausted.report.final_state, ChainState::Done);
        assert!(!exhausted.report.used_heuristic());
        assert_eq!(
            exhausted.report.transitions.last(),
            Some(&(ChainState::TrySecondary, ChainState::Done))
        );
    }
}
