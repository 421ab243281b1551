//! Event system for the acquisition layer.
//!
//! Provides hooks for logging and diagnostics around cache lookups, provider
//! attempts, challenge handling, and fallback transitions.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::challenges::ChallengeType;
use crate::fallback::{AttemptOutcome, ChainState};

#[derive(Debug, Clone)]
pub struct CacheHitEvent {
    pub key: String,
    pub fresh: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProviderAttemptEvent {
    pub provider: &'static str,
    pub state: ChainState,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub latency: Duration,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChallengeEvent {
    pub provider: &'static str,
    pub challenge_type: ChallengeType,
    pub page: String,
    pub resolved: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TransitionEvent {
    pub from: ChainState,
    pub to: ChainState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProviderDisabledEvent {
    pub provider: &'static str,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum AcquisitionEvent {
    CacheHit(CacheHitEvent),
    ProviderAttempt(ProviderAttemptEvent),
    ChallengeDetected(ChallengeEvent),
    ChallengeResolved(ChallengeEvent),
    StateTransition(TransitionEvent),
    ProviderDisabled(ProviderDisabledEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &AcquisitionEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Dispatcher with a [`LoggingHandler`] already registered.
    pub fn with_logging() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: AcquisitionEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &AcquisitionEvent) {
        match event {
            AcquisitionEvent::CacheHit(hit) => {
                log::debug!("cache hit {} (fresh={})", hit.key, hit.fresh);
            }
            AcquisitionEvent::ProviderAttempt(attempt) => match &attempt.error {
                Some(error) => log::warn!(
                    "{} attempt {} in {:?}: {:?} after {:.2}s: {}",
                    attempt.provider,
                    attempt.attempt,
                    attempt.state,
                    attempt.outcome,
                    attempt.latency.as_secs_f64(),
                    error
                ),
                None => log::info!(
                    "{} attempt {} in {:?}: {:?} after {:.2}s",
                    attempt.provider,
                    attempt.attempt,
                    attempt.state,
                    attempt.outcome,
                    attempt.latency.as_secs_f64()
                ),
            },
            AcquisitionEvent::ChallengeDetected(challenge) => {
                log::warn!(
                    "{} hit {:?} challenge at {}",
                    challenge.provider,
                    challenge.challenge_type,
                    challenge.page
                );
            }
            AcquisitionEvent::ChallengeResolved(challenge) => {
                log::info!(
                    "{} challenge {:?} resolved={}",
                    challenge.provider,
                    challenge.challenge_type,
                    challenge.resolved.unwrap_or(false)
                );
            }
            AcquisitionEvent::StateTransition(transition) => {
                log::debug!("fallback {:?} -> {:?}", transition.from, transition.to);
            }
            AcquisitionEvent::ProviderDisabled(disabled) => {
                log::error!("provider {} disabled: {}", disabled.provider, disabled.reason);
            }
        }
    }
}

/// Per-provider outcome counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderStats {
    pub successes: u64,
    pub soft_failures: u64,
    pub hard_failures: u64,
    pub challenges: u64,
    pub total_latency: Duration,
}

impl ProviderStats {
    pub fn attempts(&self) -> u64 {
        self.successes + self.soft_failures + self.hard_failures
    }

    pub fn average_latency(&self) -> Option<Duration> {
        match self.attempts() {
            0 => None,
            n => Some(self.total_latency / n as u32),
        }
    }
}

/// Aggregates attempt outcomes per provider for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct ProviderStatsHandler {
    stats: Arc<Mutex<HashMap<&'static str, ProviderStats>>>,
}

impl ProviderStatsHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<&'static str, ProviderStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn stats_for(&self, provider: &str) -> Option<ProviderStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
            .cloned()
    }
}

impl EventHandler for ProviderStatsHandler {
    fn handle(&self, event: &AcquisitionEvent) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        match event {
            AcquisitionEvent::ProviderAttempt(attempt) => {
                let entry = stats.entry(attempt.provider).or_default();
                entry.total_latency += attempt.latency;
                match attempt.outcome {
                    AttemptOutcome::Success => entry.successes += 1,
                    AttemptOutcome::SoftFail => entry.soft_failures += 1,
                    AttemptOutcome::HardFail => entry.hard_failures += 1,
                }
            }
            AcquisitionEvent::ChallengeDetected(challenge) => {
                stats.entry(challenge.provider).or_default().challenges += 1;
            }
            _ => {}
        }
    }
}
