//! Cross-cutting services module
//!
//! Caching, proxy rotation, fingerprint spoofing, stealth sessions and
//! acquisition events shared by every provider.

pub mod cache;
pub mod events;
pub mod proxy;
pub mod spoofing;
pub mod stealth;

// Re-export commonly used types
pub use cache::{CacheEntry, CacheLookup, CacheStore, PruneReport, UnprocessedKeys};
pub use events::{
    AcquisitionEvent, CacheHitEvent, ChallengeEvent, EventDispatcher, EventHandler, LoggingHandler,
    ProviderAttemptEvent, ProviderDisabledEvent, ProviderStats, ProviderStatsHandler, TransitionEvent,
};
pub use proxy::{ProxyCheck, ProxyConfig, ProxyEntry, ProxyHealthReport, ProxyPool};
pub use spoofing::{BrowserFingerprint, FingerprintGenerator};
pub use stealth::{BrowserDriver, Session, StealthConfig, StealthError, StealthSession};
