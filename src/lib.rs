//! # trendscraper-rs
//!
//! Resilient acquisition of search-interest scores and article text for
//! content pipelines.
//!
//! Every lookup goes through a persistent cache first, then through a
//! fallback chain of providers (SerpAPI, a stealth Google Trends session,
//! and finally an offline heuristic) so callers always get a score back.
//! Article fetches record a `content_fetch` stage marker whether or not
//! they succeed, letting batch stages resume where they stopped.
//!
//! ## Features
//!
//! - Cache with per-entry TTLs and processed-stage markers, persisted with redb
//! - Proxy rotation with blacklisting, request ceilings and health reports
//! - reCAPTCHA, hCaptcha and Turnstile solving through 2Captcha or CapSolver
//! - Fingerprint-randomized browser sessions with resumable cookies
//! - Chromium automation behind the `chromium` feature
//!
//! ## Example
//!
//! ```no_run
//! use trendscraper_rs::TrendScraper;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scraper = TrendScraper::from_env()?;
//!     let score = scraper.get_trend_score("Express Entry", "CA", "now 7-d").await;
//!     println!("{} from {}", score.value, score.source);
//!
//!     let article = scraper.get_article_content("https://example.ca/news").await;
//!     if let Some(document) = article.document() {
//!         println!("{}", document.content);
//!     }
//!     Ok(())
//! }
//! ```

mod trendscraper;

pub mod challenges;
pub mod config;
pub mod external_deps;
pub mod fallback;
pub mod modules;
pub mod providers;

pub use crate::trendscraper::{
    ArticleContent,
    CONTENT_FETCH_STAGE,
    TrendScraper,
    TrendScraperBuilder,
    TrendScraperConfig,
    TrendScraperError,
    TrendScraperResult,
    UnavailableReason,
};

pub use crate::config::{AcquisitionSettings, ConfigError, ProxyPolicy};

pub use crate::challenges::{CaptchaChallenge, CaptchaResolver, CaptchaToken, ChallengeDetector, ChallengeType};

pub use crate::fallback::{
    AllProvidersExhausted,
    CancelHandle,
    CancelSignal,
    ChainPolicy,
    ChainReport,
    ChainState,
    FallbackChain,
};

pub use crate::modules::{CacheStore, EventHandler, ProxyPool, StealthSession};

pub use crate::providers::{
    ArticleDocument,
    ArticleProvider,
    HeuristicEstimator,
    ProviderContext,
    ProviderError,
    RequestGate,
    TrendProvider,
    TrendQuery,
    TrendScore,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
