//! Acquisition facade.
//!
//! Composes the cache, the proxy pool, the captcha resolver, stealth sessions
//! and the fallback chain behind the calls downstream stages use: trend
//! scores, article content, and processed-stage bookkeeping. Acquisition
//! calls never fail; they return a value or a typed unavailable result.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use url::Url;

use crate::challenges::CaptchaResolver;
use crate::config::{AcquisitionSettings, ConfigError};
use crate::external_deps::captcha::{CaptchaConfig, CaptchaProvider};
use crate::fallback::{CancelSignal, ChainPolicy, FallbackChain};
use crate::modules::cache::{CacheError, CacheLookup, CacheStore, PruneReport, UnprocessedKeys, keys};
use crate::modules::events::{
	AcquisitionEvent, CacheHitEvent, EventDispatcher, EventHandler, ProviderStats, ProviderStatsHandler,
};
use crate::modules::proxy::{ProxyError, ProxyHealthReport, ProxyPool};
use crate::modules::stealth::{BrowserDriver, StealthConfig, StealthError, StealthSession};
use crate::providers::{
	ArticleDocument, ArticleProvider, BrowserArticleProvider, GoogleTrendsProvider, HeuristicEstimator,
	HttpArticleProvider, HttpClientPool, RequestGate, SerpApiProvider, TrendProvider, TrendQuery, TrendScore,
};

/// Stage recorded for every URL an article fetch was attempted for.
pub const CONTENT_FETCH_STAGE: &str = "content_fetch";

/// Result alias used by facade construction.
pub type TrendScraperResult<T> = Result<T, TrendScraperError>;

/// Errors raised while assembling a [`TrendScraper`].
#[derive(Debug, Error)]
pub enum TrendScraperError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("proxy pool initialisation failed: {0}")]
	Proxy(#[from] ProxyError),
	#[error("cache initialisation failed: {0}")]
	Cache(#[from] CacheError),
	#[error("stealth session initialisation failed: {0}")]
	Stealth(#[from] StealthError),
}

/// Why no article content was returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
	InvalidUrl,
	/// An earlier fetch of this URL produced nothing; it is not retried.
	PreviouslyAttempted,
	AllProvidersExhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArticleContent {
	Available(ArticleDocument),
	Unavailable { url: String, reason: UnavailableReason },
}

impl ArticleContent {
	pub fn document(&self) -> Option<&ArticleDocument> {
		match self {
			ArticleContent::Available(document) => Some(document),
			ArticleContent::Unavailable { .. } => None,
		}
	}

	pub fn is_available(&self) -> bool {
		matches!(self, ArticleContent::Available(_))
	}

	fn unavailable(url: impl Into<String>, reason: UnavailableReason) -> Self {
		ArticleContent::Unavailable {
			url: url.into(),
			reason,
		}
	}
}

/// Facade configuration used by the builder.
#[derive(Clone, Default)]
pub struct TrendScraperConfig {
	pub settings: AcquisitionSettings,
	pub trend_primary: Option<Arc<dyn TrendProvider>>,
	pub trend_secondary: Option<Arc<dyn TrendProvider>>,
	pub article_primary: Option<Arc<dyn ArticleProvider>>,
	pub article_secondary: Option<Arc<dyn ArticleProvider>>,
	pub browser_driver: Option<Arc<dyn BrowserDriver>>,
	pub captcha_provider: Option<Arc<dyn CaptchaProvider>>,
	pub cache: Option<CacheStore>,
	pub proxies: Option<ProxyPool>,
	pub event_handlers: Vec<Arc<dyn EventHandler>>,
}

/// Fluent builder for [`TrendScraper`].
pub struct TrendScraperBuilder {
	config: TrendScraperConfig,
}

impl TrendScraperBuilder {
	pub fn new() -> Self {
		Self {
			config: TrendScraperConfig::default(),
		}
	}

	pub fn with_settings(mut self, settings: AcquisitionSettings) -> Self {
		self.config.settings = settings;
		self
	}

	/// Replace the priority-one trend provider (SerpAPI by default).
	pub fn with_trend_primary(mut self, provider: Arc<dyn TrendProvider>) -> Self {
		self.config.trend_primary = Some(provider);
		self
	}

	/// Replace the priority-two trend provider (Google Trends by default).
	pub fn with_trend_secondary(mut self, provider: Arc<dyn TrendProvider>) -> Self {
		self.config.trend_secondary = Some(provider);
		self
	}

	pub fn with_article_primary(mut self, provider: Arc<dyn ArticleProvider>) -> Self {
		self.config.article_primary = Some(provider);
		self
	}

	pub fn with_article_secondary(mut self, provider: Arc<dyn ArticleProvider>) -> Self {
		self.config.article_secondary = Some(provider);
		self
	}

	pub fn with_browser_driver(mut self, driver: Arc<dyn BrowserDriver>) -> Self {
		self.config.browser_driver = Some(driver);
		self
	}

	pub fn with_captcha_provider(mut self, provider: Arc<dyn CaptchaProvider>) -> Self {
		self.config.captcha_provider = Some(provider);
		self
	}

	/// Share an existing cache store (and its stage markers).
	pub fn with_cache_store(mut self, cache: CacheStore) -> Self {
		self.config.cache = Some(cache);
		self
	}

	/// Share an existing proxy pool.
	pub fn with_proxy_pool(mut self, proxies: ProxyPool) -> Self {
		self.config.proxies = Some(proxies);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.config.event_handlers.push(handler);
		self
	}

	pub fn build(self) -> TrendScraperResult<TrendScraper> {
		TrendScraper::with_config(self.config)
	}
}

impl Default for TrendScraperBuilder {
	fn default() -> Self {
		Self::new()
	}
}

struct TrendScraperInner {
	settings: AcquisitionSettings,
	chain: FallbackChain,
	cache: CacheStore,
	cache_enabled: bool,
	proxies: Option<ProxyPool>,
	events: EventDispatcher,
	stats: ProviderStatsHandler,
}

/// Entry point for downstream stages. Cloning yields another handle to the
/// same caches, pools and providers.
#[derive(Clone)]
pub struct TrendScraper {
	inner: Arc<TrendScraperInner>,
}

impl std::fmt::Debug for TrendScraper {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TrendScraper")
			.field("chain", &self.inner.chain)
			.field("cache", &self.inner.cache)
			.field("cache_enabled", &self.inner.cache_enabled)
			.finish()
	}
}

fn default_driver() -> Arc<dyn BrowserDriver> {
	#[cfg(feature = "chromium")]
	{
		Arc::new(crate::modules::stealth::ChromiumBrowser::new())
	}
	#[cfg(not(feature = "chromium"))]
	{
		Arc::new(crate::modules::stealth::HttpBrowser::new())
	}
}

impl TrendScraper {
	/// Scraper with default settings.
	pub fn new() -> TrendScraperResult<Self> {
		Self::builder().build()
	}

	/// Scraper configured from the process environment.
	pub fn from_env() -> TrendScraperResult<Self> {
		let settings = AcquisitionSettings::from_env()?;
		Self::builder().with_settings(settings).build()
	}

	pub fn builder() -> TrendScraperBuilder {
		TrendScraperBuilder::new()
	}

	fn with_config(config: TrendScraperConfig) -> TrendScraperResult<Self> {
		let settings = config.settings;
		let providers = &settings.providers;

		let proxies = match config.proxies {
			Some(pool) => Some(pool),
			None if settings.proxy.enabled => Some(ProxyPool::from_settings(&settings.proxy)?),
			None => None,
		};
		if let Some(pool) = &proxies
			&& pool.is_empty()
		{
			log::warn!("proxy rotation enabled but no proxies configured");
		}

		let marker_ttl = std::time::Duration::from_secs(settings.cache.marker_ttl_secs);
		let cache = match (config.cache, settings.cache.database_path()) {
			(Some(cache), _) => cache,
			(None, Some(path)) if settings.cache.enabled => CacheStore::open(path)?.with_marker_ttl(marker_ttl),
			(None, _) => CacheStore::new().with_marker_ttl(marker_ttl),
		};

		let resolver = match config.captcha_provider {
			Some(provider) => CaptchaResolver::new(provider, CaptchaConfig::from(&settings.captcha)),
			None => CaptchaResolver::from_settings(&settings.captcha),
		};
		if !resolver.is_enabled() {
			log::info!("captcha solving disabled; challenged providers fall through");
		}

		let driver = config.browser_driver.unwrap_or_else(default_driver);
		let stealth = Arc::new(StealthSession::new(
			driver,
			StealthConfig::from_settings(&settings.stealth, &settings.trends),
		)?);

		let stats = ProviderStatsHandler::new();
		let mut events = EventDispatcher::with_logging();
		events.register_handler(Arc::new(stats.clone()));
		for handler in config.event_handlers {
			events.register_handler(handler);
		}

		let heuristic = HeuristicEstimator::new().with_scores(providers.extra_heuristic_scores.clone());
		let mut chain = FallbackChain::new(heuristic)
			.with_policy(ChainPolicy::from(providers))
			.with_resolver(Arc::new(resolver))
			.with_events(events.clone());

		let secs = std::time::Duration::from_secs;
		let gate = RequestGate::new(std::time::Duration::from_millis(providers.min_request_interval_ms));
		let trend_primary = config.trend_primary.or_else(|| {
			providers.use_serpapi.then(|| {
				let serpapi = SerpApiProvider::from_settings(providers)
					.with_clients(HttpClientPool::default().with_gate(gate.clone()));
				Arc::new(serpapi) as Arc<dyn TrendProvider>
			})
		});
		if let Some(primary) = trend_primary {
			chain = chain.with_trend_primary(primary, secs(providers.serpapi_timeout_secs));
		}
		let trend_secondary = config.trend_secondary.unwrap_or_else(|| {
			Arc::new(GoogleTrendsProvider::from_settings(stealth.clone(), &settings.trends))
		});
		chain = chain.with_trend_secondary(trend_secondary, secs(providers.google_trends_timeout_secs));

		let article_timeout = secs(providers.article_timeout_secs);
		let article_primary = config
			.article_primary
			.unwrap_or_else(|| Arc::new(BrowserArticleProvider::new(stealth.clone())));
		let article_secondary = config
			.article_secondary
			.unwrap_or_else(|| {
				let clients = HttpClientPool::default().with_gate(gate);
				Arc::new(HttpArticleProvider::new().with_clients(clients))
			});
		chain = chain
			.with_article_primary(article_primary, article_timeout)
			.with_article_secondary(article_secondary, article_timeout);

		if let Some(pool) = &proxies {
			chain = chain.with_proxies(pool.clone(), settings.proxy.policy);
		}

		Ok(Self {
			inner: Arc::new(TrendScraperInner {
				cache_enabled: settings.cache.enabled,
				settings,
				chain,
				cache,
				proxies,
				events,
				stats,
			}),
		})
	}

	pub fn settings(&self) -> &AcquisitionSettings {
		&self.inner.settings
	}

	/// Normalize a trend request, applying the configured geo/timeframe
	/// defaults to empty values.
	pub fn trend_query(&self, keyword: &str, geo: &str, timeframe: &str) -> TrendQuery {
		TrendQuery::new(keyword, geo, timeframe, &self.inner.settings.trends)
	}

	/// Interest score for `keyword`. Never fails; falls back to a heuristic
	/// estimate when every live provider does.
	pub async fn get_trend_score(&self, keyword: &str, geo: &str, timeframe: &str) -> TrendScore {
		let query = self.trend_query(keyword, geo, timeframe);
		self.get_trend_score_with(&query, &CancelSignal::never()).await
	}

	pub async fn get_trend_score_with(&self, query: &TrendQuery, cancel: &CancelSignal) -> TrendScore {
		let key = query.cache_key();
		if let Some(mut score) = self.cached_fresh::<TrendScore>(&key) {
			score.cached = true;
			return score;
		}

		let (score, report) = self.inner.chain.run_trend(query, cancel).await;
		log::debug!(
			"trend '{}' resolved by {} after {} attempts",
			query.keyword,
			score.source,
			report.attempts.len()
		);

		let cache = &self.inner.settings.cache;
		let ttl_secs = if score.estimated {
			cache.heuristic_ttl_secs
		} else {
			cache.trend_ttl_secs
		};
		self.store(&key, &score, std::time::Duration::from_secs(ttl_secs));
		score
	}

	/// Scores for several keywords with the configured geo/timeframe
	/// defaults, fetched concurrently. Results keep the input order.
	pub async fn get_trend_scores<I, S>(&self, keywords: I) -> Vec<(String, TrendScore)>
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let workers = Arc::new(Semaphore::new(self.inner.settings.providers.batch_concurrency.max(1)));
		let mut tasks = JoinSet::new();
		let keywords: Vec<String> = keywords.into_iter().map(Into::into).collect();

		for (index, keyword) in keywords.iter().cloned().enumerate() {
			let scraper = self.clone();
			let workers = workers.clone();
			tasks.spawn(async move {
				let _permit = workers.acquire_owned().await.ok();
				let score = scraper.get_trend_score(&keyword, "", "").await;
				(index, score)
			});
		}

		let mut scores: Vec<Option<TrendScore>> = vec![None; keywords.len()];
		while let Some(joined) = tasks.join_next().await {
			match joined {
				Ok((index, score)) => scores[index] = Some(score),
				Err(err) => log::error!("trend batch worker failed: {}", err),
			}
		}

		let heuristic = self.inner.chain.heuristic();
		keywords
			.into_iter()
			.zip(scores)
			.map(|(keyword, score)| {
				let score = score.unwrap_or_else(|| TrendScore::estimate(heuristic.estimate(&keyword)));
				(keyword, score)
			})
			.collect()
	}

	/// Article text for `url`. Every fetch attempt marks the URL for
	/// [`CONTENT_FETCH_STAGE`], so a URL that yielded nothing is not fetched
	/// again.
	pub async fn get_article_content(&self, url: &str) -> ArticleContent {
		self.get_article_content_with(url, &CancelSignal::never()).await
	}

	pub async fn get_article_content_with(&self, url: &str, cancel: &CancelSignal) -> ArticleContent {
		let parsed = match Url::parse(url.trim()) {
			Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => parsed,
			_ => {
				log::warn!("refusing to fetch invalid article url {:?}", url);
				return ArticleContent::unavailable(url, UnavailableReason::InvalidUrl);
			}
		};
		let key = keys::article(&parsed);

		if let Some(document) = self.cached_any::<ArticleDocument>(&key) {
			return ArticleContent::Available(document);
		}
		if self.inner.cache.is_processed(&key, CONTENT_FETCH_STAGE) {
			log::debug!("{} already attempted without content", key);
			return ArticleContent::unavailable(key, UnavailableReason::PreviouslyAttempted);
		}

		let outcome = self.inner.chain.run_article(&parsed, cancel).await;
		self.inner.cache.mark_processed(&key, CONTENT_FETCH_STAGE);

		match outcome {
			Ok((document, _)) => {
				let ttl = std::time::Duration::from_secs(self.inner.settings.cache.article_ttl_secs);
				self.store(&key, &document, ttl);
				ArticleContent::Available(document)
			}
			Err(exhausted) => {
				log::warn!("article {} unavailable: {}", key, exhausted);
				ArticleContent::unavailable(key, UnavailableReason::AllProvidersExhausted)
			}
		}
	}

	/// Cache key used for an article URL, for stage bookkeeping.
	pub fn article_key(url: &str) -> Option<String> {
		Url::parse(url.trim()).ok().map(|url| keys::article(&url))
	}

	pub fn is_processed(&self, key: &str, stage: &str) -> bool {
		self.inner.cache.is_processed(key, stage)
	}

	pub fn mark_processed(&self, key: &str, stage: &str) {
		self.inner.cache.mark_processed(key, stage);
	}

	/// Keys lacking `stage`, in key order. The cursor reads the live store.
	pub fn list_unprocessed(&self, stage: &str) -> UnprocessedKeys {
		self.inner.cache.list_unprocessed(stage)
	}

	pub fn prune_cache(&self) -> PruneReport {
		self.inner.cache.prune_expired()
	}

	pub fn provider_stats(&self) -> HashMap<&'static str, ProviderStats> {
		self.inner.stats.snapshot()
	}

	pub fn proxy_health(&self) -> Option<ProxyHealthReport> {
		self.inner.proxies.as_ref().map(ProxyPool::health_report)
	}

	fn decode<T: DeserializeOwned>(key: &str, payload: Value) -> Option<T> {
		match serde_json::from_value(payload) {
			Ok(value) => Some(value),
			Err(err) => {
				log::debug!("ignoring undecodable cache entry {}: {}", key, err);
				None
			}
		}
	}

	fn cache_hit(&self, key: &str, fresh: bool) {
		self.inner.events.dispatch(AcquisitionEvent::CacheHit(CacheHitEvent {
			key: key.to_string(),
			fresh,
			timestamp: Utc::now(),
		}));
	}

	fn cached_fresh<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
		if !self.inner.cache_enabled {
			return None;
		}
		let value = Self::decode(key, self.inner.cache.get(key).fresh()?)?;
		self.cache_hit(key, true);
		Some(value)
	}

	/// Cached payload regardless of freshness.
	fn cached_any<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
		if !self.inner.cache_enabled {
			return None;
		}
		let CacheLookup::Hit { payload, fresh } = self.inner.cache.get(key) else {
			return None;
		};
		let value = Self::decode(key, payload)?;
		self.cache_hit(key, fresh);
		Some(value)
	}

	fn store<T: Serialize>(&self, key: &str, value: &T, ttl: std::time::Duration) {
		if !self.inner.cache_enabled {
			return;
		}
		match serde_json::to_value(value) {
			Ok(payload) => self.inner.cache.put(key, payload, ttl),
			Err(err) => log::warn!("could not encode cache entry {}: {}", key, err),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::providers::{ProviderContext, ProviderError};
	use async_trait::async_trait;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct FixedTrend {
		name: &'static str,
		score: Option<f64>,
		calls: AtomicUsize,
	}

	#[async_trait]
	impl TrendProvider for FixedTrend {
		fn name(&self) -> &'static str {
			self.name
		}

		async fn fetch_score(&self, _query: &TrendQuery, _ctx: &ProviderContext<'_>) -> Result<f64, ProviderError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			self.score
				.ok_or_else(|| ProviderError::InvalidResponse("no data".into()))
		}
	}

	struct FixedArticle {
		content: Option<String>,
		calls: AtomicUsize,
	}

	#[async_trait]
	impl ArticleProvider for FixedArticle {
		fn name(&self) -> &'static str {
			"fixed_article"
		}

		async fn fetch_article(&self, url: &Url, _ctx: &ProviderContext<'_>) -> Result<ArticleDocument, ProviderError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			match &self.content {
				Some(content) => Ok(ArticleDocument {
					url: url.to_string(),
					title: Some("Draw results".into()),
					content: content.clone(),
					source: "fixed_article".into(),
					fetched_at: Utc::now(),
				}),
				None => Err(ProviderError::InvalidResponse("empty".into())),
			}
		}
	}

	fn trend(name: &'static str, score: Option<f64>) -> Arc<FixedTrend> {
		Arc::new(FixedTrend {
			name,
			score,
			calls: AtomicUsize::new(0),
		})
	}

	fn article(content: Option<&str>) -> Arc<FixedArticle> {
		Arc::new(FixedArticle {
			content: content.map(str::to_string),
			calls: AtomicUsize::new(0),
		})
	}

	fn scraper(
		primary: Arc<FixedTrend>,
		secondary: Arc<FixedTrend>,
		articles: Arc<FixedArticle>,
	) -> TrendScraper {
		let mut settings = AcquisitionSettings::default();
		settings.providers.retry_backoff_ms = 0;
		TrendScraper::builder()
			.with_settings(settings)
			.with_trend_primary(primary)
			.with_trend_secondary(secondary)
			.with_article_primary(articles.clone())
			.with_article_secondary(articles)
			.build()
			.unwrap()
	}

	#[tokio::test]
	async fn trend_scores_are_cached() {
		let primary = trend("primary", Some(78.0));
		let secondary = trend("secondary", Some(10.0));
		let scraper = scraper(primary.clone(), secondary.clone(), article(None));

		let first = scraper.get_trend_score("Express Entry", "CA", "now 7-d").await;
		assert_eq!(first.value, 78);
		assert!(!first.cached);

		let second = scraper.get_trend_score("express  entry", "", "").await;
		assert_eq!(second.value, 78);
		assert!(second.cached);
		assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
		assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn batch_keeps_input_order() {
		let scraper = scraper(trend("primary", None), trend("secondary", None), article(None));
		let scores = scraper.get_trend_scores(["PGWP", "Super visa", "hockey"]).await;
		let values: Vec<(String, u8)> = scores
			.into_iter()
			.map(|(keyword, score)| (keyword, score.value))
			.collect();
		assert_eq!(
			values,
			vec![
				("PGWP".to_string(), 67),
				("Super visa".to_string(), 45),
				("hockey".to_string(), 50)
			]
		);
	}

	#[tokio::test]
	async fn failed_article_is_not_refetched() {
		let articles = article(None);
		let scraper = scraper(trend("p", None), trend("s", None), articles.clone());
		let url = "https://example.ca/news/draw#top";

		let first = scraper.get_article_content(url).await;
		assert!(matches!(
			first,
			ArticleContent::Unavailable {
				reason: UnavailableReason::AllProvidersExhausted,
				..
			}
		));
		let key = TrendScraper::article_key(url).unwrap();
		assert!(scraper.is_processed(&key, CONTENT_FETCH_STAGE));

		let second = scraper.get_article_content(url).await;
		assert!(matches!(
			second,
			ArticleContent::Unavailable {
				reason: UnavailableReason::PreviouslyAttempted,
				..
			}
		));
		assert_eq!(articles.calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn article_content_is_cached_and_marked() {
		let articles = article(Some("Invitations issued"));
		let scraper = scraper(trend("p", None), trend("s", None), articles.clone());
		let url = "https://example.ca/news/draw";

		let first = scraper.get_article_content(url).await;
		assert_eq!(first.document().map(|doc| doc.content.as_str()), Some("Invitations issued"));
		let second = scraper.get_article_content(url).await;
		assert!(second.is_available());
		assert_eq!(articles.calls.load(Ordering::SeqCst), 1);

		let key = TrendScraper::article_key(url).unwrap();
		assert!(scraper.is_processed(&key, CONTENT_FETCH_STAGE));
		assert!(scraper.list_unprocessed(CONTENT_FETCH_STAGE).all(|pending| pending != key));
	}

	#[tokio::test]
	async fn invalid_urls_are_rejected() {
		let articles = article(Some("text"));
		let scraper = scraper(trend("p", None), trend("s", None), articles.clone());
		for url in ["not a url", "ftp://example.ca/file"] {
			let content = scraper.get_article_content(url).await;
			assert!(matches!(
				content,
				ArticleContent::Unavailable {
					reason: UnavailableReason::InvalidUrl,
					..
				}
			));
		}
		assert_eq!(articles.calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn stats_track_provider_outcomes() {
		let scraper = scraper(trend("primary", None), trend("secondary", Some(40.0)), article(None));
		scraper.get_trend_score("Open work permit", "CA", "today 3-m").await;
		let stats = scraper.provider_stats();
		assert_eq!(stats["primary"].hard_failures, 1);
		assert_eq!(stats["secondary"].successes, 1);
	}
}
