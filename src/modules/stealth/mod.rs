//! Stealth browser sessions.
//!
//! A [`StealthSession`] opens browser contexts through a [`BrowserDriver`]
//! with a fresh randomized fingerprint, pre-visits an innocuous page while
//! simulating a human, and persists cookies per identity so a session that
//! already passed a challenge is reused next time. Nothing here guarantees
//! evasion; callers pair it with the captcha resolver.

mod http_driver;
mod vault;

#[cfg(feature = "chromium")]
mod chromium;

pub use http_driver::HttpBrowser;
pub use vault::{PASSED_RECORD_TTL, SessionRecord, SessionVault, VaultError};

#[cfg(feature = "chromium")]
pub use chromium::ChromiumBrowser;

use async_trait::async_trait;
use chrono::Utc;
use rand::{Rng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use crate::challenges::PageSignal;
use crate::config::{StealthSettings, TrendDefaults};
use crate::fallback::CancelSignal;
use crate::modules::proxy::ProxyEntry;
use crate::modules::spoofing::{BrowserFingerprint, FingerprintGenerator};

#[derive(Debug, Error)]
pub enum StealthError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("navigation timed out after {0:?}")]
    Timeout(Duration),
    #[error("browser session cancelled")]
    Cancelled,
    #[error("browser interaction failed: {0}")]
    Interaction(String),
    #[error("browser session already closed")]
    Closed,
    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// Cookie persisted across sessions of one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

/// Everything a driver needs to start one browser context.
#[derive(Debug, Clone)]
pub struct LaunchProfile {
    pub identity: String,
    pub fingerprint: BrowserFingerprint,
    pub proxy: Option<ProxyEntry>,
    pub cookies: Vec<StoredCookie>,
    pub headless: bool,
    pub profile_dir: Option<PathBuf>,
}

/// Launches browser contexts.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    fn name(&self) -> &'static str;
    async fn launch(&self, profile: &LaunchProfile) -> Result<Box<dyn BrowserPage>, StealthError>;
}

/// One live page of a launched browser context.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn navigate(&mut self, url: &Url, timeout: Duration) -> Result<PageSignal, StealthError>;

    /// POST `fields` to `action` as a form submission.
    async fn submit_form(
        &mut self,
        action: &Url,
        fields: &[(String, String)],
        timeout: Duration,
    ) -> Result<PageSignal, StealthError>;

    async fn mouse_move(&mut self, x: f64, y: f64) -> Result<(), StealthError>;
    async fn scroll(&mut self, delta_y: i32) -> Result<(), StealthError>;
    async fn type_text(&mut self, text: &str) -> Result<(), StealthError>;
    async fn cookies(&mut self) -> Result<Vec<StoredCookie>, StealthError>;
    async fn close(&mut self) -> Result<(), StealthError>;
}

#[derive(Debug, Clone)]
pub struct StealthConfig {
    pub identity: String,
    pub vault_path: Option<PathBuf>,
    pub profile_root: Option<PathBuf>,
    pub previsit_url: Option<Url>,
    pub human_simulation: bool,
    pub min_navigation_interval: Duration,
    pub navigation_timeout: Duration,
    pub headless: bool,
    pub locale: String,
}

impl Default for StealthConfig {
    fn default() -> Self {
        Self {
            identity: "trendscraper".into(),
            vault_path: None,
            profile_root: None,
            previsit_url: Url::parse("https://www.google.com/").ok(),
            human_simulation: true,
            min_navigation_interval: Duration::from_secs(1),
            navigation_timeout: Duration::from_secs(30),
            headless: true,
            locale: "en-CA".into(),
        }
    }
}

impl StealthConfig {
    pub fn from_settings(settings: &StealthSettings, trends: &TrendDefaults) -> Self {
        let previsit_url = match Url::parse(&settings.previsit_url) {
            Ok(url) => Some(url),
            Err(err) => {
                if !settings.previsit_url.is_empty() {
                    log::warn!("ignoring invalid pre-visit url {}: {}", settings.previsit_url, err);
                }
                None
            }
        };
        Self {
            identity: settings.identity.clone(),
            vault_path: settings.vault_path(),
            profile_root: settings.directory.as_ref().map(|dir| dir.join("profiles")),
            previsit_url,
            human_simulation: settings.human_simulation,
            min_navigation_interval: Duration::from_millis(settings.min_navigation_interval_ms),
            headless: settings.headless,
            locale: trends.hl.clone(),
            ..Self::default()
        }
    }

    /// Configuration without pre-visit, simulated delays or pacing.
    pub fn immediate() -> Self {
        Self {
            previsit_url: None,
            human_simulation: false,
            min_navigation_interval: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Opens fingerprint-randomized browser sessions.
pub struct StealthSession {
    driver: Arc<dyn BrowserDriver>,
    config: StealthConfig,
    generator: Mutex<FingerprintGenerator>,
    vault: Option<SessionVault>,
    opened: AtomicU64,
}

impl std::fmt::Debug for StealthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StealthSession")
            .field("driver", &self.driver.name())
            .field("config", &self.config)
            .finish()
    }
}

impl StealthSession {
    pub fn new(driver: Arc<dyn BrowserDriver>, config: StealthConfig) -> Result<Self, StealthError> {
        let vault = match &config.vault_path {
            Some(path) => Some(SessionVault::open(path)?),
            None => None,
        };
        Ok(Self {
            generator: Mutex::new(FingerprintGenerator::new(config.locale.clone())),
            driver,
            config,
            vault,
            opened: AtomicU64::new(0),
        })
    }

    /// Session factory backed by the HTTP driver.
    pub fn http(config: StealthConfig) -> Result<Self, StealthError> {
        Self::new(Arc::new(HttpBrowser::new()), config)
    }

    pub fn config(&self) -> &StealthConfig {
        &self.config
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    fn stored_record(&self) -> Option<SessionRecord> {
        let vault = self.vault.as_ref()?;
        match vault.load(&self.config.identity) {
            Ok(record) => record,
            Err(err) => {
                log::warn!("session vault unreadable for {}: {}", self.config.identity, err);
                None
            }
        }
    }

    /// Open a browser context. A stored session that passed a challenge is
    /// resumed with its fingerprint and cookies; otherwise a fresh
    /// fingerprint is generated.
    pub async fn open(
        &self,
        proxy: Option<ProxyEntry>,
        cancel: &CancelSignal,
    ) -> Result<Session, StealthError> {
        if cancel.is_cancelled() {
            return Err(StealthError::Cancelled);
        }

        let stored = self.stored_record().filter(|record| record.challenge_passed);
        let resumed = stored.is_some();
        let (fingerprint, cookies) = {
            let mut generator = self.generator.lock().unwrap_or_else(PoisonError::into_inner);
            match stored {
                Some(record) => {
                    generator.remember(&record.fingerprint);
                    (record.fingerprint, record.cookies)
                }
                None => (generator.next_fingerprint(), Vec::new()),
            }
        };

        let profile = LaunchProfile {
            identity: self.config.identity.clone(),
            fingerprint: fingerprint.clone(),
            proxy,
            cookies,
            headless: self.config.headless,
            profile_dir: self.config.profile_root.as_ref().map(|root| {
                // Chromium locks its user-data dir, so concurrent sessions of
                // one identity each get their own.
                let serial = self.opened.fetch_add(1, Ordering::Relaxed);
                root.join(&self.config.identity)
                    .join(format!("{}-{}", std::process::id(), serial))
            }),
        };

        let page = tokio::select! {
            launched = self.driver.launch(&profile) => launched?,
            _ = cancel.cancelled() => return Err(StealthError::Cancelled),
        };

        log::debug!(
            "opened {} session {} ({}x{}, resumed={})",
            self.driver.name(),
            self.config.identity,
            fingerprint.viewport.0,
            fingerprint.viewport.1,
            resumed
        );

        Ok(Session {
            page: Some(page),
            profile_dir: profile.profile_dir,
            fingerprint,
            identity: self.config.identity.clone(),
            config: self.config.clone(),
            vault: self.vault.clone(),
            cancel: cancel.clone(),
            previsited: resumed,
            challenge_passed: resumed,
            last_navigation: None,
        })
    }
}

#[derive(Debug, Clone)]
enum HumanAction {
    Move(f64, f64),
    Scroll(i32),
    Type(&'static str),
    Pause(Duration),
}

const INCIDENTAL_TEXT: &[&str] = &["weather", "news", "maps", "translate", "recipes"];

fn plan_human_actions(viewport: (u16, u16), with_typing: bool) -> Vec<HumanAction> {
    let mut rng = rand::thread_rng();
    let (width, height) = (f64::from(viewport.0), f64::from(viewport.1));
    let mut actions = Vec::new();

    let (mut x, mut y) = (rng.gen_range(0.0..width), rng.gen_range(0.0..height));
    for _ in 0..rng.gen_range(3..=7) {
        let (tx, ty) = (rng.gen_range(0.0..width), rng.gen_range(0.0..height));
        let steps = rng.gen_range(2..=5);
        for step in 1..=steps {
            let t = f64::from(step) / f64::from(steps);
            let wobble = rng.gen_range(-8.0..=8.0);
            actions.push(HumanAction::Move(x + (tx - x) * t + wobble, y + (ty - y) * t + wobble));
        }
        (x, y) = (tx, ty);
        actions.push(HumanAction::Pause(Duration::from_millis(rng.gen_range(50..=250))));
    }

    for _ in 0..rng.gen_range(2..=4) {
        actions.push(HumanAction::Scroll(rng.gen_range(120..=480)));
        actions.push(HumanAction::Pause(Duration::from_millis(rng.gen_range(150..=400))));
    }
    if rng.gen_bool(0.3) {
        actions.push(HumanAction::Scroll(-rng.gen_range(60..=240)));
    }

    if with_typing && let Some(text) = INCIDENTAL_TEXT.choose(&mut rng) {
        actions.push(HumanAction::Type(*text));
        actions.push(HumanAction::Pause(Duration::from_millis(rng.gen_range(200..=600))));
    }

    // reading dwell
    actions.push(HumanAction::Pause(Duration::from_millis(rng.gen_range(500..=1500))));
    actions
}

async fn pause(cancel: &CancelSignal, duration: Duration) -> Result<(), StealthError> {
    if cancel.sleep(duration).await {
        Ok(())
    } else {
        Err(StealthError::Cancelled)
    }
}

/// A live browser context. Call [`Session::close`] to persist state and
/// shut the browser down; dropping an open session still tears it down.
pub struct Session {
    page: Option<Box<dyn BrowserPage>>,
    profile_dir: Option<PathBuf>,
    fingerprint: BrowserFingerprint,
    identity: String,
    config: StealthConfig,
    vault: Option<SessionVault>,
    cancel: CancelSignal,
    previsited: bool,
    challenge_passed: bool,
    last_navigation: Option<Instant>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("open", &self.page.is_some())
            .field("challenge_passed", &self.challenge_passed)
            .finish()
    }
}

impl Session {
    pub fn fingerprint(&self) -> &BrowserFingerprint {
        &self.fingerprint
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Record that this session got through a challenge, so the next open
    /// of the same identity resumes it.
    pub fn mark_challenge_passed(&mut self) {
        self.challenge_passed = true;
    }

    pub fn challenge_passed(&self) -> bool {
        self.challenge_passed
    }

    fn page(&mut self) -> Result<&mut Box<dyn BrowserPage>, StealthError> {
        self.page.as_mut().ok_or(StealthError::Closed)
    }

    async fn pace(&mut self) -> Result<(), StealthError> {
        if self.cancel.is_cancelled() {
            return Err(StealthError::Cancelled);
        }
        if let Some(last) = self.last_navigation {
            let elapsed = last.elapsed();
            if elapsed < self.config.min_navigation_interval {
                pause(&self.cancel, self.config.min_navigation_interval - elapsed).await?;
            }
        }
        self.last_navigation = Some(Instant::now());
        Ok(())
    }

    async fn simulate_human(&mut self, with_typing: bool) -> Result<(), StealthError> {
        if !self.config.human_simulation {
            return Ok(());
        }
        for action in plan_human_actions(self.fingerprint.viewport, with_typing) {
            match action {
                HumanAction::Move(x, y) => self.page()?.mouse_move(x, y).await?,
                HumanAction::Scroll(delta) => self.page()?.scroll(delta).await?,
                HumanAction::Type(text) => self.page()?.type_text(text).await?,
                HumanAction::Pause(duration) => pause(&self.cancel, duration).await?,
            }
        }
        Ok(())
    }

    async fn previsit(&mut self) -> Result<(), StealthError> {
        self.previsited = true;
        let Some(url) = self.config.previsit_url.clone() else {
            return Ok(());
        };
        match self.raw_navigate(&url).await {
            Ok(_) => self.simulate_human(true).await,
            Err(StealthError::Cancelled) => Err(StealthError::Cancelled),
            Err(err) => {
                log::debug!("pre-visit of {} failed: {}", url, err);
                Ok(())
            }
        }
    }

    async fn raw_navigate(&mut self, url: &Url) -> Result<PageSignal, StealthError> {
        self.pace().await?;
        let timeout = self.config.navigation_timeout;
        let cancel = self.cancel.clone();
        let page = self.page()?;
        tokio::select! {
            signal = page.navigate(url, timeout) => signal,
            _ = cancel.cancelled() => Err(StealthError::Cancelled),
        }
    }

    /// Navigate to `url`, pre-visiting the innocuous page first on a fresh
    /// session.
    pub async fn navigate(&mut self, url: &Url) -> Result<PageSignal, StealthError> {
        if !self.previsited {
            self.previsit().await?;
        }
        let signal = self.raw_navigate(url).await?;
        if signal.is_html() {
            self.simulate_human(false).await?;
        }
        Ok(signal)
    }

    pub async fn submit_form(
        &mut self,
        action: &Url,
        fields: &[(String, String)],
    ) -> Result<PageSignal, StealthError> {
        self.pace().await?;
        let timeout = self.config.navigation_timeout;
        let cancel = self.cancel.clone();
        let page = self.page()?;
        tokio::select! {
            signal = page.submit_form(action, fields, timeout) => signal,
            _ = cancel.cancelled() => Err(StealthError::Cancelled),
        }
    }

    /// Persist cookies and status for this identity, then shut the browser
    /// down.
    pub async fn close(mut self) -> Result<(), StealthError> {
        let Some(mut page) = self.page.take() else {
            return Ok(());
        };
        let persisted = match &self.vault {
            Some(vault) => {
                let cookies = page.cookies().await.unwrap_or_else(|err| {
                    log::debug!("could not read cookies for {}: {}", self.identity, err);
                    Vec::new()
                });
                vault
                    .save(&SessionRecord {
                        identity: self.identity.clone(),
                        fingerprint: self.fingerprint.clone(),
                        cookies,
                        challenge_passed: self.challenge_passed,
                        updated_at: Utc::now(),
                    })
                    .map(|written| {
                        if !written {
                            log::debug!("kept the passed session already stored for {}", self.identity);
                        }
                    })
                    .map_err(StealthError::from)
            }
            None => Ok(()),
        };
        let closed = page.close().await;
        discard_profile(self.profile_dir.take());
        persisted.and(closed)
    }
}

/// Remove a session's scratch profile. Cookies live in the vault, not here.
fn discard_profile(dir: Option<PathBuf>) {
    let Some(dir) = dir else {
        return;
    };
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => log::debug!("could not remove profile {}: {}", dir.display(), err),
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mut page) = self.page.take() {
            log::debug!("session {} dropped without close; tearing down", self.identity);
            let profile_dir = self.profile_dir.take();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(err) = page.close().await {
                            log::warn!("browser teardown failed: {}", err);
                        }
                        discard_profile(profile_dir);
                    });
                }
                Err(_) => log::warn!("no runtime to tear down session {}", self.identity),
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedDriver;
    use super::*;
    use std::sync::atomic::Ordering;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn consecutive_sessions_use_different_fingerprints() {
        let driver = Arc::new(ScriptedDriver::default());
        let stealth = StealthSession::new(driver.clone(), StealthConfig::immediate()).unwrap();
        for _ in 0..5 {
            let session = stealth.open(None, &CancelSignal::never()).await.unwrap();
            session.close().await.unwrap();
        }
        let fingerprints = driver.fingerprints.lock().unwrap();
        for pair in fingerprints.windows(2) {
            assert!(!pair[0].same_parameters(&pair[1]));
        }
        assert_eq!(driver.closes.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn previsits_before_first_target_only() {
        let driver = Arc::new(ScriptedDriver::default());
        let config = StealthConfig {
            previsit_url: Some(url("https://www.google.com/")),
            ..StealthConfig::immediate()
        };
        let stealth = StealthSession::new(driver.clone(), config).unwrap();
        let mut session = stealth.open(None, &CancelSignal::never()).await.unwrap();
        session.navigate(&url("https://trends.google.com/a")).await.unwrap();
        session.navigate(&url("https://trends.google.com/b")).await.unwrap();
        session.close().await.unwrap();

        let visited = driver.visited.lock().unwrap().clone();
        assert_eq!(
            visited,
            vec![
                "https://www.google.com/".to_string(),
                "https://trends.google.com/a".to_string(),
                "https://trends.google.com/b".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn human_simulation_drives_the_page() {
        let driver = Arc::new(ScriptedDriver::default());
        let config = StealthConfig {
            human_simulation: true,
            ..StealthConfig::immediate()
        };
        let stealth = StealthSession::new(driver.clone(), config).unwrap();
        let mut session = stealth.open(None, &CancelSignal::never()).await.unwrap();
        session.navigate(&url("https://example.com/")).await.unwrap();
        session.close().await.unwrap();
        assert!(driver.actions.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn cancellation_interrupts_simulated_delays() {
        let driver = Arc::new(ScriptedDriver::default());
        let config = StealthConfig {
            human_simulation: true,
            ..StealthConfig::immediate()
        };
        let stealth = StealthSession::new(driver.clone(), config).unwrap();
        let (handle, cancel) = CancelSignal::pair();
        let mut session = stealth.open(None, &cancel).await.unwrap();
        handle.cancel();
        let err = session.navigate(&url("https://example.com/")).await.unwrap_err();
        assert!(matches!(err, StealthError::Cancelled));
    }

    #[tokio::test]
    async fn dropped_session_is_torn_down() {
        let driver = Arc::new(ScriptedDriver::default());
        let stealth = StealthSession::new(driver.clone(), StealthConfig::immediate()).unwrap();
        {
            let mut session = stealth.open(None, &CancelSignal::never()).await.unwrap();
            session.navigate(&url("https://example.com/")).await.unwrap();
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(driver.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn passed_session_is_resumed_from_vault() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(ScriptedDriver::default());
        let config = StealthConfig {
            vault_path: Some(dir.path().join("sessions.redb")),
            ..StealthConfig::immediate()
        };
        let stealth = StealthSession::new(driver.clone(), config).unwrap();

        let mut first = stealth.open(None, &CancelSignal::never()).await.unwrap();
        first.navigate(&url("https://trends.google.com/")).await.unwrap();
        first.mark_challenge_passed();
        let stored = first.fingerprint().clone();
        first.close().await.unwrap();

        let second = stealth.open(None, &CancelSignal::never()).await.unwrap();
        assert!(second.challenge_passed());
        assert!(second.fingerprint().same_parameters(&stored));
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn overlapping_sessions_keep_the_pass_in_either_close_order() {
        for passed_closes_first in [true, false] {
            let dir = tempfile::tempdir().unwrap();
            let driver = Arc::new(ScriptedDriver::default());
            let config = StealthConfig {
                vault_path: Some(dir.path().join("sessions.redb")),
                ..StealthConfig::immediate()
            };
            let stealth = StealthSession::new(driver.clone(), config).unwrap();

            let mut passed = stealth.open(None, &CancelSignal::never()).await.unwrap();
            let mut plain = stealth.open(None, &CancelSignal::never()).await.unwrap();
            passed.navigate(&url("https://trends.google.com/")).await.unwrap();
            plain.navigate(&url("https://trends.google.com/")).await.unwrap();
            passed.mark_challenge_passed();
            let stored = passed.fingerprint().clone();

            if passed_closes_first {
                passed.close().await.unwrap();
                plain.close().await.unwrap();
            } else {
                plain.close().await.unwrap();
                passed.close().await.unwrap();
            }

            let resumed = stealth.open(None, &CancelSignal::never()).await.unwrap();
            assert!(resumed.challenge_passed(), "pass lost when passed_closes_first={passed_closes_first}");
            assert!(resumed.fingerprint().same_parameters(&stored));
            resumed.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn concurrent_sessions_get_separate_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(ScriptedDriver::default());
        let config = StealthConfig {
            profile_root: Some(dir.path().to_path_buf()),
            ..StealthConfig::immediate()
        };
        let stealth = StealthSession::new(driver.clone(), config).unwrap();

        let first = stealth.open(None, &CancelSignal::never()).await.unwrap();
        let second = stealth.open(None, &CancelSignal::never()).await.unwrap();
        let profiles: Vec<PathBuf> = driver
            .profile_dirs
            .lock()
            .unwrap()
            .iter()
            .map(|dir| dir.clone().unwrap())
            .collect();
        assert_eq!(profiles.len(), 2);
        assert_ne!(profiles[0], profiles[1]);
        for profile in &profiles {
            assert!(profile.starts_with(dir.path().join("trendscraper")));
            std::fs::create_dir_all(profile).unwrap();
        }

        first.close().await.unwrap();
        second.close().await.unwrap();
        assert!(profiles.iter().all(|profile| !profile.exists()));
    }
}
