//! Challenge detection module.
//!
//! Provides pattern-based identification of bot-verification pages: widget
//! markup (reCAPTCHA, hCaptcha, Turnstile), interstitial URLs, and a
//! multilingual phrase set. False negatives are expected; callers treat a
//! miss as "proceed", not as proof that no challenge was served.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use url::Url;

use super::signal::PageSignal;
use crate::external_deps::captcha::{CaptchaKind, CaptchaTask};

/// High level challenge categories supported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChallengeType {
    Unknown,
    TrafficInterstitial,
    RecaptchaV2,
    RecaptchaV3,
    HCaptcha,
    Turnstile,
}

impl ChallengeType {
    /// Widget family a solving service can work on, if any.
    pub fn captcha_kind(&self) -> Option<CaptchaKind> {
        match self {
            ChallengeType::RecaptchaV2 => Some(CaptchaKind::RecaptchaV2),
            ChallengeType::RecaptchaV3 => Some(CaptchaKind::RecaptchaV3),
            ChallengeType::HCaptcha => Some(CaptchaKind::HCaptcha),
            ChallengeType::Turnstile => Some(CaptchaKind::Turnstile),
            ChallengeType::TrafficInterstitial | ChallengeType::Unknown => None,
        }
    }
}

/// Markup signature of a verification widget.
#[derive(Debug, Clone)]
struct ChallengePattern {
    id: &'static str,
    challenge_type: ChallengeType,
    patterns: Vec<Regex>,
}

impl ChallengePattern {
    fn new(id: &'static str, challenge_type: ChallengeType, raw_patterns: &[&str]) -> Self {
        Self {
            id,
            challenge_type,
            patterns: raw_patterns.iter().map(|pattern| build_regex(pattern)).collect(),
        }
    }

    fn matches(&self, body: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(body))
    }
}

static KNOWN_PATTERNS: Lazy<Vec<ChallengePattern>> = Lazy::new(|| {
    vec![
        ChallengePattern::new(
            "recaptcha_widget",
            ChallengeType::RecaptchaV2,
            &[
                r#"class\s*=\s*["'][^"']*\bg-recaptcha\b"#,
                r#"src\s*=\s*["'][^"']*(?:google\.com|recaptcha\.net)/recaptcha/(?:api|enterprise)\.js"#,
                r#"<iframe[^>]+src\s*=\s*["'][^"']*recaptcha"#,
            ],
        ),
        ChallengePattern::new(
            "hcaptcha_widget",
            ChallengeType::HCaptcha,
            &[
                r#"class\s*=\s*["'][^"']*\bh-captcha\b"#,
                r#"src\s*=\s*["'][^"']*hcaptcha\.com/1/api\.js"#,
                r#"<iframe[^>]+src\s*=\s*["'][^"']*hcaptcha"#,
            ],
        ),
        ChallengePattern::new(
            "turnstile_widget",
            ChallengeType::Turnstile,
            &[
                r#"class\s*=\s*["'][^"']*\bcf-turnstile\b"#,
                r#"src\s*=\s*["']https://challenges\.cloudflare\.com/turnstile/"#,
            ],
        ),
        ChallengePattern::new(
            "captcha_frame",
            ChallengeType::Unknown,
            &[
                r#"<iframe[^>]+src\s*=\s*["'][^"']*captcha"#,
                r#"<form[^>]+id\s*=\s*["']captcha-form["']"#,
            ],
        ),
    ]
});

const CHALLENGE_PHRASES: &[(&str, &str)] = &[
    ("en", "unusual traffic from your computer network"),
    ("en", "our systems have detected unusual traffic"),
    ("en", "verify you are human"),
    ("en", "verify that you are human"),
    ("en", "are you a robot"),
    ("en", "i'm not a robot"),
    ("en", "human verification"),
    ("en", "please complete the security check"),
    ("en", "please solve this captcha"),
    ("en", "confirm you are not a robot"),
    ("zh", "异常流量"),
    ("zh", "人机验证"),
    ("zh", "我不是机器人"),
    ("zh", "请完成安全验证"),
    ("es", "tráfico inusual"),
    ("es", "no soy un robot"),
    ("es", "verifica que eres humano"),
    ("fr", "trafic inhabituel"),
    ("fr", "je ne suis pas un robot"),
    ("de", "ungewöhnlichen datenverkehr"),
    ("de", "ich bin kein roboter"),
    ("pt", "tráfego incomum"),
    ("pt", "não sou um robô"),
    ("ja", "通常と異なるトラフィック"),
    ("ja", "私はロボットではありません"),
    ("ru", "необычный трафик"),
    ("ru", "я не робот"),
];

static PHRASE_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    CHALLENGE_PHRASES
        .iter()
        .map(|(lang, phrase)| (*lang, build_regex(&regex::escape(phrase))))
        .collect()
});

static SITE_KEY: Lazy<Regex> = Lazy::new(|| build_regex(r#"data-sitekey\s*=\s*["']([^"']+)["']"#));
static RENDER_KEY: Lazy<Regex> =
    Lazy::new(|| build_regex(r#"recaptcha/(?:api|enterprise)\.js\?render=([A-Za-z0-9_-]{20,})"#));
static INVISIBLE: Lazy<Regex> = Lazy::new(|| build_regex(r#"data-size\s*=\s*["']invisible["']"#));
static DATA_S: Lazy<Regex> = Lazy::new(|| build_regex(r#"data-s\s*=\s*["']([^"']+)["']"#));
static DATA_ACTION: Lazy<Regex> = Lazy::new(|| build_regex(r#"data-action\s*=\s*["']([^"']+)["']"#));
static FORM_ACTION: Lazy<Regex> =
    Lazy::new(|| build_regex(r#"<form[^>]+action\s*=\s*["']([^"']+)["']"#));
static HIDDEN_INPUT: Lazy<Regex> = Lazy::new(|| {
    build_regex(r#"<input[^>]*name\s*=\s*["'](q|continue)["'][^>]*value\s*=\s*["']([^"']*)["']"#)
});

fn decode(raw: &str) -> String {
    html_escape::decode_html_entities(raw).into_owned()
}

/// A detected challenge, scoped to a single resolution attempt.
#[derive(Debug, Clone)]
pub struct CaptchaChallenge {
    pub challenge_type: ChallengeType,
    /// Widget site key, when the page exposes one.
    pub site_key: Option<String>,
    pub page_url: Url,
    /// Extra page parameters needed to solve or submit (`data-s`, form
    /// action, hidden inputs).
    pub context: HashMap<String, String>,
    pub indicators: Vec<String>,
}

impl CaptchaChallenge {
    /// True when the only evidence is embedded widget markup, with no
    /// interstitial URL, challenge phrase or captcha form. Such widgets also
    /// show up in ordinary comment and signup forms.
    pub fn widget_only(&self) -> bool {
        !self.indicators.is_empty() && self.indicators.iter().all(|indicator| indicator.ends_with("_widget"))
    }

    /// Solving-service task for this challenge, if it is solvable.
    pub fn to_task(&self) -> Option<CaptchaTask> {
        let kind = self.challenge_type.captcha_kind()?;
        let site_key = self.site_key.clone()?;
        let mut task = CaptchaTask::new(kind, site_key, self.page_url.clone());
        if let Some(action) = self.context.get("action") {
            task = task.with_action(action.clone());
        }
        for (key, value) in &self.context {
            task = task.insert_metadata(key.clone(), value.clone());
        }
        Some(task)
    }
}

/// Detector over markup, URL, and text indicators.
#[derive(Debug, Clone, Default)]
pub struct ChallengeDetector {
    extra_phrases: Vec<Regex>,
}

impl ChallengeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Additional site-specific phrases, matched case-insensitively.
    pub fn with_phrases<I, S>(mut self, phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extra_phrases
            .extend(phrases.into_iter().map(|phrase| build_regex(&regex::escape(phrase.as_ref()))));
        self
    }

    pub fn detect(&self, signal: &PageSignal) -> bool {
        self.inspect(signal).is_some()
    }

    pub fn inspect(&self, signal: &PageSignal) -> Option<CaptchaChallenge> {
        let body = signal.body.as_str();
        let mut indicators = Vec::new();
        let mut challenge_type: Option<ChallengeType> = None;

        for pattern in KNOWN_PATTERNS.iter() {
            if pattern.matches(body) {
                indicators.push(pattern.id.to_string());
                challenge_type = challenge_type.max(Some(pattern.challenge_type));
            }
        }

        if signal.url.path().starts_with("/sorry/") {
            indicators.push("interstitial_url".to_string());
            challenge_type = challenge_type.max(Some(ChallengeType::TrafficInterstitial));
        }

        for (lang, phrase) in PHRASE_PATTERNS.iter() {
            if phrase.is_match(body) {
                indicators.push(format!("phrase_{lang}"));
                challenge_type = challenge_type.max(Some(ChallengeType::TrafficInterstitial));
            }
        }
        if self.extra_phrases.iter().any(|phrase| phrase.is_match(body)) {
            indicators.push("phrase_custom".to_string());
            challenge_type = challenge_type.max(Some(ChallengeType::Unknown));
        }

        let mut challenge_type = challenge_type?;
        indicators.dedup();

        let mut site_key = SITE_KEY
            .captures(body)
            .and_then(|caps| caps.get(1))
            .map(|key| decode(key.as_str()));

        let mut context = HashMap::new();
        if challenge_type == ChallengeType::RecaptchaV2 {
            if let Some(render) = RENDER_KEY.captures(body).and_then(|caps| caps.get(1))
                && site_key.is_none()
            {
                challenge_type = ChallengeType::RecaptchaV3;
                site_key = Some(render.as_str().to_string());
            } else if INVISIBLE.is_match(body) {
                context.insert("invisible".to_string(), "1".to_string());
            }
        }

        if let Some(data_s) = DATA_S.captures(body).and_then(|caps| caps.get(1)) {
            context.insert("data-s".to_string(), decode(data_s.as_str()));
        }
        if let Some(action) = DATA_ACTION.captures(body).and_then(|caps| caps.get(1)) {
            context.insert("action".to_string(), decode(action.as_str()));
        }
        if let Some(action) = FORM_ACTION.captures(body).and_then(|caps| caps.get(1)) {
            context.insert("form_action".to_string(), decode(action.as_str()));
        }
        for caps in HIDDEN_INPUT.captures_iter(body) {
            if let (Some(name), Some(value)) = (caps.get(1), caps.get(2)) {
                context.insert(name.as_str().to_string(), decode(value.as_str()));
            }
        }

        log::debug!(
            "challenge detected on {} ({:?}): {:?}",
            signal.url,
            challenge_type,
            indicators
        );

        Some(CaptchaChallenge {
            challenge_type,
            site_key,
            page_url: signal.url.clone(),
            context,
            indicators,
        })
    }
}

fn build_regex(pattern: &str) -> Regex {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .multi_line(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid challenge detection regex `{}`: {}", pattern, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(url: &str, status: u16, body: &str) -> PageSignal {
        PageSignal::new(Url::parse(url).unwrap(), status, body)
    }

    #[test]
    fn detects_google_sorry_page() {
        let html = r#"
			<html><head><title>https://trends.google.com/</title></head>
			<body>
				<div>Our systems have detected unusual traffic from your computer network.</div>
				<form id="captcha-form" action="index" method="post">
					<div class="g-recaptcha" data-sitekey="6LfwuyUTAAAAAOAmoS0fdqijC2PbbdH4kjq62Y1b" data-s="AbC&amp;123"></div>
					<input type='hidden' name='q' value='EgRkYWJj'>
					<input type="hidden" name="continue" value="https://trends.google.com/trends/api/explore">
				</form>
			</body>
			</html>
		"#;

        let detector = ChallengeDetector::new();
        let challenge = detector
            .inspect(&signal("https://www.google.com/sorry/index?continue=x", 429, html))
            .expect("should detect");

        assert_eq!(challenge.challenge_type, ChallengeType::RecaptchaV2);
        assert_eq!(
            challenge.site_key.as_deref(),
            Some("6LfwuyUTAAAAAOAmoS0fdqijC2PbbdH4kjq62Y1b")
        );
        assert_eq!(challenge.context.get("data-s").map(String::as_str), Some("AbC&123"));
        assert_eq!(challenge.context.get("q").map(String::as_str), Some("EgRkYWJj"));
        assert!(challenge.indicators.contains(&"interstitial_url".to_string()));
        assert!(challenge.to_task().is_some());
    }

    #[test]
    fn detects_multilingual_text_without_widget() {
        let detector = ChallengeDetector::new();
        let challenge = detector
            .inspect(&signal(
                "https://www.google.com.hk/search",
                200,
                "<p>我们的系统检测到您的计算机网络中存在异常流量。</p>",
            ))
            .unwrap();
        assert_eq!(challenge.challenge_type, ChallengeType::TrafficInterstitial);
        assert!(challenge.to_task().is_none());
    }

    #[test]
    fn detects_hcaptcha_and_turnstile() {
        let detector = ChallengeDetector::new();
        let hcaptcha = detector
            .inspect(&signal(
                "https://example.com/",
                403,
                r#"<div class="h-captcha" data-sitekey="10000000-ffff-ffff-ffff-000000000001"></div>"#,
            ))
            .unwrap();
        assert_eq!(hcaptcha.challenge_type, ChallengeType::HCaptcha);

        let turnstile = detector
            .inspect(&signal(
                "https://example.com/",
                403,
                r#"<div class="cf-turnstile" data-sitekey="0x4AAAAAAAA"></div>"#,
            ))
            .unwrap();
        assert_eq!(turnstile.challenge_type, ChallengeType::Turnstile);
        assert_eq!(turnstile.site_key.as_deref(), Some("0x4AAAAAAAA"));
    }

    #[test]
    fn render_parameter_marks_recaptcha_v3() {
        let detector = ChallengeDetector::new();
        let challenge = detector
            .inspect(&signal(
                "https://example.com/",
                200,
                r#"<script src="https://www.google.com/recaptcha/api.js?render=6LcR_okUAAAAAPYrPe-HK_0RULO1aZM15ENyM-Mf"></script>"#,
            ))
            .unwrap();
        assert_eq!(challenge.challenge_type, ChallengeType::RecaptchaV3);
        assert!(challenge.site_key.is_some());
    }

    #[test]
    fn ordinary_article_is_not_flagged() {
        let detector = ChallengeDetector::new();
        let html = r#"<html><body><article><h1>Express Entry draw</h1>
			<p>IRCC invited 3,000 candidates with a CRS cutoff of 524.</p></article></body></html>"#;
        assert!(!detector.detect(&signal("https://news.example.com/draw", 200, html)));
    }

    #[test]
    fn widget_only_separates_embedded_widgets_from_interstitials() {
        let detector = ChallengeDetector::new();
        let comments = detector
            .inspect(&signal(
                "https://news.example.com/draw",
                200,
                r#"<article><p>Draw results.</p></article><form id="comment"><div class="g-recaptcha" data-sitekey="6Lc-comments"></div></form>"#,
            ))
            .unwrap();
        assert!(comments.widget_only());

        let interstitial = detector
            .inspect(&signal(
                "https://www.google.com/sorry/index",
                429,
                r#"<div class="g-recaptcha" data-sitekey="6Lc-sorry"></div>"#,
            ))
            .unwrap();
        assert!(!interstitial.widget_only());
    }

    #[test]
    fn custom_phrases_extend_detection() {
        let detector = ChallengeDetector::new().with_phrases(["Checking your browser"]);
        assert!(detector.detect(&signal(
            "https://example.com/",
            503,
            "<title>checking your browser before accessing</title>"
        )));
    }
}
