//! Browser fingerprint spoofing utilities.
//!
//! Generates randomized browser fingerprints for stealth sessions. Each fresh
//! fingerprint differs from the previous one so no two consecutive sessions
//! present identical parameters.

use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderValue, header};
use rand::{Rng, seq::SliceRandom};
use serde::{Deserialize, Serialize};

/// Observable browser properties presented by one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserFingerprint {
    pub user_agent: String,
    pub chrome_version: String,
    pub platform: String,
    pub ua_platform: String,
    pub viewport: (u16, u16),
    pub hardware_concurrency: u8,
    pub device_memory: u8,
    pub languages: Vec<String>,
    pub timezone: String,
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    pub plugins: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl BrowserFingerprint {
    /// True when every observable parameter matches `other`.
    pub fn same_parameters(&self, other: &BrowserFingerprint) -> bool {
        self.user_agent == other.user_agent
            && self.platform == other.platform
            && self.viewport == other.viewport
            && self.hardware_concurrency == other.hardware_concurrency
            && self.device_memory == other.device_memory
            && self.languages == other.languages
            && self.timezone == other.timezone
            && self.webgl_vendor == other.webgl_vendor
            && self.webgl_renderer == other.webgl_renderer
            && self.plugins == other.plugins
    }

    pub fn accept_language(&self) -> String {
        self.languages
            .iter()
            .enumerate()
            .map(|(idx, lang)| match idx {
                0 => lang.clone(),
                _ => format!("{lang};q=0.{}", 10 - idx.min(9)),
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Request headers consistent with this fingerprint.
    pub fn headers(&self) -> HeaderMap {
        let major = self.chrome_version.split('.').next().unwrap_or("120");
        let sec_ch_ua = format!(
            "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"{major}\", \"Google Chrome\";v=\"{major}\""
        );
        let mut headers = HeaderMap::new();
        let pairs: [(header::HeaderName, String); 7] = [
            (header::USER_AGENT, self.user_agent.clone()),
            (
                header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"
                    .to_string(),
            ),
            (header::ACCEPT_LANGUAGE, self.accept_language()),
            (header::HeaderName::from_static("sec-ch-ua"), sec_ch_ua),
            (header::HeaderName::from_static("sec-ch-ua-mobile"), "?0".to_string()),
            (
                header::HeaderName::from_static("sec-ch-ua-platform"),
                format!("\"{}\"", self.ua_platform),
            ),
            (header::UPGRADE_INSECURE_REQUESTS, "1".to_string()),
        ];
        for (name, value) in pairs {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }
        headers
    }

    /// Script run before any page script to override automation markers.
    pub fn init_script(&self) -> String {
        format!(
            r#"(() => {{
  const define = (obj, key, value) => Object.defineProperty(obj, key, {{ get: () => value, configurable: true }});
  define(Navigator.prototype, 'webdriver', undefined);
  define(Navigator.prototype, 'languages', {languages});
  define(Navigator.prototype, 'language', {language});
  define(Navigator.prototype, 'platform', {platform});
  define(Navigator.prototype, 'hardwareConcurrency', {cores});
  define(Navigator.prototype, 'deviceMemory', {memory});
  const pluginNames = {plugins};
  const plugins = pluginNames.map((name) => ({{ name, filename: name.toLowerCase().replace(/ /g, '-') + '.so', description: name, length: 1 }}));
  plugins.item = (i) => plugins[i];
  plugins.namedItem = (n) => plugins.find((p) => p.name === n);
  plugins.refresh = () => {{}};
  define(Navigator.prototype, 'plugins', plugins);
  window.chrome = window.chrome || {{ runtime: {{}}, loadTimes: () => ({{}}), csi: () => ({{}}), app: {{ isInstalled: false }} }};
  const query = window.navigator.permissions && window.navigator.permissions.query;
  if (query) {{
    window.navigator.permissions.query = (params) => params && params.name === 'notifications'
      ? Promise.resolve({{ state: Notification.permission }})
      : query.call(window.navigator.permissions, params);
  }}
  const patchWebGl = (proto) => {{
    if (!proto) return;
    const getParameter = proto.getParameter;
    proto.getParameter = function (parameter) {{
      if (parameter === 37445) return {vendor};
      if (parameter === 37446) return {renderer};
      return getParameter.call(this, parameter);
    }};
  }};
  patchWebGl(window.WebGLRenderingContext && WebGLRenderingContext.prototype);
  patchWebGl(window.WebGL2RenderingContext && WebGL2RenderingContext.prototype);
}})();"#,
            languages = json(&self.languages),
            language = json(self.languages.first().map(String::as_str).unwrap_or("en")),
            platform = json(&self.platform),
            cores = self.hardware_concurrency,
            memory = self.device_memory,
            plugins = json(&self.plugins),
            vendor = json(&self.webgl_vendor),
            renderer = json(&self.webgl_renderer),
        )
    }
}

fn json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

#[derive(Debug, Clone, Copy)]
struct PlatformTemplate {
    ua_os: &'static str,
    platform: &'static str,
    ua_platform: &'static str,
    webgl_renderers: &'static [&'static str],
}

const PLATFORMS: &[PlatformTemplate] = &[
    PlatformTemplate {
        ua_os: "Windows NT 10.0; Win64; x64",
        platform: "Win32",
        ua_platform: "Windows",
        webgl_renderers: &[
            "ANGLE (NVIDIA, NVIDIA GeForce RTX 3060 Direct3D11 vs_5_0 ps_5_0, D3D11)",
            "ANGLE (Intel, Intel(R) UHD Graphics 630 Direct3D11 vs_5_0 ps_5_0, D3D11)",
            "ANGLE (AMD, AMD Radeon RX 6600 Direct3D11 vs_5_0 ps_5_0, D3D11)",
        ],
    },
    PlatformTemplate {
        ua_os: "Macintosh; Intel Mac OS X 10_15_7",
        platform: "MacIntel",
        ua_platform: "macOS",
        webgl_renderers: &[
            "ANGLE (Apple, Apple M1, OpenGL 4.1)",
            "ANGLE (Apple, Apple M2, OpenGL 4.1)",
            "ANGLE (Intel Inc., Intel(R) Iris(TM) Plus Graphics, OpenGL 4.1)",
        ],
    },
    PlatformTemplate {
        ua_os: "X11; Linux x86_64",
        platform: "Linux x86_64",
        ua_platform: "Linux",
        webgl_renderers: &[
            "ANGLE (Intel, Mesa Intel(R) UHD Graphics 620 (KBL GT2), OpenGL 4.6)",
            "ANGLE (NVIDIA Corporation, NVIDIA GeForce GTX 1660/PCIe/SSE2, OpenGL 4.5)",
        ],
    },
];

const CHROME_VERSIONS: &[(u32, u32, u32, u32)] = &[
    (120, 0, 6099, 109),
    (121, 0, 6167, 85),
    (122, 0, 6261, 94),
    (123, 0, 6312, 58),
    (124, 0, 6367, 91),
];

const HARDWARE_CONCURRENCY: &[u8] = &[4, 8, 12, 16];
const DEVICE_MEMORY: &[u8] = &[4, 8, 16];

const PLUGINS: &[&str] = &[
    "PDF Viewer",
    "Chrome PDF Viewer",
    "Chromium PDF Viewer",
    "Microsoft Edge PDF Viewer",
    "WebKit built-in PDF",
];

const TIMEZONES: &[&str] = &[
    "America/Toronto",
    "America/Vancouver",
    "America/Edmonton",
    "America/Winnipeg",
    "America/Halifax",
];

const MAX_ATTEMPTS: usize = 8;

/// Produces fresh fingerprints, never repeating the previous one.
#[derive(Debug, Clone)]
pub struct FingerprintGenerator {
    locale: String,
    last: Option<BrowserFingerprint>,
}

impl FingerprintGenerator {
    /// `locale` is the primary browser language, e.g. `en-CA`.
    pub fn new(locale: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
            last: None,
        }
    }

    /// Seed the generator with a fingerprint already in use.
    pub fn remember(&mut self, fingerprint: &BrowserFingerprint) {
        self.last = Some(fingerprint.clone());
    }

    pub fn next_fingerprint(&mut self) -> BrowserFingerprint {
        let mut candidate = self.random_fingerprint();
        let mut attempts = 1;
        while let Some(previous) = &self.last
            && candidate.same_parameters(previous)
        {
            if attempts >= MAX_ATTEMPTS {
                candidate.viewport.0 = if previous.viewport.0 >= 1920 {
                    previous.viewport.0 - 1
                } else {
                    previous.viewport.0 + 1
                };
                break;
            }
            candidate = self.random_fingerprint();
            attempts += 1;
        }
        self.last = Some(candidate.clone());
        candidate
    }

    fn random_fingerprint(&self) -> BrowserFingerprint {
        let mut rng = rand::thread_rng();
        let template = PLATFORMS.choose(&mut rng).copied().unwrap_or(PLATFORMS[0]);
        let chrome_version = jittered_chrome_version(&mut rng);
        let user_agent = format!(
            "Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{} Safari/537.36",
            template.ua_os, chrome_version
        );

        let mut languages = vec![self.locale.clone()];
        if let Some((base, _)) = self.locale.split_once('-') {
            languages.push(base.to_string());
        }
        if !languages.iter().any(|lang| lang == "en-US") && rng.gen_bool(0.5) {
            languages.insert(1, "en-US".to_string());
        }
        if !languages.iter().any(|lang| lang == "en") {
            languages.push("en".to_string());
        }

        let plugin_count = rng.gen_range(3..=PLUGINS.len());
        let plugins = PLUGINS[..plugin_count].iter().map(|name| name.to_string()).collect();

        BrowserFingerprint {
            user_agent,
            chrome_version,
            platform: template.platform.to_string(),
            ua_platform: template.ua_platform.to_string(),
            viewport: (rng.gen_range(1280..=1920), rng.gen_range(720..=1080)),
            hardware_concurrency: HARDWARE_CONCURRENCY.choose(&mut rng).copied().unwrap_or(8),
            device_memory: DEVICE_MEMORY.choose(&mut rng).copied().unwrap_or(8),
            languages,
            timezone: TIMEZONES.choose(&mut rng).copied().unwrap_or("America/Toronto").to_string(),
            webgl_vendor: "Google Inc.".to_string(),
            webgl_renderer: template
                .webgl_renderers
                .choose(&mut rng)
                .copied()
                .unwrap_or("ANGLE (Intel, Intel(R) UHD Graphics 630 Direct3D11 vs_5_0 ps_5_0, D3D11)")
                .to_string(),
            plugins,
            created_at: Utc::now(),
        }
    }
}

impl Default for FingerprintGenerator {
    fn default() -> Self {
        Self::new("en-CA")
    }
}

fn jitter<R: Rng>(value: u32, spread: i64, rng: &mut R) -> i64 {
    (value as i64 + rng.gen_range(-spread..=spread)).max(0)
}

fn jittered_chrome_version<R: Rng>(rng: &mut R) -> String {
    let (major, minor, build, patch) = CHROME_VERSIONS
        .choose(&mut *rng)
        .copied()
        .unwrap_or(CHROME_VERSIONS[0]);
    format!(
        "{}.{}.{}.{}",
        major,
        jitter(minor, 2, rng),
        jitter(build, 10, rng),
        jitter(patch, 50, rng)
    )
}
