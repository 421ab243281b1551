//! Article content providers.
//!
//! The browser provider goes through a stealth session so redirects and
//! client-rendered pages resolve; the HTTP provider is a plain reqwest fetch
//! used when the browser path fails. Both share the same extraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

use super::transport::{HttpClientPool, transport_error};
use super::{ArticleProvider, ProviderContext, ProviderError, screen_page, submit_token};
use crate::challenges::{ChallengeDetector, PageSignal};
use crate::modules::stealth::{Session, StealthSession};

/// Extracted text shorter than this is treated as a failed extraction.
pub const MIN_CONTENT_CHARS: usize = 200;

const CONTENT_SELECTORS: &[&str] = &[
    "div.entry-content",
    "article",
    "div.article-content",
    "div#content",
    "div.post-content",
    "div.main-content",
    "main",
    ".article-body",
];

static CONTENT: Lazy<Vec<Selector>> = Lazy::new(|| {
    CONTENT_SELECTORS
        .iter()
        .filter_map(|selector| Selector::parse(selector).ok())
        .collect()
});
static PARAGRAPH: Lazy<Option<Selector>> = Lazy::new(|| Selector::parse("p").ok());
static TITLE: Lazy<Vec<Selector>> = Lazy::new(|| {
    ["meta[property=\"og:title\"]", "h1", "title"]
        .iter()
        .filter_map(|selector| Selector::parse(selector).ok())
        .collect()
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleDocument {
    pub url: String,
    pub title: Option<String>,
    pub content: String,
    /// Provider that produced the document.
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_of(document: &Html) -> Option<String> {
    TITLE.iter().find_map(|selector| {
        let element = document.select(selector).next()?;
        let text = match element.value().attr("content") {
            Some(content) => content.trim().to_string(),
            None => element_text(element),
        };
        (!text.is_empty()).then_some(text)
    })
}

/// Pull the main text out of an HTML page. Content containers are tried in
/// order, then all paragraphs are joined.
pub fn extract_article(html: &str, url: &Url, source: &str) -> Result<ArticleDocument, ProviderError> {
    let document = Html::parse_document(html);
    let long_enough = |text: &str| text.chars().count() >= MIN_CONTENT_CHARS;

    let from_container = CONTENT.iter().find_map(|selector| {
        document
            .select(selector)
            .map(element_text)
            .find(|text| long_enough(text))
    });

    let content = match from_container {
        Some(text) => text,
        None => {
            let paragraphs = PARAGRAPH
                .as_ref()
                .map(|selector| {
                    document
                        .select(selector)
                        .map(element_text)
                        .filter(|text| !text.is_empty())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            if !long_enough(&paragraphs) {
                return Err(ProviderError::InvalidResponse(format!(
                    "no article content at {url} ({} chars)",
                    paragraphs.chars().count()
                )));
            }
            paragraphs
        }
    };

    Ok(ArticleDocument {
        url: url.to_string(),
        title: title_of(&document),
        content,
        source: source.to_string(),
        fetched_at: Utc::now(),
    })
}

/// Screen `signal` for challenges, then extract the article. On a 2xx page
/// whose only challenge evidence is an embedded widget, a successful
/// extraction wins over the widget.
fn screen_and_extract(
    detector: &ChallengeDetector,
    signal: &PageSignal,
    source: &str,
) -> Result<ArticleDocument, ProviderError> {
    match screen_page(detector, signal) {
        Ok(()) => extract_article(&signal.body, &signal.url, source),
        Err(ProviderError::ChallengeDetected(challenge))
            if (200..300).contains(&signal.status) && challenge.widget_only() =>
        {
            match extract_article(&signal.body, &signal.url, source) {
                Ok(document) => {
                    log::debug!("ignoring embedded {:?} widget on {}", challenge.challenge_type, signal.url);
                    Ok(document)
                }
                Err(_) => Err(ProviderError::ChallengeDetected(challenge)),
            }
        }
        Err(err) => Err(err),
    }
}

pub const BROWSER_NAME: &str = "article_browser";
pub const HTTP_NAME: &str = "article_http";

/// Fetches articles through a stealth session.
#[derive(Debug)]
pub struct BrowserArticleProvider {
    stealth: Arc<StealthSession>,
    detector: ChallengeDetector,
}

impl BrowserArticleProvider {
    pub fn new(stealth: Arc<StealthSession>) -> Self {
        Self {
            stealth,
            detector: ChallengeDetector::default(),
        }
    }

    pub fn with_detector(mut self, detector: ChallengeDetector) -> Self {
        self.detector = detector;
        self
    }

    async fn run(
        &self,
        session: &mut Session,
        url: &Url,
        ctx: &ProviderContext<'_>,
    ) -> Result<ArticleDocument, ProviderError> {
        if let Some(token) = ctx.captcha_token {
            submit_token(session, &self.detector, token).await?;
        }
        let signal = session.navigate(url).await?;
        screen_and_extract(&self.detector, &signal, BROWSER_NAME)
    }
}

#[async_trait]
impl ArticleProvider for BrowserArticleProvider {
    fn name(&self) -> &'static str {
        BROWSER_NAME
    }

    async fn fetch_article(&self, url: &Url, ctx: &ProviderContext<'_>) -> Result<ArticleDocument, ProviderError> {
        let proxy = ctx.acquire_proxy()?;
        let mut session = match self.stealth.open(proxy.clone(), ctx.cancel).await {
            Ok(session) => session,
            Err(err) => {
                let outcome = Err(ProviderError::from(err));
                ctx.report_proxy(proxy.as_ref(), &outcome);
                return outcome;
            }
        };

        let outcome = self.run(&mut session, url, ctx).await;
        if let Err(err) = session.close().await {
            log::debug!("article session close failed: {}", err);
        }
        ctx.report_proxy(proxy.as_ref(), &outcome);
        outcome
    }
}

/// Fetches articles with a plain HTTP request.
#[derive(Debug, Default)]
pub struct HttpArticleProvider {
    clients: HttpClientPool,
    detector: ChallengeDetector,
}

impl HttpArticleProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clients(mut self, clients: HttpClientPool) -> Self {
        self.clients = clients;
        self
    }

    async fn fetch(&self, client: &reqwest::Client, url: &Url, ctx: &ProviderContext<'_>) -> Result<ArticleDocument, ProviderError> {
        let response = client
            .get(url.as_str())
            .timeout(ctx.timeout)
            .send()
            .await
            .map_err(|err| transport_error(err, ctx.timeout))?;
        let final_url = response.url().clone();
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|err| transport_error(err, ctx.timeout))?;

        let signal = PageSignal::new(final_url, status, body).with_headers(headers);
        screen_and_extract(&self.detector, &signal, HTTP_NAME)
    }
}

#[async_trait]
impl ArticleProvider for HttpArticleProvider {
    fn name(&self) -> &'static str {
        HTTP_NAME
    }

    async fn fetch_article(&self, url: &Url, ctx: &ProviderContext<'_>) -> Result<ArticleDocument, ProviderError> {
        let proxy = ctx.acquire_proxy()?;
        let client = self.clients.client(proxy.as_ref()).await?;
        self.clients.throttle(ctx.cancel).await?;
        let outcome = self.fetch(&client, url, ctx).await;
        ctx.report_proxy(proxy.as_ref(), &outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::CancelSignal;
    use crate::modules::stealth::StealthConfig;
    use crate::modules::stealth::testing::ScriptedDriver;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn long_text(word: &str) -> String {
        vec![word; 60].join(" ")
    }

    fn page(body: &str) -> String {
        format!(
            "<html><head><title>IRCC news</title></head><body><nav>menu</nav>{body}<footer>footer</footer></body></html>"
        )
    }

    #[test]
    fn prefers_content_containers() {
        let html = page(&format!(
            "<h1>Express Entry draw</h1><div class=\"entry-content\"><p>{}</p></div><p>sidebar</p>",
            long_text("invitation")
        ));
        let url = Url::parse("https://example.ca/news/draw").unwrap();
        let doc = extract_article(&html, &url, HTTP_NAME).unwrap();
        assert!(doc.content.starts_with("invitation"));
        assert!(!doc.content.contains("sidebar"));
        assert_eq!(doc.title.as_deref(), Some("Express Entry draw"));
    }

    #[test]
    fn falls_back_to_paragraphs_and_rejects_short_pages() {
        let url = Url::parse("https://example.ca/post").unwrap();
        let html = page(&format!("<p>{}</p><p>{}</p>", long_text("permit"), long_text("visa")));
        let doc = extract_article(&html, &url, HTTP_NAME).unwrap();
        assert_eq!(doc.content.lines().count(), 2);
        assert_eq!(doc.title.as_deref(), Some("IRCC news"));

        let err = extract_article(&page("<p>too short</p>"), &url, HTTP_NAME).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn http_provider_fetches_and_extracts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/news/pgwp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(page(&format!("<article>{}</article>", long_text("pgwp"))), "text/html"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = HttpArticleProvider::new();
        let cancel = CancelSignal::never();
        let ctx = ProviderContext::detached(&cancel, Duration::from_secs(5));

        let url = Url::parse(&format!("{}/news/pgwp", server.uri())).unwrap();
        let doc = provider.fetch_article(&url, &ctx).await.unwrap();
        assert_eq!(doc.source, HTTP_NAME);
        assert!(doc.content.contains("pgwp pgwp"));

        let gone = Url::parse(&format!("{}/gone", server.uri())).unwrap();
        assert!(matches!(
            provider.fetch_article(&gone, &ctx).await,
            Err(ProviderError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn comment_recaptcha_does_not_block_article() {
        let server = MockServer::start().await;
        let widget = r#"<form id="comments"><div class="g-recaptcha" data-sitekey="6Lc-comments"></div></form>
            <script src="https://www.google.com/recaptcha/api.js"></script>"#;
        Mock::given(method("GET"))
            .and(path("/news/draw"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                page(&format!("<article>{}</article>{widget}", long_text("draw"))),
                "text/html",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gate"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(page(widget), "text/html"))
            .mount(&server)
            .await;

        let provider = HttpArticleProvider::new();
        let cancel = CancelSignal::never();
        let ctx = ProviderContext::detached(&cancel, Duration::from_secs(5));

        let url = Url::parse(&format!("{}/news/draw", server.uri())).unwrap();
        let doc = provider.fetch_article(&url, &ctx).await.unwrap();
        assert!(doc.content.contains("draw draw"));

        let gate = Url::parse(&format!("{}/gate", server.uri())).unwrap();
        assert!(matches!(
            provider.fetch_article(&gate, &ctx).await,
            Err(ProviderError::ChallengeDetected(_))
        ));
    }

    #[tokio::test]
    async fn browser_provider_uses_session() {
        let url = Url::parse("https://news.example.ca/story").unwrap();
        let driver = Arc::new(ScriptedDriver::default().with_page(
            url.as_str(),
            200,
            &page(&format!("<main>{}</main>", long_text("sponsorship"))),
        ));
        let stealth = StealthSession::new(driver.clone(), StealthConfig::immediate()).unwrap();
        let provider = BrowserArticleProvider::new(Arc::new(stealth));
        let cancel = CancelSignal::never();
        let ctx = ProviderContext::detached(&cancel, Duration::from_secs(5));

        let doc = provider.fetch_article(&url, &ctx).await.unwrap();
        assert_eq!(doc.source, BROWSER_NAME);
        assert!(doc.content.contains("sponsorship"));
        assert_eq!(driver.closes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
