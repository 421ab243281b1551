use http::HeaderMap;
use url::Url;

/// What a navigation produced: enough of the page to decide whether a
/// verification challenge was served and, if not, to extract content.
#[derive(Debug, Clone)]
pub struct PageSignal {
    pub url: Url,
    pub status: u16,
    pub headers: HeaderMap,
    pub content_type: Option<String>,
    pub body: String,
}

impl PageSignal {
    pub fn new(url: Url, status: u16, body: impl Into<String>) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            content_type: None,
            body: body.into(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.content_type = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        self.headers = headers;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_html(&self) -> bool {
        match &self.content_type {
            Some(content_type) => content_type.contains("html"),
            None => self.body.trim_start().starts_with('<'),
        }
    }
}
