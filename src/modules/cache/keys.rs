//! Cache key normalization.

use url::Url;

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Key for a trend score: keyword is case-folded, geo upper-cased, and
/// whitespace collapsed in every part.
pub fn trend(keyword: &str, geo: &str, timeframe: &str) -> String {
    format!(
        "trend::{}::{}::{}",
        collapse_whitespace(keyword).to_lowercase(),
        collapse_whitespace(geo).to_uppercase(),
        collapse_whitespace(timeframe)
    )
}

/// Key for article content: the URL without fragment or trailing slash.
pub fn article(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let trimmed = normalized.path().trim_end_matches('/').to_string();
    normalized.set_path(&trimmed);

    let mut key = normalized.to_string();
    if normalized.query().is_none() {
        while key.ends_with('/') {
            key.pop();
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trend_keys_ignore_case_and_spacing() {
        assert_eq!(
            trend("  Express   Entry ", "ca", "now 7-d"),
            trend("express entry", "CA", "now  7-d")
        );
        assert_eq!(trend("PNP", "CA", "today 1-m"), "trend::pnp::CA::today 1-m");
    }

    #[test]
    fn article_keys_drop_fragment_and_trailing_slash() {
        let a = Url::parse("https://News.Example.com/2024/draw/#comments").unwrap();
        let b = Url::parse("https://news.example.com/2024/draw").unwrap();
        assert_eq!(article(&a), article(&b));
        assert_eq!(article(&b), "https://news.example.com/2024/draw");

        let root = Url::parse("https://example.com/").unwrap();
        assert_eq!(article(&root), "https://example.com");

        let query = Url::parse("https://example.com/post/?id=7").unwrap();
        assert_eq!(article(&query), "https://example.com/post?id=7");
    }
}
