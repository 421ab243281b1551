use std::error::Error;
use std::io::{self, Write};

use trendscraper_rs::{AcquisitionSettings, CONTENT_FETCH_STAGE, TrendScraper, VERSION};

fn prompt(label: &str) -> io::Result<String> {
    print!("{} ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn parse_bool(input: &str, default: bool) -> bool {
    match input.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" => true,
        "n" | "no" | "false" => false,
        _ => default,
    }
}

fn or_default(input: String, default: &str) -> String {
    if input.is_empty() { default.to_string() } else { input }
}

#[tokio::test]
#[ignore = "Requires network access and manual input"]
async fn interactive_acquisition() -> Result<(), Box<dyn Error>> {
    println!("trendscraper-rs {} interactive smoke test", VERSION);
    println!("Settings come from the environment; press Enter to accept defaults.\n");

    let mut settings = AcquisitionSettings::from_env()?;
    let keyword = or_default(prompt("Keyword [Express Entry]:")?, "Express Entry");
    let geo = or_default(prompt(&format!("Geo [{}]:", settings.trends.geo))?, "");
    let timeframe = or_default(prompt(&format!("Timeframe [{}]:", settings.trends.timeframe))?, "");
    let article = or_default(prompt("Article URL [https://www.canada.ca/en/immigration-refugees-citizenship/news.html]:")?,
        "https://www.canada.ca/en/immigration-refugees-citizenship/news.html");
    let use_serpapi = prompt("Use SerpAPI when a key is set? (Y/n):")?;
    settings.providers.use_serpapi = parse_bool(&use_serpapi, settings.providers.use_serpapi);

    let scraper = TrendScraper::builder().with_settings(settings).build()?;

    let score = scraper.get_trend_score(&keyword, &geo, &timeframe).await;
    println!(
        "score {} from {} (estimated: {}, cached: {})",
        score.value, score.source, score.estimated, score.cached
    );

    let content = scraper.get_article_content(&article).await;
    match content.document() {
        Some(document) => println!(
            "article '{}' via {}: {} chars",
            document.title.as_deref().unwrap_or("<untitled>"),
            document.source,
            document.content.chars().count()
        ),
        None => println!("article unavailable: {:?}", content),
    }
    if let Some(key) = TrendScraper::article_key(&article) {
        println!("{} marked: {}", CONTENT_FETCH_STAGE, scraper.is_processed(&key, CONTENT_FETCH_STAGE));
    }

    for (provider, stats) in scraper.provider_stats() {
        println!(
            "{provider}: {} ok / {} soft / {} hard / {} challenges, avg {:?}",
            stats.successes,
            stats.soft_failures,
            stats.hard_failures,
            stats.challenges,
            stats.average_latency()
        );
    }
    if let Some(health) = scraper.proxy_health() {
        println!(
            "proxies: {} available / {} blacklisted / {} at ceiling",
            health.available_proxies, health.blacklisted_proxies, health.at_ceiling
        );
    }
    Ok(())
}
