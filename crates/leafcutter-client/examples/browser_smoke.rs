/// Smoke-test for `BrowserFetcher`.
///
/// Launches a headless Chromium, renders <https://example.com>, and checks
/// the page came back as HTML containing the expected `<h1>`.
///
/// Run with:
///   cargo run -p leafcutter-client --example browser_smoke --features browser
use std::sync::Arc;

use leafcutter_client::BrowserFetcher;
use leafcutter_core::models::{FetchRequest, FetchStrategy, Payload, Target};
use leafcutter_core::traits::Fetcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    println!("Launching headless browser...");
    let fetcher = BrowserFetcher::new().await?;

    let target = Arc::new(Target::new("https://example.com", FetchStrategy::Browser)?);
    println!("Rendering {} ...", target.domain);
    let response = fetcher.fetch(&FetchRequest::first(target, None)).await?;

    let Payload::Html(html) = &response.payload else {
        anyhow::bail!("expected an HTML payload, got {}", response.payload.kind());
    };
    anyhow::ensure!(
        html.contains("<h1>Example Domain</h1>"),
        "Expected <h1> not found in rendered HTML"
    );

    println!(
        "OK: {} bytes of rendered HTML from {} in {:?}",
        html.len(),
        response.final_url,
        response.elapsed
    );
    Ok(())
}
