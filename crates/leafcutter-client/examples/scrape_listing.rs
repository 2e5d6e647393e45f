/// Scrape a paginated listing and print the records as JSON Lines.
///
/// Walks the Hacker News front page through its "More" links, three pages
/// at most, and writes one JSON object per story to stdout. The run summary
/// goes to stderr.
///
/// Run with:
///   LEAFCUTTER_CONTACT=you@example.com cargo run -p leafcutter-client --example scrape_listing
use leafcutter_client::{DocumentEvaluator, StrategyFetcher};
use leafcutter_core::dedup::FieldKey;
use leafcutter_core::models::{FetchStrategy, Pagination, Target};
use leafcutter_core::output::write_json_lines;
use leafcutter_core::schema::{ExtractionRule, Schema, Transform};
use leafcutter_core::{Ant, AntRunner, EngineConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"{
    "rate_limit": { "requests_per_second": 1.0, "burst": 1 },
    "domain_rate_limits": {},
    "max_pages": 3,
    "max_records": 500,
    "retry": { "max_retries": 2, "base_delay_ms": 500, "max_delay_ms": 4000 },
    "dedup_merge": "disabled",
    "contact": null
}"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::from_json_str(CONFIG)?.with_contact_from_env();

    let target = Target::new("https://news.ycombinator.com/news", FetchStrategy::StaticHttp)?
        .with_pagination(Pagination::NextLink);
    let schema = Schema::new("hn-stories")
        .with_items("tr.athing")
        .required_field("title", ExtractionRule::new("span.titleline > a"))
        .transform(Transform::CollapseWhitespace)
        .required_field("url", ExtractionRule::new("span.titleline > a").attr("href"))
        .transform(Transform::AbsoluteUrl)
        .field("rank", ExtractionRule::new("span.rank"))
        .transform(Transform::Integer)
        .with_next_page(ExtractionRule::new("a.morelink").attr("href"));

    let ant = Ant::new("hn-front-page", target, schema).with_dedup_key(FieldKey::new(["url"]));
    let runner = AntRunner::new(StrategyFetcher::standard()?, DocumentEvaluator::new(), &config)?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let result = runner.run(&ant, &cancel).await?;
    let written = write_json_lines(&result.records, std::io::stdout().lock())?;

    eprintln!("{}", serde_json::to_string_pretty(&result.summary())?);
    eprintln!("wrote {written} records ({})", result.status);
    Ok(())
}
