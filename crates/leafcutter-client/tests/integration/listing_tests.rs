use leafcutter_core::dedup::FieldKey;
use leafcutter_core::error::ErrorKind;
use leafcutter_core::models::{FetchStrategy, Pagination, Target};
use leafcutter_core::result::RunStatus;
use leafcutter_core::schema::{ExtractionRule, Schema, Transform};
use leafcutter_core::Ant;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{listing_page, runner};

fn html(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.into_bytes(), "text/html")
}

fn jobs_ant(server: &MockServer) -> Ant {
    let target = Target::new(&format!("{}/jobs", server.uri()), FetchStrategy::StaticHttp)
        .unwrap()
        .with_pagination(Pagination::NextLink);
    let schema = Schema::new("jobs")
        .with_items("li.job")
        .required_field("title", ExtractionRule::new("h2"))
        .field("url", ExtractionRule::new("a").attr("href"))
        .transform(Transform::AbsoluteUrl)
        .with_next_page(ExtractionRule::new("a.next").attr("href"));
    Ant::new("jobs", target, schema).with_dedup_key(FieldKey::new(["url"]))
}

#[tokio::test]
async fn follows_next_links_and_deduplicates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jobs"))
        .and(query_param("page", "2"))
        .respond_with(html(listing_page(&["Data Analyst", "QA Lead"], None)))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs"))
        .respond_with(html(listing_page(
            &["Rust Engineer", "Data Analyst"],
            Some("/jobs?page=2"),
        )))
        .mount(&server)
        .await;

    let result = runner(None)
        .run(&jobs_ant(&server), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.stats.pages_fetched, 2);
    assert_eq!(result.stats.records_found, 4);
    assert_eq!(result.stats.duplicates_dropped, 1);

    let titles: Vec<String> = result.records.iter().filter_map(|r| r.text("title")).collect();
    assert_eq!(titles, ["Rust Engineer", "Data Analyst", "QA Lead"]);
    assert_eq!(
        result.records[0].text("url").as_deref(),
        Some(format!("{}/jobs/rust-engineer", server.uri()).as_str())
    );
    assert_eq!(result.records[2].provenance.page, 2);
}

#[tokio::test]
async fn blocked_second_page_keeps_first_page_records() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jobs"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(403))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs"))
        .respond_with(html(listing_page(&["Rust Engineer"], Some("/jobs?page=2"))))
        .mount(&server)
        .await;

    let result = runner(None)
        .run(&jobs_ant(&server), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Partial);
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].page, 2);
    assert_eq!(result.errors[0].kind, ErrorKind::Blocked);
    // Blocked pages are not retried.
    assert_eq!(result.stats.retries, 0);
}

#[tokio::test]
async fn transient_failure_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(html(listing_page(&["Rust Engineer"], None)))
        .mount(&server)
        .await;

    let result = runner(None)
        .run(&jobs_ant(&server), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.stats.retries, 1);
    assert_eq!(result.records.len(), 1);
}

#[tokio::test]
async fn rate_limited_response_slows_the_domain() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(html(listing_page(&["Rust Engineer"], None)))
        .mount(&server)
        .await;

    let runner = runner(None);
    let ant = jobs_ant(&server);
    let result = runner.run(&ant, &CancellationToken::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.stats.requests, 2);
    assert_eq!(result.stats.requests_succeeded, 1);
    assert_eq!(result.stats.success_rate(), 0.5);
    let rate = runner.rate_limiter().current_rate(&ant.target.domain);
    assert!(rate < 200.0, "rate stayed at {rate}");
}

#[tokio::test]
async fn table_listing_rows_are_extracted() {
    let server = MockServer::start().await;
    let page = r#"<html><body><table>
        <tr class="athing"><td class="rank">1.</td><td><span class="titleline"><a href="/item?id=1">First story</a></span></td></tr>
        <tr class="athing"><td class="rank">2.</td><td><span class="titleline"><a href="/item?id=2">Second story</a></span></td></tr>
    </table></body></html>"#;
    Mock::given(method("GET"))
        .and(path("/news"))
        .respond_with(html(page.to_string()))
        .mount(&server)
        .await;

    let target = Target::new(&format!("{}/news", server.uri()), FetchStrategy::StaticHttp).unwrap();
    let schema = Schema::new("stories")
        .with_items("tr.athing")
        .required_field("title", ExtractionRule::new("span.titleline > a"))
        .field("rank", ExtractionRule::new("td.rank"));
    let ant = Ant::new("stories", target, schema).with_dedup_key(FieldKey::new(["title"]));

    let result = runner(None).run(&ant, &CancellationToken::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.records.len(), 2);
    assert_eq!(result.records[1].get("title"), Some(&serde_json::json!("Second story")));
    assert_eq!(result.records[0].get("rank"), Some(&serde_json::json!("1.")));
}

#[tokio::test]
async fn captcha_page_fails_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(html("<html><title>Are you a robot?</title></html>".into()))
        .mount(&server)
        .await;

    let result = runner(None)
        .run(&jobs_ant(&server), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failure);
    assert!(result.records.is_empty());
    assert_eq!(result.errors[0].kind, ErrorKind::Blocked);
}

#[tokio::test]
async fn cancelled_run_makes_no_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(html(listing_page(&["Rust Engineer"], None)))
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = runner(None).run(&jobs_ant(&server), &cancel).await.unwrap();

    assert_eq!(result.status, RunStatus::Cancelled);
    assert!(server.received_requests().await.unwrap().is_empty());
}
