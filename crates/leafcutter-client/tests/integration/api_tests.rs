use leafcutter_core::error::ScrapeError;
use leafcutter_core::models::{FetchStrategy, Pagination, Target};
use leafcutter_core::result::RunStatus;
use leafcutter_core::schema::{ExtractionRule, Schema, Transform};
use leafcutter_core::Ant;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{CONTACT, runner};

fn filings_ant(server: &MockServer) -> Ant {
    let target = Target::endpoint(&server.uri(), "/api/filings", FetchStrategy::JsonApi)
        .unwrap()
        .with_query("form", "10-K")
        .with_pagination(Pagination::PageNumber {
            param: "page".into(),
            start: 1,
        })
        .requiring_contact();
    let schema = Schema::new("filings")
        .with_items("data.filings")
        .required_field("company", ExtractionRule::new("company"))
        .field("revenue", ExtractionRule::new("revenue"))
        .transform(Transform::Number);
    Ant::new("filings", target, schema)
}

#[tokio::test]
async fn walks_page_numbers_until_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "filings": [{ "company": "Globex", "revenue": "$2,500" }] }
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("page", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "filings": [] } })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/filings"))
        .and(query_param("form", "10-K"))
        .and(header("from", CONTACT))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "filings": [
                { "company": "Acme", "revenue": "1,000" },
                { "company": "Initech" }
            ] }
        })))
        .mount(&server)
        .await;

    let result = runner(Some(CONTACT))
        .run(&filings_ant(&server), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.stats.pages_fetched, 3);
    let companies: Vec<String> = result.records.iter().filter_map(|r| r.text("company")).collect();
    assert_eq!(companies, ["Acme", "Initech", "Globex"]);
    assert_eq!(result.records[0].get("revenue"), Some(&json!(1000)));
    assert_eq!(result.records[2].get("revenue"), Some(&json!(2500)));
    assert_eq!(result.records[1].get("revenue"), None);
}

#[tokio::test]
async fn missing_contact_rejected_before_any_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let err = runner(None)
        .run(&filings_ant(&server), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ScrapeError::Config(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn probe_reports_reachability() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(&server)
        .await;

    let ant = filings_ant(&server);
    let report = runner(Some(CONTACT)).probe(&ant.target).await;
    assert!(report.reachable);
    assert_eq!(report.status, Some(200));

    let down = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&down)
        .await;
    let report = runner(Some(CONTACT)).probe(&filings_ant(&down).target).await;
    assert!(!report.reachable);
    assert!(report.message.is_some());
}
