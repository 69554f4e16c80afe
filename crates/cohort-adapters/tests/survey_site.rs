use std::time::Duration;

use axum::{extract::Path, http::StatusCode, response::Html, routing::get, Router};
use cohort_adapters::{extract_candidate, FetchOutcome, ResultSource, SurveySiteSource};
use cohort_storage::{HttpClientConfig, HttpFetcher, RetryPolicy};

const RESULT_PAGE: &str = include_str!("../../../fixtures/survey/result_page.html");
const PLACEHOLDER_PAGE: &str = include_str!("../../../fixtures/survey/placeholder_page.html");
const LISTING_PAGE: &str = include_str!("../../../fixtures/survey/survey_listing.html");

async fn result(Path(id): Path<u64>) -> (StatusCode, Html<&'static str>) {
    match id {
        986512 => (StatusCode::OK, Html(RESULT_PAGE)),
        986530 => (StatusCode::OK, Html(PLACEHOLDER_PAGE)),
        986531 => (StatusCode::BAD_GATEWAY, Html("upstream hiccup")),
        _ => (StatusCode::NOT_FOUND, Html("missing")),
    }
}

async fn spawn_site() -> String {
    let app = Router::new()
        .route("/survey/", get(|| async { Html(LISTING_PAGE) }))
        .route("/result/{id}", get(result));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn source(base_url: &str) -> SurveySiteSource {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
        ..Default::default()
    })
    .unwrap();
    SurveySiteSource::new(http, base_url)
}

#[tokio::test]
async fn fetch_classifies_every_page_kind() {
    let base = spawn_site().await;
    let source = source(&base);

    match source.fetch(986512).await {
        FetchOutcome::Valid(page) => {
            assert_eq!(page.entry_id, 986512);
            assert_eq!(page.url, format!("{base}/result/986512"));
            let record = extract_candidate(&page.html, &page.url, None).unwrap();
            assert_eq!(record.university.as_deref(), Some("Johns Hopkins University"));
        }
        other => panic!("expected a valid page, got {other:?}"),
    }
    assert_eq!(source.fetch(986530).await, FetchOutcome::Placeholder);
    assert_eq!(source.fetch(1).await, FetchOutcome::NotFound);
    assert!(matches!(
        source.fetch(986531).await,
        FetchOutcome::TransientError(_)
    ));
}

#[tokio::test]
async fn listing_reads_the_survey_page() {
    let base = spawn_site().await;
    let listing = source(&base).listing().await.unwrap();
    assert_eq!(listing.latest_id, 986530);
    assert_eq!(listing.added_on.len(), 2);
}

#[tokio::test]
async fn unreachable_listing_is_upstream_unavailable() {
    let err = source("http://127.0.0.1:9").listing().await.unwrap_err();
    assert!(matches!(
        err,
        cohort_adapters::AdapterError::UpstreamUnavailable(_)
    ));
}
