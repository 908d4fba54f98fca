use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use proxy_pool_server::server::{router, AppState};
use proxy_pool_server::{ManualClock, MemoryStore, PoolSettings, ProxyPool, ProxyStatus};
use std::sync::Arc;
use tower::ServiceExt;

const NOW: i64 = 1_700_000_000;

fn setup() -> (Router, Arc<ProxyPool>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let pool = Arc::new(ProxyPool::with_clock(
        PoolSettings::builder().pools(vec!["shop", "news"]).build(),
        store.clone(),
        Arc::new(ManualClock::new(NOW)),
    ));
    let app = router(AppState::new(pool.clone(), Vec::new()));
    (app, pool, store)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

async fn post_json(app: &Router, uri: &str, json: &str) -> (StatusCode, String) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn add_select_and_report() {
    let (app, pool, _) = setup();

    let (status, _) = post_json(&app, "/add-proxies", r#"{"scraper":"shop","proxies":["1.1.1.1:80"]}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert!(pool.registry().is_empty("news"));

    let (status, proxy) = get(&app, "/get-random?scraper=shop").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(proxy, "1.1.1.1:80");
    assert_eq!(pool.index().status_of("shop", &proxy), Some(ProxyStatus::Busy));

    let (status, _) = get(&app, "/get-random?scraper=shop").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = get(&app, "/inc-good-attempts?scraper=shop&proxy=1.1.1.1:80").await;
    assert_eq!((status, body.as_str()), (StatusCode::OK, "OK"));
    assert_eq!(pool.index().status_of("shop", &proxy), Some(ProxyStatus::Good));

    get(&app, "/mark-dead?scraper=shop&proxy=1.1.1.1:80").await;
    let (_, dead) = get(&app, "/get-dead-list?scraper=shop").await;
    assert_eq!(dead, "1.1.1.1:80");
    let (_, working) = get(&app, "/get-working-list?scraper=shop").await;
    assert_eq!(working, "");
}

#[tokio::test]
async fn missing_parameters_are_forbidden() {
    let (app, _, _) = setup();
    for uri in [
        "/get-random",
        "/get-random?scraper=",
        "/inc-good-attempts?scraper=shop",
        "/mark-dead?proxy=1.1.1.1:80",
        "/reanimate",
        "/alive-from-dead",
        "/remove-dead",
        "/remove-days",
        "/max-good-attempts",
        "/get-working-list",
        "/get-dead-list",
        "/get-proxy-usefulness-stats?scraper=shop&order_by=speed",
    ] {
        let (status, _) = get(&app, uri).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{}", uri);
    }

    let (status, body) = post_json(&app, "/add-proxies", r#"{"scraper":"shop","proxies":[]}"#).await;
    assert_eq!((status, body.as_str()), (StatusCode::FORBIDDEN, "Empty proxies list"));
    let (status, _) = post_json(&app, "/remove-proxies", "not json").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn list_without_scraper_applies_to_all_pools() {
    let (app, pool, store) = setup();
    post_json(&app, "/add-proxies", r#"{"proxies":["a:1","b:1","c:1"]}"#).await;
    assert_eq!(pool.registry().len("shop"), 3);
    assert_eq!(pool.registry().len("news"), 3);
    pool.save_all().await.unwrap();

    let (status, _) = post_json(&app, "/remove-proxies", r#"{"proxies":["b:1"]}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pool.registry().len("shop"), 2);
    assert_eq!(pool.index().status_of("news", "b:1"), None);
    assert_eq!(store.len("shop"), 2);
    assert_eq!(store.len("news"), 2);

    let (_, working) = get(&app, "/get-working-list?scraper=news").await;
    assert_eq!(working, "a:1\nc:1");
}

#[tokio::test]
async fn tunables_and_revival() {
    let (app, pool, _) = setup();
    let (status, _) = get(&app, "/max-good-attempts?numbers=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pool.settings().max_good_attempts(), 2);

    let (status, _) = get(&app, "/remove-days?days=abc").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pool.settings().remove_dead_secs(), 7 * 86_400);
    get(&app, "/remove-days?days=2").await;
    assert_eq!(pool.settings().remove_dead_secs(), 2 * 86_400);

    let (status, _) = get(&app, "/remove-days?days=0").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = get(&app, "/max-good-attempts?numbers=-1").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(pool.settings().remove_dead_secs(), 2 * 86_400);
    assert_eq!(pool.settings().max_good_attempts(), 2);

    pool.ingest(Some("shop"), &["a:1".to_string()]);
    pool.report_failure("shop", "a:1");
    let (status, _) = get(&app, "/alive-from-dead?scraper=shop").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pool.index().status_of("shop", "a:1"), Some(ProxyStatus::Unchecked));
}

#[tokio::test]
async fn reports() {
    let (app, pool, _) = setup();
    pool.ingest(None, &["a:1".to_string(), "b:1".to_string()]);
    pool.report_failure("shop", "b:1");

    let (status, csv) = get(&app, "/get-proxy-usefulness-stats?scraper=shop&order_by=fail").await;
    assert_eq!(status, StatusCode::OK);
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("b:1,never,0,"));

    let (status, html) = get(&app, "/hstats").await;
    assert_eq!(status, StatusCode::OK);
    assert!(html.contains("shop"));

    let (status, json) = get(&app, "/stats").await;
    assert_eq!(status, StatusCode::OK);
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["pools"]["shop"]["counts"]["all"]["dead"], 1);
    assert_eq!(value["pools"]["news"]["counts"]["all"]["available"], 2);

    get(&app, "/clear-usefulness-stats").await;
    assert_eq!(pool.registry().get("shop", "b:1").unwrap().number_of_failures, 0);
}

#[tokio::test]
async fn stats_count_answered_requests() {
    let (app, _, _) = setup();
    get(&app, "/get-random").await;
    get(&app, "/get-random?scraper=shop").await;
    get(&app, "/").await;

    let (status, json) = get(&app, "/stats").await;
    assert_eq!(status, StatusCode::OK);
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    let requests = &value["requests"];
    assert_eq!(requests["requests"], 3);
    assert_eq!(requests["statuses"]["403"], 1);
    assert_eq!(requests["statuses"]["204"], 1);
    assert_eq!(requests["statuses"]["200"], 1);
    assert!(requests["latency_ms"]["max"].is_i64());
}

#[tokio::test]
async fn reload_without_sources_is_ok() {
    let (app, _, _) = setup();
    let (status, body) = get(&app, "/reload-proxy-list").await;
    assert_eq!((status, body.as_str()), (StatusCode::OK, "OK"));
    let (status, _) = get(&app, "/").await;
    assert_eq!(status, StatusCode::OK);
}
