//! HTTP interface used by the scraping clients.
//!
//! Every route takes its arguments from the query string; `scraper` names
//! the pool. A missing argument answers `403` with a short message. Every
//! answered request is counted in [`RequestMetrics`].

use crate::config::SourceConfig;
use crate::pool::ProxyPool;
use crate::proxy::ProxyStatus;
use crate::scheduler::reload_proxies;
use crate::stats::{PoolTimings, PopulationCounts, TimingSummary, UsefulnessOrder};
use crate::telemetry::{RequestMetrics, RequestReport};

use axum::{
    extract::{Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::info;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<ProxyPool>,
    pub sources: Arc<Vec<SourceConfig>>,
    pub client: Client,
    pub requests: Arc<RequestMetrics>,
}

impl AppState {
    pub fn new(pool: Arc<ProxyPool>, sources: Vec<SourceConfig>) -> Self {
        Self {
            pool,
            sources: Arc::new(sources),
            client: Client::new(),
            requests: Arc::new(RequestMetrics::new()),
        }
    }
}

/// Build the router with every route.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_page))
        .route("/get-random", get(get_random))
        .route("/inc-good-attempts", get(inc_good_attempts))
        .route("/mark-dead", get(mark_dead))
        .route("/reanimate", get(reanimate))
        .route("/alive-from-dead", get(alive_from_dead))
        .route("/remove-dead", get(remove_dead))
        .route("/remove-days", get(remove_days))
        .route("/max-good-attempts", get(max_good_attempts))
        .route("/reload-proxy-list", get(reload_proxy_list))
        .route("/get-working-list", get(get_working_list))
        .route("/get-dead-list", get(get_dead_list))
        .route("/get-proxy-usefulness-stats", get(get_usefulness_stats))
        .route("/clear-usefulness-stats", get(clear_usefulness_stats))
        .route("/hstats", get(html_stats))
        .route("/stats", get(json_stats))
        .route("/add-proxies", post(add_proxies))
        .route("/remove-proxies", post(remove_proxies))
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state)
}

async fn track_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let response = next.run(request).await;
    state.requests.record(response.status().as_u16(), started.elapsed());
    response
}

/// Serve until ctrl-c.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    info!("HTTP server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    } else {
        // no signal handler; run until the task is dropped
        std::future::pending::<()>().await;
    }
}

#[derive(Debug, Default, Deserialize)]
struct Params {
    scraper: Option<String>,
    proxy: Option<String>,
    days: Option<String>,
    numbers: Option<String>,
    order_by: Option<String>,
}

fn forbidden(message: &'static str) -> Response {
    (StatusCode::FORBIDDEN, message).into_response()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

fn ok() -> Response {
    (StatusCode::OK, "OK").into_response()
}

async fn index_page() -> &'static str {
    "proxy pool server"
}

async fn get_random(State(state): State<AppState>, Query(params): Query<Params>) -> Response {
    let Some(scraper) = non_empty(params.scraper) else {
        return forbidden("Field scraper is empty");
    };
    match state.pool.select(&scraper) {
        Ok(proxy) => (StatusCode::OK, proxy).into_response(),
        Err(_) => StatusCode::NO_CONTENT.into_response(),
    }
}

fn scraper_and_proxy(params: Params) -> Result<(String, String), Response> {
    match (non_empty(params.scraper), non_empty(params.proxy)) {
        (Some(scraper), Some(proxy)) => Ok((scraper, proxy)),
        _ => Err(forbidden("Field scraper or proxy is empty")),
    }
}

async fn inc_good_attempts(State(state): State<AppState>, Query(params): Query<Params>) -> Response {
    match scraper_and_proxy(params) {
        Ok((scraper, proxy)) => {
            state.pool.report_success(&scraper, &proxy);
            ok()
        }
        Err(response) => response,
    }
}

async fn mark_dead(State(state): State<AppState>, Query(params): Query<Params>) -> Response {
    match scraper_and_proxy(params) {
        Ok((scraper, proxy)) => {
            state.pool.report_failure(&scraper, &proxy);
            ok()
        }
        Err(response) => response,
    }
}

async fn reanimate(State(state): State<AppState>, Query(params): Query<Params>) -> Response {
    let Some(scraper) = non_empty(params.scraper) else {
        return forbidden("Field scraper is empty");
    };
    state.pool.reconcile(&scraper);
    state.pool.persist_removals().await;
    ok()
}

async fn alive_from_dead(State(state): State<AppState>, Query(params): Query<Params>) -> Response {
    let Some(scraper) = non_empty(params.scraper) else {
        return forbidden("Field scraper is empty");
    };
    state.pool.revive_dead(&scraper);
    ok()
}

async fn remove_dead(State(state): State<AppState>, Query(params): Query<Params>) -> Response {
    let Some(scraper) = non_empty(params.scraper) else {
        return forbidden("Field scraper is empty");
    };
    state.pool.purge_dead(&scraper);
    state.pool.persist_removals().await;
    ok()
}

/// Unparseable values are ignored; values below one are refused.
async fn remove_days(State(state): State<AppState>, Query(params): Query<Params>) -> Response {
    let Some(days) = non_empty(params.days) else {
        return forbidden("Field days is empty");
    };
    if let Ok(days) = days.parse::<i64>() {
        if !state.pool.set_remove_dead_days(days) {
            return forbidden("Field days must be positive");
        }
    }
    ok()
}

/// Unparseable values are ignored; values below one are refused.
async fn max_good_attempts(State(state): State<AppState>, Query(params): Query<Params>) -> Response {
    let Some(numbers) = non_empty(params.numbers) else {
        return forbidden("Field numbers is empty");
    };
    if let Ok(attempts) = numbers.parse::<i32>() {
        if !state.pool.set_max_good_attempts(attempts) {
            return forbidden("Field numbers must be positive");
        }
    }
    ok()
}

async fn reload_proxy_list(State(state): State<AppState>) -> Response {
    reload_proxies(&state.pool, &state.client, &state.sources).await;
    ok()
}

async fn get_working_list(State(state): State<AppState>, Query(params): Query<Params>) -> Response {
    let Some(scraper) = non_empty(params.scraper) else {
        return forbidden("Field scraper is empty");
    };
    state.pool.list_working(&scraper).join("\n").into_response()
}

async fn get_dead_list(State(state): State<AppState>, Query(params): Query<Params>) -> Response {
    let Some(scraper) = non_empty(params.scraper) else {
        return forbidden("Field scraper is empty");
    };
    state
        .pool
        .list_by_status(&scraper, ProxyStatus::Dead)
        .join("\n")
        .into_response()
}

async fn get_usefulness_stats(State(state): State<AppState>, Query(params): Query<Params>) -> Response {
    let order = params.order_by.as_deref().unwrap_or("name").parse::<UsefulnessOrder>();
    let (Some(scraper), Ok(order)) = (non_empty(params.scraper), order) else {
        return forbidden("Field scraper is empty or wrong orderBy");
    };

    let csv = state.pool.usefulness_csv(&scraper, order);
    let file_name = format!("{}_{}_proxy_stats.csv", scraper, state.pool.now());
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        csv,
    )
        .into_response()
}

async fn clear_usefulness_stats(State(state): State<AppState>) -> Response {
    state.pool.clear_usage_telemetry();
    ok()
}

async fn html_stats(State(state): State<AppState>) -> Html<String> {
    Html(state.pool.html_stats())
}

/// State of one pool in the `/stats` report.
#[derive(Debug, Serialize)]
pub struct PoolReport {
    pub counts: PopulationCounts,
    pub timings: PoolTimings,
    pub busy_wait: TimingSummary,
}

/// Body of `/stats`.
#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub pools: BTreeMap<String, PoolReport>,
    pub requests: RequestReport,
}

async fn json_stats(State(state): State<AppState>) -> Json<StatsReport> {
    let pool = &state.pool;
    let pools = pool
        .pools()
        .iter()
        .map(|name| {
            let report = PoolReport {
                counts: pool.population_counts(name),
                timings: pool.timings(name),
                busy_wait: pool.busy_wait_summary(name),
            };
            (name.clone(), report)
        })
        .collect();
    Json(StatsReport {
        pools,
        requests: state.requests.report(),
    })
}

/// Body of `/add-proxies` and `/remove-proxies`. Without `scraper` the list
/// applies to every pool.
#[derive(Debug, Deserialize)]
pub struct ProxyListBody {
    #[serde(default)]
    pub scraper: Option<String>,
    #[serde(default)]
    pub proxies: Vec<String>,
}

fn parse_list_body(body: &[u8]) -> Result<(Option<String>, Vec<String>), Response> {
    let body: ProxyListBody =
        serde_json::from_slice(body).map_err(|_| forbidden("Something went wrong"))?;
    if body.proxies.is_empty() {
        return Err(forbidden("Empty proxies list"));
    }
    Ok((non_empty(body.scraper), body.proxies))
}

async fn add_proxies(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
    match parse_list_body(&body) {
        Ok((scraper, proxies)) => {
            state.pool.ingest(scraper.as_deref(), &proxies);
            ok()
        }
        Err(response) => response,
    }
}

async fn remove_proxies(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
    match parse_list_body(&body) {
        Ok((scraper, proxies)) => {
            state.pool.remove_many(scraper.as_deref(), &proxies);
            state.pool.persist_removals().await;
            ok()
        }
        Err(response) => response,
    }
}
