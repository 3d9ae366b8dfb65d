//! Authenticated HTTP API surface.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderValue},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::info;

use crate::cache::{InsightCache, TTL_DISTRIBUTION, TTL_RECOMMENDATION};
use crate::error::ApiError;
use crate::event::now_unix;
use crate::insights;
use crate::npub;
use crate::pool::PoolHealth;
use crate::registry::TenantRegistry;
use crate::scanner::Scanner;
use crate::store::{generate_token, PostSort, Store, Tenant, Tier};
use crate::timing;

/// Everything the handlers need.
pub struct ApiContext {
    pub store: Store,
    pub cache: InsightCache,
    pub scanner: Scanner,
    pub registry: Arc<TenantRegistry>,
    pub pool_health: Arc<PoolHealth>,
    pub dispatch_notify: Arc<Notify>,
    pub rate_limit_free: u32,
    pub rate_limit_premium: u32,
}

/// Build the full route table.
pub fn router(ctx: Arc<ApiContext>) -> Router {
    let protected = Router::new()
        .route("/auth/me", get(auth_me))
        .route("/auth/webhook", put(auth_webhook))
        .route("/metrics/summary", get(metrics_summary))
        .route("/metrics/followers", get(metrics_followers))
        .route("/metrics/posts", get(metrics_posts))
        .route("/metrics/timing/network-activity", get(network_activity))
        .route("/insights/best-posting-times", get(best_posting_times))
        .route("/insights/top-engagers", get(top_engagers))
        .route("/insights/should-engage", get(should_engage))
        .route("/insights/posting-strategy", get(posting_strategy))
        .route("/events/activity", get(events_activity))
        .route("/events/acknowledge", post(acknowledge))
        .route("/network/top-engagers", get(top_engagers))
        .route("/network/follow-suggestions", get(follow_suggestions))
        .route("/admin/scan-network", post(scan_network))
        .route("/admin/aggregate-activity", post(aggregate_activity))
        .route_layer(middleware::from_fn_with_state(ctx.clone(), guard));
    Router::new()
        .route("/auth/register", post(register))
        .route("/metrics/timing/quick-scan", get(quick_scan))
        .route("/health", get(health))
        .merge(protected)
        .with_state(ctx)
}

/// Serve the API until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    ctx: Arc<ApiContext>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("api listening on {addr}");
    axum::serve(listener, router(ctx).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Bearer auth, scope enforcement, and the per-(tenant, endpoint, hour)
/// rate limit. Denied requests never reach business logic.
async fn guard(
    State(ctx): State<Arc<ApiContext>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?
        .to_string();
    let grant = ctx
        .store
        .authenticate(&token)?
        .ok_or(ApiError::Unauthorized)?;
    let endpoint = req.uri().path().to_string();
    if let Some(scopes) = &grant.scopes {
        let required = required_scope(&endpoint);
        if !scopes.iter().any(|s| s == required) {
            return Err(ApiError::Forbidden);
        }
    }
    let tenant = grant.tenant;
    let limit = match tenant.tier {
        Tier::Free => ctx.rate_limit_free,
        Tier::Premium => ctx.rate_limit_premium,
    };
    let decision = ctx.store.check_rate_limit(tenant.id, &endpoint, limit)?;
    if !decision.allowed {
        return Err(ApiError::RateLimited {
            limit,
            reset: decision.reset,
        });
    }
    req.extensions_mut().insert(tenant);
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert("X-RateLimit-Limit", numeric_header(limit as u64));
    headers.insert("X-RateLimit-Remaining", numeric_header(decision.remaining as u64));
    headers.insert("X-RateLimit-Reset", numeric_header(decision.reset));
    Ok(resp)
}

fn numeric_header(v: u64) -> HeaderValue {
    HeaderValue::from_str(&v.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

/// Scope a restricted credential must carry to reach an endpoint. Legacy
/// tokens and unscoped credentials pass everything.
fn required_scope(path: &str) -> &'static str {
    if path.starts_with("/admin/") {
        "admin"
    } else if path == "/auth/webhook" || path == "/events/acknowledge" {
        "write"
    } else {
        "read"
    }
}

/// Parse a period string like `7d`, `48h`, or `4w` into whole days.
fn parse_period(period: &str) -> Result<u32, ApiError> {
    let p = period.trim();
    let days = if let Some(d) = p.strip_suffix('d') {
        d.parse::<u32>().ok()
    } else if let Some(h) = p.strip_suffix('h') {
        h.parse::<u32>().ok().map(|h| h.div_ceil(24).max(1))
    } else if let Some(w) = p.strip_suffix('w') {
        w.parse::<u32>().ok().and_then(|w| w.checked_mul(7))
    } else {
        None
    };
    days.filter(|d| (1..=365).contains(d))
        .ok_or_else(|| ApiError::Validation(format!("invalid period: {period}")))
}

fn with_cached(mut value: Value, cached: bool) -> Json<Value> {
    value["cached"] = json!(cached);
    Json(value)
}

fn validate_callback_url(raw: &str) -> Result<(), ApiError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| ApiError::Validation(format!("invalid callback_url: {e}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ApiError::Validation("callback_url must be http(s)".into()));
    }
    Ok(())
}

// ---- public endpoints ----

#[derive(Deserialize)]
struct RegisterBody {
    pubkey: String,
    callback_url: String,
    callback_secret: Option<String>,
}

async fn register(
    State(ctx): State<Arc<ApiContext>>,
    Json(body): Json<RegisterBody>,
) -> Result<Response, ApiError> {
    let pubkey = npub::normalize(&body.pubkey)
        .map_err(|e| ApiError::Validation(format!("invalid pubkey: {e}")))?;
    validate_callback_url(&body.callback_url)?;
    if ctx.store.tenant_by_pubkey(&pubkey)?.is_some() {
        return Err(ApiError::Conflict("pubkey already registered".into()));
    }
    let secret = body.callback_secret.unwrap_or_else(generate_token);
    let tenant = ctx
        .store
        .create_tenant(&pubkey, &body.callback_url, &secret, Tier::Free)?;
    // make the pool pick the new tenant up without waiting for the cadence
    let _ = ctx.registry.reload(&ctx.store);
    let body = json!({
        "tenant_id": tenant.id,
        "pubkey": tenant.pubkey,
        "api_token": tenant.api_token,
        "callback_secret": tenant.callback_secret,
    });
    Ok((axum::http::StatusCode::CREATED, Json(body)).into_response())
}

#[derive(Deserialize)]
struct QuickScanParams {
    npub: String,
    period: Option<String>,
}

async fn quick_scan(
    State(ctx): State<Arc<ApiContext>>,
    Query(params): Query<QuickScanParams>,
) -> Result<Json<Value>, ApiError> {
    let days = parse_period(params.period.as_deref().unwrap_or("7d"))?;
    let scan = ctx
        .scanner
        .quick_scan(&params.npub, days)
        .await
        .map_err(|e| ApiError::Validation(format!("invalid pubkey: {e}")))?;
    Ok(Json(serde_json::to_value(scan).map_err(anyhow::Error::from)?))
}

async fn health(State(ctx): State<Arc<ApiContext>>) -> Json<Value> {
    let degraded = ctx.pool_health.degraded();
    Json(json!({
        "status": if degraded { "degraded" } else { "ok" },
        "relays_connected": ctx.pool_health.connected(),
        "relays_total": ctx.pool_health.relay_total(),
        "dropped_frames": ctx.pool_health.dropped_frames(),
    }))
}

// ---- tenant endpoints ----

async fn auth_me(Extension(tenant): Extension<Tenant>) -> Json<Value> {
    Json(json!({
        "tenant_id": tenant.id,
        "pubkey": tenant.pubkey,
        "npub": npub::encode(&tenant.pubkey).ok(),
        "callback_url": tenant.callback_url,
        "tier": tenant.tier,
        "created_at": tenant.created_at,
        "last_active": tenant.last_active,
    }))
}

#[derive(Deserialize)]
struct WebhookBody {
    callback_url: Option<String>,
    callback_secret: Option<String>,
}

async fn auth_webhook(
    State(ctx): State<Arc<ApiContext>>,
    Extension(tenant): Extension<Tenant>,
    Json(body): Json<WebhookBody>,
) -> Result<Json<Value>, ApiError> {
    if body.callback_url.is_none() && body.callback_secret.is_none() {
        return Err(ApiError::Validation(
            "provide callback_url and/or callback_secret".into(),
        ));
    }
    if let Some(url) = &body.callback_url {
        validate_callback_url(url)?;
    }
    ctx.store.update_webhook(
        tenant.id,
        body.callback_url.as_deref(),
        body.callback_secret.as_deref(),
    )?;
    Ok(Json(json!({ "updated": true })))
}

async fn metrics_summary(
    State(ctx): State<Arc<ApiContext>>,
    Extension(tenant): Extension<Tenant>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(insights::summary(&ctx.store, tenant.id)?))
}

#[derive(Deserialize)]
struct PeriodParams {
    period: Option<String>,
}

async fn metrics_followers(
    State(ctx): State<Arc<ApiContext>>,
    Extension(tenant): Extension<Tenant>,
    Query(params): Query<PeriodParams>,
) -> Result<Json<Value>, ApiError> {
    let period = params.period.unwrap_or_else(|| "30d".into());
    let days = parse_period(&period)?;
    Ok(Json(insights::followers_series(
        &ctx.store, tenant.id, &period, days,
    )?))
}

#[derive(Deserialize)]
struct PostsParams {
    limit: Option<usize>,
    sort: Option<String>,
}

async fn metrics_posts(
    State(ctx): State<Arc<ApiContext>>,
    Extension(tenant): Extension<Tenant>,
    Query(params): Query<PostsParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.unwrap_or(20).min(100);
    let sort = match params.sort.as_deref() {
        None | Some("recent") => PostSort::Recent,
        Some("engagement") => PostSort::Engagement,
        Some(other) => {
            return Err(ApiError::Validation(format!("invalid sort: {other}")));
        }
    };
    let posts = ctx.store.posts_for_tenant(tenant.id, limit, sort)?;
    let count = posts.len();
    Ok(Json(json!({ "posts": posts, "count": count })))
}

#[derive(Deserialize)]
struct ActivityParams {
    #[serde(rename = "type")]
    kind: Option<String>,
    period: Option<String>,
}

async fn network_activity(
    State(ctx): State<Arc<ApiContext>>,
    Extension(tenant): Extension<Tenant>,
    Query(params): Query<ActivityParams>,
) -> Result<Json<Value>, ApiError> {
    let kind = params.kind.unwrap_or_else(|| timing::KIND_FOLLOWER_POST.into());
    let valid = [
        timing::KIND_FOLLOWER_POST,
        timing::KIND_FOLLOWING_POST,
        timing::KIND_ENGAGEMENT,
    ];
    if !valid.contains(&kind.as_str()) {
        return Err(ApiError::Validation(format!("unknown activity type: {kind}")));
    }
    let period = params.period.unwrap_or_else(|| "7d".into());
    let days = parse_period(&period)?;
    let store = ctx.store.clone();
    let tenant_id = tenant.id;
    let cache_kind = format!("network-activity:{kind}");
    let (value, cached) = ctx.cache.read_through(
        tenant_id,
        &cache_kind,
        &period,
        TTL_DISTRIBUTION,
        || insights::network_activity(&store, tenant_id, &kind, &period, days),
    )?;
    Ok(with_cached(value, cached))
}

async fn best_posting_times(
    State(ctx): State<Arc<ApiContext>>,
    Extension(tenant): Extension<Tenant>,
    Query(params): Query<PeriodParams>,
) -> Result<Json<Value>, ApiError> {
    let period = params.period.unwrap_or_else(|| "30d".into());
    let days = parse_period(&period)?;
    let store = ctx.store.clone();
    let tenant_id = tenant.id;
    let (value, cached) = ctx.cache.read_through(
        tenant_id,
        "best-posting-times",
        &period,
        TTL_RECOMMENDATION,
        || insights::best_posting_times(&store, tenant_id, &period, days),
    )?;
    Ok(with_cached(value, cached))
}

#[derive(Deserialize)]
struct EngagersParams {
    period: Option<String>,
    min_interactions: Option<u64>,
    limit: Option<usize>,
}

async fn top_engagers(
    State(ctx): State<Arc<ApiContext>>,
    Extension(tenant): Extension<Tenant>,
    Query(params): Query<EngagersParams>,
) -> Result<Json<Value>, ApiError> {
    let period = params.period.unwrap_or_else(|| "30d".into());
    let days = parse_period(&period)?;
    let min_interactions = params.min_interactions.unwrap_or(1);
    let limit = params.limit.unwrap_or(20).min(100);
    let store = ctx.store.clone();
    let tenant_id = tenant.id;
    let cache_kind = format!("top-engagers:{min_interactions}:{limit}");
    let (value, cached) = ctx.cache.read_through(
        tenant_id,
        &cache_kind,
        &period,
        TTL_DISTRIBUTION,
        || insights::top_engagers(&store, tenant_id, &period, days, min_interactions, limit),
    )?;
    Ok(with_cached(value, cached))
}

#[derive(Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

async fn should_engage(
    State(ctx): State<Arc<ApiContext>>,
    Extension(tenant): Extension<Tenant>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.unwrap_or(10).min(50);
    Ok(Json(insights::should_engage(&ctx.store, tenant.id, limit)?))
}

#[derive(Deserialize)]
struct StrategyParams {
    include: Option<String>,
    period: Option<String>,
}

async fn posting_strategy(
    State(ctx): State<Arc<ApiContext>>,
    Extension(tenant): Extension<Tenant>,
    Query(params): Query<StrategyParams>,
) -> Result<Json<Value>, ApiError> {
    let period = params.period.unwrap_or_else(|| "30d".into());
    let days = parse_period(&period)?;
    let include: Vec<&str> = match &params.include {
        None => insights::STRATEGY_SECTIONS.to_vec(),
        Some(csv) => {
            let sections: Vec<&str> = csv.split(',').map(str::trim).collect();
            for s in &sections {
                if !insights::STRATEGY_SECTIONS.contains(s) {
                    return Err(ApiError::Validation(format!("unknown section: {s}")));
                }
            }
            sections
        }
    };
    let store = ctx.store.clone();
    let tenant_id = tenant.id;
    let cache_kind = format!("posting-strategy:{}", include.join("+"));
    let (value, cached) = ctx.cache.read_through(
        tenant_id,
        &cache_kind,
        &period,
        TTL_RECOMMENDATION,
        || insights::posting_strategy(&store, tenant_id, &include, days),
    )?;
    Ok(with_cached(value, cached))
}

#[derive(Deserialize)]
struct EventsParams {
    since: Option<u64>,
    types: Option<String>,
}

async fn events_activity(
    State(ctx): State<Arc<ApiContext>>,
    Extension(tenant): Extension<Tenant>,
    Query(params): Query<EventsParams>,
) -> Result<Json<Value>, ApiError> {
    let kinds: Option<Vec<String>> = params.types.as_deref().map(|csv| {
        csv.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    });
    if let Some(kinds) = &kinds {
        for kind in kinds {
            if crate::store::EventKind::parse(kind).is_none() {
                return Err(ApiError::Validation(format!("unknown event type: {kind}")));
            }
        }
    }
    let events = ctx
        .store
        .unacknowledged_events(tenant.id, params.since, kinds.as_deref())?;
    Ok(Json(json!({ "count": events.len(), "events": events })))
}

#[derive(Deserialize)]
struct AcknowledgeBody {
    #[serde(rename = "eventIds")]
    event_ids: Vec<String>,
}

async fn acknowledge(
    State(ctx): State<Arc<ApiContext>>,
    Extension(tenant): Extension<Tenant>,
    Json(body): Json<AcknowledgeBody>,
) -> Result<Json<Value>, ApiError> {
    if body.event_ids.is_empty() {
        return Err(ApiError::Validation("eventIds must not be empty".into()));
    }
    let (acknowledged, remaining) = ctx.store.acknowledge_events(tenant.id, &body.event_ids)?;
    Ok(Json(json!({ "acknowledged": acknowledged, "remaining": remaining })))
}

#[derive(Deserialize)]
struct SuggestionParams {
    limit: Option<usize>,
    #[allow(dead_code)]
    filters: Option<String>,
}

async fn follow_suggestions(
    State(ctx): State<Arc<ApiContext>>,
    Extension(tenant): Extension<Tenant>,
    Query(params): Query<SuggestionParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.unwrap_or(10).min(50);
    Ok(Json(insights::follow_suggestions(
        &ctx.store, tenant.id, limit,
    )?))
}

#[derive(Deserialize)]
struct ScanBody {
    period: Option<String>,
}

async fn scan_network(
    State(ctx): State<Arc<ApiContext>>,
    Extension(tenant): Extension<Tenant>,
    Json(body): Json<ScanBody>,
) -> Result<Json<Value>, ApiError> {
    let days = parse_period(body.period.as_deref().unwrap_or("7d"))?;
    let report = ctx.scanner.full_scan(&ctx.store, &tenant, days).await?;
    Ok(Json(serde_json::to_value(report).map_err(anyhow::Error::from)?))
}

async fn aggregate_activity(
    State(ctx): State<Arc<ApiContext>>,
    Extension(tenant): Extension<Tenant>,
    Json(body): Json<ScanBody>,
) -> Result<Json<Value>, ApiError> {
    let days = parse_period(body.period.as_deref().unwrap_or("7d"))?;
    timing::run_aggregation(&ctx.store, tenant.id, days)?;
    ctx.cache.invalidate(tenant.id)?;
    Ok(Json(json!({ "success": true, "aggregated_at": now_unix() })))
}
