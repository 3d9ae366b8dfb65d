//! Deterministic analytics computations behind the insight endpoints.

use anyhow::Result;
use serde_json::{json, Value};

use crate::event::now_unix;
use crate::npub;
use crate::store::{PostSort, Store};
use crate::timing::{
    self, KIND_ENGAGEMENT, KIND_FOLLOWER_POST, KIND_FOLLOWING_POST, ROLE_FOLLOWER, ROLE_FOLLOWING,
};

fn window_start(period_days: u32) -> u64 {
    now_unix().saturating_sub(period_days as u64 * 86_400)
}

/// Follower/post/engagement counters for `/metrics/summary`.
pub fn summary(store: &Store, tenant_id: i64) -> Result<Value> {
    let stats = store.summary_stats(tenant_id, 0)?;
    Ok(json!({
        "followers": store.followers_count(tenant_id)?,
        "following": store.following_count(tenant_id)?,
        "posts": store.posts_count(tenant_id)?,
        "engagement": {
            "mentions": stats.mentions,
            "replies": stats.replies,
            "reactions": stats.reactions,
            "reposts": stats.reposts,
            "zaps": stats.zaps,
            "zap_sats": stats.zap_sats,
        },
    }))
}

/// Follower-gain time series for `/metrics/followers`.
pub fn followers_series(store: &Store, tenant_id: i64, period: &str, period_days: u32) -> Result<Value> {
    let series: Vec<Value> = store
        .follower_gain_series(tenant_id, window_start(period_days))?
        .into_iter()
        .map(|(date, count)| json!({ "date": date, "gained": count }))
        .collect();
    Ok(json!({
        "period": period,
        "total_followers": store.followers_count(tenant_id)?,
        "series": series,
    }))
}

/// Hourly distribution plus zone for one histogram kind, computed live over
/// the requested window.
pub fn network_activity(
    store: &Store,
    tenant_id: i64,
    kind: &str,
    period: &str,
    period_days: u32,
) -> Result<Value> {
    let since = window_start(period_days);
    let counts = match kind {
        KIND_FOLLOWER_POST => store.activity_hourly(tenant_id, ROLE_FOLLOWER, since)?,
        KIND_FOLLOWING_POST => store.activity_hourly(tenant_id, ROLE_FOLLOWING, since)?,
        KIND_ENGAGEMENT => store.engagement_hourly(tenant_id, since)?,
        other => return Err(anyhow::anyhow!("unknown activity type: {other}")),
    };
    Ok(json!({
        "type": kind,
        "period": period,
        "total": counts.iter().sum::<u64>(),
        "hourly_distribution": counts.to_vec(),
        "peak_hours": timing::peak_hours(&counts),
        "zone": timing::zone_of_participation(&counts),
    }))
}

/// Scored posting-time recommendations.
pub fn best_posting_times(store: &Store, tenant_id: i64, period: &str, period_days: u32) -> Result<Value> {
    let since = window_start(period_days);
    let follower = store.activity_hourly(tenant_id, ROLE_FOLLOWER, since)?;
    let engagement = store.engagement_hourly(tenant_id, since)?;
    let best = timing::best_posting_times(&follower, &engagement);
    Ok(json!({
        "period": period,
        "best_times": best.times,
        "confidence": best.confidence,
    }))
}

/// Leaderboard of the most active event authors.
pub fn top_engagers(
    store: &Store,
    tenant_id: i64,
    period: &str,
    period_days: u32,
    min_interactions: u64,
    limit: usize,
) -> Result<Value> {
    let engagers: Vec<Value> = store
        .top_engagers(tenant_id, window_start(period_days), min_interactions, limit)?
        .into_iter()
        .map(|e| {
            json!({
                "pubkey": e.pubkey,
                "npub": npub::encode(&e.pubkey).ok(),
                "interactions": e.interactions,
                "last_seen": e.last_seen,
            })
        })
        .collect();
    Ok(json!({ "period": period, "engagers": engagers }))
}

/// Prioritized action list built from unacknowledged replies and follows.
pub fn should_engage(store: &Store, tenant_id: i64, limit: usize) -> Result<Value> {
    let kinds = ["reply".to_string(), "follow".to_string()];
    let mut events = store.unacknowledged_events(tenant_id, None, Some(&kinds))?;
    // replies first, newest first within each class
    events.sort_by(|a, b| {
        let rank = |kind: &str| if kind == "reply" { 0 } else { 1 };
        rank(&a.kind)
            .cmp(&rank(&b.kind))
            .then(b.created_at.cmp(&a.created_at))
    });
    let actions: Vec<Value> = events
        .into_iter()
        .take(limit)
        .map(|ev| {
            let (action, priority, reason) = if ev.kind == "reply" {
                ("reply", "high", "someone replied to one of your posts")
            } else {
                ("follow_back", "medium", "you gained a new follower")
            };
            json!({
                "event_id": ev.event_id,
                "author": ev.author,
                "kind": ev.kind,
                "suggested_action": action,
                "priority": priority,
                "reason": reason,
                "created_at": ev.created_at,
            })
        })
        .collect();
    Ok(json!({ "actions": actions }))
}

/// Which sections `/insights/posting-strategy` includes.
pub const STRATEGY_SECTIONS: [&str; 3] = ["timing", "content_mix", "frequency"];

/// Combined timing, content-mix, and frequency strategy.
pub fn posting_strategy(
    store: &Store,
    tenant_id: i64,
    include: &[&str],
    period_days: u32,
) -> Result<Value> {
    let mut out = serde_json::Map::new();
    if include.contains(&"timing") {
        let since = window_start(period_days);
        let follower = store.activity_hourly(tenant_id, ROLE_FOLLOWER, since)?;
        let engagement = store.engagement_hourly(tenant_id, since)?;
        let best = timing::best_posting_times(&follower, &engagement);
        out.insert(
            "timing".into(),
            json!({ "best_times": best.times, "confidence": best.confidence }),
        );
    }
    let posts = store.posts_for_tenant(tenant_id, 200, PostSort::Recent)?;
    if include.contains(&"content_mix") {
        let with_image = posts.iter().filter(|p| p.image_url.is_some()).count();
        let text_only = posts.len() - with_image;
        let engagement_of = |with: bool| -> f64 {
            let selected: Vec<_> = posts
                .iter()
                .filter(|p| p.image_url.is_some() == with)
                .collect();
            if selected.is_empty() {
                return 0.0;
            }
            let total: u64 = selected
                .iter()
                .map(|p| p.reactions + p.replies + p.reposts + p.zap_count)
                .sum();
            total as f64 / selected.len() as f64
        };
        out.insert(
            "content_mix".into(),
            json!({
                "posts_with_images": with_image,
                "text_only_posts": text_only,
                "avg_engagement_with_images": engagement_of(true),
                "avg_engagement_text_only": engagement_of(false),
            }),
        );
    }
    if include.contains(&"frequency") {
        let since = window_start(period_days);
        let recent = posts.iter().filter(|p| p.posted_at >= since).count();
        out.insert(
            "frequency".into(),
            json!({
                "posts_in_period": recent,
                "posts_per_day": recent as f64 / period_days.max(1) as f64,
            }),
        );
    }
    Ok(Value::Object(out))
}

/// Ranked follow suggestions: frequent engagers not yet followed back.
pub fn follow_suggestions(store: &Store, tenant_id: i64, limit: usize) -> Result<Value> {
    let following = store.following_set(tenant_id)?;
    let tenant_pubkey = store
        .tenant_by_id(tenant_id)?
        .map(|t| t.pubkey)
        .unwrap_or_default();
    let suggestions: Vec<Value> = store
        .top_engagers(tenant_id, 0, 1, limit * 3)?
        .into_iter()
        .filter(|e| !following.contains(&e.pubkey) && e.pubkey != tenant_pubkey)
        .take(limit)
        .map(|e| {
            json!({
                "pubkey": e.pubkey,
                "npub": npub::encode(&e.pubkey).ok(),
                "interactions": e.interactions,
                "reason": format!("interacted with you {} times", e.interactions),
            })
        })
        .collect();
    Ok(json!({ "suggestions": suggestions }))
}
