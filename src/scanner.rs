//! On-demand network scanning over one-shot relay queries.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::event::{
    close_frame, hour_of_day, now_unix, req_frame, Event, Filter, RelayFrame, KIND_CONTACT_LIST,
    KIND_TEXT_NOTE,
};
use crate::npub;
use crate::store::{Store, Tenant};
use crate::timing::{self, peak_hours, zone_of_participation, Zone, ROLE_FOLLOWER, ROLE_FOLLOWING, ROLE_SELF};

const SCAN_SUB: &str = "scan";
/// Authors fetched per REQ; relays cap filter sizes.
const AUTHOR_CHUNK: usize = 50;

/// Outcome of a full scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub following_scanned: usize,
    pub followers_scanned: usize,
    pub posts_analyzed: usize,
}

impl ScanReport {
    fn failed(reason: &str) -> Self {
        Self {
            success: false,
            reason: Some(reason.to_string()),
            following_scanned: 0,
            followers_scanned: 0,
            posts_analyzed: 0,
        }
    }
}

/// A transient hourly view assembled by the quick scan.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramView {
    pub hourly_distribution: Vec<u64>,
    pub peak_hours: Vec<u8>,
    pub zone: Option<Zone>,
}

impl HistogramView {
    fn from_counts(counts: [u64; 24]) -> Self {
        Self {
            hourly_distribution: counts.to_vec(),
            peak_hours: peak_hours(&counts),
            zone: zone_of_participation(&counts),
        }
    }
}

/// Quick scan response; nothing behind it is persisted.
#[derive(Debug, Clone, Serialize)]
pub struct QuickScan {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub pubkey: String,
    pub posts_analyzed: usize,
    pub following: HistogramView,
}

/// Queries relays for contact lists and recent posts.
#[derive(Clone)]
pub struct Scanner {
    relays: Vec<String>,
    query_timeout: Duration,
    max_followers: usize,
    max_following: usize,
}

impl Scanner {
    pub fn new(relays: Vec<String>, query_timeout: Duration) -> Self {
        Self {
            relays,
            query_timeout,
            max_followers: 300,
            max_following: 100,
        }
    }

    /// Full scan: refresh the tenant's network and timing tables, then
    /// re-aggregate and invalidate cached insights.
    pub async fn full_scan(
        &self,
        store: &Store,
        tenant: &Tenant,
        period_days: u32,
    ) -> Result<ScanReport> {
        let since = now_unix().saturating_sub(period_days as u64 * 86_400);
        let contact_list = match self.latest_contact_list(&tenant.pubkey).await {
            Some(ev) => ev,
            None => return Ok(ScanReport::failed("no contact list")),
        };
        let following: Vec<String> = dedup_strings(
            contact_list.p_tags().into_iter().map(str::to_string),
        );
        store.replace_following(tenant.id, &following)?;
        let followers = self
            .follower_contacts(&tenant.pubkey, self.max_followers)
            .await;

        let mut posts_analyzed = 0;
        // own posts establish the self baseline
        let own = self
            .posts_by_authors(std::slice::from_ref(&tenant.pubkey), since)
            .await;
        for post in &own {
            store.upsert_post_content(tenant.id, &post.id, &post.content, None, post.created_at)?;
            store.insert_post_activity(
                tenant.id,
                &post.pubkey,
                ROLE_SELF,
                &post.id,
                post.created_at,
            )?;
            posts_analyzed += 1;
        }
        let capped_following: Vec<String> =
            following.iter().take(self.max_following).cloned().collect();
        for post in self.posts_by_authors(&capped_following, since).await {
            store.insert_post_activity(
                tenant.id,
                &post.pubkey,
                ROLE_FOLLOWING,
                &post.id,
                post.created_at,
            )?;
            posts_analyzed += 1;
        }
        for post in self.posts_by_authors(&followers, since).await {
            store.insert_post_activity(
                tenant.id,
                &post.pubkey,
                ROLE_FOLLOWER,
                &post.id,
                post.created_at,
            )?;
            posts_analyzed += 1;
        }

        timing::run_aggregation(store, tenant.id, period_days)?;
        store.invalidate_insights(tenant.id)?;
        Ok(ScanReport {
            success: true,
            reason: None,
            following_scanned: following.len(),
            followers_scanned: followers.len(),
            posts_analyzed,
        })
    }

    /// Quick scan by pubkey or npub; assembles a transient histogram.
    pub async fn quick_scan(&self, target: &str, period_days: u32) -> Result<QuickScan> {
        let pubkey = npub::normalize(target)?;
        let since = now_unix().saturating_sub(period_days as u64 * 86_400);
        let contact_list = match self.latest_contact_list(&pubkey).await {
            Some(ev) => ev,
            None => {
                return Ok(QuickScan {
                    success: false,
                    reason: Some("no contact list".into()),
                    pubkey,
                    posts_analyzed: 0,
                    following: HistogramView::from_counts([0; 24]),
                })
            }
        };
        let following: Vec<String> = dedup_strings(
            contact_list.p_tags().into_iter().map(str::to_string),
        )
        .into_iter()
        .take(self.max_following)
        .collect();
        let posts = self.posts_by_authors(&following, since).await;
        let mut counts = [0u64; 24];
        for post in &posts {
            counts[hour_of_day(post.created_at) as usize] += 1;
        }
        Ok(QuickScan {
            success: true,
            reason: None,
            pubkey,
            posts_analyzed: posts.len(),
            following: HistogramView::from_counts(counts),
        })
    }

    /// The newest contact list authored by `pubkey` across all relays.
    pub async fn latest_contact_list(&self, pubkey: &str) -> Option<Event> {
        let filter = Filter {
            kinds: Some(vec![KIND_CONTACT_LIST]),
            authors: Some(vec![pubkey.to_string()]),
            limit: Some(1),
            ..Default::default()
        };
        self.fetch_events(&filter)
            .await
            .into_iter()
            .max_by_key(|ev| ev.created_at)
    }

    /// Distinct authors of contact lists referencing `pubkey`.
    pub async fn follower_contacts(&self, pubkey: &str, cap: usize) -> Vec<String> {
        let filter = Filter {
            kinds: Some(vec![KIND_CONTACT_LIST]),
            p_tags: Some(vec![pubkey.to_string()]),
            ..Default::default()
        };
        let mut authors = dedup_strings(
            self.fetch_events(&filter)
                .await
                .into_iter()
                .filter(|ev| ev.pubkey != pubkey)
                .map(|ev| ev.pubkey),
        );
        authors.truncate(cap);
        authors
    }

    /// Text notes by the given authors since `since`, deduplicated.
    pub async fn posts_by_authors(&self, authors: &[String], since: u64) -> Vec<Event> {
        let mut posts = vec![];
        let mut seen = HashSet::new();
        for chunk in authors.chunks(AUTHOR_CHUNK) {
            let filter = Filter {
                kinds: Some(vec![KIND_TEXT_NOTE]),
                authors: Some(chunk.to_vec()),
                since: Some(since),
                ..Default::default()
            };
            for ev in self.fetch_events(&filter).await {
                if ev.created_at >= since && seen.insert(ev.id.clone()) {
                    posts.push(ev);
                }
            }
        }
        posts
    }

    /// Fan the filter out to every relay; a relay timing out or erroring is
    /// skipped without failing the query. Results are deduplicated by id.
    async fn fetch_events(&self, filter: &Filter) -> Vec<Event> {
        let queries = self
            .relays
            .iter()
            .map(|relay| fetch_from_relay(relay.clone(), filter.clone(), self.query_timeout));
        let mut merged = vec![];
        let mut seen = HashSet::new();
        for outcome in futures_util::future::join_all(queries).await {
            match outcome {
                Ok(events) => {
                    for ev in events {
                        if seen.insert(ev.id.clone()) {
                            merged.push(ev);
                        }
                    }
                }
                Err(e) => warn!("relay query skipped: {e:#}"),
            }
        }
        merged
    }
}

/// One-shot query: REQ, collect until EOSE, CLOSE. Bounded by `query_timeout`.
async fn fetch_from_relay(
    relay: String,
    filter: Filter,
    query_timeout: Duration,
) -> Result<Vec<Event>> {
    let fetch = async move {
        let (mut ws, _) = connect_async(relay.as_str()).await?;
        ws.send(Message::Text(req_frame(SCAN_SUB, &filter))).await?;
        let mut events = vec![];
        while let Some(msg) = ws.next().await {
            match msg? {
                Message::Text(txt) => match RelayFrame::parse(&txt) {
                    Some(RelayFrame::Event(_, ev)) => events.push(ev),
                    Some(RelayFrame::Eose(_)) => break,
                    Some(RelayFrame::Notice(msg)) => debug!("notice from {relay}: {msg}"),
                    None => {}
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        let _ = ws.send(Message::Text(close_frame(SCAN_SUB))).await;
        let _ = ws.close(None).await;
        Ok(events)
    };
    timeout(query_timeout, fetch)
        .await
        .map_err(|_| anyhow!("query timed out"))?
}

fn dedup_strings(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values.filter(|v| seen.insert(v.clone())).collect()
}
