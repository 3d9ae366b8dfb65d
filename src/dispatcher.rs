//! Signed webhook delivery with bounded retries.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use crate::event::now_unix;
use crate::store::{Store, Tenant, WebhookJob};

type HmacSha256 = Hmac<Sha256>;

/// Signature header attached to every delivery.
pub const SIGNATURE_HEADER: &str = "X-Deep-Claw-Signature";
const USER_AGENT: &str = concat!("deepclaw/", env!("CARGO_PKG_VERSION"));

/// Delivery tuning.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Per-attempt HTTP timeout.
    pub timeout: Duration,
    /// Maximum attempts per job.
    pub max_attempts: u32,
    /// Sleeps before retry attempts 2, 3, ...
    pub backoff: Vec<Duration>,
    /// Fallback polling cadence when no enqueue wakeup arrives.
    pub poll_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_attempts: 3,
            backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(25),
            ],
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Lowercase hex HMAC-SHA256 over the exact bytes transmitted.
pub fn sign(body: &[u8], secret: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Drains pending webhook log rows and delivers them.
pub struct Dispatcher {
    store: Store,
    client: reqwest::Client,
    cfg: DispatchConfig,
    notify: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(store: Store, cfg: DispatchConfig, notify: Arc<Notify>) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            cfg,
            notify,
        }
    }

    /// Deliver pending jobs until shutdown; the in-flight attempt finishes,
    /// everything else stays `pending` for the next run.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                _ = shutdown.changed() => return,
            }
            let jobs = match self.store.pending_webhooks(50) {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!("reading webhook queue failed: {e:#}");
                    continue;
                }
            };
            for job in jobs {
                if *shutdown.borrow() {
                    return;
                }
                self.deliver(&job).await;
            }
        }
    }

    /// Run the retry ladder for one job.
    pub async fn deliver(&self, job: &WebhookJob) {
        for attempt in 0..self.cfg.max_attempts {
            if attempt > 0 {
                let delay = self
                    .cfg
                    .backoff
                    .get(attempt as usize - 1)
                    .copied()
                    .unwrap_or(Duration::from_secs(25));
                tokio::time::sleep(delay).await;
            }
            let terminal = attempt + 1 == self.cfg.max_attempts;
            // the secret and URL are re-read per attempt so rotation applies
            // to in-flight jobs immediately
            let tenant = match self.store.tenant_by_id(job.tenant_id) {
                Ok(Some(t)) => t,
                Ok(None) => {
                    let _ = self.store.mark_webhook_failed(job.id, "tenant deleted", true);
                    return;
                }
                Err(e) => {
                    warn!("webhook {}: tenant lookup failed: {e:#}", job.id);
                    let _ = self
                        .store
                        .mark_webhook_failed(job.id, "store error", terminal);
                    continue;
                }
            };
            match self.attempt(&tenant, &job.payload).await {
                Ok(code) if (200..300).contains(&code) => {
                    debug!("webhook {} delivered with {code}", job.id);
                    let _ = self.store.mark_webhook_sent(job.id, code);
                    return;
                }
                Ok(code) => {
                    let _ = self
                        .store
                        .mark_webhook_failed(job.id, &format!("http {code}"), terminal);
                }
                Err(e) => {
                    let _ = self
                        .store
                        .mark_webhook_failed(job.id, &e.to_string(), terminal);
                }
            }
        }
        warn!("webhook {} failed terminally", job.id);
    }

    async fn attempt(&self, tenant: &Tenant, payload: &str) -> Result<u16> {
        let signature = sign(payload.as_bytes(), tenant.callback_secret.as_bytes())?;
        let resp = self
            .client
            .post(&tenant.callback_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(SIGNATURE_HEADER, signature)
            .body(payload.to_string())
            .timeout(self.cfg.timeout)
            .send()
            .await?;
        Ok(resp.status().as_u16())
    }
}

/// Queue a `daily_summary` webhook for every tenant whose last summary is
/// older than 24 hours. Returns the number of summaries enqueued.
pub fn enqueue_due_summaries(store: &Store, notify: &Notify) -> Result<usize> {
    let now = now_unix();
    let mut enqueued = 0;
    for (tenant_id, _) in store.tenant_pubkeys()? {
        let due = store
            .last_daily_summary(tenant_id)?
            .map_or(true, |t| now.saturating_sub(t) >= 86_400);
        if !due {
            continue;
        }
        let stats = store.summary_stats(tenant_id, now.saturating_sub(86_400))?;
        let payload = json!({
            "event_type": "daily_summary",
            "timestamp": now,
            "new_followers": stats.new_followers,
            "posts": stats.posts,
            "mentions": stats.mentions,
            "replies": stats.replies,
            "reactions": stats.reactions,
            "reposts": stats.reposts,
            "zaps": stats.zaps,
            "zap_sats": stats.zap_sats,
        });
        store.enqueue_webhook(tenant_id, "daily_summary", &payload.to_string())?;
        notify.notify_one();
        enqueued += 1;
    }
    Ok(enqueued)
}

/// Hourly check for due daily summaries.
pub async fn daily_summary_task(
    store: Store,
    notify: Arc<Notify>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }
        match enqueue_due_summaries(&store, &notify) {
            Ok(0) => {}
            Ok(n) => debug!("enqueued {n} daily summaries"),
            Err(e) => warn!("daily summary pass failed: {e:#}"),
        }
    }
}
