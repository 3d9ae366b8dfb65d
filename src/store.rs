//! SQLite persistence for tenants, events, posts, and aggregates.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use rand::RngCore;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;

use crate::event::now_unix;

/// Subscription tier of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
        }
    }

    pub fn parse(s: &str) -> Tier {
        match s {
            "premium" => Tier::Premium,
            _ => Tier::Free,
        }
    }
}

/// Internal classification of an observed protocol event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Mention,
    Reply,
    Reaction,
    Repost,
    Follow,
    Zap,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Mention => "mention",
            EventKind::Reply => "reply",
            EventKind::Reaction => "reaction",
            EventKind::Repost => "repost",
            EventKind::Follow => "follow",
            EventKind::Zap => "zap",
        }
    }

    pub fn parse(s: &str) -> Option<EventKind> {
        Some(match s {
            "mention" => EventKind::Mention,
            "reply" => EventKind::Reply,
            "reaction" => EventKind::Reaction,
            "repost" => EventKind::Repost,
            "follow" => EventKind::Follow,
            "zap" => EventKind::Zap,
            _ => return None,
        })
    }
}

/// A registered subscriber.
#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: i64,
    pub pubkey: String,
    pub callback_url: String,
    pub callback_secret: String,
    pub api_token: String,
    pub tier: Tier,
    pub created_at: u64,
    pub last_active: u64,
}

/// An authenticated principal: the tenant plus any scope restriction carried
/// by the credential that resolved the token.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub tenant: Tenant,
    /// Scope set of the matching credential. `None` means unrestricted: a
    /// legacy tenant token, or a credential issued without scopes.
    pub scopes: Option<Vec<String>>,
}

/// A persisted per-tenant event row.
#[derive(Debug, Clone, Serialize)]
pub struct StoredEvent {
    pub tenant_id: i64,
    pub event_id: String,
    pub kind: String,
    pub author: String,
    pub content: String,
    pub metadata: Value,
    pub created_at: u64,
    pub acknowledged: bool,
}

/// A tenant post with denormalized engagement counters.
#[derive(Debug, Clone, Serialize)]
pub struct Post {
    pub note_id: String,
    pub content: String,
    pub image_url: Option<String>,
    pub posted_at: u64,
    pub reactions: u64,
    pub replies: u64,
    pub reposts: u64,
    pub impressions: u64,
    pub zap_count: u64,
    pub zap_total: u64,
}

/// Sort order for post listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostSort {
    Recent,
    Engagement,
}

/// Everything the router persists for one (tenant, event) in one transaction.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub tenant_id: i64,
    pub event_id: String,
    pub kind: EventKind,
    pub author: String,
    pub content: String,
    pub metadata: Value,
    pub created_at: u64,
    /// Note whose counters this event bumps, stubbed if not yet stored.
    pub target_note: Option<String>,
    /// Zapped amount in satoshis, zero for non-zap kinds.
    pub zap_sats: u64,
    /// Webhook payload to enqueue, absent for historical events.
    pub webhook_payload: Option<String>,
}

/// A pending webhook delivery.
#[derive(Debug, Clone)]
pub struct WebhookJob {
    pub id: i64,
    pub tenant_id: i64,
    pub event_kind: String,
    pub payload: String,
    pub retry_count: u32,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset: u64,
}

/// Aggregate counts over a trailing window, used for daily summaries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SummaryStats {
    pub new_followers: u64,
    pub posts: u64,
    pub mentions: u64,
    pub replies: u64,
    pub reactions: u64,
    pub reposts: u64,
    pub zaps: u64,
    pub zap_sats: u64,
}

/// Engager leaderboard row.
#[derive(Debug, Clone, Serialize)]
pub struct Engager {
    pub pubkey: String,
    pub interactions: u64,
    pub last_seen: u64,
}

/// Persistent store backed by a single SQLite connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database, for tests.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        })
    }

    /// Create the schema if it does not exist yet.
    pub fn init(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tenants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pubkey TEXT NOT NULL UNIQUE,
                callback_url TEXT NOT NULL,
                callback_secret TEXT NOT NULL,
                api_token TEXT NOT NULL UNIQUE,
                tier TEXT NOT NULL DEFAULT 'free',
                created_at INTEGER NOT NULL,
                last_active INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS api_credentials (
                token TEXT PRIMARY KEY,
                tenant_id INTEGER NOT NULL,
                scopes TEXT NOT NULL DEFAULT '',
                expires_at INTEGER,
                revoked INTEGER NOT NULL DEFAULT 0,
                last_used INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS events (
                tenant_id INTEGER NOT NULL,
                event_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                author TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                acknowledged INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (tenant_id, event_id)
            );
            CREATE INDEX IF NOT EXISTS idx_events_tenant_created
                ON events (tenant_id, created_at);
            CREATE TABLE IF NOT EXISTS posts (
                tenant_id INTEGER NOT NULL,
                note_id TEXT NOT NULL UNIQUE,
                content TEXT NOT NULL DEFAULT '',
                image_url TEXT,
                posted_at INTEGER NOT NULL DEFAULT 0,
                reactions INTEGER NOT NULL DEFAULT 0,
                replies INTEGER NOT NULL DEFAULT 0,
                reposts INTEGER NOT NULL DEFAULT 0,
                impressions INTEGER NOT NULL DEFAULT 0,
                zap_count INTEGER NOT NULL DEFAULT 0,
                zap_total INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS followers (
                tenant_id INTEGER NOT NULL,
                pubkey TEXT NOT NULL,
                followed_at INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (tenant_id, pubkey)
            );
            CREATE TABLE IF NOT EXISTS following (
                tenant_id INTEGER NOT NULL,
                pubkey TEXT NOT NULL,
                PRIMARY KEY (tenant_id, pubkey)
            );
            CREATE TABLE IF NOT EXISTS post_activity (
                tenant_id INTEGER NOT NULL,
                author TEXT NOT NULL,
                author_role TEXT NOT NULL,
                note_id TEXT NOT NULL,
                posted_at INTEGER NOT NULL,
                hour INTEGER NOT NULL,
                UNIQUE (tenant_id, note_id)
            );
            CREATE TABLE IF NOT EXISTS network_activity (
                tenant_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                hour INTEGER NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                window_date TEXT NOT NULL,
                UNIQUE (tenant_id, kind, hour, window_date)
            );
            CREATE TABLE IF NOT EXISTS insights (
                tenant_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                period TEXT NOT NULL,
                data TEXT NOT NULL,
                calculated_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                UNIQUE (tenant_id, kind, period)
            );
            CREATE TABLE IF NOT EXISTS webhook_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id INTEGER NOT NULL,
                event_kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                detail TEXT NOT NULL DEFAULT '',
                sent_at INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS engagers (
                tenant_id INTEGER NOT NULL,
                pubkey TEXT NOT NULL,
                interactions INTEGER NOT NULL DEFAULT 0,
                last_seen INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (tenant_id, pubkey)
            );
            CREATE TABLE IF NOT EXISTS rate_limits (
                tenant_id INTEGER NOT NULL,
                endpoint TEXT NOT NULL,
                window_start INTEGER NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (tenant_id, endpoint, window_start)
            );",
        )?;
        Ok(())
    }

    // ---- tenants and credentials ----

    /// Register a tenant, generating its API token.
    pub fn create_tenant(
        &self,
        pubkey: &str,
        callback_url: &str,
        callback_secret: &str,
        tier: Tier,
    ) -> Result<Tenant> {
        let conn = self.conn.lock().unwrap();
        let now = now_unix();
        let token = generate_token();
        conn.execute(
            "INSERT INTO tenants (pubkey, callback_url, callback_secret, api_token, tier, created_at, last_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![pubkey, callback_url, callback_secret, token, tier.as_str(), now],
        )?;
        let id = conn.last_insert_rowid();
        tenant_by(&conn, "id", &id.to_string())?.ok_or_else(|| anyhow!("tenant vanished"))
    }

    pub fn tenant_by_pubkey(&self, pubkey: &str) -> Result<Option<Tenant>> {
        let conn = self.conn.lock().unwrap();
        tenant_by(&conn, "pubkey", pubkey)
    }

    pub fn tenant_by_id(&self, id: i64) -> Result<Option<Tenant>> {
        let conn = self.conn.lock().unwrap();
        tenant_by(&conn, "id", &id.to_string())
    }

    /// Resolve a bearer token to a tenant. An `api_credentials` row takes
    /// precedence over the legacy token embedded on the tenant, and carries
    /// its scope set into the grant.
    pub fn authenticate(&self, token: &str) -> Result<Option<AuthGrant>> {
        let conn = self.conn.lock().unwrap();
        let now = now_unix();
        let cred: Option<(i64, Option<u64>, bool, String)> = conn
            .query_row(
                "SELECT tenant_id, expires_at, revoked, scopes FROM api_credentials WHERE token = ?1",
                params![token],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        if let Some((tenant_id, expires_at, revoked, scopes)) = cred {
            if revoked || expires_at.is_some_and(|e| e <= now) {
                return Ok(None);
            }
            conn.execute(
                "UPDATE api_credentials SET last_used = ?1 WHERE token = ?2",
                params![now, token],
            )?;
            conn.execute(
                "UPDATE tenants SET last_active = ?1 WHERE id = ?2",
                params![now, tenant_id],
            )?;
            let scopes: Vec<String> = scopes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            return Ok(tenant_by(&conn, "id", &tenant_id.to_string())?.map(|tenant| AuthGrant {
                tenant,
                scopes: if scopes.is_empty() { None } else { Some(scopes) },
            }));
        }
        let tenant = tenant_by(&conn, "api_token", token)?;
        if let Some(t) = &tenant {
            conn.execute(
                "UPDATE tenants SET last_active = ?1 WHERE id = ?2",
                params![now, t.id],
            )?;
        }
        Ok(tenant.map(|tenant| AuthGrant {
            tenant,
            scopes: None,
        }))
    }

    /// Issue a scoped API credential for a tenant.
    pub fn create_credential(
        &self,
        tenant_id: i64,
        scopes: &[&str],
        expires_at: Option<u64>,
    ) -> Result<String> {
        let conn = self.conn.lock().unwrap();
        let token = generate_token();
        conn.execute(
            "INSERT INTO api_credentials (token, tenant_id, scopes, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![token, tenant_id, scopes.join(","), expires_at],
        )?;
        Ok(token)
    }

    pub fn revoke_credential(&self, token: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE api_credentials SET revoked = 1 WHERE token = ?1",
            params![token],
        )?;
        Ok(())
    }

    /// Update the callback URL and/or secret of a tenant.
    pub fn update_webhook(
        &self,
        tenant_id: i64,
        url: Option<&str>,
        secret: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if let Some(url) = url {
            conn.execute(
                "UPDATE tenants SET callback_url = ?1 WHERE id = ?2",
                params![url, tenant_id],
            )?;
        }
        if let Some(secret) = secret {
            conn.execute(
                "UPDATE tenants SET callback_secret = ?1 WHERE id = ?2",
                params![secret, tenant_id],
            )?;
        }
        Ok(())
    }

    /// Remove a tenant and every per-tenant row.
    pub fn delete_tenant(&self, tenant_id: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for table in [
            "api_credentials",
            "events",
            "posts",
            "followers",
            "following",
            "post_activity",
            "network_activity",
            "insights",
            "webhook_log",
            "engagers",
            "rate_limits",
        ] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE tenant_id = ?1"),
                params![tenant_id],
            )?;
        }
        tx.execute("DELETE FROM tenants WHERE id = ?1", params![tenant_id])?;
        tx.commit()?;
        Ok(())
    }

    /// All (id, pubkey) pairs, for the registry snapshot.
    pub fn tenant_pubkeys(&self) -> Result<Vec<(i64, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, pubkey FROM tenants ORDER BY id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // ---- events ----

    /// Idempotently persist an observed event and its side effects.
    ///
    /// One transaction covers the event insert, post counter bumps, the
    /// engager upsert, the follower row, and the webhook enqueue, so exactly
    /// one webhook is queued per unique (tenant, event). Returns false when
    /// the (tenant, event) pair was already stored.
    pub fn record_event(&self, rec: &EventRecord) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO events (tenant_id, event_id, kind, author, content, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rec.tenant_id,
                rec.event_id,
                rec.kind.as_str(),
                rec.author,
                rec.content,
                rec.metadata.to_string(),
                rec.created_at
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }
        if let Some(note) = &rec.target_note {
            tx.execute(
                "INSERT OR IGNORE INTO posts (tenant_id, note_id) VALUES (?1, ?2)",
                params![rec.tenant_id, note],
            )?;
            let bump = match rec.kind {
                EventKind::Reaction => Some("UPDATE posts SET reactions = reactions + 1 WHERE note_id = ?1"),
                EventKind::Reply => Some("UPDATE posts SET replies = replies + 1 WHERE note_id = ?1"),
                EventKind::Repost => Some("UPDATE posts SET reposts = reposts + 1 WHERE note_id = ?1"),
                _ => None,
            };
            if let Some(sql) = bump {
                tx.execute(sql, params![note])?;
            }
            if rec.kind == EventKind::Zap {
                tx.execute(
                    "UPDATE posts SET zap_count = zap_count + 1, zap_total = zap_total + ?1 WHERE note_id = ?2",
                    params![rec.zap_sats, note],
                )?;
            }
        }
        if rec.kind == EventKind::Follow {
            tx.execute(
                "INSERT OR IGNORE INTO followers (tenant_id, pubkey, followed_at) VALUES (?1, ?2, ?3)",
                params![rec.tenant_id, rec.author, rec.created_at],
            )?;
        }
        tx.execute(
            "INSERT INTO engagers (tenant_id, pubkey, interactions, last_seen) VALUES (?1, ?2, 1, ?3)
             ON CONFLICT (tenant_id, pubkey) DO UPDATE SET
                 interactions = interactions + 1,
                 last_seen = MAX(last_seen, excluded.last_seen)",
            params![rec.tenant_id, rec.author, rec.created_at],
        )?;
        if let Some(payload) = &rec.webhook_payload {
            tx.execute(
                "INSERT INTO webhook_log (tenant_id, event_kind, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![rec.tenant_id, rec.kind.as_str(), payload, now_unix()],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Unacknowledged events, oldest first, optionally filtered.
    pub fn unacknowledged_events(
        &self,
        tenant_id: i64,
        since: Option<u64>,
        kinds: Option<&[String]>,
    ) -> Result<Vec<StoredEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT tenant_id, event_id, kind, author, content, metadata, created_at, acknowledged
             FROM events WHERE tenant_id = ? AND acknowledged = 0",
        );
        let mut binds: Vec<SqlValue> = vec![SqlValue::Integer(tenant_id)];
        if let Some(since) = since {
            sql.push_str(" AND created_at >= ?");
            binds.push(SqlValue::Integer(since as i64));
        }
        if let Some(kinds) = kinds.filter(|k| !k.is_empty()) {
            let placeholders = vec!["?"; kinds.len()].join(", ");
            sql.push_str(&format!(" AND kind IN ({placeholders})"));
            binds.extend(kinds.iter().map(|k| SqlValue::Text(k.clone())));
        }
        sql.push_str(" ORDER BY created_at ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(binds), stored_event_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Mark events acknowledged; returns (acknowledged now, still pending).
    pub fn acknowledge_events(&self, tenant_id: i64, ids: &[String]) -> Result<(usize, usize)> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut acknowledged = 0;
        for id in ids {
            acknowledged += tx.execute(
                "UPDATE events SET acknowledged = 1 WHERE tenant_id = ?1 AND event_id = ?2 AND acknowledged = 0",
                params![tenant_id, id],
            )?;
        }
        let remaining: usize = tx.query_row(
            "SELECT COUNT(*) FROM events WHERE tenant_id = ?1 AND acknowledged = 0",
            params![tenant_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok((acknowledged, remaining))
    }

    /// Per-GMT-hour counts of all engagement events since `since`.
    pub fn engagement_hourly(&self, tenant_id: i64, since: u64) -> Result<[u64; 24]> {
        let conn = self.conn.lock().unwrap();
        hourly(
            &conn,
            "SELECT (created_at % 86400) / 3600 AS h, COUNT(*) FROM events
             WHERE tenant_id = ?1 AND created_at >= ?2 GROUP BY h",
            tenant_id,
            since,
        )
    }

    /// Count events by internal kind since `since`.
    pub fn summary_stats(&self, tenant_id: i64, since: u64) -> Result<SummaryStats> {
        let conn = self.conn.lock().unwrap();
        let mut stats = SummaryStats::default();
        let mut stmt = conn.prepare(
            "SELECT kind, COUNT(*) FROM events WHERE tenant_id = ?1 AND created_at >= ?2 GROUP BY kind",
        )?;
        let rows = stmt.query_map(params![tenant_id, since], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (kind, count) = row?;
            match kind.as_str() {
                "mention" => stats.mentions = count,
                "reply" => stats.replies = count,
                "reaction" => stats.reactions = count,
                "repost" => stats.reposts = count,
                "follow" => stats.new_followers = count,
                "zap" => stats.zaps = count,
                _ => {}
            }
        }
        let mut stmt = conn.prepare(
            "SELECT metadata FROM events WHERE tenant_id = ?1 AND kind = 'zap' AND created_at >= ?2",
        )?;
        let rows = stmt.query_map(params![tenant_id, since], |row| row.get::<_, String>(0))?;
        for row in rows {
            if let Ok(meta) = serde_json::from_str::<Value>(&row?) {
                stats.zap_sats += meta.get("sats").and_then(Value::as_u64).unwrap_or(0);
            }
        }
        stats.posts = conn.query_row(
            "SELECT COUNT(*) FROM posts WHERE tenant_id = ?1 AND posted_at >= ?2",
            params![tenant_id, since],
            |row| row.get(0),
        )?;
        Ok(stats)
    }

    /// Daily new-follower counts since `since`, oldest first.
    pub fn follower_gain_series(&self, tenant_id: i64, since: u64) -> Result<Vec<(String, u64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT date(created_at, 'unixepoch') AS day, COUNT(*) FROM events
             WHERE tenant_id = ?1 AND kind = 'follow' AND created_at >= ?2
             GROUP BY day ORDER BY day",
        )?;
        let rows = stmt.query_map(params![tenant_id, since], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // ---- posts ----

    /// Upsert the content of a tenant's own post, preserving counters.
    pub fn upsert_post_content(
        &self,
        tenant_id: i64,
        note_id: &str,
        content: &str,
        image_url: Option<&str>,
        posted_at: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO posts (tenant_id, note_id, content, image_url, posted_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (note_id) DO UPDATE SET
                 content = excluded.content,
                 image_url = excluded.image_url,
                 posted_at = excluded.posted_at",
            params![tenant_id, note_id, content, image_url, posted_at],
        )?;
        Ok(())
    }

    /// Whether `note_id` is a stored post of this tenant.
    pub fn post_belongs(&self, tenant_id: i64, note_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT tenant_id FROM posts WHERE note_id = ?1",
                params![note_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found == Some(tenant_id))
    }

    pub fn post(&self, note_id: &str) -> Result<Option<Post>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT note_id, content, image_url, posted_at, reactions, replies, reposts,
                        impressions, zap_count, zap_total
                 FROM posts WHERE note_id = ?1",
                params![note_id],
                post_from_row,
            )
            .optional()?)
    }

    pub fn posts_for_tenant(
        &self,
        tenant_id: i64,
        limit: usize,
        sort: PostSort,
    ) -> Result<Vec<Post>> {
        let conn = self.conn.lock().unwrap();
        let order = match sort {
            PostSort::Recent => "posted_at DESC",
            PostSort::Engagement => "(reactions + replies + reposts + zap_count) DESC, posted_at DESC",
        };
        let mut stmt = conn.prepare(&format!(
            "SELECT note_id, content, image_url, posted_at, reactions, replies, reposts,
                    impressions, zap_count, zap_total
             FROM posts WHERE tenant_id = ?1 ORDER BY {order} LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![tenant_id, limit], post_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn posts_count(&self, tenant_id: i64) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM posts WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?)
    }

    // ---- followers / following ----

    pub fn is_follower(&self, tenant_id: i64, pubkey: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM followers WHERE tenant_id = ?1 AND pubkey = ?2",
                params![tenant_id, pubkey],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn followers_count(&self, tenant_id: i64) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM followers WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?)
    }

    /// Replace the tenant's following set with a freshly scanned one.
    pub fn replace_following(&self, tenant_id: i64, pubkeys: &[String]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM following WHERE tenant_id = ?1",
            params![tenant_id],
        )?;
        for pk in pubkeys {
            tx.execute(
                "INSERT OR IGNORE INTO following (tenant_id, pubkey) VALUES (?1, ?2)",
                params![tenant_id, pk],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn following_count(&self, tenant_id: i64) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM following WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?)
    }

    pub fn following_set(&self, tenant_id: i64) -> Result<HashSet<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT pubkey FROM following WHERE tenant_id = ?1")?;
        let rows = stmt.query_map(params![tenant_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // ---- post activity / network activity ----

    /// Record one observed post for timing analytics; duplicates are ignored.
    pub fn insert_post_activity(
        &self,
        tenant_id: i64,
        author: &str,
        author_role: &str,
        note_id: &str,
        posted_at: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO post_activity (tenant_id, author, author_role, note_id, posted_at, hour)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                tenant_id,
                author,
                author_role,
                note_id,
                posted_at,
                crate::event::hour_of_day(posted_at)
            ],
        )?;
        Ok(())
    }

    /// Per-GMT-hour counts of post activity for a role since `since`.
    pub fn activity_hourly(&self, tenant_id: i64, role: &str, since: u64) -> Result<[u64; 24]> {
        let conn = self.conn.lock().unwrap();
        let mut counts = [0u64; 24];
        let mut stmt = conn.prepare(
            "SELECT hour, COUNT(*) FROM post_activity
             WHERE tenant_id = ?1 AND author_role = ?2 AND posted_at >= ?3 GROUP BY hour",
        )?;
        let rows = stmt.query_map(params![tenant_id, role, since], |row| {
            Ok((row.get::<_, u64>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (hour, count) = row?;
            if hour < 24 {
                counts[hour as usize] = count;
            }
        }
        Ok(counts)
    }

    /// Total post-activity rows since `since`, all roles.
    pub fn activity_points(&self, tenant_id: i64, since: u64) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM post_activity WHERE tenant_id = ?1 AND posted_at >= ?2",
            params![tenant_id, since],
            |row| row.get(0),
        )?)
    }

    /// Overwrite the histogram bucket for (tenant, kind, hour, window date).
    pub fn upsert_network_activity(
        &self,
        tenant_id: i64,
        kind: &str,
        hour: u8,
        count: u64,
        window_date: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO network_activity (tenant_id, kind, hour, count, window_date)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (tenant_id, kind, hour, window_date) DO UPDATE SET count = excluded.count",
            params![tenant_id, kind, hour, count, window_date],
        )?;
        Ok(())
    }

    /// Latest persisted 24-hour histogram for (tenant, kind).
    pub fn network_histogram(&self, tenant_id: i64, kind: &str) -> Result<[u64; 24]> {
        let conn = self.conn.lock().unwrap();
        let mut counts = [0u64; 24];
        let mut stmt = conn.prepare(
            "SELECT hour, count FROM network_activity
             WHERE tenant_id = ?1 AND kind = ?2
               AND window_date = (SELECT MAX(window_date) FROM network_activity
                                  WHERE tenant_id = ?1 AND kind = ?2)",
        )?;
        let rows = stmt.query_map(params![tenant_id, kind], |row| {
            Ok((row.get::<_, u64>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (hour, count) = row?;
            if hour < 24 {
                counts[hour as usize] = count;
            }
        }
        Ok(counts)
    }

    // ---- insight cache rows ----

    pub fn insight(&self, tenant_id: i64, kind: &str, period: &str) -> Result<Option<(Value, u64)>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, u64)> = conn
            .query_row(
                "SELECT data, expires_at FROM insights
                 WHERE tenant_id = ?1 AND kind = ?2 AND period = ?3",
                params![tenant_id, kind, period],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((data, expires_at)) => Ok(Some((serde_json::from_str(&data)?, expires_at))),
            None => Ok(None),
        }
    }

    pub fn put_insight(
        &self,
        tenant_id: i64,
        kind: &str,
        period: &str,
        data: &Value,
        ttl_secs: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_unix();
        conn.execute(
            "INSERT INTO insights (tenant_id, kind, period, data, calculated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (tenant_id, kind, period) DO UPDATE SET
                 data = excluded.data,
                 calculated_at = excluded.calculated_at,
                 expires_at = excluded.expires_at",
            params![tenant_id, kind, period, data.to_string(), now, now + ttl_secs],
        )?;
        Ok(())
    }

    pub fn invalidate_insights(&self, tenant_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM insights WHERE tenant_id = ?1",
            params![tenant_id],
        )?;
        Ok(())
    }

    // ---- webhook log ----

    /// Queue a webhook outside of event routing (daily summaries).
    pub fn enqueue_webhook(&self, tenant_id: i64, event_kind: &str, payload: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO webhook_log (tenant_id, event_kind, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![tenant_id, event_kind, payload, now_unix()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn pending_webhooks(&self, limit: usize) -> Result<Vec<WebhookJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, event_kind, payload, retry_count FROM webhook_log
             WHERE status = 'pending' ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(WebhookJob {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                event_kind: row.get(2)?,
                payload: row.get(3)?,
                retry_count: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn mark_webhook_sent(&self, id: i64, http_code: u16) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE webhook_log SET status = 'sent', detail = ?1, sent_at = ?2 WHERE id = ?3",
            params![http_code.to_string(), now_unix(), id],
        )?;
        Ok(())
    }

    /// Record a failed attempt; terminal failures leave the `failed` state.
    pub fn mark_webhook_failed(&self, id: i64, detail: &str, terminal: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let status = if terminal { "failed" } else { "pending" };
        conn.execute(
            "UPDATE webhook_log SET status = ?1, detail = ?2, retry_count = retry_count + 1 WHERE id = ?3",
            params![status, detail, id],
        )?;
        Ok(())
    }

    /// Timestamp of the most recent daily summary enqueue for a tenant.
    pub fn last_daily_summary(&self, tenant_id: i64) -> Result<Option<u64>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT MAX(created_at) FROM webhook_log WHERE tenant_id = ?1 AND event_kind = 'daily_summary'",
            params![tenant_id],
            |row| row.get(0),
        )?)
    }

    /// (status, detail, retry_count) of a log row, for tests and diagnostics.
    pub fn webhook_status(&self, id: i64) -> Result<Option<(String, String, u32)>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT status, detail, retry_count FROM webhook_log WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?)
    }

    // ---- engagers ----

    /// Leaderboard of event authors over a window, busiest first.
    pub fn top_engagers(
        &self,
        tenant_id: i64,
        since: u64,
        min_interactions: u64,
        limit: usize,
    ) -> Result<Vec<Engager>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT author, COUNT(*) AS n, MAX(created_at) FROM events
             WHERE tenant_id = ?1 AND created_at >= ?2
             GROUP BY author HAVING n >= ?3
             ORDER BY n DESC, author ASC LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![tenant_id, since, min_interactions, limit],
            |row| {
                Ok(Engager {
                    pubkey: row.get(0)?,
                    interactions: row.get(1)?,
                    last_seen: row.get(2)?,
                })
            },
        )?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// All-time interaction count from the engager aggregate.
    pub fn engager_interactions(&self, tenant_id: i64, pubkey: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT interactions FROM engagers WHERE tenant_id = ?1 AND pubkey = ?2",
                params![tenant_id, pubkey],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0))
    }

    // ---- rate limits ----

    /// Count a request against the hourly window; denied requests do not
    /// consume budget, so used + remaining always equals the limit.
    pub fn check_rate_limit(
        &self,
        tenant_id: i64,
        endpoint: &str,
        limit: u32,
    ) -> Result<RateDecision> {
        let conn = self.conn.lock().unwrap();
        let now = now_unix();
        let window_start = now - now % 3_600;
        conn.execute(
            "INSERT OR IGNORE INTO rate_limits (tenant_id, endpoint, window_start, count) VALUES (?1, ?2, ?3, 0)",
            params![tenant_id, endpoint, window_start],
        )?;
        let granted = conn.execute(
            "UPDATE rate_limits SET count = count + 1
             WHERE tenant_id = ?1 AND endpoint = ?2 AND window_start = ?3 AND count < ?4",
            params![tenant_id, endpoint, window_start, limit],
        )?;
        let count: u32 = conn.query_row(
            "SELECT count FROM rate_limits WHERE tenant_id = ?1 AND endpoint = ?2 AND window_start = ?3",
            params![tenant_id, endpoint, window_start],
            |row| row.get(0),
        )?;
        Ok(RateDecision {
            allowed: granted > 0,
            limit,
            remaining: limit.saturating_sub(count),
            reset: window_start + 3_600,
        })
    }
}

/// Generate an opaque hex token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn tenant_by(conn: &Connection, column: &str, value: &str) -> Result<Option<Tenant>> {
    let sql = format!(
        "SELECT id, pubkey, callback_url, callback_secret, api_token, tier, created_at, last_active
         FROM tenants WHERE {column} = ?1"
    );
    Ok(conn
        .query_row(&sql, params![value], |row| {
            Ok(Tenant {
                id: row.get(0)?,
                pubkey: row.get(1)?,
                callback_url: row.get(2)?,
                callback_secret: row.get(3)?,
                api_token: row.get(4)?,
                tier: Tier::parse(&row.get::<_, String>(5)?),
                created_at: row.get(6)?,
                last_active: row.get(7)?,
            })
        })
        .optional()?)
}

fn stored_event_from_row(row: &Row) -> rusqlite::Result<StoredEvent> {
    let metadata: String = row.get(5)?;
    Ok(StoredEvent {
        tenant_id: row.get(0)?,
        event_id: row.get(1)?,
        kind: row.get(2)?,
        author: row.get(3)?,
        content: row.get(4)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        created_at: row.get(6)?,
        acknowledged: row.get(7)?,
    })
}

fn post_from_row(row: &Row) -> rusqlite::Result<Post> {
    Ok(Post {
        note_id: row.get(0)?,
        content: row.get(1)?,
        image_url: row.get(2)?,
        posted_at: row.get(3)?,
        reactions: row.get(4)?,
        replies: row.get(5)?,
        reposts: row.get(6)?,
        impressions: row.get(7)?,
        zap_count: row.get(8)?,
        zap_total: row.get(9)?,
    })
}

fn hourly(conn: &Connection, sql: &str, tenant_id: i64, since: u64) -> Result<[u64; 24]> {
    let mut counts = [0u64; 24];
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![tenant_id, since], |row| {
        Ok((row.get::<_, u64>(0)?, row.get::<_, u64>(1)?))
    })?;
    for row in rows {
        let (hour, count) = row?;
        if hour < 24 {
            counts[hour as usize] = count;
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> Store {
        let s = Store::in_memory().unwrap();
        s.init().unwrap();
        s
    }

    fn tenant(s: &Store, pubkey: &str) -> Tenant {
        s.create_tenant(pubkey, "http://cb.example/hook", "s3cret", Tier::Free)
            .unwrap()
    }

    fn record(tenant_id: i64, event_id: &str, kind: EventKind) -> EventRecord {
        EventRecord {
            tenant_id,
            event_id: event_id.into(),
            kind,
            author: "author1".into(),
            content: "hi".into(),
            metadata: json!({}),
            created_at: 1_700_000_000,
            target_note: None,
            zap_sats: 0,
            webhook_payload: Some(json!({"event_type": "mention"}).to_string()),
        }
    }

    #[test]
    fn init_is_idempotent() {
        let s = store();
        s.init().unwrap();
    }

    #[test]
    fn tenant_round_trip_and_duplicate_pubkey() {
        let s = store();
        let t = tenant(&s, "pk1");
        assert_eq!(t.tier, Tier::Free);
        assert_eq!(t.api_token.len(), 64);
        let again = s.tenant_by_pubkey("pk1").unwrap().unwrap();
        assert_eq!(again.id, t.id);
        assert!(s
            .create_tenant("pk1", "http://other", "x", Tier::Premium)
            .is_err());
    }

    #[test]
    fn authenticate_legacy_and_credential_precedence() {
        let s = store();
        let t = tenant(&s, "pk1");
        let by_legacy = s.authenticate(&t.api_token).unwrap().unwrap();
        assert_eq!(by_legacy.tenant.id, t.id);
        assert!(by_legacy.scopes.is_none());

        let cred = s.create_credential(t.id, &["read"], None).unwrap();
        let by_cred = s.authenticate(&cred).unwrap().unwrap();
        assert_eq!(by_cred.tenant.id, t.id);
        assert_eq!(by_cred.scopes, Some(vec!["read".to_string()]));

        s.revoke_credential(&cred).unwrap();
        assert!(s.authenticate(&cred).unwrap().is_none());
        assert!(s.authenticate("unknown").unwrap().is_none());
    }

    #[test]
    fn credential_scope_sets_parse() {
        let s = store();
        let t = tenant(&s, "pk1");
        let multi = s.create_credential(t.id, &["read", "write"], None).unwrap();
        let grant = s.authenticate(&multi).unwrap().unwrap();
        assert_eq!(
            grant.scopes,
            Some(vec!["read".to_string(), "write".into()])
        );
        // a credential issued without scopes is unrestricted
        let unscoped = s.create_credential(t.id, &[], None).unwrap();
        let grant = s.authenticate(&unscoped).unwrap().unwrap();
        assert!(grant.scopes.is_none());
    }

    #[test]
    fn expired_credential_rejected() {
        let s = store();
        let t = tenant(&s, "pk1");
        let cred = s.create_credential(t.id, &[], Some(1)).unwrap();
        assert!(s.authenticate(&cred).unwrap().is_none());
    }

    #[test]
    fn update_webhook_fields() {
        let s = store();
        let t = tenant(&s, "pk1");
        s.update_webhook(t.id, Some("http://new.example"), None)
            .unwrap();
        s.update_webhook(t.id, None, Some("newsecret")).unwrap();
        let t = s.tenant_by_id(t.id).unwrap().unwrap();
        assert_eq!(t.callback_url, "http://new.example");
        assert_eq!(t.callback_secret, "newsecret");
    }

    #[test]
    fn record_event_is_idempotent_and_queues_one_webhook() {
        let s = store();
        let t = tenant(&s, "pk1");
        let rec = record(t.id, "ev1", EventKind::Mention);
        assert!(s.record_event(&rec).unwrap());
        assert!(!s.record_event(&rec).unwrap());
        let pending = s.pending_webhooks(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_kind, "mention");
    }

    #[test]
    fn same_event_two_tenants_two_rows() {
        let s = store();
        let t1 = tenant(&s, "pk1");
        let t2 = tenant(&s, "pk2");
        assert!(s.record_event(&record(t1.id, "ev1", EventKind::Mention)).unwrap());
        assert!(s.record_event(&record(t2.id, "ev1", EventKind::Mention)).unwrap());
        assert_eq!(s.pending_webhooks(10).unwrap().len(), 2);
    }

    #[test]
    fn reaction_creates_stub_and_bumps_counter() {
        let s = store();
        let t = tenant(&s, "pk1");
        let mut rec = record(t.id, "ev1", EventKind::Reaction);
        rec.target_note = Some("note1".into());
        s.record_event(&rec).unwrap();
        let post = s.post("note1").unwrap().unwrap();
        assert_eq!(post.reactions, 1);
        assert_eq!(post.replies, 0);
        assert!(s.post_belongs(t.id, "note1").unwrap());
        assert!(!s.post_belongs(t.id + 1, "note1").unwrap());
    }

    #[test]
    fn zap_bumps_zap_counters() {
        let s = store();
        let t = tenant(&s, "pk1");
        let mut rec = record(t.id, "ev1", EventKind::Zap);
        rec.target_note = Some("note1".into());
        rec.zap_sats = 2_100;
        s.record_event(&rec).unwrap();
        let post = s.post("note1").unwrap().unwrap();
        assert_eq!(post.zap_count, 1);
        assert_eq!(post.zap_total, 2_100);
    }

    #[test]
    fn follow_inserts_follower_once() {
        let s = store();
        let t = tenant(&s, "pk1");
        let rec = record(t.id, "ev1", EventKind::Follow);
        s.record_event(&rec).unwrap();
        assert!(s.is_follower(t.id, "author1").unwrap());
        assert_eq!(s.followers_count(t.id).unwrap(), 1);
        let mut rec2 = record(t.id, "ev2", EventKind::Follow);
        rec2.author = "author1".into();
        s.record_event(&rec2).unwrap();
        assert_eq!(s.followers_count(t.id).unwrap(), 1);
    }

    #[test]
    fn engager_aggregate_counts_interactions() {
        let s = store();
        let t = tenant(&s, "pk1");
        s.record_event(&record(t.id, "ev1", EventKind::Mention)).unwrap();
        s.record_event(&record(t.id, "ev2", EventKind::Reply)).unwrap();
        assert_eq!(s.engager_interactions(t.id, "author1").unwrap(), 2);
    }

    #[test]
    fn acknowledge_flow() {
        let s = store();
        let t = tenant(&s, "pk1");
        s.record_event(&record(t.id, "ev1", EventKind::Mention)).unwrap();
        s.record_event(&record(t.id, "ev2", EventKind::Reply)).unwrap();
        let unacked = s.unacknowledged_events(t.id, None, None).unwrap();
        assert_eq!(unacked.len(), 2);
        let (acked, remaining) = s
            .acknowledge_events(t.id, &["ev1".to_string(), "missing".to_string()])
            .unwrap();
        assert_eq!(acked, 1);
        assert_eq!(remaining, 1);
        // acknowledging again is a no-op
        let (acked, remaining) = s.acknowledge_events(t.id, &["ev1".to_string()]).unwrap();
        assert_eq!(acked, 0);
        assert_eq!(remaining, 1);
        let left = s.unacknowledged_events(t.id, None, None).unwrap();
        assert_eq!(left[0].event_id, "ev2");
    }

    #[test]
    fn unacknowledged_filters_by_since_and_kind() {
        let s = store();
        let t = tenant(&s, "pk1");
        let mut old = record(t.id, "ev1", EventKind::Mention);
        old.created_at = 100;
        s.record_event(&old).unwrap();
        s.record_event(&record(t.id, "ev2", EventKind::Reply)).unwrap();
        let since = s
            .unacknowledged_events(t.id, Some(1_000), None)
            .unwrap();
        assert_eq!(since.len(), 1);
        let kinds = s
            .unacknowledged_events(t.id, None, Some(&["mention".to_string()]))
            .unwrap();
        assert_eq!(kinds.len(), 1);
        assert_eq!(kinds[0].event_id, "ev1");
        // kind values bind as parameters, never as SQL text
        let quoted = s
            .unacknowledged_events(t.id, None, Some(&["men'tion".to_string()]))
            .unwrap();
        assert!(quoted.is_empty());
        // an empty kind list means no kind filter
        let all = s.unacknowledged_events(t.id, None, Some(&[])).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn post_activity_hourly_and_dedup() {
        let s = store();
        let t = tenant(&s, "pk1");
        // 14:00 GMT
        let ts = 1_700_000_000 - 1_700_000_000 % 86_400 + 14 * 3_600;
        s.insert_post_activity(t.id, "f1", "follower", "n1", ts).unwrap();
        s.insert_post_activity(t.id, "f1", "follower", "n1", ts).unwrap();
        s.insert_post_activity(t.id, "f2", "follower", "n2", ts + 60).unwrap();
        let counts = s.activity_hourly(t.id, "follower", 0).unwrap();
        assert_eq!(counts[14], 2);
        assert_eq!(counts.iter().sum::<u64>(), 2);
        assert_eq!(s.activity_points(t.id, 0).unwrap(), 2);
    }

    #[test]
    fn network_activity_upsert_overwrites() {
        let s = store();
        let t = tenant(&s, "pk1");
        s.upsert_network_activity(t.id, "engagement", 14, 5, "2026-08-01").unwrap();
        s.upsert_network_activity(t.id, "engagement", 14, 9, "2026-08-01").unwrap();
        let counts = s.network_histogram(t.id, "engagement").unwrap();
        assert_eq!(counts[14], 9);
        // newer window date wins
        s.upsert_network_activity(t.id, "engagement", 2, 3, "2026-08-02").unwrap();
        let counts = s.network_histogram(t.id, "engagement").unwrap();
        assert_eq!(counts[2], 3);
        assert_eq!(counts[14], 0);
    }

    #[test]
    fn insight_rows_round_trip() {
        let s = store();
        let t = tenant(&s, "pk1");
        assert!(s.insight(t.id, "timing", "7d").unwrap().is_none());
        s.put_insight(t.id, "timing", "7d", &json!({"x": 1}), 3_600).unwrap();
        let (data, expires) = s.insight(t.id, "timing", "7d").unwrap().unwrap();
        assert_eq!(data["x"], 1);
        assert!(expires > now_unix());
        s.invalidate_insights(t.id).unwrap();
        assert!(s.insight(t.id, "timing", "7d").unwrap().is_none());
    }

    #[test]
    fn webhook_log_state_transitions() {
        let s = store();
        let t = tenant(&s, "pk1");
        let id = s
            .enqueue_webhook(t.id, "daily_summary", "{}")
            .unwrap();
        s.mark_webhook_failed(id, "timeout", false).unwrap();
        let (status, detail, retries) = s.webhook_status(id).unwrap().unwrap();
        assert_eq!(status, "pending");
        assert_eq!(detail, "timeout");
        assert_eq!(retries, 1);
        s.mark_webhook_sent(id, 200).unwrap();
        let (status, detail, _) = s.webhook_status(id).unwrap().unwrap();
        assert_eq!(status, "sent");
        assert_eq!(detail, "200");

        let id2 = s.enqueue_webhook(t.id, "mention", "{}").unwrap();
        s.mark_webhook_failed(id2, "500", true).unwrap();
        let (status, _, _) = s.webhook_status(id2).unwrap().unwrap();
        assert_eq!(status, "failed");
        assert!(s.pending_webhooks(10).unwrap().is_empty());
        assert!(s.last_daily_summary(t.id).unwrap().is_some());
    }

    #[test]
    fn top_engagers_orders_and_filters() {
        let s = store();
        let t = tenant(&s, "pk1");
        for (i, author) in ["a", "a", "a", "b", "b", "c"].iter().enumerate() {
            let mut rec = record(t.id, &format!("ev{i}"), EventKind::Mention);
            rec.author = author.to_string();
            s.record_event(&rec).unwrap();
        }
        let top = s.top_engagers(t.id, 0, 2, 10).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].pubkey, "a");
        assert_eq!(top[0].interactions, 3);
        assert_eq!(top[1].pubkey, "b");
    }

    #[test]
    fn rate_limit_denies_without_consuming() {
        let s = store();
        let t = tenant(&s, "pk1");
        for i in 0..3 {
            let d = s.check_rate_limit(t.id, "/metrics/summary", 3).unwrap();
            assert!(d.allowed, "request {i} should pass");
            assert_eq!(d.remaining, 3 - (i + 1));
        }
        let denied = s.check_rate_limit(t.id, "/metrics/summary", 3).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset % 3_600, 0);
        // a different endpoint has its own window
        assert!(s.check_rate_limit(t.id, "/metrics/posts", 3).unwrap().allowed);
    }

    #[test]
    fn summary_stats_counts_by_kind() {
        let s = store();
        let t = tenant(&s, "pk1");
        s.record_event(&record(t.id, "e1", EventKind::Mention)).unwrap();
        s.record_event(&record(t.id, "e2", EventKind::Follow)).unwrap();
        let mut zap = record(t.id, "e3", EventKind::Zap);
        zap.metadata = json!({"sats": 500});
        s.record_event(&zap).unwrap();
        s.upsert_post_content(t.id, "n1", "hello", None, 1_700_000_100).unwrap();
        let stats = s.summary_stats(t.id, 0).unwrap();
        assert_eq!(stats.mentions, 1);
        assert_eq!(stats.new_followers, 1);
        assert_eq!(stats.zaps, 1);
        assert_eq!(stats.zap_sats, 500);
        assert_eq!(stats.posts, 1);
    }

    #[test]
    fn follower_gain_series_groups_by_day() {
        let s = store();
        let t = tenant(&s, "pk1");
        let day = 86_400;
        for (i, ts) in [10 * day, 10 * day + 60, 11 * day].iter().enumerate() {
            let mut rec = record(t.id, &format!("f{i}"), EventKind::Follow);
            rec.author = format!("follower{i}");
            rec.created_at = *ts;
            s.record_event(&rec).unwrap();
        }
        let series = s.follower_gain_series(t.id, 0).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].1, 2);
        assert_eq!(series[1].1, 1);
    }

    #[test]
    fn posts_sorting() {
        let s = store();
        let t = tenant(&s, "pk1");
        s.upsert_post_content(t.id, "old", "first", None, 100).unwrap();
        s.upsert_post_content(t.id, "new", "second", None, 200).unwrap();
        let mut rec = record(t.id, "ev1", EventKind::Reaction);
        rec.target_note = Some("old".into());
        s.record_event(&rec).unwrap();
        let recent = s.posts_for_tenant(t.id, 10, PostSort::Recent).unwrap();
        assert_eq!(recent[0].note_id, "new");
        let engaged = s.posts_for_tenant(t.id, 10, PostSort::Engagement).unwrap();
        assert_eq!(engaged[0].note_id, "old");
        assert_eq!(s.posts_count(t.id).unwrap(), 2);
    }

    #[test]
    fn following_replacement() {
        let s = store();
        let t = tenant(&s, "pk1");
        s.replace_following(t.id, &["a".into(), "b".into()]).unwrap();
        assert_eq!(s.following_count(t.id).unwrap(), 2);
        s.replace_following(t.id, &["c".into()]).unwrap();
        let set = s.following_set(t.id).unwrap();
        assert!(set.contains("c"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn delete_tenant_cascades() {
        let s = store();
        let t = tenant(&s, "pk1");
        s.record_event(&record(t.id, "ev1", EventKind::Mention)).unwrap();
        s.insert_post_activity(t.id, "a", "follower", "n1", 100).unwrap();
        s.delete_tenant(t.id).unwrap();
        assert!(s.tenant_by_id(t.id).unwrap().is_none());
        assert!(s.unacknowledged_events(t.id, None, None).unwrap().is_empty());
        assert_eq!(s.activity_points(t.id, 0).unwrap(), 0);
    }

    #[test]
    fn upsert_post_content_fills_stub() {
        let s = store();
        let t = tenant(&s, "pk1");
        let mut rec = record(t.id, "ev1", EventKind::Reply);
        rec.target_note = Some("note1".into());
        s.record_event(&rec).unwrap();
        s.upsert_post_content(t.id, "note1", "the post", Some("http://img"), 1_700_000_000)
            .unwrap();
        let post = s.post("note1").unwrap().unwrap();
        assert_eq!(post.content, "the post");
        assert_eq!(post.replies, 1);
        assert_eq!(post.image_url.as_deref(), Some("http://img"));
    }
}
