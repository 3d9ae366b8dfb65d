//! Maps relay events to tenants and persists them with their side effects.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use crate::event::{
    now_unix, Event, KIND_CONTACT_LIST, KIND_REACTION, KIND_REPOST, KIND_TEXT_NOTE,
    KIND_ZAP_RECEIPT,
};
use crate::invoice;
use crate::pool::FrameBuffer;
use crate::registry::TenantRegistry;
use crate::store::{EventKind, EventRecord, Store};

/// Events first observed more than this many seconds after creation are
/// persisted for analytics but never produce a webhook.
const HISTORICAL_CUTOFF_SECS: u64 = 7 * 86_400;

/// Bounded set of recently routed (tenant, event) pairs.
///
/// A fast filter in front of the store; the events table's primary key
/// remains the authoritative uniqueness check.
struct RoutedPairs {
    set: HashSet<(i64, String)>,
    order: VecDeque<(i64, String)>,
    capacity: usize,
}

impl RoutedPairs {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, tenant_id: i64, event_id: &str) -> bool {
        let key = (tenant_id, event_id.to_string());
        if self.set.contains(&key) {
            return false;
        }
        if self.set.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.set.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

/// Routes candidate events from the relay pool into the store.
pub struct EventRouter {
    store: Store,
    registry: Arc<TenantRegistry>,
    seen: RoutedPairs,
    /// Wakes the webhook dispatcher after an enqueue.
    pub dispatch_notify: Arc<Notify>,
}

impl EventRouter {
    pub fn new(store: Store, registry: Arc<TenantRegistry>) -> Self {
        Self {
            store,
            registry,
            seen: RoutedPairs::new(1 << 16),
            dispatch_notify: Arc::new(Notify::new()),
        }
    }

    /// Drain the pool buffer until shutdown.
    pub async fn run(mut self, buffer: Arc<FrameBuffer>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let (relay, event) = tokio::select! {
                item = buffer.pop() => item,
                _ = shutdown.changed() => return,
            };
            // one bad event never halts the pipeline
            if let Err(e) = self.route(&event) {
                warn!("dropping event {} from {relay}: {e:#}", event.id);
            }
        }
    }

    /// Classify and persist one event for every tenant it targets.
    pub fn route(&mut self, event: &Event) -> Result<()> {
        match event.kind {
            KIND_TEXT_NOTE => self.route_text_note(event),
            KIND_CONTACT_LIST => self.route_contact_list(event),
            KIND_REACTION => self.route_post_engagement(event, EventKind::Reaction),
            KIND_REPOST => self.route_post_engagement(event, EventKind::Repost),
            KIND_ZAP_RECEIPT => self.route_zap(event),
            other => {
                debug!("ignoring event {} of kind {other}", event.id);
                Ok(())
            }
        }
    }

    /// Text note: a mention for every tenant in its p-tags, upgraded to a
    /// reply when an e-tag references a stored post of that tenant.
    fn route_text_note(&mut self, event: &Event) -> Result<()> {
        // a tenant's own note fills in (or creates) its post row
        if let Some(tenant_id) = self.registry.lookup(&event.pubkey) {
            self.store.upsert_post_content(
                tenant_id,
                &event.id,
                &event.content,
                None,
                event.created_at,
            )?;
        }
        for tenant_id in self.target_tenants(event) {
            if self.registry.lookup(&event.pubkey) == Some(tenant_id) {
                continue; // self-mentions are not engagement
            }
            let replied_note = event
                .e_tags()
                .into_iter()
                .find(|note| self.store.post_belongs(tenant_id, note).unwrap_or(false))
                .map(str::to_string);
            let (kind, target_note) = match replied_note {
                Some(note) => (EventKind::Reply, Some(note)),
                None => (EventKind::Mention, None),
            };
            self.persist(event, tenant_id, kind, target_note, 0, json!({}))?;
        }
        Ok(())
    }

    /// Contact list: each tenant in the p-tags gains the author as follower,
    /// unless already recorded.
    fn route_contact_list(&mut self, event: &Event) -> Result<()> {
        if self.registry.lookup(&event.pubkey).is_some() {
            // a tenant updating its own contact list is the scanner's domain
            return Ok(());
        }
        for tenant_id in self.target_tenants(event) {
            if self.store.is_follower(tenant_id, &event.pubkey)? {
                continue;
            }
            self.persist(event, tenant_id, EventKind::Follow, None, 0, json!({}))?;
        }
        Ok(())
    }

    /// Reaction or repost referencing a tenant post; unknown notes get a stub.
    fn route_post_engagement(&mut self, event: &Event, kind: EventKind) -> Result<()> {
        let target = event.e_tags().last().map(|s| s.to_string());
        for tenant_id in self.target_tenants(event) {
            self.persist(event, tenant_id, kind, target.clone(), 0, json!({}))?;
        }
        Ok(())
    }

    /// Zap receipt: amount extracted from the bolt11 invoice when parsable.
    fn route_zap(&mut self, event: &Event) -> Result<()> {
        let (sats, parsed) = event
            .first_tag("bolt11")
            .map(invoice::amount_sats)
            .unwrap_or((0, false));
        let metadata = if parsed {
            json!({ "sats": sats })
        } else {
            json!({ "sats": 0, "unparsable_amount": true })
        };
        let target = event.e_tags().last().map(|s| s.to_string());
        for tenant_id in self.target_tenants(event) {
            self.persist(
                event,
                tenant_id,
                EventKind::Zap,
                target.clone(),
                sats,
                metadata.clone(),
            )?;
        }
        Ok(())
    }

    /// Tenants referenced by the event's p-tags, deduplicated.
    fn target_tenants(&self, event: &Event) -> Vec<i64> {
        let mut ids: Vec<i64> = event
            .p_tags()
            .into_iter()
            .filter_map(|pk| self.registry.lookup(pk))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn persist(
        &mut self,
        event: &Event,
        tenant_id: i64,
        kind: EventKind,
        target_note: Option<String>,
        zap_sats: u64,
        metadata: serde_json::Value,
    ) -> Result<()> {
        if !self.seen.insert(tenant_id, &event.id) {
            return Ok(());
        }
        let webhook_payload = webhook_payload(event, kind, zap_sats);
        let record = EventRecord {
            tenant_id,
            event_id: event.id.clone(),
            kind,
            author: event.pubkey.clone(),
            content: event.content.clone(),
            metadata,
            created_at: event.created_at,
            target_note,
            zap_sats,
            webhook_payload,
        };
        if self.store.record_event(&record)? {
            self.dispatch_notify.notify_one();
        }
        Ok(())
    }
}

/// Build the outbound webhook payload, or none for historical events.
fn webhook_payload(event: &Event, kind: EventKind, zap_sats: u64) -> Option<String> {
    let age = now_unix().saturating_sub(event.created_at);
    if age > HISTORICAL_CUTOFF_SECS {
        return None;
    }
    let event_type = match kind {
        EventKind::Mention | EventKind::Reply => "mention",
        EventKind::Follow => "new_follower",
        EventKind::Zap => "zap",
        // reactions and reposts update counters without a push
        EventKind::Reaction | EventKind::Repost => return None,
    };
    let mut payload = json!({
        "event_type": event_type,
        "timestamp": now_unix(),
        "event_id": event.id,
        "author": event.pubkey,
    });
    match kind {
        EventKind::Mention | EventKind::Reply => {
            payload["content"] = json!(event.content);
        }
        EventKind::Zap => {
            payload["amount_sats"] = json!(zap_sats);
        }
        _ => {}
    }
    Some(payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use crate::store::Tier;

    fn fixture() -> (Store, Arc<TenantRegistry>, EventRouter, i64) {
        let store = Store::in_memory().unwrap();
        store.init().unwrap();
        let tenant = store
            .create_tenant("tenantpk", "http://cb", "sec", Tier::Free)
            .unwrap();
        let registry = Arc::new(TenantRegistry::new());
        registry.reload(&store).unwrap();
        let router = EventRouter::new(store.clone(), registry.clone());
        (store, registry, router, tenant.id)
    }

    fn text_note(id: &str, author: &str, p: &str) -> Event {
        Event {
            id: id.into(),
            pubkey: author.into(),
            kind: KIND_TEXT_NOTE,
            created_at: now_unix(),
            tags: vec![Tag(vec!["p".into(), p.into()])],
            content: "hi".into(),
            sig: String::new(),
        }
    }

    #[test]
    fn mention_persists_once_with_one_webhook() {
        let (store, _reg, mut router, tenant_id) = fixture();
        let ev = text_note("e1", "author", "tenantpk");
        router.route(&ev).unwrap();
        router.route(&ev).unwrap();
        let events = store.unacknowledged_events(tenant_id, None, None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "mention");
        assert_eq!(store.pending_webhooks(10).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_bypassing_lru_still_single_row() {
        let (store, registry, mut router, tenant_id) = fixture();
        let ev = text_note("e1", "author", "tenantpk");
        router.route(&ev).unwrap();
        // a second router (fresh LRU) sees the same event; the store stays authoritative
        let mut other = EventRouter::new(store.clone(), registry);
        other.route(&ev).unwrap();
        assert_eq!(
            store.unacknowledged_events(tenant_id, None, None).unwrap().len(),
            1
        );
        assert_eq!(store.pending_webhooks(10).unwrap().len(), 1);
    }

    #[test]
    fn reply_targets_stored_post() {
        let (store, _reg, mut router, tenant_id) = fixture();
        store
            .upsert_post_content(tenant_id, "note1", "post", None, now_unix())
            .unwrap();
        let mut ev = text_note("e1", "author", "tenantpk");
        ev.tags.push(Tag(vec!["e".into(), "note1".into()]));
        router.route(&ev).unwrap();
        let events = store.unacknowledged_events(tenant_id, None, None).unwrap();
        assert_eq!(events[0].kind, "reply");
        assert_eq!(store.post("note1").unwrap().unwrap().replies, 1);
    }

    #[test]
    fn mention_of_two_tenants_creates_two_rows() {
        let (store, registry, mut router, t1) = fixture();
        let t2 = store
            .create_tenant("otherpk", "http://cb2", "sec", Tier::Free)
            .unwrap()
            .id;
        registry.reload(&store).unwrap();
        let mut ev = text_note("e1", "author", "tenantpk");
        ev.tags.push(Tag(vec!["p".into(), "otherpk".into()]));
        router.route(&ev).unwrap();
        assert_eq!(store.unacknowledged_events(t1, None, None).unwrap().len(), 1);
        assert_eq!(store.unacknowledged_events(t2, None, None).unwrap().len(), 1);
        assert_eq!(store.pending_webhooks(10).unwrap().len(), 2);
    }

    #[test]
    fn own_note_updates_post_not_engagement() {
        let (store, _reg, mut router, tenant_id) = fixture();
        // the tenant posts a note mentioning itself
        let ev = text_note("e1", "tenantpk", "tenantpk");
        router.route(&ev).unwrap();
        assert!(store.post("e1").unwrap().is_some());
        assert!(store.unacknowledged_events(tenant_id, None, None).unwrap().is_empty());
    }

    #[test]
    fn follow_once_then_ignored() {
        let (store, _reg, mut router, tenant_id) = fixture();
        let follow = Event {
            id: "f1".into(),
            pubkey: "fan".into(),
            kind: KIND_CONTACT_LIST,
            created_at: now_unix(),
            tags: vec![Tag(vec!["p".into(), "tenantpk".into()])],
            content: String::new(),
            sig: String::new(),
        };
        router.route(&follow).unwrap();
        assert!(store.is_follower(tenant_id, "fan").unwrap());
        assert_eq!(store.pending_webhooks(10).unwrap().len(), 1);
        // an updated contact list from the same author changes nothing
        let mut again = follow.clone();
        again.id = "f2".into();
        router.route(&again).unwrap();
        assert_eq!(store.followers_count(tenant_id).unwrap(), 1);
        assert_eq!(store.pending_webhooks(10).unwrap().len(), 1);
        assert_eq!(store.unacknowledged_events(tenant_id, None, None).unwrap().len(), 1);
    }

    #[test]
    fn tenant_contact_list_is_ignored() {
        let (store, registry, mut router, _t1) = fixture();
        store
            .create_tenant("otherpk", "http://cb2", "sec", Tier::Free)
            .unwrap();
        registry.reload(&store).unwrap();
        let ev = Event {
            id: "c1".into(),
            pubkey: "tenantpk".into(),
            kind: KIND_CONTACT_LIST,
            created_at: now_unix(),
            tags: vec![Tag(vec!["p".into(), "otherpk".into()])],
            content: String::new(),
            sig: String::new(),
        };
        router.route(&ev).unwrap();
        assert!(store.pending_webhooks(10).unwrap().is_empty());
    }

    #[test]
    fn reaction_stubs_unknown_post() {
        let (store, _reg, mut router, tenant_id) = fixture();
        let ev = Event {
            id: "r1".into(),
            pubkey: "fan".into(),
            kind: KIND_REACTION,
            created_at: now_unix(),
            tags: vec![
                Tag(vec!["e".into(), "unknown-note".into()]),
                Tag(vec!["p".into(), "tenantpk".into()]),
            ],
            content: "+".into(),
            sig: String::new(),
        };
        router.route(&ev).unwrap();
        let post = store.post("unknown-note").unwrap().unwrap();
        assert_eq!(post.reactions, 1);
        assert_eq!(post.posted_at, 0);
        // reactions do not push webhooks
        assert!(store.pending_webhooks(10).unwrap().is_empty());
        let events = store.unacknowledged_events(tenant_id, None, None).unwrap();
        assert_eq!(events[0].kind, "reaction");
    }

    #[test]
    fn zap_with_invoice_and_without() {
        let (store, _reg, mut router, tenant_id) = fixture();
        let mut ev = Event {
            id: "z1".into(),
            pubkey: "zapper".into(),
            kind: KIND_ZAP_RECEIPT,
            created_at: now_unix(),
            tags: vec![
                Tag(vec!["p".into(), "tenantpk".into()]),
                Tag(vec!["e".into(), "note1".into()]),
                Tag(vec!["bolt11".into(), "lnbc2500u1pvjluez".into()]),
            ],
            content: String::new(),
            sig: String::new(),
        };
        router.route(&ev).unwrap();
        let post = store.post("note1").unwrap().unwrap();
        assert_eq!(post.zap_total, 250_000);
        let events = store.unacknowledged_events(tenant_id, None, None).unwrap();
        assert_eq!(events[0].metadata["sats"], 250_000);

        ev.id = "z2".into();
        ev.tags[2] = Tag(vec!["bolt11".into(), "garbage".into()]);
        router.route(&ev).unwrap();
        let events = store.unacknowledged_events(tenant_id, None, None).unwrap();
        let bad = events.iter().find(|e| e.event_id == "z2").unwrap();
        assert_eq!(bad.metadata["sats"], 0);
        assert_eq!(bad.metadata["unparsable_amount"], true);
    }

    #[test]
    fn historical_event_gets_no_webhook() {
        let (store, _reg, mut router, tenant_id) = fixture();
        let mut ev = text_note("old1", "author", "tenantpk");
        ev.created_at = now_unix() - HISTORICAL_CUTOFF_SECS - 60;
        router.route(&ev).unwrap();
        assert_eq!(store.unacknowledged_events(tenant_id, None, None).unwrap().len(), 1);
        assert!(store.pending_webhooks(10).unwrap().is_empty());
    }

    #[test]
    fn unknown_kind_is_ignored() {
        let (store, _reg, mut router, tenant_id) = fixture();
        let mut ev = text_note("m1", "author", "tenantpk");
        ev.kind = 30_023;
        router.route(&ev).unwrap();
        assert!(store.unacknowledged_events(tenant_id, None, None).unwrap().is_empty());
    }

    #[test]
    fn webhook_payload_shapes() {
        let ev = text_note("e1", "author", "tenantpk");
        let payload: serde_json::Value =
            serde_json::from_str(&webhook_payload(&ev, EventKind::Mention, 0).unwrap()).unwrap();
        assert_eq!(payload["event_type"], "mention");
        assert_eq!(payload["event_id"], "e1");
        assert!(payload["timestamp"].is_u64());
        assert_eq!(payload["content"], "hi");

        let zap: serde_json::Value =
            serde_json::from_str(&webhook_payload(&ev, EventKind::Zap, 42).unwrap()).unwrap();
        assert_eq!(zap["event_type"], "zap");
        assert_eq!(zap["amount_sats"], 42);

        assert!(webhook_payload(&ev, EventKind::Reaction, 0).is_none());
    }
}
