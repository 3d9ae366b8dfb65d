//! Relay fan-out pool: resilient subscriptions and deduplicated forwarding.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::event::{
    close_frame, now_unix, req_frame, Event, Filter, RelayFrame, KIND_CONTACT_LIST,
    KIND_TEXT_NOTE, KIND_ZAP_RECEIPT,
};
use crate::registry::TenantRegistry;

const SUB_NOTES: &str = "notes";
const SUB_CONTACTS: &str = "contacts";
const SUB_ZAPS: &str = "zaps";

/// Tuning knobs for the relay pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub relays: Vec<String>,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub idle_heartbeat: Duration,
    pub dedup_capacity: usize,
    pub buffer_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relays: vec![],
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            idle_heartbeat: Duration::from_secs(600),
            dedup_capacity: 1 << 17,
            buffer_capacity: 4_096,
        }
    }
}

/// Connection and drop counters surfaced through the health endpoint.
#[derive(Default)]
pub struct PoolHealth {
    relay_total: AtomicUsize,
    connected: AtomicUsize,
    dropped_frames: AtomicU64,
}

impl PoolHealth {
    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn relay_total(&self) -> usize {
        self.relay_total.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// True when every configured relay is down.
    pub fn degraded(&self) -> bool {
        self.relay_total() > 0 && self.connected() == 0
    }
}

/// Bounded LRU set of forwarded event ids.
struct SeenIds {
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Returns true when the id was not seen before.
    fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        if self.set.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.set.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

/// Bounded hand-off buffer between relay readers and the event router.
///
/// When full, the lowest-priority oldest frame is dropped so relay
/// connections are never blocked: zap receipts first, then text notes,
/// then contact lists.
pub struct FrameBuffer {
    queue: Mutex<VecDeque<(String, Event)>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn push(&self, relay: String, event: Event) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                let victim = queue
                    .iter()
                    .position(|(_, e)| e.kind == KIND_ZAP_RECEIPT)
                    .or_else(|| queue.iter().position(|(_, e)| e.kind == KIND_TEXT_NOTE))
                    .unwrap_or(0);
                queue.remove(victim);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back((relay, event));
        }
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> (String, Event) {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.queue.lock().unwrap().pop_front() {
                return item;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<(String, Event)> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The three shared subscriptions, filtered by the current tenant set.
fn subscription_filters(pubkeys: Vec<String>) -> Vec<(&'static str, Filter)> {
    let now = now_unix();
    vec![
        (
            SUB_NOTES,
            Filter {
                kinds: Some(vec![KIND_TEXT_NOTE]),
                p_tags: Some(pubkeys.clone()),
                since: Some(now.saturating_sub(3_600)),
                ..Default::default()
            },
        ),
        (
            SUB_CONTACTS,
            Filter {
                kinds: Some(vec![KIND_CONTACT_LIST]),
                p_tags: Some(pubkeys.clone()),
                since: Some(now.saturating_sub(86_400)),
                ..Default::default()
            },
        ),
        (
            SUB_ZAPS,
            Filter {
                kinds: Some(vec![KIND_ZAP_RECEIPT]),
                p_tags: Some(pubkeys),
                since: Some(now.saturating_sub(3_600)),
                ..Default::default()
            },
        ),
    ]
}

/// Run the pool: one resilient connection task per configured relay.
pub async fn run(
    cfg: PoolConfig,
    registry: Arc<TenantRegistry>,
    buffer: Arc<FrameBuffer>,
    health: Arc<PoolHealth>,
    shutdown: watch::Receiver<bool>,
) {
    health
        .relay_total
        .store(cfg.relays.len(), Ordering::Relaxed);
    let seen = Arc::new(Mutex::new(SeenIds::new(cfg.dedup_capacity)));
    let mut handles = vec![];
    for relay in cfg.relays.clone() {
        handles.push(tokio::spawn(relay_task(
            relay,
            cfg.clone(),
            registry.clone(),
            seen.clone(),
            buffer.clone(),
            health.clone(),
            shutdown.clone(),
        )));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

/// Why a connection ended.
enum ConnEnd {
    Lost,
    Shutdown,
}

/// Keep one relay connected, reconnecting with jittered backoff.
async fn relay_task(
    relay: String,
    cfg: PoolConfig,
    registry: Arc<TenantRegistry>,
    seen: Arc<Mutex<SeenIds>>,
    buffer: Arc<FrameBuffer>,
    health: Arc<PoolHealth>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = cfg.reconnect_initial;
    loop {
        if *shutdown.borrow() {
            return;
        }
        match connect_async(relay.as_str()).await {
            Ok((ws, _)) => {
                info!("connected to relay {relay}");
                health.connected.fetch_add(1, Ordering::Relaxed);
                backoff = cfg.reconnect_initial;
                let end = serve_connection(
                    ws,
                    &registry,
                    &seen,
                    &buffer,
                    &mut shutdown,
                    cfg.idle_heartbeat,
                    &relay,
                )
                .await;
                health.connected.fetch_sub(1, Ordering::Relaxed);
                if matches!(end, Ok(ConnEnd::Shutdown)) {
                    return;
                }
                if let Err(e) = end {
                    warn!("relay {relay} connection error: {e:#}");
                }
            }
            Err(e) => warn!("relay {relay} connect failed: {e}"),
        }
        // jittered exponential backoff, +/- 20 percent
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        let delay = backoff.mul_f64(jitter);
        backoff = (backoff * 2).min(cfg.reconnect_max);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Subscribe and pump frames until the connection drops or shutdown.
async fn serve_connection(
    mut ws: WsStream,
    registry: &TenantRegistry,
    seen: &Mutex<SeenIds>,
    buffer: &FrameBuffer,
    shutdown: &mut watch::Receiver<bool>,
    idle_heartbeat: Duration,
    relay: &str,
) -> Result<ConnEnd> {
    let mut generation = registry.subscribe();
    send_subscriptions(&mut ws, registry.all_pubkeys()).await?;
    loop {
        tokio::select! {
            msg = timeout(idle_heartbeat, ws.next()) => match msg {
                // idle too long: nullipotent REQ refresh keeps the link warm
                Err(_) => send_subscriptions(&mut ws, registry.all_pubkeys()).await?,
                Ok(None) => return Ok(ConnEnd::Lost),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(Message::Text(txt)))) => {
                    handle_frame(&txt, seen, buffer, relay);
                }
                Ok(Some(Ok(Message::Close(_)))) => return Ok(ConnEnd::Lost),
                Ok(Some(Ok(_))) => {}
            },
            _ = generation.changed() => {
                debug!("tenant set changed, reissuing subscriptions to {relay}");
                send_subscriptions(&mut ws, registry.all_pubkeys()).await?;
            }
            _ = shutdown.changed() => {
                for sub in [SUB_NOTES, SUB_CONTACTS, SUB_ZAPS] {
                    let _ = ws.send(Message::Text(close_frame(sub))).await;
                }
                let _ = ws.close(None).await;
                return Ok(ConnEnd::Shutdown);
            }
        }
    }
}

async fn send_subscriptions(ws: &mut WsStream, pubkeys: Vec<String>) -> Result<()> {
    if pubkeys.is_empty() {
        return Ok(());
    }
    for (sub_id, filter) in subscription_filters(pubkeys) {
        ws.send(Message::Text(req_frame(sub_id, &filter))).await?;
    }
    Ok(())
}

fn handle_frame(txt: &str, seen: &Mutex<SeenIds>, buffer: &FrameBuffer, relay: &str) {
    match RelayFrame::parse(txt) {
        Some(RelayFrame::Event(_, event)) => {
            let fresh = seen.lock().unwrap().insert(&event.id);
            if fresh {
                buffer.push(relay.to_string(), event);
            }
        }
        Some(RelayFrame::Eose(sub)) => debug!("eose from {relay} for {sub}"),
        Some(RelayFrame::Notice(msg)) => debug!("notice from {relay}: {msg}"),
        None => {}
    }
}
