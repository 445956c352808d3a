//! Broadcast hub: a single actor task that owns the viewer registry and the
//! sampling ticker.
//!
//! Everything that touches the registry (register, unregister, broadcast)
//! happens inside [`Hub::run`], one event at a time, so membership needs no
//! lock and a tick either includes a viewer or it doesn't. Collection runs in
//! a spawned task and comes back as an event; the loop itself never waits on a
//! provider or a socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::aggregator::{encode, Aggregator};

pub const MIN_RATE_MS: u64 = 250;
pub const MAX_RATE_MS: u64 = 10_000;

/// Outbound frames buffered per viewer before it counts as unresponsive.
pub const VIEWER_QUEUE: usize = 16;

const EVENT_QUEUE: usize = 64;

/// One serialized snapshot, shared by every recipient of a tick.
pub type Frame = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewerId(u64);

impl std::fmt::Display for ViewerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

enum Event {
    Register {
        id: ViewerId,
        queue: mpsc::Sender<Frame>,
    },
    Unregister(ViewerId),
    Inbound(String),
    ViewerCount(oneshot::Sender<usize>),
    Rate(oneshot::Sender<Duration>),
    Shutdown,
}

struct Collected {
    audience: Vec<ViewerId>,
    frame: Option<Frame>,
}

#[derive(Deserialize)]
struct ControlMessage {
    action: String,
    #[serde(default)]
    rate: Option<i64>,
}

/// Parse a viewer control message into a new sampling interval. Anything
/// other than an in-range `set_rate` yields `None`.
pub fn parse_set_rate(text: &str) -> Option<Duration> {
    let msg: ControlMessage = serde_json::from_str(text).ok()?;
    if msg.action != "set_rate" {
        return None;
    }
    let rate = u64::try_from(msg.rate?).ok()?;
    (MIN_RATE_MS..=MAX_RATE_MS)
        .contains(&rate)
        .then(|| Duration::from_millis(rate))
}

/// Cheap, cloneable access to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    events: mpsc::Sender<Event>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    /// Add a viewer whose frames go to `queue`. Dropping the matching receiver
    /// or being evicted both end the viewer.
    pub async fn register(&self, queue: mpsc::Sender<Frame>) -> anyhow::Result<ViewerId> {
        let id = ViewerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.events
            .send(Event::Register { id, queue })
            .await
            .map_err(|_| anyhow::anyhow!("hub is not running"))?;
        Ok(id)
    }

    pub async fn unregister(&self, id: ViewerId) {
        let _ = self.events.send(Event::Unregister(id)).await;
    }

    /// Hand a viewer's control message to the hub. Returns `false` when the
    /// hub inbox is full and the message was dropped.
    pub fn forward(&self, text: String) -> bool {
        self.events.try_send(Event::Inbound(text)).is_ok()
    }

    pub async fn viewer_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.events.send(Event::ViewerCount(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Current sampling interval, or `None` once the hub has stopped.
    pub async fn rate(&self) -> Option<Duration> {
        let (tx, rx) = oneshot::channel();
        self.events.send(Event::Rate(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Stop ticking and close every viewer. Idempotent.
    pub async fn stop(&self) {
        let _ = self.events.send(Event::Shutdown).await;
    }
}

pub struct Hub {
    aggregator: Arc<Aggregator>,
    viewers: HashMap<ViewerId, mpsc::Sender<Frame>>,
    rate: Duration,
    ticker: Interval,
    collecting: bool,
}

impl Hub {
    /// Start the hub loop on the current runtime.
    pub fn spawn(aggregator: Arc<Aggregator>, rate: Duration) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let hub = Hub {
            aggregator,
            viewers: HashMap::new(),
            rate,
            ticker: ticker(rate),
            collecting: false,
        };
        let handle = HubHandle {
            events: tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (handle, tokio::spawn(hub.run(rx)))
    }

    async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        let (done_tx, mut done_rx) = mpsc::channel::<Collected>(1);
        info!(rate_ms = self.rate.as_millis() as u64, "hub started");
        loop {
            tokio::select! {
                // Finished collections and ticks first: a busy inbox must
                // not hold up broadcasting.
                biased;
                Some(done) = done_rx.recv() => self.broadcast(done),
                _ = self.ticker.tick() => self.tick(&done_tx),
                ev = events.recv() => match ev {
                    Some(Event::Shutdown) | None => break,
                    Some(ev) => self.handle(ev),
                },
            }
        }
        // Dropping the senders closes every relay's queue.
        let closed = self.viewers.len();
        self.viewers.clear();
        info!(viewers = closed, "hub stopped");
    }

    fn handle(&mut self, ev: Event) {
        match ev {
            Event::Register { id, queue } => {
                self.viewers.insert(id, queue);
                debug!(%id, viewers = self.viewers.len(), "viewer registered");
            }
            Event::Unregister(id) => {
                if self.viewers.remove(&id).is_some() {
                    debug!(%id, viewers = self.viewers.len(), "viewer unregistered");
                }
            }
            Event::Inbound(text) => match parse_set_rate(&text) {
                Some(rate) if rate != self.rate => {
                    info!(rate_ms = rate.as_millis() as u64, "sampling rate changed");
                    self.rate = rate;
                    self.ticker = ticker(rate);
                }
                Some(_) => {}
                None => debug!(len = text.len(), "ignored control message"),
            },
            Event::ViewerCount(reply) => {
                let _ = reply.send(self.viewers.len());
            }
            Event::Rate(reply) => {
                let _ = reply.send(self.rate);
            }
            Event::Shutdown => {}
        }
    }

    fn tick(&mut self, done: &mpsc::Sender<Collected>) {
        if self.viewers.is_empty() {
            return;
        }
        if self.collecting {
            debug!("previous collection still running, skipping tick");
            return;
        }
        self.collecting = true;
        let audience: Vec<ViewerId> = self.viewers.keys().copied().collect();
        let count = audience.len();
        let aggregator = Arc::clone(&self.aggregator);
        let done = done.clone();
        tokio::spawn(async move {
            // Nested so a panicking collection still reports back.
            let job = tokio::spawn(async move { encode(&aggregator.collect(count).await) });
            let frame = match job.await {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "collection task failed");
                    None
                }
            };
            let _ = done.send(Collected { audience, frame }).await;
        });
    }

    fn broadcast(&mut self, done: Collected) {
        self.collecting = false;
        let Some(frame) = done.frame else {
            return;
        };
        let mut dropped = 0usize;
        for id in done.audience {
            let Some(queue) = self.viewers.get(&id) else {
                continue;
            };
            if let Err(e) = queue.try_send(Arc::clone(&frame)) {
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!(%id, "viewer queue full, disconnecting")
                    }
                    mpsc::error::TrySendError::Closed(_) => debug!(%id, "viewer queue closed"),
                }
                self.viewers.remove(&id);
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(dropped, viewers = self.viewers.len(), "broadcast evicted viewers");
        }
    }
}

fn ticker(rate: Duration) -> Interval {
    let mut t = interval_at(Instant::now() + rate, rate);
    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
    t
}
