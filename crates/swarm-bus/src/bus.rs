//! The in-process pub/sub fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::event::{BusEvent, Frame};
use crate::room::Room;

/// Configuration for the bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Per-subscriber outbound buffer capacity.
    pub buffer: usize,
    /// How long a subscriber's buffer may stay full before it is dropped.
    pub stall_timeout: Duration,
    /// Interval between keepalive ticks.
    pub keepalive_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer: 256,
            stall_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// Opaque handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberToken(u64);

/// A live subscription: the token for unsubscribing plus the frame stream.
///
/// When the bus drops the subscriber (stalled buffer or shutdown) the
/// receiver closes, which is the disconnect signal for the transport.
pub struct Subscription {
    /// Token for `unsubscribe`.
    pub token: SubscriberToken,
    /// Incoming frames, in per-room publish order.
    pub receiver: mpsc::Receiver<Frame>,
}

struct SubscriberEntry {
    tx: mpsc::Sender<Frame>,
    rooms: HashSet<Room>,
    stalled_since: Option<Instant>,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<u64, SubscriberEntry>,
    rooms: HashMap<Room, HashSet<u64>>,
    seqs: HashMap<Room, u64>,
}

impl Registry {
    fn remove(&mut self, token: u64) -> bool {
        let Some(entry) = self.subscribers.remove(&token) else {
            return false;
        };
        for room in &entry.rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(&token);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }
        true
    }
}

/// Room-based pub/sub with per-subscriber backpressure.
///
/// Delivery is best-effort at-most-once per subscriber: a subscriber whose
/// buffer stays full past the stall timeout is dropped rather than blocking
/// the publisher. Ordering is preserved per `(room, subscriber)` pair, and
/// each room carries a monotonic sequence number so consumers can detect
/// gaps. Publish failures to one subscriber never propagate to other
/// subscribers or to the publisher.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

struct Inner {
    config: BusConfig,
    registry: RwLock<Registry>,
    next_token: AtomicU64,
}

impl EventBus {
    /// Create a bus with the given configuration.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: RwLock::new(Registry::default()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Create a bus with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(BusConfig::default())
    }

    /// The configured keepalive interval.
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        self.inner.config.keepalive_interval
    }

    /// Subscribe to a set of rooms.
    #[must_use]
    pub fn subscribe(&self, rooms: &[Room]) -> Subscription {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.config.buffer.max(1));

        let mut registry = self.inner.registry.write();
        let room_set: HashSet<Room> = rooms.iter().copied().collect();
        for room in &room_set {
            registry.rooms.entry(*room).or_default().insert(token);
        }
        registry.subscribers.insert(
            token,
            SubscriberEntry {
                tx,
                rooms: room_set,
                stalled_since: None,
            },
        );

        tracing::debug!(token, rooms = rooms.len(), "Subscriber joined");

        Subscription {
            token: SubscriberToken(token),
            receiver: rx,
        }
    }

    /// Remove a subscription. Idempotent; unknown tokens are ignored.
    pub fn unsubscribe(&self, token: SubscriberToken) {
        let removed = self.inner.registry.write().remove(token.0);
        if removed {
            tracing::debug!(token = token.0, "Subscriber left");
        }
    }

    /// Publish an event to the union of subscribers across the given rooms.
    ///
    /// Each room's sequence number advances once per publish. A subscriber
    /// present in several of the rooms receives exactly one frame, tagged
    /// with the first of its rooms in publish order.
    pub fn publish(&self, rooms: &[Room], event: &BusEvent) {
        let mut registry = self.inner.registry.write();

        // Bump every room's sequence first so gap detection survives dedup.
        let mut seqs = Vec::with_capacity(rooms.len());
        for room in rooms {
            let seq = registry.seqs.entry(*room).or_insert(0);
            *seq += 1;
            seqs.push(*seq);
        }

        // Union of subscribers, remembering the first room that matched each.
        let mut targets: HashMap<u64, (Room, u64)> = HashMap::new();
        for (room, seq) in rooms.iter().zip(&seqs) {
            if let Some(members) = registry.rooms.get(room) {
                for token in members {
                    targets.entry(*token).or_insert((*room, *seq));
                }
            }
        }

        let now = Instant::now();
        let stall_timeout = self.inner.config.stall_timeout;
        let mut dropped = Vec::new();

        for (token, (room, seq)) in targets {
            let Some(entry) = registry.subscribers.get_mut(&token) else {
                continue;
            };
            let frame = Frame::Event {
                room,
                seq,
                event: event.clone(),
            };
            match entry.tx.try_send(frame) {
                Ok(()) => entry.stalled_since = None,
                Err(mpsc::error::TrySendError::Full(_)) => match entry.stalled_since {
                    None => entry.stalled_since = Some(now),
                    Some(since) if now.duration_since(since) >= stall_timeout => {
                        dropped.push(token);
                    }
                    Some(_) => {}
                },
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(token),
            }
        }

        for token in dropped {
            registry.remove(token);
            tracing::warn!(token, "Dropped stalled bus subscriber");
        }
    }

    /// Current number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.read().subscribers.len()
    }

    /// Latest sequence number for a room, if any event was ever published.
    #[must_use]
    pub fn room_seq(&self, room: &Room) -> Option<u64> {
        self.inner.registry.read().seqs.get(room).copied()
    }

    /// Send a keepalive tick to every subscriber.
    ///
    /// Subscribers whose channel closed are removed; a full buffer here
    /// counts against the same stall deadline as event delivery.
    pub fn broadcast_ping(&self) {
        let mut registry = self.inner.registry.write();
        let now = Instant::now();
        let stall_timeout = self.inner.config.stall_timeout;
        let mut dropped = Vec::new();

        for (token, entry) in &mut registry.subscribers {
            match entry.tx.try_send(Frame::ping()) {
                Ok(()) => entry.stalled_since = None,
                Err(mpsc::error::TrySendError::Full(_)) => match entry.stalled_since {
                    None => entry.stalled_since = Some(now),
                    Some(since) if now.duration_since(since) >= stall_timeout => {
                        dropped.push(*token);
                    }
                    Some(_) => {}
                },
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*token),
            }
        }

        for token in dropped {
            registry.remove(token);
            tracing::warn!(token, "Dropped stalled bus subscriber on keepalive");
        }
    }

    /// Run the keepalive loop until the shutdown signal flips.
    pub async fn run_keepalive(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.inner.config.keepalive_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.broadcast_ping(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!("Bus keepalive stopping");
                        return;
                    }
                }
            }
        }
    }
}
