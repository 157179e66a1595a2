//! Topic-scoped fan-out of trip changes and driver positions.
//!
//! The store announces every committed write on its change feed. Writers send
//! after they commit, so two writes to the same trip can reach the feed in
//! either order. The [`Sequencer`] restores commit order per trip from the
//! `revision` counter before anything is published. A revision that never
//! shows up (the writer died between commit and announcement, or another
//! process wrote the row) is bridged by re-reading the trip once the gap has
//! been open for [`GAP_PATIENCE`] or too many later revisions pile up.
//!
//! Each connection owns an [`Outbox`]:
//! - trip-status events queue FIFO up to a bound; overflowing closes the
//!   connection so the client re-syncs instead of silently missing a change;
//! - positions are coalesced per trip, newest `at` wins.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    models::{
        event::{BusEvent, Position, Topic, TripChange, WithdrawReason},
        trip::{Trip, TripStatus},
    },
    services::{
        location::LocationRelay,
        store::{ChangeFeed, TripStore},
    },
};

pub type ConnectionId = u64;

/// How long a revision gap may stay open before the trip is re-read.
pub const GAP_PATIENCE: Duration = Duration::from_millis(250);

/// Held revisions per trip before the gap is bridged regardless of age.
const MAX_HELD: usize = 32;

#[derive(Default)]
struct OutboxState {
    events: VecDeque<BusEvent>,
    positions: HashMap<String, Position>,
    closed: bool,
}

struct Outbox {
    state: Mutex<OutboxState>,
    notify: Notify,
    capacity: usize,
}

enum Push {
    Queued,
    Overflow,
    Closed,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(OutboxState::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutboxState> {
        // A panic while holding the lock cannot leave the queues half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, event: BusEvent) -> Push {
        let mut state = self.lock();
        if state.closed {
            return Push::Closed;
        }
        if let BusEvent::DriverPosition { trip_id, lat, lng, at } = event {
            let newer = state.positions.get(&trip_id).map_or(true, |held| at > held.at);
            if newer {
                state.positions.insert(trip_id, Position { lat, lng, at });
            }
        } else {
            if state.events.len() >= self.capacity {
                return Push::Overflow;
            }
            state.events.push_back(event);
        }
        drop(state);
        self.notify.notify_one();
        Push::Queued
    }

    fn take(&self) -> Option<BusEvent> {
        let mut state = self.lock();
        if let Some(event) = state.events.pop_front() {
            return Some(event);
        }
        let trip_id = state.positions.keys().next().cloned()?;
        let position = state.positions.remove(&trip_id)?;
        Some(BusEvent::position(trip_id, position))
    }

    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.events.clear();
        state.positions.clear();
        drop(state);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

struct BusInner {
    next_id: AtomicU64,
    connections: DashMap<ConnectionId, Arc<Outbox>>,
    subscriptions: DashMap<ConnectionId, HashSet<Topic>>,
    topics: DashMap<Topic, HashSet<ConnectionId>>,
    status_capacity: usize,
}

/// In-memory subscription registry and publisher.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(status_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                connections: DashMap::new(),
                subscriptions: DashMap::new(),
                topics: DashMap::new(),
                status_capacity: status_capacity.max(1),
            }),
        }
    }

    pub fn connect(&self) -> Connection {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let outbox = Arc::new(Outbox::new(self.inner.status_capacity));
        self.inner.connections.insert(id, outbox.clone());
        self.inner.subscriptions.insert(id, HashSet::new());
        debug!(connection = id, "connection registered");
        Connection {
            id,
            outbox,
            bus: self.clone(),
        }
    }

    /// Returns `false` if the connection is gone; subscribing twice is fine.
    pub fn subscribe(&self, topic: &Topic, connection: ConnectionId) -> bool {
        // Both halves are written under the connection's entry.
        // Lock order: subscriptions, then topics.
        let Some(mut topics) = self.inner.subscriptions.get_mut(&connection) else {
            return false;
        };
        topics.insert(topic.clone());
        self.inner
            .topics
            .entry(topic.clone())
            .or_default()
            .insert(connection);
        drop(topics);
        debug!(connection, %topic, "subscribed");
        true
    }

    pub fn unsubscribe(&self, topic: &Topic, connection: ConnectionId) {
        let mut subscribed = self.inner.subscriptions.get_mut(&connection);
        if let Some(topics) = subscribed.as_mut() {
            topics.remove(topic);
        }
        self.remove_member(topic, connection);
    }

    fn remove_member(&self, topic: &Topic, connection: ConnectionId) {
        self.inner.topics.remove_if_mut(topic, |_, members| {
            members.remove(&connection);
            members.is_empty()
        });
    }

    pub fn disconnect(&self, connection: ConnectionId) {
        if let Some((_, outbox)) = self.inner.connections.remove(&connection) {
            outbox.close();
        }
        let Some((_, topics)) = self.inner.subscriptions.remove(&connection) else {
            return;
        };
        for topic in topics {
            self.remove_member(&topic, connection);
        }
        debug!(connection, "connection removed");
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner.topics.get(topic).map_or(0, |members| members.len())
    }

    /// Delivers `event` to every current subscriber of `topic` without waiting
    /// on any of them. Returns how many outboxes accepted it.
    pub fn publish(&self, topic: &Topic, event: BusEvent) -> usize {
        let members: Vec<ConnectionId> = match self.inner.topics.get(topic) {
            Some(members) => members.iter().copied().collect(),
            None => return 0,
        };
        let mut delivered = 0;
        for connection in members {
            let Some(outbox) = self.inner.connections.get(&connection).map(|o| Arc::clone(o.value())) else {
                continue;
            };
            match outbox.push(event.clone()) {
                Push::Queued => delivered += 1,
                Push::Overflow => {
                    warn!(connection, %topic, "subscriber fell behind, closing connection");
                    self.disconnect(connection);
                }
                Push::Closed => self.disconnect(connection),
            }
        }
        delivered
    }

    fn publish_change(&self, change: &TripChange) {
        let trip = &change.trip;
        self.publish(&Topic::trip(&trip.id), BusEvent::trip_changed(trip));

        let marketplace = Topic::marketplace(&trip.vehicle_category);
        match change.previous {
            None if trip.status == TripStatus::Pending => {
                self.publish(
                    &marketplace,
                    BusEvent::NewTripAvailable {
                        trip: trip.summary(),
                    },
                );
            }
            Some(TripStatus::Pending) if trip.status != TripStatus::Pending => {
                let reason = if trip.status == TripStatus::Cancelled {
                    WithdrawReason::Cancelled
                } else {
                    WithdrawReason::Claimed
                };
                self.publish(
                    &marketplace,
                    BusEvent::TripWithdrawn {
                        trip_id: trip.id.clone(),
                        category: trip.vehicle_category.clone(),
                        reason,
                    },
                );
            }
            _ => {}
        }
    }

    /// Drains the store's change feed for the lifetime of the process.
    ///
    /// `store` is only read, to bridge revisions that were never announced.
    pub fn spawn(self, mut feed: ChangeFeed, store: TripStore, relay: LocationRelay) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sequencer = Sequencer::default();
            loop {
                let deadline = sequencer.next_deadline(GAP_PATIENCE);
                tokio::select! {
                    change = feed.recv() => match change {
                        Some(change) => {
                            let ready = sequencer.accept(change, Instant::now());
                            self.deliver(&ready, &relay);
                        }
                        None => break,
                    },
                    _ = wait_for(deadline) => {}
                }

                for trip_id in sequencer.overdue(Instant::now(), GAP_PATIENCE) {
                    match store.get(&trip_id).await {
                        Ok(current) => {
                            let ready = sequencer.bridge(&trip_id, current, Instant::now());
                            self.deliver(&ready, &relay);
                        }
                        Err(err) => {
                            warn!(%trip_id, error = %err, "could not re-read trip to bridge a revision gap");
                            sequencer.postpone(&trip_id, Instant::now());
                        }
                    }
                }
            }
            info!("change feed closed, fan-out stopped");
        })
    }

    fn deliver(&self, ready: &[TripChange], relay: &LocationRelay) {
        for change in ready {
            self.publish_change(change);
            if change.trip.status.is_terminal() {
                relay.forget(&change.trip.id);
            }
        }
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Receiving side of a bus registration. Dropping it disconnects.
pub struct Connection {
    id: ConnectionId,
    outbox: Arc<Outbox>,
    bus: EventBus,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn subscribe(&self, topic: &Topic) -> bool {
        self.bus.subscribe(topic, self.id)
    }

    pub fn unsubscribe(&self, topic: &Topic) {
        self.bus.unsubscribe(topic, self.id)
    }

    pub fn try_recv(&self) -> Option<BusEvent> {
        self.outbox.take()
    }

    /// Next event, or `None` once the bus has closed this connection.
    pub async fn recv(&self) -> Option<BusEvent> {
        loop {
            if let Some(event) = self.outbox.take() {
                return Some(event);
            }
            if self.outbox.is_closed() {
                return None;
            }
            self.outbox.notify.notified().await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.bus.disconnect(self.id);
    }
}

struct Cursor {
    next: i64,
    /// Status of the last change handed out, for withdrawal detection.
    delivered: Option<TripStatus>,
    held: BTreeMap<i64, TripChange>,
    /// When the current gap opened.
    stalled_since: Option<Instant>,
}

impl Cursor {
    fn drain(&mut self, ready: &mut Vec<TripChange>) {
        while let Some(next) = self.held.remove(&self.next) {
            self.next += 1;
            self.delivered = Some(next.trip.status);
            ready.push(next);
        }
    }

    fn finished(&self) -> bool {
        self.held.is_empty() && self.delivered.is_some_and(|status| status.is_terminal())
    }
}

/// Restores per-trip commit order from revisions.
#[derive(Default)]
struct Sequencer {
    cursors: HashMap<String, Cursor>,
}

impl Sequencer {
    fn accept(&mut self, change: TripChange, now: Instant) -> Vec<TripChange> {
        let trip_id = change.trip.id.clone();
        let revision = change.revision();
        let cursor = self.cursors.entry(trip_id.clone()).or_insert_with(|| Cursor {
            next: revision,
            delivered: change.previous,
            held: BTreeMap::new(),
            stalled_since: None,
        });
        if revision < cursor.next {
            debug!(%trip_id, revision, next = cursor.next, "stale change dropped");
            return Vec::new();
        }
        cursor.held.insert(revision, change);

        let mut ready = Vec::new();
        cursor.drain(&mut ready);
        self.settle(&trip_id, now);
        ready
    }

    /// Trips whose gap has outlived `patience` or holds too many revisions.
    fn overdue(&self, now: Instant, patience: Duration) -> Vec<String> {
        self.cursors
            .iter()
            .filter(|(_, cursor)| {
                cursor.held.len() >= MAX_HELD
                    || cursor
                        .stalled_since
                        .is_some_and(|since| since + patience <= now)
            })
            .map(|(trip_id, _)| trip_id.clone())
            .collect()
    }

    fn next_deadline(&self, patience: Duration) -> Option<Instant> {
        self.cursors
            .values()
            .filter_map(|cursor| cursor.stalled_since)
            .min()
            .map(|since| since + patience)
    }

    /// Jumps the cursor to the trip as currently stored.
    ///
    /// The re-read row stands in for every revision up to its own; held
    /// revisions beyond it are released in order afterwards.
    fn bridge(&mut self, trip_id: &str, current: Option<Trip>, now: Instant) -> Vec<TripChange> {
        let Some(current) = current else {
            self.cursors.remove(trip_id);
            return Vec::new();
        };
        let Some(cursor) = self.cursors.get_mut(trip_id) else {
            return Vec::new();
        };

        let mut ready = Vec::new();
        let revision = current.revision;
        if revision >= cursor.next {
            debug!(%trip_id, from = cursor.next, to = revision, "bridging revision gap from the store");
            cursor.held = cursor.held.split_off(&(revision + 1));
            cursor.next = revision + 1;
            let previous = cursor.delivered;
            cursor.delivered = Some(current.status);
            ready.push(TripChange {
                trip: current,
                previous,
            });
        }
        cursor.drain(&mut ready);
        // Whatever gap remains starts its own wait.
        cursor.stalled_since = None;
        self.settle(trip_id, now);
        ready
    }

    fn postpone(&mut self, trip_id: &str, now: Instant) {
        if let Some(cursor) = self.cursors.get_mut(trip_id) {
            cursor.stalled_since = Some(now);
        }
    }

    fn settle(&mut self, trip_id: &str, now: Instant) {
        let Some(cursor) = self.cursors.get_mut(trip_id) else {
            return;
        };
        if cursor.finished() {
            self.cursors.remove(trip_id);
        } else if cursor.held.is_empty() {
            cursor.stalled_since = None;
        } else if cursor.stalled_since.is_none() {
            cursor.stalled_since = Some(now);
        }
    }
}
