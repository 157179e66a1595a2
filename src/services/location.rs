use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use tracing::debug;

use crate::{
    models::event::{BusEvent, Position, Topic},
    services::bus::EventBus,
};

/// How long an ended trip keeps refusing positions.
const ENDED_RETENTION: Duration = Duration::from_secs(600);

/// Last-write-wins driver positions, relayed over `trip:{id}`.
///
/// Nothing here touches the trip store. Once a trip ends its position is
/// dropped and late reports are refused for [`ENDED_RETENTION`].
#[derive(Clone)]
pub struct LocationRelay {
    bus: EventBus,
    latest: Arc<DashMap<String, Position>>,
    ended: Arc<DashMap<String, Instant>>,
}

impl LocationRelay {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            latest: Arc::new(DashMap::new()),
            ended: Arc::new(DashMap::new()),
        }
    }

    /// Records and publishes `position` unless a newer one is already known
    /// or the trip has ended. Timestamps from the future are clamped to now.
    pub fn report(&self, trip_id: &str, mut position: Position) -> bool {
        if self.ended.contains_key(trip_id) {
            debug!(trip_id, "position for an ended trip dropped");
            return false;
        }
        position.at = position.at.min(Utc::now());
        match self.latest.entry(trip_id.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().at >= position.at {
                    return false;
                }
                held.insert(position);
            }
            Entry::Vacant(slot) => {
                slot.insert(position);
            }
        }
        // `forget` may have run since the check above.
        if self.ended.contains_key(trip_id) {
            self.latest.remove(trip_id);
            return false;
        }
        self.bus
            .publish(&Topic::trip(trip_id), BusEvent::position(trip_id, position));
        true
    }

    pub fn latest(&self, trip_id: &str) -> Option<Position> {
        self.latest.get(trip_id).map(|position| *position)
    }

    /// Drops the trip's position and refuses further reports for it.
    pub fn forget(&self, trip_id: &str) {
        let now = Instant::now();
        self.ended
            .retain(|_, ended_at| now.duration_since(*ended_at) < ENDED_RETENTION);
        self.ended.insert(trip_id.to_string(), now);
        self.latest.remove(trip_id);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    #[test]
    fn older_positions_are_dropped() {
        let bus = EventBus::new(8);
        let relay = LocationRelay::new(bus.clone());
        let rider = bus.connect();
        rider.subscribe(&Topic::trip("t1"));

        let now = Utc::now();
        let fresh = Position {
            lat: 52.5,
            lng: 13.4,
            at: now,
        };
        let stale = Position {
            lat: 52.0,
            lng: 13.0,
            at: now - Duration::seconds(3),
        };
        assert!(relay.report("t1", fresh));
        assert!(!relay.report("t1", stale));
        assert_eq!(relay.latest("t1"), Some(fresh));
        assert_eq!(rider.try_recv(), Some(BusEvent::position("t1", fresh)));
        assert_eq!(rider.try_recv(), None);

        relay.forget("t1");
        assert_eq!(relay.latest("t1"), None);
    }

    #[test]
    fn ended_trips_refuse_late_positions() {
        let relay = LocationRelay::new(EventBus::new(8));
        relay.forget("t1");
        let position = Position {
            lat: 52.5,
            lng: 13.4,
            at: Utc::now(),
        };
        assert!(!relay.report("t1", position));
        assert_eq!(relay.latest("t1"), None);
    }

    #[test]
    fn future_timestamps_cannot_pin_the_position() {
        let relay = LocationRelay::new(EventBus::new(8));
        let pinned = Position {
            lat: 52.5,
            lng: 13.4,
            at: Utc::now() + Duration::days(365),
        };
        assert!(relay.report("t1", pinned));
        let held = relay.latest("t1").expect("position held");
        assert!(held.at <= Utc::now());

        std::thread::sleep(std::time::Duration::from_millis(5));
        let next = Position {
            lat: 52.6,
            lng: 13.5,
            at: Utc::now(),
        };
        assert!(relay.report("t1", next));
        assert_eq!(relay.latest("t1"), Some(next));
    }
}
