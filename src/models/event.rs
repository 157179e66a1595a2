use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::TripError,
    models::trip::{Trip, TripStatus, TripSummary},
};

/// A named channel on the fan-out bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Trip(String),
    Marketplace(String),
}

impl Topic {
    pub fn trip(id: impl Into<String>) -> Self {
        Topic::Trip(id.into())
    }

    pub fn marketplace(category: impl Into<String>) -> Self {
        Topic::Marketplace(category.into())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Trip(id) => write!(f, "trip:{id}"),
            Topic::Marketplace(category) => write!(f, "marketplace:{category}"),
        }
    }
}

impl FromStr for Topic {
    type Err = TripError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once(':') {
            Some(("trip", id)) if !id.is_empty() => Ok(Topic::trip(id)),
            Some(("marketplace", category)) if !category.is_empty() => {
                Ok(Topic::marketplace(category.to_lowercase()))
            }
            _ => Err(TripError::InvalidInput(format!("unknown topic `{value}`"))),
        }
    }
}

impl Serialize for Topic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Emitted by the trip store after every committed write.
#[derive(Debug, Clone)]
pub struct TripChange {
    pub trip: Trip,
    /// `None` when the write created the trip.
    pub previous: Option<TripStatus>,
}

impl TripChange {
    pub fn revision(&self) -> i64 {
        self.trip.revision
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawReason {
    Claimed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
    pub at: DateTime<Utc>,
}

/// Everything the bus can deliver to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    TripChanged {
        trip_id: String,
        status: TripStatus,
        driver_id: Option<String>,
        revision: i64,
    },
    NewTripAvailable {
        trip: TripSummary,
    },
    TripWithdrawn {
        trip_id: String,
        category: String,
        reason: WithdrawReason,
    },
    DriverPosition {
        trip_id: String,
        lat: f64,
        lng: f64,
        at: DateTime<Utc>,
    },
}

impl BusEvent {
    pub fn trip_changed(trip: &Trip) -> Self {
        BusEvent::TripChanged {
            trip_id: trip.id.clone(),
            status: trip.status,
            driver_id: trip.driver_id.clone(),
            revision: trip.revision,
        }
    }

    pub fn position(trip_id: impl Into<String>, position: Position) -> Self {
        BusEvent::DriverPosition {
            trip_id: trip_id.into(),
            lat: position.lat,
            lng: position.lng,
            at: position.at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_round_trip_through_their_names() {
        assert_eq!("trip:abc".parse::<Topic>().ok(), Some(Topic::trip("abc")));
        assert_eq!(
            "marketplace:Van".parse::<Topic>().ok(),
            Some(Topic::marketplace("van"))
        );
        assert_eq!(Topic::marketplace("truck").to_string(), "marketplace:truck");
        assert!("trip:".parse::<Topic>().is_err());
        assert!("chat:abc".parse::<Topic>().is_err());
    }

    #[test]
    fn events_are_tagged_on_the_wire() {
        let event = BusEvent::TripWithdrawn {
            trip_id: "t1".into(),
            category: "van".into(),
            reason: WithdrawReason::Claimed,
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "trip_withdrawn");
        assert_eq!(json["reason"], "claimed");
    }
}
