use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::TripError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TripStatus {
    Pending,
    Accepted,
    ArrivedPickup,
    InTransit,
    ArrivedDropoff,
    Completed,
    Cancelled,
}

impl TripStatus {
    pub const ALL: [TripStatus; 7] = [
        TripStatus::Pending,
        TripStatus::Accepted,
        TripStatus::ArrivedPickup,
        TripStatus::InTransit,
        TripStatus::ArrivedDropoff,
        TripStatus::Completed,
        TripStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::Pending => "pending",
            TripStatus::Accepted => "accepted",
            TripStatus::ArrivedPickup => "arrived_pickup",
            TripStatus::InTransit => "in_transit",
            TripStatus::ArrivedDropoff => "arrived_dropoff",
            TripStatus::Completed => "completed",
            TripStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TripStatus::Completed | TripStatus::Cancelled)
    }

    /// A driver is bound and the job is underway.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TripStatus::Accepted
                | TripStatus::ArrivedPickup
                | TripStatus::InTransit
                | TripStatus::ArrivedDropoff
        )
    }

    /// Position along the forward checkpoint path. `Cancelled` is off the path.
    fn rank(&self) -> Option<u8> {
        match self {
            TripStatus::Pending => Some(0),
            TripStatus::Accepted => Some(1),
            TripStatus::ArrivedPickup => Some(2),
            TripStatus::InTransit => Some(3),
            TripStatus::ArrivedDropoff => Some(4),
            TripStatus::Completed => Some(5),
            TripStatus::Cancelled => None,
        }
    }

    /// The legal-transition table.
    pub fn can_transition_to(&self, to: TripStatus) -> bool {
        match (self, to) {
            (TripStatus::Pending, TripStatus::Accepted)
            | (TripStatus::Accepted, TripStatus::ArrivedPickup)
            | (TripStatus::ArrivedPickup, TripStatus::InTransit)
            | (TripStatus::InTransit, TripStatus::ArrivedDropoff)
            | (TripStatus::ArrivedDropoff, TripStatus::Completed) => true,
            (from, TripStatus::Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Whether a request to move to `to` is a replay of something this trip
    /// already went through.
    pub fn has_reached(&self, to: TripStatus) -> bool {
        if *self == to {
            return true;
        }
        match (self.rank(), to.rank()) {
            (Some(current), Some(target)) => target > 0 && current >= target,
            _ => false,
        }
    }

    /// Column stamped when a trip enters this status.
    pub fn checkpoint_column(&self) -> Option<&'static str> {
        match self {
            TripStatus::Pending => None,
            TripStatus::Accepted => Some("accepted_at"),
            TripStatus::ArrivedPickup => Some("arrived_pickup_at"),
            TripStatus::InTransit => Some("trip_start_at"),
            TripStatus::ArrivedDropoff => Some("arrived_dropoff_at"),
            TripStatus::Completed => Some("trip_end_at"),
            TripStatus::Cancelled => Some("cancelled_at"),
        }
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TripStatus {
    type Err = TripError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        TripStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| TripError::InvalidInput(format!("unknown trip status `{value}`")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Trip {
    pub id: String,
    pub requester_id: String,
    pub driver_id: Option<String>,
    pub origin_lat: f64,
    pub origin_lng: f64,
    pub origin_address: String,
    pub destination_lat: f64,
    pub destination_lng: f64,
    pub destination_address: String,
    pub vehicle_category: String,
    pub distance: String,
    pub duration: String,
    /// Minor currency units, fixed at creation.
    pub price: i64,
    pub description: Option<String>,
    pub passenger_travels: bool,
    pub status: TripStatus,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub arrived_pickup_at: Option<DateTime<Utc>>,
    pub trip_start_at: Option<DateTime<Utc>>,
    pub arrived_dropoff_at: Option<DateTime<Utc>>,
    pub trip_end_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<String>,
    pub rating: Option<i64>,
    pub rating_comment: Option<String>,
}

impl Trip {
    pub fn from_new(requester_id: impl Into<String>, new: NewTrip) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            requester_id: requester_id.into(),
            driver_id: None,
            origin_lat: new.origin.lat,
            origin_lng: new.origin.lng,
            origin_address: new.origin.address,
            destination_lat: new.destination.lat,
            destination_lng: new.destination.lng,
            destination_address: new.destination.address,
            vehicle_category: new.vehicle_category,
            distance: new.distance,
            duration: new.duration,
            price: new.price,
            description: new.description,
            passenger_travels: new.passenger_travels,
            status: TripStatus::Pending,
            revision: 1,
            created_at: now,
            updated_at: now,
            accepted_at: None,
            arrived_pickup_at: None,
            trip_start_at: None,
            arrived_dropoff_at: None,
            trip_end_at: None,
            cancelled_at: None,
            cancelled_by: None,
            rating: None,
            rating_comment: None,
        }
    }

    pub fn is_party(&self, user_id: &str) -> bool {
        self.requester_id == user_id || self.driver_id.as_deref() == Some(user_id)
    }

    pub fn is_driver(&self, user_id: &str) -> bool {
        self.driver_id.as_deref() == Some(user_id)
    }

    pub fn checkpoint(&self, status: TripStatus) -> Option<DateTime<Utc>> {
        match status {
            TripStatus::Pending => None,
            TripStatus::Accepted => self.accepted_at,
            TripStatus::ArrivedPickup => self.arrived_pickup_at,
            TripStatus::InTransit => self.trip_start_at,
            TripStatus::ArrivedDropoff => self.arrived_dropoff_at,
            TripStatus::Completed => self.trip_end_at,
            TripStatus::Cancelled => self.cancelled_at,
        }
    }

    pub fn summary(&self) -> TripSummary {
        TripSummary {
            id: self.id.clone(),
            vehicle_category: self.vehicle_category.clone(),
            origin_address: self.origin_address.clone(),
            destination_address: self.destination_address.clone(),
            distance: self.distance.clone(),
            duration: self.duration.clone(),
            price: self.price,
            passenger_travels: self.passenger_travels,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Place {
    pub lat: f64,
    pub lng: f64,
    pub address: String,
}

/// Request payload for a new trip. Routing data arrives precomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTrip {
    pub origin: Place,
    pub destination: Place,
    pub vehicle_category: String,
    pub distance: String,
    pub duration: String,
    pub price: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub passenger_travels: bool,
}

impl NewTrip {
    pub fn validate(mut self) -> Result<Self, TripError> {
        self.vehicle_category = self.vehicle_category.trim().to_lowercase();
        if self.vehicle_category.is_empty() {
            return Err(TripError::InvalidInput("vehicle category is required".into()));
        }
        for (label, place) in [("origin", &self.origin), ("destination", &self.destination)] {
            if place.address.trim().is_empty() {
                return Err(TripError::InvalidInput(format!("{label} address is required")));
            }
            if !(-90.0..=90.0).contains(&place.lat) || !(-180.0..=180.0).contains(&place.lng) {
                return Err(TripError::InvalidInput(format!(
                    "{label} coordinate out of range"
                )));
            }
        }
        if self.price < 0 {
            return Err(TripError::InvalidInput("price must not be negative".into()));
        }
        self.description = self.description.and_then(|value| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        });
        Ok(self)
    }
}

/// What idle drivers see in the marketplace feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TripSummary {
    pub id: String,
    pub vehicle_category: String,
    pub origin_address: String,
    pub destination_address: String,
    pub distance: String,
    pub duration: String,
    pub price: i64,
    pub passenger_travels: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn new_trip(category: &str) -> NewTrip {
        NewTrip {
            origin: Place {
                lat: 52.52,
                lng: 13.40,
                address: "Warehouse 7, Hafenstrasse".into(),
            },
            destination: Place {
                lat: 52.39,
                lng: 13.06,
                address: "Depot Nord".into(),
            },
            vehicle_category: category.into(),
            distance: "31 km".into(),
            duration: "42 min".into(),
            price: 8900,
            description: Some("two pallets".into()),
            passenger_travels: false,
        }
    }

    pub fn trip(category: &str) -> Trip {
        Trip::from_new("client-1", new_trip(category))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legal_edges() -> Vec<(TripStatus, TripStatus)> {
        use TripStatus::*;
        vec![
            (Pending, Accepted),
            (Pending, Cancelled),
            (Accepted, ArrivedPickup),
            (Accepted, Cancelled),
            (ArrivedPickup, InTransit),
            (ArrivedPickup, Cancelled),
            (InTransit, ArrivedDropoff),
            (InTransit, Cancelled),
            (ArrivedDropoff, Completed),
            (ArrivedDropoff, Cancelled),
        ]
    }

    #[test]
    fn transition_table_is_exactly_the_legal_edges() {
        let legal = legal_edges();
        for from in TripStatus::ALL {
            for to in TripStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for to in TripStatus::ALL {
            assert!(!TripStatus::Completed.can_transition_to(to));
            assert!(!TripStatus::Cancelled.can_transition_to(to));
        }
    }

    #[test]
    fn forward_edges_never_regress() {
        for (from, to) in legal_edges() {
            if to != TripStatus::Cancelled {
                assert!(to.rank() > from.rank(), "{from} -> {to} regresses");
            }
        }
    }

    #[test]
    fn passed_checkpoints_count_as_reached() {
        assert!(TripStatus::InTransit.has_reached(TripStatus::ArrivedPickup));
        assert!(TripStatus::Completed.has_reached(TripStatus::Completed));
        assert!(TripStatus::Cancelled.has_reached(TripStatus::Cancelled));
        assert!(!TripStatus::Cancelled.has_reached(TripStatus::ArrivedPickup));
        assert!(!TripStatus::Accepted.has_reached(TripStatus::InTransit));
        assert!(!TripStatus::Completed.has_reached(TripStatus::Cancelled));
        assert!(!TripStatus::Accepted.has_reached(TripStatus::Pending));
    }

    #[test]
    fn status_parses_from_wire_names() {
        for status in TripStatus::ALL {
            assert_eq!(status.as_str().parse::<TripStatus>().ok(), Some(status));
        }
        assert!("teleported".parse::<TripStatus>().is_err());
    }

    #[test]
    fn new_trip_validation_normalizes_category() {
        let mut new = fixtures::new_trip("  Van ");
        new.description = Some("   ".into());
        let validated = new.validate().expect("valid trip");
        assert_eq!(validated.vehicle_category, "van");
        assert_eq!(validated.description, None);
    }

    #[test]
    fn new_trip_validation_rejects_bad_coordinates_and_price() {
        let mut new = fixtures::new_trip("van");
        new.destination.lat = 123.0;
        assert!(matches!(new.validate(), Err(TripError::InvalidInput(_))));

        let mut new = fixtures::new_trip("van");
        new.price = -1;
        assert!(matches!(new.validate(), Err(TripError::InvalidInput(_))));
    }
}
