use tracing::{debug, info, warn};

use crate::{
    error::TripError,
    models::trip::{NewTrip, Trip, TripStatus},
    services::{settlement::SettlementHook, store::TripStore},
};

/// Applies checkpoint transitions after the trip has been claimed.
#[derive(Clone)]
pub struct LifecycleController {
    store: TripStore,
    settlement: SettlementHook,
}

impl LifecycleController {
    pub fn new(store: TripStore, settlement: SettlementHook) -> Self {
        Self { store, settlement }
    }

    pub async fn create(&self, requester_id: &str, new: NewTrip) -> Result<Trip, TripError> {
        let trip = Trip::from_new(requester_id, new.validate()?);
        self.store.insert(&trip).await?;
        info!(trip_id = %trip.id, category = %trip.vehicle_category, "trip requested");
        Ok(trip)
    }

    pub async fn fetch(&self, trip_id: &str) -> Result<Trip, TripError> {
        self.store.get(trip_id).await?.ok_or(TripError::TripNotFound)
    }

    pub async fn transition(
        &self,
        trip_id: &str,
        actor_id: &str,
        to: TripStatus,
    ) -> Result<Trip, TripError> {
        self.apply(trip_id, actor_id, None, to).await
    }

    /// Like [`Self::transition`], but only applies while the trip is still in
    /// the status the caller last observed.
    pub async fn transition_from(
        &self,
        trip_id: &str,
        actor_id: &str,
        expected: TripStatus,
        to: TripStatus,
    ) -> Result<Trip, TripError> {
        self.apply(trip_id, actor_id, Some(expected), to).await
    }

    async fn apply(
        &self,
        trip_id: &str,
        actor_id: &str,
        expected: Option<TripStatus>,
        to: TripStatus,
    ) -> Result<Trip, TripError> {
        let trip = self.fetch(trip_id).await?;
        let from = trip.status;

        let permitted = match to {
            TripStatus::Cancelled => trip.is_party(actor_id),
            _ => trip.is_driver(actor_id),
        };
        if !permitted {
            return Err(TripError::NotAParty);
        }

        // Binding a driver only happens through a claim.
        if matches!(to, TripStatus::Pending | TripStatus::Accepted) {
            return Err(TripError::IllegalTransition { from, to });
        }
        if from.has_reached(to) {
            return Err(TripError::AlreadyApplied);
        }
        if expected.is_some_and(|expected| expected != from) || !from.can_transition_to(to) {
            return Err(TripError::IllegalTransition { from, to });
        }

        if from == TripStatus::Accepted && to != TripStatus::Cancelled {
            self.ensure_first_in_line(&trip, actor_id).await?;
        }

        let Some(updated) = self.store.advance(trip_id, from, to, actor_id).await? else {
            let current = self.fetch(trip_id).await?;
            debug!(trip_id, %from, %to, current = %current.status, "transition lost its precondition");
            return if current.status.has_reached(to) {
                Err(TripError::AlreadyApplied)
            } else {
                Err(TripError::IllegalTransition {
                    from: current.status,
                    to,
                })
            };
        };
        info!(trip_id, %from, %to, actor_id, "trip transitioned");

        // Only the write that flipped the status reaches this point.
        if updated.status == TripStatus::Completed {
            if let Err(err) = self.settlement.on_completed(&updated).await {
                warn!(trip_id, error = %err, "settlement bookkeeping failed, retry sweep will pick it up");
            }
        }
        Ok(updated)
    }

    /// A driver who ended up holding two trips may only progress the one
    /// accepted first.
    async fn ensure_first_in_line(&self, trip: &Trip, driver_id: &str) -> Result<(), TripError> {
        let active = self.store.active_for_driver(driver_id).await?;
        let earlier = active.iter().any(|other| {
            other.id != trip.id
                && (other.accepted_at, other.id.as_str()) < (trip.accepted_at, trip.id.as_str())
        });
        if earlier {
            warn!(trip_id = %trip.id, driver_id, "driver holds an earlier active trip");
            return Err(TripError::DriverBusy);
        }
        Ok(())
    }

    pub async fn rate(
        &self,
        trip_id: &str,
        actor_id: &str,
        rating: i64,
        comment: Option<String>,
    ) -> Result<Trip, TripError> {
        if !(1..=5).contains(&rating) {
            return Err(TripError::InvalidInput("rating must be between 1 and 5".into()));
        }
        let trip = self.fetch(trip_id).await?;
        if trip.requester_id != actor_id {
            return Err(TripError::NotAParty);
        }
        if trip.rating.is_some() {
            return Err(TripError::AlreadyApplied);
        }
        if trip.status != TripStatus::Completed {
            return Err(TripError::InvalidInput("only completed trips can be rated".into()));
        }
        let comment = comment
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        match self
            .store
            .rate(trip_id, actor_id, rating, comment.as_deref())
            .await?
        {
            Some(rated) => Ok(rated),
            None => Err(TripError::AlreadyApplied),
        }
    }
}
